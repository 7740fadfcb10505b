use approx::assert_abs_diff_eq;
use candle_core::{DType, Device, Tensor, Var};
use candle_util::candle_nn::{Init, VarBuilder, VarMap};
use candle_util::candle_optim::{sorted_vars, GradientSync};
use dist_util::process_group::{read_frame, write_frame};
use dist_util::*;

use std::collections::HashMap;
use std::net::TcpListener;
use std::thread;
use std::time::Duration;

/// Run `job` on `world_size` threads, one TCP rank each, and collect
/// what every rank returns (ordered by rank)
fn run_ranks<T, F>(world_size: usize, job: F) -> anyhow::Result<Vec<T>>
where
    T: Send + 'static,
    F: Fn(&mut dyn ProcessGroup) -> anyhow::Result<T> + Send + Sync + Copy + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let addr = listener.local_addr()?;

    let handles: Vec<_> = (1..world_size)
        .map(|rank| {
            thread::spawn(move || -> anyhow::Result<T> {
                let mut group =
                    TcpGroup::connect_to(addr, rank, world_size, Duration::from_secs(10))?;
                let out = job(&mut group)?;
                group.destroy()?;
                Ok(out)
            })
        })
        .collect();

    let mut root = TcpGroup::from_listener(listener, world_size)?;
    let mut results = vec![job(&mut root)?];
    root.destroy()?;

    for h in handles {
        results.push(h.join().map_err(|_| anyhow::anyhow!("rank panicked"))??);
    }
    Ok(results)
}

#[test]
fn all_reduce_averages_over_ranks() -> anyhow::Result<()> {
    let results = run_ranks(3, |group| {
        let r = group.rank() as f32;
        let mut buf = vec![r, 10. * r, 1.];
        group.all_reduce_mean(&mut buf)?;
        group.barrier()?;
        Ok(buf)
    })?;

    for buf in results {
        assert_abs_diff_eq!(buf[0], 1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(buf[1], 10.0, epsilon = 1e-6);
        assert_abs_diff_eq!(buf[2], 1.0, epsilon = 1e-6);
    }
    Ok(())
}

#[test]
fn broadcast_copies_rank_zero() -> anyhow::Result<()> {
    let results = run_ranks(4, |group| {
        let mut buf = if group.is_root() {
            vec![3., 1., 4.]
        } else {
            vec![0.; 3]
        };
        group.broadcast(&mut buf)?;
        Ok((group.rank(), group.world_size(), buf))
    })?;

    for (r, (rank, world, buf)) in results.into_iter().enumerate() {
        assert_eq!(rank, r);
        assert_eq!(world, 4);
        assert_eq!(buf, vec![3., 1., 4.]);
    }
    Ok(())
}

#[test]
fn data_parallel_syncs_parameters_and_gradients() -> anyhow::Result<()> {
    let results = run_ranks(2, |group| {
        let c = (group.rank() + 1) as f32;
        let w = Var::from_tensor(&Tensor::new(&[c, -c], &Device::Cpu)?)?;
        let unused = Var::from_tensor(&Tensor::new(&[c], &Device::Cpu)?)?;

        let mut ddp = DistributedDataParallel::wrap(group, vec![w.clone(), unused.clone()])?;
        let params = w.as_tensor().to_vec1::<f32>()?;

        // d/dw sum(c * w) = c on each rank
        let loss = (w.as_tensor() * c as f64)?.sum_all()?;
        let mut grads = loss.backward()?;
        ddp.sync_grads(&mut grads)?;

        let gw = grads
            .get(w.as_tensor())
            .ok_or(anyhow::anyhow!("no grad"))?
            .to_vec1::<f32>()?;
        let gu = grads
            .get(unused.as_tensor())
            .ok_or(anyhow::anyhow!("no grad"))?
            .to_vec1::<f32>()?;
        Ok((params, gw, gu))
    })?;

    for (params, gw, gu) in results {
        assert_eq!(params, vec![1., -1.]);
        assert_abs_diff_eq!(gw[0], 1.5, epsilon = 1e-6);
        assert_abs_diff_eq!(gw[1], 1.5, epsilon = 1e-6);
        assert_eq!(gu, vec![0.]);
    }
    Ok(())
}

#[test]
fn data_parallel_pairs_parameters_by_name() -> anyhow::Result<()> {
    let names = ["a", "b", "c", "d", "e", "f", "g", "h"];
    let results = run_ranks(2, move |group| {
        // a fresh map per rank, each with its own hash order
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        for (i, name) in names.iter().enumerate() {
            let value = (group.rank() * 100 + i) as f64;
            vb.get_with_hints(1, name, Init::Const(value))?;
        }

        let mut ddp = DistributedDataParallel::wrap(group, sorted_vars(&varmap)?)?;

        // gradient of var i is (rank + 1) * i
        let c = (ddp.rank() + 1) as f64;
        let mut loss = Tensor::zeros((), DType::F32, &Device::Cpu)?;
        for (i, name) in names.iter().enumerate() {
            let v = varmap.get(1, name, Init::Const(0.), DType::F32, &Device::Cpu)?;
            loss = (loss + (v * (c * i as f64))?.sum_all()?)?;
        }
        let mut grads = loss.backward()?;
        ddp.sync_grads(&mut grads)?;

        let data = varmap.data().lock().map_err(|e| anyhow::anyhow!("{}", e))?;
        let mut by_name = vec![];
        for name in names.iter() {
            let var = data.get(*name).ok_or(anyhow::anyhow!("missing {}", name))?;
            let value = var.as_tensor().to_vec1::<f32>()?[0];
            let grad = grads
                .get(var.as_tensor())
                .ok_or(anyhow::anyhow!("no grad for {}", name))?
                .to_vec1::<f32>()?[0];
            by_name.push((name.to_string(), value, grad));
        }
        Ok(by_name)
    })?;

    assert_eq!(results[0], results[1]);
    for (i, (name, value, grad)) in results[0].iter().enumerate() {
        assert_eq!(name, names[i]);
        assert_abs_diff_eq!(*value, i as f32, epsilon = 1e-6);
        assert_abs_diff_eq!(*grad, 1.5 * i as f32, epsilon = 1e-5);
    }
    Ok(())
}

#[test]
fn single_process_is_a_no_op() -> anyhow::Result<()> {
    let mut group = SingleProcess;
    let mut buf = vec![2., 3.];
    group.all_reduce_mean(&mut buf)?;
    group.broadcast(&mut buf)?;
    group.barrier()?;
    assert_eq!(buf, vec![2., 3.]);
    assert!(group.is_root());
    group.destroy()?;
    Ok(())
}

#[test]
fn frames_check_their_length() -> anyhow::Result<()> {
    let mut wire = vec![];
    write_frame(&mut wire, &[1.5, -2.0])?;
    assert_eq!(wire.len(), 8 + 2 * 4);

    let mut out = [0f32; 2];
    read_frame(&mut wire.as_slice(), &mut out)?;
    assert_eq!(out, [1.5, -2.0]);

    let mut short = [0f32; 3];
    assert!(read_frame(&mut wire.as_slice(), &mut short).is_err());
    Ok(())
}

fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let map: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    move |key| map.get(key).cloned()
}

#[test]
fn dist_env_parsing() -> anyhow::Result<()> {
    let env = DistEnv::from_lookup(env_of(&[("RANK", "1"), ("WORLD_SIZE", "4")]))?;
    assert_eq!(env.rank, 1);
    assert_eq!(env.world_size, 4);
    assert_eq!(env.local_rank, 0);
    assert_eq!(env.master_addr.as_ref(), "127.0.0.1");
    assert_eq!(env.master_port, 29500);
    assert_eq!(env.with_local_rank(Some(3)).local_rank, 3);

    let env = DistEnv::from_lookup(env_of(&[
        ("RANK", "0"),
        ("WORLD_SIZE", "2"),
        ("LOCAL_RANK", "1"),
        ("MASTER_ADDR", "10.0.0.7"),
        ("MASTER_PORT", "12345"),
    ]))?;
    assert_eq!(env.local_rank, 1);
    assert_eq!(env.master_addr.as_ref(), "10.0.0.7");
    assert_eq!(env.master_port, 12345);

    assert!(DistEnv::from_lookup(env_of(&[("WORLD_SIZE", "2")])).is_err());
    assert!(DistEnv::from_lookup(env_of(&[("RANK", "x"), ("WORLD_SIZE", "2")])).is_err());
    assert!(DistEnv::from_lookup(env_of(&[("RANK", "2"), ("WORLD_SIZE", "2")])).is_err());
    assert!(DistEnv::from_lookup(env_of(&[("RANK", "0"), ("WORLD_SIZE", "0")])).is_err());
    Ok(())
}
