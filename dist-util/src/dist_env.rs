use crate::process_group::{ProcessGroup, SingleProcess, TcpGroup};

use log::info;
use std::net::TcpListener;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_MASTER_ADDR: &str = "127.0.0.1";
pub const DEFAULT_MASTER_PORT: u16 = 29500;

/// How long non-zero ranks keep retrying to reach rank 0
pub const RENDEZVOUS_TIMEOUT: Duration = Duration::from_secs(1800);

/// Where this process sits in a job launched with one process per
/// device (`RANK`, `WORLD_SIZE`, `LOCAL_RANK`, `MASTER_ADDR`,
/// `MASTER_PORT`)
#[derive(Clone, Debug, PartialEq)]
pub struct DistEnv {
    pub rank: usize,
    pub world_size: usize,
    pub local_rank: usize,
    pub master_addr: Box<str>,
    pub master_port: u16,
}

impl DistEnv {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as `from_env` with the variables supplied by `lookup`
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let rank: usize = parse_var(&lookup, "RANK", None)?;
        let world_size: usize = parse_var(&lookup, "WORLD_SIZE", None)?;
        let local_rank: usize = parse_var(&lookup, "LOCAL_RANK", Some(0))?;
        let master_port: u16 = parse_var(&lookup, "MASTER_PORT", Some(DEFAULT_MASTER_PORT))?;
        let master_addr = lookup("MASTER_ADDR")
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_MASTER_ADDR.to_string())
            .into_boxed_str();

        if world_size == 0 {
            return Err(anyhow::anyhow!("WORLD_SIZE must be positive"));
        }
        if rank >= world_size {
            return Err(anyhow::anyhow!(
                "RANK {} is out of range for WORLD_SIZE {}",
                rank,
                world_size
            ));
        }

        Ok(Self {
            rank,
            world_size,
            local_rank,
            master_addr,
            master_port,
        })
    }

    /// A local rank given on the command line wins over `LOCAL_RANK`
    pub fn with_local_rank(mut self, local_rank: Option<usize>) -> Self {
        if let Some(lr) = local_rank {
            self.local_rank = lr;
        }
        self
    }
}

fn parse_var<T, F>(lookup: &F, key: &str, default: Option<T>) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match (lookup(key), default) {
        (Some(value), _) => value
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("invalid {}={}: {}", key, value, e)),
        (None, Some(default)) => Ok(default),
        (None, None) => Err(anyhow::anyhow!("{} is not set", key)),
    }
}

/// Join the process group described by `env`
pub fn init_process_group(env: &DistEnv) -> anyhow::Result<Box<dyn ProcessGroup>> {
    std::env::set_var("NCCL_DEBUG", "INFO");
    std::env::set_var("NCCL_SOCKET_IFNAME", "ib0");

    info!(
        "rank {} of {} (local rank {}), master {}:{}",
        env.rank, env.world_size, env.local_rank, env.master_addr, env.master_port
    );

    if env.world_size == 1 {
        return Ok(Box::new(SingleProcess));
    }

    let group = if env.rank == 0 {
        let listener = TcpListener::bind(("0.0.0.0", env.master_port))?;
        TcpGroup::from_listener(listener, env.world_size)?
    } else {
        TcpGroup::connect_to(
            (env.master_addr.as_ref(), env.master_port),
            env.rank,
            env.world_size,
            RENDEZVOUS_TIMEOUT,
        )?
    };
    Ok(Box::new(group))
}
