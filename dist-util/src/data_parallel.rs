use crate::process_group::ProcessGroup;

use candle_core::backprop::GradStore;
use candle_core::{DType, Tensor, Var};
use candle_util::candle_optim::GradientSync;
use log::info;

///
/// Data-parallel replica of a model. Wrapping copies rank 0's
/// parameters to every rank; afterwards each `sync_grads` replaces
/// the local gradients with their mean over all ranks, so that the
/// replicas take identical optimizer steps.
///
/// Parameters are paired across ranks by position, so every rank must
/// pass `vars` in the same order (see `candle_optim::sorted_vars`).
/// Gradients travel as one flat `f32` buffer per step. A parameter
/// without a gradient contributes zeros.
///
pub struct DistributedDataParallel<'a> {
    group: &'a mut dyn ProcessGroup,
    vars: Vec<Var>,
}

impl<'a> DistributedDataParallel<'a> {
    pub fn wrap(group: &'a mut dyn ProcessGroup, vars: Vec<Var>) -> anyhow::Result<Self> {
        if group.world_size() > 1 {
            for var in vars.iter() {
                let mut buf = flat_f32(var.as_tensor())?;
                group.broadcast(&mut buf)?;
                let synced = Tensor::from_vec(buf, var.shape(), var.device())?
                    .to_dtype(var.dtype())?;
                var.set(&synced)?;
            }
            info!(
                "rank {}: {} parameter tensors synchronized",
                group.rank(),
                vars.len()
            );
        }
        Ok(Self { group, vars })
    }

    pub fn rank(&self) -> usize {
        self.group.rank()
    }

    pub fn world_size(&self) -> usize {
        self.group.world_size()
    }

    pub fn vars(&self) -> &[Var] {
        &self.vars
    }
}

impl GradientSync for DistributedDataParallel<'_> {
    fn sync_grads(&mut self, grads: &mut GradStore) -> anyhow::Result<()> {
        if self.group.world_size() < 2 {
            return Ok(());
        }

        let total: usize = self.vars.iter().map(|v| v.elem_count()).sum();
        let mut flat = Vec::with_capacity(total);

        for var in self.vars.iter() {
            match grads.get(var.as_tensor()) {
                Some(g) => flat.extend(flat_f32(g)?),
                None => flat.extend(std::iter::repeat(0f32).take(var.elem_count())),
            }
        }

        self.group.all_reduce_mean(&mut flat)?;

        let mut offset = 0;
        for var in self.vars.iter() {
            let n = var.elem_count();
            let g = Tensor::from_slice(&flat[offset..offset + n], var.shape(), var.device())?
                .to_dtype(var.dtype())?;
            grads.insert(var.as_tensor(), g);
            offset += n;
        }
        Ok(())
    }
}

fn flat_f32(x: &Tensor) -> candle_core::Result<Vec<f32>> {
    x.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()
}
