use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

pub struct MinibatchData {
    pub input: Tensor,
    pub output: Option<Tensor>,
}

/// `DataLoader` for minibatch learning
pub trait DataLoader {
    fn minibatch_data(
        &self,
        batch_idx: usize,
        target_device: &Device,
    ) -> anyhow::Result<MinibatchData>;

    fn num_minibatch(&self) -> usize;

    /// Re-partition the samples into minibatches for the next pass
    fn shuffle_minibatch(&mut self, batch_size: usize) -> anyhow::Result<()>;

    fn num_samples(&self) -> usize;
}

/// How `Minibatches` orders and distributes the sample indexes
#[derive(Clone, Debug, PartialEq)]
pub enum Sampling {
    /// a fresh permutation of all samples in every pass
    Random,
    /// samples in their original order
    Sequential,
    /// one shard of a permutation shared by all ranks
    Distributed { rank: usize, world_size: usize },
}

///
/// A helper `struct` for shuffling and creating minibatch indexes;
/// after `shuffle_minibatch` is called, `chunks` partition indexes.
///
/// The permutation of pass `e` is drawn from `seed + e`, so every
/// rank of a distributed run sees the same permutation and takes
/// a disjoint stride of it.
///
pub struct Minibatches {
    samples: Vec<usize>,
    sampling: Sampling,
    seed: u64,
    epoch: u64,
    pub chunks: Vec<Vec<usize>>,
}

impl Minibatches {
    pub fn new(size: usize, sampling: Sampling, seed: u64) -> Self {
        Self {
            samples: (0..size).collect(),
            sampling,
            seed,
            epoch: 0,
            chunks: vec![],
        }
    }

    pub fn shuffle_minibatch(&mut self, batch_size: usize) -> anyhow::Result<()> {
        if batch_size == 0 {
            return Err(anyhow::anyhow!("batch size must be positive"));
        }

        let indexes = self.epoch_indexes()?;
        self.epoch += 1;

        self.chunks = indexes
            .chunks(batch_size)
            .map(|chunk| chunk.to_vec())
            .collect();

        Ok(())
    }

    fn epoch_indexes(&self) -> anyhow::Result<Vec<usize>> {
        let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(self.epoch));

        match self.sampling {
            Sampling::Sequential => Ok(self.samples.clone()),
            Sampling::Random => {
                let mut ret = self.samples.clone();
                ret.shuffle(&mut rng);
                Ok(ret)
            }
            Sampling::Distributed { rank, world_size } => {
                if world_size == 0 || rank >= world_size {
                    return Err(anyhow::anyhow!(
                        "invalid rank {} for world size {}",
                        rank,
                        world_size
                    ));
                }
                let mut perm = self.samples.clone();
                perm.shuffle(&mut rng);
                Ok(shard_indexes(&perm, rank, world_size))
            }
        }
    }

    pub fn size(&self) -> usize {
        self.samples.len()
    }

    /// number of samples this process visits in one pass
    pub fn num_local_samples(&self) -> usize {
        match self.sampling {
            Sampling::Distributed { world_size, .. } if world_size > 0 => {
                self.size().div_ceil(world_size)
            }
            _ => self.size(),
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }
}

/// Pad `perm` by wrapping around to a multiple of `world_size`,
/// then take every `world_size`-th element starting at `rank`
pub fn shard_indexes(perm: &[usize], rank: usize, world_size: usize) -> Vec<usize> {
    if perm.is_empty() {
        return vec![];
    }
    let total = perm.len().div_ceil(world_size) * world_size;
    let padded: Vec<usize> = perm.iter().cycle().take(total).copied().collect();
    padded
        .into_iter()
        .skip(rank)
        .step_by(world_size)
        .collect()
}
