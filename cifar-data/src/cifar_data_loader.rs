use crate::cifar_io::CifarDataset;
use crate::image_transforms::{Compose, TransformedImage};

use candle_core::{Device, Tensor};
use candle_util::candle_data_loader::*;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;

///
/// Serve transformed CIFAR images in minibatches. Images are
/// decoded and augmented on demand, in parallel over the images of
/// a minibatch.
///
/// Augmentation of sample `i` in pass `e` draws from a generator
/// seeded by `(seed, e, i)`, so a run is reproducible regardless of
/// the number of workers.
///
pub struct CifarLoader {
    dataset: CifarDataset,
    transform: Compose,
    minibatches: Minibatches,
    seed: u64,
    pool: rayon::ThreadPool,
}

impl CifarLoader {
    /// * `dataset` - decoded CIFAR split
    /// * `transform` - per-image transform
    /// * `sampling` - random, sequential or distributed order
    /// * `seed` - seed of the sample permutations and augmentation
    /// * `num_workers` - threads decoding a minibatch
    pub fn new(
        dataset: CifarDataset,
        transform: Compose,
        sampling: Sampling,
        seed: u64,
        num_workers: usize,
    ) -> anyhow::Result<Self> {
        let minibatches = Minibatches::new(dataset.len(), sampling, seed);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_workers.max(1))
            .build()?;
        Ok(Self {
            dataset,
            transform,
            minibatches,
            seed,
            pool,
        })
    }

    pub fn num_classes(&self) -> usize {
        self.dataset.num_classes()
    }

    pub fn minibatches(&self) -> &Minibatches {
        &self.minibatches
    }
}

impl DataLoader for CifarLoader {
    fn minibatch_data(
        &self,
        batch_idx: usize,
        target_device: &Device,
    ) -> anyhow::Result<MinibatchData> {
        let samples = self.minibatches.chunks.get(batch_idx).ok_or(anyhow::anyhow!(
            "invalid index = {} vs. total # = {}",
            batch_idx,
            self.num_minibatch()
        ))?;

        // shuffle_minibatch has already advanced the pass counter
        let pass = self.minibatches.epoch().saturating_sub(1);

        let images: Vec<TransformedImage> = self.pool.install(|| {
            samples
                .par_iter()
                .map(|&i| {
                    let mut rng = StdRng::seed_from_u64(augment_seed(self.seed, pass, i));
                    self.transform
                        .apply_cifar(&self.dataset.records[i].pixels, &mut rng)
                })
                .collect::<anyhow::Result<Vec<_>>>()
        })?;

        let n = images.len();
        let (h, w) = images
            .first()
            .map(|img| (img.height, img.width))
            .ok_or(anyhow::anyhow!("empty minibatch #{}", batch_idx))?;

        if images.iter().any(|img| img.height != h || img.width != w) {
            return Err(anyhow::anyhow!(
                "images of minibatch #{} differ in size",
                batch_idx
            ));
        }

        let mut data = Vec::with_capacity(n * 3 * h * w);
        for img in images {
            data.extend(img.data);
        }
        let labels: Vec<u32> = samples
            .iter()
            .map(|&i| self.dataset.records[i].label)
            .collect();

        Ok(MinibatchData {
            input: Tensor::from_vec(data, (n, 3, h, w), target_device)?,
            output: Some(Tensor::from_vec(labels, n, target_device)?),
        })
    }

    fn num_minibatch(&self) -> usize {
        self.minibatches.chunks.len()
    }

    fn shuffle_minibatch(&mut self, batch_size: usize) -> anyhow::Result<()> {
        self.minibatches.shuffle_minibatch(batch_size)
    }

    fn num_samples(&self) -> usize {
        self.minibatches.num_local_samples()
    }
}

fn augment_seed(seed: u64, pass: u64, sample: usize) -> u64 {
    const GOLDEN: u64 = 0x9E37_79B9_7F4A_7C15;
    seed.wrapping_mul(GOLDEN)
        .wrapping_add(pass)
        .wrapping_mul(GOLDEN)
        .wrapping_add(sample as u64)
}
