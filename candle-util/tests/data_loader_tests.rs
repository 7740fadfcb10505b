use candle_core::{DType, Device, Module, Result, Tensor};
use candle_nn::{Optimizer, VarBuilder, VarMap};
use candle_util::candle_classifier_inference::Classifier;
use candle_util::candle_data_loader::*;
use candle_util::candle_inference::TrainConfig;
use candle_util::candle_loss_functions::*;
use candle_util::candle_lr_schedule::*;
use candle_util::candle_model_traits::ClassifierModuleT;
use candle_util::candle_optim::*;

use std::collections::HashSet;

#[test]
fn sequential_minibatches_keep_order() -> anyhow::Result<()> {
    let mut mb = Minibatches::new(7, Sampling::Sequential, 0);
    mb.shuffle_minibatch(3)?;
    assert_eq!(mb.chunks, vec![vec![0, 1, 2], vec![3, 4, 5], vec![6]]);
    Ok(())
}

#[test]
fn random_minibatches_are_a_permutation() -> anyhow::Result<()> {
    let mut mb = Minibatches::new(100, Sampling::Random, 42);
    mb.shuffle_minibatch(32)?;
    assert_eq!(mb.chunks.len(), 4);
    assert_eq!(mb.chunks[3].len(), 4);

    let first: Vec<usize> = mb.chunks.concat();
    let mut sorted = first.clone();
    sorted.sort();
    assert_eq!(sorted, (0..100).collect::<Vec<_>>());

    mb.shuffle_minibatch(32)?;
    let second: Vec<usize> = mb.chunks.concat();
    assert_ne!(first, second);
    assert_eq!(mb.epoch(), 2);
    Ok(())
}

#[test]
fn zero_batch_size_is_rejected() {
    let mut mb = Minibatches::new(3, Sampling::Sequential, 0);
    assert!(mb.shuffle_minibatch(0).is_err());
}

#[test]
fn distributed_shards_cover_the_data() -> anyhow::Result<()> {
    let n = 10;
    let world_size = 3;
    let mut shards = vec![];
    for rank in 0..world_size {
        let mut mb = Minibatches::new(n, Sampling::Distributed { rank, world_size }, 7);
        mb.shuffle_minibatch(2)?;
        assert_eq!(mb.num_local_samples(), 4);
        shards.push(mb.chunks.concat());
    }

    // padded to 12, so every rank has the same number of samples
    assert!(shards.iter().all(|s| s.len() == 4));

    let all: HashSet<usize> = shards.iter().flatten().copied().collect();
    assert_eq!(all.len(), n);

    // without the two padding samples the shards are disjoint
    let total: usize = shards.iter().map(|s| s.len()).sum();
    assert_eq!(total - all.len(), 2);
    Ok(())
}

#[test]
fn shard_indexes_wrap_around() {
    let perm = vec![4, 2, 0, 1, 3];
    assert_eq!(shard_indexes(&perm, 0, 2), vec![4, 0, 3]);
    assert_eq!(shard_indexes(&perm, 1, 2), vec![2, 1, 4]);
    assert_eq!(shard_indexes(&perm, 1, 8), vec![2]);
}

#[test]
fn invalid_rank_is_rejected() {
    let mut mb = Minibatches::new(
        4,
        Sampling::Distributed {
            rank: 2,
            world_size: 2,
        },
        0,
    );
    assert!(mb.shuffle_minibatch(2).is_err());
}

#[test]
fn count_correct_uses_argmax() -> anyhow::Result<()> {
    let dev = Device::Cpu;
    let logits = Tensor::new(&[[0.1f32, 0.9], [0.8, 0.2], [0.3, 0.7]], &dev)?;
    let labels = Tensor::new(&[1u32, 1, 1], &dev)?;
    assert_eq!(count_correct(&logits, &labels)?, 2);

    let loss = cross_entropy_loss(&logits, &labels)?.to_scalar::<f32>()?;
    assert!(loss > 0.0);
    Ok(())
}

/// two well-separated clusters in 2-d
struct ToyData {
    x: Vec<[f32; 2]>,
    y: Vec<u32>,
    minibatches: Minibatches,
}

impl ToyData {
    fn new() -> Self {
        let mut x = vec![];
        let mut y = vec![];
        for i in 0..40 {
            let s = (i % 10) as f32 * 0.05;
            if i % 2 == 0 {
                x.push([2.0 + s, 2.0 - s]);
                y.push(0);
            } else {
                x.push([-2.0 - s, -2.0 + s]);
                y.push(1);
            }
        }
        let minibatches = Minibatches::new(x.len(), Sampling::Random, 0);
        Self { x, y, minibatches }
    }
}

impl DataLoader for ToyData {
    fn minibatch_data(&self, batch_idx: usize, target_device: &Device) -> anyhow::Result<MinibatchData> {
        let samples = &self.minibatches.chunks[batch_idx];
        let xs: Vec<f32> = samples.iter().flat_map(|&i| self.x[i]).collect();
        let ys: Vec<u32> = samples.iter().map(|&i| self.y[i]).collect();
        Ok(MinibatchData {
            input: Tensor::from_vec(xs, (samples.len(), 2), target_device)?,
            output: Some(Tensor::from_vec(ys, samples.len(), target_device)?),
        })
    }

    fn num_minibatch(&self) -> usize {
        self.minibatches.chunks.len()
    }

    fn shuffle_minibatch(&mut self, batch_size: usize) -> anyhow::Result<()> {
        self.minibatches.shuffle_minibatch(batch_size)
    }

    fn num_samples(&self) -> usize {
        self.minibatches.size()
    }
}

struct LinearClassifier {
    linear: candle_nn::Linear,
}

impl ClassifierModuleT for LinearClassifier {
    fn forward_t(&self, x: &Tensor, _train: bool) -> Result<Tensor> {
        self.linear.forward(x)
    }

    fn num_classes(&self) -> usize {
        2
    }
}

#[test]
fn classifier_learns_separable_data() -> anyhow::Result<()> {
    let dev = Device::Cpu;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
    let model = LinearClassifier {
        linear: candle_nn::linear(2, 2, vb.pp("head"))?,
    };

    let config = TrainConfig {
        learning_rate: 0.1,
        batch_size: 8,
        num_epochs: 5,
        max_grad_norm: 1.0,
        device: dev.clone(),
        verbose: false,
        show_progress: false,
    };

    let classifier = Classifier::build(&model, &varmap)?;
    let sgd = SgdMomentum::new(
        varmap.all_vars(),
        ParamsSgd {
            lr: config.learning_rate,
            ..Default::default()
        },
    )?;
    let total_steps = config.num_epochs * 5;
    let mut optimizer = ScheduledOptimizer::new(sgd, WarmupSchedule::cosine(2, total_steps));

    let mut data = ToyData::new();
    let mut losses = vec![];
    for _ in 0..config.num_epochs {
        let batch_loss = classifier.train_epoch(&mut data, &mut optimizer, &mut LocalGradients, &config)?;
        assert_eq!(batch_loss.len(), 5);
        losses.extend(batch_loss);
    }
    assert_eq!(optimizer.num_steps(), total_steps);

    let stats = classifier.evaluate(&mut data, &config)?;
    assert_eq!(stats.total, 40);
    assert_eq!(stats.correct, 40);
    assert!(stats.mean_loss() < losses[0] as f64);
    Ok(())
}
