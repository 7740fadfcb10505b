use crate::finetune_common::*;
use crate::run_tracker::RunTracker;

use candle_core::DType;
use candle_nn::{Optimizer, VarBuilder, VarMap};
use candle_util::candle_classifier_inference::Classifier;
use candle_util::candle_data_loader::{DataLoader, Sampling};
use candle_util::candle_inference::{EvalStats, TrainConfig};
use candle_util::candle_lr_schedule::{ScheduledOptimizer, WarmupSchedule};
use candle_util::candle_optim::*;
use cifar_data::cifar_io::{CifarDataset, CifarKind};
use cifar_data::image_transforms::Compose;
use cifar_data::{download_if_absent, CifarLoader};
use dist_util::{init_process_group, DistEnv, DistributedDataParallel, ProcessGroup, SingleProcess};
use serde::Serialize;
use serde_json::json;
use std::path::Path;
use vit_model::vit_pretrained::{count_parameters_millions, load_pretrained_npz, save_pretrained_npz};
use vit_model::{ViTConfig, VisionTransformer};

pub const TRACKER_PROJECT: &str = "fed_transformer";

#[derive(Args, Debug, Serialize)]
pub struct FinetuneArgs {
    #[arg(
        long,
        help = "Local rank of this process",
        long_help = "Local rank of this process on its node.\n\
		     Selects the CUDA/Metal device ordinal.\n\
		     In a distributed run it overrides LOCAL_RANK."
    )]
    local_rank: Option<usize>,

    #[arg(
        long,
        default_value_t = 0,
        help = "Global rank of this process",
        long_help = "Global rank of this process.\n\
		     Replaced by RANK when running distributed."
    )]
    global_rank: usize,

    #[arg(
        long,
        default_value = "transformer",
        help = "Neural network used in training",
        long_help = "Neural network used in training.\n\
		     Only `transformer` (a Vision Transformer) is available."
    )]
    model: Box<str>,

    #[arg(
        long,
        default_value = DEFAULT_MODEL_TYPE,
        help = "Vision Transformer configuration",
        long_help = "Vision Transformer configuration:\n\
		     ViT-B_16, ViT-B_32, ViT-L_16, ViT-L_32, ViT-H_14 or testing.\n\
		     Must match the pretrained checkpoint."
    )]
    model_type: Box<str>,

    #[arg(
        long,
        default_value = "cifar10",
        help = "Dataset used for training",
        long_help = "Dataset used for training: cifar10 or cifar100.\n\
		     Unknown names fall back to cifar10."
    )]
    dataset: Box<str>,

    #[arg(
        long,
        default_value = "./data/cifar10",
        help = "Data directory",
        long_help = "Directory of the extracted binary CIFAR archive\n\
		     (cifar-10-batches-bin or cifar-100-binary) or its parent.\n\
		     A missing archive is downloaded and extracted here."
    )]
    data_dir: Box<str>,

    #[arg(
        long,
        default_value_t = 2,
        help = "Minibatch size",
        long_help = "Minibatch size for training and evaluation (per process)."
    )]
    batch_size: usize,

    #[arg(
        long,
        value_enum,
        default_value = "sgd",
        help = "Optimizer",
        long_help = "Optimizer: sgd (momentum 0.9) or adam (amsgrad)."
    )]
    client_optimizer: OptimizerKind,

    #[arg(
        long,
        value_enum,
        default_value = "cosine",
        help = "How to decay the learning rate",
        long_help = "How to decay the learning rate after the warmup:\n\
		     cosine (half cycle) or linear, both down to zero.\n\
		     The schedule counts optimizer steps, not epochs:\n\
		     it spans epochs x minibatches per epoch steps."
    )]
    decay_type: DecayType,

    #[arg(
        long,
        default_value_t = 0.03,
        help = "Learning rate",
        long_help = "Base learning rate; the schedule scales it every step."
    )]
    lr: f64,

    #[arg(
        long,
        default_value_t = 0.0,
        help = "Weight decay",
        long_help = "L2 weight decay added to the gradients."
    )]
    wd: f64,

    #[arg(
        long,
        default_value_t = 2,
        help = "Warmup steps",
        long_help = "Number of optimizer steps (minibatches, not epochs)\n\
		     to warm up the learning rate linearly from zero."
    )]
    warmup_steps: usize,

    #[arg(
        long,
        default_value_t = 20,
        help = "Number of training epochs",
        long_help = "Number of passes over the training set."
    )]
    epochs: usize,

    #[arg(
        long,
        default_value_t = DEFAULT_IMG_SIZE,
        help = "Resolution size",
        long_help = "Side of the square images fed to the model.\n\
		     Must be a multiple of the patch size."
    )]
    img_size: usize,

    #[arg(
        long,
        default_value = DEFAULT_PRETRAINED,
        help = "Pretrained checkpoint",
        long_help = "Pretrained Vision Transformer weights (.npz)."
    )]
    pretrained_dir: Box<str>,

    #[arg(
        long,
        default_value_t = 0,
        help = "Distributed run (0 or 1)",
        long_help = "Set to 1 to join a data-parallel group described by\n\
		     RANK, WORLD_SIZE, LOCAL_RANK, MASTER_ADDR and MASTER_PORT."
    )]
    is_distributed: u8,

    #[arg(
        long,
        value_enum,
        default_value = "cpu",
        help = "Candle device",
        long_help = "Candle device to use for computation.\n\
		     Options: cpu, cuda, metal."
    )]
    device: ComputeDevice,

    #[arg(
        long,
        default_value_t = 0,
        help = "Random seed",
        long_help = "Random seed of the sample order and data augmentation\n\
		     (and of the device generator on cuda/metal)."
    )]
    seed: u64,

    #[arg(
        long,
        default_value_t = 4,
        help = "Data loading threads",
        long_help = "Number of threads decoding and augmenting a minibatch.\n\
		     Capped at the number of CPUs."
    )]
    num_workers: usize,

    #[arg(
        long,
        default_value = "runs",
        help = "Tracker directory",
        long_help = "Root directory of the run tracker:\n\
		     {tracker_dir}/fed_transformer/{run name}/{config.json,metrics.jsonl}"
    )]
    tracker_dir: Box<str>,

    #[arg(
        long,
        default_value_t = false,
        help = "Disable the run tracker"
    )]
    no_tracker: bool,

    #[arg(
        long,
        help = "Save fine-tuned weights",
        long_help = "Save the fine-tuned weights (.npz, checkpoint layout)\n\
		     after the last epoch. Only rank 0 writes."
    )]
    save_checkpoint: Option<Box<str>>,

    #[arg(
        long,
        short,
        help = "Verbosity",
        long_help = "Enable verbose output.\n\
		     Prints additional information during execution."
    )]
    verbose: bool,
}

impl FinetuneArgs {
    /// `FedTransformer(c){epochs}-lr{lr}` with the learning rate written
    /// the way earlier tracker runs named it (`0.03`, `1e-05`)
    pub fn run_name(&self) -> String {
        format!("FedTransformer(c){}-lr{}", self.epochs, shortest_float(self.lr))
    }
}

/// Shortest round-trip decimal, switching to `{m}e{sign}{dd}` below
/// 1e-4 and from 1e16 on; whole numbers keep a trailing `.0`
fn shortest_float(x: f64) -> String {
    if x.is_nan() {
        return "nan".to_string();
    }
    if x.is_infinite() {
        return if x > 0. { "inf" } else { "-inf" }.to_string();
    }

    let sci = format!("{:e}", x);
    let (mantissa, exp) = match sci.split_once('e') {
        Some((m, e)) => (m, e.parse::<i32>().unwrap_or(0)),
        None => (sci.as_str(), 0),
    };

    if (-4..16).contains(&exp) {
        let plain = format!("{}", x);
        if plain.contains('.') {
            plain
        } else {
            format!("{}.0", plain)
        }
    } else {
        let sign = if exp < 0 { '-' } else { '+' };
        format!("{}e{}{:02}", mantissa, sign, exp.unsigned_abs())
    }
}

pub fn fit_finetune(args: &FinetuneArgs) -> anyhow::Result<()> {
    init_logger(args.verbose);

    info!("{:?}", args);
    info!(
        "process ID = {}, host name = {}, process name = {}",
        std::process::id(),
        host_name(),
        process_name()
    );

    if args.batch_size == 0 {
        return Err(anyhow::anyhow!("batch size must be positive"));
    }

    // 1. Join the process group
    let distributed = args.is_distributed == 1;

    let (mut group, local_rank): (Box<dyn ProcessGroup>, usize) = if distributed {
        let env = DistEnv::from_env()?.with_local_rank(args.local_rank);
        (init_process_group(&env)?, env.local_rank)
    } else {
        (Box::new(SingleProcess), args.local_rank.unwrap_or(0))
    };

    let global_rank = if distributed {
        group.rank()
    } else {
        args.global_rank
    };
    let is_root = group.is_root();

    let dev = new_device(&args.device, local_rank)?;
    if !dev.is_cpu() {
        dev.set_seed(args.seed)?;
    }
    info!("rank {} uses {:?}", global_rank, dev);

    // 2. Tracker on rank 0
    let mut tracker = if is_root && !args.no_tracker {
        Some(RunTracker::init(
            Path::new(args.tracker_dir.as_ref()),
            TRACKER_PROJECT,
            &args.run_name(),
            args,
        )?)
    } else {
        None
    };

    // 3. Datasets
    let kind = CifarKind::from_name(&args.dataset);
    let (train_data, test_data) = load_cifar(args, kind, group.as_mut())?;

    // 4. Model with pretrained weights
    if args.model.as_ref() != "transformer" {
        return Err(anyhow::anyhow!("unknown model: {}", args.model));
    }

    let config = ViTConfig::from_name(&args.model_type)?;
    info!("Vision Transformer configuration: {}", config);

    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
    let model = VisionTransformer::new(&config, args.img_size, kind.num_classes(), true, vb)?;
    load_pretrained_npz(&varmap, Path::new(args.pretrained_dir.as_ref()), &config, true)?;
    info!(
        "Vision Transformer model size = {:.2}M",
        count_parameters_millions(&varmap)
    );

    // 5. Data parallel replica (a no-op wrapper in a single process)
    let classifier = Classifier::build(&model, &varmap)?;
    let mut ddp = DistributedDataParallel::wrap(group.as_mut(), classifier.vars.clone())?;

    // 6. Optimizer and schedule over every optimizer step of the run
    let steps_per_epoch = train_data.num_samples().div_ceil(args.batch_size);
    let total_steps = args.epochs * steps_per_epoch;
    let schedule = match args.decay_type {
        DecayType::Cosine => WarmupSchedule::cosine(args.warmup_steps, total_steps),
        DecayType::Linear => WarmupSchedule::linear(args.warmup_steps, total_steps),
    };
    info!(
        "{} steps per epoch, {} in total, {:?}",
        steps_per_epoch, total_steps, schedule
    );

    let train_config = TrainConfig {
        learning_rate: args.lr,
        batch_size: args.batch_size,
        num_epochs: args.epochs,
        max_grad_norm: MAX_GRAD_NORM,
        device: dev.clone(),
        verbose: args.verbose,
        show_progress: is_root,
    };

    let mut session = FinetuneSession {
        classifier,
        train_data,
        test_data,
        train_config,
        tracker: tracker.as_mut(),
        is_root,
    };

    let vars = session.classifier.vars.clone();
    match args.client_optimizer {
        OptimizerKind::Sgd => {
            let params = ParamsSgd {
                lr: args.lr,
                momentum: 0.9,
                weight_decay: args.wd,
            };
            let mut opt = ScheduledOptimizer::new(SgdMomentum::new(vars, params)?, schedule);
            session.run(&mut opt, &mut ddp)?;
        }
        OptimizerKind::Adam => {
            let params = ParamsAdam {
                lr: args.lr,
                weight_decay: args.wd,
                amsgrad: true,
                ..Default::default()
            };
            let mut opt = ScheduledOptimizer::new(Adam::new(vars, params)?, schedule);
            session.run(&mut opt, &mut ddp)?;
        }
    }
    drop(session);
    drop(ddp);

    if let Some(path) = args.save_checkpoint.as_deref() {
        if is_root {
            save_pretrained_npz(&varmap, Path::new(path), &config)?;
            info!("saved the fine-tuned weights to {}", path);
        }
    }

    if let Some(tracker) = tracker {
        tracker.finish()?;
    }

    if distributed {
        group.destroy()?;
    }
    Ok(())
}

/// Rank 0 downloads the archive (if needed) between two barriers,
/// then every rank reads both splits
fn load_cifar(
    args: &FinetuneArgs,
    kind: CifarKind,
    group: &mut dyn ProcessGroup,
) -> anyhow::Result<(CifarLoader, CifarLoader)> {
    let data_dir = Path::new(args.data_dir.as_ref());

    group.barrier()?;
    if group.is_root() {
        download_if_absent(data_dir, kind)?;
    }
    group.barrier()?;
    let train_set = CifarDataset::read(data_dir, kind, true)?;
    let test_set = CifarDataset::read(data_dir, kind, false)?;

    let train_sampling = if group.world_size() > 1 {
        Sampling::Distributed {
            rank: group.rank(),
            world_size: group.world_size(),
        }
    } else {
        Sampling::Random
    };

    let num_workers = args.num_workers.clamp(1, num_cpus::get().max(1));

    let train_data = CifarLoader::new(
        train_set,
        Compose::train(args.img_size),
        train_sampling,
        args.seed,
        num_workers,
    )?;
    let test_data = CifarLoader::new(
        test_set,
        Compose::test(args.img_size),
        Sampling::Sequential,
        args.seed,
        num_workers,
    )?;

    info!(
        "{} training / {} test images on this rank",
        train_data.num_samples(),
        test_data.num_samples()
    );
    Ok((train_data, test_data))
}

struct FinetuneSession<'a> {
    classifier: Classifier<'a, VisionTransformer>,
    train_data: CifarLoader,
    test_data: CifarLoader,
    train_config: TrainConfig,
    tracker: Option<&'a mut RunTracker>,
    is_root: bool,
}

impl FinetuneSession<'_> {
    /// train -> evaluate(train) -> evaluate(test) -> log, every epoch
    fn run<O, G>(
        &mut self,
        optimizer: &mut ScheduledOptimizer<O, WarmupSchedule>,
        grad_sync: &mut G,
    ) -> anyhow::Result<()>
    where
        O: Optimizer,
        G: GradientSync,
    {
        for epoch in 0..self.train_config.num_epochs {
            let losses = self.classifier.train_epoch(
                &mut self.train_data,
                optimizer,
                grad_sync,
                &self.train_config,
            )?;
            let avg_loss = losses.iter().sum::<f32>() / losses.len().max(1) as f32;
            info!(
                "epoch {}: average training loss = {:.6}, lr = {:.3e}",
                epoch,
                avg_loss,
                optimizer.learning_rate()
            );

            let train_stats = self
                .classifier
                .evaluate(&mut self.train_data, &self.train_config)?;
            let test_stats = self
                .classifier
                .evaluate(&mut self.test_data, &self.train_config)?;

            self.report(epoch, &train_stats, &test_stats)?;
        }
        Ok(())
    }

    fn report(
        &mut self,
        epoch: usize,
        train_stats: &EvalStats,
        test_stats: &EvalStats,
    ) -> anyhow::Result<()> {
        if !self.is_root {
            return Ok(());
        }

        info!(
            "epoch {}: train acc = {:.4}, loss = {:.4}; test acc = {:.4}, loss = {:.4}",
            epoch,
            train_stats.accuracy(),
            train_stats.mean_loss(),
            test_stats.accuracy(),
            test_stats.mean_loss()
        );

        let Some(tracker) = self.tracker.as_mut() else {
            return Ok(());
        };

        tracker.log(json!({
            "Train/Acc": train_stats.accuracy(),
            "Train/Loss": train_stats.mean_loss(),
            "round": epoch,
        }))?;
        tracker.log(json!({
            "Test/Acc": test_stats.accuracy(),
            "Test/Loss": test_stats.mean_loss(),
            "round": epoch,
        }))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::shortest_float;

    #[test]
    fn learning_rates_print_like_tracker_run_names() {
        assert_eq!(shortest_float(0.03), "0.03");
        assert_eq!(shortest_float(0.001), "0.001");
        assert_eq!(shortest_float(0.0001), "0.0001");
        assert_eq!(shortest_float(1e-5), "1e-05");
        assert_eq!(shortest_float(3e-5), "3e-05");
        assert_eq!(shortest_float(2.5e-7), "2.5e-07");
        assert_eq!(shortest_float(1.0), "1.0");
        assert_eq!(shortest_float(0.0), "0.0");
        assert_eq!(shortest_float(1e16), "1e+16");
    }
}
