use crate::candle_data_loader::*;
use crate::candle_inference::{EvalStats, TrainConfig};
use crate::candle_loss_functions::{count_correct, cross_entropy_loss};
use crate::candle_lr_schedule::{LrSchedule, ScheduledOptimizer};
use crate::candle_model_traits::ClassifierModuleT;
use crate::candle_optim::{clip_grad_norm, sorted_vars, GradientSync};

use candle_core::Var;
use candle_nn::Optimizer;
use indicatif::{ProgressBar, ProgressDrawTarget};
use log::{debug, info};

/// Supervised training and evaluation of a classifier whose
/// trainable parameters are `vars` (ordered by name)
pub struct Classifier<'a, M>
where
    M: ClassifierModuleT,
{
    pub model: &'a M,
    pub vars: Vec<Var>,
}

impl<'a, M> Classifier<'a, M>
where
    M: ClassifierModuleT,
{
    pub fn build(model: &'a M, variable_map: &candle_nn::VarMap) -> candle_core::Result<Self> {
        Ok(Self {
            model,
            vars: sorted_vars(variable_map)?,
        })
    }

    /// One pass over `data`:
    /// forward -> cross entropy -> backward -> sync -> clip -> step
    ///
    /// * `data` - data loader with labels in `output`
    /// * `optimizer` - optimizer advancing its schedule each step
    /// * `grad_sync` - averages gradients across replicas (if any)
    /// * `train_config` - training configuration
    ///
    /// Returns the loss of each minibatch
    pub fn train_epoch<DataL, O, S, G>(
        &self,
        data: &mut DataL,
        optimizer: &mut ScheduledOptimizer<O, S>,
        grad_sync: &mut G,
        train_config: &TrainConfig,
    ) -> anyhow::Result<Vec<f32>>
    where
        DataL: DataLoader,
        O: Optimizer,
        S: LrSchedule,
        G: GradientSync,
    {
        let device = &train_config.device;

        data.shuffle_minibatch(train_config.batch_size)?;
        let num_minibatches = data.num_minibatch();

        let pb = ProgressBar::new(num_minibatches as u64);
        if !train_config.show_progress || train_config.verbose {
            pb.set_draw_target(ProgressDrawTarget::hidden());
        }

        let mut batch_loss = Vec::with_capacity(num_minibatches);

        for b in 0..num_minibatches {
            let mb = data.minibatch_data(b, device)?;
            let labels = mb
                .output
                .as_ref()
                .ok_or(anyhow::anyhow!("minibatch #{} has no labels", b))?;

            let logits = self.model.forward_t(&mb.input, true)?;
            let loss = cross_entropy_loss(&logits, labels)?;

            let mut grads = loss.backward()?;
            grad_sync.sync_grads(&mut grads)?;
            let grad_norm = clip_grad_norm(&self.vars, &mut grads, train_config.max_grad_norm)?;
            optimizer.step(&grads)?;

            let loss_val = loss.to_scalar::<f32>()?;
            batch_loss.push(loss_val);
            pb.inc(1);

            debug!(
                "batch {}/{}: loss = {:.6}, grad norm = {:.4}, lr = {:.3e}",
                b + 1,
                num_minibatches,
                loss_val,
                grad_norm,
                optimizer.learning_rate()
            );
        }

        pb.finish_and_clear();

        if train_config.verbose && !batch_loss.is_empty() {
            let avg = batch_loss.iter().sum::<f32>() / batch_loss.len() as f32;
            info!("average training loss: {:.6}", avg);
        }

        Ok(batch_loss)
    }

    /// Accuracy and summed loss over one pass of `data` in eval mode
    pub fn evaluate<DataL>(
        &self,
        data: &mut DataL,
        train_config: &TrainConfig,
    ) -> anyhow::Result<EvalStats>
    where
        DataL: DataLoader,
    {
        let device = &train_config.device;

        data.shuffle_minibatch(train_config.batch_size)?;
        let num_minibatches = data.num_minibatch();

        let pb = ProgressBar::new(num_minibatches as u64);
        if !train_config.show_progress || train_config.verbose {
            pb.set_draw_target(ProgressDrawTarget::hidden());
        }

        let mut stats = EvalStats::default();

        for b in 0..num_minibatches {
            let mb = data.minibatch_data(b, device)?;
            let labels = mb
                .output
                .as_ref()
                .ok_or(anyhow::anyhow!("minibatch #{} has no labels", b))?;

            let logits = self.model.forward_t(&mb.input, false)?.detach();
            let loss = cross_entropy_loss(&logits, labels)?.to_scalar::<f32>()?;
            let n = labels.dim(0)?;

            stats.correct += count_correct(&logits, labels)?;
            stats.loss_sum += loss as f64 * n as f64;
            stats.total += n;
            pb.inc(1);
        }

        pb.finish_and_clear();
        Ok(stats)
    }
}
