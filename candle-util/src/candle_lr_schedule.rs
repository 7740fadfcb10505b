use candle_core::backprop::GradStore;
use candle_core::Result;
use candle_nn::Optimizer;

/// A multiplicative factor on the base learning rate per step
pub trait LrSchedule {
    fn lr_lambda(&self, step: usize) -> f64;
}

/// Linear warm-up from 0 to 1 over `warmup_steps`, followed by
/// either a linear or a cosine decay to 0 at `total_steps`
#[derive(Clone, Debug, PartialEq)]
pub enum WarmupSchedule {
    Linear {
        warmup_steps: usize,
        total_steps: usize,
    },
    Cosine {
        warmup_steps: usize,
        total_steps: usize,
        cycles: f64,
    },
}

impl WarmupSchedule {
    pub fn linear(warmup_steps: usize, total_steps: usize) -> Self {
        Self::Linear {
            warmup_steps,
            total_steps,
        }
    }

    /// half a cosine period by default
    pub fn cosine(warmup_steps: usize, total_steps: usize) -> Self {
        Self::Cosine {
            warmup_steps,
            total_steps,
            cycles: 0.5,
        }
    }

    fn warmup_steps(&self) -> usize {
        match self {
            Self::Linear { warmup_steps, .. } | Self::Cosine { warmup_steps, .. } => *warmup_steps,
        }
    }
}

impl LrSchedule for WarmupSchedule {
    fn lr_lambda(&self, step: usize) -> f64 {
        let warmup = self.warmup_steps();
        if step < warmup {
            return step as f64 / warmup.max(1) as f64;
        }

        match *self {
            Self::Linear { total_steps, .. } => {
                let remain = total_steps as f64 - step as f64;
                let span = total_steps.saturating_sub(warmup).max(1) as f64;
                (remain / span).max(0.0)
            }
            Self::Cosine {
                total_steps,
                cycles,
                ..
            } => {
                let span = total_steps.saturating_sub(warmup).max(1) as f64;
                let progress = (step - warmup) as f64 / span;
                let angle = std::f64::consts::PI * cycles * 2.0 * progress;
                (0.5 * (1.0 + angle.cos())).max(0.0)
            }
        }
    }
}

/// An optimizer whose learning rate follows `base_lr * lr_lambda(step)`;
/// the schedule advances once per optimizer step
pub struct ScheduledOptimizer<O, S>
where
    O: Optimizer,
    S: LrSchedule,
{
    optimizer: O,
    schedule: S,
    base_lr: f64,
    num_steps: usize,
}

impl<O, S> ScheduledOptimizer<O, S>
where
    O: Optimizer,
    S: LrSchedule,
{
    pub fn new(mut optimizer: O, schedule: S) -> Self {
        let base_lr = optimizer.learning_rate();
        optimizer.set_learning_rate(base_lr * schedule.lr_lambda(0));
        Self {
            optimizer,
            schedule,
            base_lr,
            num_steps: 0,
        }
    }

    pub fn step(&mut self, grads: &GradStore) -> Result<()> {
        self.optimizer.step(grads)?;
        self.num_steps += 1;
        let lr = self.base_lr * self.schedule.lr_lambda(self.num_steps);
        self.optimizer.set_learning_rate(lr);
        Ok(())
    }

    pub fn learning_rate(&self) -> f64 {
        self.optimizer.learning_rate()
    }

    pub fn num_steps(&self) -> usize {
        self.num_steps
    }

    pub fn optimizer(&self) -> &O {
        &self.optimizer
    }
}
