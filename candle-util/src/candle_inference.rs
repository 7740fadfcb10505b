pub struct TrainConfig {
    pub learning_rate: f64,
    pub batch_size: usize,
    pub num_epochs: usize,
    pub max_grad_norm: f64,
    pub device: candle_core::Device,
    pub verbose: bool,
    pub show_progress: bool,
}

/// Sums collected over one pass of evaluation
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct EvalStats {
    pub correct: usize,
    pub total: usize,
    pub loss_sum: f64,
}

impl EvalStats {
    pub fn accuracy(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.correct as f64 / self.total as f64
        }
    }

    pub fn mean_loss(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.loss_sum / self.total as f64
        }
    }
}
