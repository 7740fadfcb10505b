pub mod candle_classifier_inference;
pub mod candle_data_loader;
pub mod candle_inference;
pub mod candle_loss_functions;
pub mod candle_lr_schedule;
pub mod candle_model_traits;
pub mod candle_optim;

pub use candle_core;
pub use candle_nn;
