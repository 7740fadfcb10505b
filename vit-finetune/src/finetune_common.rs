pub use clap::{Args, Parser, Subcommand, ValueEnum};
pub use log::info;

pub use candle_util::{candle_core, candle_nn};

use serde::Serialize;

pub const DEFAULT_MODEL_TYPE: &str = "ViT-B_16";
pub const DEFAULT_PRETRAINED: &str = "pretrained/ViT-B_16.npz";
pub const DEFAULT_IMG_SIZE: usize = 224;
pub const MAX_GRAD_NORM: f64 = 1.0;

#[derive(ValueEnum, Clone, Debug, PartialEq, Serialize)]
#[clap(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ComputeDevice {
    Cpu,
    Cuda,
    Metal,
}

#[derive(ValueEnum, Clone, Debug, PartialEq, Serialize)]
#[clap(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum OptimizerKind {
    Sgd,
    Adam,
}

#[derive(ValueEnum, Clone, Debug, PartialEq, Serialize)]
#[clap(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum DecayType {
    Cosine,
    Linear,
}

pub fn init_logger(verbose: bool) {
    if verbose {
        std::env::set_var("RUST_LOG", "info");
    }
    env_logger::init();
}

pub fn new_device(device: &ComputeDevice, ordinal: usize) -> anyhow::Result<candle_core::Device> {
    let dev = match device {
        ComputeDevice::Metal => candle_core::Device::new_metal(ordinal)?,
        ComputeDevice::Cuda => candle_core::Device::new_cuda(ordinal)?,
        _ => candle_core::Device::Cpu,
    };
    Ok(dev)
}

pub fn host_name() -> String {
    nix::unistd::gethostname()
        .ok()
        .map(|name| name.to_string_lossy().into_owned())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

/// File name of the running executable
pub fn process_name() -> String {
    std::env::current_exe()
        .ok()
        .and_then(|path| path.file_name().map(|f| f.to_string_lossy().into_owned()))
        .or_else(|| std::env::args().next())
        .unwrap_or_else(|| "vit-finetune".to_string())
}
