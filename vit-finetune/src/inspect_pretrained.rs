use crate::finetune_common::*;

use candle_core::DType;
use candle_nn::{VarBuilder, VarMap};
use std::path::Path;
use vit_model::vit_pretrained::{count_parameters_millions, load_pretrained_npz};
use vit_model::{ViTConfig, VisionTransformer};

#[derive(Args, Debug)]
pub struct InspectArgs {
    #[arg(
        long,
        default_value = DEFAULT_PRETRAINED,
        help = "Pretrained checkpoint",
        long_help = "Pretrained Vision Transformer weights (.npz)."
    )]
    pretrained_dir: Box<str>,

    #[arg(
        long,
        default_value = DEFAULT_MODEL_TYPE,
        help = "Vision Transformer configuration"
    )]
    model_type: Box<str>,

    #[arg(long, default_value_t = DEFAULT_IMG_SIZE, help = "Resolution size")]
    img_size: usize,

    #[arg(long, default_value_t = 10, help = "Number of output classes")]
    num_classes: usize,

    #[arg(
        long,
        short,
        help = "Verbosity",
        long_help = "Enable verbose output.\n\
		     Prints additional information during execution."
    )]
    verbose: bool,
}

/// Build a zero-head model, load the checkpoint and print the model
pub fn inspect_pretrained(args: &InspectArgs) -> anyhow::Result<()> {
    init_logger(args.verbose);

    let config = ViTConfig::from_name(&args.model_type)?;
    info!("Vision Transformer configuration: {}", config);

    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &candle_core::Device::Cpu);
    let model = VisionTransformer::new(&config, args.img_size, args.num_classes, true, vb)?;
    load_pretrained_npz(&varmap, Path::new(args.pretrained_dir.as_ref()), &config, true)?;

    info!(
        "Vision Transformer model size = {:.2}M",
        count_parameters_millions(&varmap)
    );
    println!("{}", model);
    Ok(())
}
