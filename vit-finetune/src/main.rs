mod finetune_common;
mod fit_finetune;
mod inspect_pretrained;
mod run_tracker;

use finetune_common::*;
use fit_finetune::*;
use inspect_pretrained::*;

#[derive(Parser, Debug)]
#[command(
    version,
    about = "ViT fine-tuning",
    long_about = "Fine-tune a pretrained Vision Transformer on CIFAR-10/100,\n\
		  in a single process or in a data-parallel group of processes.\n\
		  Downloads the binary CIFAR archive when missing and expects\n\
		  a `.npz` ViT checkpoint on disk."
)]
struct Cli {
    #[command(subcommand)]
    commands: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(
        about = "Fine-tune a pretrained ViT on CIFAR",
        long_about = "Fine-tune a pretrained Vision Transformer in the stages: \n\
		      (1) Join the process group (if distributed)\n\
		      (2) Read the CIFAR train and test splits\n\
		      (3) Load the pretrained weights with a fresh zero head\n\
		      (4) Each epoch: train, then evaluate on both splits.\n"
    )]
    Train(FinetuneArgs),

    #[command(
        about = "Load a pretrained ViT and print its size and layers",
        visible_alias = "test"
    )]
    Inspect(InspectArgs),
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match &cli.commands {
        Commands::Train(args) => {
            fit_finetune(args)?;
        }
        Commands::Inspect(args) => {
            inspect_pretrained(args)?;
        }
    }

    info!("Done");
    Ok(())
}
