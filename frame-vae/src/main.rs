mod checkpoint;
mod fit_vae;
mod frame_source;
mod generate_frames;
mod loss_log;
mod vae_common;

use clap::{Parser, Subcommand};
use fit_vae::*;
use generate_frames::*;
use log::info;

#[derive(Parser, Debug)]
#[command(
    version,
    about = "FRAME-VAE",
    long_about = "Variational autoencoder over video frames\n\
		  Frames are read from `.safetensors` files holding a `frames`\n\
		  tensor (T, channels, height, width) with pixel values in [0, 255]."
)]
struct Cli {
    #[command(subcommand)]
    commands: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(
        about = "Train the frame VAE",
        long_about = "Train the frame VAE until interrupted:\n\
		      (1) Start fresh from --seed, or resume with --checkpoint\n\
		      (2) Append every minibatch loss to --metrics-path\n\
		      (3) Save a checkpoint every --ckpt-interval steps.\n"
    )]
    Train(TrainArgs),

    #[command(
        about = "Generate frames from a trained model",
        long_about = "Draw latent vectors from the standard normal prior\n\
		      and decode them into frames.\n"
    )]
    Sample(GenerateArgs),

    #[command(
        about = "Reconstruct frames from the data directory",
        long_about = "Encode frames drawn from --data-dir and decode them back.\n\
		      Both the inputs and the reconstructions are written out.\n"
    )]
    Reconstruct(GenerateArgs),
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match &cli.commands {
        Commands::Train(args) => {
            run_training(args)?;
        }
        Commands::Sample(args) => {
            run_sample(args)?;
        }
        Commands::Reconstruct(args) => {
            run_reconstruct(args)?;
        }
    }

    info!("Done");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn sample_needs_a_checkpoint() {
        assert!(Cli::try_parse_from(["frame-vae", "sample"]).is_err());
        assert!(Cli::try_parse_from(["frame-vae", "sample", "--checkpoint", "10"]).is_ok());
    }

    #[test]
    fn train_resume_is_optional() {
        let cli = Cli::try_parse_from(["frame-vae", "train"]).unwrap();
        assert!(matches!(cli.commands, Commands::Train(TrainArgs { checkpoint: None, .. })));
        let cli = Cli::try_parse_from(["frame-vae", "train", "--checkpoint", "3000"]).unwrap();
        assert!(matches!(
            cli.commands,
            Commands::Train(TrainArgs {
                checkpoint: Some(3000),
                ..
            })
        ));
    }
}
