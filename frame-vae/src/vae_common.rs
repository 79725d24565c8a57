pub use candle_vae::candle_core;
pub use clap::{Args, ValueEnum};
pub use log::{info, warn};
pub use std::path::{Path, PathBuf};

use candle_vae::candle_optim_chain::OptimizerChain;
use candle_vae::candle_vae::FrameVaeConfig;

#[derive(ValueEnum, Clone, Debug, PartialEq)]
#[clap(rename_all = "lowercase")]
pub enum ComputeDevice {
    Cpu,
    Cuda,
    Metal,
}

/// Options shared by every subcommand
#[derive(Args, Debug, Clone)]
pub struct VaeArgs {
    #[arg(
        long,
        default_value_t = 0,
        help = "Random seed",
        long_help = "Random seed.\n\
		     Parameter initialization, latent sampling, and batch\n\
		     selection are all derived from this one number."
    )]
    pub seed: u64,

    #[arg(
        long,
        default_value_t = 32,
        help = "Latent dimension",
        long_help = "Number of latent variables per frame."
    )]
    pub n_latent: usize,

    #[arg(
        long,
        default_value_t = 1,
        help = "Network width multiplier",
        long_help = "Scale the channel count of every convolution stage.\n\
		     Stage j has (16 << j) * multiplier channels."
    )]
    pub size_multiplier: usize,

    #[arg(
        long,
        default_value_t = 3,
        help = "Frame channels",
        long_help = "Number of colour channels in each frame."
    )]
    pub frame_channels: usize,

    #[arg(
        long,
        default_value_t = 64,
        help = "Frame height",
        long_help = "Frame height in pixels.\n\
		     Must be a positive multiple of 8."
    )]
    pub frame_height: usize,

    #[arg(
        long,
        default_value_t = 64,
        help = "Frame width",
        long_help = "Frame width in pixels.\n\
		     Must be a positive multiple of 8."
    )]
    pub frame_width: usize,

    #[arg(
        long,
        default_value = "checkpoints",
        help = "Checkpoint directory",
        long_help = "Directory of checkpoints:\n\
		     - {ckpt_dir}/vae-{iteration}.safetensors\n\
		     - {ckpt_dir}/vae-{iteration}.json\n"
    )]
    pub ckpt_dir: PathBuf,

    #[arg(
        long,
        default_value_t = 1000,
        help = "Checkpoint interval",
        long_help = "Save a checkpoint every {ckpt_interval} update steps."
    )]
    pub ckpt_interval: usize,

    #[arg(
        long,
        default_value_t = 1e-4,
        help = "Learning rate",
        long_help = "Learning rate for optimization.\n\
		     Controls the step size for parameter updates."
    )]
    pub learning_rate: f64,

    #[arg(
        long,
        default_value_t = 1.0,
        help = "Gradient clipping bound",
        long_help = "Updates are rescaled jointly whenever their\n\
		     global L2 norm exceeds this bound."
    )]
    pub clip_norm: f64,

    #[arg(
        long,
        default_value = "metrics/vae_loss.txt",
        help = "Loss log file",
        long_help = "Append one loss value per update step to this file."
    )]
    pub metrics_path: PathBuf,

    #[arg(
        long,
        default_value_t = 32,
        help = "Minibatch size",
        long_help = "Number of frames per update step."
    )]
    pub batch_size: usize,

    #[arg(
        long,
        default_value_t = 16,
        help = "Number of frames to sample or reconstruct"
    )]
    pub n_samples: usize,

    #[arg(
        long,
        default_value = "data",
        help = "Frame data directory",
        long_help = "Directory of `.safetensors` files.\n\
		     Each file holds a `frames` tensor of shape\n\
		     (T, channels, height, width) with pixel values in [0, 255]."
    )]
    pub data_dir: PathBuf,

    #[arg(
        long,
        default_value_t = 4,
        help = "Prefetched batches",
        long_help = "Number of batches loaded ahead of training\n\
		     by a background thread. 0 loads on the training thread."
    )]
    pub prefetch: usize,

    #[arg(
        long,
        default_value_t = 8,
        help = "Decoded frame files kept in memory",
        long_help = "Number of decoded frame files kept in memory.\n\
		     Beyond this, the least recently used file is dropped\n\
		     and read again when a later batch needs it."
    )]
    pub cache_files: usize,

    #[arg(
        long,
        value_enum,
        default_value = "cpu",
        help = "Candle device",
        long_help = "Candle device to use for computation.\n\
		     Options: cpu, cuda, metal."
    )]
    pub device: ComputeDevice,

    #[arg(
        long,
        default_value_t = 0,
        help = "A device for cuda",
        long_help = "For cuda or metal, we may want to choose a different device."
    )]
    pub device_no: usize,

    #[arg(
        long,
        short,
        help = "Verbosity",
        long_help = "Enable verbose output.\n\
		     Prints per-step losses instead of a progress spinner."
    )]
    pub verbose: bool,
}

impl VaeArgs {
    pub fn model_config(&self) -> FrameVaeConfig {
        FrameVaeConfig {
            n_latent: self.n_latent,
            channels: self.frame_channels,
            height: self.frame_height,
            width: self.frame_width,
            size_multiplier: self.size_multiplier,
        }
    }

    pub fn optimizer(&self) -> OptimizerChain {
        OptimizerChain::adam_zero_nans_clip(self.learning_rate, self.clip_norm)
    }

    /// Reject settings that cannot run before touching any file
    pub fn check(&self) -> anyhow::Result<()> {
        self.model_config().check()?;
        if self.ckpt_interval == 0 {
            anyhow::bail!("checkpoint interval must be positive");
        }
        if self.batch_size == 0 {
            anyhow::bail!("batch size must be positive");
        }
        if self.cache_files == 0 {
            anyhow::bail!("--cache-files must be positive");
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.) {
            anyhow::bail!("learning rate must be positive, got {}", self.learning_rate);
        }
        if !(self.clip_norm.is_finite() && self.clip_norm > 0.) {
            anyhow::bail!("clip norm must be positive, got {}", self.clip_norm);
        }
        Ok(())
    }

    pub fn device(&self) -> anyhow::Result<candle_core::Device> {
        Ok(match self.device {
            ComputeDevice::Metal => candle_core::Device::new_metal(self.device_no)?,
            ComputeDevice::Cuda => candle_core::Device::new_cuda(self.device_no)?,
            _ => candle_core::Device::Cpu,
        })
    }
}

/// Logs at `info` when verbose, otherwise whatever `RUST_LOG` says
/// (`warn` by default)
pub fn init_logger(verbose: bool) {
    let level = if verbose { "info" } else { "warn" };
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .try_init();
}
