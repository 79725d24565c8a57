use crate::checkpoint::*;
use crate::frame_source::*;
use crate::vae_common::*;

use anyhow::Context;
use candle_core::{Device, Tensor};
use candle_vae::candle_rng_key::RngKey;
use candle_vae::candle_vae_sampling::{reconstruct_vae, sample_vae};
use std::collections::HashMap;

#[derive(Args, Debug)]
pub struct GenerateArgs {
    #[command(flatten)]
    pub common: VaeArgs,

    #[arg(
        long,
        required = true,
        help = "Checkpoint iteration",
        long_help = "Load the model saved at this iteration:\n\
		     {checkpoint_dir}/vae-{checkpoint}.safetensors"
    )]
    pub checkpoint: usize,

    #[arg(
        long,
        alias = "checkpoint_dir",
        help = "Checkpoint directory (default: --ckpt-dir)"
    )]
    pub checkpoint_dir: Option<PathBuf>,

    #[arg(
        long,
        short,
        help = "Output file",
        long_help = "Output `.safetensors` file.\n\
		     Generated frames are stored under `frames`;\n\
		     reconstruction also stores its input under `inputs`."
    )]
    pub out: Option<PathBuf>,
}

impl GenerateArgs {
    fn load_state(&self, dev: &Device) -> anyhow::Result<FrameTrainingState> {
        let dir = self
            .checkpoint_dir
            .as_deref()
            .unwrap_or(&self.common.ckpt_dir);
        let path = checkpoint_path(dir, self.checkpoint, VAE_TAG);
        let state = load_checkpoint(&path, dev)
            .with_context(|| format!("cannot load model from {}", path.display()))?;
        info!("loaded {} (iteration {})", path.display(), state.iteration);
        Ok(state)
    }

    fn n_samples(&self) -> anyhow::Result<usize> {
        if self.common.n_samples == 0 {
            anyhow::bail!("number of samples must be positive");
        }
        Ok(self.common.n_samples)
    }

    fn out_file(&self, default: &str) -> PathBuf {
        self.out.clone().unwrap_or_else(|| PathBuf::from(default))
    }
}

/// Decode draws from the latent prior of a trained model
pub fn run_sample(args: &GenerateArgs) -> anyhow::Result<()> {
    init_logger(args.common.verbose);
    let n_samples = args.n_samples()?;
    let dev = args.common.device()?;
    let state = args.load_state(&dev)?;

    let frames = sample_vae(&state.model, n_samples, RngKey::new(args.common.seed), &dev)?;

    let out = args.out_file("vae_samples.safetensors");
    write_frames(&out, vec![(FRAMES_KEY, frames)])?;
    info!("wrote {} samples to {}", n_samples, out.display());
    Ok(())
}

/// Encode and decode frames drawn from the data directory
pub fn run_reconstruct(args: &GenerateArgs) -> anyhow::Result<()> {
    init_logger(args.common.verbose);
    let n_samples = args.n_samples()?;
    let dev = args.common.device()?;
    let state = args.load_state(&dev)?;

    let (data_key, recon_key) = RngKey::new(args.common.seed).split();
    let mut source = FrameFileSource::new(
        &args.common.data_dir,
        n_samples,
        state.model.config().frame_dims(),
        args.common.cache_files,
        data_key,
    )?;
    let x_nchw = source.next_batch()?.to_device(&dev)?;

    let frames = reconstruct_vae(&state.model, &x_nchw, recon_key)?;

    let out = args.out_file("vae_reconstructions.safetensors");
    write_frames(&out, vec![(FRAMES_KEY, frames), ("inputs", x_nchw)])?;
    info!("wrote {} reconstructions to {}", n_samples, out.display());
    Ok(())
}

fn write_frames(out: &Path, named: Vec<(&str, Tensor)>) -> anyhow::Result<()> {
    if let Some(dir) = out.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)?;
    }
    let mut tensors = HashMap::new();
    for (name, x) in named {
        tensors.insert(name.to_string(), x.to_device(&Device::Cpu)?);
    }
    candle_core::safetensors::save(&tensors, out)
        .with_context(|| format!("failed to write {}", out.display()))?;
    Ok(())
}
