use crate::checkpoint::*;
use crate::frame_source::*;
use crate::loss_log::LossLog;
use crate::vae_common::*;

use anyhow::Context;
use candle_core::Device;
use candle_vae::candle_loss_functions::vae_loss;
use candle_vae::candle_optim_chain::OptimizerChain;
use candle_vae::candle_rng_key::RngKey;
use candle_vae::candle_vae::make_frame_vae;
use candle_vae::candle_vae_inference::{update_state, TrainingState};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};

#[derive(Args, Debug)]
pub struct TrainArgs {
    #[command(flatten)]
    pub common: VaeArgs,

    #[arg(
        long,
        help = "Resume from this iteration",
        long_help = "Resume training from the checkpoint saved at this iteration\n\
		     under --ckpt-dir. Without it, training starts from\n\
		     parameters drawn from --seed."
    )]
    pub checkpoint: Option<usize>,
}

/// Where and how often the loop persists its state
pub struct CheckpointPolicy<'a> {
    pub dir: &'a Path,
    pub interval: usize,
    pub tag: &'a str,
}

/// Keys of one training run, all split from the run's seed
pub struct RunKeys {
    /// draws the initial parameters
    pub init: RngKey,
    /// the fresh state's key
    pub state: RngKey,
    data: RngKey,
}

impl RunKeys {
    pub fn new(seed: u64) -> Self {
        let (init, rest) = RngKey::new(seed).split();
        let (state, data) = rest.split();
        Self { init, state, data }
    }

    /// Picks frames for a run starting at `iteration`
    pub fn data(&self, iteration: usize) -> RngKey {
        self.data.fold_in(iteration as u64)
    }
}

/// Train until interrupted
///
/// A fresh run initializes parameters and the state's key from
/// `seed`. A resumed run loads the checkpoint; failing to load it is
/// fatal. Data are drawn from a separate key folded with the starting
/// iteration, so resuming does not replay the same batches.
pub fn run_training(args: &TrainArgs) -> anyhow::Result<()> {
    let common = &args.common;
    init_logger(common.verbose);
    common.check()?;

    let dev = common.device()?;
    let optimizer = common.optimizer();
    let keys = RunKeys::new(common.seed);

    let state = match args.checkpoint {
        Some(iteration) => {
            let path = checkpoint_path(&common.ckpt_dir, iteration, VAE_TAG);
            let state = load_checkpoint(&path, &dev)
                .with_context(|| format!("cannot resume from {}", path.display()))?;
            if state.model.config() != &common.model_config() {
                warn!(
                    "checkpoint model {:?} differs from the command line; keeping the checkpoint's",
                    state.model.config()
                );
            }
            info!("resumed from {} at iteration {}", path.display(), state.iteration);
            state
        }
        None => {
            let vae = make_frame_vae(&common.model_config(), keys.init, &dev)?;
            TrainingState::fresh(vae, &optimizer, keys.state)?
        }
    };

    let mut loss_log = LossLog::create(&common.metrics_path)?;

    let frames = FrameFileSource::new(
        &common.data_dir,
        common.batch_size,
        state.model.config().frame_dims(),
        common.cache_files,
        keys.data(state.iteration),
    )?;

    let mut source: Box<dyn FrameSource> = if common.prefetch > 0 {
        Box::new(PrefetchSource::spawn(frames, common.prefetch))
    } else {
        Box::new(frames)
    };

    let ckpt = CheckpointPolicy {
        dir: &common.ckpt_dir,
        interval: common.ckpt_interval,
        tag: VAE_TAG,
    };

    info!("Start training VAE...");
    train_loop(state, source.as_mut(), &optimizer, &mut loss_log, &ckpt, &dev, None)?;
    Ok(())
}

/// Run update steps, logging every loss and saving periodic
/// checkpoints
///
/// * `state` - where to start
/// * `source` - minibatches; running dry is fatal
/// * `optimizer` - the chain `state.opt_state` belongs to
/// * `loss_log` - gets one line per step
/// * `ckpt` - a step whose starting iteration `i` satisfies
///   `i % interval == interval - 1` saves the updated state under
///   `{tag}-{i + 1}`
/// * `dev` - where batches are moved before each step
/// * `max_iters` - stop after this many steps; `None` runs forever
///
/// # Returns the last state
pub fn train_loop(
    mut state: FrameTrainingState,
    source: &mut dyn FrameSource,
    optimizer: &OptimizerChain,
    loss_log: &mut LossLog,
    ckpt: &CheckpointPolicy,
    dev: &Device,
    max_iters: Option<usize>,
) -> anyhow::Result<FrameTrainingState> {
    if ckpt.interval == 0 {
        anyhow::bail!("checkpoint interval must be positive");
    }

    let pb = match max_iters {
        Some(n) => ProgressBar::new(n as u64),
        None => ProgressBar::new_spinner(),
    };
    pb.set_style(ProgressStyle::with_template(
        "{spinner} [{elapsed_precise}] {pos} steps {msg}",
    )?);

    let verbose = log::log_enabled!(log::Level::Info);
    if verbose {
        pb.set_draw_target(ProgressDrawTarget::hidden());
    }

    let mut steps = 0;
    while max_iters.map_or(true, |n| steps < n) {
        let batch = source
            .next_batch()
            .context("failed to load a minibatch")?
            .to_device(dev)?;

        let index = state.iteration;
        let (loss, next_state) = update_state(state, &batch, optimizer, vae_loss)?;
        state = next_state;

        loss_log.append(loss)?;

        if index % ckpt.interval == ckpt.interval - 1 {
            let path = checkpoint_path(ckpt.dir, state.iteration, ckpt.tag);
            save_checkpoint(&state, &path)?;
            info!("saved checkpoint {}", path.display());
        }

        if verbose {
            info!("[{}] {}", state.iteration, loss);
        }
        pb.inc(1);
        pb.set_message(format!("loss {:.4}", loss));
        steps += 1;
    }

    pb.finish_and_clear();
    Ok(state)
}
