use anyhow::{anyhow, bail, Context};
use candle_vae::candle_core::{self, DType, Device, Tensor};
use candle_vae::candle_rng_key::RngKey;
use log::{debug, info};
use rand::rngs::StdRng;
use rand::Rng;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{sync_channel, Receiver};
use std::thread::JoinHandle;

/// Tensor name of the frame stack inside each data file
pub const FRAMES_KEY: &str = "frames";

/// An endless supply of minibatches
pub trait FrameSource {
    /// Next `(batch, channels, height, width)` f32 tensor on the cpu
    fn next_batch(&mut self) -> anyhow::Result<Tensor>;
}

///
/// Frames pre-extracted into `*.safetensors` files, each holding a
/// `frames` tensor of shape (T, C, H, W). A batch picks a file and a
/// frame uniformly at random, one frame at a time. Files are read on
/// demand; at most `cache_files` of them stay decoded, least recently
/// used first out.
///
pub struct FrameFileSource {
    files: Vec<PathBuf>,
    cache: VecDeque<(usize, Tensor)>,
    cache_files: usize,
    batch_size: usize,
    frame_dims: (usize, usize, usize),
    rng: StdRng,
}

impl FrameFileSource {
    /// * `data_dir` - directory of `.safetensors` frame files
    /// * `batch_size` - frames per batch
    /// * `frame_dims` - expected (channels, height, width)
    /// * `cache_files` - decoded files kept in memory
    /// * `key` - drives the choice of frames
    pub fn new(
        data_dir: &Path,
        batch_size: usize,
        frame_dims: (usize, usize, usize),
        cache_files: usize,
        key: RngKey,
    ) -> anyhow::Result<Self> {
        if batch_size == 0 {
            bail!("batch size must be positive");
        }
        if cache_files == 0 {
            bail!("frame cache must hold at least one file");
        }

        let mut files = std::fs::read_dir(data_dir)
            .with_context(|| format!("failed to list {}", data_dir.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "safetensors"))
            .collect::<Vec<_>>();

        if files.is_empty() {
            bail!("no .safetensors frame files in {}", data_dir.display());
        }
        files.sort();

        info!("{} frame files in {}", files.len(), data_dir.display());

        Ok(Self {
            files,
            cache: VecDeque::with_capacity(cache_files),
            cache_files,
            batch_size,
            frame_dims,
            rng: key.rng(),
        })
    }

    fn frames(&mut self, file_idx: usize) -> anyhow::Result<Tensor> {
        if let Some(pos) = self.cache.iter().position(|(idx, _)| *idx == file_idx) {
            if let Some(hit) = self.cache.remove(pos) {
                let frames = hit.1.clone();
                self.cache.push_back(hit);
                return Ok(frames);
            }
        }

        let path = &self.files[file_idx];
        let mut tensors = candle_core::safetensors::load(path, &Device::Cpu)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let frames = tensors
            .remove(FRAMES_KEY)
            .with_context(|| format!("{} has no `{}` tensor", path.display(), FRAMES_KEY))?;

        let (c, h, w) = self.frame_dims;
        match frames.dims() {
            &[t, cc, hh, ww] if t > 0 && (cc, hh, ww) == (c, h, w) => {}
            dims => bail!(
                "{}: frames of shape {:?}, expected (T, {}, {}, {})",
                path.display(),
                dims,
                c,
                h,
                w
            ),
        }

        let frames = frames.to_dtype(DType::F32)?;
        debug!("loaded {} frames from {}", frames.dim(0)?, path.display());
        if self.cache.len() >= self.cache_files {
            self.cache.pop_front();
        }
        self.cache.push_back((file_idx, frames.clone()));
        Ok(frames)
    }
}

impl FrameSource for FrameFileSource {
    fn next_batch(&mut self) -> anyhow::Result<Tensor> {
        let mut rows = Vec::with_capacity(self.batch_size);
        for _ in 0..self.batch_size {
            let file_idx = self.rng.random_range(0..self.files.len());
            let frames = self.frames(file_idx)?;
            let t = self.rng.random_range(0..frames.dim(0)?);
            rows.push(frames.narrow(0, t, 1)?);
        }
        Ok(Tensor::cat(&rows, 0)?)
    }
}

///
/// Runs another source on a background thread, keeping up to `depth`
/// batches ready. The thread stops after forwarding the first error,
/// or once this value is dropped.
///
pub struct PrefetchSource {
    receiver: Option<Receiver<anyhow::Result<Tensor>>>,
    handle: Option<JoinHandle<()>>,
}

impl PrefetchSource {
    pub fn spawn<S>(mut source: S, depth: usize) -> Self
    where
        S: FrameSource + Send + 'static,
    {
        let (sender, receiver) = sync_channel(depth);

        let handle = std::thread::spawn(move || loop {
            let batch = source.next_batch();
            let failed = batch.is_err();
            if sender.send(batch).is_err() || failed {
                break;
            }
        });

        Self {
            receiver: Some(receiver),
            handle: Some(handle),
        }
    }
}

impl FrameSource for PrefetchSource {
    fn next_batch(&mut self) -> anyhow::Result<Tensor> {
        let receiver = self
            .receiver
            .as_ref()
            .ok_or_else(|| anyhow!("frame loader already closed"))?;
        receiver
            .recv()
            .map_err(|_| anyhow!("frame loader thread stopped"))?
    }
}

impl Drop for PrefetchSource {
    fn drop(&mut self) {
        // a producer blocked on `send` wakes up with an error
        self.receiver.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::warn!("frame loader thread panicked");
            }
        }
    }
}
