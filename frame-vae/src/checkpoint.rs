use anyhow::{bail, Context};
use candle_vae::candle_core::{self, Device, Tensor};
use candle_vae::candle_model_traits::ParameterSetT;
use candle_vae::candle_optim_chain::{OptimizerState, StageState};
use candle_vae::candle_rng_key::RngKey;
use candle_vae::candle_vae::{make_frame_vae, FrameVae, FrameVaeConfig};
use candle_vae::candle_vae_inference::TrainingState;
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

pub type FrameTrainingState = TrainingState<FrameVae>;

/// Tag of checkpoints written by `frame-vae train`
pub const VAE_TAG: &str = "vae";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
enum StageMeta {
    Adam { count: usize },
    Empty,
}

/// Everything but the tensors
#[derive(Serialize, Deserialize, Debug, Clone)]
struct CheckpointMeta {
    iteration: usize,
    rng: RngKey,
    model: FrameVaeConfig,
    stages: Vec<StageMeta>,
}

/// `{dir}/{tag}-{iteration}`; the files add `.safetensors` and `.json`
pub fn checkpoint_path(dir: &Path, iteration: usize, tag: &str) -> PathBuf {
    dir.join(format!("{}-{}", tag, iteration))
}

fn with_suffix(path: &Path, ext: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".");
    name.push(ext);
    PathBuf::from(name)
}

fn param_key(name: &str) -> String {
    format!("param.{}", name)
}

fn moment_key(stage: usize, moment: &str, name: &str) -> String {
    format!("opt.{}.{}.{}", stage, moment, name)
}

/// Write the training state next to `path`
///
/// * `{path}.safetensors` - parameters and optimizer moments
/// * `{path}.json` - iteration, random key, model shape, stage counts
///
/// The json file is written last, so its presence marks a complete
/// checkpoint.
pub fn save_checkpoint(state: &FrameTrainingState, path: &Path) -> anyhow::Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
    }

    let params = state.model.named_vars()?;
    let mut tensors: HashMap<String, Tensor> = HashMap::new();

    for (name, var) in params.iter() {
        tensors.insert(param_key(name), var.as_tensor().detach());
    }

    let mut stages = Vec::with_capacity(state.opt_state.stages.len());
    for (j, stage) in state.opt_state.stages.iter().enumerate() {
        match stage {
            StageState::Adam { count, mu, nu } => {
                if mu.len() != params.len() || nu.len() != params.len() {
                    bail!(
                        "stage {} holds {} moments for {} parameters",
                        j,
                        mu.len(),
                        params.len()
                    );
                }
                for ((name, _), (m, v)) in params.iter().zip(mu.iter().zip(nu.iter())) {
                    tensors.insert(moment_key(j, "mu", name), m.detach());
                    tensors.insert(moment_key(j, "nu", name), v.detach());
                }
                stages.push(StageMeta::Adam { count: *count });
            }
            StageState::Empty => stages.push(StageMeta::Empty),
        }
    }

    let tensor_file = with_suffix(path, "safetensors");
    candle_core::safetensors::save(&tensors, &tensor_file)
        .with_context(|| format!("failed to write {}", tensor_file.display()))?;

    let meta = CheckpointMeta {
        iteration: state.iteration,
        rng: state.rng,
        model: state.model.config().clone(),
        stages,
    };
    let meta_file = with_suffix(path, "json");
    std::fs::write(&meta_file, serde_json::to_string_pretty(&meta)?)
        .with_context(|| format!("failed to write {}", meta_file.display()))?;

    debug!("wrote {} tensors to {}", tensors.len(), tensor_file.display());
    Ok(())
}

/// Read back a state written by `save_checkpoint`
///
/// Missing files, missing tensors, and shape mismatches are errors;
/// nothing falls back to fresh values.
pub fn load_checkpoint(path: &Path, dev: &Device) -> anyhow::Result<FrameTrainingState> {
    let meta_file = with_suffix(path, "json");
    let meta_str = std::fs::read_to_string(&meta_file)
        .with_context(|| format!("failed to read checkpoint {}", meta_file.display()))?;
    let meta: CheckpointMeta = serde_json::from_str(&meta_str)
        .with_context(|| format!("corrupt checkpoint {}", meta_file.display()))?;

    let tensor_file = with_suffix(path, "safetensors");
    let mut tensors = candle_core::safetensors::load(&tensor_file, dev)
        .with_context(|| format!("failed to read checkpoint {}", tensor_file.display()))?;

    let mut take = |key: String, like: &Tensor| -> anyhow::Result<Tensor> {
        let t = tensors
            .remove(&key)
            .with_context(|| format!("{} has no tensor {}", tensor_file.display(), key))?;
        if t.shape() != like.shape() {
            bail!(
                "{}: {} has shape {:?}, expected {:?}",
                tensor_file.display(),
                key,
                t.shape(),
                like.shape()
            );
        }
        Ok(t)
    };

    // every variable is overwritten below
    let model = make_frame_vae(&meta.model, RngKey::new(0), dev)?;
    let params = model.named_vars()?;

    for (name, var) in params.iter() {
        let t = take(param_key(name), var.as_tensor())?;
        var.set(&t)?;
    }

    let mut stages = Vec::with_capacity(meta.stages.len());
    for (j, stage) in meta.stages.iter().enumerate() {
        match stage {
            StageMeta::Adam { count } => {
                let mut mu = Vec::with_capacity(params.len());
                let mut nu = Vec::with_capacity(params.len());
                for (name, var) in params.iter() {
                    mu.push(take(moment_key(j, "mu", name), var.as_tensor())?);
                    nu.push(take(moment_key(j, "nu", name), var.as_tensor())?);
                }
                stages.push(StageState::Adam {
                    count: *count,
                    mu,
                    nu,
                });
            }
            StageMeta::Empty => stages.push(StageState::Empty),
        }
    }

    Ok(TrainingState {
        model,
        opt_state: OptimizerState { stages },
        rng: meta.rng,
        iteration: meta.iteration,
    })
}
