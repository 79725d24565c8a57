use candle_core::{Result, Tensor, Var};

/// One stage of a gradient transformation chain
#[derive(Clone, Debug, PartialEq)]
pub enum TransformStage {
    /// Bias-corrected first and second moment rescaling
    ScaleByAdam { b1: f64, b2: f64, eps: f64 },
    /// Multiply every update by a constant
    Scale(f64),
    /// Replace NaN and ±Inf entries by zero
    ZeroNonFinite,
    /// Rescale all updates jointly when their global L2 norm
    /// exceeds the bound
    ClipByGlobalNorm(f64),
}

/// Per-stage state, aligned with the parameter order
#[derive(Clone, Debug)]
pub enum StageState {
    Adam {
        count: usize,
        mu: Vec<Tensor>,
        nu: Vec<Tensor>,
    },
    Empty,
}

#[derive(Clone, Debug)]
pub struct OptimizerState {
    pub stages: Vec<StageState>,
}

/// An ordered list of transform stages applied left to right
#[derive(Clone, Debug)]
pub struct OptimizerChain {
    stages: Vec<TransformStage>,
}

impl OptimizerChain {
    pub fn new(stages: Vec<TransformStage>) -> Self {
        Self { stages }
    }

    /// adam(lr) → zero non-finite → clip by global norm
    pub fn adam_zero_nans_clip(learning_rate: f64, clip_norm: f64) -> Self {
        Self::new(vec![
            TransformStage::ScaleByAdam {
                b1: 0.9,
                b2: 0.999,
                eps: 1e-8,
            },
            TransformStage::Scale(-learning_rate),
            TransformStage::ZeroNonFinite,
            TransformStage::ClipByGlobalNorm(clip_norm),
        ])
    }

    /// Fresh state for `params`: zero moments, zero counts
    pub fn init(&self, params: &[(String, Var)]) -> Result<OptimizerState> {
        let stages = self
            .stages
            .iter()
            .map(|stage| match stage {
                TransformStage::ScaleByAdam { .. } => {
                    let mu = params
                        .iter()
                        .map(|(_, v)| v.as_tensor().zeros_like())
                        .collect::<Result<Vec<_>>>()?;
                    let nu = mu.clone();
                    Ok(StageState::Adam { count: 0, mu, nu })
                }
                _ => Ok(StageState::Empty),
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(OptimizerState { stages })
    }

    /// Fold `grads` through every stage
    ///
    /// # Returns `(updates, new_state)`; `updates` are to be added to
    /// the parameters
    pub fn update(
        &self,
        grads: Vec<Tensor>,
        state: OptimizerState,
    ) -> Result<(Vec<Tensor>, OptimizerState)> {
        if state.stages.len() != self.stages.len() {
            candle_core::bail!(
                "optimizer state has {} stages, chain has {}",
                state.stages.len(),
                self.stages.len()
            );
        }

        let mut updates = grads;
        let mut next_states = Vec::with_capacity(self.stages.len());

        for (stage, stage_state) in self.stages.iter().zip(state.stages) {
            let (u, s) = apply_stage(stage, updates, stage_state)?;
            updates = u;
            next_states.push(s);
        }

        Ok((
            updates,
            OptimizerState {
                stages: next_states,
            },
        ))
    }
}

fn apply_stage(
    stage: &TransformStage,
    updates: Vec<Tensor>,
    state: StageState,
) -> Result<(Vec<Tensor>, StageState)> {
    match (stage, state) {
        (&TransformStage::ScaleByAdam { b1, b2, eps }, StageState::Adam { count, mu, nu }) => {
            scale_by_adam(updates, count, mu, nu, b1, b2, eps)
        }
        (TransformStage::ScaleByAdam { .. }, StageState::Empty) => {
            candle_core::bail!("adam stage without moment state")
        }
        (&TransformStage::Scale(s), state) => {
            let u = updates
                .iter()
                .map(|u| u.affine(s, 0.))
                .collect::<Result<Vec<_>>>()?;
            Ok((u, state))
        }
        (TransformStage::ZeroNonFinite, state) => {
            let u = updates
                .iter()
                .map(zero_non_finite)
                .collect::<Result<Vec<_>>>()?;
            Ok((u, state))
        }
        (&TransformStage::ClipByGlobalNorm(max_norm), state) => {
            Ok((clip_by_global_norm(updates, max_norm)?, state))
        }
    }
}

///
/// μ ← b1 μ + (1 - b1) g
/// ν ← b2 ν + (1 - b2) g²
/// u = μ̂ / (sqrt(ν̂) + eps)
/// where μ̂ = μ / (1 - b1^t), ν̂ = ν / (1 - b2^t)
///
fn scale_by_adam(
    grads: Vec<Tensor>,
    count: usize,
    mu: Vec<Tensor>,
    nu: Vec<Tensor>,
    b1: f64,
    b2: f64,
    eps: f64,
) -> Result<(Vec<Tensor>, StageState)> {
    if grads.len() != mu.len() || grads.len() != nu.len() {
        candle_core::bail!(
            "{} gradients but {} moment tensors",
            grads.len(),
            mu.len()
        );
    }

    let count = count + 1;
    let t = count as i32;
    let mu_correction = 1. / (1. - b1.powi(t));
    let nu_correction = 1. / (1. - b2.powi(t));

    let mut updates = Vec::with_capacity(grads.len());
    let mut next_mu = Vec::with_capacity(grads.len());
    let mut next_nu = Vec::with_capacity(grads.len());

    for ((g, m), v) in grads.iter().zip(mu.iter()).zip(nu.iter()) {
        let m = (m.affine(b1, 0.)? + g.affine(1. - b1, 0.)?)?;
        let v = (v.affine(b2, 0.)? + g.sqr()?.affine(1. - b2, 0.)?)?;

        let m_hat = m.affine(mu_correction, 0.)?;
        let v_hat = v.affine(nu_correction, 0.)?;
        updates.push(m_hat.div(&v_hat.sqrt()?.affine(1., eps)?)?);

        next_mu.push(m);
        next_nu.push(v);
    }

    Ok((
        updates,
        StageState::Adam {
            count,
            mu: next_mu,
            nu: next_nu,
        },
    ))
}

/// u - u is zero for every finite entry and NaN for NaN or ±Inf, in
/// any float dtype
fn zero_non_finite(u: &Tensor) -> Result<Tensor> {
    let finite = (u - u)?.eq(0f64)?;
    finite.where_cond(u, &u.zeros_like()?)
}

/// Global L2 norm over a list of tensors
pub fn global_norm(updates: &[Tensor]) -> Result<f64> {
    let mut sq = 0f64;
    for u in updates {
        sq += u.sqr()?.sum_all()?.to_dtype(candle_core::DType::F64)?.to_scalar::<f64>()?;
    }
    Ok(sq.sqrt())
}

fn clip_by_global_norm(updates: Vec<Tensor>, max_norm: f64) -> Result<Vec<Tensor>> {
    let norm = global_norm(&updates)?;
    if norm > max_norm {
        let scale = max_norm / norm;
        updates.iter().map(|u| u.affine(scale, 0.)).collect()
    } else {
        Ok(updates)
    }
}

/// params ← params + updates
pub fn apply_updates(params: &[(String, Var)], updates: &[Tensor]) -> Result<()> {
    if params.len() != updates.len() {
        candle_core::bail!(
            "{} parameters but {} updates",
            params.len(),
            updates.len()
        );
    }
    for ((_, var), u) in params.iter().zip(updates.iter()) {
        let next = var.as_tensor().detach().add(&u.detach())?;
        var.set(&next)?;
    }
    Ok(())
}
