use crate::candle_model_traits::ParameterSetT;
use crate::candle_optim_chain::*;
use crate::candle_rng_key::RngKey;

use candle_core::{Result, Tensor};
use log::debug;

/// Everything a training run needs to continue: the model, its
/// optimizer state, the randomness still to be consumed, and how
/// many update steps have been taken
pub struct TrainingState<M> {
    pub model: M,
    pub opt_state: OptimizerState,
    pub rng: RngKey,
    pub iteration: usize,
}

impl<M> TrainingState<M>
where
    M: ParameterSetT,
{
    /// A fresh state at iteration 0 with zeroed optimizer moments
    pub fn fresh(model: M, optimizer: &OptimizerChain, rng: RngKey) -> Result<Self> {
        let opt_state = optimizer.init(&model.named_vars()?)?;
        Ok(Self {
            model,
            opt_state,
            rng,
            iteration: 0,
        })
    }
}

/// Take one gradient step on `batch`
///
/// The state's key is split: one half drives this step's sampling,
/// the other is kept for the next step. Gradients of parameters the
/// loss never touched are zero. A non-finite loss is not an error;
/// the optimizer chain zeroes the non-finite updates instead.
///
/// * `state` - consumed and replaced by the returned state
/// * `batch` - data for `loss_fn`
/// * `optimizer` - gradient transformation chain
/// * `loss_fn` - fn (model, batch, key) -> scalar loss
///
/// # Returns `(loss, next_state)`
pub fn update_state<M, LossFn>(
    state: TrainingState<M>,
    batch: &Tensor,
    optimizer: &OptimizerChain,
    loss_fn: LossFn,
) -> Result<(f32, TrainingState<M>)>
where
    M: ParameterSetT,
    LossFn: Fn(&M, &Tensor, RngKey) -> Result<Tensor>,
{
    let TrainingState {
        model,
        opt_state,
        rng,
        iteration,
    } = state;

    let (step_key, next_key) = rng.split();

    let loss = loss_fn(&model, batch, step_key)?;
    let params = model.named_vars()?;
    let grad_store = loss.backward()?;

    let grads = params
        .iter()
        .map(|(_, var)| match grad_store.get(var.as_tensor()) {
            Some(g) => Ok(g.clone()),
            None => var.as_tensor().zeros_like(),
        })
        .collect::<Result<Vec<_>>>()?;

    let (updates, opt_state) = optimizer.update(grads, opt_state)?;
    apply_updates(&params, &updates)?;

    let loss_val = loss.to_dtype(candle_core::DType::F32)?.to_scalar::<f32>()?;
    if !loss_val.is_finite() {
        debug!("non-finite loss at iteration {}", iteration);
    }

    Ok((
        loss_val,
        TrainingState {
            model,
            opt_state,
            rng: next_key,
            iteration: iteration + 1,
        },
    ))
}
