use crate::candle_gaussian::GaussianParams;
use candle_core::{Result, Tensor, Var};

pub trait GaussianEncoderT {
    /// An encoder that maps a batch of frames to latent Gaussians
    ///
    /// # Arguments
    /// * `x` - input frames (n x c x h x w)
    ///
    /// # Returns `q(z|x)` with mean and log-variance (n x k)
    fn forward(&self, x: &Tensor) -> Result<GaussianParams>;

    fn dim_latent(&self) -> usize;
}

pub trait GaussianDecoderT {
    /// A decoder that maps latent states to Gaussians over frames
    ///
    /// # Arguments
    /// * `z_nk` - latent states (n x k)
    ///
    /// # Returns `p(x|z)` with mean and log-variance (n x c x h x w)
    fn forward(&self, z_nk: &Tensor) -> Result<GaussianParams>;

    fn dim_latent(&self) -> usize;
}

/// Anything holding trainable variables
pub trait ParameterSetT {
    /// All trainable variables sorted by name, so the order is stable
    /// across runs and across save/load
    fn named_vars(&self) -> Result<Vec<(String, Var)>>;
}

impl ParameterSetT for candle_nn::VarMap {
    fn named_vars(&self) -> Result<Vec<(String, Var)>> {
        let data = self
            .data()
            .lock()
            .map_err(|e| candle_core::Error::Msg(format!("variable map lock: {}", e)))?;
        let mut vars: Vec<(String, Var)> = data
            .iter()
            .map(|(name, var)| (name.clone(), var.clone()))
            .collect();
        vars.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(vars)
    }
}
