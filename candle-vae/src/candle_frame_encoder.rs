use crate::candle_aux_layers::*;
use crate::candle_gaussian::GaussianParams;
use crate::candle_model_traits::GaussianEncoderT;
use crate::candle_vae::FrameVaeConfig;
use candle_core::{Result, Tensor};
use candle_nn::{Activation, Conv2d, Linear, Module, VarBuilder};

/// Bounds on the latent log-variance
const MIN_LNVAR: f64 = -8.;
const MAX_LNVAR: f64 = 8.;

pub struct FrameEncoder {
    config: FrameVaeConfig,
    conv: StackLayers<Conv2d>,
    z_mean: Linear,
    z_lnvar: Linear,
}

impl GaussianEncoderT for FrameEncoder {
    fn forward(&self, x_nchw: &Tensor) -> Result<GaussianParams> {
        let h_nchw = self.preprocess_input(x_nchw)?;
        let h_nl = self.conv.forward(&h_nchw)?.flatten_from(1)?;
        let z_mean_nk = self.z_mean.forward(&h_nl)?;
        let z_lnvar_nk = self.z_lnvar.forward(&h_nl)?.clamp(MIN_LNVAR, MAX_LNVAR)?;
        GaussianParams::new(z_mean_nk, z_lnvar_nk)
    }

    fn dim_latent(&self) -> usize {
        self.config.n_latent
    }
}

impl FrameEncoder {
    pub fn config(&self) -> &FrameVaeConfig {
        &self.config
    }

    /// Pixel intensities [0, 255] -> [-1, 1]
    pub fn preprocess_input(&self, x_nchw: &Tensor) -> Result<Tensor> {
        debug_assert_eq!(x_nchw.rank(), 4);
        x_nchw.affine(1. / 127.5, -1.)
    }

    /// Will create a new frame encoder module
    /// with these variables:
    ///
    /// * `nn.enc.conv.{}.weight` where {} is the layer index
    /// * `nn.enc.z.mean.weight`
    /// * `nn.enc.z.lnvar.weight`
    pub fn new(config: &FrameVaeConfig, vs: VarBuilder) -> Result<Self> {
        let mut conv = StackLayers::<Conv2d>::new();
        let mut prev_dim = config.channels;

        // (1) frames -> stride-2 convolutions
        for (j, &next_dim) in stage_channels(config.size_multiplier).iter().enumerate() {
            let name = format!("nn.enc.conv.{}", j);
            conv.push_with_act(
                candle_nn::conv2d(
                    prev_dim,
                    next_dim,
                    KERNEL_SIZE,
                    downsample_config(),
                    vs.pp(name),
                )?,
                Activation::Silu,
            );
            prev_dim = next_dim;
        }

        // (2) flattened grid -> K
        let (gh, gw) = config.latent_grid();
        let flat_dim = prev_dim * gh * gw;
        let z_mean = candle_nn::linear(flat_dim, config.n_latent, vs.pp("nn.enc.z.mean"))?;
        let z_lnvar = candle_nn::linear(flat_dim, config.n_latent, vs.pp("nn.enc.z.lnvar"))?;

        Ok(Self {
            config: config.clone(),
            conv,
            z_mean,
            z_lnvar,
        })
    }
}
