use crate::candle_aux_layers::NUM_DOWNSAMPLE;
use crate::candle_frame_decoder::FrameDecoder;
use crate::candle_frame_encoder::FrameEncoder;
use crate::candle_model_traits::*;
use crate::candle_rng_key::RngKey;

use candle_core::{DType, Device, Result, Var};
use candle_nn::{VarBuilder, VarMap};
use serde::{Deserialize, Serialize};

/// Shape of the frame model: latent size, frame size, and width
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameVaeConfig {
    pub n_latent: usize,
    pub channels: usize,
    pub height: usize,
    pub width: usize,
    pub size_multiplier: usize,
}

impl FrameVaeConfig {
    /// Height and width after all stride-2 stages
    pub fn latent_grid(&self) -> (usize, usize) {
        (
            self.height >> NUM_DOWNSAMPLE,
            self.width >> NUM_DOWNSAMPLE,
        )
    }

    pub fn frame_dims(&self) -> (usize, usize, usize) {
        (self.channels, self.height, self.width)
    }

    /// Height and width must survive the stride-2 stages exactly
    pub fn check(&self) -> Result<()> {
        let unit = 1 << NUM_DOWNSAMPLE;
        if self.n_latent == 0 || self.channels == 0 || self.size_multiplier == 0 {
            candle_core::bail!("latent size, channels and size multiplier must be positive");
        }
        if self.height == 0 || self.width == 0 || self.height % unit != 0 || self.width % unit != 0
        {
            candle_core::bail!(
                "frame size {}x{} must be a positive multiple of {}",
                self.height,
                self.width,
                unit
            );
        }
        Ok(())
    }
}

/// An encoder/decoder pair that shares one variable map
pub struct Vae<Enc, Dec>
where
    Enc: GaussianEncoderT,
    Dec: GaussianDecoderT,
{
    pub encoder: Enc,
    pub decoder: Dec,
    pub parameters: VarMap,
}

impl<Enc, Dec> Vae<Enc, Dec>
where
    Enc: GaussianEncoderT,
    Dec: GaussianDecoderT,
{
    /// Build a VAE model
    /// * `encoder` - encoder module
    /// * `decoder` - decoder module
    /// * `parameters` - variables of both modules
    pub fn build(encoder: Enc, decoder: Dec, parameters: VarMap) -> Result<Self> {
        if encoder.dim_latent() != decoder.dim_latent() {
            candle_core::bail!(
                "encoder latent {} != decoder latent {}",
                encoder.dim_latent(),
                decoder.dim_latent()
            );
        }
        Ok(Self {
            encoder,
            decoder,
            parameters,
        })
    }
}

impl<Enc, Dec> ParameterSetT for Vae<Enc, Dec>
where
    Enc: GaussianEncoderT,
    Dec: GaussianDecoderT,
{
    fn named_vars(&self) -> Result<Vec<(String, Var)>> {
        self.parameters.named_vars()
    }
}

pub type FrameVae = Vae<FrameEncoder, FrameDecoder>;

impl FrameVae {
    pub fn config(&self) -> &FrameVaeConfig {
        self.encoder.config()
    }
}

/// Create a frame VAE with parameters drawn from `key`
///
/// * `nn.enc.*` - encoder variables
/// * `nn.dec.*` - decoder variables
pub fn make_frame_vae(config: &FrameVaeConfig, key: RngKey, dev: &Device) -> Result<FrameVae> {
    config.check()?;

    let parameters = VarMap::new();
    let vs = VarBuilder::from_varmap(&parameters, DType::F32, dev);

    let encoder = FrameEncoder::new(config, vs.clone())?;
    let decoder = FrameDecoder::new(config, vs)?;

    init_parameters(&parameters, key)?;

    Vae::build(encoder, decoder, parameters)
}

/// Redraw every variable from `key`
///
/// Weights get N(0, 1/fan_in) with fan_in the product of all but the
/// leading axis; biases start at zero.
pub fn init_parameters<P: ParameterSetT>(parameters: &P, key: RngKey) -> Result<()> {
    let vars = parameters.named_vars()?;
    let keys = key.split_n(vars.len());

    for ((name, var), key) in vars.iter().zip(keys) {
        let x = var.as_tensor();
        let value = if name.ends_with("bias") || x.rank() < 2 {
            x.zeros_like()?
        } else {
            let fan_in: usize = x.dims()[1..].iter().product();
            let stdev = 1. / (fan_in.max(1) as f64).sqrt();
            (key.normal(x.shape(), x.dtype(), x.device())? * stdev)?
        };
        var.set(&value)?;
    }
    Ok(())
}
