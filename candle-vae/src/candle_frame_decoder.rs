use crate::candle_aux_layers::*;
use crate::candle_gaussian::GaussianParams;
use crate::candle_model_traits::GaussianDecoderT;
use crate::candle_vae::FrameVaeConfig;
use candle_core::{Result, Tensor};
use candle_nn::{Activation, ConvTranspose2d, Linear, Module, VarBuilder};

const MIN_LNVAR: f64 = -8.;
const MAX_LNVAR: f64 = 8.;

/// Half of the pixel range; the network works on [-1, 1]
const PIXEL_SCALE: f64 = 127.5;

///////////////////
// Frame Decoder //
///////////////////

pub struct FrameDecoder {
    config: FrameVaeConfig,
    top_channels: usize,
    fc: Linear,
    deconv: StackLayers<ConvTranspose2d>,
}

impl GaussianDecoderT for FrameDecoder {
    fn forward(&self, z_nk: &Tensor) -> Result<GaussianParams> {
        let n = z_nk.dim(0)?;
        let (gh, gw) = self.config.latent_grid();
        let cc = self.config.channels;

        let h = self.fc.forward(z_nk)?.reshape((n, self.top_channels, gh, gw))?;
        let h = Activation::Silu.forward(&h)?;
        let out_n2chw = self.deconv.forward(&h)?;

        // back to pixel units: mean scales by 127.5, variance by 127.5²
        let x_mean = out_n2chw.narrow(1, 0, cc)?.affine(PIXEL_SCALE, PIXEL_SCALE)?;
        let x_lnvar = out_n2chw
            .narrow(1, cc, cc)?
            .clamp(MIN_LNVAR, MAX_LNVAR)?
            .affine(1., 2. * PIXEL_SCALE.ln())?;

        GaussianParams::new(x_mean, x_lnvar)
    }

    fn dim_latent(&self) -> usize {
        self.config.n_latent
    }
}

impl FrameDecoder {
    /// Will create a new frame decoder with the following parameters:
    /// * `nn.dec.fc.weight`
    /// * `nn.dec.deconv.{}.weight` where {} is the layer index
    ///
    /// The last layer emits `2 * channels` maps: mean, then log-variance.
    pub fn new(config: &FrameVaeConfig, vs: VarBuilder) -> Result<Self> {
        let mut channels = stage_channels(config.size_multiplier);
        channels.reverse();

        let top_channels = channels[0];
        let (gh, gw) = config.latent_grid();

        let fc = candle_nn::linear(config.n_latent, top_channels * gh * gw, vs.pp("nn.dec.fc"))?;

        let mut deconv = StackLayers::<ConvTranspose2d>::new();
        let mut prev_dim = top_channels;
        for (j, &next_dim) in channels.iter().skip(1).enumerate() {
            let name = format!("nn.dec.deconv.{}", j);
            deconv.push_with_act(
                candle_nn::conv_transpose2d(
                    prev_dim,
                    next_dim,
                    KERNEL_SIZE,
                    upsample_config(),
                    vs.pp(name),
                )?,
                Activation::Silu,
            );
            prev_dim = next_dim;
        }

        deconv.push(candle_nn::conv_transpose2d(
            prev_dim,
            2 * config.channels,
            KERNEL_SIZE,
            upsample_config(),
            vs.pp(format!("nn.dec.deconv.{}", channels.len() - 1)),
        )?);

        Ok(Self {
            config: config.clone(),
            top_channels,
            fc,
            deconv,
        })
    }
}
