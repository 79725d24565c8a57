use crate::candle_gaussian::*;
use crate::candle_model_traits::*;
use crate::candle_rng_key::RngKey;
use crate::candle_vae::Vae;

use candle_core::{Result, Tensor};

/// Per-element negative ELBO of a batch of frames
///
/// 1. q(z|x) from the encoder
/// 2. z ~ q(z|x) by reparameterization with `key`
/// 3. KL(q ‖ N(0, 1)), summed over all elements
/// 4. p(x|z) from the decoder
/// 5. log p(x|z), summed over all elements
///
/// loss = [ Σ -log p(x|z) + Σ KL ] / (number of elements in x)
///
/// * `vae` - encoder and decoder
/// * `x_nchw` - frames (n x c x h x w)
/// * `key` - randomness for the latent sample
///
pub fn vae_loss<Enc, Dec>(vae: &Vae<Enc, Dec>, x_nchw: &Tensor, key: RngKey) -> Result<Tensor>
where
    Enc: GaussianEncoderT,
    Dec: GaussianDecoderT,
{
    elbo_loss(&vae.encoder, &vae.decoder, x_nchw, key)
}

/// `vae_loss` on a bare encoder/decoder pair
pub fn elbo_loss<Enc, Dec>(encoder: &Enc, decoder: &Dec, x_nchw: &Tensor, key: RngKey) -> Result<Tensor>
where
    Enc: GaussianEncoderT,
    Dec: GaussianDecoderT,
{
    let q_z = encoder.forward(x_nchw)?;
    let z_nk = sample_gaussian(&q_z, key)?;

    let prior = GaussianParams::standard_normal(q_z.mean.dtype(), q_z.mean.device())?;
    let kl = gaussian_kl_divergence(&q_z, &prior)?.sum_all()?;

    let p_x = decoder.forward(&z_nk)?;
    let neg_llik = gaussian_log_probability(&p_x, x_nchw)?.sum_all()?.neg()?;

    (neg_llik + kl)? / (x_nchw.elem_count() as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use candle_core::{DType, Device};

    /// mean = flattened input, log-variance = 0
    struct IdentityEncoder {
        dim: usize,
    }

    impl GaussianEncoderT for IdentityEncoder {
        fn forward(&self, x: &Tensor) -> Result<GaussianParams> {
            let mean = x.flatten_from(1)?;
            let log_var = mean.zeros_like()?;
            GaussianParams::new(mean, log_var)
        }
        fn dim_latent(&self) -> usize {
            self.dim
        }
    }

    /// N(0, 1) per pixel no matter what z is
    struct StandardFrameDecoder {
        dim: usize,
        frame: (usize, usize, usize),
    }

    impl GaussianDecoderT for StandardFrameDecoder {
        fn forward(&self, z_nk: &Tensor) -> Result<GaussianParams> {
            let (c, h, w) = self.frame;
            let n = z_nk.dim(0)?;
            GaussianParams::zeros((n, c, h, w), z_nk.dtype(), z_nk.device())
        }
        fn dim_latent(&self) -> usize {
            self.dim
        }
    }

    #[test]
    fn zero_frames_give_closed_form_loss() -> Result<()> {
        let dev = Device::Cpu;
        let x = Tensor::zeros((3, 2, 4, 4), DType::F32, &dev)?;
        let encoder = IdentityEncoder { dim: 32 };
        let decoder = StandardFrameDecoder {
            dim: 32,
            frame: (2, 4, 4),
        };

        let q = encoder.forward(&x)?;
        let prior = GaussianParams::standard_normal(DType::F32, &dev)?;
        let kl = gaussian_kl_divergence(&q, &prior)?.sum_all()?.to_scalar::<f32>()?;
        assert_eq!(kl, 0.0);

        let loss = elbo_loss(&encoder, &decoder, &x, RngKey::new(0))?;
        assert!(loss.dims().is_empty());
        assert_abs_diff_eq!(
            loss.to_scalar::<f32>()?,
            LOG_SQRT_2PI as f32,
            epsilon = 1e-5
        );
        Ok(())
    }

    /// Near-deterministic pair so the loss is a function of the batch
    /// contents only
    struct ScaledEncoder;

    impl GaussianEncoderT for ScaledEncoder {
        fn forward(&self, x: &Tensor) -> Result<GaussianParams> {
            let mean = (x.flatten_from(1)? * 0.1)?;
            let log_var = (mean.zeros_like()? - 40.)?;
            GaussianParams::new(mean, log_var)
        }
        fn dim_latent(&self) -> usize {
            4
        }
    }

    struct ScaledDecoder;

    impl GaussianDecoderT for ScaledDecoder {
        fn forward(&self, z_nk: &Tensor) -> Result<GaussianParams> {
            let n = z_nk.dim(0)?;
            let mean = (z_nk * 2.)?.reshape((n, 1, 2, 2))?;
            let log_var = (mean.zeros_like()? + 0.5)?;
            GaussianParams::new(mean, log_var)
        }
        fn dim_latent(&self) -> usize {
            4
        }
    }

    #[test]
    fn loss_ignores_example_order() -> Result<()> {
        let dev = Device::Cpu;
        let x = RngKey::new(21).normal((5, 1, 2, 2), DType::F32, &dev)?;
        let perm = Tensor::new(&[3u32, 0, 4, 1, 2], &dev)?;
        let x_perm = x.index_select(&perm, 0)?;

        let a = elbo_loss(&ScaledEncoder, &ScaledDecoder, &x, RngKey::new(1))?;
        let b = elbo_loss(&ScaledEncoder, &ScaledDecoder, &x_perm, RngKey::new(2))?;
        assert_abs_diff_eq!(
            a.to_scalar::<f32>()?,
            b.to_scalar::<f32>()?,
            epsilon = 1e-4
        );
        Ok(())
    }

    #[test]
    fn loss_is_normalized_by_element_count() -> Result<()> {
        let dev = Device::Cpu;
        let encoder = IdentityEncoder { dim: 4 };
        let decoder = StandardFrameDecoder {
            dim: 4,
            frame: (1, 2, 2),
        };
        let small = Tensor::zeros((1, 1, 2, 2), DType::F32, &dev)?;
        let large = Tensor::zeros((7, 1, 2, 2), DType::F32, &dev)?;
        let a = elbo_loss(&encoder, &decoder, &small, RngKey::new(0))?.to_scalar::<f32>()?;
        let b = elbo_loss(&encoder, &decoder, &large, RngKey::new(0))?.to_scalar::<f32>()?;
        assert_abs_diff_eq!(a, b, epsilon = 1e-5);
        Ok(())
    }
}
