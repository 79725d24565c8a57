use crate::candle_gaussian::*;
use crate::candle_model_traits::*;
use crate::candle_rng_key::RngKey;
use crate::candle_vae::Vae;

use candle_core::{DType, Device, Result, Tensor};

/// Draw `n_samples` synthetic frames
///
/// z ~ N(0, 1), then x ~ p(x|z)
///
/// # Returns frames (n x c x h x w); values are not clamped
pub fn sample_vae<Enc, Dec>(
    vae: &Vae<Enc, Dec>,
    n_samples: usize,
    key: RngKey,
    dev: &Device,
) -> Result<Tensor>
where
    Enc: GaussianEncoderT,
    Dec: GaussianDecoderT,
{
    let (z_key, x_key) = key.split();
    let p_z = GaussianParams::zeros((n_samples, vae.decoder.dim_latent()), DType::F32, dev)?;
    let z_nk = sample_gaussian(&p_z, z_key)?;
    let p_x = vae.decoder.forward(&z_nk)?;
    sample_gaussian(&p_x, x_key)
}

/// Pass real frames through the model
///
/// z ~ q(z|x), then x' ~ p(x|z)
///
/// # Returns reconstructed frames with the shape of `x_nchw`
pub fn reconstruct_vae<Enc, Dec>(vae: &Vae<Enc, Dec>, x_nchw: &Tensor, key: RngKey) -> Result<Tensor>
where
    Enc: GaussianEncoderT,
    Dec: GaussianDecoderT,
{
    let (z_key, x_key) = key.split();
    let q_z = vae.encoder.forward(x_nchw)?;
    let z_nk = sample_gaussian(&q_z, z_key)?;
    let p_x = vae.decoder.forward(&z_nk)?;
    sample_gaussian(&p_x, x_key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candle_vae::*;

    fn config() -> FrameVaeConfig {
        FrameVaeConfig {
            n_latent: 3,
            channels: 3,
            height: 16,
            width: 8,
            size_multiplier: 1,
        }
    }

    #[test]
    fn sample_leading_dim_is_n() -> Result<()> {
        let dev = Device::Cpu;
        let vae = make_frame_vae(&config(), RngKey::new(0), &dev)?;
        for n in [1, 2, 5] {
            let x = sample_vae(&vae, n, RngKey::new(n as u64), &dev)?;
            assert_eq!(x.dims(), &[n, 3, 16, 8]);
        }
        Ok(())
    }

    #[test]
    fn sample_is_reproducible_per_key() -> Result<()> {
        let dev = Device::Cpu;
        let vae = make_frame_vae(&config(), RngKey::new(0), &dev)?;
        let a: Vec<f32> = sample_vae(&vae, 2, RngKey::new(7), &dev)?.flatten_all()?.to_vec1()?;
        let b: Vec<f32> = sample_vae(&vae, 2, RngKey::new(7), &dev)?.flatten_all()?.to_vec1()?;
        let c: Vec<f32> = sample_vae(&vae, 2, RngKey::new(8), &dev)?.flatten_all()?.to_vec1()?;
        assert_eq!(a, b);
        assert_ne!(a, c);
        Ok(())
    }

    #[test]
    fn reconstruct_keeps_shape() -> Result<()> {
        let dev = Device::Cpu;
        let vae = make_frame_vae(&config(), RngKey::new(0), &dev)?;
        let x = Tensor::full(64f32, (4, 3, 16, 8), &dev)?;
        let y = reconstruct_vae(&vae, &x, RngKey::new(1))?;
        assert_eq!(y.dims(), x.dims());
        Ok(())
    }
}
