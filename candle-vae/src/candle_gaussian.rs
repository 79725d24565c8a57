use crate::candle_rng_key::RngKey;
use candle_core::{DType, Device, Error, Result, Shape, Tensor};

/// log(sqrt(2π))
pub const LOG_SQRT_2PI: f64 = 0.918_938_533_204_672_8;

/// Diagonal Gaussian parameterized by mean and log-variance
///
/// The variance `exp(log_var)` is positive for any real `log_var`,
/// so neither field needs a constraint.
#[derive(Clone, Debug)]
pub struct GaussianParams {
    pub mean: Tensor,
    pub log_var: Tensor,
}

impl GaussianParams {
    /// Pair up `mean` and `log_var`; both must share the same shape
    pub fn new(mean: Tensor, log_var: Tensor) -> Result<Self> {
        if mean.shape() != log_var.shape() {
            return Err(Error::ShapeMismatchBinaryOp {
                lhs: mean.shape().clone(),
                rhs: log_var.shape().clone(),
                op: "gaussian-params",
            });
        }
        Ok(Self { mean, log_var })
    }

    /// N(0, 1) as a scalar pair to be broadcast against other params
    pub fn standard_normal(dtype: DType, device: &Device) -> Result<Self> {
        let zero = Tensor::zeros((), dtype, device)?;
        Ok(Self {
            mean: zero.clone(),
            log_var: zero,
        })
    }

    /// N(0, 1) materialized with a full shape
    pub fn zeros<S: Into<Shape>>(shape: S, dtype: DType, device: &Device) -> Result<Self> {
        let zero = Tensor::zeros(shape, dtype, device)?;
        Ok(Self {
            mean: zero.clone(),
            log_var: zero,
        })
    }

    pub fn dims(&self) -> &[usize] {
        self.mean.dims()
    }
}

/// (a - b) / exp(lnvar / 2), exactly zero wherever a == b
fn standardized_diff(a: &Tensor, b: &Tensor, log_var: &Tensor) -> Result<Tensor> {
    let diff = a.broadcast_sub(b)?;
    let scaled = diff.broadcast_mul(&(log_var * -0.5)?.exp()?)?;
    diff.eq(0f64)?.where_cond(&diff, &scaled)
}

/// Elementwise KL divergence between two Gaussians
///
/// KL(p‖q) = ½ [ lnvar_q - lnvar_p + exp(lnvar_p - lnvar_q) + (μ_p - μ_q)² / var_q - 1 ]
///
/// Variances enter only through log-variance differences, so KL(p‖p)
/// is exactly zero for any finite `p`.
///
/// `q` is broadcast against `p`, so the standard normal prior can be
/// passed as a scalar pair. Nothing is reduced.
pub fn gaussian_kl_divergence(p: &GaussianParams, q: &GaussianParams) -> Result<Tensor> {
    let var_ratio = p.log_var.broadcast_sub(&q.log_var)?.exp()?;
    let diff_sq = standardized_diff(&p.mean, &q.mean, &q.log_var)?.sqr()?;
    q.log_var
        .broadcast_sub(&p.log_var)?
        .broadcast_add(&var_ratio)?
        .broadcast_add(&diff_sq)?
        .affine(0.5, -0.5)
}

/// Elementwise log N(x; μ, exp(lnvar))
///
/// -½ (x - μ)² / var - ½ lnvar - log(sqrt(2π))
pub fn gaussian_log_probability(p: &GaussianParams, x: &Tensor) -> Result<Tensor> {
    standardized_diff(x, &p.mean, &p.log_var)?
        .sqr()?
        .broadcast_add(&p.log_var)?
        .affine(-0.5, -LOG_SQRT_2PI)
}

///
/// x = μ + exp(lnvar / 2) * ε
/// where ε ~ N(0, 1) is drawn from `key`
///
/// The noise is a constant in the graph, so gradients flow into μ
/// and lnvar.
pub fn sample_gaussian(p: &GaussianParams, key: RngKey) -> Result<Tensor> {
    let eps = key.normal_like(&p.mean)?;
    let std = (&p.log_var * 0.5)?.exp()?;
    p.mean.broadcast_add(&std.broadcast_mul(&eps)?)
}

/// Join two Gaussians along the feature axis (axis 1)
///
/// All other axes must agree.
pub fn concat_gaussians(p_a: &GaussianParams, p_b: &GaussianParams) -> Result<GaussianParams> {
    let (a, b) = (p_a.dims(), p_b.dims());

    let compatible = a.len() == b.len()
        && a.len() >= 2
        && a.iter()
            .zip(b.iter())
            .enumerate()
            .all(|(axis, (x, y))| axis == 1 || x == y);

    if !compatible {
        return Err(Error::ShapeMismatchBinaryOp {
            lhs: p_a.mean.shape().clone(),
            rhs: p_b.mean.shape().clone(),
            op: "concat-gaussians",
        });
    }

    GaussianParams::new(
        Tensor::cat(&[&p_a.mean, &p_b.mean], 1)?,
        Tensor::cat(&[&p_a.log_var, &p_b.log_var], 1)?,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn params(mean: &[f32], log_var: &[f32], shape: (usize, usize)) -> Result<GaussianParams> {
        let dev = Device::Cpu;
        GaussianParams::new(
            Tensor::from_slice(mean, shape, &dev)?,
            Tensor::from_slice(log_var, shape, &dev)?,
        )
    }

    #[test]
    fn kl_against_itself_is_zero() -> Result<()> {
        let p = params(
            &[0.0, 1.5, -3.0, 10.0, 0.25, -0.75, 4.0, -2.0, 1e6],
            &[0.0, -2.0, 3.0, 1.0, -6.0, 5.0, 100.0, -110.0, -150.0],
            (3, 3),
        )?;
        let kl: Vec<Vec<f32>> = gaussian_kl_divergence(&p, &p)?.to_vec2()?;
        for row in kl {
            for v in row {
                assert_eq!(v, 0.0);
            }
        }
        Ok(())
    }

    #[test]
    fn kl_stays_finite_for_extreme_log_variances() -> Result<()> {
        let p = params(&[0.5, -0.5], &[120.0, -120.0], (1, 2))?;
        let q = params(&[0.0, 0.0], &[119.0, -119.0], (1, 2))?;
        let kl: Vec<Vec<f32>> = gaussian_kl_divergence(&p, &q)?.to_vec2()?;
        // ½ (-1 + e + 0.25 e^-119 - 1), the mean term underflows
        let expected = 0.5 * (1f32.exp() - 2.0);
        assert_abs_diff_eq!(kl[0][0], expected, epsilon = 1e-5);
        // ½ (1 + e^-1 + 0.25 e^119 - 1) overflows; it must not turn into NaN
        assert!(!kl[0][1].is_nan());
        Ok(())
    }

    #[test]
    fn kl_is_non_negative() -> Result<()> {
        let dev = Device::Cpu;
        let mut key = RngKey::new(11);
        for _ in 0..20 {
            let keys = key.split_n(5);
            key = keys[4];
            let p = GaussianParams::new(
                keys[0].normal((4, 6), DType::F32, &dev)?,
                keys[1].normal((4, 6), DType::F32, &dev)?,
            )?;
            let q = GaussianParams::new(
                keys[2].normal((4, 6), DType::F32, &dev)?,
                keys[3].normal((4, 6), DType::F32, &dev)?,
            )?;
            let min_kl = gaussian_kl_divergence(&p, &q)?
                .min_all()?
                .to_scalar::<f32>()?;
            assert!(min_kl >= -1e-6, "negative kl {}", min_kl);
        }
        Ok(())
    }

    #[test]
    fn kl_broadcasts_scalar_prior() -> Result<()> {
        let p = params(&[1.0, 0.0], &[0.0, 1.0], (1, 2))?;
        let prior = GaussianParams::standard_normal(DType::F32, &Device::Cpu)?;
        let kl = gaussian_kl_divergence(&p, &prior)?;
        assert_eq!(kl.dims(), &[1, 2]);

        let kl: Vec<Vec<f32>> = kl.to_vec2()?;
        // ½ (0 - 0 + (1 + 1) - 1)
        assert_abs_diff_eq!(kl[0][0], 0.5, epsilon = 1e-6);
        // ½ (-1 + e - 1)
        let expected = 0.5 * (-1.0 + 1f32.exp() - 1.0);
        assert_abs_diff_eq!(kl[0][1], expected, epsilon = 1e-6);
        Ok(())
    }

    #[test]
    fn log_probability_at_mean() -> Result<()> {
        let p = params(&[2.0, -1.0], &[0.0, 2.0], (1, 2))?;
        let lp: Vec<Vec<f32>> = gaussian_log_probability(&p, &p.mean)?.to_vec2()?;
        assert_abs_diff_eq!(lp[0][0], -LOG_SQRT_2PI as f32, epsilon = 1e-6);
        assert_abs_diff_eq!(lp[0][1], -1.0 - LOG_SQRT_2PI as f32, epsilon = 1e-6);

        let wide = params(&[3.0, -3.0], &[100.0, -150.0], (1, 2))?;
        let lp: Vec<Vec<f32>> = gaussian_log_probability(&wide, &wide.mean)?.to_vec2()?;
        assert_abs_diff_eq!(lp[0][0], -50.0 - LOG_SQRT_2PI as f32, epsilon = 1e-4);
        assert_abs_diff_eq!(lp[0][1], 75.0 - LOG_SQRT_2PI as f32, epsilon = 1e-4);
        Ok(())
    }

    #[test]
    fn log_probability_off_mean() -> Result<()> {
        let p = params(&[0.0], &[0.0], (1, 1))?;
        let x = Tensor::from_slice(&[2f32], (1, 1), &Device::Cpu)?;
        let lp: Vec<Vec<f32>> = gaussian_log_probability(&p, &x)?.to_vec2()?;
        assert_abs_diff_eq!(lp[0][0], -2.0 - LOG_SQRT_2PI as f32, epsilon = 1e-6);
        Ok(())
    }

    #[test]
    fn sampling_depends_only_on_key() -> Result<()> {
        let p = params(&[0.0, 1.0, 2.0, 3.0], &[0.0, 0.0, -1.0, 1.0], (2, 2))?;
        let key = RngKey::new(5);
        let a: Vec<Vec<f32>> = sample_gaussian(&p, key)?.to_vec2()?;
        let b: Vec<Vec<f32>> = sample_gaussian(&p, key)?.to_vec2()?;
        let c: Vec<Vec<f32>> = sample_gaussian(&p, RngKey::new(6))?.to_vec2()?;
        assert_eq!(a, b);
        assert_ne!(a, c);
        Ok(())
    }

    #[test]
    fn sampling_collapses_with_tiny_variance() -> Result<()> {
        let p = params(&[0.5, -0.5], &[-80.0, -80.0], (1, 2))?;
        let x: Vec<Vec<f32>> = sample_gaussian(&p, RngKey::new(9))?.to_vec2()?;
        assert_abs_diff_eq!(x[0][0], 0.5, epsilon = 1e-6);
        assert_abs_diff_eq!(x[0][1], -0.5, epsilon = 1e-6);
        Ok(())
    }

    #[test]
    fn concat_along_features() -> Result<()> {
        let dev = Device::Cpu;
        let a = GaussianParams::zeros((4, 3), DType::F32, &dev)?;
        let b = GaussianParams::zeros((4, 5), DType::F32, &dev)?;
        let ab = concat_gaussians(&a, &b)?;
        assert_eq!(ab.dims(), &[4, 8]);
        assert_eq!(ab.log_var.dims(), &[4, 8]);
        Ok(())
    }

    #[test]
    fn concat_rejects_batch_mismatch() -> Result<()> {
        let dev = Device::Cpu;
        let a = GaussianParams::zeros((4, 3), DType::F32, &dev)?;
        let b = GaussianParams::zeros((2, 3), DType::F32, &dev)?;
        let err = concat_gaussians(&a, &b).unwrap_err();
        assert!(matches!(err, Error::ShapeMismatchBinaryOp { .. }), "{:?}", err);
        Ok(())
    }

    #[test]
    fn new_rejects_mismatched_pair() -> Result<()> {
        let dev = Device::Cpu;
        let mean = Tensor::zeros((2, 3), DType::F32, &dev)?;
        let log_var = Tensor::zeros((2, 4), DType::F32, &dev)?;
        assert!(matches!(
            GaussianParams::new(mean, log_var),
            Err(Error::ShapeMismatchBinaryOp { .. })
        ));
        Ok(())
    }
}
