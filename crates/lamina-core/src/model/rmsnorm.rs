//! Root Mean Square Layer Normalization.
//!
//! RMSNorm only rescales by the root mean square of the last dimension.
//! Unlike LayerNorm it neither subtracts the mean nor adds a bias.
//!
//! # Formula
//!
//! `RMSNorm(x) = x * weight / sqrt(mean(x^2) + eps)`
//!
//! # Reference
//!
//! [Root Mean Square Layer Normalization](https://arxiv.org/abs/1910.07467)

use crate::error::Result;
use candle_core::{DType, Device, Tensor, D};

/// RMS Layer Normalization.
#[derive(Debug, Clone)]
pub struct RmsNorm {
    /// Learnable per-channel scale.
    weight: Tensor,
    /// Small constant for numerical stability.
    eps: f64,
}

impl RmsNorm {
    /// Create a new RMSNorm layer with given weight.
    pub fn new(weight: Tensor, eps: f64) -> Result<Self> {
        // One scale per channel
        weight.dims1()?;
        Ok(Self { weight, eps })
    }

    /// Create a new RMSNorm layer with a weight of ones.
    pub fn ones(dim: usize, eps: f64, dtype: DType, device: &Device) -> Result<Self> {
        let weight = Tensor::ones(dim, dtype, device)?;
        Ok(Self { weight, eps })
    }

    /// Forward pass.
    ///
    /// # Arguments
    ///
    /// * `x` - Input tensor [..., dim]
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let dtype = x.dtype();
        let x = x.to_dtype(DType::F32)?;

        let mean_sq = x.sqr()?.mean_keepdim(D::Minus1)?;
        let rsqrt = (mean_sq + self.eps)?.sqrt()?.recip()?;

        let normalized = x.broadcast_mul(&rsqrt)?.to_dtype(dtype)?;
        Ok(normalized.broadcast_mul(&self.weight.to_dtype(dtype)?)?)
    }

    /// Get the weight tensor.
    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    /// Mutable access to the weight for loading.
    pub(crate) fn weight_mut(&mut self) -> &mut Tensor {
        &mut self.weight
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn create_test_rmsnorm(dim: usize) -> RmsNorm {
        RmsNorm::ones(dim, 1e-6, DType::F32, &Device::Cpu).unwrap()
    }

    #[test]
    fn rmsnorm_forward_3d() {
        let norm = create_test_rmsnorm(64);

        // [batch, seq, dim]
        let x = Tensor::randn(0.0f32, 1.0, &[2, 16, 64], &Device::Cpu).unwrap();
        let output = norm.forward(&x).unwrap();

        assert_eq!(output.dims(), x.dims());
    }

    #[test]
    fn rmsnorm_normalized_magnitude() {
        let norm = create_test_rmsnorm(64);

        // All values = 2.0, so RMS = 2.0 and output = 1.0
        let x = (Tensor::ones(&[1, 64], DType::F32, &Device::Cpu).unwrap() * 2.0).unwrap();
        let output = norm.forward(&x).unwrap();

        let output_vec: Vec<f32> = output.flatten_all().unwrap().to_vec1().unwrap();
        for val in output_vec {
            assert!((val - 1.0).abs() < 1e-4, "Expected ~1.0, got {}", val);
        }
    }

    #[test]
    fn rmsnorm_does_not_center() {
        let norm = create_test_rmsnorm(2);

        // A LayerNorm would map [3, 5] to [-1, 1]
        let x = Tensor::new(&[[3.0f32, 5.0]], &Device::Cpu).unwrap();
        let output: Vec<f32> = norm.forward(&x).unwrap().flatten_all().unwrap().to_vec1().unwrap();

        let rms = ((9.0f32 + 25.0) / 2.0 + 1e-6).sqrt();
        assert!((output[0] - 3.0 / rms).abs() < 1e-5);
        assert!((output[1] - 5.0 / rms).abs() < 1e-5);
    }

    #[test]
    fn rmsnorm_applies_weight() {
        let weight = Tensor::new(&[2.0f32, 0.5], &Device::Cpu).unwrap();
        let norm = RmsNorm::new(weight, 1e-6).unwrap();

        let x = Tensor::new(&[[1.0f32, 1.0]], &Device::Cpu).unwrap();
        let output: Vec<f32> = norm.forward(&x).unwrap().flatten_all().unwrap().to_vec1().unwrap();

        assert!((output[0] - 2.0).abs() < 1e-4);
        assert!((output[1] - 0.5).abs() < 1e-4);
    }

    #[test]
    fn rmsnorm_preserves_dtype() {
        let norm = create_test_rmsnorm(8);
        let x = Tensor::randn(0.0f32, 1.0, &[2, 8], &Device::Cpu)
            .unwrap()
            .to_dtype(DType::BF16)
            .unwrap();

        let output = norm.forward(&x).unwrap();
        assert_eq!(output.dtype(), DType::BF16);
    }

    proptest! {
        #[test]
        fn rmsnorm_is_scale_covariant(
            values in prop::collection::vec(-10.0f32..10.0, 16),
            scale in 0.5f32..50.0,
        ) {
            // Skip near-zero vectors where eps dominates the divisor
            let sum_sq: f32 = values.iter().map(|v| v * v).sum();
            prop_assume!(sum_sq > 1.0);

            let norm = create_test_rmsnorm(16);
            let x = Tensor::from_slice(&values, (1, 16), &Device::Cpu).unwrap();
            let scaled = (&x * scale as f64).unwrap();

            let a: Vec<f32> = norm.forward(&x).unwrap().flatten_all().unwrap().to_vec1().unwrap();
            let b: Vec<f32> = norm.forward(&scaled).unwrap().flatten_all().unwrap().to_vec1().unwrap();

            for (lhs, rhs) in a.iter().zip(b.iter()) {
                prop_assert!((lhs - rhs).abs() < 1e-3, "{} vs {}", lhs, rhs);
            }
        }
    }
}
