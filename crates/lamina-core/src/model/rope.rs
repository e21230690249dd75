//! Rotary Position Embeddings (RoPE).
//!
//! RoPE encodes position by rotating adjacent pairs `(x[2k], x[2k+1])` of
//! query and key vectors by the unit complex number `exp(i * p * theta_k)`.
//! The table stores the real and imaginary parts of those factors.
//!
//! # Reference
//!
//! [RoFormer: Enhanced Transformer with Rotary Position Embedding](https://arxiv.org/abs/2104.09864)

use crate::error::{LaminaError, Result};
use candle_core::{Device, Tensor};
use parking_lot::RwLock;

/// Precomputed rotation factors for every position up to `2 * max_seq_len`.
#[derive(Debug, Clone)]
pub struct RotaryTable {
    /// Real parts: [2 * max_seq_len, head_dim / 2]
    cos: Tensor,
    /// Imaginary parts: [2 * max_seq_len, head_dim / 2]
    sin: Tensor,
    /// Head dimension.
    head_dim: usize,
    /// Device the table lives on.
    device: Device,
}

impl RotaryTable {
    /// Compute the table.
    ///
    /// # Arguments
    ///
    /// * `head_dim` - Dimension of each attention head, must be even
    /// * `max_seq_len` - Maximum sequence length; twice as many positions are covered
    /// * `theta` - Base frequency (10000.0 for LLaMA)
    /// * `device` - Device for tensors
    pub fn new(head_dim: usize, max_seq_len: usize, theta: f64, device: &Device) -> Result<Self> {
        if head_dim == 0 || head_dim % 2 != 0 {
            return Err(LaminaError::ShapeMismatch(format!(
                "rotary head dimension must be even and positive, got {}",
                head_dim
            )));
        }

        // theta_k = base^(-2k/d) for k in [0, d/2)
        let half_dim = head_dim / 2;
        let inv_freq: Vec<f32> = (0..half_dim)
            .map(|k| 1.0 / theta.powf(2.0 * k as f64 / head_dim as f64) as f32)
            .collect();
        let inv_freq = Tensor::from_slice(&inv_freq, (1, half_dim), device)?;

        let len = 2 * max_seq_len;
        let positions: Vec<f32> = (0..len).map(|p| p as f32).collect();
        let positions = Tensor::from_slice(&positions, (len, 1), device)?;

        // angles = positions * inv_freq -> [len, half_dim]
        let angles = positions.matmul(&inv_freq)?;

        Ok(Self {
            cos: angles.cos()?,
            sin: angles.sin()?,
            head_dim,
            device: device.clone(),
        })
    }

    /// Slice the factors for positions `[start, start + len)`.
    pub fn narrow(&self, start: usize, len: usize) -> Result<RotarySlice> {
        let available = self.len();
        if start + len > available {
            return Err(LaminaError::PositionOutOfRange {
                start,
                end: start + len,
                len: available,
            });
        }
        Ok(RotarySlice {
            cos: self.cos.narrow(0, start, len)?,
            sin: self.sin.narrow(0, start, len)?,
        })
    }

    /// Number of positions covered.
    pub fn len(&self) -> usize {
        self.cos.dims()[0]
    }

    /// Whether the table covers no positions.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get the head dimension.
    pub fn head_dim(&self) -> usize {
        self.head_dim
    }

    /// Get the device the table lives on.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Real parts of the factors.
    pub fn cos(&self) -> &Tensor {
        &self.cos
    }

    /// Imaginary parts of the factors.
    pub fn sin(&self) -> &Tensor {
        &self.sin
    }
}

/// Rotation factors for one window of positions.
#[derive(Debug, Clone)]
pub struct RotarySlice {
    /// [seq_len, head_dim / 2]
    cos: Tensor,
    /// [seq_len, head_dim / 2]
    sin: Tensor,
}

impl RotarySlice {
    /// Number of positions in the window.
    pub fn seq_len(&self) -> usize {
        self.cos.dims()[0]
    }

    /// Rotate a query or key tensor.
    ///
    /// # Arguments
    ///
    /// * `x` - Tensor [batch, heads, seq_len, head_dim]
    pub fn apply(&self, x: &Tensor) -> Result<Tensor> {
        let (batch, heads, seq_len, head_dim) = x.dims4()?;
        if seq_len != self.seq_len() {
            return Err(LaminaError::ShapeMismatch(format!(
                "rotary window covers {} positions, input has {}",
                self.seq_len(),
                seq_len
            )));
        }
        let half_dim = head_dim / 2;

        let pairs = x.reshape((batch, heads, seq_len, half_dim, 2))?;
        let real = pairs.narrow(4, 0, 1)?.squeeze(4)?;
        let imag = pairs.narrow(4, 1, 1)?.squeeze(4)?;

        // [1, 1, seq_len, half_dim] for broadcasting
        let cos = self.cos.to_dtype(x.dtype())?.unsqueeze(0)?.unsqueeze(0)?;
        let sin = self.sin.to_dtype(x.dtype())?.unsqueeze(0)?.unsqueeze(0)?;

        // (a + ib)(c + is) = (ac - bs) + i(as + bc)
        let out_real = (real.broadcast_mul(&cos)? - imag.broadcast_mul(&sin)?)?;
        let out_imag = (real.broadcast_mul(&sin)? + imag.broadcast_mul(&cos)?)?;

        Ok(Tensor::stack(&[out_real, out_imag], 4)?.reshape((batch, heads, seq_len, head_dim))?)
    }
}

/// Rotary tables computed on demand, one per device.
#[derive(Debug)]
pub struct RotaryCache {
    head_dim: usize,
    max_seq_len: usize,
    theta: f64,
    tables: RwLock<Vec<RotaryTable>>,
}

impl RotaryCache {
    /// Create an empty cache for the given geometry.
    pub fn new(head_dim: usize, max_seq_len: usize, theta: f64) -> Self {
        Self {
            head_dim,
            max_seq_len,
            theta,
            tables: RwLock::new(Vec::new()),
        }
    }

    /// Get the table for `device`, computing it on first use.
    pub fn get(&self, device: &Device) -> Result<RotaryTable> {
        if let Some(table) = self.find(device) {
            return Ok(table);
        }

        let mut tables = self.tables.write();
        // Another caller may have filled it while we waited
        if let Some(table) = tables.iter().find(|t| t.device.same_device(device)) {
            return Ok(table.clone());
        }
        let table = RotaryTable::new(self.head_dim, self.max_seq_len, self.theta, device)?;
        tables.push(table.clone());
        Ok(table)
    }

    fn find(&self, device: &Device) -> Option<RotaryTable> {
        self.tables
            .read()
            .iter()
            .find(|t| t.device.same_device(device))
            .cloned()
    }

    /// Number of devices with a computed table.
    pub fn num_devices(&self) -> usize {
        self.tables.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    fn table_as_f64(table: &RotaryTable) -> (Vec<Vec<f64>>, Vec<Vec<f64>>) {
        let cos = table.cos().to_dtype(DType::F64).unwrap().to_vec2().unwrap();
        let sin = table.sin().to_dtype(DType::F64).unwrap().to_vec2().unwrap();
        (cos, sin)
    }

    #[test]
    fn table_covers_twice_max_len() {
        let table = RotaryTable::new(64, 128, 10000.0, &Device::Cpu).unwrap();
        assert_eq!(table.len(), 256);
        assert_eq!(table.cos().dims(), &[256, 32]);
        assert_eq!(table.sin().dims(), &[256, 32]);
    }

    #[test]
    fn factors_have_unit_magnitude() {
        let table = RotaryTable::new(16, 8, 10000.0, &Device::Cpu).unwrap();
        let (cos, sin) = table_as_f64(&table);

        for (row_c, row_s) in cos.iter().zip(sin.iter()) {
            for (c, s) in row_c.iter().zip(row_s.iter()) {
                assert!((c * c + s * s - 1.0).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn angles_follow_frequency_schedule() {
        let head_dim = 8;
        let table = RotaryTable::new(head_dim, 8, 10000.0, &Device::Cpu).unwrap();
        let (cos, sin) = table_as_f64(&table);

        let position = 5usize;
        for k in 0..head_dim / 2 {
            let theta = 10000f64.powf(-2.0 * k as f64 / head_dim as f64);
            let angle = position as f64 * theta;
            assert!((cos[position][k] - angle.cos()).abs() < 1e-4);
            assert!((sin[position][k] - angle.sin()).abs() < 1e-4);
        }
    }

    #[test]
    fn odd_head_dim_rejected() {
        assert!(RotaryTable::new(7, 8, 10000.0, &Device::Cpu).is_err());
    }

    #[test]
    fn narrow_past_end_is_position_error() {
        let table = RotaryTable::new(8, 4, 10000.0, &Device::Cpu).unwrap();
        assert!(table.narrow(6, 2).is_ok());
        assert!(matches!(
            table.narrow(7, 2),
            Err(LaminaError::PositionOutOfRange { start: 7, end: 9, len: 8 })
        ));
    }

    #[test]
    fn position_zero_is_identity() {
        let table = RotaryTable::new(8, 4, 10000.0, &Device::Cpu).unwrap();
        let slice = table.narrow(0, 1).unwrap();

        let x = Tensor::randn(0.0f32, 1.0, &[1, 2, 1, 8], &Device::Cpu).unwrap();
        let rotated = slice.apply(&x).unwrap();

        let diff: f32 = (rotated - &x).unwrap().abs().unwrap().sum_all().unwrap().to_scalar().unwrap();
        assert!(diff < 1e-6);
    }

    #[test]
    fn rotation_of_first_pair() {
        // Pair k = 0 has theta = 1, so position 1 rotates by 1 radian
        let table = RotaryTable::new(2, 4, 10000.0, &Device::Cpu).unwrap();
        let slice = table.narrow(1, 1).unwrap();

        let x = Tensor::new(&[1.0f32, 0.0], &Device::Cpu)
            .unwrap()
            .reshape((1, 1, 1, 2))
            .unwrap();
        let out: Vec<f32> = slice.apply(&x).unwrap().flatten_all().unwrap().to_vec1().unwrap();

        assert!((out[0] - 1f32.cos()).abs() < 1e-5);
        assert!((out[1] - 1f32.sin()).abs() < 1e-5);
    }

    #[test]
    fn dot_product_depends_on_relative_position() {
        let table = RotaryTable::new(16, 32, 10000.0, &Device::Cpu).unwrap();
        let q = Tensor::randn(0.0f32, 1.0, &[1, 1, 1, 16], &Device::Cpu).unwrap();
        let k = Tensor::randn(0.0f32, 1.0, &[1, 1, 1, 16], &Device::Cpu).unwrap();

        let score = |m: usize, n: usize| -> f32 {
            let q = table.narrow(m, 1).unwrap().apply(&q).unwrap();
            let k = table.narrow(n, 1).unwrap().apply(&k).unwrap();
            (q * k).unwrap().sum_all().unwrap().to_scalar().unwrap()
        };

        assert!((score(3, 1) - score(12, 10)).abs() < 1e-3);
        assert!((score(0, 0) - score(20, 20)).abs() < 1e-3);
    }

    #[test]
    fn apply_rejects_window_mismatch() {
        let table = RotaryTable::new(8, 8, 10000.0, &Device::Cpu).unwrap();
        let slice = table.narrow(0, 3).unwrap();
        let x = Tensor::zeros(&[1, 2, 4, 8], DType::F32, &Device::Cpu).unwrap();
        assert!(slice.apply(&x).is_err());
    }

    #[test]
    fn cache_computes_once_per_device() {
        let cache = RotaryCache::new(8, 16, 10000.0);
        assert_eq!(cache.num_devices(), 0);

        let a = cache.get(&Device::Cpu).unwrap();
        let b = cache.get(&Device::Cpu).unwrap();

        assert_eq!(cache.num_devices(), 1);
        assert_eq!(a.len(), 32);
        assert_eq!(b.len(), 32);
    }
}
