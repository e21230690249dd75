//! SwiGLU feed-forward sublayer.
//!
//! # Formula
//!
//! `FFN(x) = w2(silu(w1 x) * w3 x)`
//!
//! Where `silu(x) = x * sigmoid(x)`
//!
//! # Reference
//!
//! [GLU Variants Improve Transformer](https://arxiv.org/abs/2002.05202)

use super::{linear, normal_init};
use crate::error::Result;
use candle_core::{DType, Device, Tensor};
use candle_nn::ops::silu;

/// SwiGLU feed-forward block.
#[derive(Debug, Clone)]
pub struct FeedForward {
    /// Gate projection: [hidden_dim, dim]
    w1: Tensor,
    /// Down projection: [dim, hidden_dim]
    w2: Tensor,
    /// Up projection: [hidden_dim, dim]
    w3: Tensor,
}

impl FeedForward {
    /// Create a feed-forward block from weights.
    pub fn new(w1: Tensor, w2: Tensor, w3: Tensor) -> Self {
        Self { w1, w2, w3 }
    }

    /// Create a feed-forward block with normal-initialized weights.
    pub fn init(
        dim: usize,
        hidden_dim: usize,
        std: f64,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        Ok(Self {
            w1: normal_init(std, (hidden_dim, dim), dtype, device)?,
            w2: normal_init(std, (dim, hidden_dim), dtype, device)?,
            w3: normal_init(std, (hidden_dim, dim), dtype, device)?,
        })
    }

    /// Forward pass.
    ///
    /// # Arguments
    ///
    /// * `x` - Input tensor [..., dim]
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let gate = silu(&linear(x, &self.w1)?)?;
        let up = linear(x, &self.w3)?;
        linear(&(gate * up)?, &self.w2)
    }

    /// Get the hidden dimension.
    pub fn dim(&self) -> usize {
        self.w1.dims()[1]
    }

    /// Get the intermediate dimension.
    pub fn hidden_dim(&self) -> usize {
        self.w1.dims()[0]
    }

    /// Named weights.
    pub fn parameters(&self) -> [(&'static str, &Tensor); 3] {
        [("w1.weight", &self.w1), ("w2.weight", &self.w2), ("w3.weight", &self.w3)]
    }

    pub(crate) fn parameters_mut(&mut self) -> [(&'static str, &mut Tensor); 3] {
        [
            ("w1.weight", &mut self.w1),
            ("w2.weight", &mut self.w2),
            ("w3.weight", &mut self.w3),
        ]
    }
}
