//! Model definition and inference.
//!
//! Provides the pieces of a LLaMA-style decoder:
//! - Model configuration
//! - Rotary tables, RMSNorm, attention and feed-forward blocks
//! - Causal mask and language-modeling loss
//! - Forward pass with optional KV cache
//! - Weight loading

mod config;
mod kv_cache;
mod layer;
mod loader;
mod loss;
mod mask;
mod mlp;
mod rmsnorm;
mod rope;
mod transformer;

pub use config::LlamaConfig;
pub use kv_cache::{KvCache, LayerCache};
pub use layer::{Attention, BlockContext, TransformerBlock};
pub use loader::{unwrap_module, LoadReport, WeightLoader};
pub use loss::causal_lm_loss;
pub(crate) use loss::check_label_range;
pub use mask::causal_mask;
pub use mlp::FeedForward;
pub use rmsnorm::RmsNorm;
pub use rope::{RotaryCache, RotarySlice, RotaryTable};
pub use transformer::{LlamaModel, ModelOutput};

use crate::error::Result;
use candle_core::{DType, Device, Shape, Tensor};

/// `x @ weight^T` for `x` of shape [..., in] and `weight` of shape [out, in].
pub(crate) fn linear(x: &Tensor, weight: &Tensor) -> Result<Tensor> {
    let (out_features, in_features) = weight.dims2()?;
    let mut dims = x.dims().to_vec();
    let rows = x.elem_count() / in_features.max(1);

    let out = x.reshape((rows, in_features))?.matmul(&weight.t()?)?;

    if let Some(last) = dims.last_mut() {
        *last = out_features;
    }
    Ok(out.reshape(dims)?)
}

/// Weights drawn from `N(0, std)`.
pub(crate) fn normal_init<S: Into<Shape>>(
    std: f64,
    shape: S,
    dtype: DType,
    device: &Device,
) -> Result<Tensor> {
    Ok(Tensor::randn(0.0f32, std as f32, shape, device)?.to_dtype(dtype)?)
}

/// Largest absolute elementwise difference between two tensors.
#[cfg(test)]
pub(crate) fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
    (a - b)
        .unwrap()
        .abs()
        .unwrap()
        .flatten_all()
        .unwrap()
        .max(0)
        .unwrap()
        .to_dtype(DType::F32)
        .unwrap()
        .to_scalar()
        .unwrap()
}
