//! Additive causal attention mask.

use crate::error::Result;
use candle_core::{DType, Device, Tensor};

/// Build the causal mask for a window of `seq_len` tokens at `start_pos`.
///
/// Returns `None` for a single-token window: one query may attend to every
/// cached position. Otherwise returns a `[1, 1, seq_len, seq_len]` tensor
/// holding `-inf` at `(i, j)` when `j > i + start_pos` and zero elsewhere.
pub fn causal_mask(
    seq_len: usize,
    start_pos: usize,
    dtype: DType,
    device: &Device,
) -> Result<Option<Tensor>> {
    if seq_len <= 1 {
        return Ok(None);
    }

    let mask: Vec<f32> = (0..seq_len)
        .flat_map(|i| {
            (0..seq_len).map(move |j| {
                if j > i + start_pos {
                    f32::NEG_INFINITY
                } else {
                    0.0
                }
            })
        })
        .collect();

    let mask = Tensor::from_slice(&mask, (1, 1, seq_len, seq_len), device)?.to_dtype(dtype)?;
    Ok(Some(mask))
}
