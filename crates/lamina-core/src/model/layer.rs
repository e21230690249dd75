//! Transformer block implementation.
//!
//! A single decoder block combining:
//! - Pre-attention RMSNorm
//! - Masked multi-head self-attention with rotary positions
//! - Pre-feed-forward RMSNorm
//! - SwiGLU feed-forward
//!
//! Both sublayers add their output back onto the residual stream.

use super::{linear, normal_init, FeedForward, LayerCache, RmsNorm, RotarySlice};
use crate::error::{LaminaError, Result};
use candle_core::{DType, Device, Tensor, D};

/// Per-call directives shared by every block of one forward pass.
#[derive(Debug, Clone)]
pub struct BlockContext {
    /// Absolute position of the first token in the window.
    pub start_pos: usize,
    /// Whether blocks read and write their KV cache.
    pub use_cache: bool,
    /// Rotation factors for `[start_pos, start_pos + seq_len)`.
    pub rotary: RotarySlice,
    /// Additive causal mask, absent for single-token windows.
    pub mask: Option<Tensor>,
}

/// Multi-head self-attention.
#[derive(Debug, Clone)]
pub struct Attention {
    /// Query projection: [dim, dim]
    wq: Tensor,
    /// Key projection: [dim, dim]
    wk: Tensor,
    /// Value projection: [dim, dim]
    wv: Tensor,
    /// Output projection: [dim, dim]
    wo: Tensor,
    /// Number of attention heads.
    n_heads: usize,
    /// Head dimension.
    head_dim: usize,
}

impl Attention {
    /// Create attention from projection weights.
    pub fn new(wq: Tensor, wk: Tensor, wv: Tensor, wo: Tensor, n_heads: usize) -> Result<Self> {
        let dim = wq.dims2()?.0;
        if n_heads == 0 || dim % n_heads != 0 {
            return Err(LaminaError::InvalidDimensions { dim, n_heads });
        }
        Ok(Self {
            wq,
            wk,
            wv,
            wo,
            n_heads,
            head_dim: dim / n_heads,
        })
    }

    /// Create attention with normal-initialized weights.
    pub fn init(dim: usize, n_heads: usize, std: f64, dtype: DType, device: &Device) -> Result<Self> {
        Self::new(
            normal_init(std, (dim, dim), dtype, device)?,
            normal_init(std, (dim, dim), dtype, device)?,
            normal_init(std, (dim, dim), dtype, device)?,
            normal_init(std, (dim, dim), dtype, device)?,
            n_heads,
        )
    }

    /// Forward pass.
    ///
    /// # Arguments
    ///
    /// * `x` - Normalized input [batch, seq_len, dim]
    /// * `ctx` - Window position, rotary slice and mask
    /// * `cache` - Layer cache, used only when `ctx.use_cache` is set
    pub fn forward(
        &self,
        x: &Tensor,
        ctx: &BlockContext,
        cache: Option<&mut LayerCache>,
    ) -> Result<Tensor> {
        let (batch, seq_len, dim) = x.dims3()?;

        let (q, k, v) = self.project(x)?;
        let q = ctx.rotary.apply(&q)?;
        let k = ctx.rotary.apply(&k)?;

        let (k, v) = match cache {
            Some(cache) if ctx.use_cache => cache.update(ctx.start_pos, &k, &v)?,
            _ => (k, v),
        };

        let attn = self.attend(&q, &k, &v, ctx.mask.as_ref())?;

        // [batch, heads, seq, head_dim] -> [batch, seq, dim]
        let attn = attn.transpose(1, 2)?.reshape((batch, seq_len, dim))?;
        linear(&attn, &self.wo)
    }

    /// Compute Q, K, V as [batch, n_heads, seq_len, head_dim].
    fn project(&self, x: &Tensor) -> Result<(Tensor, Tensor, Tensor)> {
        let (batch, seq_len, _) = x.dims3()?;
        let split = |t: Tensor| -> Result<Tensor> {
            Ok(t.reshape((batch, seq_len, self.n_heads, self.head_dim))?
                .transpose(1, 2)?
                .contiguous()?)
        };

        Ok((
            split(linear(x, &self.wq)?)?,
            split(linear(x, &self.wk)?)?,
            split(linear(x, &self.wv)?)?,
        ))
    }

    /// Scaled dot-product attention with an optional additive mask.
    fn attend(&self, q: &Tensor, k: &Tensor, v: &Tensor, mask: Option<&Tensor>) -> Result<Tensor> {
        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let dtype = q.dtype();

        let scores = (q.matmul(&k.t()?)? * scale)?;

        let scores = match mask {
            Some(mask) => {
                let (rows, cols) = (mask.dims()[2], mask.dims()[3]);
                let (q_len, kv_len) = (scores.dims()[2], scores.dims()[3]);
                if rows != q_len || cols != kv_len {
                    return Err(LaminaError::ShapeMismatch(format!(
                        "mask [{}, {}] does not cover scores [{}, {}]; \
                         multi-token windows must start an empty cache",
                        rows, cols, q_len, kv_len
                    )));
                }
                scores.broadcast_add(mask)?
            }
            None => scores,
        };

        // Softmax in f32
        let weights = candle_nn::ops::softmax(&scores.to_dtype(DType::F32)?, D::Minus1)?.to_dtype(dtype)?;
        Ok(weights.matmul(v)?)
    }

    /// Named weights.
    pub fn parameters(&self) -> [(&'static str, &Tensor); 4] {
        [
            ("wq.weight", &self.wq),
            ("wk.weight", &self.wk),
            ("wv.weight", &self.wv),
            ("wo.weight", &self.wo),
        ]
    }

    pub(crate) fn parameters_mut(&mut self) -> [(&'static str, &mut Tensor); 4] {
        [
            ("wq.weight", &mut self.wq),
            ("wk.weight", &mut self.wk),
            ("wv.weight", &mut self.wv),
            ("wo.weight", &mut self.wo),
        ]
    }
}

/// A single transformer decoder block.
#[derive(Debug, Clone)]
pub struct TransformerBlock {
    /// Pre-attention norm.
    attention_norm: RmsNorm,
    /// Self-attention.
    attention: Attention,
    /// Pre-feed-forward norm.
    ffn_norm: RmsNorm,
    /// Feed-forward.
    feed_forward: FeedForward,
    /// Block index (for debugging).
    layer_id: usize,
}

impl TransformerBlock {
    /// Create a new transformer block.
    pub fn new(
        attention_norm: RmsNorm,
        attention: Attention,
        ffn_norm: RmsNorm,
        feed_forward: FeedForward,
        layer_id: usize,
    ) -> Self {
        Self {
            attention_norm,
            attention,
            ffn_norm,
            feed_forward,
            layer_id,
        }
    }

    /// Create a block with normal-initialized projections and unit norms.
    pub fn init(
        layer_id: usize,
        config: &super::LlamaConfig,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let std = config.initializer_range;
        Ok(Self {
            attention_norm: RmsNorm::ones(config.dim, config.norm_eps, dtype, device)?,
            attention: Attention::init(config.dim, config.n_heads, std, dtype, device)?,
            ffn_norm: RmsNorm::ones(config.dim, config.norm_eps, dtype, device)?,
            feed_forward: FeedForward::init(config.dim, config.ffn_hidden_dim(), std, dtype, device)?,
            layer_id,
        })
    }

    /// Forward pass.
    ///
    /// # Arguments
    ///
    /// * `x` - Hidden states [batch, seq_len, dim]
    /// * `ctx` - Per-call directives from the model
    /// * `cache` - This block's KV cache, if the caller keeps one
    pub fn forward(
        &self,
        x: &Tensor,
        ctx: &BlockContext,
        cache: Option<&mut LayerCache>,
    ) -> Result<Tensor> {
        let normed = self.attention_norm.forward(x)?;
        let h = (x + self.attention.forward(&normed, ctx, cache)?)?;

        let normed = self.ffn_norm.forward(&h)?;
        Ok((&h + self.feed_forward.forward(&normed)?)?)
    }

    /// Get the block index.
    pub fn layer_id(&self) -> usize {
        self.layer_id
    }

    /// Named weights, relative to the block.
    pub fn parameters(&self) -> Vec<(String, &Tensor)> {
        let mut params = vec![
            ("attention_norm.weight".to_string(), self.attention_norm.weight()),
            ("ffn_norm.weight".to_string(), self.ffn_norm.weight()),
        ];
        params.extend(
            self.attention
                .parameters()
                .into_iter()
                .map(|(name, t)| (format!("attention.{}", name), t)),
        );
        params.extend(
            self.feed_forward
                .parameters()
                .into_iter()
                .map(|(name, t)| (format!("feed_forward.{}", name), t)),
        );
        params
    }

    pub(crate) fn parameters_mut(&mut self) -> Vec<(String, &mut Tensor)> {
        let mut params = vec![
            ("attention_norm.weight".to_string(), self.attention_norm.weight_mut()),
            ("ffn_norm.weight".to_string(), self.ffn_norm.weight_mut()),
        ];
        params.extend(
            self.attention
                .parameters_mut()
                .into_iter()
                .map(|(name, t)| (format!("attention.{}", name), t)),
        );
        params.extend(
            self.feed_forward
                .parameters_mut()
                .into_iter()
                .map(|(name, t)| (format!("feed_forward.{}", name), t)),
        );
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{causal_mask, max_abs_diff, LlamaConfig, RotaryTable};

    fn create_test_block() -> (TransformerBlock, RotaryTable) {
        let config = LlamaConfig::tiny();
        let block = TransformerBlock::init(0, &config, DType::F32, &Device::Cpu).unwrap();
        let table = RotaryTable::new(config.head_dim(), config.max_seq_len, 10000.0, &Device::Cpu).unwrap();
        (block, table)
    }

    fn context(table: &RotaryTable, start_pos: usize, seq_len: usize, use_cache: bool) -> BlockContext {
        BlockContext {
            start_pos,
            use_cache,
            rotary: table.narrow(start_pos, seq_len).unwrap(),
            mask: causal_mask(seq_len, start_pos, DType::F32, &Device::Cpu).unwrap(),
        }
    }

    #[test]
    fn attention_projection_shapes() {
        let attn = Attention::init(32, 4, 0.02, DType::F32, &Device::Cpu).unwrap();

        let x = Tensor::randn(0.0f32, 1.0, &[2, 8, 32], &Device::Cpu).unwrap();
        let (q, k, v) = attn.project(&x).unwrap();

        assert_eq!(q.dims(), &[2, 4, 8, 8]);
        assert_eq!(k.dims(), &[2, 4, 8, 8]);
        assert_eq!(v.dims(), &[2, 4, 8, 8]);
    }

    #[test]
    fn attention_rejects_indivisible_heads() {
        let w = Tensor::zeros((30, 30), DType::F32, &Device::Cpu).unwrap();
        let result = Attention::new(w.clone(), w.clone(), w.clone(), w, 4);
        assert!(matches!(result, Err(LaminaError::InvalidDimensions { .. })));
    }

    #[test]
    fn block_forward_shape() {
        let (block, table) = create_test_block();

        let x = Tensor::randn(0.0f32, 1.0, &[1, 6, 32], &Device::Cpu).unwrap();
        let output = block.forward(&x, &context(&table, 0, 6, false), None).unwrap();

        assert_eq!(output.dims(), &[1, 6, 32]);
    }

    #[test]
    fn block_is_causal() {
        let (block, table) = create_test_block();
        let ctx = context(&table, 0, 5, false);

        let x = Tensor::randn(0.0f32, 1.0, &[1, 5, 32], &Device::Cpu).unwrap();
        let out = block.forward(&x, &ctx, None).unwrap();

        // Changing the last token must not affect earlier positions
        let tail = Tensor::randn(0.0f32, 1.0, &[1, 1, 32], &Device::Cpu).unwrap();
        let changed = Tensor::cat(&[&x.narrow(1, 0, 4).unwrap(), &tail], 1).unwrap();
        let out_changed = block.forward(&changed, &ctx, None).unwrap();

        let prefix = out.narrow(1, 0, 4).unwrap();
        let prefix_changed = out_changed.narrow(1, 0, 4).unwrap();
        assert!(max_abs_diff(&prefix, &prefix_changed) < 1e-5);
    }

    #[test]
    fn cached_decode_matches_full_window() {
        let (block, table) = create_test_block();
        let x = Tensor::randn(0.0f32, 1.0, &[1, 4, 32], &Device::Cpu).unwrap();

        let full = block.forward(&x, &context(&table, 0, 4, false), None).unwrap();

        let mut cache = LayerCache::new();
        let prefix = x.narrow(1, 0, 3).unwrap();
        block
            .forward(&prefix, &context(&table, 0, 3, true), Some(&mut cache))
            .unwrap();
        let last = x.narrow(1, 3, 1).unwrap();
        let step = block
            .forward(&last, &context(&table, 3, 1, true), Some(&mut cache))
            .unwrap();

        assert_eq!(cache.seq_len(), 4);
        assert!(max_abs_diff(&full.narrow(1, 3, 1).unwrap(), &step) < 1e-4);
    }

    #[test]
    fn cache_ignored_without_use_cache() {
        let (block, table) = create_test_block();
        let mut cache = LayerCache::new();

        let x = Tensor::randn(0.0f32, 1.0, &[1, 3, 32], &Device::Cpu).unwrap();
        block
            .forward(&x, &context(&table, 0, 3, false), Some(&mut cache))
            .unwrap();

        assert!(cache.is_empty());
    }

    #[test]
    fn multi_token_window_over_cached_prefix_is_rejected() {
        let (block, table) = create_test_block();
        let mut cache = LayerCache::new();

        let x = Tensor::randn(0.0f32, 1.0, &[1, 2, 32], &Device::Cpu).unwrap();
        block
            .forward(&x, &context(&table, 0, 2, true), Some(&mut cache))
            .unwrap();
        let result = block.forward(&x, &context(&table, 2, 2, true), Some(&mut cache));

        assert!(matches!(result, Err(LaminaError::ShapeMismatch(_))));
    }

    #[test]
    fn block_parameter_names() {
        let (block, _) = create_test_block();
        let names: Vec<String> = block.parameters().into_iter().map(|(n, _)| n).collect();

        assert_eq!(names.len(), 9);
        assert!(names.contains(&"attention.wq.weight".to_string()));
        assert!(names.contains(&"feed_forward.w2.weight".to_string()));
        assert!(names.contains(&"ffn_norm.weight".to_string()));
    }
}
