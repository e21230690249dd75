//! LLaMA-style decoder model.
//!
//! One forward pass serves both modes:
//! - **Training** (labels given): final norm, full-window projection and the
//!   shifted cross-entropy loss.
//! - **Inference** (no labels): the last position is projected without the
//!   final norm and returned as f32 logits `[batch, 1, vocab]`.

use super::loader::{assign, unwrap_module, LoadReport, WeightLoader};
use super::{
    causal_lm_loss, causal_mask, check_label_range, normal_init, BlockContext, KvCache,
    LlamaConfig, RmsNorm, RotaryCache, TransformerBlock,
};
use crate::error::{LaminaError, Result};
use crate::strategy::{run_sequential, Strategies};
use candle_core::{DType, Device, Tensor};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info};

/// Result of a forward pass.
#[derive(Debug, Clone)]
pub struct ModelOutput {
    /// Training: `[batch, seq_len, vocab]` in the model dtype.
    /// Inference: `[batch, 1, vocab]` in f32.
    pub logits: Tensor,
    /// Mean next-token loss, present when labels were given.
    pub loss: Option<Tensor>,
    /// Present when labels were given; the same tensor as `logits`.
    pub hidden_states: Option<Tensor>,
}

/// Decoder-only transformer language model.
#[derive(Debug)]
pub struct LlamaModel {
    /// Model configuration.
    config: LlamaConfig,
    /// Token embeddings: [vocab_size, dim]
    tok_embeddings: Tensor,
    /// Decoder blocks.
    layers: Vec<TransformerBlock>,
    /// Final norm, applied in training only.
    norm: RmsNorm,
    /// Vocabulary projection: [vocab_size, dim]
    output: Tensor,
    /// Per-device rotary tables.
    rotary: RotaryCache,
    /// Backend-specific execution.
    strategies: Strategies,
    /// Parameter device.
    device: Device,
    /// Parameter dtype.
    dtype: DType,
}

impl LlamaModel {
    /// Build a model with freshly initialized parameters.
    pub fn new(
        config: &LlamaConfig,
        strategies: Strategies,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        config.validate()?;
        if dtype == DType::BF16 && device.is_cpu() {
            return Err(LaminaError::Config(
                "bf16 matmul is not supported on the CPU device".to_string(),
            ));
        }
        let std = config.initializer_range;

        let layers = (0..config.n_layers)
            .map(|layer_id| TransformerBlock::init(layer_id, config, dtype, device))
            .collect::<Result<Vec<_>>>()?;

        let model = Self {
            config: config.clone(),
            tok_embeddings: normal_init(std, (config.vocab_size, config.dim), dtype, device)?,
            layers,
            norm: RmsNorm::ones(config.dim, config.norm_eps, dtype, device)?,
            output: normal_init(std, (config.vocab_size, config.dim), dtype, device)?,
            rotary: RotaryCache::new(config.head_dim(), config.max_seq_len, config.rope_theta),
            strategies,
            device: device.clone(),
            dtype,
        };

        info!(
            n_layers = config.n_layers,
            dim = config.dim,
            n_heads = config.n_heads,
            vocab_size = config.vocab_size,
            backend = %model.strategies.backend(),
            "Built LlamaModel"
        );

        Ok(model)
    }

    /// Run the model over a window of tokens.
    ///
    /// # Arguments
    ///
    /// * `input_ids` - Token ids [batch, seq_len]
    /// * `start_pos` - Absolute position of the first token
    /// * `labels` - Target ids [batch, seq_len]; selects training mode
    /// * `cache` - KV cache, read and written when `use_cache` is configured
    ///
    /// With a cache, a multi-token window must start the cache over
    /// (`start_pos == 0`); later windows are one token each. Every input is
    /// checked before the first block runs, so a rejected call leaves the
    /// cache as it was.
    pub fn forward(
        &self,
        input_ids: &Tensor,
        start_pos: usize,
        labels: Option<&Tensor>,
        cache: Option<&mut KvCache>,
    ) -> Result<ModelOutput> {
        let (batch, seq_len) = input_ids.dims2()?;
        if seq_len == 0 {
            return Err(LaminaError::ShapeMismatch("empty input window".to_string()));
        }
        self.check_tokens(input_ids)?;
        if let Some(labels) = labels {
            if labels.dims() != input_ids.dims() {
                return Err(LaminaError::ShapeMismatch(format!(
                    "labels {:?} do not match input ids {:?}",
                    labels.dims(),
                    input_ids.dims()
                )));
            }
            check_label_range(labels, self.config.vocab_size, self.config.ignore_index)?;
        }

        debug!(
            mode = if labels.is_some() { "train" } else { "infer" },
            batch,
            seq_len,
            start_pos,
            "LlamaModel forward"
        );

        let cache = match cache {
            Some(cache) if self.config.use_cache => {
                if batch > self.config.max_batch_size {
                    return Err(LaminaError::BatchTooLarge {
                        batch,
                        max: self.config.max_batch_size,
                    });
                }
                if cache.num_layers() != self.layers.len() {
                    return Err(LaminaError::CacheInconsistent(format!(
                        "cache has {} layers, model has {}",
                        cache.num_layers(),
                        self.layers.len()
                    )));
                }
                self.check_cache_window(cache, seq_len, start_pos)?;
                Some(cache)
            }
            _ => None,
        };

        let hidden = self.checkpointed(input_ids, |ids: &Tensor| {
            self.strategies.embedding().embed(&self.tok_embeddings, ids)
        })?;

        let rotary = self.rotary.get(hidden.device())?.narrow(start_pos, seq_len)?;
        let mask = causal_mask(seq_len, start_pos, hidden.dtype(), hidden.device())?;
        let ctx = BlockContext {
            start_pos,
            use_cache: self.config.use_cache,
            rotary,
            mask,
        };

        let hidden = self.run_blocks(hidden, &ctx, cache)?;

        match labels {
            Some(labels) => {
                let hidden = self.norm.forward(&hidden)?;
                let logits = self.checkpointed(&hidden, |h: &Tensor| {
                    self.strategies.linear().project(&self.output, h)
                })?;
                let loss = causal_lm_loss(&logits, labels, self.config.ignore_index)?;
                Ok(ModelOutput {
                    hidden_states: Some(logits.clone()),
                    logits,
                    loss: Some(loss),
                })
            }
            None => {
                let last = hidden.narrow(1, seq_len - 1, 1)?.contiguous()?;
                let logits = self
                    .strategies
                    .linear()
                    .project(&self.output, &last)?
                    .to_dtype(DType::F32)?;
                Ok(ModelOutput {
                    logits,
                    loss: None,
                    hidden_states: None,
                })
            }
        }
    }

    /// Run `f` through the checkpoint strategy when activations are checkpointed.
    fn checkpointed<F>(&self, input: &Tensor, mut f: F) -> Result<Tensor>
    where
        F: FnMut(&Tensor) -> Result<Tensor>,
    {
        if self.config.checkpoint_activations {
            self.strategies.checkpoint().checkpoint(&mut f, input)
        } else {
            f(input)
        }
    }

    fn run_blocks(
        &self,
        hidden: Tensor,
        ctx: &BlockContext,
        mut cache: Option<&mut KvCache>,
    ) -> Result<Tensor> {
        if self.config.checkpoint_activations {
            let mut hidden = hidden;
            for block in &self.layers {
                let mut layer_cache = cache
                    .as_deref_mut()
                    .and_then(|c| c.layer_mut(block.layer_id()));
                hidden = self.strategies.checkpoint().checkpoint(
                    &mut |x: &Tensor| block.forward(x, ctx, layer_cache.as_deref_mut()),
                    &hidden,
                )?;
            }
            return Ok(hidden);
        }

        if self.config.bmt_comm_overlap {
            if let Some(block_list) = self.strategies.block_list() {
                return block_list.run(&self.layers, hidden, ctx, cache);
            }
        }

        run_sequential(&self.layers, hidden, ctx, cache)
    }

    /// Range-check ids with on-device reductions; only two scalars reach the host.
    fn check_tokens(&self, input_ids: &Tensor) -> Result<()> {
        let vocab_size = self.config.vocab_size;
        let ids = input_ids.flatten_all()?.to_dtype(DType::I64)?;

        let max: i64 = ids.max(0)?.to_scalar()?;
        if max < 0 || max as usize >= vocab_size {
            return Err(LaminaError::TokenOutOfRange { id: max, vocab_size });
        }
        let min: i64 = ids.min(0)?.to_scalar()?;
        if min < 0 {
            return Err(LaminaError::TokenOutOfRange { id: min, vocab_size });
        }
        Ok(())
    }

    /// The cache must be able to take the window without any layer writing first.
    fn check_cache_window(&self, cache: &KvCache, seq_len: usize, start_pos: usize) -> Result<()> {
        let cached = cache.seq_len();
        for layer_idx in 1..cache.num_layers() {
            let len = cache.layer(layer_idx).map_or(0, |l| l.seq_len());
            if len != cached {
                return Err(LaminaError::CacheInconsistent(format!(
                    "layer {} caches {} positions, layer 0 caches {}",
                    layer_idx, len, cached
                )));
            }
        }

        if seq_len > 1 && start_pos > 0 {
            return Err(LaminaError::CacheInconsistent(format!(
                "window of {} tokens at {} would extend a cached prefix; \
                 multi-token windows must start at 0",
                seq_len, start_pos
            )));
        }
        if start_pos > cached {
            return Err(LaminaError::CacheInconsistent(format!(
                "window starts at {} but only {} positions are cached",
                start_pos, cached
            )));
        }
        Ok(())
    }

    /// Empty KV cache sized for this model.
    pub fn new_cache(&self) -> KvCache {
        KvCache::new(self.layers.len())
    }

    /// All parameters with their checkpoint names.
    pub fn named_parameters(&self) -> Vec<(String, &Tensor)> {
        let mut params = vec![("tok_embeddings.weight".to_string(), &self.tok_embeddings)];
        for (i, layer) in self.layers.iter().enumerate() {
            params.extend(
                layer
                    .parameters()
                    .into_iter()
                    .map(|(name, t)| (format!("layers.{}.{}", i, name), t)),
            );
        }
        params.push(("norm.weight".to_string(), self.norm.weight()));
        params.push(("output.weight".to_string(), &self.output));
        params
    }

    fn parameters_mut(&mut self) -> Vec<(String, &mut Tensor)> {
        let mut params = vec![("tok_embeddings.weight".to_string(), &mut self.tok_embeddings)];
        for (i, layer) in self.layers.iter_mut().enumerate() {
            params.extend(
                layer
                    .parameters_mut()
                    .into_iter()
                    .map(|(name, t)| (format!("layers.{}.{}", i, name), t)),
            );
        }
        params.push(("norm.weight".to_string(), self.norm.weight_mut()));
        params.push(("output.weight".to_string(), &mut self.output));
        params
    }

    /// Assign parameters from a name-to-tensor map.
    ///
    /// Names under a `module.` container are unwrapped first. Missing and
    /// extra names are reported, not rejected.
    pub fn load_state_dict(&mut self, state: HashMap<String, Tensor>) -> Result<LoadReport> {
        let state = unwrap_module(state);
        assign(self.parameters_mut(), state)
    }

    /// Load parameters from a SafeTensors file.
    pub fn load_weights(&mut self, path: &Path) -> Result<LoadReport> {
        let state = WeightLoader::from_file(path, &self.device)?.into_tensors();
        let report = self.load_state_dict(state)?;

        info!(
            path = %path.display(),
            loaded = report.loaded.len(),
            missing = report.missing.len(),
            unexpected = report.unexpected.len(),
            "Loaded weights"
        );

        Ok(report)
    }

    /// Write every parameter to a SafeTensors file.
    pub fn save_weights(&self, path: &Path) -> Result<()> {
        let state: HashMap<String, Tensor> = self
            .named_parameters()
            .into_iter()
            .map(|(name, t)| (name, t.clone()))
            .collect();
        candle_core::safetensors::save(&state, path)?;
        Ok(())
    }

    /// Get model configuration.
    pub fn config(&self) -> &LlamaConfig {
        &self.config
    }

    /// Get the execution strategies.
    pub fn strategies(&self) -> &Strategies {
        &self.strategies
    }

    /// Get the decoder blocks.
    pub fn layers(&self) -> &[TransformerBlock] {
        &self.layers
    }

    /// Get device.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Get parameter dtype.
    pub fn dtype(&self) -> DType {
        self.dtype
    }
}
