//! Model configuration.

use crate::error::{LaminaError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

/// Configuration for a LLaMA-style decoder.
///
/// Defaults describe a 7B-class model. Once a model is built from a config
/// the config is never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlamaConfig {
    /// Vocabulary size.
    pub vocab_size: usize,
    /// Hidden dimension.
    pub dim: usize,
    /// Maximum sequence length. The rotary table covers twice this.
    pub max_seq_len: usize,
    /// Maximum batch size served by a KV cache.
    pub max_batch_size: usize,
    /// Rounding multiple for the feed-forward hidden size.
    pub multiple_of: Option<usize>,
    /// Number of transformer blocks.
    pub n_layers: usize,
    /// Number of attention heads.
    pub n_heads: usize,
    /// RMS norm epsilon.
    pub norm_eps: f64,
    /// Standard deviation of the normal weight initializer.
    pub initializer_range: f64,
    /// Recompute activations instead of storing them.
    pub checkpoint_activations: bool,
    /// Read and write the KV cache during attention.
    pub use_cache: bool,
    /// Label value excluded from the loss.
    pub ignore_index: i64,
    /// Overlap communication with compute on the block-list backend.
    pub bmt_comm_overlap: bool,
    /// Rotary base frequency.
    pub rope_theta: f64,
}

/// Feed-forward rounding used when `multiple_of` is unset.
const DEFAULT_MULTIPLE_OF: usize = 256;

impl LlamaConfig {
    /// Head dimension.
    pub fn head_dim(&self) -> usize {
        self.dim / self.n_heads
    }

    /// Hidden size of the gated feed-forward sublayer.
    ///
    /// Two thirds of `4 * dim`, rounded up to `multiple_of`.
    pub fn ffn_hidden_dim(&self) -> usize {
        let multiple_of = self.multiple_of.unwrap_or(DEFAULT_MULTIPLE_OF).max(1);
        let hidden = 2 * (4 * self.dim) / 3;
        multiple_of * hidden.div_ceil(multiple_of)
    }

    /// Check the structural invariants needed to build a model.
    pub fn validate(&self) -> Result<()> {
        if self.n_heads == 0 || self.dim % self.n_heads != 0 || self.head_dim() % 2 != 0 {
            return Err(LaminaError::InvalidDimensions {
                dim: self.dim,
                n_heads: self.n_heads,
            });
        }
        if self.vocab_size == 0 || self.n_layers == 0 || self.max_seq_len == 0 {
            return Err(LaminaError::Config(format!(
                "vocab_size, n_layers and max_seq_len must be positive (got {}, {}, {})",
                self.vocab_size, self.n_layers, self.max_seq_len
            )));
        }
        Ok(())
    }

    /// Build a config from a generic key-value object.
    ///
    /// Starts from the defaults and copies in every key that names a config
    /// field. Unknown keys are skipped with a warning.
    pub fn from_map(entries: &Map<String, Value>) -> Result<Self> {
        let Value::Object(mut merged) = serde_json::to_value(Self::default())? else {
            return Err(LaminaError::Config("default config is not an object".into()));
        };

        for (key, value) in entries {
            match merged.get_mut(key) {
                Some(slot) => *slot = value.clone(),
                None => warn!(key = %key, "ignoring unknown config key"),
            }
        }

        serde_json::from_value(Value::Object(merged))
            .map_err(|e| LaminaError::Config(format!("invalid config value: {}", e)))
    }

    /// Build a config from a JSON value, which must be an object.
    pub fn from_json(value: &Value) -> Result<Self> {
        match value {
            Value::Object(map) => Self::from_map(map),
            other => Err(LaminaError::Config(format!(
                "expected a JSON object, got {}",
                other
            ))),
        }
    }

    /// Load from JSON file.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let value: Value = serde_json::from_str(&contents)?;
        Self::from_json(&value)
    }

    /// A tiny config for tests and examples.
    pub fn tiny() -> Self {
        Self {
            vocab_size: 64,
            dim: 32,
            max_seq_len: 32,
            max_batch_size: 4,
            multiple_of: Some(16),
            n_layers: 2,
            n_heads: 4,
            ..Self::default()
        }
    }
}

impl Default for LlamaConfig {
    fn default() -> Self {
        // LLaMA-7B-like defaults
        Self {
            vocab_size: 32000,
            dim: 4096,
            max_seq_len: 2048,
            max_batch_size: 32,
            multiple_of: None,
            n_layers: 32,
            n_heads: 32,
            norm_eps: 1e-6,
            initializer_range: 0.02,
            checkpoint_activations: false,
            use_cache: false,
            ignore_index: -100,
            bmt_comm_overlap: false,
            rope_theta: 10000.0,
        }
    }
}
