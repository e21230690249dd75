//! Error types for Lamina Core.

use thiserror::Error;

/// Result type alias for Lamina operations.
pub type Result<T> = std::result::Result<T, LaminaError>;

/// Errors that can occur while building or running a model.
#[derive(Error, Debug)]
pub enum LaminaError {
    /// Configuration value could not be applied.
    #[error("config error: {0}")]
    Config(String),

    /// Hidden dimension is not compatible with the head layout.
    #[error("invalid dimensions: dim {dim} is not divisible into {n_heads} heads of even size")]
    InvalidDimensions {
        /// Hidden dimension.
        dim: usize,
        /// Number of attention heads.
        n_heads: usize,
    },

    /// Token id outside the embedding table.
    #[error("token id {id} out of range for vocabulary of {vocab_size}")]
    TokenOutOfRange {
        /// Offending id.
        id: i64,
        /// Vocabulary size.
        vocab_size: usize,
    },

    /// Label outside the vocabulary that is not the ignore index.
    #[error("label {label} out of range for vocabulary of {vocab_size}")]
    LabelOutOfRange {
        /// Offending label.
        label: i64,
        /// Vocabulary size.
        vocab_size: usize,
    },

    /// Position window exceeds the rotary table.
    #[error("positions {start}..{end} exceed rotary table of {len} positions")]
    PositionOutOfRange {
        /// First requested position.
        start: usize,
        /// One past the last requested position.
        end: usize,
        /// Positions available.
        len: usize,
    },

    /// Batch larger than the configured cache capacity.
    #[error("batch of {batch} exceeds max_batch_size {max}")]
    BatchTooLarge {
        /// Requested batch.
        batch: usize,
        /// Configured maximum.
        max: usize,
    },

    /// KV cache state cannot serve the requested window.
    #[error("cache inconsistent: {0}")]
    CacheInconsistent(String),

    /// Execution backend needs strategies this crate does not provide.
    #[error("unsupported backend: {0}")]
    UnsupportedBackend(String),

    /// Model loading error.
    #[error("model error: {0}")]
    ModelError(String),

    /// Shape mismatch error.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// I/O error.
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    SerdeError(#[from] serde_json::Error),

    /// Candle tensor error.
    #[error("tensor error: {0}")]
    TensorError(#[from] candle_core::Error),
}
