//! # Lamina Core
//!
//! Decoder-only transformer language model in the LLaMA family.
//!
//! This crate provides:
//! - **Rotary position tables** cached per device
//! - **RMSNorm**, SwiGLU feed-forward and masked rotary self-attention
//! - **LlamaModel** forward pass with training loss and incremental decoding
//! - **Execution strategies** for embedding, projection, checkpointing and
//!   block scheduling, resolved once from the selected backend
//! - **SafeTensors** weight loading with non-strict name matching

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod error;
pub mod model;
pub mod strategy;

pub use error::{LaminaError, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::error::{LaminaError, Result};
    pub use crate::model::{KvCache, LlamaConfig, LlamaModel, LoadReport, ModelOutput};
    pub use crate::strategy::{Backend, Strategies};
}
