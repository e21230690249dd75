//! # Lamina
//!
//! LLaMA-style decoder language model with a small generation engine.
//!
//! Lamina re-exports [`lamina_core`] and adds:
//! - **Engine**: build a model from a config and a directory of SafeTensors
//!   weights, with the execution backend resolved once from `ENV_TYPE`
//! - **Generation**: greedy, temperature and nucleus sampling over cached
//!   incremental decoding
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use lamina::prelude::*;
//!
//! fn main() -> anyhow::Result<()> {
//!     let engine = Engine::builder()
//!         .model_dir("/models/llama-7b")
//!         .build()?;
//!
//!     let result = engine
//!         .generate(&[1, 450, 4996])
//!         .max_tokens(32)
//!         .temperature(0.8)
//!         .execute()?;
//!
//!     println!("{:?}", result.tokens);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

// Re-export core crate
pub use lamina_core::*;

mod engine;
mod sampling;

pub use engine::{Engine, EngineBuilder, EngineConfig, GenerateRequest, GenerateResult, CONFIG_FILE};
pub use sampling::{argmax, sample, SamplingParams};

/// Commonly used types.
pub mod prelude {
    pub use crate::engine::{Engine, EngineBuilder, EngineConfig, GenerateRequest, GenerateResult};
    pub use crate::sampling::SamplingParams;
    pub use crate::{
        error::{LaminaError, Result},
        model::{KvCache, LlamaConfig, LlamaModel, LoadReport, ModelOutput},
        strategy::{Backend, Strategies},
    };

    // Re-export useful external types
    pub use anyhow;
    pub use candle_core::{DType, Device, Tensor};
    pub use tracing;
}
