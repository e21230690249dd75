//! Execution strategies.
//!
//! The model never inspects the process environment while it runs. The
//! backend is resolved once at startup ([`Backend::from_env`]) and turned into
//! a [`Strategies`] bundle that is handed to the model at construction:
//! - [`EmbeddingStrategy`] - token embedding lookup
//! - [`LinearStrategy`] - vocabulary projection
//! - [`CheckpointStrategy`] - activation checkpointing wrapper
//! - [`BlockListStrategy`] - communication-overlapped block execution
//!
//! Sharded or distributed implementations belong to the runtime that provides
//! them; this crate ships the single-device versions in [`local`].

pub mod local;

use crate::error::{LaminaError, Result};
use crate::model::{BlockContext, KvCache, TransformerBlock};
use candle_core::Tensor;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

pub use local::{run_sequential, InlineCheckpoint, LocalEmbedding, LocalLinear, SequentialBlockList};

/// Training/inference runtime the process was started under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backend {
    /// Plain single-device execution.
    #[default]
    SingleDevice,
    /// Tensor-parallel embedding and projection with model-parallel checkpointing.
    TensorParallel,
    /// Data-parallel runtime with its own activation checkpointing.
    Deepspeed,
    /// Runtime able to overlap communication with block computation.
    Bmtrain,
}

impl Backend {
    /// Environment variable naming the backend.
    pub const ENV_VAR: &'static str = "ENV_TYPE";

    /// Read the backend from [`Backend::ENV_VAR`]. Unset or unknown values
    /// select [`Backend::SingleDevice`].
    pub fn from_env() -> Self {
        std::env::var(Self::ENV_VAR)
            .ok()
            .and_then(|value| value.parse().ok())
            .unwrap_or_default()
    }

    /// Whether block lists may overlap communication with compute.
    pub fn supports_comm_overlap(&self) -> bool {
        matches!(self, Backend::Bmtrain)
    }

    /// Selector string, as read from the environment.
    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::SingleDevice => "local",
            Backend::TensorParallel => "deepspeed+mpu",
            Backend::Deepspeed => "deepspeed",
            Backend::Bmtrain => "bmtrain",
        }
    }
}

impl FromStr for Backend {
    type Err = LaminaError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "" | "local" => Ok(Backend::SingleDevice),
            "deepspeed+mpu" => Ok(Backend::TensorParallel),
            "deepspeed" => Ok(Backend::Deepspeed),
            "bmtrain" => Ok(Backend::Bmtrain),
            other => Err(LaminaError::UnsupportedBackend(other.to_string())),
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Looks up token embeddings.
pub trait EmbeddingStrategy: Send + Sync + fmt::Debug {
    /// Embed `ids` [batch, seq_len] with `table` [vocab, dim].
    ///
    /// Ids are already range-checked by the model.
    fn embed(&self, table: &Tensor, ids: &Tensor) -> Result<Tensor>;
}

/// Applies a bias-free linear projection.
pub trait LinearStrategy: Send + Sync + fmt::Debug {
    /// Compute `x @ weight^T` for `weight` [out, in].
    fn project(&self, weight: &Tensor, x: &Tensor) -> Result<Tensor>;
}

/// Runs a function under activation checkpointing.
///
/// Implementations may drop the function's intermediate activations and run
/// it again during the backward pass. The returned value must equal `f(input)`.
pub trait CheckpointStrategy: Send + Sync + fmt::Debug {
    /// Evaluate `f(input)`.
    fn checkpoint(
        &self,
        f: &mut dyn FnMut(&Tensor) -> Result<Tensor>,
        input: &Tensor,
    ) -> Result<Tensor>;
}

/// Executes the whole block stack at once.
///
/// Used by runtimes that pipeline parameter communication across layers.
/// The result must equal running the blocks one after another.
pub trait BlockListStrategy: Send + Sync + fmt::Debug {
    /// Run `blocks` in order over `hidden`.
    fn run(
        &self,
        blocks: &[TransformerBlock],
        hidden: Tensor,
        ctx: &BlockContext,
        cache: Option<&mut KvCache>,
    ) -> Result<Tensor>;
}

/// Strategy objects a model is built with.
#[derive(Debug, Clone)]
pub struct Strategies {
    backend: Backend,
    embedding: Arc<dyn EmbeddingStrategy>,
    linear: Arc<dyn LinearStrategy>,
    checkpoint: Arc<dyn CheckpointStrategy>,
    block_list: Option<Arc<dyn BlockListStrategy>>,
}

impl Strategies {
    /// Single-device strategies.
    pub fn local() -> Self {
        Self {
            backend: Backend::SingleDevice,
            embedding: Arc::new(LocalEmbedding),
            linear: Arc::new(LocalLinear),
            checkpoint: Arc::new(InlineCheckpoint),
            block_list: None,
        }
    }

    /// Default strategies for `backend`.
    ///
    /// [`Backend::TensorParallel`] shards embeddings and projections, which
    /// this crate cannot do; build it with [`Strategies::local`] and the
    /// runtime's own strategies via the `with_*` methods instead.
    pub fn for_backend(backend: Backend) -> Result<Self> {
        let strategies = match backend {
            Backend::SingleDevice | Backend::Deepspeed => Self::local(),
            Backend::Bmtrain => Self::local().with_block_list(Arc::new(SequentialBlockList)),
            Backend::TensorParallel => {
                return Err(LaminaError::UnsupportedBackend(format!(
                    "{} needs sharded embedding and linear strategies from its runtime",
                    backend
                )))
            }
        };
        Ok(strategies.with_backend(backend))
    }

    /// Set the backend these strategies run under.
    pub fn with_backend(mut self, backend: Backend) -> Self {
        self.backend = backend;
        self
    }

    /// Replace the embedding strategy.
    pub fn with_embedding(mut self, embedding: Arc<dyn EmbeddingStrategy>) -> Self {
        self.embedding = embedding;
        self
    }

    /// Replace the projection strategy.
    pub fn with_linear(mut self, linear: Arc<dyn LinearStrategy>) -> Self {
        self.linear = linear;
        self
    }

    /// Replace the checkpoint strategy.
    pub fn with_checkpoint(mut self, checkpoint: Arc<dyn CheckpointStrategy>) -> Self {
        self.checkpoint = checkpoint;
        self
    }

    /// Install a block-list strategy.
    pub fn with_block_list(mut self, block_list: Arc<dyn BlockListStrategy>) -> Self {
        self.block_list = Some(block_list);
        self
    }

    /// Get the backend.
    pub fn backend(&self) -> Backend {
        self.backend
    }

    /// Get the embedding strategy.
    pub fn embedding(&self) -> &dyn EmbeddingStrategy {
        self.embedding.as_ref()
    }

    /// Get the projection strategy.
    pub fn linear(&self) -> &dyn LinearStrategy {
        self.linear.as_ref()
    }

    /// Get the checkpoint strategy.
    pub fn checkpoint(&self) -> &dyn CheckpointStrategy {
        self.checkpoint.as_ref()
    }

    /// Block-list strategy, when the backend can overlap communication.
    pub fn block_list(&self) -> Option<&dyn BlockListStrategy> {
        if self.backend.supports_comm_overlap() {
            self.block_list.as_deref()
        } else {
            None
        }
    }
}

impl Default for Strategies {
    fn default() -> Self {
        Self::local()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_parsing() {
        assert_eq!("".parse::<Backend>().unwrap(), Backend::SingleDevice);
        assert_eq!("deepspeed+mpu".parse::<Backend>().unwrap(), Backend::TensorParallel);
        assert_eq!("deepspeed".parse::<Backend>().unwrap(), Backend::Deepspeed);
        assert_eq!(" bmtrain ".parse::<Backend>().unwrap(), Backend::Bmtrain);
        assert!("horovod".parse::<Backend>().is_err());
    }

    #[test]
    fn backend_round_trips_through_display() {
        for backend in [
            Backend::SingleDevice,
            Backend::TensorParallel,
            Backend::Deepspeed,
            Backend::Bmtrain,
        ] {
            assert_eq!(backend.to_string().parse::<Backend>().unwrap(), backend);
        }
    }

    #[test]
    fn only_bmtrain_overlaps() {
        assert!(Backend::Bmtrain.supports_comm_overlap());
        assert!(!Backend::Deepspeed.supports_comm_overlap());
        assert!(!Backend::SingleDevice.supports_comm_overlap());
    }

    #[test]
    fn tensor_parallel_needs_injected_strategies() {
        let result = Strategies::for_backend(Backend::TensorParallel);
        assert!(matches!(result, Err(LaminaError::UnsupportedBackend(_))));
    }

    #[test]
    fn bmtrain_gets_a_block_list() {
        let strategies = Strategies::for_backend(Backend::Bmtrain).unwrap();
        assert_eq!(strategies.backend(), Backend::Bmtrain);
        assert!(strategies.block_list().is_some());
    }

    #[test]
    fn block_list_hidden_on_other_backends() {
        let strategies = Strategies::local().with_block_list(Arc::new(SequentialBlockList));
        assert!(strategies.block_list().is_none());
    }
}
