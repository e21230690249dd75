//! Single-device strategies.

use super::{BlockListStrategy, CheckpointStrategy, EmbeddingStrategy, LinearStrategy};
use crate::error::Result;
use crate::model::{BlockContext, KvCache, TransformerBlock};
use candle_core::{Module, Tensor};
use candle_nn::{Embedding, Linear};

/// Embedding lookup on the table's own device.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalEmbedding;

impl EmbeddingStrategy for LocalEmbedding {
    fn embed(&self, table: &Tensor, ids: &Tensor) -> Result<Tensor> {
        let (_, dim) = table.dims2()?;
        Ok(Embedding::new(table.clone(), dim).forward(ids)?)
    }
}

/// Unsharded bias-free projection.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalLinear;

impl LinearStrategy for LocalLinear {
    fn project(&self, weight: &Tensor, x: &Tensor) -> Result<Tensor> {
        Ok(Linear::new(weight.clone(), None).forward(x)?)
    }
}

/// Runs the function directly and keeps every activation.
#[derive(Debug, Clone, Copy, Default)]
pub struct InlineCheckpoint;

impl CheckpointStrategy for InlineCheckpoint {
    fn checkpoint(
        &self,
        f: &mut dyn FnMut(&Tensor) -> Result<Tensor>,
        input: &Tensor,
    ) -> Result<Tensor> {
        f(input)
    }
}

/// Block list without communication overlap.
#[derive(Debug, Clone, Copy, Default)]
pub struct SequentialBlockList;

impl BlockListStrategy for SequentialBlockList {
    fn run(
        &self,
        blocks: &[TransformerBlock],
        hidden: Tensor,
        ctx: &BlockContext,
        cache: Option<&mut KvCache>,
    ) -> Result<Tensor> {
        run_sequential(blocks, hidden, ctx, cache)
    }
}

/// Run `blocks` one after another, each with its own layer cache.
pub fn run_sequential(
    blocks: &[TransformerBlock],
    mut hidden: Tensor,
    ctx: &BlockContext,
    mut cache: Option<&mut KvCache>,
) -> Result<Tensor> {
    for block in blocks {
        let layer_cache = cache
            .as_deref_mut()
            .and_then(|c| c.layer_mut(block.layer_id()));
        hidden = block.forward(&hidden, ctx, layer_cache)?;
    }
    Ok(hidden)
}
