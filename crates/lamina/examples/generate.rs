//! Generation example.
//!
//! Continues a prompt of token ids. Pass a model directory (with
//! `config.json` and `.safetensors` weights) as the first argument, or run
//! without arguments to use a small randomly initialized model.
//!
//! ```text
//! RUST_LOG=lamina_core=debug cargo run --example generate -- /models/llama-7b
//! ```

use anyhow::Result;
use lamina::prelude::*;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let builder = match std::env::args().nth(1) {
        Some(dir) => Engine::builder().model_dir(dir),
        None => Engine::builder().model_config(LlamaConfig {
            use_cache: true,
            ..LlamaConfig::tiny()
        }),
    };
    let engine = builder.build()?;

    println!(
        "Engine initialized (backend: {}, layers: {})",
        engine.config().backend,
        engine.model().config().n_layers
    );

    let prompt = [1u32, 15, 27, 8];

    let greedy = engine
        .generate(&prompt)
        .sampling(SamplingParams::greedy())
        .max_tokens(16)
        .execute()?;
    println!("Greedy:  {:?}", greedy.tokens);

    let sampled = engine
        .generate(&prompt)
        .temperature(0.8)
        .top_p(0.95)
        .seed(42)
        .max_tokens(16)
        .execute()?;
    println!("Sampled: {:?}", sampled.tokens);

    Ok(())
}
