//! Training loss and cached decoding on a small model.
//!
//! Builds a randomly initialized model, computes the causal LM loss over a
//! window with one ignored label, then decodes greedily with the KV cache.
//!
//! Run with:
//! ```bash
//! cargo run -p lamina-core --example loss_and_decode
//! ```

use candle_core::{DType, Device, Tensor, D};
use lamina_core::prelude::*;
use std::time::Instant;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let config = LlamaConfig {
        use_cache: true,
        ..LlamaConfig::tiny()
    };
    let model = LlamaModel::new(
        &config,
        Strategies::for_backend(Backend::from_env())?,
        DType::F32,
        &Device::Cpu,
    )?;

    println!("Loss and Decode Example");
    println!("=======================\n");

    // Training step: labels mirror the inputs, first position ignored
    let ids = Tensor::new(&[[3u32, 14, 15, 9, 26, 5]], &Device::Cpu)?;
    let labels = Tensor::new(&[[config.ignore_index, 14, 15, 9, 26, 5]], &Device::Cpu)?;
    let output = model.forward(&ids, 0, Some(&labels), None)?;
    let loss: f32 = output.loss.map(|l| l.to_scalar()).transpose()?.unwrap_or(f32::NAN);
    println!("Loss over {} shifted positions: {:.4}", 5, loss);
    println!("  (uniform prediction would give {:.4})\n", (config.vocab_size as f32).ln());

    // Greedy decode with the KV cache
    let mut cache = model.new_cache();
    let mut tokens: Vec<u32> = vec![3, 14, 15];
    let start = Instant::now();

    let input = Tensor::new(tokens.as_slice(), &Device::Cpu)?.unsqueeze(0)?;
    let mut logits = model.forward(&input, 0, None, Some(&mut cache))?.logits;

    for _ in 0..10 {
        let next = logits.argmax(D::Minus1)?.flatten_all()?.to_vec1::<u32>()?[0];
        let pos = tokens.len();
        tokens.push(next);

        let input = Tensor::new(&[[next]], &Device::Cpu)?;
        logits = model.forward(&input, pos, None, Some(&mut cache))?.logits;
    }

    println!("Decoded tokens: {:?}", tokens);
    println!("Cached positions: {}", cache.seq_len());
    println!("Time: {:.2?}", start.elapsed());

    Ok(())
}
