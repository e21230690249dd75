//! Next-token selection from inference logits.

use anyhow::{bail, Result};
use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;

/// Sampling parameters for generation.
#[derive(Debug, Clone, PartialEq)]
pub struct SamplingParams {
    /// Temperature for sampling; zero or below selects greedily.
    pub temperature: f32,
    /// Top-p (nucleus) cutoff in (0, 1].
    pub top_p: f32,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            top_p: 1.0,
        }
    }
}

impl SamplingParams {
    /// Greedy sampling (temperature=0).
    pub fn greedy() -> Self {
        Self {
            temperature: 0.0,
            top_p: 1.0,
        }
    }

    /// Sampling with temperature and no nucleus cutoff.
    pub fn with_temperature(temperature: f32) -> Self {
        Self {
            temperature,
            top_p: 1.0,
        }
    }

    /// Whether tokens are picked by argmax.
    pub fn is_greedy(&self) -> bool {
        self.temperature <= 0.0
    }
}

/// Pick the next token from one row of logits.
pub fn sample<R: Rng + ?Sized>(logits: &[f32], params: &SamplingParams, rng: &mut R) -> Result<u32> {
    if logits.is_empty() {
        bail!("cannot sample from empty logits");
    }
    if params.is_greedy() {
        return Ok(argmax(logits));
    }
    if !(params.top_p > 0.0 && params.top_p <= 1.0) {
        bail!("top_p must be in (0, 1], got {}", params.top_p);
    }

    // Softmax with temperature
    let max_logit = logits.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let exp: Vec<f32> = logits
        .iter()
        .map(|&l| ((l - max_logit) / params.temperature).exp())
        .collect();
    let sum: f32 = exp.iter().sum();

    let mut ranked: Vec<(u32, f32)> = exp
        .iter()
        .enumerate()
        .map(|(i, &e)| (i as u32, e / sum))
        .collect();
    ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    // Keep the smallest prefix whose mass reaches top_p, at least one token
    let mut cumsum = 0.0;
    let nucleus: Vec<(u32, f32)> = ranked
        .into_iter()
        .take_while(|(_, p)| {
            let include = cumsum < params.top_p;
            cumsum += p;
            include
        })
        .collect();

    let dist = WeightedIndex::new(nucleus.iter().map(|(_, p)| *p))?;
    Ok(nucleus[dist.sample(rng)].0)
}

/// Index of the largest logit, first on ties.
pub fn argmax(logits: &[f32]) -> u32 {
    let mut best = 0;
    for (i, &l) in logits.iter().enumerate() {
        if l > logits[best] {
            best = i;
        }
    }
    best as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn greedy_picks_argmax() {
        let mut rng = StdRng::seed_from_u64(0);
        let token = sample(&[0.1, 2.5, -1.0, 2.4], &SamplingParams::greedy(), &mut rng).unwrap();
        assert_eq!(token, 1);
    }

    #[test]
    fn argmax_prefers_first_on_ties() {
        assert_eq!(argmax(&[1.0, 3.0, 3.0]), 1);
    }

    #[test]
    fn tiny_top_p_is_greedy() {
        let mut rng = StdRng::seed_from_u64(7);
        let params = SamplingParams {
            temperature: 1.0,
            top_p: 1e-6,
        };
        for _ in 0..20 {
            let token = sample(&[0.0, 0.5, 3.0, 1.0], &params, &mut rng).unwrap();
            assert_eq!(token, 2);
        }
    }

    #[test]
    fn nucleus_excludes_tail() {
        let mut rng = StdRng::seed_from_u64(3);
        // Probabilities roughly [0.50, 0.45, 0.05]
        let logits = [10.0f32.ln(), 9.0f32.ln(), 1.0f32.ln()];
        let params = SamplingParams {
            temperature: 1.0,
            top_p: 0.9,
        };
        for _ in 0..200 {
            let token = sample(&logits, &params, &mut rng).unwrap();
            assert_ne!(token, 2);
        }
    }

    #[test]
    fn seeded_sampling_is_reproducible() {
        let logits: Vec<f32> = (0..16).map(|i| (i as f32 * 0.37).sin()).collect();
        let params = SamplingParams::with_temperature(1.0);

        let draw = |seed| {
            let mut rng = StdRng::seed_from_u64(seed);
            (0..10)
                .map(|_| sample(&logits, &params, &mut rng).unwrap())
                .collect::<Vec<_>>()
        };
        assert_eq!(draw(42), draw(42));
    }

    #[test]
    fn invalid_inputs_are_rejected() {
        let mut rng = StdRng::seed_from_u64(0);
        assert!(sample(&[], &SamplingParams::greedy(), &mut rng).is_err());

        let params = SamplingParams {
            temperature: 1.0,
            top_p: 1.5,
        };
        assert!(sample(&[1.0, 2.0], &params, &mut rng).is_err());
    }
}
