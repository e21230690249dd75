//! High-level generation engine.

use crate::sampling::{sample, SamplingParams};
use anyhow::{bail, Context, Result};
use candle_core::{DType, Device, Tensor};
use lamina_core::model::{LlamaConfig, LlamaModel, LoadReport, WeightLoader};
use lamina_core::strategy::{Backend, Strategies};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Name of the model configuration file inside a model directory.
pub const CONFIG_FILE: &str = "config.json";

/// Configuration for the engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Directory holding `config.json` and `.safetensors` shards.
    pub model_dir: Option<PathBuf>,
    /// Parameter and activation dtype.
    pub dtype: DType,
    /// Device for computation.
    pub device: Device,
    /// Execution backend.
    pub backend: Backend,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            model_dir: None,
            dtype: DType::F32,
            device: Device::Cpu,
            backend: Backend::from_env(),
        }
    }
}

/// Builder for creating an Engine.
pub struct EngineBuilder {
    config: EngineConfig,
    model_config: Option<LlamaConfig>,
    strategies: Option<Strategies>,
}

impl EngineBuilder {
    /// Create a new engine builder.
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
            model_config: None,
            strategies: None,
        }
    }

    /// Load configuration and weights from a model directory.
    pub fn model_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.model_dir = Some(path.into());
        self
    }

    /// Set model configuration directly, overriding any `config.json`.
    pub fn model_config(mut self, config: LlamaConfig) -> Self {
        self.model_config = Some(config);
        self
    }

    /// Set dtype.
    pub fn dtype(mut self, dtype: DType) -> Self {
        self.config.dtype = dtype;
        self
    }

    /// Set device.
    pub fn device(mut self, device: Device) -> Self {
        self.config.device = device;
        self
    }

    /// Set the execution backend instead of reading it from the environment.
    pub fn backend(mut self, backend: Backend) -> Self {
        self.config.backend = backend;
        self
    }

    /// Use runtime-provided strategies instead of the backend defaults.
    pub fn strategies(mut self, strategies: Strategies) -> Self {
        self.strategies = Some(strategies);
        self
    }

    /// Build the engine.
    pub fn build(self) -> Result<Engine> {
        let model_config = match (self.model_config, &self.config.model_dir) {
            (Some(config), _) => config,
            (None, Some(dir)) => LlamaConfig::from_file(&dir.join(CONFIG_FILE))
                .with_context(|| format!("reading model config from {}", dir.display()))?,
            (None, None) => bail!("either a model directory or a model config is required"),
        };

        let strategies = match self.strategies {
            Some(strategies) => strategies,
            None => Strategies::for_backend(self.config.backend)?,
        };

        let mut model = LlamaModel::new(
            &model_config,
            strategies,
            self.config.dtype,
            &self.config.device,
        )?;

        if let Some(dir) = &self.config.model_dir {
            let report = load_dir(&mut model, dir)?;
            if !report.missing.is_empty() {
                warn!(
                    missing = report.missing.len(),
                    "Model directory does not cover every parameter"
                );
            }
        }

        Ok(Engine {
            config: self.config,
            model,
        })
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn load_dir(model: &mut LlamaModel, dir: &Path) -> Result<LoadReport> {
    let loader = WeightLoader::from_dir(dir, model.device())
        .with_context(|| format!("loading weights from {}", dir.display()))?;
    let report = model.load_state_dict(loader.into_tensors())?;
    info!(
        dir = %dir.display(),
        loaded = report.loaded.len(),
        "Loaded model directory"
    );
    Ok(report)
}

/// High-level generation engine.
#[derive(Debug)]
pub struct Engine {
    config: EngineConfig,
    model: LlamaModel,
}

impl Engine {
    /// Create a new engine builder.
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// Wrap an already built model.
    pub fn from_model(model: LlamaModel) -> Self {
        let config = EngineConfig {
            model_dir: None,
            dtype: model.dtype(),
            device: model.device().clone(),
            backend: model.strategies().backend(),
        };
        Self { config, model }
    }

    /// Get engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Get model reference.
    pub fn model(&self) -> &LlamaModel {
        &self.model
    }

    /// Get mutable model reference, e.g. to load more weights.
    pub fn model_mut(&mut self) -> &mut LlamaModel {
        &mut self.model
    }

    /// Continue a prompt of token ids.
    pub fn generate(&self, prompt: &[u32]) -> GenerateRequest<'_> {
        GenerateRequest {
            engine: self,
            prompt: prompt.to_vec(),
            max_tokens: 256,
            sampling: SamplingParams::default(),
            stop_token: None,
            seed: None,
        }
    }
}

/// A generation request.
pub struct GenerateRequest<'a> {
    engine: &'a Engine,
    prompt: Vec<u32>,
    max_tokens: usize,
    sampling: SamplingParams,
    stop_token: Option<u32>,
    seed: Option<u64>,
}

impl<'a> GenerateRequest<'a> {
    /// Set maximum tokens to generate.
    pub fn max_tokens(mut self, n: usize) -> Self {
        self.max_tokens = n;
        self
    }

    /// Set temperature.
    pub fn temperature(mut self, t: f32) -> Self {
        self.sampling.temperature = t;
        self
    }

    /// Set the nucleus cutoff.
    pub fn top_p(mut self, p: f32) -> Self {
        self.sampling.top_p = p;
        self
    }

    /// Replace all sampling parameters.
    pub fn sampling(mut self, params: SamplingParams) -> Self {
        self.sampling = params;
        self
    }

    /// Stop after emitting this token.
    pub fn stop_token(mut self, token: u32) -> Self {
        self.stop_token = Some(token);
        self
    }

    /// Seed the sampler for reproducible output.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Execute the generation.
    ///
    /// With `use_cache` configured the prompt is prefilled once and every
    /// later step feeds a single token at its position; otherwise the whole
    /// sequence is recomputed each step. Generation stops at `max_tokens`,
    /// the stop token, or `max_seq_len`.
    pub fn execute(self) -> Result<GenerateResult> {
        let model = &self.engine.model;
        let config = model.config();
        let device = model.device();

        if self.prompt.is_empty() {
            bail!("prompt must contain at least one token");
        }
        if self.prompt.len() >= config.max_seq_len {
            bail!(
                "prompt of {} tokens leaves no room within max_seq_len {}",
                self.prompt.len(),
                config.max_seq_len
            );
        }

        let mut rng = match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let mut cache = config.use_cache.then(|| model.new_cache());
        let mut tokens = self.prompt.clone();
        let mut generated = Vec::new();
        let mut fed = 0;

        while generated.len() < self.max_tokens && tokens.len() < config.max_seq_len {
            let start_pos = if cache.is_some() { fed } else { 0 };
            let window = &tokens[start_pos..];

            let input_ids = Tensor::new(window, device)?.unsqueeze(0)?;
            let output = model.forward(&input_ids, start_pos, None, cache.as_mut())?;
            fed = tokens.len();

            let logits: Vec<f32> = output.logits.flatten_all()?.to_vec1()?;
            let next = sample(&logits, &self.sampling, &mut rng)?;
            debug!(step = generated.len(), start_pos, token = next, "Sampled token");

            tokens.push(next);
            generated.push(next);
            if self.stop_token == Some(next) {
                break;
            }
        }

        Ok(GenerateResult {
            num_prompt_tokens: self.prompt.len(),
            num_generated_tokens: generated.len(),
            tokens: generated,
        })
    }
}

/// Result of generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerateResult {
    /// Generated token IDs.
    pub tokens: Vec<u32>,
    /// Number of prompt tokens.
    pub num_prompt_tokens: usize,
    /// Number of generated tokens.
    pub num_generated_tokens: usize,
}
