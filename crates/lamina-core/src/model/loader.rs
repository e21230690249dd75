//! SafeTensors weight loading utilities.
//!
//! Checkpoints are flat maps from parameter name to tensor. Names written by
//! a data-parallel wrapper carry a `module.` prefix, which is stripped before
//! matching. Loading is non-strict: names missing from the checkpoint keep
//! their current values and extra names are ignored, both listed in the
//! returned [`LoadReport`].
//!
//! # Example
//!
//! ```ignore
//! use lamina_core::model::WeightLoader;
//!
//! let loader = WeightLoader::from_file(Path::new("/path/to/consolidated.safetensors"), &Device::Cpu)?;
//! let embeddings = loader.get_tensor("tok_embeddings.weight")?;
//! ```

use crate::error::{LaminaError, Result};
use candle_core::{Device, Tensor};
use safetensors::tensor::TensorView;
use safetensors::{Dtype, SafeTensors};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Prefix added by data-parallel wrappers.
const MODULE_PREFIX: &str = "module.";

/// Weight loader for SafeTensors format.
pub struct WeightLoader {
    /// Loaded tensors indexed by name.
    tensors: HashMap<String, Tensor>,
    /// Device for loaded tensors.
    device: Device,
}

impl WeightLoader {
    /// Create a new weight loader from a model directory.
    ///
    /// Loads all .safetensors files in the directory.
    pub fn from_dir(dir: &Path, device: &Device) -> Result<Self> {
        let mut safetensor_files: Vec<PathBuf> = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().map_or(false, |e| e == "safetensors") {
                safetensor_files.push(path);
            }
        }

        // Deterministic order for shards
        safetensor_files.sort();

        if safetensor_files.is_empty() {
            return Err(LaminaError::ModelError(format!(
                "No .safetensors files found in {}",
                dir.display()
            )));
        }

        let mut tensors = HashMap::new();
        for path in &safetensor_files {
            tensors.extend(Self::read_file(path, device)?);
        }

        Ok(Self {
            tensors: unwrap_module(tensors),
            device: device.clone(),
        })
    }

    /// Create a weight loader from a single file.
    pub fn from_file(path: &Path, device: &Device) -> Result<Self> {
        let tensors = Self::read_file(path, device)?;
        Ok(Self {
            tensors: unwrap_module(tensors),
            device: device.clone(),
        })
    }

    /// Create a weight loader from serialized SafeTensors bytes.
    pub fn from_bytes(data: &[u8], device: &Device) -> Result<Self> {
        let tensors = Self::deserialize(data, "weights", device)?;
        Ok(Self {
            tensors: unwrap_module(tensors),
            device: device.clone(),
        })
    }

    fn read_file(path: &Path, device: &Device) -> Result<HashMap<String, Tensor>> {
        let data = fs::read(path)?;
        Self::deserialize(&data, &path.display().to_string(), device)
    }

    fn deserialize(data: &[u8], source: &str, device: &Device) -> Result<HashMap<String, Tensor>> {
        let safetensors = SafeTensors::deserialize(data).map_err(|e| {
            LaminaError::ModelError(format!("Failed to deserialize {}: {}", source, e))
        })?;

        safetensors
            .tensors()
            .into_iter()
            .map(|(name, view)| Ok((name, view_to_tensor(&view, device)?)))
            .collect()
    }

    /// Get a tensor by name.
    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.tensors.get(name)
    }

    /// Get a tensor by name, returning an error if not found.
    pub fn get_tensor(&self, name: &str) -> Result<Tensor> {
        self.tensors
            .get(name)
            .cloned()
            .ok_or_else(|| LaminaError::ModelError(format!("Tensor not found: {}", name)))
    }

    /// Check if a tensor exists.
    pub fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    /// Get all tensor names, sorted.
    pub fn tensor_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tensors.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Get the number of loaded tensors.
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    /// Check if no tensors are loaded.
    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Get the device tensors are loaded to.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Take the name-to-tensor map.
    pub fn into_tensors(self) -> HashMap<String, Tensor> {
        self.tensors
    }
}

/// Convert a SafeTensors view to a Candle tensor.
fn view_to_tensor(view: &TensorView<'_>, device: &Device) -> Result<Tensor> {
    let shape = view.shape();
    let data = view.data();

    // Views are not guaranteed to be aligned for the element type
    let tensor = match view.dtype() {
        Dtype::F32 => {
            let values: Vec<f32> = bytemuck::pod_collect_to_vec(data);
            Tensor::from_vec(values, shape, device)?
        }
        Dtype::F16 => {
            let values: Vec<half::f16> = bytemuck::pod_collect_to_vec(data);
            Tensor::from_vec(values, shape, device)?
        }
        Dtype::BF16 => {
            let values: Vec<half::bf16> = bytemuck::pod_collect_to_vec(data);
            Tensor::from_vec(values, shape, device)?
        }
        Dtype::F64 => {
            let values: Vec<f64> = bytemuck::pod_collect_to_vec(data);
            Tensor::from_vec(values, shape, device)?
        }
        Dtype::I64 => {
            let values: Vec<i64> = bytemuck::pod_collect_to_vec(data);
            Tensor::from_vec(values, shape, device)?
        }
        Dtype::I32 => {
            // No i32 tensors, upcast
            let values: Vec<i32> = bytemuck::pod_collect_to_vec(data);
            let values: Vec<i64> = values.into_iter().map(i64::from).collect();
            Tensor::from_vec(values, shape, device)?
        }
        Dtype::U32 => {
            let values: Vec<u32> = bytemuck::pod_collect_to_vec(data);
            Tensor::from_vec(values, shape, device)?
        }
        Dtype::U8 => Tensor::from_slice(data, shape, device)?,
        other => {
            return Err(LaminaError::ModelError(format!(
                "Unsupported dtype: {:?}",
                other
            )));
        }
    };

    Ok(tensor)
}

/// Strip the `module.` container from a checkpoint.
///
/// When any name carries the prefix the checkpoint is treated as wrapped and
/// only the prefixed names are kept.
pub fn unwrap_module(tensors: HashMap<String, Tensor>) -> HashMap<String, Tensor> {
    if !tensors.keys().any(|name| name.starts_with(MODULE_PREFIX)) {
        return tensors;
    }

    tensors
        .into_iter()
        .filter_map(|(name, tensor)| {
            name.strip_prefix(MODULE_PREFIX)
                .map(|stripped| (stripped.to_string(), tensor))
        })
        .collect()
}

/// Outcome of a non-strict weight load.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    /// Parameters assigned from the checkpoint.
    pub loaded: Vec<String>,
    /// Parameters absent from the checkpoint, left unchanged.
    pub missing: Vec<String>,
    /// Checkpoint names that match no parameter.
    pub unexpected: Vec<String>,
}

impl LoadReport {
    /// True when every parameter was loaded and nothing was left over.
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty() && self.unexpected.is_empty()
    }
}

/// Assign checkpoint tensors onto parameter slots by name.
///
/// Assigned tensors are moved to the slot's device and dtype. A shape
/// mismatch on a matching name fails before any slot is written.
pub(crate) fn assign(
    params: Vec<(String, &mut Tensor)>,
    mut state: HashMap<String, Tensor>,
) -> Result<LoadReport> {
    for (name, slot) in &params {
        if let Some(tensor) = state.get(name) {
            if tensor.dims() != slot.dims() {
                return Err(LaminaError::ShapeMismatch(format!(
                    "{}: checkpoint {:?}, model {:?}",
                    name,
                    tensor.dims(),
                    slot.dims()
                )));
            }
        }
    }

    let mut report = LoadReport::default();
    for (name, slot) in params {
        match state.remove(&name) {
            Some(tensor) => {
                *slot = tensor.to_device(slot.device())?.to_dtype(slot.dtype())?;
                report.loaded.push(name);
            }
            None => report.missing.push(name),
        }
    }

    report.unexpected = state.into_keys().collect();
    report.unexpected.sort();
    if !report.unexpected.is_empty() {
        warn!(names = ?report.unexpected, "Ignoring checkpoint tensors with no matching parameter");
    }

    Ok(report)
}
