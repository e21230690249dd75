//! KV cache for incremental decoding.
//!
//! Stores the rotated keys and the values of every position seen so far, one
//! [`LayerCache`] per transformer block. The cache belongs to the caller and
//! is threaded through [`LlamaModel::forward`](super::LlamaModel::forward)
//! together with the window's `start_pos`.

use crate::error::{LaminaError, Result};
use candle_core::Tensor;

/// KV cache for a single layer.
#[derive(Debug, Clone, Default)]
pub struct LayerCache {
    /// Cached keys: [batch, n_heads, seq_len, head_dim]
    key: Option<Tensor>,
    /// Cached values: [batch, n_heads, seq_len, head_dim]
    value: Option<Tensor>,
}

impl LayerCache {
    /// Create a new empty layer cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if cache is empty.
    pub fn is_empty(&self) -> bool {
        self.key.is_none()
    }

    /// Get the current sequence length in cache.
    pub fn seq_len(&self) -> usize {
        self.key.as_ref().map(|k| k.dims()[2]).unwrap_or(0)
    }

    /// Write a window of keys and values at `start_pos`.
    ///
    /// Positions at or after `start_pos` are replaced, earlier positions are
    /// kept. Returns the keys and values for `[0, start_pos + window)`.
    pub fn update(&mut self, start_pos: usize, key: &Tensor, value: &Tensor) -> Result<(Tensor, Tensor)> {
        let cached = self.seq_len();
        if start_pos > cached {
            return Err(LaminaError::CacheInconsistent(format!(
                "window starts at {} but only {} positions are cached",
                start_pos, cached
            )));
        }

        let (new_key, new_value) = match (&self.key, &self.value) {
            (Some(cached_k), Some(cached_v)) if start_pos > 0 => {
                let cached_k = cached_k.narrow(2, 0, start_pos)?;
                let cached_v = cached_v.narrow(2, 0, start_pos)?;
                // Concatenate along sequence dimension (dim 2); the narrowed
                // prefix is strided and matmul needs a contiguous rhs
                let k = Tensor::cat(&[&cached_k, key], 2)?.contiguous()?;
                let v = Tensor::cat(&[&cached_v, value], 2)?.contiguous()?;
                (k, v)
            }
            _ => (key.clone(), value.clone()),
        };

        self.key = Some(new_key.clone());
        self.value = Some(new_value.clone());

        Ok((new_key, new_value))
    }

    /// Get cached KV without modification.
    pub fn get(&self) -> Option<(&Tensor, &Tensor)> {
        match (&self.key, &self.value) {
            (Some(k), Some(v)) => Some((k, v)),
            _ => None,
        }
    }

    /// Clear the cache.
    pub fn clear(&mut self) {
        self.key = None;
        self.value = None;
    }
}

/// Full KV cache for all layers.
#[derive(Debug, Clone)]
pub struct KvCache {
    /// Per-layer caches.
    layers: Vec<LayerCache>,
}

impl KvCache {
    /// Create a new KV cache for the given number of layers.
    pub fn new(num_layers: usize) -> Self {
        let layers = (0..num_layers).map(|_| LayerCache::new()).collect();
        Self { layers }
    }

    /// Get mutable reference to layer cache.
    pub fn layer_mut(&mut self, layer_idx: usize) -> Option<&mut LayerCache> {
        self.layers.get_mut(layer_idx)
    }

    /// Get reference to layer cache.
    pub fn layer(&self, layer_idx: usize) -> Option<&LayerCache> {
        self.layers.get(layer_idx)
    }

    /// Get the current sequence length (from first layer).
    pub fn seq_len(&self) -> usize {
        self.layers.first().map(|l| l.seq_len()).unwrap_or(0)
    }

    /// Clear all layer caches.
    pub fn clear(&mut self) {
        for layer in &mut self.layers {
            layer.clear();
        }
    }

    /// Check if cache is empty.
    pub fn is_empty(&self) -> bool {
        self.layers.first().map(|l| l.is_empty()).unwrap_or(true)
    }

    /// Get number of layers.
    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn filled(seq: usize, value: f64) -> Tensor {
        (Tensor::ones((1, 2, seq, 4), DType::F32, &Device::Cpu).unwrap() * value).unwrap()
    }

    #[test]
    fn layer_cache_empty() {
        let cache = LayerCache::new();
        assert!(cache.is_empty());
        assert_eq!(cache.seq_len(), 0);
        assert!(cache.get().is_none());
    }

    #[test]
    fn layer_cache_appends_at_end() {
        let mut cache = LayerCache::new();

        let (k, v) = cache.update(0, &filled(4, 1.0), &filled(4, 1.0)).unwrap();
        assert_eq!(k.dims(), &[1, 2, 4, 4]);
        assert_eq!(v.dims(), &[1, 2, 4, 4]);

        let (k, v) = cache.update(4, &filled(1, 2.0), &filled(1, 2.0)).unwrap();
        assert_eq!(k.dims(), &[1, 2, 5, 4]);
        assert_eq!(v.dims(), &[1, 2, 5, 4]);
        assert_eq!(cache.seq_len(), 5);
    }

    #[test]
    fn layer_cache_rewinds_to_start_pos() {
        let mut cache = LayerCache::new();
        cache.update(0, &filled(4, 1.0), &filled(4, 1.0)).unwrap();

        // Overwrite positions 2 and 3 with a new window
        let (k, _) = cache.update(2, &filled(2, 3.0), &filled(2, 3.0)).unwrap();
        assert_eq!(cache.seq_len(), 4);

        let first = k.narrow(2, 0, 2).unwrap().sum_all().unwrap().to_scalar::<f32>().unwrap();
        let last = k.narrow(2, 2, 2).unwrap().sum_all().unwrap().to_scalar::<f32>().unwrap();
        assert_eq!(first, 16.0);
        assert_eq!(last, 48.0);
    }

    #[test]
    fn rewound_keys_feed_attention_scores() {
        let mut cache = LayerCache::new();
        cache.update(0, &filled(4, 1.0), &filled(4, 1.0)).unwrap();

        let (k, v) = cache.update(2, &filled(1, 2.0), &filled(1, 2.0)).unwrap();
        assert!(k.is_contiguous() && v.is_contiguous());

        // One query over the three remaining positions
        let q = filled(1, 1.0);
        let scores = q.matmul(&k.t().unwrap()).unwrap();
        assert_eq!(scores.dims(), &[1, 2, 1, 3]);
        let row: Vec<f32> = scores.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(&row[..3], &[4.0, 4.0, 8.0]);

        let out = scores.matmul(&v).unwrap();
        assert_eq!(out.dims(), &[1, 2, 1, 4]);
    }

    #[test]
    fn layer_cache_restart_from_zero() {
        let mut cache = LayerCache::new();
        cache.update(0, &filled(4, 1.0), &filled(4, 1.0)).unwrap();
        cache.update(0, &filled(2, 1.0), &filled(2, 1.0)).unwrap();
        assert_eq!(cache.seq_len(), 2);
    }

    #[test]
    fn layer_cache_gap_is_inconsistent() {
        let mut cache = LayerCache::new();
        cache.update(0, &filled(2, 1.0), &filled(2, 1.0)).unwrap();

        let result = cache.update(5, &filled(1, 1.0), &filled(1, 1.0));
        assert!(matches!(result, Err(LaminaError::CacheInconsistent(_))));
    }

    #[test]
    fn kv_cache_creation() {
        let cache = KvCache::new(32);
        assert_eq!(cache.num_layers(), 32);
        assert!(cache.is_empty());
        assert_eq!(cache.seq_len(), 0);
    }

    #[test]
    fn kv_cache_clear() {
        let mut cache = KvCache::new(2);
        cache
            .layer_mut(0)
            .unwrap()
            .update(0, &filled(4, 1.0), &filled(4, 1.0))
            .unwrap();

        assert!(!cache.is_empty());
        assert_eq!(cache.seq_len(), 4);

        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.seq_len(), 0);
    }

    #[test]
    fn kv_cache_layer_out_of_range() {
        let mut cache = KvCache::new(2);
        assert!(cache.layer(2).is_none());
        assert!(cache.layer_mut(5).is_none());
    }
}
