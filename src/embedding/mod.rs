//! Embedding backends for the table → vector conversion.
//!
//! [`EmbeddingBackend`] is the seam the conversion engine talks to. Two implementations ship:
//! [`local::LocalBackend`] (ONNX Runtime, all-MiniLM-L6-v2 by default) and
//! [`hashed::HashedBackend`] (deterministic feature hashing, no model files, used for tests and
//! offline runs). Backends are synchronous; the engine calls them from `spawn_blocking`.

pub mod hashed;
pub mod local;

use anyhow::Result;

use crate::config::EmbeddingConfig;

/// Turns a batch of texts into fixed-dimension, L2-normalized vectors.
///
/// A successful call returns exactly one vector per input, in input order. Calls may fail
/// transiently; the engine retries them.
pub trait EmbeddingBackend: Send + Sync {
    fn embed(&self, batch: &[&str]) -> Result<Vec<Vec<f32>>>;

    fn dimensions(&self) -> usize;

    /// Stable identity (backend kind, model, dimension). Part of every embedding cache key, so
    /// switching models never serves stale vectors.
    fn identity(&self) -> String;
}

/// Create the backend named by `config.backend`.
///
/// `"local"` needs the model files on disk (run `kgas model download` first); `"hash"` needs
/// nothing.
pub fn create_backend(config: &EmbeddingConfig) -> Result<Box<dyn EmbeddingBackend>> {
    match config.backend.as_str() {
        "local" => Ok(Box::new(local::LocalBackend::new(config)?)),
        "hash" => Ok(Box::new(hashed::HashedBackend::new(config.dimensions))),
        other => anyhow::bail!("unknown embedding backend: {other}. Supported: local, hash"),
    }
}

/// L2-normalize in place. A zero vector stays zero.
pub fn l2_normalize(v: &mut [f32]) {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        v.iter_mut().for_each(|x| *x /= norm);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_l2_normalize() {
        let mut v = vec![3.0, 4.0];
        l2_normalize(&mut v);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_l2_normalize_zero_vector() {
        let mut v = vec![0.0, 0.0, 0.0];
        l2_normalize(&mut v);
        assert_eq!(v, vec![0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_create_hash_backend() {
        let config = EmbeddingConfig {
            backend: "hash".into(),
            dimensions: 32,
            ..EmbeddingConfig::default()
        };
        let backend = create_backend(&config).unwrap();
        assert_eq!(backend.dimensions(), 32);
        assert_eq!(backend.identity(), "hash:32");
    }

    #[test]
    fn test_unknown_backend() {
        let config = EmbeddingConfig {
            backend: "remote".into(),
            ..EmbeddingConfig::default()
        };
        let err = create_backend(&config).err().unwrap();
        assert!(err.to_string().contains("unknown embedding backend"));
    }
}
