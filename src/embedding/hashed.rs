//! Deterministic feature-hashing backend.
//!
//! Each lowercase token (and each adjacent token pair) is hashed with blake3 into a bucket and a
//! sign; the bucket counts are L2-normalized. Texts sharing words land close together, identical
//! texts produce identical vectors, and no model files are needed.

use anyhow::Result;

use super::{l2_normalize, EmbeddingBackend};

pub struct HashedBackend {
    dimensions: usize,
}

impl HashedBackend {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dimensions];
        let tokens: Vec<String> = text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(str::to_lowercase)
            .collect();

        for token in &tokens {
            self.accumulate(&mut v, token.as_bytes(), 1.0);
        }
        for pair in tokens.windows(2) {
            let joined = format!("{} {}", pair[0], pair[1]);
            self.accumulate(&mut v, joined.as_bytes(), 0.5);
        }
        l2_normalize(&mut v);
        v
    }

    fn accumulate(&self, v: &mut [f32], feature: &[u8], weight: f32) {
        let digest = blake3::hash(feature);
        let bytes = digest.as_bytes();
        let mut word = [0u8; 8];
        word.copy_from_slice(&bytes[..8]);
        let h = u64::from_le_bytes(word);
        let bucket = (h % self.dimensions as u64) as usize;
        let sign = if bytes[8] & 1 == 0 { 1.0 } else { -1.0 };
        v[bucket] += sign * weight;
    }
}

impl EmbeddingBackend for HashedBackend {
    fn embed(&self, batch: &[&str]) -> Result<Vec<Vec<f32>>> {
        Ok(batch.iter().map(|t| self.embed_one(t)).collect())
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn identity(&self) -> String {
        format!("hash:{}", self.dimensions)
    }
}
