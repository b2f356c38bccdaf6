//! Local ONNX Runtime backend.
//!
//! Runs a sentence-transformer export (all-MiniLM-L6-v2 by default) through `ort`: tokenize the
//! batch with padding, run inference, mean-pool token embeddings under the attention mask,
//! L2-normalize.

use std::sync::Mutex;

use anyhow::{Context, Result};
use ort::session::Session;
use ort::value::Tensor;
use tokenizers::{Encoding, Tokenizer};

use super::{l2_normalize, EmbeddingBackend};
use crate::config::EmbeddingConfig;

/// all-MiniLM-L6-v2 was trained at 256 tokens.
const MAX_SEQ_LEN: usize = 256;

pub struct LocalBackend {
    session: Mutex<Session>,
    tokenizer: Tokenizer,
    model: String,
    dimensions: usize,
}

// Safety: Tokenizer is Send+Sync. Session is only touched through the Mutex.
unsafe impl Send for LocalBackend {}
unsafe impl Sync for LocalBackend {}

impl LocalBackend {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let cache_dir = crate::config::expand_tilde(&config.cache_dir);
        let model_path = cache_dir.join("model.onnx");
        let tokenizer_path = cache_dir.join("tokenizer.json");

        for (what, path) in [("ONNX model", &model_path), ("Tokenizer", &tokenizer_path)] {
            anyhow::ensure!(
                path.exists(),
                "{what} not found at {}. Run `kgas model download` first.",
                path.display()
            );
        }

        let session = Session::builder()?
            .with_optimization_level(ort::session::builder::GraphOptimizationLevel::Level3)?
            .with_intra_threads(4)?
            .commit_from_file(&model_path)
            .context("failed to load ONNX model")?;
        tracing::info!(model = %model_path.display(), "ONNX model loaded");

        let mut tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| anyhow::anyhow!("failed to load tokenizer: {e}"))?;
        tokenizer
            .with_truncation(Some(tokenizers::TruncationParams {
                max_length: MAX_SEQ_LEN,
                ..Default::default()
            }))
            .map_err(|e| anyhow::anyhow!("failed to set truncation: {e}"))?;
        tokenizer.with_padding(Some(tokenizers::PaddingParams {
            strategy: tokenizers::PaddingStrategy::BatchLongest,
            ..Default::default()
        }));

        Ok(Self {
            session: Mutex::new(session),
            tokenizer,
            model: config.model.clone(),
            dimensions: config.dimensions,
        })
    }
}

/// Row-major `[batch, seq]` input tensors built from padded encodings.
struct BatchInputs {
    shape: Vec<i64>,
    input_ids: Vec<i64>,
    attention_mask: Vec<i64>,
}

impl BatchInputs {
    fn from_encodings(encodings: &[Encoding]) -> Self {
        let batch = encodings.len();
        let seq = encodings.first().map(|e| e.get_ids().len()).unwrap_or(0);
        let mut input_ids = Vec::with_capacity(batch * seq);
        let mut attention_mask = Vec::with_capacity(batch * seq);
        for encoding in encodings {
            input_ids.extend(encoding.get_ids().iter().map(|&id| id as i64));
            attention_mask.extend(encoding.get_attention_mask().iter().map(|&m| m as i64));
        }
        Self {
            shape: vec![batch as i64, seq as i64],
            input_ids,
            attention_mask,
        }
    }

    fn seq_len(&self) -> usize {
        self.shape[1] as usize
    }
}

/// Attention-masked mean over the sequence axis of `[batch, seq, hidden]` token embeddings.
fn mean_pool(data: &[f32], mask: &[i64], batch: usize, seq: usize, hidden: usize) -> Vec<Vec<f32>> {
    (0..batch)
        .map(|b| {
            let mut pooled = vec![0.0f32; hidden];
            let mut count = 0.0f32;
            for s in 0..seq {
                if mask[b * seq + s] == 0 {
                    continue;
                }
                let offset = (b * seq + s) * hidden;
                pooled
                    .iter_mut()
                    .zip(&data[offset..offset + hidden])
                    .for_each(|(acc, x)| *acc += x);
                count += 1.0;
            }
            if count > 0.0 {
                pooled.iter_mut().for_each(|x| *x /= count);
            }
            l2_normalize(&mut pooled);
            pooled
        })
        .collect()
}

impl EmbeddingBackend for LocalBackend {
    fn embed(&self, batch: &[&str]) -> Result<Vec<Vec<f32>>> {
        if batch.is_empty() {
            return Ok(vec![]);
        }

        let encodings = self
            .tokenizer
            .encode_batch(batch.to_vec(), true)
            .map_err(|e| anyhow::anyhow!("tokenization failed: {e}"))?;
        let inputs = BatchInputs::from_encodings(&encodings);
        let seq = inputs.seq_len();

        let ids = Tensor::from_array((inputs.shape.clone(), inputs.input_ids.into_boxed_slice()))?;
        let mask = Tensor::from_array((
            inputs.shape.clone(),
            inputs.attention_mask.clone().into_boxed_slice(),
        ))?;
        let token_types = Tensor::from_array((
            inputs.shape.clone(),
            vec![0i64; batch.len() * seq].into_boxed_slice(),
        ))?;

        let mut session = self
            .session
            .lock()
            .map_err(|e| anyhow::anyhow!("session lock poisoned: {e}"))?;
        let outputs = session.run(ort::inputs! {
            "input_ids" => ids,
            "attention_mask" => mask,
            "token_type_ids" => token_types,
        })?;

        // Output naming differs between exports.
        let token_embeddings = outputs
            .get("token_embeddings")
            .or_else(|| outputs.get("last_hidden_state"))
            .unwrap_or_else(|| &outputs[0]);
        let (shape, data) = token_embeddings
            .try_extract_tensor::<f32>()
            .context("failed to extract token embeddings")?;

        let dims: &[i64] = &shape;
        anyhow::ensure!(
            dims.len() == 3 && dims[1] == seq as i64 && dims[2] == self.dimensions as i64,
            "unexpected token embedding shape {dims:?}, expected [batch, seq, {}]",
            self.dimensions
        );
        Ok(mean_pool(
            data,
            &inputs.attention_mask,
            batch.len(),
            seq,
            self.dimensions,
        ))
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn identity(&self) -> String {
        format!("onnx:{}:{}", self.model, self.dimensions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mean_pool_respects_mask() {
        // batch 1, seq 3, hidden 2; last token is padding
        let data = [1.0, 0.0, 3.0, 0.0, 100.0, 100.0];
        let mask = [1, 1, 0];
        let pooled = mean_pool(&data, &mask, 1, 3, 2);
        assert_eq!(pooled.len(), 1);
        // mean (2, 0) normalizes to (1, 0)
        assert!((pooled[0][0] - 1.0).abs() < 1e-6);
        assert!(pooled[0][1].abs() < 1e-6);
    }

    #[test]
    fn test_mean_pool_all_masked_is_zero() {
        let pooled = mean_pool(&[5.0, 5.0], &[0], 1, 1, 2);
        assert_eq!(pooled[0], vec![0.0, 0.0]);
    }

    #[test]
    #[ignore] // Requires model files: run `kgas model download`, then `cargo test -- --ignored`
    fn test_local_backend_embeds_normalized_vectors() {
        let config = EmbeddingConfig::default();
        let backend = LocalBackend::new(&config).unwrap();
        let out = backend.embed(&["knowledge graph", "graph of knowledge"]).unwrap();
        assert_eq!(out.len(), 2);
        for v in &out {
            assert_eq!(v.len(), config.dimensions);
            let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
            assert!((norm - 1.0).abs() < 1e-4);
        }
        assert_eq!(backend.identity(), "onnx:all-MiniLM-L6-v2:384");
    }
}
