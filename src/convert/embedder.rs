//! Table → vector: embed one text column of a row set.
//!
//! Texts are deduplicated, looked up in the per-text embedding cache, and the misses are split
//! into batches that run concurrently (bounded by a semaphore) through [`embed_with_retry`]. A
//! batch that still fails after its retries falls back to per-row calls so one bad text cannot
//! sink its neighbors. Rows whose text could not be embedded keep their slot with a zero vector,
//! a degraded confidence and an `embedding_failed` status.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use super::cancel::CancelSignal;
use super::retry::{embed_with_retry, BatchOutcome, RetryPolicy};
use super::types::{validate_id, RecordStatus, TableRow, VectorRecord};
use crate::cache::{ConversionCache, Fingerprint};
use crate::confidence;
use crate::embedding::EmbeddingBackend;
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct EmbedderSettings {
    pub batch_size: usize,
    pub concurrency: usize,
    pub retry: RetryPolicy,
    pub embedding_factor: f64,
    pub failure_factor: f64,
}

#[derive(Debug, Clone)]
pub struct Embedded {
    /// One record per input row, in row id order.
    pub records: Vec<VectorRecord>,
    pub failed: usize,
    pub cancelled: bool,
}

#[derive(Debug, Clone)]
enum TextOutcome {
    Vector(Vec<f32>),
    Failed(String),
    Cancelled,
}

/// Check that `rows` can be embedded on `text_field`.
pub fn validate_rows(rows: &[TableRow], text_field: &str) -> Result<()> {
    let mut seen = std::collections::HashSet::with_capacity(rows.len());
    for row in rows {
        validate_id(&row.id, "row")?;
        if !seen.insert(row.id.as_str()) {
            return Err(Error::invalid_input(format!("duplicate row id: {}", row.id)));
        }
        confidence::validate(row.confidence.score)?;
        if row.text(text_field).is_none() {
            return Err(Error::invalid_input(format!(
                "row {} has no text column {text_field:?}",
                row.id
            )));
        }
    }
    Ok(())
}

/// Cache key for a single text under one backend.
pub fn text_fingerprint(backend: &str, text: &str) -> Fingerprint {
    Fingerprint::builder("embedding")
        .input("text", text)
        .param("backend", backend)
        .finish()
}

pub async fn embed_rows(
    rows: &[TableRow],
    text_field: &str,
    backend: Arc<dyn EmbeddingBackend>,
    cache: &ConversionCache,
    settings: &EmbedderSettings,
    cancel: &CancelSignal,
) -> Result<Embedded> {
    validate_rows(rows, text_field)?;
    let identity = backend.identity();
    let dims = backend.dimensions();

    let mut order: Vec<&TableRow> = rows.iter().collect();
    order.sort_by(|a, b| a.id.cmp(&b.id));

    // ── Dedup and cache lookup ──
    let mut unique: Vec<String> = Vec::new();
    let mut slot_of: HashMap<&str, usize> = HashMap::new();
    let mut row_slots = Vec::with_capacity(order.len());
    for row in &order {
        let text = row.text(text_field).unwrap_or_default();
        let slot = *slot_of.entry(text).or_insert_with(|| {
            unique.push(text.to_string());
            unique.len() - 1
        });
        row_slots.push(slot);
    }

    let mut outcomes: Vec<Option<TextOutcome>> = vec![None; unique.len()];
    let mut pending = Vec::new();
    for (slot, text) in unique.iter().enumerate() {
        match cache.get_embedding(&text_fingerprint(&identity, text)) {
            Some(v) if v.len() == dims => outcomes[slot] = Some(TextOutcome::Vector(v.to_vec())),
            _ => pending.push(slot),
        }
    }
    debug!(
        rows = order.len(),
        unique = unique.len(),
        to_embed = pending.len(),
        "embedding plan"
    );

    // ── Concurrent batches ──
    let semaphore = Arc::new(Semaphore::new(settings.concurrency.max(1)));
    let mut tasks = JoinSet::new();
    for chunk in pending.chunks(settings.batch_size.max(1)) {
        let slots = chunk.to_vec();
        let texts: Arc<Vec<String>> = Arc::new(slots.iter().map(|&s| unique[s].clone()).collect());
        let backend = Arc::clone(&backend);
        let semaphore = Arc::clone(&semaphore);
        let policy = settings.retry.clone();
        let cancel = cancel.clone();
        tasks.spawn(async move {
            let _permit = semaphore.acquire_owned().await;
            let results = run_batch(backend, texts, &policy, &cancel).await;
            slots.into_iter().zip(results).collect::<Vec<_>>()
        });
    }

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(results) => {
                for (slot, outcome) in results {
                    outcomes[slot] = Some(outcome);
                }
            }
            Err(e) => warn!(error = %e, "embedding batch task aborted"),
        }
    }

    // ── Cache fresh vectors ──
    for &slot in &pending {
        if let Some(TextOutcome::Vector(v)) = &outcomes[slot] {
            cache.put_embedding(text_fingerprint(&identity, &unique[slot]), v.clone());
        }
    }

    // ── Assemble records ──
    let mut records = Vec::with_capacity(order.len());
    let mut failed = 0;
    let mut cancelled = false;
    for (row, slot) in order.iter().zip(row_slots) {
        let outcome = outcomes[slot]
            .clone()
            .unwrap_or_else(|| TextOutcome::Failed("embedding task aborted".into()));
        let record = match outcome {
            TextOutcome::Vector(vector) => VectorRecord {
                id: row.id.clone(),
                vector,
                confidence: row.confidence.degraded(settings.embedding_factor)?,
                status: RecordStatus::Ok,
            },
            TextOutcome::Failed(error) => {
                failed += 1;
                VectorRecord {
                    id: row.id.clone(),
                    vector: vec![0.0; dims],
                    confidence: row.confidence.degraded(settings.failure_factor)?,
                    status: RecordStatus::EmbeddingFailed { error },
                }
            }
            TextOutcome::Cancelled => {
                failed += 1;
                cancelled = true;
                VectorRecord {
                    id: row.id.clone(),
                    vector: vec![0.0; dims],
                    confidence: row.confidence.degraded(settings.failure_factor)?,
                    status: RecordStatus::Cancelled,
                }
            }
        };
        records.push(record);
    }

    if failed > 0 {
        warn!(failed, total = records.len(), "rows carry embedding failure markers");
    }
    Ok(Embedded {
        records,
        failed,
        cancelled,
    })
}

/// Embed one batch; on exhaustion retry each text on its own.
async fn run_batch(
    backend: Arc<dyn EmbeddingBackend>,
    texts: Arc<Vec<String>>,
    policy: &RetryPolicy,
    cancel: &CancelSignal,
) -> Vec<TextOutcome> {
    if cancel.is_cancelled() {
        return vec![TextOutcome::Cancelled; texts.len()];
    }

    let error = match embed_with_retry(Arc::clone(&backend), Arc::clone(&texts), policy, cancel).await {
        BatchOutcome::Embedded(vectors) => {
            return vectors.into_iter().map(TextOutcome::Vector).collect();
        }
        BatchOutcome::Cancelled { attempts } => {
            debug!(batch = texts.len(), attempts, "embedding batch cancelled");
            return vec![TextOutcome::Cancelled; texts.len()];
        }
        BatchOutcome::Degraded { error, attempts } => {
            warn!(batch = texts.len(), attempts, error = %error, "embedding batch exhausted retries");
            error
        }
    };
    if texts.len() == 1 {
        return vec![TextOutcome::Failed(error)];
    }

    let mut outcomes = Vec::with_capacity(texts.len());
    for text in texts.iter() {
        if cancel.is_cancelled() {
            outcomes.push(TextOutcome::Cancelled);
            continue;
        }
        let single = Arc::new(vec![text.clone()]);
        let outcome = match embed_with_retry(Arc::clone(&backend), single, policy, cancel).await {
            BatchOutcome::Embedded(mut vectors) => match vectors.pop() {
                Some(v) => TextOutcome::Vector(v),
                None => TextOutcome::Failed("backend returned no vector".into()),
            },
            BatchOutcome::Cancelled { .. } => TextOutcome::Cancelled,
            BatchOutcome::Degraded { error, .. } => TextOutcome::Failed(error),
        };
        outcomes.push(outcome);
    }
    outcomes
}
