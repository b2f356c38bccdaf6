//! Bounded retry around embedding backend calls.
//!
//! One backend call runs on the blocking pool. A call that errors, panics, or returns the wrong
//! number of vectors (or vectors of the wrong dimension) counts as a failure and is retried with
//! exponential backoff. After the last attempt the failure is reported as
//! [`BatchOutcome::Degraded`] instead of an error; the caller marks the affected rows. A failure
//! that ends retrying because the request was cancelled is [`BatchOutcome::Cancelled`].

use backon::{ExponentialBuilder, Retryable};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::cancel::CancelSignal;
use crate::config::EmbeddingConfig;
use crate::embedding::EmbeddingBackend;
use crate::error::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: usize,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &EmbeddingConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_delay: Duration::from_millis(config.retry_initial_delay_ms),
            max_delay: Duration::from_millis(config.retry_max_delay_ms),
        }
    }

    fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.initial_delay)
            .with_max_delay(self.max_delay)
            .with_max_times(self.max_retries)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BatchOutcome {
    Embedded(Vec<Vec<f32>>),
    Degraded { error: String, attempts: usize },
    /// Retrying stopped because `cancel` fired, not because attempts ran out.
    Cancelled { attempts: usize },
}

/// Embed `texts` with retries. Never returns an error: exhaustion yields `Degraded`, and a
/// failure seen after `cancel` fires yields `Cancelled`.
pub async fn embed_with_retry(
    backend: Arc<dyn EmbeddingBackend>,
    texts: Arc<Vec<String>>,
    policy: &RetryPolicy,
    cancel: &CancelSignal,
) -> BatchOutcome {
    let attempts = AtomicUsize::new(0);
    let result = (|| {
        attempts.fetch_add(1, Ordering::Relaxed);
        let backend = Arc::clone(&backend);
        let texts = Arc::clone(&texts);
        async move { call_backend(backend, texts).await }
    })
    .retry(policy.backoff())
    .when(|_| !cancel.is_cancelled())
    .notify(|err: &Error, wait: Duration| {
        tracing::warn!(error = %err, retry_in = ?wait, "embedding call failed, retrying");
    })
    .await;

    let attempts = attempts.load(Ordering::Relaxed);
    match result {
        Ok(vectors) => BatchOutcome::Embedded(vectors),
        Err(_) if cancel.is_cancelled() => BatchOutcome::Cancelled { attempts },
        Err(err) => BatchOutcome::Degraded {
            error: err.to_string(),
            attempts,
        },
    }
}

async fn call_backend(
    backend: Arc<dyn EmbeddingBackend>,
    texts: Arc<Vec<String>>,
) -> Result<Vec<Vec<f32>>, Error> {
    let expected = texts.len();
    let dims = backend.dimensions();
    let vectors = tokio::task::spawn_blocking(move || {
        let batch: Vec<&str> = texts.iter().map(String::as_str).collect();
        backend.embed(&batch)
    })
    .await
    .map_err(|e| Error::backend(format!("embedding task failed: {e}")))?
    .map_err(|e| Error::backend(format!("{e:#}")))?;

    if vectors.len() != expected {
        return Err(Error::backend(format!(
            "backend returned {} vectors for {expected} texts",
            vectors.len()
        )));
    }
    if let Some(bad) = vectors.iter().find(|v| v.len() != dims) {
        return Err(Error::backend(format!(
            "backend returned a {}-dimensional vector, expected {dims}",
            bad.len()
        )));
    }
    Ok(vectors)
}
