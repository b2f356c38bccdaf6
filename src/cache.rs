//! Content-addressed conversion cache.
//!
//! Results are keyed by a [`Fingerprint`]: a blake3 digest over the operation name, the input
//! identifiers with a digest of their content, the sorted parameters and the scaling mode. Input
//! order does not affect the key. The store itself is a bounded LRU map behind a
//! `parking_lot::Mutex`; concurrent requests for the same key may both compute, and the second
//! insert simply replaces the first with an equal value.
//!
//! Per-text embeddings live in a second LRU with its own bound, so a large embedding run never
//! evicts whole conversion results.
//!
//! Cancelled or partial results are never inserted (the engine enforces this).

use chrono::{DateTime, Utc};
use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::confidence::ConfidenceSummary;
use crate::config::CacheConfig;
use crate::convert::types::{ConversionMode, SimilarityGraph, TableProjection, VectorRecord};

// ── Fingerprint ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub fn builder(operation: &str) -> FingerprintBuilder {
        FingerprintBuilder::new(operation)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

#[derive(Debug, Clone)]
pub struct FingerprintBuilder {
    operation: String,
    inputs: Vec<(String, [u8; 32])>,
    params: BTreeMap<String, String>,
    mode: Option<ConversionMode>,
}

impl FingerprintBuilder {
    pub fn new(operation: &str) -> Self {
        Self {
            operation: operation.to_string(),
            inputs: Vec::new(),
            params: BTreeMap::new(),
            mode: None,
        }
    }

    /// Add one input item. `content` is digested; only the digest is kept.
    pub fn input(mut self, id: &str, content: impl AsRef<[u8]>) -> Self {
        self.push_input(id, content);
        self
    }

    pub fn push_input(&mut self, id: &str, content: impl AsRef<[u8]>) {
        self.inputs
            .push((id.to_string(), *blake3::hash(content.as_ref()).as_bytes()));
    }

    pub fn param(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.params.insert(key.into(), value.to_string());
        self
    }

    pub fn params<K: Into<String>>(mut self, params: impl IntoIterator<Item = (K, String)>) -> Self {
        for (k, v) in params {
            self.params.insert(k.into(), v);
        }
        self
    }

    pub fn mode(mut self, mode: ConversionMode) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn finish(mut self) -> Fingerprint {
        self.inputs.sort_unstable();

        let mut hasher = blake3::Hasher::new();
        write_field(&mut hasher, self.operation.as_bytes());
        hasher.update(&(self.inputs.len() as u64).to_le_bytes());
        for (id, digest) in &self.inputs {
            write_field(&mut hasher, id.as_bytes());
            hasher.update(digest);
        }
        hasher.update(&(self.params.len() as u64).to_le_bytes());
        for (k, v) in &self.params {
            write_field(&mut hasher, k.as_bytes());
            write_field(&mut hasher, v.as_bytes());
        }
        let mode = self.mode.map(|m| m.as_str()).unwrap_or("");
        write_field(&mut hasher, mode.as_bytes());
        Fingerprint(*hasher.finalize().as_bytes())
    }
}

/// Length-prefixed so adjacent fields can never collide.
fn write_field(hasher: &mut blake3::Hasher, bytes: &[u8]) {
    hasher.update(&(bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

// ── Entries ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum CachedPayload {
    Projection(TableProjection),
    Vectors(Vec<VectorRecord>),
    Similarity(SimilarityGraph),
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub payload: CachedPayload,
    pub mode: ConversionMode,
    pub summary: ConfidenceSummary,
    pub failed_items: usize,
    pub created_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn new(
        payload: CachedPayload,
        mode: ConversionMode,
        summary: ConfidenceSummary,
        failed_items: usize,
    ) -> Self {
        Self {
            payload,
            mode,
            summary,
            failed_items,
            created_at: Utc::now(),
        }
    }
}

// ── Cache ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub inserts: u64,
    pub evictions: u64,
    pub embeddings: usize,
    pub embedding_capacity: usize,
    pub embedding_hits: u64,
    pub embedding_misses: u64,
}

impl CacheStats {
    pub fn hit_ratio(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            0.0
        } else {
            self.hits as f64 / lookups as f64
        }
    }
}

pub struct ConversionCache {
    entries: Mutex<LruCache<Fingerprint, Arc<CacheEntry>>>,
    embeddings: Mutex<LruCache<Fingerprint, Arc<Vec<f32>>>>,
    capacity: usize,
    embedding_capacity: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    inserts: AtomicU64,
    evictions: AtomicU64,
    embedding_hits: AtomicU64,
    embedding_misses: AtomicU64,
}

impl ConversionCache {
    pub fn new(max_entries: usize, max_embeddings: usize) -> Self {
        let capacity = NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN);
        let embedding_capacity = NonZeroUsize::new(max_embeddings).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            embeddings: Mutex::new(LruCache::new(embedding_capacity)),
            capacity: capacity.get(),
            embedding_capacity: embedding_capacity.get(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            inserts: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            embedding_hits: AtomicU64::new(0),
            embedding_misses: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.max_entries, config.max_embeddings)
    }

    pub fn get(&self, key: &Fingerprint) -> Option<Arc<CacheEntry>> {
        let found = self.entries.lock().get(key).cloned();
        let counter = if found.is_some() { &self.hits } else { &self.misses };
        counter.fetch_add(1, Ordering::Relaxed);
        found
    }

    pub fn put(&self, key: Fingerprint, entry: CacheEntry) {
        let displaced = self.entries.lock().push(key, Arc::new(entry));
        self.inserts.fetch_add(1, Ordering::Relaxed);
        if let Some((old_key, _)) = displaced {
            if old_key != key {
                self.evictions.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(evicted = %old_key, "cache eviction");
            }
        }
    }

    pub fn get_embedding(&self, key: &Fingerprint) -> Option<Arc<Vec<f32>>> {
        let found = self.embeddings.lock().get(key).cloned();
        let counter = if found.is_some() {
            &self.embedding_hits
        } else {
            &self.embedding_misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
        found
    }

    pub fn put_embedding(&self, key: Fingerprint, vector: Vec<f32>) {
        self.embeddings.lock().put(key, Arc::new(vector));
    }

    /// Number of cached conversion results.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn embedding_len(&self) -> usize {
        self.embeddings.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
        self.embeddings.lock().clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.len(),
            capacity: self.capacity,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            inserts: self.inserts.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            embeddings: self.embedding_len(),
            embedding_capacity: self.embedding_capacity,
            embedding_hits: self.embedding_hits.load(Ordering::Relaxed),
            embedding_misses: self.embedding_misses.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for ConversionCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversionCache")
            .field("stats", &self.stats())
            .finish()
    }
}
