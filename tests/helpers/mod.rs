#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use kgas::cache::ConversionCache;
use kgas::confidence::Confidence;
use kgas::config::KgasConfig;
use kgas::convert::types::CellValue;
use kgas::convert::{ConversionEngine, Entity, GraphSnapshot, Relationship, TableRow};
use kgas::embedding::hashed::HashedBackend;
use kgas::embedding::EmbeddingBackend;
use rusqlite::Connection;

pub const TEST_DIMS: usize = 64;

/// Open a fresh in-memory store with schema and migrations applied.
pub fn test_db() -> Connection {
    kgas::db::open_memory_database(TEST_DIMS).unwrap()
}

/// Defaults with the hash backend and millisecond retry delays.
pub fn test_config() -> KgasConfig {
    let mut config = KgasConfig::default();
    config.embedding.backend = "hash".into();
    config.embedding.dimensions = TEST_DIMS;
    config.embedding.batch_size = 8;
    config.embedding.max_retries = 2;
    config.embedding.retry_initial_delay_ms = 1;
    config.embedding.retry_max_delay_ms = 2;
    config
}

pub fn engine_with(config: KgasConfig, backend: Arc<dyn EmbeddingBackend>) -> ConversionEngine {
    let cache = Arc::new(ConversionCache::from_config(&config.cache));
    ConversionEngine::new(Arc::new(config), cache, backend).unwrap()
}

pub fn test_engine(config: KgasConfig) -> ConversionEngine {
    let backend = Arc::new(HashedBackend::new(config.embedding.dimensions));
    engine_with(config, backend)
}

pub fn entity(id: &str, name: &str, confidence: f64) -> Entity {
    Entity {
        id: id.into(),
        name: name.into(),
        entity_type: "concept".into(),
        confidence,
        metrics: BTreeMap::new(),
    }
}

pub fn rel(source: &str, target: &str, confidence: f64) -> Relationship {
    Relationship {
        source: source.into(),
        target: target.into(),
        relation_type: "related_to".into(),
        confidence,
        evidence_ref: None,
    }
}

/// A → B → C with confidences 0.9 / 0.8 / 0.95.
pub fn chain_graph() -> GraphSnapshot {
    GraphSnapshot::new(
        vec![
            entity("A", "Alan Turing", 0.9),
            entity("B", "Bletchley Park", 0.8),
            entity("C", "Colossus computer", 0.95),
        ],
        vec![rel("A", "B", 0.7), rel("B", "C", 0.6)],
    )
}

/// Directed ring of `n` entities `e00000..`, all at confidence 0.9.
pub fn ring_graph(n: usize) -> GraphSnapshot {
    let entities = (0..n)
        .map(|i| entity(&format!("e{i:05}"), &format!("entity number {i}"), 0.9))
        .collect();
    let relationships = (0..n)
        .map(|i| rel(&format!("e{i:05}"), &format!("e{:05}", (i + 1) % n), 0.8))
        .collect();
    GraphSnapshot::new(entities, relationships)
}

/// `n` rows with a `text` column, ids `r000..`.
pub fn text_rows(n: usize) -> Vec<TableRow> {
    (0..n)
        .map(|i| {
            let mut cells = BTreeMap::new();
            cells.insert("text".to_string(), CellValue::Text(format!("document {i} about topic {}", i % 7)));
            TableRow {
                id: format!("r{i:03}"),
                cells,
                confidence: Confidence::source(0.9).unwrap(),
            }
        })
        .collect()
}

/// Hash backend that fails every batch containing `poison`, counting calls.
pub struct FlakyBackend {
    inner: HashedBackend,
    poison: String,
    pub calls: AtomicUsize,
}

impl FlakyBackend {
    pub fn new(dimensions: usize, poison: &str) -> Self {
        Self {
            inner: HashedBackend::new(dimensions),
            poison: poison.to_string(),
            calls: AtomicUsize::new(0),
        }
    }
}

impl EmbeddingBackend for FlakyBackend {
    fn embed(&self, batch: &[&str]) -> anyhow::Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if batch.iter().any(|t| *t == self.poison) {
            anyhow::bail!("backend timeout");
        }
        self.inner.embed(batch)
    }

    fn dimensions(&self) -> usize {
        self.inner.dimensions()
    }

    fn identity(&self) -> String {
        format!("flaky:{}", self.inner.dimensions())
    }
}
