//! Cross-modal conversion engine.
//!
//! [`ConversionEngine`] is the entry point for every conversion:
//!
//! - [`ConversionEngine::graph_to_table`] flattens a [`GraphSnapshot`] into rows with structural
//!   metrics ([`projector`]).
//! - [`ConversionEngine::table_to_vector`] embeds a text column through the configured backend
//!   with batching, retries and per-row failure isolation ([`embedder`]).
//! - [`ConversionEngine::vector_to_graph`] builds a similarity graph ([`similarity`]).
//! - [`ConversionEngine::graph_to_vectors`] and [`ConversionEngine::graph_to_similarity`] chain
//!   them; the composed result carries the lowest-fidelity mode of its stages.
//!
//! Each request consults the [`ScalingPolicy`], then the shared [`ConversionCache`], and only
//! computes on a miss. Requests are independent and may run concurrently.

pub mod cancel;
pub mod embedder;
pub mod projector;
pub mod request;
pub mod retry;
pub mod scaling;
pub mod similarity;
pub mod types;

use std::sync::Arc;
use std::time::Instant;
use tracing::info;

use crate::cache::{CacheEntry, CachedPayload, ConversionCache, Fingerprint};
use crate::confidence::{CombineRule, ConfidenceSummary};
use crate::config::KgasConfig;
use crate::embedding::EmbeddingBackend;
use crate::error::Result;

pub use cancel::CancelSignal;
pub use request::{Request, RequestState};
pub use scaling::{Operation, ScalingDecision, ScalingPolicy};
pub use types::{
    ConversionMode, ConversionOptions, ConversionResult, Entity, GraphSnapshot, RecordStatus,
    Relationship, SimilarityGraph, SimilarityParams, TableProjection, TableRow, VectorRecord,
};

use embedder::EmbedderSettings;
use projector::ProjectorSettings;
use retry::RetryPolicy;
use similarity::SimilaritySettings;

pub struct ConversionEngine {
    config: Arc<KgasConfig>,
    policy: ScalingPolicy,
    cache: Arc<ConversionCache>,
    backend: Arc<dyn EmbeddingBackend>,
    rule: CombineRule,
}

impl ConversionEngine {
    pub fn new(
        config: Arc<KgasConfig>,
        cache: Arc<ConversionCache>,
        backend: Arc<dyn EmbeddingBackend>,
    ) -> anyhow::Result<Self> {
        let rule = config.confidence.propagation_rule()?;
        Ok(Self {
            policy: ScalingPolicy::from_config(&config),
            config,
            cache,
            backend,
            rule,
        })
    }

    pub fn config(&self) -> &KgasConfig {
        &self.config
    }

    pub fn policy(&self) -> &ScalingPolicy {
        &self.policy
    }

    pub fn cache(&self) -> &Arc<ConversionCache> {
        &self.cache
    }

    pub fn backend(&self) -> &Arc<dyn EmbeddingBackend> {
        &self.backend
    }

    /// Default similarity parameters from `[scaling]`.
    pub fn default_similarity_params(&self) -> SimilarityParams {
        SimilarityParams {
            threshold: self.config.scaling.similarity_threshold,
            top_k: None,
        }
    }

    // ── graph → table ──

    pub fn graph_to_table(
        &self,
        snapshot: &GraphSnapshot,
        opts: &ConversionOptions,
    ) -> Result<ConversionResult<TableProjection>> {
        let mut request = Request::new("graph_to_table");
        let started = Instant::now();
        let result = self.run_graph_to_table(&mut request, snapshot, opts);
        finish(&mut request, result, started)
    }

    fn run_graph_to_table(
        &self,
        request: &mut Request,
        snapshot: &GraphSnapshot,
        opts: &ConversionOptions,
    ) -> Result<ConversionResult<TableProjection>> {
        let n = snapshot.entities.len();
        snapshot.validate()?;
        let pagerank = self.policy.decide(Operation::PageRank, n, opts.high_quality)?;
        let betweenness = if opts.betweenness.unwrap_or(self.config.scaling.betweenness) {
            Some(self.policy.decide(Operation::Betweenness, n, opts.high_quality)?)
        } else {
            None
        };
        let planned = betweenness
            .as_ref()
            .map_or(pagerank.mode, |b| pagerank.mode.weakest(b.mode));
        request.advance(RequestState::Scaled(planned));

        let mut key = graph_fingerprint(snapshot)
            .params(pagerank.fingerprint_params())
            .param("betweenness", betweenness.is_some())
            .param("structural_discount", self.config.confidence.approx_discount)
            .param("rule", &self.rule)
            .mode(planned);
        if let Some(b) = &betweenness {
            key = key.params(b.fingerprint_params());
        }
        let key = key.finish();

        request.advance(RequestState::Computing);
        if let Some(entry) = self.cache.get(&key) {
            if let CachedPayload::Projection(projection) = &entry.payload {
                request.advance(RequestState::Cached);
                return Ok(request.deliver(projection.clone(), entry.mode, entry.summary, 0));
            }
        }

        let settings = ProjectorSettings {
            structural_discount: self.config.confidence.approx_discount,
            rule: self.rule.clone(),
        };
        let projected = projector::project(
            snapshot,
            &pagerank,
            betweenness.as_ref(),
            &settings,
            &opts.cancel,
        )?;
        request.advance(RequestState::Computed);

        let summary = summarize(projected.projection.rows.iter().map(|r| r.confidence.score));
        if !projected.cancelled {
            self.cache.put(
                key,
                CacheEntry::new(
                    CachedPayload::Projection(projected.projection.clone()),
                    projected.mode,
                    summary,
                    0,
                ),
            );
        }
        Ok(request.deliver(projected.projection, projected.mode, summary, 0))
    }

    // ── table → vector ──

    pub async fn table_to_vector(
        &self,
        rows: &[TableRow],
        text_field: &str,
        opts: &ConversionOptions,
    ) -> Result<ConversionResult<Vec<VectorRecord>>> {
        let mut request = Request::new("table_to_vector");
        let started = Instant::now();
        let result = self
            .run_table_to_vector(&mut request, rows, text_field, opts)
            .await;
        finish(&mut request, result, started)
    }

    async fn run_table_to_vector(
        &self,
        request: &mut Request,
        rows: &[TableRow],
        text_field: &str,
        opts: &ConversionOptions,
    ) -> Result<ConversionResult<Vec<VectorRecord>>> {
        embedder::validate_rows(rows, text_field)?;
        let decision = self
            .policy
            .decide(Operation::Embedding, rows.len(), opts.high_quality)?;
        request.advance(RequestState::Scaled(decision.mode));

        let mut key = Fingerprint::builder("table_to_vector");
        for row in rows {
            let text = row.text(text_field).unwrap_or_default();
            key.push_input(&row.id, format!("{text}\u{1f}{}", row.confidence.score.to_bits()));
        }
        let key = key
            .param("text_field", text_field)
            .param("backend", self.backend.identity())
            .param("embedding_factor", self.config.confidence.embedding_factor)
            .param("failure_factor", self.config.confidence.failure_factor)
            .mode(decision.mode)
            .finish();

        request.advance(RequestState::Computing);
        if let Some(entry) = self.cache.get(&key) {
            if let CachedPayload::Vectors(records) = &entry.payload {
                request.advance(RequestState::Cached);
                return Ok(request.deliver(records.clone(), entry.mode, entry.summary, 0));
            }
        }

        let settings = EmbedderSettings {
            batch_size: self.config.embedding.batch_size,
            concurrency: self.config.embedding.concurrency,
            retry: RetryPolicy::from_config(&self.config.embedding),
            embedding_factor: self.config.confidence.embedding_factor,
            failure_factor: self.config.confidence.failure_factor,
        };
        let embedded = embedder::embed_rows(
            rows,
            text_field,
            Arc::clone(&self.backend),
            &self.cache,
            &settings,
            &opts.cancel,
        )
        .await?;
        request.advance(RequestState::Computed);

        let mode = if embedded.cancelled {
            ConversionMode::Sampled
        } else {
            decision.mode
        };
        let summary = summarize(embedded.records.iter().map(|r| r.confidence.score));
        if embedded.failed == 0 && !embedded.cancelled {
            self.cache.put(
                key,
                CacheEntry::new(
                    CachedPayload::Vectors(embedded.records.clone()),
                    mode,
                    summary,
                    0,
                ),
            );
        }
        Ok(request.deliver(embedded.records, mode, summary, embedded.failed))
    }

    // ── vector → graph ──

    pub fn vector_to_graph(
        &self,
        records: &[VectorRecord],
        params: &SimilarityParams,
        opts: &ConversionOptions,
    ) -> Result<ConversionResult<SimilarityGraph>> {
        let mut request = Request::new("vector_to_graph");
        let started = Instant::now();
        let result = self.run_vector_to_graph(&mut request, records, params, opts);
        finish(&mut request, result, started)
    }

    fn run_vector_to_graph(
        &self,
        request: &mut Request,
        records: &[VectorRecord],
        params: &SimilarityParams,
        opts: &ConversionOptions,
    ) -> Result<ConversionResult<SimilarityGraph>> {
        similarity::validate_records(records, params)?;
        let decision = self
            .policy
            .decide(Operation::Similarity, records.len(), opts.high_quality)?;
        request.advance(RequestState::Scaled(decision.mode));

        let mut key = Fingerprint::builder("vector_to_graph");
        for record in records {
            let mut content: Vec<u8> = record
                .vector
                .iter()
                .flat_map(|x| x.to_le_bytes())
                .collect();
            content.extend_from_slice(&record.confidence.score.to_bits().to_le_bytes());
            content.extend_from_slice(record.status.as_str().as_bytes());
            key.push_input(&record.id, content);
        }
        let key = key
            .params(decision.fingerprint_params())
            .param("threshold", params.threshold)
            .param("top_k", format!("{:?}", params.top_k))
            .param("similarity_discount", self.config.confidence.similarity_discount)
            .param("rule", &self.rule)
            .mode(decision.mode)
            .finish();

        request.advance(RequestState::Computing);
        if let Some(entry) = self.cache.get(&key) {
            if let CachedPayload::Similarity(graph) = &entry.payload {
                request.advance(RequestState::Cached);
                return Ok(request.deliver(graph.clone(), entry.mode, entry.summary, entry.failed_items));
            }
        }

        let settings = SimilaritySettings {
            rule: self.rule.clone(),
            approx_discount: self.config.confidence.similarity_discount,
        };
        let built = similarity::build(records, params, &decision, &settings, &opts.cancel)?;
        request.advance(RequestState::Computed);

        let failed = built.graph.nodes.iter().filter(|n| !n.status.is_ok()).count();
        let summary = summarize(built.graph.edges.iter().map(|e| e.confidence.score));
        if !built.cancelled {
            self.cache.put(
                key,
                CacheEntry::new(
                    CachedPayload::Similarity(built.graph.clone()),
                    built.mode,
                    summary,
                    failed,
                ),
            );
        }
        Ok(request.deliver(built.graph, built.mode, summary, failed))
    }

    // ── Composed conversions ──

    /// graph → table → vector over the node rows.
    pub async fn graph_to_vectors(
        &self,
        snapshot: &GraphSnapshot,
        text_field: &str,
        opts: &ConversionOptions,
    ) -> Result<ConversionResult<Vec<VectorRecord>>> {
        let table = self.graph_to_table(snapshot, opts)?;
        let vectors = self
            .table_to_vector(&table.data.rows, text_field, opts)
            .await?;
        Ok(compose(
            "graph_to_vectors",
            &[(table.mode, table.from_cache)],
            vectors,
        ))
    }

    /// graph → table → vector → similarity graph.
    pub async fn graph_to_similarity(
        &self,
        snapshot: &GraphSnapshot,
        text_field: &str,
        params: &SimilarityParams,
        opts: &ConversionOptions,
    ) -> Result<ConversionResult<SimilarityGraph>> {
        let table = self.graph_to_table(snapshot, opts)?;
        let vectors = self
            .table_to_vector(&table.data.rows, text_field, opts)
            .await?;
        let graph = self.vector_to_graph(&vectors.data, params, opts)?;
        Ok(compose(
            "graph_to_similarity",
            &[(table.mode, table.from_cache), (vectors.mode, vectors.from_cache)],
            graph,
        ))
    }
}

/// Fingerprint builder seeded with every entity and relationship of `snapshot`.
fn graph_fingerprint(snapshot: &GraphSnapshot) -> crate::cache::FingerprintBuilder {
    let mut key = Fingerprint::builder("graph_to_table");
    for e in &snapshot.entities {
        key.push_input(
            &e.id,
            format!("{}\u{1f}{}\u{1f}{}", e.name, e.entity_type, e.confidence.to_bits()),
        );
    }
    for r in &snapshot.relationships {
        key.push_input(
            &format!("rel\u{1f}{}\u{1f}{}", r.source, r.target),
            format!(
                "{}\u{1f}{}\u{1f}{}",
                r.relation_type,
                r.confidence.to_bits(),
                r.evidence_ref.as_deref().unwrap_or("")
            ),
        );
    }
    key
}

fn summarize(scores: impl IntoIterator<Item = f64>) -> ConfidenceSummary {
    ConfidenceSummary::from_scores(scores)
}

fn finish<T>(
    request: &mut Request,
    result: Result<ConversionResult<T>>,
    started: Instant,
) -> Result<ConversionResult<T>> {
    match &result {
        Ok(done) => info!(
            request_id = %done.request_id,
            operation = done.operation,
            mode = %done.mode,
            from_cache = done.from_cache,
            failed_items = done.failed_items,
            duration_ms = started.elapsed().as_millis() as u64,
            "conversion delivered"
        ),
        Err(e) => request.fail(e),
    }
    result
}

/// Wrap the last stage of a chain: lowest-fidelity mode of all stages, `from_cache` only if
/// every stage was served from the cache.
fn compose<T>(
    operation: &'static str,
    earlier: &[(ConversionMode, bool)],
    last: ConversionResult<T>,
) -> ConversionResult<T> {
    let mode = earlier.iter().fold(last.mode, |m, (stage, _)| m.weakest(*stage));
    let from_cache = last.from_cache && earlier.iter().all(|(_, cached)| *cached);
    ConversionResult {
        operation,
        mode,
        from_cache,
        ..last
    }
}
