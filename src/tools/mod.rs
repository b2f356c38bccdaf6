pub mod engine_stats;
pub mod graph_to_table;
pub mod graph_to_vectors;
pub mod import_graph;
pub mod nearest_entities;
pub mod similarity_graph;

use engine_stats::EngineStatsParams;
use graph_to_table::GraphToTableParams;
use graph_to_vectors::GraphToVectorsParams;
use import_graph::ImportGraphParams;
use nearest_entities::NearestEntitiesParams;
use rmcp::handler::server::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::{tool, tool_handler, tool_router, ServerHandler};
use rusqlite::Connection;
use serde_json::json;
use similarity_graph::SimilarityGraphParams;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use kgas::convert::{
    projector, CancelSignal, ConversionEngine, ConversionOptions, ConversionResult, GraphSnapshot,
    SimilarityParams,
};
use kgas::db::snapshot;

/// The KGAS MCP tool handler. Holds the graph store connection and the shared conversion
/// engine, and exposes all MCP tools via the `#[tool_router]` macro.
#[derive(Clone)]
pub struct KgasTools {
    tool_router: ToolRouter<Self>,
    db: Arc<Mutex<Connection>>,
    engine: Arc<ConversionEngine>,
}

/// Build per-request options from the common tool knobs.
pub fn request_options(
    high_quality: Option<bool>,
    betweenness: Option<bool>,
    deadline_secs: Option<f64>,
) -> Result<ConversionOptions, String> {
    let mut cancel = CancelSignal::new();
    if let Some(secs) = deadline_secs {
        if !secs.is_finite() || secs <= 0.0 {
            return Err("deadline_secs must be a positive number".into());
        }
        cancel = cancel.with_timeout(Duration::from_secs_f64(secs));
    }
    Ok(ConversionOptions {
        high_quality: high_quality.unwrap_or(false),
        betweenness,
        cancel,
    })
}

/// JSON envelope of a result without its payload.
fn envelope<T>(result: &ConversionResult<T>) -> serde_json::Value {
    json!({
        "request_id": result.request_id,
        "operation": result.operation,
        "mode": result.mode,
        "confidence": result.confidence,
        "from_cache": result.from_cache,
        "failed_items": result.failed_items,
        "states": result.states,
    })
}

impl KgasTools {
    /// Run a blocking closure against the store connection.
    async fn with_db<T, F>(&self, f: F) -> Result<T, String>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> anyhow::Result<T> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || {
            let mut conn = db
                .lock()
                .map_err(|e| anyhow::anyhow!("db lock poisoned: {e}"))?;
            f(&mut conn)
        })
        .await
        .map_err(|e| format!("db task failed: {e}"))?
        .map_err(|e| format!("store error: {e}"))
    }

    async fn load_graph(&self) -> Result<GraphSnapshot, String> {
        let graph = self.with_db(|conn| snapshot::load_snapshot(conn)).await?;
        if graph.entities.is_empty() {
            return Err("graph store is empty, import a graph first".into());
        }
        Ok(graph)
    }

    /// Record a delivered request in the conversion log. Failures are logged, not returned.
    async fn log_delivery<T>(&self, result: &ConversionResult<T>) {
        let request_id = result.request_id.clone();
        let operation = result.operation;
        let mode = result.mode;
        let from_cache = result.from_cache;
        let failed_items = result.failed_items;
        let details = json!({ "confidence": result.confidence, "states": result.states });
        let logged = self
            .with_db(move |conn| {
                snapshot::log_conversion(
                    conn,
                    &request_id,
                    operation,
                    mode,
                    from_cache,
                    failed_items,
                    Some(&details),
                )
            })
            .await;
        if let Err(e) = logged {
            tracing::warn!(error = %e, "failed to record conversion");
        }
    }
}

#[tool_router]
impl KgasTools {
    pub fn new(db: Arc<Mutex<Connection>>, engine: Arc<ConversionEngine>) -> Self {
        Self {
            tool_router: Self::tool_router(),
            db,
            engine,
        }
    }

    /// Upsert entities and relationships into the graph store.
    #[tool(description = "Import knowledge-graph entities and relationships into the graph store. Existing ids are updated in place.")]
    async fn import_graph(
        &self,
        Parameters(params): Parameters<ImportGraphParams>,
    ) -> Result<String, String> {
        let entities = params
            .entities
            .into_iter()
            .map(serde_json::from_value)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| format!("invalid entity: {e}"))?;
        let relationships = params
            .relationships
            .into_iter()
            .map(serde_json::from_value)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| format!("invalid relationship: {e}"))?;
        let graph = GraphSnapshot::new(entities, relationships);

        tracing::info!(
            entities = graph.entities.len(),
            relationships = graph.relationships.len(),
            "import_graph called"
        );

        let summary = self
            .with_db(move |conn| snapshot::import_snapshot(conn, &graph))
            .await?;
        serde_json::to_string(&summary).map_err(|e| format!("serialization failed: {e}"))
    }

    /// Project the stored graph into node and edge tables with structural metrics.
    #[tool(description = "Convert the stored knowledge graph into node/edge tables with degree, PageRank and optional betweenness. Large graphs use approximate algorithms unless high_quality is set; the result's 'mode' says which.")]
    async fn graph_to_table(
        &self,
        Parameters(params): Parameters<GraphToTableParams>,
    ) -> Result<String, String> {
        let opts = request_options(params.high_quality, params.betweenness, params.deadline_secs)?;
        let graph = self.load_graph().await?;
        tracing::info!(entities = graph.entities.len(), "graph_to_table called");

        let engine = Arc::clone(&self.engine);
        let (graph, result) = tokio::task::spawn_blocking(move || {
            engine.graph_to_table(&graph, &opts).map(|result| (graph, result))
        })
        .await
        .map_err(|e| format!("conversion task failed: {e}"))?
        .map_err(|e| e.to_string())?;

        let mut written = 0;
        if params.persist.unwrap_or(true) {
            let updated = projector::apply_metrics(&graph.entities, &result.data);
            let mode = result.mode;
            written = self
                .with_db(move |conn| snapshot::write_metrics(conn, &updated, mode))
                .await?;
        }
        self.log_delivery(&result).await;

        let mut response = envelope(&result);
        response["metrics_written"] = json!(written);
        response["table"] = json!(result.data);
        Ok(response.to_string())
    }

    /// Embed every entity of the stored graph.
    #[tool(description = "Convert the stored graph to one embedding vector per entity (graph -> table -> vector). Rows whose embedding failed after retries are marked 'embedding_failed' with reduced confidence instead of failing the request.")]
    async fn graph_to_vectors(
        &self,
        Parameters(params): Parameters<GraphToVectorsParams>,
    ) -> Result<String, String> {
        let opts = request_options(params.high_quality, Some(false), params.deadline_secs)?;
        let text_field = params
            .text_field
            .unwrap_or_else(|| self.engine.config().embedding.text_field.clone());
        let graph = self.load_graph().await?;
        tracing::info!(entities = graph.entities.len(), text_field = %text_field, "graph_to_vectors called");

        let result = self
            .engine
            .graph_to_vectors(&graph, &text_field, &opts)
            .await
            .map_err(|e| e.to_string())?;

        let mut stored = 0;
        if params.persist.unwrap_or(true) {
            let records = result.data.clone();
            let identity = self.engine.backend().identity();
            let dimensions = self.engine.backend().dimensions();
            stored = self
                .with_db(move |conn| {
                    snapshot::write_vectors(conn, &records, &identity, dimensions)
                })
                .await?;
        }
        self.log_delivery(&result).await;

        let include_vectors = params.include_vectors.unwrap_or(false);
        let records: Vec<serde_json::Value> = result
            .data
            .iter()
            .map(|r| {
                let mut record = json!({
                    "id": r.id,
                    "status": r.status,
                    "confidence": r.confidence,
                });
                if include_vectors {
                    record["vector"] = json!(r.vector);
                }
                record
            })
            .collect();

        let mut response = envelope(&result);
        response["vectors_stored"] = json!(stored);
        response["records"] = json!(records);
        Ok(response.to_string())
    }

    /// Build a similarity graph over the embedded entities.
    #[tool(description = "Build a cosine-similarity graph over the stored entities (graph -> table -> vector -> graph). Edges join entities whose similarity is at least 'threshold'; 'top_k' caps neighbors per node. Large inputs use an approximate neighbor index.")]
    async fn similarity_graph(
        &self,
        Parameters(params): Parameters<SimilarityGraphParams>,
    ) -> Result<String, String> {
        let opts = request_options(params.high_quality, Some(false), params.deadline_secs)?;
        let defaults = self.engine.default_similarity_params();
        let similarity = SimilarityParams {
            threshold: params.threshold.unwrap_or(defaults.threshold),
            top_k: params.top_k.or(defaults.top_k),
        };
        let text_field = params
            .text_field
            .unwrap_or_else(|| self.engine.config().embedding.text_field.clone());
        let graph = self.load_graph().await?;
        tracing::info!(
            entities = graph.entities.len(),
            threshold = similarity.threshold,
            top_k = ?similarity.top_k,
            "similarity_graph called"
        );

        let result = self
            .engine
            .graph_to_similarity(&graph, &text_field, &similarity, &opts)
            .await
            .map_err(|e| e.to_string())?;
        self.log_delivery(&result).await;

        let mut response = envelope(&result);
        response["isolated_nodes"] = json!(result.data.isolated_nodes());
        response["graph"] = json!(result.data);
        Ok(response.to_string())
    }

    /// Nearest stored vectors to an entity's vector.
    #[tool(description = "Find the entities whose stored vectors are closest to the given entity's vector. Requires a previous graph_to_vectors run.")]
    async fn nearest_entities(
        &self,
        Parameters(params): Parameters<NearestEntitiesParams>,
    ) -> Result<String, String> {
        let k = params.k.unwrap_or(10);
        if !(1..=100).contains(&k) {
            return Err("k must be between 1 and 100".into());
        }
        let id = params.id;
        tracing::info!(id = %id, k, "nearest_entities called");

        let neighbors = self
            .with_db(move |conn| {
                let Some(query) = snapshot::get_vector(conn, &id)? else {
                    anyhow::bail!("no stored vector for entity {id}");
                };
                // The query itself is always the first hit.
                let hits = snapshot::nearest_vectors(conn, &query, k + 1)?;
                Ok(hits
                    .into_iter()
                    .filter(|(hit, _)| *hit != id)
                    .take(k)
                    .map(|(hit, distance)| {
                        json!({
                            "id": hit,
                            "distance": distance,
                            "similarity": 1.0 - distance * distance / 2.0,
                        })
                    })
                    .collect::<Vec<_>>())
            })
            .await?;

        Ok(json!({ "neighbors": neighbors }).to_string())
    }

    /// Store, cache and conversion-log statistics.
    #[tool(description = "Get graph store counts, conversion cache statistics and the most recent conversions.")]
    async fn engine_stats(
        &self,
        Parameters(params): Parameters<EngineStatsParams>,
    ) -> Result<String, String> {
        let recent = params.recent.unwrap_or(10);
        tracing::info!(recent, "engine_stats called");

        let (store, conversions) = self
            .with_db(move |conn| {
                Ok((
                    snapshot::store_stats(conn)?,
                    snapshot::recent_conversions(conn, recent)?,
                ))
            })
            .await?;

        Ok(json!({
            "store": store,
            "cache": self.engine.cache().stats(),
            "embedding_backend": self.engine.backend().identity(),
            "recent_conversions": conversions,
        })
        .to_string())
    }
}

#[tool_handler]
impl ServerHandler for KgasTools {
    fn get_info(&self) -> rmcp::model::ServerInfo {
        rmcp::model::ServerInfo {
            instructions: Some(
                "KGAS converts a knowledge graph between graph, table and vector views. \
                 Use import_graph to load entities, then graph_to_table, graph_to_vectors or \
                 similarity_graph. Every result reports its scaling mode and confidence."
                    .into(),
            ),
            capabilities: rmcp::model::ServerCapabilities::builder()
                .enable_tools()
                .build(),
            ..Default::default()
        }
    }
}
