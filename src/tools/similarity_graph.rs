//! MCP `similarity_graph` tool parameter definition.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Parameters for the `similarity_graph` MCP tool.
///
/// Runs graph → table → vector → graph over the stored knowledge graph.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct SimilarityGraphParams {
    /// Cosine threshold τ in `[-1, 1]`. Defaults to `scaling.similarity_threshold`.
    #[schemars(description = "Cosine similarity threshold in [-1, 1] (default: from config)")]
    pub threshold: Option<f64>,

    /// Keep at most this many neighbors per node.
    #[schemars(description = "Keep at most k most-similar neighbors per node (optional)")]
    pub top_k: Option<usize>,

    #[schemars(description = "Node table column to embed (default: from config)")]
    pub text_field: Option<String>,

    #[schemars(description = "Force exact algorithms regardless of graph size (default: false)")]
    pub high_quality: Option<bool>,

    #[schemars(
        description = "Time budget in seconds. When it expires the partial graph is returned with mode 'sampled'."
    )]
    pub deadline_secs: Option<f64>,
}
