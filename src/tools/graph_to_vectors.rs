//! MCP `graph_to_vectors` tool parameter definition.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Parameters for the `graph_to_vectors` MCP tool.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct GraphToVectorsParams {
    /// Node-table column to embed. Defaults to `embedding.text_field`.
    #[schemars(description = "Node table column to embed, e.g. 'name' (default: from config)")]
    pub text_field: Option<String>,

    #[schemars(description = "Force exact algorithms regardless of graph size (default: false)")]
    pub high_quality: Option<bool>,

    #[schemars(
        description = "Time budget in seconds. Rows not embedded in time are marked 'cancelled'."
    )]
    pub deadline_secs: Option<f64>,

    /// Include the raw vectors in the response.
    #[schemars(description = "Include raw vectors in the response (default: false)")]
    pub include_vectors: Option<bool>,

    #[schemars(description = "Store successful vectors in the graph store (default: true)")]
    pub persist: Option<bool>,
}
