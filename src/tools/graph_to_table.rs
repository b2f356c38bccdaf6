//! MCP `graph_to_table` tool parameter definition.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Parameters for the `graph_to_table` MCP tool.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct GraphToTableParams {
    /// Force exact algorithms regardless of graph size.
    #[schemars(description = "Force exact algorithms regardless of graph size (default: false)")]
    pub high_quality: Option<bool>,

    /// Compute betweenness centrality. Defaults to `scaling.betweenness`.
    #[schemars(description = "Compute betweenness centrality (default: from config)")]
    pub betweenness: Option<bool>,

    /// Wall-clock budget in seconds. An expired budget yields a partial `sampled` result.
    #[schemars(
        description = "Time budget in seconds. When it expires the partial result is returned with mode 'sampled'."
    )]
    pub deadline_secs: Option<f64>,

    /// Store the computed metrics on the entities (default: true).
    #[schemars(description = "Store the computed metrics in the graph store (default: true)")]
    pub persist: Option<bool>,
}
