//! MCP `nearest_entities` tool parameter definition.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Parameters for the `nearest_entities` MCP tool.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct NearestEntitiesParams {
    /// Entity whose stored vector is the query.
    #[schemars(description = "ID of an entity with a stored vector (run graph_to_vectors first)")]
    pub id: String,

    #[schemars(description = "Number of neighbors to return (1-100). Defaults to 10.")]
    pub k: Option<usize>,
}
