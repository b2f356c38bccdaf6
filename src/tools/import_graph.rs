//! MCP `import_graph` tool parameter definition.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Parameters for the `import_graph` MCP tool.
///
/// Entities and relationships are upserted; relationships may reference entities that are
/// already in the store.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct ImportGraphParams {
    /// Entities: `{id, name, type, confidence}`.
    #[schemars(description = "Entities to upsert, each {id, name, type, confidence (0.0-1.0)}")]
    pub entities: Vec<serde_json::Value>,

    /// Relationships: `{source, target, type, confidence, evidence_ref?}`.
    #[schemars(
        description = "Directed relationships to upsert, each {source, target, type, confidence (0.0-1.0), evidence_ref (optional)}"
    )]
    #[serde(default)]
    pub relationships: Vec<serde_json::Value>,
}
