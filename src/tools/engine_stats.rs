//! MCP `engine_stats` tool parameter definition.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct EngineStatsParams {
    #[schemars(description = "Number of recent conversions to include (default: 10)")]
    pub recent: Option<usize>,
}
