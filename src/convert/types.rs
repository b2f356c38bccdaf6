//! Core data model for the three modalities.
//!
//! Defines the graph snapshot ([`Entity`], [`Relationship`], [`GraphSnapshot`]), the table view
//! ([`TableRow`], [`TableSchema`], [`TableProjection`]), the vector view ([`VectorRecord`]), the
//! similarity graph ([`SimilarityGraph`]) and the [`ConversionResult`] envelope that carries a
//! [`ConversionMode`] tag through every conversion.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use super::cancel::CancelSignal;
use super::request::RequestState;
use crate::confidence::{self, Confidence, ConfidenceSummary};
use crate::error::{Error, Result};

// ── Scaling mode ──────────────────────────────────────────────────────────────

/// Fidelity tag attached to every result. Ordered from highest to lowest fidelity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversionMode {
    Exact,
    /// Bounded-iteration or index-based algorithm over the full input.
    Approximate,
    /// Computed from a subset of the input (sampled sources, or cut short by cancellation).
    Sampled,
}

impl ConversionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exact => "exact",
            Self::Approximate => "approximate",
            Self::Sampled => "sampled",
        }
    }

    pub fn is_exact(&self) -> bool {
        matches!(self, Self::Exact)
    }

    /// The lower-fidelity of two modes.
    pub fn weakest(self, other: Self) -> Self {
        self.max(other)
    }
}

impl std::fmt::Display for ConversionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ConversionMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "exact" => Ok(Self::Exact),
            "approximate" => Ok(Self::Approximate),
            "sampled" => Ok(Self::Sampled),
            _ => Err(format!("unknown conversion mode: {s}")),
        }
    }
}

// ── Graph modality ────────────────────────────────────────────────────────────

/// A knowledge-graph node produced by upstream extraction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Stable, unique, immutable once assigned.
    pub id: String,
    /// Canonical name.
    pub name: String,
    #[serde(rename = "type")]
    pub entity_type: String,
    pub confidence: f64,
    /// Derived structural metrics (`pagerank`, `degree`, `betweenness`). Written only by the
    /// conversion engine; a re-computation supersedes previous values.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metrics: BTreeMap<String, f64>,
}

/// A directed, typed edge between two entities. Multiple relationships may join the same pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    pub source: String,
    pub target: String,
    #[serde(rename = "type")]
    pub relation_type: String,
    pub confidence: f64,
    /// Reference to the evidence text the relationship was extracted from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence_ref: Option<String>,
}

/// Read-only snapshot handed over by the graph store for the duration of one conversion.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphSnapshot {
    pub entities: Vec<Entity>,
    #[serde(default)]
    pub relationships: Vec<Relationship>,
}

impl GraphSnapshot {
    pub fn new(entities: Vec<Entity>, relationships: Vec<Relationship>) -> Self {
        Self {
            entities,
            relationships,
        }
    }

    /// Read a snapshot from a JSON file (`{"entities": [...], "relationships": [...]}`).
    pub fn from_json_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        use anyhow::Context;
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read snapshot {}", path.display()))?;
        let snapshot = serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse snapshot {}", path.display()))?;
        Ok(snapshot)
    }

    /// Check identifiers, endpoints, and confidence ranges.
    pub fn validate(&self) -> Result<()> {
        let mut ids = HashSet::with_capacity(self.entities.len());
        for entity in &self.entities {
            validate_id(&entity.id, "entity")?;
            if !ids.insert(entity.id.as_str()) {
                return Err(Error::invalid_input(format!(
                    "duplicate entity id: {}",
                    entity.id
                )));
            }
            confidence::validate(entity.confidence)?;
        }
        for rel in &self.relationships {
            for (role, id) in [("source", &rel.source), ("target", &rel.target)] {
                if !ids.contains(id.as_str()) {
                    return Err(Error::invalid_input(format!(
                        "relationship {role} not found: {id}"
                    )));
                }
            }
            if rel.relation_type.trim().is_empty() {
                return Err(Error::invalid_input(format!(
                    "relationship {} -> {} has an empty type",
                    rel.source, rel.target
                )));
            }
            confidence::validate(rel.confidence)?;
        }
        Ok(())
    }
}

pub(crate) fn validate_id(id: &str, what: &str) -> Result<()> {
    if id.trim().is_empty() || id.chars().any(char::is_control) {
        return Err(Error::invalid_input(format!("malformed {what} id: {id:?}")));
    }
    Ok(())
}

// ── Table modality ────────────────────────────────────────────────────────────

/// A single table cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CellValue {
    Text(String),
    Integer(i64),
    Number(f64),
    Null,
}

impl CellValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Integer(i) => Some(*i as f64),
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnKind {
    Text,
    Integer,
    Number,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    pub kind: ColumnKind,
}

/// Column set declared by the graph projector for one conversion.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    pub columns: Vec<ColumnSpec>,
}

impl TableSchema {
    pub fn with_column(mut self, name: &str, kind: ColumnKind) -> Self {
        self.columns.push(ColumnSpec {
            name: name.to_string(),
            kind,
        });
        self
    }

    pub fn column(&self, name: &str) -> Option<&ColumnSpec> {
        self.columns.iter().find(|c| c.name == name)
    }
}

/// Flattened projection of an entity or relationship. Transient, never persisted as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableRow {
    pub id: String,
    pub cells: BTreeMap<String, CellValue>,
    pub confidence: Confidence,
}

impl TableRow {
    pub fn text(&self, column: &str) -> Option<&str> {
        self.cells.get(column).and_then(CellValue::as_text)
    }

    pub fn number(&self, column: &str) -> Option<f64> {
        self.cells.get(column).and_then(CellValue::as_f64)
    }
}

/// Output of graph → table: node rows plus edge rows, each with its declared schema.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableProjection {
    pub schema: TableSchema,
    pub rows: Vec<TableRow>,
    pub edge_schema: TableSchema,
    pub edge_rows: Vec<TableRow>,
}

// ── Vector modality ───────────────────────────────────────────────────────────

/// Per-record marker. Failed records keep their slot with a zero vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RecordStatus {
    Ok,
    EmbeddingFailed { error: String },
    /// Not attempted because the request was cancelled.
    Cancelled,
}

impl RecordStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::EmbeddingFailed { .. } => "embedding_failed",
            Self::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorRecord {
    /// Matches the source table row / entity identifier.
    pub id: String,
    pub vector: Vec<f32>,
    pub confidence: Confidence,
    pub status: RecordStatus,
}

impl VectorRecord {
    pub fn is_failed(&self) -> bool {
        !self.status.is_ok()
    }
}

// ── Similarity graph ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarityNode {
    pub id: String,
    pub confidence: f64,
    pub status: RecordStatus,
}

/// Undirected edge, emitted once with `source < target`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarityEdge {
    pub source: String,
    pub target: String,
    pub similarity: f32,
    pub confidence: Confidence,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SimilarityGraph {
    pub nodes: Vec<SimilarityNode>,
    pub edges: Vec<SimilarityEdge>,
}

impl SimilarityGraph {
    /// Nodes with no incident edge.
    pub fn isolated_nodes(&self) -> Vec<&str> {
        let linked: HashSet<&str> = self
            .edges
            .iter()
            .flat_map(|e| [e.source.as_str(), e.target.as_str()])
            .collect();
        self.nodes
            .iter()
            .map(|n| n.id.as_str())
            .filter(|id| !linked.contains(id))
            .collect()
    }
}

/// Vector → graph request parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarityParams {
    /// Cosine threshold τ.
    pub threshold: f64,
    /// Cap on neighbors per node. When set in exact mode, edges follow the top-k policy.
    pub top_k: Option<usize>,
}

// ── Request options and result envelope ───────────────────────────────────────

/// Per-request knobs supplied by the caller.
#[derive(Debug, Clone, Default)]
pub struct ConversionOptions {
    /// Force exact algorithms regardless of input size.
    pub high_quality: bool,
    /// Override `scaling.betweenness` for this request.
    pub betweenness: Option<bool>,
    pub cancel: CancelSignal,
}

impl ConversionOptions {
    pub fn high_quality() -> Self {
        Self {
            high_quality: true,
            ..Self::default()
        }
    }

    pub fn with_cancel(mut self, cancel: CancelSignal) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Output of any conversion.
#[derive(Debug, Clone, Serialize)]
pub struct ConversionResult<T> {
    pub request_id: String,
    pub operation: &'static str,
    pub mode: ConversionMode,
    pub confidence: ConfidenceSummary,
    pub from_cache: bool,
    /// Items carrying a failure marker (`embedding_failed` or `cancelled`).
    pub failed_items: usize,
    pub states: Vec<RequestState>,
    pub data: T,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entity(id: &str, confidence: f64) -> Entity {
        Entity {
            id: id.into(),
            name: id.into(),
            entity_type: "concept".into(),
            confidence,
            metrics: BTreeMap::new(),
        }
    }

    fn rel(source: &str, target: &str) -> Relationship {
        Relationship {
            source: source.into(),
            target: target.into(),
            relation_type: "related_to".into(),
            confidence: 0.5,
            evidence_ref: None,
        }
    }

    #[test]
    fn test_mode_ordering() {
        assert_eq!(ConversionMode::Exact.weakest(ConversionMode::Approximate), ConversionMode::Approximate);
        assert_eq!(ConversionMode::Sampled.weakest(ConversionMode::Approximate), ConversionMode::Sampled);
        assert_eq!(ConversionMode::Exact.weakest(ConversionMode::Exact), ConversionMode::Exact);
        assert_eq!("sampled".parse::<ConversionMode>().unwrap(), ConversionMode::Sampled);
    }

    #[test]
    fn test_validate_accepts_parallel_relationships() {
        let mut second = rel("a", "b");
        second.relation_type = "cites".into();
        let snapshot = GraphSnapshot::new(
            vec![entity("a", 0.9), entity("b", 0.8)],
            vec![rel("a", "b"), second],
        );
        snapshot.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_duplicate_ids() {
        let snapshot = GraphSnapshot::new(vec![entity("a", 0.9), entity("a", 0.8)], vec![]);
        let err = snapshot.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate entity id"));
    }

    #[test]
    fn test_validate_rejects_dangling_endpoint() {
        let snapshot = GraphSnapshot::new(vec![entity("a", 0.9)], vec![rel("a", "ghost")]);
        let err = snapshot.validate().unwrap_err();
        assert!(err.to_string().contains("target not found: ghost"));
    }

    #[test]
    fn test_validate_rejects_bad_confidence_and_ids() {
        let snapshot = GraphSnapshot::new(vec![entity("a", 1.3)], vec![]);
        assert!(matches!(snapshot.validate(), Err(Error::InvalidScore { .. })));

        let snapshot = GraphSnapshot::new(vec![entity("  ", 0.3)], vec![]);
        assert!(matches!(snapshot.validate(), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_snapshot_json_shape() {
        let json = r#"{
            "entities": [{"id": "a", "name": "Alpha", "type": "person", "confidence": 0.9}],
            "relationships": []
        }"#;
        let snapshot: GraphSnapshot = serde_json::from_str(json).unwrap();
        assert_eq!(snapshot.entities[0].entity_type, "person");
        assert!(snapshot.entities[0].metrics.is_empty());
    }

    #[test]
    fn test_isolated_nodes() {
        let node = |id: &str| SimilarityNode {
            id: id.into(),
            confidence: 1.0,
            status: RecordStatus::Ok,
        };
        let graph = SimilarityGraph {
            nodes: vec![node("a"), node("b"), node("c")],
            edges: vec![SimilarityEdge {
                source: "a".into(),
                target: "b".into(),
                similarity: 0.9,
                confidence: Confidence::source(0.9).unwrap(),
            }],
        };
        assert_eq!(graph.isolated_nodes(), vec!["c"]);
    }

    #[test]
    fn test_record_status_serialization() {
        let status = RecordStatus::EmbeddingFailed {
            error: "timeout".into(),
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["status"], "embedding_failed");
        assert_eq!(status.as_str(), "embedding_failed");
    }
}
