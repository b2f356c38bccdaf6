//! Scaling policy: pick exact, approximate, or sampled execution per operation.
//!
//! The policy is a small table of [`PolicyRule`]s built from [`ScalingConfig`]: an operation,
//! the node threshold above which the exact algorithm is abandoned, and the mode used instead.
//! An input of exactly `threshold` nodes still runs exact. Anything above the hard cap is
//! rejected before any work starts.

use serde::Serialize;
use tracing::debug;

use super::types::ConversionMode;
use crate::config::{EmbeddingConfig, KgasConfig, ScalingConfig};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    PageRank,
    Betweenness,
    Similarity,
    Embedding,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PageRank => "pagerank",
            Self::Betweenness => "betweenness",
            Self::Similarity => "similarity",
            Self::Embedding => "embedding",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PolicyRule {
    pub operation: Operation,
    /// `None`: the operation always runs exact.
    pub node_threshold: Option<usize>,
    pub above_threshold: ConversionMode,
}

/// Algorithm parameters chosen alongside the mode.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "algorithm", rename_all = "snake_case")]
pub enum OperationParams {
    PageRank {
        tolerance: f64,
        max_iterations: usize,
    },
    Betweenness {
        /// `None`: every node is a source.
        sample_size: Option<usize>,
        seed: u64,
    },
    Similarity {
        top_k: usize,
        chunk_rows: usize,
        lsh_tables: usize,
        lsh_bits: usize,
        seed: u64,
    },
    Embedding {
        batch_size: usize,
        concurrency: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScalingDecision {
    pub operation: Operation,
    pub n: usize,
    pub mode: ConversionMode,
    pub params: OperationParams,
}

impl ScalingDecision {
    /// Key/value view of the parameters, folded into cache fingerprints.
    pub fn fingerprint_params(&self) -> Vec<(String, String)> {
        let prefix = self.operation.as_str();
        let entries: Vec<(&str, String)> = match &self.params {
            OperationParams::PageRank {
                tolerance,
                max_iterations,
            } => vec![
                ("tolerance", tolerance.to_string()),
                ("max_iterations", max_iterations.to_string()),
            ],
            OperationParams::Betweenness { sample_size, seed } => vec![
                ("sample_size", format!("{sample_size:?}")),
                ("seed", seed.to_string()),
            ],
            OperationParams::Similarity {
                top_k,
                lsh_tables,
                lsh_bits,
                seed,
                ..
            } => vec![
                ("top_k", top_k.to_string()),
                ("lsh_tables", lsh_tables.to_string()),
                ("lsh_bits", lsh_bits.to_string()),
                ("seed", seed.to_string()),
            ],
            OperationParams::Embedding { .. } => vec![],
        };
        entries
            .into_iter()
            .map(|(k, v)| (format!("{prefix}.{k}"), v))
            .chain([(format!("{prefix}.mode"), self.mode.to_string())])
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct ScalingPolicy {
    rules: Vec<PolicyRule>,
    scaling: ScalingConfig,
    embedding: EmbeddingConfig,
}

impl ScalingPolicy {
    pub fn from_config(config: &KgasConfig) -> Self {
        let s = &config.scaling;
        let rules = vec![
            PolicyRule {
                operation: Operation::PageRank,
                node_threshold: Some(s.node_threshold_pagerank),
                above_threshold: ConversionMode::Approximate,
            },
            PolicyRule {
                operation: Operation::Betweenness,
                node_threshold: Some(s.node_threshold_pagerank),
                above_threshold: ConversionMode::Sampled,
            },
            PolicyRule {
                operation: Operation::Similarity,
                node_threshold: Some(s.node_threshold_similarity),
                above_threshold: ConversionMode::Approximate,
            },
            PolicyRule {
                operation: Operation::Embedding,
                node_threshold: None,
                above_threshold: ConversionMode::Exact,
            },
        ];
        Self {
            rules,
            scaling: s.clone(),
            embedding: config.embedding.clone(),
        }
    }

    pub fn rules(&self) -> &[PolicyRule] {
        &self.rules
    }

    pub fn hard_cap(&self) -> usize {
        self.scaling.hard_cap
    }

    /// Decide how to run `operation` over `n` items. `high_quality` forces exact for this
    /// request; `scaling.force_exact` forces it globally. The hard cap applies either way.
    pub fn decide(&self, operation: Operation, n: usize, high_quality: bool) -> Result<ScalingDecision> {
        let cap = self.scaling.hard_cap;
        if n > cap {
            return Err(Error::ResourceExceeded {
                operation: operation.as_str(),
                n,
                cap,
            });
        }

        let rule = self.rules.iter().find(|r| r.operation == operation);
        let above = rule
            .and_then(|r| r.node_threshold.map(|t| (t, r.above_threshold)))
            .filter(|(threshold, _)| n > *threshold);
        let mode = match above {
            Some(_) if high_quality || self.scaling.force_exact => ConversionMode::Exact,
            Some((_, mode)) => mode,
            None => ConversionMode::Exact,
        };

        let s = &self.scaling;
        let params = match operation {
            Operation::PageRank => OperationParams::PageRank {
                tolerance: s.pagerank_tolerance,
                max_iterations: if mode.is_exact() {
                    s.pagerank_max_iterations
                } else {
                    s.approx_pagerank_iterations
                },
            },
            Operation::Betweenness => OperationParams::Betweenness {
                sample_size: (!mode.is_exact()).then(|| s.betweenness_sample_size.min(n)),
                seed: s.sample_seed,
            },
            Operation::Similarity => OperationParams::Similarity {
                top_k: s.top_k,
                chunk_rows: s.exact_chunk_rows,
                lsh_tables: s.lsh_tables,
                lsh_bits: s.lsh_bits,
                seed: s.sample_seed,
            },
            Operation::Embedding => OperationParams::Embedding {
                batch_size: self.embedding.batch_size,
                concurrency: self.embedding.concurrency,
            },
        };

        debug!(operation = operation.as_str(), n, mode = %mode, "scaling decision");
        Ok(ScalingDecision {
            operation,
            n,
            mode,
            params,
        })
    }
}
