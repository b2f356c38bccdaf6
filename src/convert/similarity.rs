//! Vector → graph: build a similarity graph over embedded records.
//!
//! Exact mode multiplies row blocks of the normalized embedding matrix against its transpose and
//! keeps every pair with cosine similarity ≥ τ (or, when `top_k` is set, each node's `k` best
//! neighbors above τ). Approximate mode indexes the vectors with random-hyperplane LSH and only
//! scores colliding candidates, keeping each node's top-k above τ.
//!
//! Edges are undirected and emitted once, `source < target`, sorted by endpoint ids. Failed
//! records and zero vectors become isolated nodes.

use ndarray::{s, Array2, ArrayView1};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{debug, info};

use super::cancel::CancelSignal;
use super::scaling::{OperationParams, ScalingDecision};
use super::types::{
    validate_id, ConversionMode, SimilarityEdge, SimilarityGraph, SimilarityNode,
    SimilarityParams, VectorRecord,
};
use crate::confidence::{self, CombineRule, Confidence};
use crate::error::{Error, Result};

/// Candidates scored per node in approximate mode, as a multiple of `k`.
const CANDIDATES_PER_NEIGHBOR: usize = 16;
const MIN_CANDIDATES: usize = 64;

#[derive(Debug, Clone)]
pub struct SimilaritySettings {
    pub rule: CombineRule,
    /// Extra discount for edges found through the approximate index.
    pub approx_discount: f64,
}

#[derive(Debug, Clone)]
pub struct Built {
    pub graph: SimilarityGraph,
    pub mode: ConversionMode,
    pub cancelled: bool,
    /// Pairwise similarities evaluated.
    pub comparisons: u64,
}

/// Check ids, confidences, vector shapes and request parameters. Returns the dimension.
pub fn validate_records(records: &[VectorRecord], params: &SimilarityParams) -> Result<usize> {
    if !(params.threshold.is_finite() && (-1.0..=1.0).contains(&params.threshold)) {
        return Err(Error::invalid_input(format!(
            "similarity threshold must be within [-1, 1], got {}",
            params.threshold
        )));
    }
    if params.top_k == Some(0) {
        return Err(Error::invalid_input("top_k must be positive"));
    }

    let dims = records.first().map(|r| r.vector.len()).unwrap_or(0);
    let mut seen = HashSet::with_capacity(records.len());
    for record in records {
        validate_id(&record.id, "record")?;
        if !seen.insert(record.id.as_str()) {
            return Err(Error::invalid_input(format!("duplicate record id: {}", record.id)));
        }
        confidence::validate(record.confidence.score)?;
        if record.vector.len() != dims {
            return Err(Error::invalid_input(format!(
                "record {} has {} dimensions, expected {dims}",
                record.id,
                record.vector.len()
            )));
        }
        if record.vector.iter().any(|x| !x.is_finite()) {
            return Err(Error::invalid_input(format!(
                "record {} contains non-finite values",
                record.id
            )));
        }
    }
    Ok(dims)
}

pub fn build(
    records: &[VectorRecord],
    params: &SimilarityParams,
    decision: &ScalingDecision,
    settings: &SimilaritySettings,
    cancel: &CancelSignal,
) -> Result<Built> {
    let dims = validate_records(records, params)?;
    let OperationParams::Similarity {
        top_k: default_k,
        chunk_rows,
        lsh_tables,
        lsh_bits,
        seed,
    } = decision.params
    else {
        return Err(Error::invalid_input("similarity build needs a similarity decision"));
    };

    let mut order: Vec<&VectorRecord> = records.iter().collect();
    order.sort_by(|a, b| a.id.cmp(&b.id));

    // Rows of the matrix are the usable records, in id order.
    let active: Vec<usize> = order
        .iter()
        .enumerate()
        .filter(|(_, r)| r.status.is_ok() && r.vector.iter().any(|x| *x != 0.0))
        .map(|(pos, _)| pos)
        .collect();
    let mut matrix = Array2::<f32>::zeros((active.len(), dims));
    for (row, &pos) in active.iter().enumerate() {
        let v = &order[pos].vector;
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        for (d, x) in v.iter().enumerate() {
            matrix[[row, d]] = x / norm;
        }
    }

    let tau = params.threshold as f32;
    let chunk_rows = chunk_rows.max(1);
    let (pairs, cancelled, comparisons) = if decision.mode.is_exact() {
        exact_pairs(&matrix, tau, params.top_k, chunk_rows, cancel)
    } else {
        let k = params.top_k.unwrap_or(default_k).max(1);
        match LshIndex::build(&matrix, lsh_tables, lsh_bits, seed, chunk_rows, cancel) {
            Some(index) => approximate_pairs(&matrix, &index, tau, k, chunk_rows, cancel),
            None => (Pairs::new(), true, 0),
        }
    };

    let mode = if cancelled {
        info!(nodes = order.len(), "similarity build cancelled, returning partial graph");
        ConversionMode::Sampled
    } else {
        decision.mode
    };

    let nodes = order
        .iter()
        .map(|r| SimilarityNode {
            id: r.id.clone(),
            confidence: r.confidence.score,
            status: r.status.clone(),
        })
        .collect();

    let mut edges = Vec::with_capacity(pairs.len());
    for ((a, b), sim) in pairs {
        let (ra, rb) = (order[active[a]], order[active[b]]);
        let mut conf = Confidence::combined(
            &[(sim as f64).clamp(0.0, 1.0), ra.confidence.score, rb.confidence.score],
            &settings.rule,
        )?;
        if !decision.mode.is_exact() {
            conf = conf.degraded(settings.approx_discount)?;
        }
        edges.push(SimilarityEdge {
            source: ra.id.clone(),
            target: rb.id.clone(),
            similarity: sim,
            confidence: conf,
        });
    }

    debug!(
        nodes = order.len(),
        edges = edges.len(),
        comparisons,
        mode = %mode,
        "similarity graph built"
    );
    Ok(Built {
        graph: SimilarityGraph { nodes, edges },
        mode,
        cancelled,
        comparisons,
    })
}

type Pairs = BTreeMap<(usize, usize), f32>;

fn pair_key(i: usize, j: usize) -> (usize, usize) {
    if i < j {
        (i, j)
    } else {
        (j, i)
    }
}

/// Best `k` of `scored`, highest similarity first, ties by index.
fn top_k(mut scored: Vec<(usize, f32)>, k: usize) -> Vec<(usize, f32)> {
    scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
    scored.truncate(k);
    scored
}

fn exact_pairs(
    matrix: &Array2<f32>,
    tau: f32,
    k: Option<usize>,
    chunk_rows: usize,
    cancel: &CancelSignal,
) -> (Pairs, bool, u64) {
    let m = matrix.nrows();
    let mut pairs = Pairs::new();
    let mut comparisons = 0u64;
    let mut start = 0;
    while start < m {
        if cancel.is_cancelled() {
            return (pairs, true, comparisons);
        }
        let end = (start + chunk_rows).min(m);
        let block = matrix.slice(s![start..end, ..]).dot(&matrix.t());
        comparisons += ((end - start) * m) as u64;

        for (r, sims) in block.outer_iter().enumerate() {
            let i = start + r;
            match k {
                None => {
                    for j in (i + 1)..m {
                        if sims[j] >= tau {
                            pairs.insert((i, j), sims[j]);
                        }
                    }
                }
                Some(k) => {
                    let scored = sims
                        .iter()
                        .copied()
                        .enumerate()
                        .filter(|&(j, sim)| j != i && sim >= tau)
                        .collect();
                    for (j, sim) in top_k(scored, k) {
                        pairs.insert(pair_key(i, j), sim);
                    }
                }
            }
        }
        start = end;
    }
    (pairs, false, comparisons)
}

fn approximate_pairs(
    matrix: &Array2<f32>,
    index: &LshIndex,
    tau: f32,
    k: usize,
    chunk_rows: usize,
    cancel: &CancelSignal,
) -> (Pairs, bool, u64) {
    let cap = (k * CANDIDATES_PER_NEIGHBOR).max(MIN_CANDIDATES);
    let mut pairs = Pairs::new();
    let mut comparisons = 0u64;
    for i in 0..matrix.nrows() {
        if i % chunk_rows == 0 && cancel.is_cancelled() {
            return (pairs, true, comparisons);
        }
        let row = matrix.row(i);
        let scored: Vec<(usize, f32)> = index
            .candidates(i, cap)
            .into_iter()
            .map(|j| (j, row.dot(&matrix.row(j))))
            .filter(|&(_, sim)| sim >= tau)
            .collect();
        comparisons += scored.len() as u64;
        for (j, sim) in top_k(scored, k) {
            pairs.insert(pair_key(i, j), sim);
        }
    }
    (pairs, false, comparisons)
}

// ── LSH index ─────────────────────────────────────────────────────────────────

/// Random-hyperplane LSH: `tables` independent hash tables, each keyed by `bits` sign bits.
struct LshIndex {
    signatures: Vec<Vec<u64>>,
    buckets: Vec<HashMap<u64, Vec<usize>>>,
}

impl LshIndex {
    /// `None` if `cancel` fires while rows are being hashed.
    fn build(
        matrix: &Array2<f32>,
        tables: usize,
        bits: usize,
        seed: u64,
        chunk_rows: usize,
        cancel: &CancelSignal,
    ) -> Option<Self> {
        let (m, dims) = matrix.dim();
        let bits = bits.clamp(1, 64);
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let planes =
            Array2::<f32>::from_shape_fn((tables * bits, dims), |_| rng.sample(StandardNormal));

        let mut signatures = vec![vec![0u64; tables]; m];
        let mut buckets = vec![HashMap::<u64, Vec<usize>>::new(); tables];
        for (i, sig) in signatures.iter_mut().enumerate() {
            if i % chunk_rows == 0 && cancel.is_cancelled() {
                return None;
            }
            let row = matrix.row(i);
            for (t, slot) in sig.iter_mut().enumerate() {
                *slot = signature(&planes, row, t * bits, bits);
                buckets[t].entry(*slot).or_default().push(i);
            }
        }
        Some(Self {
            signatures,
            buckets,
        })
    }

    /// Up to `cap` distinct rows sharing a bucket with `i` in any table, in table order.
    fn candidates(&self, i: usize, cap: usize) -> Vec<usize> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        'tables: for (t, sig) in self.signatures[i].iter().enumerate() {
            let Some(members) = self.buckets[t].get(sig) else {
                continue;
            };
            for &j in members {
                if j != i && seen.insert(j) {
                    out.push(j);
                    if out.len() >= cap {
                        break 'tables;
                    }
                }
            }
        }
        out
    }
}

fn signature(planes: &Array2<f32>, row: ArrayView1<f32>, offset: usize, bits: usize) -> u64 {
    (0..bits).fold(0u64, |acc, b| {
        let bit = planes.row(offset + b).dot(&row) >= 0.0;
        acc | ((bit as u64) << b)
    })
}
