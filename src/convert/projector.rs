//! Graph → table projection.
//!
//! Flattens a [`GraphSnapshot`] into node rows (one per entity) and edge rows (one per
//! relationship) and attaches structural metrics: degree, PageRank and, optionally, directed
//! betweenness centrality. The graph is held in a `petgraph` [`DiGraph`] whose node indices follow
//! entity id order, so output rows are deterministic regardless of input order.
//!
//! PageRank uses damping 0.85 with dangling mass spread uniformly, so scores always sum to 1.
//! Betweenness is Brandes' algorithm over the simple directed graph (parallel edges collapsed,
//! self-loops dropped), normalized by `(n-1)(n-2)`; when sampled, source contributions are scaled
//! by `n / k`.

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::collections::{BTreeMap, HashMap, VecDeque};
use tracing::{debug, info};

use super::cancel::CancelSignal;
use super::scaling::{OperationParams, ScalingDecision};
use super::types::{
    CellValue, ColumnKind, ConversionMode, Entity, GraphSnapshot, TableProjection, TableRow,
    TableSchema,
};
use crate::confidence::{CombineRule, Confidence};
use crate::error::{Error, Result};

const DAMPING: f64 = 0.85;

/// Structural metric columns written back onto entities.
pub const METRIC_COLUMNS: [&str; 3] = ["pagerank", "degree", "betweenness"];

#[derive(Debug, Clone)]
pub struct ProjectorSettings {
    /// Structural confidence used when a metric was not computed exactly.
    pub structural_discount: f64,
    pub rule: CombineRule,
}

#[derive(Debug, Clone)]
pub struct Projected {
    pub projection: TableProjection,
    pub mode: ConversionMode,
    pub cancelled: bool,
    pub pagerank_iterations: usize,
    pub converged: bool,
}

/// Project `snapshot` into rows. `betweenness` is `None` when the column is disabled.
pub fn project(
    snapshot: &GraphSnapshot,
    pagerank: &ScalingDecision,
    betweenness: Option<&ScalingDecision>,
    settings: &ProjectorSettings,
    cancel: &CancelSignal,
) -> Result<Projected> {
    snapshot.validate()?;
    let n = snapshot.entities.len();

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| snapshot.entities[a].id.cmp(&snapshot.entities[b].id));
    let position: HashMap<&str, usize> = order
        .iter()
        .enumerate()
        .map(|(pos, &idx)| (snapshot.entities[idx].id.as_str(), pos))
        .collect();

    let mut graph: DiGraph<usize, usize> =
        DiGraph::with_capacity(n, snapshot.relationships.len());
    for &idx in &order {
        graph.add_node(idx);
    }
    for (ri, rel) in snapshot.relationships.iter().enumerate() {
        let (Some(&s), Some(&t)) = (
            position.get(rel.source.as_str()),
            position.get(rel.target.as_str()),
        ) else {
            return Err(Error::invalid_input(format!(
                "relationship endpoint not found: {} -> {}",
                rel.source, rel.target
            )));
        };
        graph.add_edge(NodeIndex::new(s), NodeIndex::new(t), ri);
    }

    // ── PageRank ──
    let OperationParams::PageRank {
        tolerance,
        max_iterations,
    } = pagerank.params
    else {
        return Err(Error::invalid_input("graph projection needs a pagerank decision"));
    };
    let pr = pagerank_scores(&graph, tolerance, max_iterations, cancel);
    let mut mode = pagerank.mode;
    let mut cancelled = pr.cancelled;

    // ── Betweenness ──
    let centrality = match betweenness {
        Some(decision) => {
            let OperationParams::Betweenness { sample_size, seed } = decision.params else {
                return Err(Error::invalid_input(
                    "graph projection needs a betweenness decision",
                ));
            };
            mode = mode.weakest(decision.mode);
            let sources = select_sources(n, sample_size, seed);
            let adj = simple_adjacency(&graph);
            let outcome = if cancelled {
                Brandes::skipped(n)
            } else {
                brandes(&adj, &sources, cancel)
            };
            cancelled |= outcome.cancelled;
            Some(normalize_betweenness(outcome, n))
        }
        None => None,
    };

    if cancelled {
        mode = ConversionMode::Sampled;
        info!(n, "graph projection cancelled, returning partial metrics");
    }

    let structural = if mode.is_exact() {
        1.0
    } else {
        settings.structural_discount
    };

    // ── Node rows ──
    let mut schema = TableSchema::default()
        .with_column("id", ColumnKind::Text)
        .with_column("name", ColumnKind::Text)
        .with_column("type", ColumnKind::Text)
        .with_column("degree", ColumnKind::Integer)
        .with_column("in_degree", ColumnKind::Integer)
        .with_column("out_degree", ColumnKind::Integer)
        .with_column("pagerank", ColumnKind::Number);
    if centrality.is_some() {
        schema = schema.with_column("betweenness", ColumnKind::Number);
    }

    let mut rows = Vec::with_capacity(n);
    for (pos, &idx) in order.iter().enumerate() {
        let entity = &snapshot.entities[idx];
        let v = NodeIndex::new(pos);
        let out_degree = graph.edges_directed(v, Direction::Outgoing).count();
        let in_degree = graph.edges_directed(v, Direction::Incoming).count();

        let mut cells = BTreeMap::new();
        cells.insert("id".to_string(), CellValue::Text(entity.id.clone()));
        cells.insert("name".to_string(), CellValue::Text(entity.name.clone()));
        cells.insert("type".to_string(), CellValue::Text(entity.entity_type.clone()));
        cells.insert(
            "degree".to_string(),
            CellValue::Integer((in_degree + out_degree) as i64),
        );
        cells.insert("in_degree".to_string(), CellValue::Integer(in_degree as i64));
        cells.insert("out_degree".to_string(), CellValue::Integer(out_degree as i64));
        cells.insert("pagerank".to_string(), CellValue::Number(pr.scores[pos]));
        if let Some(c) = &centrality {
            cells.insert("betweenness".to_string(), CellValue::Number(c[pos]));
        }

        rows.push(TableRow {
            id: entity.id.clone(),
            cells,
            confidence: Confidence::combined(&[entity.confidence, structural], &settings.rule)?,
        });
    }

    // ── Edge rows ──
    let edge_schema = TableSchema::default()
        .with_column("id", ColumnKind::Text)
        .with_column("source", ColumnKind::Text)
        .with_column("target", ColumnKind::Text)
        .with_column("type", ColumnKind::Text)
        .with_column("evidence_ref", ColumnKind::Text);

    let mut rel_order: Vec<usize> = (0..snapshot.relationships.len()).collect();
    rel_order.sort_by(|&a, &b| {
        let (x, y) = (&snapshot.relationships[a], &snapshot.relationships[b]);
        (&x.source, &x.target, &x.relation_type, a).cmp(&(&y.source, &y.target, &y.relation_type, b))
    });

    let mut seen: HashMap<String, usize> = HashMap::new();
    let mut edge_rows = Vec::with_capacity(rel_order.len());
    for ri in rel_order {
        let rel = &snapshot.relationships[ri];
        let base = format!("{}->{}:{}", rel.source, rel.target, rel.relation_type);
        let dup = seen.entry(base.clone()).or_insert(0);
        *dup += 1;
        let id = if *dup == 1 { base } else { format!("{base}#{dup}") };

        let mut cells = BTreeMap::new();
        cells.insert("id".to_string(), CellValue::Text(id.clone()));
        cells.insert("source".to_string(), CellValue::Text(rel.source.clone()));
        cells.insert("target".to_string(), CellValue::Text(rel.target.clone()));
        cells.insert("type".to_string(), CellValue::Text(rel.relation_type.clone()));
        cells.insert(
            "evidence_ref".to_string(),
            rel.evidence_ref
                .clone()
                .map(CellValue::Text)
                .unwrap_or(CellValue::Null),
        );
        edge_rows.push(TableRow {
            id,
            cells,
            confidence: Confidence::combined(&[rel.confidence, structural], &settings.rule)?,
        });
    }

    debug!(
        nodes = n,
        edges = edge_rows.len(),
        mode = %mode,
        pagerank_iterations = pr.iterations,
        converged = pr.converged,
        "graph projected"
    );

    Ok(Projected {
        projection: TableProjection {
            schema,
            rows,
            edge_schema,
            edge_rows,
        },
        mode,
        cancelled,
        pagerank_iterations: pr.iterations,
        converged: pr.converged,
    })
}

/// Copy of `entities` with the metric columns of `projection` written into `metrics`.
/// Previous metric values are superseded; a column the projection skipped is dropped.
pub fn apply_metrics(entities: &[Entity], projection: &TableProjection) -> Vec<Entity> {
    let by_id: HashMap<&str, &TableRow> =
        projection.rows.iter().map(|r| (r.id.as_str(), r)).collect();
    entities
        .iter()
        .map(|entity| {
            let mut updated = entity.clone();
            if let Some(row) = by_id.get(entity.id.as_str()) {
                for metric in METRIC_COLUMNS {
                    match row.number(metric) {
                        Some(value) => updated.metrics.insert(metric.to_string(), value),
                        None => updated.metrics.remove(metric),
                    };
                }
            }
            updated
        })
        .collect()
}

// ── PageRank ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct PageRankOutcome {
    scores: Vec<f64>,
    iterations: usize,
    converged: bool,
    cancelled: bool,
}

fn pagerank_scores<N, E>(
    graph: &DiGraph<N, E>,
    tolerance: f64,
    max_iterations: usize,
    cancel: &CancelSignal,
) -> PageRankOutcome {
    let n = graph.node_count();
    if n == 0 {
        return PageRankOutcome {
            scores: Vec::new(),
            iterations: 0,
            converged: true,
            cancelled: false,
        };
    }

    let nf = n as f64;
    let out_degree: Vec<usize> = graph
        .node_indices()
        .map(|v| graph.edges_directed(v, Direction::Outgoing).count())
        .collect();
    let mut rank = vec![1.0 / nf; n];
    let mut next = vec![0.0; n];
    let mut iterations = 0;
    let mut converged = false;
    let mut cancelled = false;

    while iterations < max_iterations {
        if cancel.is_cancelled() {
            cancelled = true;
            break;
        }

        let dangling: f64 = rank
            .iter()
            .zip(&out_degree)
            .filter(|(_, d)| **d == 0)
            .map(|(r, _)| r)
            .sum();
        next.fill((1.0 - DAMPING) / nf + DAMPING * dangling / nf);
        for edge in graph.edge_references() {
            let (s, t) = (edge.source().index(), edge.target().index());
            next[t] += DAMPING * rank[s] / out_degree[s] as f64;
        }

        let delta: f64 = rank.iter().zip(&next).map(|(a, b)| (a - b).abs()).sum();
        std::mem::swap(&mut rank, &mut next);
        iterations += 1;
        if delta < tolerance {
            converged = true;
            break;
        }
    }

    PageRankOutcome {
        scores: rank,
        iterations,
        converged,
        cancelled,
    }
}

// ── Betweenness ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct Brandes {
    scores: Vec<f64>,
    processed: usize,
    cancelled: bool,
}

impl Brandes {
    fn skipped(n: usize) -> Self {
        Self {
            scores: vec![0.0; n],
            processed: 0,
            cancelled: true,
        }
    }
}

/// Deduplicated out-neighbors per node, self-loops removed.
fn simple_adjacency<N, E>(graph: &DiGraph<N, E>) -> Vec<Vec<usize>> {
    let mut adj = vec![Vec::new(); graph.node_count()];
    for edge in graph.edge_references() {
        let (s, t) = (edge.source().index(), edge.target().index());
        if s != t {
            adj[s].push(t);
        }
    }
    for list in &mut adj {
        list.sort_unstable();
        list.dedup();
    }
    adj
}

fn select_sources(n: usize, sample_size: Option<usize>, seed: u64) -> Vec<usize> {
    match sample_size {
        Some(k) if k < n => {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            let mut picked = rand::seq::index::sample(&mut rng, n, k).into_vec();
            picked.sort_unstable();
            picked
        }
        _ => (0..n).collect(),
    }
}

fn brandes(adj: &[Vec<usize>], sources: &[usize], cancel: &CancelSignal) -> Brandes {
    let n = adj.len();
    let mut scores = vec![0.0; n];
    let mut sigma = vec![0.0f64; n];
    let mut dist = vec![-1i64; n];
    let mut delta = vec![0.0f64; n];
    let mut preds: Vec<Vec<usize>> = vec![Vec::new(); n];
    let mut stack = Vec::with_capacity(n);
    let mut queue = VecDeque::with_capacity(n);
    let mut processed = 0;

    for &s in sources {
        if cancel.is_cancelled() {
            return Brandes {
                scores,
                processed,
                cancelled: true,
            };
        }

        sigma.fill(0.0);
        dist.fill(-1);
        delta.fill(0.0);
        preds.iter_mut().for_each(Vec::clear);

        sigma[s] = 1.0;
        dist[s] = 0;
        queue.push_back(s);
        while let Some(v) = queue.pop_front() {
            stack.push(v);
            for &w in &adj[v] {
                if dist[w] < 0 {
                    dist[w] = dist[v] + 1;
                    queue.push_back(w);
                }
                if dist[w] == dist[v] + 1 {
                    sigma[w] += sigma[v];
                    preds[w].push(v);
                }
            }
        }

        while let Some(w) = stack.pop() {
            for &v in &preds[w] {
                delta[v] += sigma[v] / sigma[w] * (1.0 + delta[w]);
            }
            if w != s {
                scores[w] += delta[w];
            }
        }
        processed += 1;
    }

    Brandes {
        scores,
        processed,
        cancelled: false,
    }
}

fn normalize_betweenness(outcome: Brandes, n: usize) -> Vec<f64> {
    let mut scores = outcome.scores;
    if outcome.processed > 0 && outcome.processed < n {
        let scale = n as f64 / outcome.processed as f64;
        scores.iter_mut().for_each(|s| *s *= scale);
    }
    if n > 2 {
        let norm = ((n - 1) * (n - 2)) as f64;
        scores.iter_mut().for_each(|s| *s /= norm);
    }
    scores
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KgasConfig;
    use crate::convert::scaling::{Operation, ScalingPolicy};
    use crate::convert::types::Relationship;

    fn entity(id: &str, confidence: f64) -> Entity {
        Entity {
            id: id.into(),
            name: format!("name-{id}"),
            entity_type: "concept".into(),
            confidence,
            metrics: BTreeMap::new(),
        }
    }

    fn rel(source: &str, target: &str, confidence: f64) -> Relationship {
        Relationship {
            source: source.into(),
            target: target.into(),
            relation_type: "links".into(),
            confidence,
            evidence_ref: None,
        }
    }

    fn settings() -> ProjectorSettings {
        ProjectorSettings {
            structural_discount: 0.85,
            rule: CombineRule::Min,
        }
    }

    fn run(snapshot: &GraphSnapshot, with_betweenness: bool) -> Projected {
        let policy = ScalingPolicy::from_config(&KgasConfig::default());
        let n = snapshot.entities.len();
        let pr = policy.decide(Operation::PageRank, n, false).unwrap();
        let btw = policy.decide(Operation::Betweenness, n, false).unwrap();
        project(
            snapshot,
            &pr,
            with_betweenness.then_some(&btw),
            &settings(),
            &CancelSignal::new(),
        )
        .unwrap()
    }

    fn chain() -> GraphSnapshot {
        GraphSnapshot::new(
            vec![entity("C", 0.95), entity("A", 0.9), entity("B", 0.8)],
            vec![rel("A", "B", 0.7), rel("B", "C", 0.6)],
        )
    }

    #[test]
    fn test_rows_sorted_by_id_with_metrics() {
        let out = run(&chain(), true);
        let ids: Vec<&str> = out.projection.rows.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["A", "B", "C"]);
        assert_eq!(out.mode, ConversionMode::Exact);
        assert!(out.converged);

        let b = &out.projection.rows[1];
        assert_eq!(b.number("degree"), Some(2.0));
        assert_eq!(b.number("in_degree"), Some(1.0));
        assert_eq!(b.text("name"), Some("name-B"));
        assert!((b.number("betweenness").unwrap() - 0.5).abs() < 1e-12);
        assert_eq!(out.projection.rows[0].number("betweenness"), Some(0.0));
    }

    #[test]
    fn test_pagerank_sums_to_one_and_orders_chain() {
        let out = run(&chain(), false);
        let pr: Vec<f64> = out
            .projection
            .rows
            .iter()
            .map(|r| r.number("pagerank").unwrap())
            .collect();
        assert!((pr.iter().sum::<f64>() - 1.0).abs() < 1e-6);
        assert!(pr[2] > pr[1] && pr[1] > pr[0]);
        assert!(out.projection.schema.column("betweenness").is_none());
    }

    #[test]
    fn test_row_confidence_bounded_by_entity() {
        let out = run(&chain(), true);
        let a = &out.projection.rows[0];
        assert_eq!(a.confidence.score, 0.9);
        for (row, edge) in out.projection.edge_rows.iter().zip([0.7, 0.6]) {
            assert_eq!(row.confidence.score, edge);
        }
    }

    #[test]
    fn test_parallel_edges_counted_in_degree_but_not_betweenness() {
        let mut second = rel("A", "B", 0.4);
        second.relation_type = "cites".into();
        let snapshot = GraphSnapshot::new(
            vec![entity("A", 1.0), entity("B", 1.0), entity("C", 1.0)],
            vec![rel("A", "B", 0.5), second, rel("B", "C", 0.5), rel("C", "C", 0.5)],
        );
        let out = run(&snapshot, true);
        assert_eq!(out.projection.rows[0].number("out_degree"), Some(2.0));
        // self-loop counts once in each direction
        assert_eq!(out.projection.rows[2].number("degree"), Some(3.0));
        assert!((out.projection.rows[1].number("betweenness").unwrap() - 0.5).abs() < 1e-12);
        assert_eq!(out.projection.edge_rows.len(), 4);
    }

    #[test]
    fn test_duplicate_edge_ids_are_disambiguated() {
        let snapshot = GraphSnapshot::new(
            vec![entity("A", 1.0), entity("B", 1.0)],
            vec![rel("A", "B", 0.5), rel("A", "B", 0.6)],
        );
        let out = run(&snapshot, false);
        let ids: Vec<&str> = out.projection.edge_rows.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["A->B:links", "A->B:links#2"]);
    }

    #[test]
    fn test_dangling_mass_keeps_sum_on_disconnected_graph() {
        let snapshot = GraphSnapshot::new(
            vec![entity("a", 1.0), entity("b", 1.0), entity("c", 1.0), entity("d", 1.0)],
            vec![rel("a", "b", 1.0)],
        );
        let out = run(&snapshot, false);
        let total: f64 = out.projection.rows.iter().filter_map(|r| r.number("pagerank")).sum();
        assert!((total - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_empty_graph() {
        let out = run(&GraphSnapshot::default(), true);
        assert!(out.projection.rows.is_empty());
        assert_eq!(out.mode, ConversionMode::Exact);
    }

    #[test]
    fn test_cancelled_before_start_is_sampled() {
        let policy = ScalingPolicy::from_config(&KgasConfig::default());
        let pr = policy.decide(Operation::PageRank, 3, false).unwrap();
        let cancel = CancelSignal::new();
        cancel.cancel();
        let out = project(&chain(), &pr, None, &settings(), &cancel).unwrap();
        assert!(out.cancelled);
        assert_eq!(out.mode, ConversionMode::Sampled);
        assert_eq!(out.projection.rows.len(), 3);
        // discounted structural confidence caps every row
        assert!(out.projection.rows.iter().all(|r| r.confidence.score <= 0.85));
    }

    #[test]
    fn test_approximate_mode_discounts_rows() {
        let mut config = KgasConfig::default();
        config.scaling.node_threshold_pagerank = 2;
        let policy = ScalingPolicy::from_config(&config);
        let pr = policy.decide(Operation::PageRank, 3, false).unwrap();
        let out = project(&chain(), &pr, None, &settings(), &CancelSignal::new()).unwrap();
        assert_eq!(out.mode, ConversionMode::Approximate);
        assert_eq!(out.projection.rows[2].confidence.score, 0.85);
        assert_eq!(out.projection.rows[1].confidence.score, 0.8);
    }

    #[test]
    fn test_sampled_betweenness_uses_subset_of_sources() {
        let sources = select_sources(100, Some(10), 7);
        assert_eq!(sources.len(), 10);
        assert_eq!(sources, select_sources(100, Some(10), 7));
        assert_eq!(select_sources(5, Some(10), 7), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_apply_metrics() {
        let snapshot = chain();
        let out = run(&snapshot, true);
        let updated = apply_metrics(&snapshot.entities, &out.projection);
        let b = updated.iter().find(|e| e.id == "B").unwrap();
        assert_eq!(b.metrics.get("degree"), Some(&2.0));
        assert!(b.metrics.contains_key("pagerank"));
        assert!(b.metrics.contains_key("betweenness"));
    }

    #[test]
    fn test_apply_metrics_drops_skipped_columns() {
        let mut snapshot = chain();
        for e in &mut snapshot.entities {
            e.metrics.insert("betweenness".into(), 9.0);
            e.metrics.insert("in_degree_external".into(), 1.0);
        }
        let out = run(&snapshot, false);
        let updated = apply_metrics(&snapshot.entities, &out.projection);
        for e in &updated {
            assert!(!e.metrics.contains_key("betweenness"));
            assert_eq!(e.metrics.get("in_degree_external"), Some(&1.0));
            assert!(e.metrics.contains_key("pagerank"));
        }
    }
}
