mod helpers;

use helpers::{chain_graph, entity, rel, ring_graph, test_config, test_engine};
use kgas::convert::{ConversionMode, ConversionOptions, GraphSnapshot, RequestState};
use kgas::error::ErrorKind;

#[test]
fn chain_projection_is_exact_with_bounded_confidence() {
    let engine = test_engine(test_config());
    let result = engine
        .graph_to_table(&chain_graph(), &ConversionOptions::default())
        .unwrap();

    assert_eq!(result.mode, ConversionMode::Exact);
    assert!(!result.from_cache);
    assert_eq!(result.data.rows.len(), 3);
    assert_eq!(result.data.edge_rows.len(), 2);

    let pagerank_sum: f64 = result
        .data
        .rows
        .iter()
        .map(|r| r.number("pagerank").unwrap())
        .sum();
    assert!((pagerank_sum - 1.0).abs() < 1e-6, "pagerank sums to {pagerank_sum}");

    let a = &result.data.rows[0];
    assert_eq!(a.id, "A");
    assert_eq!(a.text("name"), Some("Alan Turing"));
    assert!((a.confidence.score - 0.9).abs() < 1e-12);

    let b = &result.data.rows[1];
    assert_eq!(b.number("degree"), Some(2.0));
    assert!((b.number("betweenness").unwrap() - 0.5).abs() < 1e-12);

    // Downstream of the chain accumulates rank.
    let c = &result.data.rows[2];
    assert!(c.number("pagerank").unwrap() > a.number("pagerank").unwrap());

    for row in &result.data.rows {
        let source = chain_graph()
            .entities
            .into_iter()
            .find(|e| e.id == row.id)
            .unwrap();
        assert!(row.confidence.score <= source.confidence);
    }

    assert_eq!(result.data.edge_rows[0].id, "A->B:related_to");
    assert!((result.data.edge_rows[0].confidence.score - 0.7).abs() < 1e-12);
}

#[test]
fn request_walks_lifecycle_states() {
    let engine = test_engine(test_config());
    let result = engine
        .graph_to_table(&chain_graph(), &ConversionOptions::default())
        .unwrap();
    assert_eq!(
        result.states,
        vec![
            RequestState::Received,
            RequestState::Scaled(ConversionMode::Exact),
            RequestState::Computing,
            RequestState::Computed,
            RequestState::Delivered,
        ]
    );
}

#[test]
fn repeated_projection_is_served_from_cache() {
    let engine = test_engine(test_config());
    let graph = chain_graph();
    let first = engine.graph_to_table(&graph, &ConversionOptions::default()).unwrap();
    let second = engine.graph_to_table(&graph, &ConversionOptions::default()).unwrap();

    assert!(!first.from_cache);
    assert!(second.from_cache);
    assert!(second.states.contains(&RequestState::Cached));
    assert_eq!(first.data, second.data);
    assert_eq!(first.mode, second.mode);
    assert_eq!(first.confidence, second.confidence);
    assert_ne!(first.request_id, second.request_id);

    let stats = engine.cache().stats();
    assert_eq!(stats.hits, 1);
}

#[tokio::test]
async fn large_embedding_run_keeps_projection_cached() {
    let mut config = test_config();
    config.cache.max_entries = 100;
    config.cache.max_embeddings = 100;
    let engine = test_engine(config);
    let graph = ring_graph(150);

    let first = engine.graph_to_table(&graph, &ConversionOptions::default()).unwrap();
    let vectors = engine
        .table_to_vector(&first.data.rows, "name", &ConversionOptions::default())
        .await
        .unwrap();
    assert_eq!(vectors.failed_items, 0);

    let again = engine.graph_to_table(&graph, &ConversionOptions::default()).unwrap();
    assert!(again.from_cache);

    let stats = engine.cache().stats();
    assert_eq!(stats.entries, 2);
    assert_eq!(stats.evictions, 0);
    assert_eq!(stats.embeddings, 100);
}

#[test]
fn changed_input_misses_cache() {
    let engine = test_engine(test_config());
    engine
        .graph_to_table(&chain_graph(), &ConversionOptions::default())
        .unwrap();

    let mut changed = chain_graph();
    changed.entities[0].confidence = 0.5;
    let result = engine.graph_to_table(&changed, &ConversionOptions::default()).unwrap();
    assert!(!result.from_cache);
    assert!((result.data.rows[0].confidence.score - 0.5).abs() < 1e-12);
}

#[test]
fn scaling_threshold_boundary() {
    let mut config = test_config();
    config.scaling.node_threshold_pagerank = 10;
    config.scaling.betweenness = false;
    let engine = test_engine(config);

    let below = engine.graph_to_table(&ring_graph(9), &ConversionOptions::default()).unwrap();
    let at = engine.graph_to_table(&ring_graph(10), &ConversionOptions::default()).unwrap();
    let above = engine.graph_to_table(&ring_graph(11), &ConversionOptions::default()).unwrap();

    assert_eq!(below.mode, ConversionMode::Exact);
    assert_eq!(at.mode, ConversionMode::Exact);
    assert_eq!(above.mode, ConversionMode::Approximate);

    // Approximate metrics are discounted by the structural confidence.
    for row in &above.data.rows {
        assert!((row.confidence.score - 0.85).abs() < 1e-12);
    }
    let sum: f64 = above.data.rows.iter().map(|r| r.number("pagerank").unwrap()).sum();
    assert!((sum - 1.0).abs() < 1e-6);
}

#[test]
fn high_quality_forces_exact() {
    let mut config = test_config();
    config.scaling.node_threshold_pagerank = 10;
    config.scaling.betweenness = false;
    let engine = test_engine(config);

    let result = engine
        .graph_to_table(&ring_graph(50), &ConversionOptions::high_quality())
        .unwrap();
    assert_eq!(result.mode, ConversionMode::Exact);
    for row in &result.data.rows {
        assert!((row.confidence.score - 0.9).abs() < 1e-12);
    }
}

#[test]
fn hard_cap_rejects_without_partial_work() {
    let mut config = test_config();
    config.scaling.hard_cap = 5;
    let engine = test_engine(config);

    let err = engine
        .graph_to_table(&ring_graph(6), &ConversionOptions::default())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ResourceExceeded);
    assert!(engine.cache().is_empty());
}

#[test]
fn dangling_relationship_is_invalid_input() {
    let engine = test_engine(test_config());
    let graph = GraphSnapshot::new(
        vec![entity("A", "a", 0.9)],
        vec![rel("A", "missing", 0.5)],
    );
    let err = engine.graph_to_table(&graph, &ConversionOptions::default()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
}

#[test]
fn out_of_range_confidence_is_rejected() {
    let engine = test_engine(test_config());
    let graph = GraphSnapshot::new(vec![entity("A", "a", 1.2)], vec![]);
    let err = engine.graph_to_table(&graph, &ConversionOptions::default()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
}

#[test]
fn empty_graph_projects_to_empty_table() {
    let engine = test_engine(test_config());
    let result = engine
        .graph_to_table(&GraphSnapshot::default(), &ConversionOptions::default())
        .unwrap();
    assert!(result.data.rows.is_empty());
    assert_eq!(result.mode, ConversionMode::Exact);
    assert_eq!(result.confidence.count, 0);
}
