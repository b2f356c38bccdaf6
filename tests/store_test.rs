mod helpers;

use helpers::{chain_graph, entity, test_config, test_db, test_engine, TEST_DIMS};
use kgas::convert::{projector, ConversionMode, ConversionOptions, GraphSnapshot};
use kgas::db::{self, migrations, snapshot};
use tempfile::TempDir;

#[test]
fn open_creates_new_db_at_nonexistent_path() {
    let tmp = TempDir::new().unwrap();
    let db_path = tmp.path().join("subdir").join("graph.db");
    assert!(!db_path.exists());

    let conn = db::open_database(&db_path, TEST_DIMS).unwrap();
    assert!(db_path.exists());
    assert_eq!(
        migrations::get_schema_version(&conn).unwrap(),
        migrations::CURRENT_SCHEMA_VERSION
    );
    let stats = snapshot::store_stats(&conn).unwrap();
    assert_eq!(stats.entities, 0);
}

#[test]
fn imported_graph_loads_back_sorted() {
    let mut conn = test_db();
    let summary = snapshot::import_snapshot(&mut conn, &chain_graph()).unwrap();
    assert_eq!(summary.entities, 3);
    assert_eq!(summary.relationships, 2);

    let loaded = snapshot::load_snapshot(&conn).unwrap();
    assert_eq!(loaded, chain_graph());
}

#[test]
fn metrics_written_by_projection_load_with_entities() {
    let mut conn = test_db();
    snapshot::import_snapshot(&mut conn, &chain_graph()).unwrap();

    let engine = test_engine(test_config());
    let graph = snapshot::load_snapshot(&conn).unwrap();
    let result = engine.graph_to_table(&graph, &ConversionOptions::default()).unwrap();
    let updated = projector::apply_metrics(&graph.entities, &result.data);
    let written = snapshot::write_metrics(&mut conn, &updated, result.mode).unwrap();
    assert_eq!(written, 9);

    let loaded = snapshot::load_snapshot(&conn).unwrap();
    let b = &loaded.entities[1];
    assert!((b.metrics["betweenness"] - 0.5).abs() < 1e-12);
    assert_eq!(b.metrics["degree"], 2.0);

    let mode: String = conn
        .query_row(
            "SELECT mode FROM entity_metrics WHERE entity_id = 'A' AND metric = 'pagerank'",
            [],
            |r| r.get(0),
        )
        .unwrap();
    assert_eq!(mode, ConversionMode::Exact.as_str());
}

#[tokio::test]
async fn vectors_store_and_nearest_neighbor_lookup() {
    let mut conn = test_db();
    let graph = GraphSnapshot::new(
        vec![
            entity("x1", "Enigma machine", 0.9),
            entity("x2", "Enigma machine rotor", 0.9),
            entity("y", "Lorenz cipher teleprinter", 0.9),
        ],
        vec![],
    );
    snapshot::import_snapshot(&mut conn, &graph).unwrap();

    let engine = test_engine(test_config());
    let result = engine
        .graph_to_vectors(&graph, "name", &ConversionOptions::default())
        .await
        .unwrap();
    let backend = engine.backend();
    let written = snapshot::write_vectors(
        &mut conn,
        &result.data,
        &backend.identity(),
        backend.dimensions(),
    )
    .unwrap();
    assert_eq!(written, 3);

    let query = snapshot::get_vector(&conn, "x1").unwrap().unwrap();
    assert_eq!(query, result.data[0].vector);

    let hits = snapshot::nearest_vectors(&conn, &query, 2).unwrap();
    assert_eq!(hits[0].0, "x1");
    assert!(hits[0].1 < 1e-5);
    assert_eq!(hits[1].0, "x2");
}

#[test]
fn conversion_log_records_delivered_requests() {
    let conn = test_db();
    let details = serde_json::json!({ "note": "projection" });
    snapshot::log_conversion(&conn, "req-1", "graph_to_table", ConversionMode::Exact, false, 0, None)
        .unwrap();
    snapshot::log_conversion(
        &conn,
        "req-2",
        "table_to_vector",
        ConversionMode::Sampled,
        false,
        3,
        Some(&details),
    )
    .unwrap();

    let recent = snapshot::recent_conversions(&conn, 10).unwrap();
    assert_eq!(recent.len(), 2);
    assert_eq!(recent[0].request_id, "req-2");
    assert_eq!(recent[0].mode, "sampled");
    assert_eq!(recent[0].failed_items, 3);
    assert_eq!(recent[0].details.as_ref().unwrap()["note"], "projection");
    assert_eq!(snapshot::store_stats(&conn).unwrap().conversions, 2);
}
