mod helpers;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use helpers::{engine_with, test_config, test_engine, text_rows, FlakyBackend, TEST_DIMS};
use kgas::convert::{CancelSignal, ConversionMode, ConversionOptions, RecordStatus};
use kgas::error::ErrorKind;

#[tokio::test]
async fn every_row_gets_a_normalized_vector() {
    let engine = test_engine(test_config());
    let rows = text_rows(20);
    let result = engine
        .table_to_vector(&rows, "text", &ConversionOptions::default())
        .await
        .unwrap();

    assert_eq!(result.mode, ConversionMode::Exact);
    assert_eq!(result.failed_items, 0);
    assert_eq!(result.data.len(), 20);
    for (record, row) in result.data.iter().zip(&rows) {
        assert_eq!(record.id, row.id);
        assert_eq!(record.status, RecordStatus::Ok);
        assert_eq!(record.vector.len(), TEST_DIMS);
        let norm: f32 = record.vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
        assert!(record.confidence.score <= row.confidence.score);
    }
}

#[tokio::test]
async fn one_failing_row_is_isolated() {
    let rows = text_rows(50);
    let poison = rows[17].text("text").unwrap().to_string();
    let backend = Arc::new(FlakyBackend::new(TEST_DIMS, &poison));
    let engine = engine_with(test_config(), backend.clone());

    let result = engine
        .table_to_vector(&rows, "text", &ConversionOptions::default())
        .await
        .unwrap();

    assert_eq!(result.data.len(), 50);
    assert_eq!(result.failed_items, 1);

    let ok = result.data.iter().filter(|r| r.status.is_ok()).count();
    assert_eq!(ok, 49);

    let failed = result.data.iter().find(|r| r.is_failed()).unwrap();
    assert_eq!(failed.id, rows[17].id);
    assert!(matches!(failed.status, RecordStatus::EmbeddingFailed { .. }));
    assert!(failed.vector.iter().all(|x| *x == 0.0));
    assert!(failed.confidence.score < 0.9 * 0.5);

    // Batch retries plus one call per row of the poisoned batch.
    assert!(backend.calls.load(Ordering::SeqCst) > 50 / 8);
}

#[tokio::test]
async fn results_with_failures_are_not_cached() {
    let rows = text_rows(10);
    let poison = rows[3].text("text").unwrap().to_string();
    let engine = engine_with(test_config(), Arc::new(FlakyBackend::new(TEST_DIMS, &poison)));

    let first = engine
        .table_to_vector(&rows, "text", &ConversionOptions::default())
        .await
        .unwrap();
    let second = engine
        .table_to_vector(&rows, "text", &ConversionOptions::default())
        .await
        .unwrap();
    assert!(!first.from_cache);
    assert!(!second.from_cache);
    assert_eq!(second.failed_items, 1);
}

#[tokio::test]
async fn repeated_embedding_is_served_from_cache() {
    let engine = test_engine(test_config());
    let rows = text_rows(12);
    let first = engine
        .table_to_vector(&rows, "text", &ConversionOptions::default())
        .await
        .unwrap();
    let second = engine
        .table_to_vector(&rows, "text", &ConversionOptions::default())
        .await
        .unwrap();
    assert!(second.from_cache);
    assert_eq!(first.data, second.data);
}

#[tokio::test]
async fn cancelled_request_marks_rows_and_reports_sampled() {
    let engine = test_engine(test_config());
    let rows = text_rows(16);
    let cancel = CancelSignal::new();
    cancel.cancel();

    let result = engine
        .table_to_vector(&rows, "text", &ConversionOptions::default().with_cancel(cancel))
        .await
        .unwrap();

    assert_eq!(result.mode, ConversionMode::Sampled);
    assert_eq!(result.failed_items, 16);
    assert!(result.data.iter().all(|r| r.status == RecordStatus::Cancelled));
    assert!(engine.cache().stats().inserts == 0);
}

#[tokio::test]
async fn expired_deadline_is_a_partial_result_not_an_error() {
    let engine = test_engine(test_config());
    let rows = text_rows(8);
    let cancel = CancelSignal::new().with_timeout(Duration::from_millis(1));
    tokio::time::sleep(Duration::from_millis(5)).await;

    let result = engine
        .table_to_vector(&rows, "text", &ConversionOptions::default().with_cancel(cancel))
        .await
        .unwrap();
    assert_eq!(result.mode, ConversionMode::Sampled);
    assert_eq!(result.data.len(), 8);
}

#[tokio::test]
async fn deadline_during_retry_backoff_reports_sampled() {
    let rows = text_rows(1);
    let poison = rows[0].text("text").unwrap().to_string();
    let backend = Arc::new(FlakyBackend::new(TEST_DIMS, &poison));
    let mut config = test_config();
    config.embedding.max_retries = 3;
    config.embedding.retry_initial_delay_ms = 200;
    config.embedding.retry_max_delay_ms = 200;
    let engine = engine_with(config, backend.clone());

    let cancel = CancelSignal::new().with_timeout(Duration::from_millis(50));
    let result = engine
        .table_to_vector(&rows, "text", &ConversionOptions::default().with_cancel(cancel))
        .await
        .unwrap();

    assert_eq!(result.mode, ConversionMode::Sampled);
    assert_eq!(result.failed_items, 1);
    assert_eq!(result.data[0].status, RecordStatus::Cancelled);
    assert!(backend.calls.load(Ordering::SeqCst) < 4);
    assert!(engine.cache().is_empty());
}

#[tokio::test]
async fn missing_text_column_is_invalid_input() {
    let engine = test_engine(test_config());
    let err = engine
        .table_to_vector(&text_rows(3), "summary", &ConversionOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
}
