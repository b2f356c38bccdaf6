//! CLI `doctor` command: store diagnostics and configuration check.

use anyhow::{Context, Result};

use kgas::config::KgasConfig;
use kgas::db;

/// Run store diagnostics and print a health report.
pub fn doctor(config: &KgasConfig) -> Result<()> {
    let db_path = config.resolved_db_path();

    if !db_path.exists() {
        println!("Database: not found at {}", db_path.display());
        println!("Run `kgas import <graph.json>` to initialize.");
        return Ok(());
    }

    let file_size = std::fs::metadata(&db_path).map(|m| m.len()).unwrap_or(0);

    let conn = db::open_database(&db_path, config.embedding.dimensions)
        .context("failed to open database (may be corrupt)")?;

    let schema_version = db::migrations::get_schema_version(&conn)?;
    let vec_version: String = conn.query_row("SELECT vec_version()", [], |r| r.get(0))?;
    let integrity: String = conn.query_row("PRAGMA integrity_check", [], |r| r.get(0))?;
    let stats = db::snapshot::store_stats(&conn)?;
    let configured = configured_backend(config);

    println!("KGAS Health Report");
    println!("==================");
    println!();
    println!("Database:          {}", db_path.display());
    println!("File size:         {}", format_bytes(file_size));
    println!("Schema version:    {schema_version}");
    println!("sqlite-vec:        {vec_version}");
    println!();
    println!("Vector backend:");
    println!("  Stored:          {}", stats.vector_backend.as_deref().unwrap_or("(not set)"));
    println!("  Configured:      {configured}");
    match stats.vector_backend.as_deref() {
        Some(stored) if stored != configured => {
            println!("  WARNING: backend mismatch, stored vectors are replaced on the next vector conversion.");
        }
        Some(_) => println!("  Status:          OK (match)"),
        None => {}
    }
    println!();
    println!("Row counts:");
    println!("  Entities:        {}", stats.entities);
    println!("  Relationships:   {}", stats.relationships);
    println!("  Metrics:         {}", stats.metrics);
    println!("  Vectors:         {}", stats.vectors);
    println!("  Conversion log:  {}", stats.conversions);
    println!();
    println!("Scaling:");
    println!("  PageRank exact up to:    {} nodes", config.scaling.node_threshold_pagerank);
    println!("  Similarity exact up to:  {} vectors", config.scaling.node_threshold_similarity);
    println!("  Hard cap:                {}", config.scaling.hard_cap);
    println!("  Force exact:             {}", config.scaling.force_exact);
    println!();
    if integrity == "ok" {
        println!("Integrity check:   PASSED");
    } else {
        println!("Integrity check:   FAILED ({integrity})");
    }

    Ok(())
}

/// Backend identity as it will be recorded, without loading a model.
fn configured_backend(config: &KgasConfig) -> String {
    let e = &config.embedding;
    match e.backend.as_str() {
        "hash" => format!("hash:{}", e.dimensions),
        "local" => format!("onnx:{}:{}", e.model, e.dimensions),
        other => other.to_string(),
    }
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{bytes} B")
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}
