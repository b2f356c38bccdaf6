//! SQL DDL for the graph store.
//!
//! Defines `entities`, `relationships`, `entity_metrics`, `schema_meta` and the `entity_vectors`
//! vec0 table. All DDL uses `IF NOT EXISTS` so initialization is idempotent.

use rusqlite::Connection;

const SCHEMA_SQL: &str = r#"
-- Knowledge-graph nodes
CREATE TABLE IF NOT EXISTS entities (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    type TEXT NOT NULL,
    confidence REAL NOT NULL CHECK(confidence >= 0.0 AND confidence <= 1.0),
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_entities_type ON entities(type);

-- Directed, typed edges. One row per (source, target, type).
CREATE TABLE IF NOT EXISTS relationships (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source_id TEXT NOT NULL REFERENCES entities(id) ON DELETE CASCADE,
    target_id TEXT NOT NULL REFERENCES entities(id) ON DELETE CASCADE,
    type TEXT NOT NULL,
    confidence REAL NOT NULL CHECK(confidence >= 0.0 AND confidence <= 1.0),
    evidence_ref TEXT,
    created_at TEXT NOT NULL,
    UNIQUE(source_id, target_id, type)
);

CREATE INDEX IF NOT EXISTS idx_relationships_source ON relationships(source_id);
CREATE INDEX IF NOT EXISTS idx_relationships_target ON relationships(target_id);

-- Derived structural metrics, superseded on every re-computation
CREATE TABLE IF NOT EXISTS entity_metrics (
    entity_id TEXT NOT NULL REFERENCES entities(id) ON DELETE CASCADE,
    metric TEXT NOT NULL,
    value REAL NOT NULL,
    mode TEXT NOT NULL CHECK(mode IN ('exact','approximate','sampled')),
    computed_at TEXT NOT NULL,
    PRIMARY KEY (entity_id, metric)
);

-- Schema metadata
CREATE TABLE IF NOT EXISTS schema_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// vec0 DDL; the dimension comes from the embedding backend.
pub fn vector_table_sql(dimensions: usize) -> String {
    format!(
        "CREATE VIRTUAL TABLE IF NOT EXISTS entity_vectors USING vec0(\n    \
         id TEXT PRIMARY KEY,\n    embedding FLOAT[{dimensions}]\n);"
    )
}

/// Initialize all schema tables. Idempotent.
pub fn init_schema(conn: &Connection, dimensions: usize) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA_SQL)?;
    conn.execute_batch(&vector_table_sql(dimensions))?;

    // Set initial schema version if not already present
    conn.execute(
        "INSERT OR IGNORE INTO schema_meta (key, value) VALUES ('schema_version', '1')",
        [],
    )?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_meta (key, value) VALUES ('vector_dimensions', ?1)",
        [dimensions.to_string()],
    )?;
    Ok(())
}

/// Drop and recreate `entity_vectors` with a new dimension. Stored vectors are discarded.
pub fn reset_vector_table(conn: &Connection, dimensions: usize) -> rusqlite::Result<()> {
    conn.execute_batch("DROP TABLE IF EXISTS entity_vectors;")?;
    conn.execute_batch(&vector_table_sql(dimensions))?;
    conn.execute(
        "INSERT OR REPLACE INTO schema_meta (key, value) VALUES ('vector_dimensions', ?1)",
        [dimensions.to_string()],
    )?;
    Ok(())
}
