//! Graph store read/write path.
//!
//! [`import_snapshot`] upserts entities and relationships; [`load_snapshot`] hands a consistent
//! [`GraphSnapshot`] to the conversion engine. Conversion outputs flow back through
//! [`write_metrics`] and [`write_vectors`], and every delivered request is recorded with
//! [`log_conversion`].

use anyhow::{bail, Result};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde::Serialize;
use std::collections::{HashMap, HashSet};

use super::{migrations, schema};
use crate::convert::projector::METRIC_COLUMNS;
use crate::convert::types::{ConversionMode, Entity, GraphSnapshot, Relationship, VectorRecord};

#[derive(Debug, Default, Serialize)]
pub struct ImportSummary {
    pub entities: usize,
    pub relationships: usize,
}

#[derive(Debug, Default, Serialize)]
pub struct StoreStats {
    pub entities: i64,
    pub relationships: i64,
    pub metrics: i64,
    pub vectors: i64,
    pub conversions: i64,
    pub entity_types: Vec<(String, i64)>,
    pub vector_backend: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ConversionLogEntry {
    pub request_id: String,
    pub operation: String,
    pub mode: String,
    pub from_cache: bool,
    pub failed_items: i64,
    pub details: Option<serde_json::Value>,
    pub created_at: String,
}

// ── Write path ──

fn upsert_entity(tx: &Transaction, entity: &Entity, now: &str) -> rusqlite::Result<()> {
    tx.execute(
        "INSERT INTO entities (id, name, type, confidence, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?5)
         ON CONFLICT(id) DO UPDATE SET
            name = excluded.name,
            type = excluded.type,
            confidence = excluded.confidence,
            updated_at = excluded.updated_at",
        params![entity.id, entity.name, entity.entity_type, entity.confidence, now],
    )?;
    Ok(())
}

fn upsert_relationship(tx: &Transaction, rel: &Relationship, now: &str) -> rusqlite::Result<()> {
    tx.execute(
        "INSERT INTO relationships (source_id, target_id, type, confidence, evidence_ref, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(source_id, target_id, type) DO UPDATE SET
            confidence = excluded.confidence,
            evidence_ref = excluded.evidence_ref",
        params![rel.source, rel.target, rel.relation_type, rel.confidence, rel.evidence_ref, now],
    )?;
    Ok(())
}

/// Validate and upsert a snapshot in one transaction. Existing entity ids keep their identity;
/// their fields are superseded.
pub fn import_snapshot(conn: &mut Connection, snapshot: &GraphSnapshot) -> Result<ImportSummary> {
    // Relationships may reference entities already in the store.
    let incoming: HashSet<&str> = snapshot.entities.iter().map(|e| e.id.as_str()).collect();
    let mut known: Vec<Entity> = load_entities(conn)?
        .into_iter()
        .filter(|e| !incoming.contains(e.id.as_str()))
        .collect();
    known.extend(snapshot.entities.iter().cloned());
    GraphSnapshot::new(known, snapshot.relationships.clone()).validate()?;

    let now = chrono::Utc::now().to_rfc3339();
    let tx = conn.transaction()?;
    for entity in &snapshot.entities {
        upsert_entity(&tx, entity, &now)?;
    }
    for rel in &snapshot.relationships {
        upsert_relationship(&tx, rel, &now)?;
    }
    tx.commit()?;

    tracing::info!(
        entities = snapshot.entities.len(),
        relationships = snapshot.relationships.len(),
        "snapshot imported"
    );
    Ok(ImportSummary {
        entities: snapshot.entities.len(),
        relationships: snapshot.relationships.len(),
    })
}

/// Supersede the stored structural metrics of `entities` (see `projector::apply_metrics`).
/// Metrics an entity does not carry keep their stored value.
pub fn write_metrics(
    conn: &mut Connection,
    entities: &[Entity],
    mode: ConversionMode,
) -> Result<usize> {
    let now = chrono::Utc::now().to_rfc3339();
    let tx = conn.transaction()?;
    let mut written = 0;
    for entity in entities {
        for metric in METRIC_COLUMNS {
            if let Some(value) = entity.metrics.get(metric) {
                tx.execute(
                    "INSERT OR REPLACE INTO entity_metrics (entity_id, metric, value, mode, computed_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![entity.id, metric, value, mode.as_str(), now],
                )?;
                written += 1;
            }
        }
    }
    tx.commit()?;
    Ok(written)
}

/// Store vectors of successfully embedded records. Vectors from a different backend are
/// discarded first (and the table is rebuilt if the dimension changed).
pub fn write_vectors(
    conn: &mut Connection,
    records: &[VectorRecord],
    backend_identity: &str,
    dimensions: usize,
) -> Result<usize> {
    let tx = conn.transaction()?;
    let stored = migrations::get_vector_backend(&tx)?;
    if stored.as_deref() != Some(backend_identity) {
        if migrations::get_vector_dimensions(&tx)? == Some(dimensions) {
            tx.execute("DELETE FROM entity_vectors", [])?;
        } else {
            schema::reset_vector_table(&tx, dimensions)?;
        }
        migrations::set_vector_backend(&tx, backend_identity)?;
        if let Some(previous) = stored {
            tracing::warn!(previous = %previous, current = backend_identity, "vector backend changed, stored vectors discarded");
        }
    }

    let mut written = 0;
    for record in records.iter().filter(|r| r.status.is_ok()) {
        if record.vector.len() != dimensions {
            bail!(
                "record {} has {} dimensions, store expects {dimensions}",
                record.id,
                record.vector.len()
            );
        }
        // vec0 has no upsert
        tx.execute("DELETE FROM entity_vectors WHERE id = ?1", [&record.id])?;
        tx.execute(
            "INSERT INTO entity_vectors (id, embedding) VALUES (?1, ?2)",
            params![record.id, vector_to_bytes(&record.vector)],
        )?;
        written += 1;
    }
    tx.commit()?;
    Ok(written)
}

pub fn log_conversion(
    conn: &Connection,
    request_id: &str,
    operation: &str,
    mode: ConversionMode,
    from_cache: bool,
    failed_items: usize,
    details: Option<&serde_json::Value>,
) -> Result<()> {
    let now = chrono::Utc::now().to_rfc3339();
    let details = details.map(serde_json::to_string).transpose()?;
    conn.execute(
        "INSERT INTO conversion_log (request_id, operation, mode, from_cache, failed_items, details, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            request_id,
            operation,
            mode.as_str(),
            from_cache,
            failed_items as i64,
            details,
            now
        ],
    )?;
    Ok(())
}

// ── Read path ──

fn load_entities(conn: &Connection) -> Result<Vec<Entity>> {
    let mut metrics: HashMap<String, Vec<(String, f64)>> = HashMap::new();
    let mut stmt = conn.prepare("SELECT entity_id, metric, value FROM entity_metrics")?;
    let rows = stmt.query_map([], |r| {
        Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?, r.get::<_, f64>(2)?))
    })?;
    for row in rows {
        let (id, metric, value) = row?;
        metrics.entry(id).or_default().push((metric, value));
    }

    let mut stmt =
        conn.prepare("SELECT id, name, type, confidence FROM entities ORDER BY id")?;
    let entities = stmt
        .query_map([], |r| {
            Ok(Entity {
                id: r.get(0)?,
                name: r.get(1)?,
                entity_type: r.get(2)?,
                confidence: r.get(3)?,
                metrics: Default::default(),
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(entities
        .into_iter()
        .map(|mut e| {
            if let Some(m) = metrics.remove(&e.id) {
                e.metrics = m.into_iter().collect();
            }
            e
        })
        .collect())
}

/// Read the whole graph. Entities come back in id order; relationships in insertion order.
pub fn load_snapshot(conn: &Connection) -> Result<GraphSnapshot> {
    let entities = load_entities(conn)?;
    let mut stmt = conn.prepare(
        "SELECT source_id, target_id, type, confidence, evidence_ref FROM relationships ORDER BY id",
    )?;
    let relationships = stmt
        .query_map([], |r| {
            Ok(Relationship {
                source: r.get(0)?,
                target: r.get(1)?,
                relation_type: r.get(2)?,
                confidence: r.get(3)?,
                evidence_ref: r.get(4)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(GraphSnapshot::new(entities, relationships))
}

/// Stored vector for one entity.
pub fn get_vector(conn: &Connection, id: &str) -> Result<Option<Vec<f32>>> {
    let bytes: Option<Vec<u8>> = conn
        .query_row(
            "SELECT embedding FROM entity_vectors WHERE id = ?1",
            [id],
            |r| r.get(0),
        )
        .optional()?;
    Ok(bytes.map(|b| bytes_to_vector(&b)))
}

/// `k` stored vectors closest to `query` (L2 distance on normalized vectors), nearest first.
pub fn nearest_vectors(conn: &Connection, query: &[f32], k: usize) -> Result<Vec<(String, f64)>> {
    let mut stmt = conn.prepare(
        "SELECT id, distance FROM entity_vectors WHERE embedding MATCH ?1 ORDER BY distance LIMIT ?2",
    )?;
    let hits = stmt
        .query_map(params![vector_to_bytes(query), k as i64], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, f64>(1)?))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(hits)
}

pub fn recent_conversions(conn: &Connection, limit: usize) -> Result<Vec<ConversionLogEntry>> {
    let mut stmt = conn.prepare(
        "SELECT request_id, operation, mode, from_cache, failed_items, details, created_at
         FROM conversion_log ORDER BY id DESC LIMIT ?1",
    )?;
    let entries = stmt
        .query_map([limit as i64], |r| {
            let details: Option<String> = r.get(5)?;
            Ok(ConversionLogEntry {
                request_id: r.get(0)?,
                operation: r.get(1)?,
                mode: r.get(2)?,
                from_cache: r.get(3)?,
                failed_items: r.get(4)?,
                details: details.and_then(|d| serde_json::from_str(&d).ok()),
                created_at: r.get(6)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(entries)
}

pub fn store_stats(conn: &Connection) -> Result<StoreStats> {
    let count = |sql: &str| -> rusqlite::Result<i64> { conn.query_row(sql, [], |r| r.get(0)) };

    let mut stmt =
        conn.prepare("SELECT type, COUNT(*) FROM entities GROUP BY type ORDER BY COUNT(*) DESC, type")?;
    let entity_types = stmt
        .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(StoreStats {
        entities: count("SELECT COUNT(*) FROM entities")?,
        relationships: count("SELECT COUNT(*) FROM relationships")?,
        metrics: count("SELECT COUNT(*) FROM entity_metrics")?,
        vectors: count("SELECT COUNT(*) FROM entity_vectors")?,
        conversions: count("SELECT COUNT(*) FROM conversion_log")?,
        entity_types,
        vector_backend: migrations::get_vector_backend(conn)?,
    })
}

// ── Vector encoding ──

/// Little-endian f32 blob, the layout vec0 expects.
pub fn vector_to_bytes(v: &[f32]) -> Vec<u8> {
    v.iter().flat_map(|x| x.to_le_bytes()).collect()
}

pub fn bytes_to_vector(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}
