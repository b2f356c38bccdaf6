use anyhow::Result;
use std::path::Path;

use kgas::config::KgasConfig;
use kgas::convert::GraphSnapshot;

/// Import a knowledge-graph snapshot (`{entities, relationships}` JSON) into the graph store.
///
/// Existing entity ids are updated in place. Relationships may point at entities imported
/// earlier.
pub fn import(config: &KgasConfig, file: &Path) -> Result<()> {
    let snapshot = GraphSnapshot::from_json_file(file)?;

    let db_path = config.resolved_db_path();
    let mut conn = kgas::db::open_database(&db_path, config.embedding.dimensions)?;

    println!(
        "Importing {} entities and {} relationships...",
        snapshot.entities.len(),
        snapshot.relationships.len()
    );

    let summary = kgas::db::snapshot::import_snapshot(&mut conn, &snapshot)?;

    println!("Import complete:");
    println!("  Entities:       {}", summary.entities);
    println!("  Relationships:  {}", summary.relationships);

    Ok(())
}
