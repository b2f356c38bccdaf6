use anyhow::Result;

use kgas::config::KgasConfig;

/// Display graph store statistics and recent conversions in the terminal.
pub fn stats(config: &KgasConfig, recent: usize) -> Result<()> {
    let db_path = config.resolved_db_path();
    let conn = kgas::db::open_database(&db_path, config.embedding.dimensions)?;

    let stats = kgas::db::snapshot::store_stats(&conn)?;

    println!("Graph Store Statistics");
    println!("{}", "=".repeat(40));
    println!("  Entities:            {}", stats.entities);
    println!("  Relationships:       {}", stats.relationships);
    println!("  Stored metrics:      {}", stats.metrics);
    println!("  Stored vectors:      {}", stats.vectors);
    println!(
        "  Vector backend:      {}",
        stats.vector_backend.as_deref().unwrap_or("(none)")
    );
    println!();

    if !stats.entity_types.is_empty() {
        println!("By Type:");
        for (entity_type, count) in &stats.entity_types {
            println!("  {:<20} {}", entity_type, count);
        }
        println!();
    }

    println!("Conversions logged:    {}", stats.conversions);
    let conversions = kgas::db::snapshot::recent_conversions(&conn, recent)?;
    for entry in &conversions {
        println!(
            "  {}  {:<20} {:<12} cache={:<5} failed={}",
            entry.created_at, entry.operation, entry.mode, entry.from_cache, entry.failed_items
        );
    }

    Ok(())
}
