use anyhow::{bail, Result};

use kgas::config::KgasConfig;

/// Print the entities whose stored vectors are nearest to `id`'s vector.
pub fn neighbors(config: &KgasConfig, id: &str, k: usize) -> Result<()> {
    let db_path = config.resolved_db_path();
    let conn = kgas::db::open_database(&db_path, config.embedding.dimensions)?;

    let Some(query) = kgas::db::snapshot::get_vector(&conn, id)? else {
        bail!("no stored vector for entity {id}, run `kgas convert vectors` first");
    };

    let hits: Vec<_> = kgas::db::snapshot::nearest_vectors(&conn, &query, k + 1)?
        .into_iter()
        .filter(|(hit, _)| hit != id)
        .take(k)
        .collect();

    if hits.is_empty() {
        println!("No neighbors found.");
        return Ok(());
    }

    println!("Nearest to {id}:\n");
    for (i, (hit, distance)) in hits.iter().enumerate() {
        println!(
            "  {}. {} (cosine: {:.4}, distance: {:.4})",
            i + 1,
            hit,
            1.0 - distance * distance / 2.0,
            distance
        );
    }

    Ok(())
}
