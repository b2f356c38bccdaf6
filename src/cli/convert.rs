//! CLI `convert` command: run a conversion over the stored graph.

use anyhow::Result;
use clap::{Args, ValueEnum};
use std::sync::Arc;

use kgas::config::KgasConfig;
use kgas::convert::{projector, ConversionResult, SimilarityParams};
use kgas::db::snapshot;

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum Target {
    /// Node/edge tables with structural metrics
    Table,
    /// One embedding per entity
    Vectors,
    /// Cosine similarity graph over entity embeddings
    Similarity,
}

#[derive(Debug, Args)]
pub struct ConvertArgs {
    /// Force exact algorithms regardless of graph size
    #[arg(long)]
    pub high_quality: bool,
    /// Compute betweenness centrality (table only)
    #[arg(long)]
    pub betweenness: Option<bool>,
    /// Time budget in seconds; an expired budget yields a partial `sampled` result
    #[arg(long)]
    pub deadline_secs: Option<f64>,
    /// Node table column to embed
    #[arg(long)]
    pub text_field: Option<String>,
    /// Cosine similarity threshold
    #[arg(long, allow_negative_numbers = true)]
    pub threshold: Option<f64>,
    /// Keep at most k neighbors per node
    #[arg(long)]
    pub top_k: Option<usize>,
    /// Do not write metrics/vectors back to the store
    #[arg(long)]
    pub no_persist: bool,
    /// Print the full result as JSON
    #[arg(long)]
    pub json: bool,
}

pub async fn convert(config: KgasConfig, target: Target, args: &ConvertArgs) -> Result<()> {
    let db_path = config.resolved_db_path();
    let mut conn = kgas::db::open_database(&db_path, config.embedding.dimensions)?;
    let graph = snapshot::load_snapshot(&conn)?;
    anyhow::ensure!(
        !graph.entities.is_empty(),
        "graph store is empty, run `kgas import <graph.json>` first"
    );

    let betweenness = match target {
        Target::Table => args.betweenness,
        _ => Some(false),
    };
    let opts = crate::tools::request_options(Some(args.high_quality), betweenness, args.deadline_secs)
        .map_err(anyhow::Error::msg)?;
    let text_field = args
        .text_field
        .clone()
        .unwrap_or_else(|| config.embedding.text_field.clone());

    let engine = crate::server::build_engine(Arc::new(config))?;

    match target {
        Target::Table => {
            let result = engine.graph_to_table(&graph, &opts)?;
            if !args.no_persist {
                let updated = projector::apply_metrics(&graph.entities, &result.data);
                let written = snapshot::write_metrics(&mut conn, &updated, result.mode)?;
                tracing::info!(written, "metrics stored");
            }
            log(&conn, &result)?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                print_envelope(&result);
                println!("  Node rows:      {}", result.data.rows.len());
                println!("  Edge rows:      {}", result.data.edge_rows.len());
                let mut top: Vec<_> = result
                    .data
                    .rows
                    .iter()
                    .filter_map(|r| r.number("pagerank").map(|p| (p, r.id.as_str())))
                    .collect();
                top.sort_by(|a, b| b.0.total_cmp(&a.0));
                println!("\nTop PageRank:");
                for (score, id) in top.iter().take(10) {
                    println!("  {score:.6}  {id}");
                }
            }
        }
        Target::Vectors => {
            let result = engine.graph_to_vectors(&graph, &text_field, &opts).await?;
            if !args.no_persist {
                let backend = engine.backend();
                let written = snapshot::write_vectors(
                    &mut conn,
                    &result.data,
                    &backend.identity(),
                    backend.dimensions(),
                )?;
                tracing::info!(written, "vectors stored");
            }
            log(&conn, &result)?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                print_envelope(&result);
                println!("  Records:        {}", result.data.len());
                for record in result.data.iter().filter(|r| r.is_failed()) {
                    println!("  {:<24} {}", record.id, record.status.as_str());
                }
            }
        }
        Target::Similarity => {
            let defaults = engine.default_similarity_params();
            let params = SimilarityParams {
                threshold: args.threshold.unwrap_or(defaults.threshold),
                top_k: args.top_k.or(defaults.top_k),
            };
            let result = engine
                .graph_to_similarity(&graph, &text_field, &params, &opts)
                .await?;
            log(&conn, &result)?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                print_envelope(&result);
                println!("  Nodes:          {}", result.data.nodes.len());
                println!("  Edges:          {}", result.data.edges.len());
                println!("  Isolated:       {}", result.data.isolated_nodes().len());
            }
        }
    }

    Ok(())
}

fn log<T>(conn: &rusqlite::Connection, result: &ConversionResult<T>) -> Result<()> {
    let details = serde_json::json!({ "confidence": result.confidence, "states": result.states });
    snapshot::log_conversion(
        conn,
        &result.request_id,
        result.operation,
        result.mode,
        result.from_cache,
        result.failed_items,
        Some(&details),
    )
}

fn print_envelope<T>(result: &ConversionResult<T>) {
    println!("{} ({})", result.operation, result.request_id);
    println!("  Mode:           {}", result.mode);
    println!(
        "  Confidence:     min {:.3} / mean {:.3} / max {:.3} over {}",
        result.confidence.min, result.confidence.mean, result.confidence.max, result.confidence.count
    );
    println!("  Failed items:   {}", result.failed_items);
}
