mod cli;
mod server;
mod tools;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "kgas",
    version,
    about = "Cross-modal knowledge graph conversion engine (MCP server + CLI)"
)]
struct Cli {
    /// Config file (default: ~/.kgas/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the MCP server on the configured transport (`server.transport`, default stdio)
    Serve,
    /// Start the MCP server over Streamable HTTP
    ServeHttp,
    /// Import a graph snapshot JSON file ({entities, relationships})
    Import { file: PathBuf },
    /// Convert the stored graph to another view
    Convert {
        #[arg(value_enum)]
        target: cli::convert::Target,
        #[command(flatten)]
        args: cli::convert::ConvertArgs,
    },
    /// Show graph store statistics and recent conversions
    Stats {
        /// Number of recent conversions to list
        #[arg(long, default_value_t = 10)]
        recent: usize,
    },
    /// List the entities nearest to an entity by stored vector
    Neighbors {
        id: String,
        #[arg(short, long, default_value_t = 10)]
        k: usize,
    },
    /// Check the store and configuration
    Doctor,
    /// Manage the embedding model
    Model {
        #[command(subcommand)]
        action: ModelAction,
    },
}

#[derive(Subcommand)]
enum ModelAction {
    /// Download the embedding model to ~/.kgas/models/
    Download,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => kgas::config::KgasConfig::load_from(path)?,
        None => kgas::config::KgasConfig::load()?,
    };

    // Log to stderr so stdout stays clean for MCP JSON-RPC.
    let filter = EnvFilter::try_new(&config.server.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Serve if config.server.transport == "http" => server::serve_http(config).await?,
        Command::Serve => server::serve_stdio(config).await?,
        Command::ServeHttp => server::serve_http(config).await?,
        Command::Import { file } => cli::import::import(&config, &file)?,
        Command::Convert { target, args } => cli::convert::convert(config, target, &args).await?,
        Command::Stats { recent } => cli::stats::stats(&config, recent)?,
        Command::Neighbors { id, k } => cli::neighbors::neighbors(&config, &id, k)?,
        Command::Doctor => cli::doctor::doctor(&config)?,
        Command::Model { action } => match action {
            ModelAction::Download => cli::model_download(&config.embedding).await?,
        },
    }

    Ok(())
}
