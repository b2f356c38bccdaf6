//! MCP server initialization for stdio and Streamable HTTP transports.
//!
//! Provides [`serve_stdio`] and [`serve_http`] entry points that wire up the graph store,
//! embedding backend, conversion cache and MCP tool handler into a running server.

use anyhow::Result;
use rmcp::ServiceExt;
use std::sync::{Arc, Mutex};

use crate::tools::KgasTools;
use kgas::cache::ConversionCache;
use kgas::config::KgasConfig;
use kgas::convert::ConversionEngine;
use kgas::{db, embedding};

/// Build the conversion engine (backend + cache) for `config`.
pub fn build_engine(config: Arc<KgasConfig>) -> Result<Arc<ConversionEngine>> {
    let backend: Arc<dyn embedding::EmbeddingBackend> =
        Arc::from(embedding::create_backend(&config.embedding)?);
    tracing::info!(backend = %backend.identity(), "embedding backend ready");

    let cache = Arc::new(ConversionCache::from_config(&config.cache));
    Ok(Arc::new(ConversionEngine::new(config, cache, backend)?))
}

/// Shared setup: open the store, build the engine, check the vector backend.
fn setup_shared_state(
    config: KgasConfig,
) -> Result<(Arc<Mutex<rusqlite::Connection>>, Arc<ConversionEngine>)> {
    let db_path = config.resolved_db_path();
    let conn = db::open_database(&db_path, config.embedding.dimensions)?;
    tracing::info!(db = %db_path.display(), "graph store ready");

    let engine = build_engine(Arc::new(config))?;

    // Check for embedding backend mismatch
    if let Ok(Some(stored)) = db::migrations::get_vector_backend(&conn) {
        let current = engine.backend().identity();
        if stored != current {
            tracing::warn!(
                stored = %stored,
                configured = %current,
                "embedding backend changed, stored vectors are replaced on the next vector conversion"
            );
        }
    }

    Ok((Arc::new(Mutex::new(conn)), engine))
}

/// Start the MCP server over stdio transport.
pub async fn serve_stdio(config: KgasConfig) -> Result<()> {
    tracing::info!("starting KGAS MCP server on stdio");

    let (db, engine) = setup_shared_state(config)?;

    let tools = KgasTools::new(db, engine);
    let transport = rmcp::transport::stdio();

    let server = tools.serve(transport).await?;
    tracing::info!("MCP server running, waiting for client");

    server.waiting().await?;
    tracing::info!("MCP server shut down");

    Ok(())
}

/// Start the MCP server over Streamable HTTP transport.
pub async fn serve_http(config: KgasConfig) -> Result<()> {
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    tracing::info!(addr = %bind_addr, "starting KGAS MCP server on HTTP");

    let (db, engine) = setup_shared_state(config)?;

    let service = rmcp::transport::streamable_http_server::StreamableHttpService::new(
        move || Ok(KgasTools::new(db.clone(), engine.clone())),
        rmcp::transport::streamable_http_server::session::local::LocalSessionManager::default()
            .into(),
        Default::default(),
    );

    let router = axum::Router::new().nest_service("/mcp", service);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(addr = %bind_addr, "MCP server listening at http://{bind_addr}/mcp");

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for ctrl-c");
            }
            tracing::info!("shutting down HTTP server");
        })
        .await?;

    Ok(())
}
