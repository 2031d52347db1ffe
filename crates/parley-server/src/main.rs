use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::EnvFilter;

use parley_server::services::{MemorySessionStore, PgSessionStore, SessionStore};
use parley_server::ws::registry::CloseReason;
use parley_server::{app, workers, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env
    dotenvy::dotenv().ok();

    // Load configuration
    let config = parley_common::AppConfig::load().context("Failed to load configuration")?;

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.server.log_level)),
        )
        .json()
        .init();

    tracing::info!("Starting Parley server...");

    let store: Arc<dyn SessionStore> = match &config.database {
        Some(db) => {
            let pool = PgPoolOptions::new()
                .max_connections(db.max_connections)
                .connect(&db.url)
                .await
                .context("Failed to connect to PostgreSQL")?;
            tracing::info!("Connected to PostgreSQL");
            Arc::new(PgSessionStore::new(pool))
        }
        None => {
            tracing::warn!("No database configured, using in-memory session store");
            Arc::new(MemorySessionStore::new())
        }
    };

    let state = AppState::new(config.clone(), store);

    // Start background workers
    let worker_handles = workers::start_all_workers(state.clone());
    tracing::info!("Background workers started");

    let host: std::net::IpAddr = config
        .server
        .host
        .parse()
        .with_context(|| format!("Invalid server.host {:?}", config.server.host))?;
    let addr = SocketAddr::new(host, config.server.api_port);
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app(state.clone()).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(state.clone()))
    .await?;

    for handle in worker_handles {
        handle.abort();
    }
    tracing::info!("Server stopped");

    Ok(())
}

/// Waits for Ctrl-C or SIGTERM, then closes every live socket so the
/// graceful shutdown is not held open by WebSocket connections.
async fn shutdown_signal(state: Arc<AppState>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl-C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
    let closed = state.registry.close_all(CloseReason::ServerShutdown);
    tracing::info!(closed, "Closed live connections");
}
