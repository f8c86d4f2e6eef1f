//! CodeLive server binary.

use anyhow::Context;
use std::sync::Arc;
use tracing::info;

use codelive_server::api::{self, AppState};
use codelive_server::config::ServerConfig;
use codelive_server::storage::SessionDb;
use codelive_server::sync::protocol::PROTOCOL_VERSION;
use codelive_server::sync::SyncServer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables before the filter reads RUST_LOG
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "codelive_server=info,tower_http=info".into()),
        )
        .init();

    let config = ServerConfig::from_env().context("Invalid configuration")?;

    info!("Initializing storage at: {}", config.storage.path);
    let storage = SessionDb::open(&config.storage).context("Failed to open storage")?;

    let sync = Arc::new(SyncServer::new(storage, config.sync.clone()));
    let background = sync.clone().start_background_tasks();

    let app = api::router(Arc::new(AppState::new(sync.clone())));

    let addr = config.addr();
    info!("CodeLive server v{} starting", env!("CARGO_PKG_VERSION"));
    info!("   Protocol version: {}", PROTOCOL_VERSION);
    info!("   Listening on: http://{}", addr);
    info!("   WebSocket: ws://{}/v1/sessions/:id/ws", addr);
    info!("   Health check: http://{}/health", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Shutting down, saving sessions");
    sync.shutdown();
    background.wait().await;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}
