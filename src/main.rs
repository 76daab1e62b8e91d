//! Notary Sync relay
//!
//! Runs the reference relay that collaborative notarization clients connect
//! to over WebSocket or HTTP polling.

use anyhow::Context;
use std::{net::SocketAddr, sync::Arc};
use tracing::info;

use notary_sync::server::{router, start_background_tasks, AppState, RelayConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "notary_sync=info,tower_http=info".into()),
        )
        .init();

    let config = RelayConfig::from_env();
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));

    let state = Arc::new(AppState::new(config));
    let cleanup = start_background_tasks(state.clone());
    let app = router(state.clone());

    info!("Notary sync relay v{} starting", env!("CARGO_PKG_VERSION"));
    info!("   Listening on: http://{}", addr);
    info!("   WebSocket: ws://{}/workflow/:session_id", addr);
    info!("   Polling: http://{}/workflow/:session_id/sync", addr);
    info!("   Health check: http://{}/health", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind to {}", addr))?;

    let shutdown_state = state.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
            shutdown_state.shutdown();
        })
        .await
        .context("server error")?;

    cleanup.await.context("cleanup task failed")?;
    Ok(())
}
