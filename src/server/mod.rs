//! HTTP surface: the OSBAPI endpoints plus the administrative routes.

pub mod admin;
pub mod handlers;
pub mod middleware;
pub mod router;
pub mod state;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

pub use router::build;
pub use state::AppState;

/// Serve until `shutdown` is cancelled.
pub async fn serve(state: AppState, port: u16, shutdown: CancellationToken) -> Result<()> {
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(%addr, "listening");

    axum::serve(listener, build(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("server error")
}
