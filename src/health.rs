//! Liveness endpoint for container orchestrators.

use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;

pub fn router() -> Router {
    Router::new().route("/", get(|| async { "Bot is running!" }))
}

/// Serve the health endpoint on `0.0.0.0:<port>` until the process exits.
pub async fn serve(port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!(port, "health endpoint listening");
    axum::serve(listener, router()).await?;
    Ok(())
}
