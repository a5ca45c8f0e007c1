//! Minimal HTTP surface: a health endpoint for deployment probes.

use axum::{Json, Router, routing::get};

pub fn build_router() -> Router {
    Router::new().route("/health", get(health))
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Serve until the process is asked to shut down.
pub async fn serve(port: u16) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!(port, "server.listening");
    axum::serve(listener, build_router()).await?;
    Ok(())
}
