// src/server/metrics_server.rs

use crate::core::connection::StoreConnection;
use crate::core::metrics::{self, gather_metrics};
use anyhow::{Context, Result};
use axum::{Router, http::StatusCode, response::IntoResponse, routing::get};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;

/// Handles HTTP requests to the /metrics endpoint.
async fn metrics_handler(connection: Arc<StoreConnection>) -> impl IntoResponse {
    metrics::BROKER_CONNECTED.set(if connection.is_active() { 1.0 } else { 0.0 });

    let body = gather_metrics();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        body,
    )
}

/// Serves Prometheus metrics on /metrics until the shutdown signal.
pub async fn run_metrics_server(
    port: u16,
    connection: Arc<StoreConnection>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<()> {
    let app = Router::new().route(
        "/metrics",
        get(move || metrics_handler(Arc::clone(&connection))),
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind metrics server on port {port}"))?;
    info!(
        "Prometheus metrics server listening on http://{}/metrics",
        addr
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_rx.recv().await.ok();
            info!("Metrics server shutting down.");
        })
        .await
        .context("Metrics server failed")
}
