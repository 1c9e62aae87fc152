// src/server/spawner.rs

//! Starts a node's long-running work.

use super::context::FleetContext;
use super::metrics_server;
use crate::core::command::Command;
use anyhow::Result;
use std::sync::Arc;
use tracing::{info, warn};

/// Starts the subscriptions and the metrics endpoint, then announces this node's
/// version on the portals channel.
pub async fn spawn_all(ctx: &mut FleetContext) -> Result<()> {
    ctx.dispatcher.start();

    if ctx.config.metrics.enabled {
        let port = ctx.config.metrics.port;
        let connection = Arc::clone(&ctx.connection);
        let shutdown_rx = ctx.shutdown_tx.subscribe();
        ctx.background_tasks.spawn(async move {
            metrics_server::run_metrics_server(port, connection, shutdown_rx).await
        });
    } else {
        info!("Prometheus metrics server is disabled in the configuration.");
    }

    let announce = Command::SendVersion {
        version: format!("fleetsync {}", env!("CARGO_PKG_VERSION")),
    };
    if !ctx
        .dispatcher
        .send(&ctx.config.channels.portals, &announce)
        .await
    {
        warn!("Could not announce version on '{}'.", ctx.config.channels.portals);
    }

    Ok(())
}
