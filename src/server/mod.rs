// src/server/mod.rs

use crate::config::Config;
use crate::core::broker::Connector;
use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;

mod context;
mod initialization;
mod metrics_server;
mod spawner;

pub use context::{Collaborators, FleetContext};
pub use initialization::connector_for;

/// Builds and starts a node: connect, wire, subscribe, announce.
pub async fn start(
    config: Config,
    connector: Arc<dyn Connector>,
    collaborators: Collaborators,
) -> Result<FleetContext> {
    // 1. Connect to the broker and build the dispatcher and router.
    let mut ctx = initialization::setup(config, connector, collaborators).await?;

    // 2. Start subscriptions and background tasks.
    spawner::spawn_all(&mut ctx).await?;

    Ok(ctx)
}

/// Runs a standalone node until Ctrl-C.
pub async fn run(config: Config) -> Result<()> {
    let connector = connector_for(&config);
    let ctx = start(config, connector, Collaborators::standalone()).await?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for the shutdown signal")?;
    info!("Shutdown signal received.");

    ctx.shutdown().await;
    Ok(())
}
