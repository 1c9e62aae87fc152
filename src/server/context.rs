// src/server/context.rs

use crate::config::Config;
use crate::core::channel::ChannelDispatcher;
use crate::core::connection::StoreConnection;
use crate::core::router::{
    ActionRouter, LoggingTeleporter, MemoryPlayerDirectory, MemoryPortalRegistry,
    PlayerDirectory, PortalRegistry, Teleporter,
};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{error, info};

/// The collaborators supplied by the hosting game server.
#[derive(Clone)]
pub struct Collaborators {
    pub players: Arc<dyn PlayerDirectory>,
    pub portals: Arc<dyn PortalRegistry>,
    pub teleporter: Arc<dyn Teleporter>,
}

impl Collaborators {
    /// In-process stand-ins for a node without a game server attached.
    pub fn standalone() -> Self {
        Self {
            players: Arc::new(MemoryPlayerDirectory::new()),
            portals: Arc::new(MemoryPortalRegistry::new()),
            teleporter: Arc::new(LoggingTeleporter),
        }
    }
}

/// Everything a running node owns. Built by bootstrap and passed explicitly to
/// whatever needs it; there is no global instance.
pub struct FleetContext {
    pub config: Arc<Config>,
    pub connection: Arc<StoreConnection>,
    pub dispatcher: Arc<ChannelDispatcher>,
    pub router: Arc<ActionRouter>,
    pub shutdown_tx: broadcast::Sender<()>,
    pub background_tasks: JoinSet<anyhow::Result<()>>,
}

impl FleetContext {
    /// Stops subscriptions and background tasks, then closes the broker pool.
    pub async fn shutdown(mut self) {
        info!("Shutting down node '{}'.", self.config.server_name);
        let _ = self.shutdown_tx.send(());
        self.dispatcher.shutdown().await;

        while let Some(res) = self.background_tasks.join_next().await {
            match res {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Background task failed: {:#}", e),
                Err(e) if e.is_cancelled() => {}
                Err(e) => error!("Background task panicked: {}", e),
            }
        }

        self.connection.shutdown();
    }
}
