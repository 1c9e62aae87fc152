// src/server/initialization.rs

//! Builds the broker connection, dispatcher and router for a node.

use super::context::{Collaborators, FleetContext};
use crate::config::{BrokerBackend, Config};
use crate::core::broker::{Connector, MemoryBroker, TcpConnector};
use crate::core::channel::ChannelDispatcher;
use crate::core::connection::{LoggingNotifier, StoreConnection};
use crate::core::router::{ActionRouter, PortalsHandler, RouterContext};
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::info;

/// The connector selected by `[broker] backend`.
pub fn connector_for(config: &Config) -> Arc<dyn Connector> {
    match config.broker.backend {
        BrokerBackend::Tcp => Arc::new(
            TcpConnector::new(config.broker.host.clone(), config.broker.port)
                .with_password(config.broker.password.clone())
                .with_connect_timeout(config.broker.connect_timeout),
        ),
        BrokerBackend::Memory => Arc::new(MemoryBroker::new()),
    }
}

/// Connects to the broker (failing fast if it is unreachable) and wires the
/// dispatcher and router together. Nothing is started yet.
pub async fn setup(
    config: Config,
    connector: Arc<dyn Connector>,
    collaborators: Collaborators,
) -> Result<FleetContext> {
    log_startup_info(&config, connector.as_ref());

    let connection = StoreConnection::connect(connector, config.connection_options())
        .await
        .context("Initial broker health check failed")?;
    let connection = Arc::new(connection);
    connection.set_notifier(Arc::new(LoggingNotifier::new(config.server_name.clone())));

    let dispatcher = ChannelDispatcher::new(Arc::clone(&connection), config.dispatcher_options());

    let router = Arc::new(ActionRouter::new(RouterContext {
        server_name: config.server_name.clone(),
        players: collaborators.players,
        portals: collaborators.portals,
        teleporter: collaborators.teleporter,
        messages: config.messages.clone(),
    }));

    let portals_channel = config.channels.portals.clone();
    dispatcher.register(
        portals_channel.clone(),
        PortalsHandler::new(Arc::clone(&router), &dispatcher, portals_channel),
    );

    let (shutdown_tx, _) = broadcast::channel(1);
    Ok(FleetContext {
        config: Arc::new(config),
        connection,
        dispatcher,
        router,
        shutdown_tx,
        background_tasks: JoinSet::new(),
    })
}

fn log_startup_info(config: &Config, connector: &dyn Connector) {
    info!(
        "Starting fleetsync node '{}' (version {}).",
        config.server_name,
        env!("CARGO_PKG_VERSION")
    );
    info!(
        "Broker: {} (pool size {}), channel namespace '{}'.",
        connector.describe(),
        config.broker.pool_size,
        config.channels.namespace
    );
    if config.debug_frames {
        info!("Frame debugging is enabled.");
    }
}
