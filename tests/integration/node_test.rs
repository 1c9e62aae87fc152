// tests/integration/node_test.rs

//! Two complete nodes wired through one in-process broker.

use super::fixtures::portal;
use super::test_helpers::{init_tracing, wait_for};
use fleetsync::config::Config;
use fleetsync::core::broker::MemoryBroker;
use fleetsync::core::command::Command;
use fleetsync::core::router::{
    LoggingTeleporter, MemoryPlayerDirectory, MemoryPortalRegistry, PortalRegistry,
};
use fleetsync::server::{self, Collaborators, FleetContext};
use std::sync::Arc;
use std::time::Duration;

struct Node {
    ctx: FleetContext,
    players: Arc<MemoryPlayerDirectory>,
    portals: Arc<MemoryPortalRegistry>,
}

async fn start_node(broker: &MemoryBroker, name: &str) -> Node {
    init_tracing();
    let mut config = Config::with_server_name(name);
    config.broker.operation_timeout = Some(Duration::from_secs(2));
    config.broker.reconnect.initial_delay = Duration::from_millis(10);
    config.broker.reconnect.max_delay = Duration::from_millis(50);
    config.validate().unwrap();

    let players = Arc::new(MemoryPlayerDirectory::new());
    let portals = Arc::new(MemoryPortalRegistry::new());
    let collaborators = Collaborators {
        players: players.clone(),
        portals: portals.clone(),
        teleporter: Arc::new(LoggingTeleporter),
    };
    let ctx = server::start(config, Arc::new(broker.clone()), collaborators)
        .await
        .unwrap();
    Node {
        ctx,
        players,
        portals,
    }
}

#[tokio::test]
async fn test_nodes_exchange_versions_and_portals() {
    let broker = MemoryBroker::new();
    let lobby = start_node(&broker, "lobby").await;
    wait_for("lobby subscription", || broker.pattern_subscribers() == 1).await;

    let proxy = start_node(&broker, "proxy").await;
    wait_for("proxy subscription", || broker.pattern_subscribers() == 2).await;
    wait_for("proxy version at lobby", || {
        lobby.ctx.router.versions().contains_key("proxy")
    })
    .await;
    assert_eq!(
        lobby.ctx.router.versions()["proxy"],
        format!("fleetsync {}", env!("CARGO_PKG_VERSION"))
    );

    proxy.players.add("Alice");
    let set = Command::SetPortal {
        player: "Alice".into(),
        selection: Some(portal("north")),
    };
    assert!(lobby.ctx.dispatcher.send_to("portals", "proxy", &set).await);

    wait_for("portal at proxy", || proxy.portals.get("north").is_some()).await;
    assert_eq!(proxy.portals.get("north").unwrap().server, "lobby");
    assert_eq!(
        proxy.players.messages_for("Alice"),
        vec!["Portal north created.".to_string()]
    );

    wait_for("portal echoed back to lobby", || {
        lobby.portals.get("north").is_some()
    })
    .await;
    let record = lobby.portals.get("north").unwrap();
    assert_eq!(record.server, "lobby");
    assert_eq!(record.spec, portal("north"));

    proxy.ctx.shutdown().await;
    lobby.ctx.shutdown().await;
    assert_eq!(broker.pattern_subscribers(), 0);
}

#[tokio::test]
async fn test_node_refuses_to_start_without_broker() {
    init_tracing();
    let broker = MemoryBroker::new();
    broker.set_reachable(false);

    let result = server::start(
        Config::with_server_name("lobby"),
        Arc::new(broker),
        Collaborators::standalone(),
    )
    .await;
    assert!(result.is_err());
}
