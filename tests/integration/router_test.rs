// tests/integration/router_test.rs

use super::fixtures::portal;
use super::test_helpers::{Inbox, dispatcher, wait_for};
use fleetsync::core::broker::MemoryBroker;
use fleetsync::core::command::Command;
use fleetsync::core::router::{
    ActionRouter, MemoryPlayerDirectory, MemoryPortalRegistry, Messages, Outbound, PlayerRef,
    PortalRecord, PortalRegistry, PortalsHandler, RouterContext, Target, Teleporter,
};
use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Default)]
struct RecordingTeleporter {
    requests: Mutex<Vec<(String, String, String, bool)>>,
    fail_with: Mutex<Option<String>>,
}

impl Teleporter for RecordingTeleporter {
    fn teleport(
        &self,
        player: &PlayerRef,
        server: &str,
        destination: &str,
        has_permission: bool,
    ) -> Result<(), String> {
        self.requests.lock().push((
            player.name.clone(),
            server.to_string(),
            destination.to_string(),
            has_permission,
        ));
        match self.fail_with.lock().clone() {
            Some(reason) => Err(reason),
            None => Ok(()),
        }
    }
}

struct Harness {
    router: ActionRouter,
    players: Arc<MemoryPlayerDirectory>,
    portals: Arc<MemoryPortalRegistry>,
    teleporter: Arc<RecordingTeleporter>,
}

fn harness() -> Harness {
    let players = Arc::new(MemoryPlayerDirectory::new());
    let portals = Arc::new(MemoryPortalRegistry::new());
    let teleporter = Arc::new(RecordingTeleporter::default());
    let router = ActionRouter::new(RouterContext {
        server_name: "proxy".into(),
        players: players.clone(),
        portals: portals.clone(),
        teleporter: teleporter.clone(),
        messages: Messages::default(),
    });
    players.add("Alice");
    Harness {
        router,
        players,
        portals,
        teleporter,
    }
}

#[test]
fn test_set_portal_without_selection_only_notifies() {
    let h = harness();
    let out = h.router.route(
        "lobby",
        Command::SetPortal {
            player: "Alice".into(),
            selection: None,
        },
    );
    assert!(out.is_empty());
    assert!(h.portals.list().is_empty());
    assert_eq!(
        h.players.messages_for("Alice"),
        vec!["You need to make a selection first.".to_string()]
    );
}

#[test]
fn test_set_portal_creates_then_updates() {
    let h = harness();
    let set = Command::SetPortal {
        player: "Alice".into(),
        selection: Some(portal("north")),
    };

    let out = h.router.route("lobby", set.clone());
    assert_eq!(
        out,
        vec![Outbound {
            target: Target::Origin,
            command: Command::SendPortal(portal("north")),
        }]
    );
    assert_eq!(
        h.portals.get("north"),
        Some(PortalRecord {
            server: "lobby".into(),
            spec: portal("north"),
        })
    );

    h.router.route("lobby", set);
    assert_eq!(
        h.players.messages_for("alice"),
        vec!["Portal north created.".to_string(), "Portal north updated.".to_string()]
    );
}

#[test]
fn test_delete_portal_broadcasts_removal() {
    let h = harness();
    h.portals.upsert(PortalRecord {
        server: "lobby".into(),
        spec: portal("north"),
    });

    let out = h.router.route(
        "lobby",
        Command::DeletePortal {
            player: "Alice".into(),
            portal: "north".into(),
        },
    );
    assert_eq!(
        out,
        vec![Outbound {
            target: Target::Broadcast,
            command: Command::RemovePortal {
                portal: "north".into()
            },
        }]
    );
    assert!(h.portals.get("north").is_none());

    let out = h.router.route(
        "lobby",
        Command::DeletePortal {
            player: "Alice".into(),
            portal: "north".into(),
        },
    );
    assert!(out.is_empty());
    assert_eq!(
        h.players.messages_for("Alice").last().map(String::as_str),
        Some("Portal north does not exist.")
    );
}

#[test]
fn test_request_portals_answers_with_origin_portals_only() {
    let h = harness();
    for (server, name) in [("lobby", "a"), ("survival", "b"), ("lobby", "c")] {
        h.portals.upsert(PortalRecord {
            server: server.into(),
            spec: portal(name),
        });
    }

    let out = h.router.route("lobby", Command::RequestPortals);
    assert_eq!(
        out,
        vec![
            Outbound {
                target: Target::Origin,
                command: Command::SendPortal(portal("a")),
            },
            Outbound {
                target: Target::Origin,
                command: Command::SendPortal(portal("c")),
            },
        ]
    );
}

#[test]
fn test_list_portals_groups_by_server() {
    let h = harness();
    h.router.route(
        "lobby",
        Command::ListPortals {
            player: "Alice".into(),
        },
    );
    assert_eq!(
        h.players.messages_for("Alice"),
        vec!["There are no portals.".to_string()]
    );

    for (server, name) in [("survival", "b"), ("lobby", "a"), ("lobby", "c")] {
        h.portals.upsert(PortalRecord {
            server: server.into(),
            spec: portal(name),
        });
    }
    h.router.route(
        "lobby",
        Command::ListPortals {
            player: "Alice".into(),
        },
    );
    assert_eq!(
        h.players.messages_for("Alice")[1..],
        ["lobby: a, c".to_string(), "survival: b".to_string()]
    );
}

#[test]
fn test_teleport_resolves_player_and_reports_failure() {
    let h = harness();
    let teleport = |player: &str| Command::TeleportPlayer {
        player: player.into(),
        destination_server: "survival".into(),
        destination: "spawn".into(),
        has_permission: true,
    };

    assert!(h.router.route("lobby", teleport("Alice")).is_empty());
    assert_eq!(
        h.teleporter.requests.lock().clone(),
        vec![("Alice".into(), "survival".into(), "spawn".into(), true)]
    );

    h.router.route("lobby", teleport("Nobody"));
    assert_eq!(h.teleporter.requests.lock().len(), 1);

    *h.teleporter.fail_with.lock() = Some("server is full".into());
    h.router.route("lobby", teleport("Alice"));
    assert_eq!(
        h.players.messages_for("Alice"),
        vec!["Could not teleport you: server is full".to_string()]
    );
}

#[test]
fn test_versions_and_incoming_portal_updates() {
    let h = harness();
    h.router.route(
        "lobby",
        Command::SendVersion {
            version: "fleetsync 0.3.0".into(),
        },
    );
    assert_eq!(
        h.router.versions().get("lobby").map(String::as_str),
        Some("fleetsync 0.3.0")
    );

    h.router.route("lobby", Command::SendPortal(portal("north")));
    assert_eq!(h.portals.get("north").unwrap().server, "proxy");

    h.router.route(
        "lobby",
        Command::RemovePortal {
            portal: "north".into(),
        },
    );
    assert!(h.portals.list().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_replies_are_published_in_routing_order() {
    const ROUNDS: usize = 25;

    let broker = MemoryBroker::new();
    let proxy = dispatcher(&broker, "proxy").await;
    let lobby = dispatcher(&broker, "lobby").await;

    let h = harness();
    h.portals.upsert(PortalRecord {
        server: "lobby".into(),
        spec: portal("north"),
    });
    let router = Arc::new(h.router);
    proxy.register("portals", PortalsHandler::new(router, &proxy, "portals"));
    let inbox = Inbox::default();
    lobby.register("portals", inbox.handler());
    proxy.start();
    lobby.start();
    wait_for("subscriptions", || broker.pattern_subscribers() == 2).await;

    let delete = Command::DeletePortal {
        player: "Alice".into(),
        portal: "north".into(),
    };
    let set = Command::SetPortal {
        player: "Alice".into(),
        selection: Some(portal("north")),
    };
    for _ in 0..ROUNDS {
        assert!(lobby.send_to("portals", "proxy", &delete).await);
        assert!(lobby.send_to("portals", "proxy", &set).await);
    }

    wait_for("every reply", || inbox.len() == 2 * ROUNDS).await;
    let received: Vec<Command> = inbox
        .messages()
        .iter()
        .map(|m| Command::decode(&m.frame).unwrap())
        .collect();
    let expected: Vec<Command> = (0..ROUNDS)
        .flat_map(|_| {
            [
                Command::RemovePortal {
                    portal: "north".into(),
                },
                Command::SendPortal(portal("north")),
            ]
        })
        .collect();
    assert_eq!(received, expected);
    assert_eq!(h.portals.get("north").unwrap().server, "lobby");

    proxy.shutdown().await;
    lobby.shutdown().await;
}
