// tests/integration/dispatcher_test.rs

use super::test_helpers::{Inbox, NAMESPACE, connect, dispatcher, dispatcher_options, wait_for};
use bytes::Bytes;
use fleetsync::core::SyncError;
use fleetsync::core::broker::MemoryBroker;
use fleetsync::core::channel::{ChannelDispatcher, ChannelMessage};
use fleetsync::core::command::Command;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

#[tokio::test]
async fn test_broadcast_reaches_other_servers_but_not_the_sender() {
    let broker = MemoryBroker::new();
    let lobby = dispatcher(&broker, "lobby").await;
    let survival = dispatcher(&broker, "survival").await;

    let lobby_inbox = Inbox::default();
    let survival_inbox = Inbox::default();
    lobby.register("portals", lobby_inbox.handler());
    survival.register("portals", survival_inbox.handler());
    lobby.start();
    survival.start();
    wait_for("both subscriptions", || broker.pattern_subscribers() == 2).await;

    let command = Command::ListPortals {
        player: "Alice".into(),
    };
    assert!(lobby.send("portals", &command).await);

    wait_for("delivery to survival", || survival_inbox.len() == 1).await;
    let message = &survival_inbox.messages()[0];
    assert_eq!(message.channel, "portals");
    assert_eq!(message.origin, "lobby");
    assert_eq!(message.target, None);
    assert_eq!(message.sender, lobby.connection().key());
    assert_eq!(Command::decode(&message.frame).unwrap(), command);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(lobby_inbox.len(), 0);

    lobby.shutdown().await;
    survival.shutdown().await;
}

#[tokio::test]
async fn test_echo_delivers_own_messages_when_enabled() {
    let broker = MemoryBroker::new();
    let mut options = dispatcher_options("lobby");
    options.echo_own_messages = true;
    let lobby = ChannelDispatcher::new(connect(&broker).await, options);

    let inbox = Inbox::default();
    lobby.register("bans", inbox.handler());
    lobby.start();
    wait_for("subscription", || broker.pattern_subscribers() == 1).await;

    assert!(lobby.publish("bans", Bytes::from_static(b"frame")).await);
    wait_for("echo", || inbox.len() == 1).await;
    assert_eq!(inbox.frames(), vec![b"frame".to_vec()]);

    lobby.shutdown().await;
}

#[tokio::test]
async fn test_targeted_message_reaches_only_its_target() {
    let broker = MemoryBroker::new();
    let proxy = dispatcher(&broker, "proxy").await;
    let lobby = dispatcher(&broker, "lobby").await;
    let survival = dispatcher(&broker, "survival").await;

    let lobby_inbox = Inbox::default();
    let survival_inbox = Inbox::default();
    lobby.register("portals", lobby_inbox.handler());
    survival.register("portals", survival_inbox.handler());
    lobby.start();
    survival.start();
    wait_for("subscriptions", || broker.pattern_subscribers() == 2).await;

    assert!(
        proxy
            .publish_to("portals", "survival", Bytes::from_static(b"only-survival"))
            .await
    );
    assert!(proxy.publish("portals", Bytes::from_static(b"everyone")).await);

    wait_for("survival deliveries", || survival_inbox.len() == 2).await;
    wait_for("lobby delivery", || lobby_inbox.len() == 1).await;
    assert_eq!(lobby_inbox.frames(), vec![b"everyone".to_vec()]);
    assert_eq!(
        survival_inbox.messages()[0].target.as_deref(),
        Some("survival")
    );

    lobby.shutdown().await;
    survival.shutdown().await;
}

#[tokio::test]
async fn test_bad_frames_and_failing_handlers_do_not_stop_delivery() {
    let broker = MemoryBroker::new();
    let survival = dispatcher(&broker, "survival").await;
    let lobby = dispatcher(&broker, "lobby").await;

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    survival.register("portals", move |message: &ChannelMessage| {
        let call = counter.fetch_add(1, Ordering::SeqCst);
        match call {
            0 => panic!("handler blew up"),
            1 => Err(SyncError::Internal("rejected".into())),
            _ => Command::decode(&message.frame).map(|_| ()).map_err(SyncError::from),
        }
    });
    survival.start();
    wait_for("subscription", || broker.pattern_subscribers() == 1).await;

    // Not an envelope at all; dropped before reaching the handler.
    broker.publish(format!("{NAMESPACE}portals"), "garbage");

    let ping = Command::SendVersion {
        version: "1".into(),
    };
    assert!(lobby.send("portals", &ping).await);
    assert!(lobby.send("portals", &ping).await);
    // A valid envelope around an unknown tag.
    let mut unknown = Vec::new();
    unknown.extend_from_slice(&[0, 4]);
    unknown.extend_from_slice(b"Nope");
    assert!(lobby.publish("portals", Bytes::from(unknown)).await);
    assert!(lobby.send("portals", &ping).await);

    wait_for("all four handler calls", || calls.load(Ordering::SeqCst) == 4).await;
    survival.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_isolated_channel_does_not_stall_shared_channels() {
    let broker = MemoryBroker::new();
    let survival = dispatcher(&broker, "survival").await;
    let lobby = dispatcher(&broker, "lobby").await;

    let release = Arc::new(AtomicBool::new(false));
    let slow_started = Arc::new(AtomicBool::new(false));
    let (gate, started) = (Arc::clone(&release), Arc::clone(&slow_started));
    survival.register_isolated("sync", move |_: &ChannelMessage| {
        started.store(true, Ordering::SeqCst);
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while !gate.load(Ordering::SeqCst) && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        Ok(())
    });
    let fast = Inbox::default();
    survival.register("portals", fast.handler());
    survival.start();
    wait_for("shared and isolated subscriptions", || {
        broker.pattern_subscribers() == 2
    })
    .await;

    assert!(lobby.publish("sync", Bytes::from_static(b"slow")).await);
    wait_for("slow handler to start", || slow_started.load(Ordering::SeqCst)).await;

    assert!(lobby.publish("portals", Bytes::from_static(b"fast")).await);
    wait_for("fast delivery while slow handler runs", || fast.len() == 1).await;
    assert!(!release.load(Ordering::SeqCst));

    release.store(true, Ordering::SeqCst);
    survival.shutdown().await;
}

#[tokio::test]
async fn test_subscription_resumes_after_broker_outage() {
    let broker = MemoryBroker::new();
    let survival = dispatcher(&broker, "survival").await;
    let lobby = dispatcher(&broker, "lobby").await;

    let inbox = Inbox::default();
    survival.register("portals", inbox.handler());
    survival.start();
    wait_for("subscription", || broker.pattern_subscribers() == 1).await;

    broker.set_reachable(false);
    wait_for("subscription to drop", || broker.pattern_subscribers() == 0).await;
    assert!(!lobby.publish("portals", Bytes::from_static(b"lost")).await);

    broker.set_reachable(true);
    wait_for("resubscription", || broker.pattern_subscribers() == 1).await;
    assert!(lobby.publish("portals", Bytes::from_static(b"after")).await);

    wait_for("delivery after outage", || inbox.len() == 1).await;
    assert_eq!(inbox.frames(), vec![b"after".to_vec()]);
    assert!(survival.connection().is_active());

    survival.shutdown().await;
}

#[tokio::test]
async fn test_unregister_and_shutdown() {
    let broker = MemoryBroker::new();
    let survival = dispatcher(&broker, "survival").await;
    let lobby = dispatcher(&broker, "lobby").await;

    let shared = Inbox::default();
    let isolated = Inbox::default();
    survival.register("portals", shared.handler());
    survival.register_isolated("bans", isolated.handler());
    survival.start();
    wait_for("subscriptions", || broker.pattern_subscribers() == 2).await;

    assert!(survival.unregister("bans"));
    assert!(!survival.unregister("bans"));
    wait_for("isolated subscription to end", || {
        broker.pattern_subscribers() == 1
    })
    .await;

    assert!(survival.unregister("portals"));
    assert!(lobby.publish("portals", Bytes::from_static(b"x")).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(shared.len(), 0);

    survival.shutdown().await;
    assert_eq!(broker.pattern_subscribers(), 0);
}
