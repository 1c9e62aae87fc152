// tests/integration/test_helpers.rs

//! Shared setup for the integration tests: an in-process broker, connections
//! with fast retry timings, and small polling helpers.

use fleetsync::core::broker::MemoryBroker;
use fleetsync::core::channel::{ChannelDispatcher, ChannelMessage, DispatcherOptions};
use fleetsync::core::connection::{ConnectionOptions, ReconnectPolicy, StoreConnection};
use fleetsync::core::SyncError;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

pub const NAMESPACE: &str = "test:";

/// Installs a quiet test logger once per process.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("warn"))
        .with_test_writer()
        .try_init();
}

pub fn fast_options() -> ConnectionOptions {
    ConnectionOptions {
        pool_size: 4,
        operation_timeout: Some(Duration::from_secs(2)),
        reconnect: ReconnectPolicy {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
        },
    }
}

pub async fn connect(broker: &MemoryBroker) -> Arc<StoreConnection> {
    init_tracing();
    Arc::new(
        StoreConnection::connect(Arc::new(broker.clone()), fast_options())
            .await
            .expect("memory broker is reachable"),
    )
}

pub fn dispatcher_options(server_name: &str) -> DispatcherOptions {
    DispatcherOptions {
        server_name: server_name.to_string(),
        namespace: NAMESPACE.to_string(),
        echo_own_messages: false,
        debug_frames: true,
    }
}

/// A dispatcher for `server_name` on its own connection to `broker`.
pub async fn dispatcher(broker: &MemoryBroker, server_name: &str) -> Arc<ChannelDispatcher> {
    ChannelDispatcher::new(connect(broker).await, dispatcher_options(server_name))
}

/// Polls `condition` until it holds, panicking after two seconds.
pub async fn wait_for(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Collects every message a channel handler receives.
#[derive(Clone, Default)]
pub struct Inbox {
    messages: Arc<Mutex<Vec<ChannelMessage>>>,
}

impl Inbox {
    pub fn handler(&self) -> impl Fn(&ChannelMessage) -> Result<(), SyncError> + Send + Sync + 'static {
        let messages = Arc::clone(&self.messages);
        move |message: &ChannelMessage| {
            messages.lock().push(message.clone());
            Ok(())
        }
    }

    pub fn len(&self) -> usize {
        self.messages.lock().len()
    }

    pub fn frames(&self) -> Vec<Vec<u8>> {
        self.messages.lock().iter().map(|m| m.frame.to_vec()).collect()
    }

    pub fn messages(&self) -> Vec<ChannelMessage> {
        self.messages.lock().clone()
    }
}
