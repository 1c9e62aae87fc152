// src/core/channel/mod.rs

//! Multiplexes logical channels over broker pattern subscriptions.
//!
//! All channels registered with [`ChannelDispatcher::register`] share one physical
//! subscription on `"{namespace}*"` and therefore one delivery task. A channel
//! registered with [`ChannelDispatcher::register_isolated`] gets a subscription and
//! task of its own, so a slow handler there cannot hold up anyone else.

pub mod envelope;

pub use envelope::Envelope;

use crate::core::SyncError;
use crate::core::command::Command;
use crate::core::connection::{PubSubMessage, StoreConnection};
use crate::core::metrics;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// A frame delivered on a logical channel, with its envelope metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelMessage {
    /// Logical channel name, without the namespace prefix.
    pub channel: String,
    pub origin: String,
    pub sender: u64,
    pub target: Option<String>,
    pub frame: Bytes,
}

/// Consumes frames of one logical channel.
///
/// Called synchronously on the subscription's task. Errors and panics are logged
/// and counted by the dispatcher; they never end the subscription.
///
/// A handler occupies a tokio worker thread for as long as it runs. It must not
/// block: hand slow work to `tokio::task::spawn_blocking` or a queue of its own.
/// On a current-thread runtime a blocking handler stalls every subscription,
/// isolated or not.
pub trait ChannelHandler: Send + Sync + 'static {
    fn handle(&self, message: &ChannelMessage) -> Result<(), SyncError>;
}

impl<F> ChannelHandler for F
where
    F: Fn(&ChannelMessage) -> Result<(), SyncError> + Send + Sync + 'static,
{
    fn handle(&self, message: &ChannelMessage) -> Result<(), SyncError> {
        self(message)
    }
}

#[derive(Debug, Clone)]
pub struct DispatcherOptions {
    /// This server's name, stamped as the origin of every published envelope.
    pub server_name: String,
    /// Prefix of every physical channel, e.g. `fleetsync:`.
    pub namespace: String,
    /// Deliver messages published by this same connection.
    pub echo_own_messages: bool,
    /// Log a hex dump of every frame sent and received.
    pub debug_frames: bool,
}

/// Which handler table a subscription task serves.
#[derive(Debug, Clone)]
enum Scope {
    Shared,
    Isolated(String),
}

struct Subscription {
    /// `None` for the shared subscription.
    channel: Option<String>,
    task: JoinHandle<()>,
}

pub struct ChannelDispatcher {
    connection: Arc<StoreConnection>,
    options: DispatcherOptions,
    shared: DashMap<String, Arc<dyn ChannelHandler>>,
    isolated: DashMap<String, Arc<dyn ChannelHandler>>,
    subscriptions: Mutex<Vec<Subscription>>,
    shutdown_tx: broadcast::Sender<()>,
    started: AtomicBool,
}

impl ChannelDispatcher {
    pub fn new(connection: Arc<StoreConnection>, options: DispatcherOptions) -> Arc<Self> {
        let (shutdown_tx, _) = broadcast::channel(1);
        Arc::new(Self {
            connection,
            options,
            shared: DashMap::new(),
            isolated: DashMap::new(),
            subscriptions: Mutex::new(Vec::new()),
            shutdown_tx,
            started: AtomicBool::new(false),
        })
    }

    pub fn connection(&self) -> &Arc<StoreConnection> {
        &self.connection
    }

    pub fn server_name(&self) -> &str {
        &self.options.server_name
    }

    /// The physical broker channel behind a logical channel name.
    pub fn physical_channel(&self, channel: &str) -> String {
        format!("{}{}", self.options.namespace, channel)
    }

    /// Registers a handler on the shared subscription, replacing any previous
    /// handler for `channel`. Takes effect immediately, also after `start`.
    pub fn register(&self, channel: impl Into<String>, handler: impl ChannelHandler) {
        let channel = channel.into();
        debug!("Registered handler for channel '{}'.", channel);
        self.shared.insert(channel, Arc::new(handler));
    }

    /// Registers a handler with its own physical subscription and task.
    ///
    /// Isolation is per task: a slow handler here delays only this channel as long
    /// as the runtime has other worker threads to run the rest.
    pub fn register_isolated(
        self: &Arc<Self>,
        channel: impl Into<String>,
        handler: impl ChannelHandler,
    ) {
        let channel = channel.into();
        self.shared.remove(&channel);
        let replaced = self
            .isolated
            .insert(channel.clone(), Arc::new(handler))
            .is_some();
        debug!("Registered isolated handler for channel '{}'.", channel);
        if self.started.load(Ordering::Acquire) && !replaced {
            self.spawn_subscription(Scope::Isolated(channel));
        }
    }

    /// Removes the handler for `channel`, stopping its task if it was isolated.
    pub fn unregister(&self, channel: &str) -> bool {
        if self.shared.remove(channel).is_some() {
            return true;
        }
        if self.isolated.remove(channel).is_none() {
            return false;
        }
        let mut subscriptions = self.subscriptions.lock();
        subscriptions.retain(|sub| {
            if sub.channel.as_deref() == Some(channel) {
                sub.task.abort();
                false
            } else {
                true
            }
        });
        true
    }

    /// Spawns the shared subscription and one per isolated channel. Idempotent.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        self.spawn_subscription(Scope::Shared);
        let isolated: Vec<String> = self.isolated.iter().map(|e| e.key().clone()).collect();
        for channel in isolated {
            self.spawn_subscription(Scope::Isolated(channel));
        }
        info!(
            "Channel dispatcher for '{}' started on namespace '{}'.",
            self.options.server_name, self.options.namespace
        );
    }

    fn spawn_subscription(self: &Arc<Self>, scope: Scope) {
        let pattern = match &scope {
            Scope::Shared => format!("{}*", escape_glob(&self.options.namespace)),
            Scope::Isolated(channel) => escape_glob(&self.physical_channel(channel)),
        };
        let channel = match &scope {
            Scope::Shared => None,
            Scope::Isolated(channel) => Some(channel.clone()),
        };

        let this = Arc::clone(self);
        let shutdown_rx = self.shutdown_tx.subscribe();
        let task = tokio::spawn(async move {
            let connection = Arc::clone(&this.connection);
            connection
                .subscribe(&pattern, |message| this.deliver(&scope, message), shutdown_rx)
                .await;
            debug!("Subscription task for '{}' finished.", pattern);
        });

        self.subscriptions.lock().push(Subscription { channel, task });
    }

    /// Routes one broker message to its handler. Never panics and never fails:
    /// anything wrong with the message is logged, counted and dropped.
    fn deliver(&self, scope: &Scope, message: PubSubMessage) {
        let Some(channel) = message
            .channel
            .strip_prefix(self.options.namespace.as_bytes())
            .and_then(|c| std::str::from_utf8(c).ok())
        else {
            drop_message("foreign_channel");
            return;
        };

        let handler = match scope {
            Scope::Shared => {
                if self.isolated.contains_key(channel) {
                    return;
                }
                self.shared.get(channel).map(|h| Arc::clone(h.value()))
            }
            Scope::Isolated(name) => self.isolated.get(name).map(|h| Arc::clone(h.value())),
        };
        let Some(handler) = handler else {
            trace!("No handler for channel '{}', dropping message.", channel);
            drop_message("no_handler");
            return;
        };

        let envelope = match Envelope::decode(&message.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Dropping malformed envelope on '{}': {}", channel, e);
                drop_message("malformed");
                return;
            }
        };

        if self.options.debug_frames {
            debug!(
                "RECV {} from {}: {}",
                channel,
                envelope.origin,
                hex::encode(&envelope.frame)
            );
        }

        if envelope.sender == self.connection.key() && !self.options.echo_own_messages {
            drop_message("own");
            return;
        }
        if !envelope.is_addressed_to(&self.options.server_name) {
            drop_message("not_addressed");
            return;
        }

        let delivered = ChannelMessage {
            channel: channel.to_string(),
            origin: envelope.origin,
            sender: envelope.sender,
            target: envelope.target,
            frame: envelope.frame,
        };

        match catch_unwind(AssertUnwindSafe(|| handler.handle(&delivered))) {
            Ok(Ok(())) => {
                metrics::MESSAGES_DELIVERED_TOTAL
                    .with_label_values(&[channel])
                    .inc();
            }
            Ok(Err(e)) => {
                warn!(
                    "Handler for '{}' failed on a message from {}: {}",
                    channel, delivered.origin, e
                );
                drop_message("handler_error");
            }
            Err(_) => {
                error!(
                    "Handler for '{}' panicked on a message from {}.",
                    channel, delivered.origin
                );
                metrics::HANDLER_PANICS_TOTAL.inc();
            }
        }
    }

    /// Publishes a raw frame to every server on `channel`.
    pub async fn publish(&self, channel: &str, frame: Bytes) -> bool {
        self.publish_enveloped(channel, None, frame).await
    }

    /// Publishes a raw frame addressed to a single server.
    pub async fn publish_to(&self, channel: &str, target: &str, frame: Bytes) -> bool {
        self.publish_enveloped(channel, Some(target.to_string()), frame)
            .await
    }

    /// Encodes and broadcasts a command.
    pub async fn send(&self, channel: &str, command: &Command) -> bool {
        self.send_command(channel, None, command).await
    }

    /// Encodes a command and addresses it to a single server.
    pub async fn send_to(&self, channel: &str, target: &str, command: &Command) -> bool {
        self.send_command(channel, Some(target.to_string()), command)
            .await
    }

    async fn send_command(&self, channel: &str, target: Option<String>, command: &Command) -> bool {
        match command.encode() {
            Ok(frame) => self.publish_enveloped(channel, target, frame).await,
            Err(e) => {
                warn!("Could not encode {} for '{}': {}", command.tag(), channel, e);
                false
            }
        }
    }

    async fn publish_enveloped(&self, channel: &str, target: Option<String>, frame: Bytes) -> bool {
        if self.options.debug_frames {
            debug!(
                "SEND {} to {}: {}",
                channel,
                target.as_deref().unwrap_or("*"),
                hex::encode(&frame)
            );
        }
        let envelope = Envelope {
            sender: self.connection.key(),
            origin: self.options.server_name.clone(),
            target,
            frame,
        };
        match envelope.encode() {
            Ok(payload) => {
                self.connection
                    .publish(self.physical_channel(channel), payload)
                    .await
            }
            Err(e) => {
                warn!("Could not build envelope for '{}': {}", channel, e);
                false
            }
        }
    }

    /// Signals every subscription task to stop and waits for them to finish.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        let subscriptions: Vec<Subscription> = std::mem::take(&mut *self.subscriptions.lock());
        for sub in subscriptions {
            match sub.task.await {
                Err(e) if !e.is_cancelled() => {
                    error!("Subscription task ended abnormally: {}", e)
                }
                _ => {}
            }
        }
        self.started.store(false, Ordering::Release);
        info!("Channel dispatcher for '{}' stopped.", self.options.server_name);
    }
}

fn drop_message(reason: &str) {
    metrics::MESSAGES_DROPPED_TOTAL
        .with_label_values(&[reason])
        .inc();
}

/// Escapes glob metacharacters so `name` matches only itself.
fn escape_glob(name: &str) -> String {
    let mut escaped = String::with_capacity(name.len());
    for c in name.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
