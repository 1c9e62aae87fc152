// src/core/connection/mod.rs

//! The resilient connection to the shared broker.
//!
//! A `StoreConnection` owns a [`SessionPool`] and tracks whether the broker is
//! reachable. Every operation feeds its outcome into a two-state machine
//! (active/inactive); connectivity errors flip it to inactive, any success flips
//! it back, and an installed [`ConnectionNotifier`] hears about each edge once.
//!
//! Feature code gets best-effort results (`bool`, `Option`, empty `Vec`) and can
//! inspect [`StoreConnection::last_error`] for details. Errors never escape as
//! panics or hard failures, except from [`StoreConnection::connect`] whose probe
//! must succeed.

pub mod notifier;
pub mod script;

pub use notifier::{ConnectionNotifier, LoggingNotifier};
pub use script::{BULK_DELETE_SCRIPT, DELETE_BATCH_SIZE, ScriptHandle};

use crate::core::SyncError;
use crate::core::broker::{BrokerSession, Connector, SessionPool};
use crate::core::metrics;
use crate::core::protocol::RespFrame;
use bytes::Bytes;
use lazy_static::lazy_static;
use parking_lot::{Mutex, RwLock};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, trace, warn};

lazy_static! {
    /// Random per-process base for connection keys, so keys from different
    /// processes do not collide.
    static ref KEY_BASE: u64 = rand::random::<u64>();
}
static KEY_COUNTER: AtomicU64 = AtomicU64::new(0);

fn next_connection_key() -> u64 {
    KEY_BASE.wrapping_add(KEY_COUNTER.fetch_add(1, Ordering::Relaxed))
}

/// Delay between subscription attempts: starts at `initial_delay` and doubles
/// after each failure, capped at `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl ReconnectPolicy {
    pub fn next_delay(&self, current: Duration) -> Duration {
        (current * 2).min(self.max_delay)
    }
}

/// Tunables of a [`StoreConnection`].
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub pool_size: usize,
    /// Upper bound for a single request/response exchange. `None` waits forever.
    pub operation_timeout: Option<Duration>,
    pub reconnect: ReconnectPolicy,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            pool_size: 8,
            operation_timeout: None,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// A message delivered to a pattern subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct PubSubMessage {
    pub pattern: Bytes,
    pub channel: Bytes,
    pub payload: Bytes,
}

impl PubSubMessage {
    /// Interprets a push frame. Returns `Ok(None)` for pushes that are not
    /// messages (subscription confirmations and the like).
    fn from_push(frame: RespFrame) -> Result<Option<Self>, SyncError> {
        let RespFrame::Array(parts) = frame.into_result()? else {
            return Err(SyncError::UnexpectedReply(
                "pub/sub push was not an array".into(),
            ));
        };
        match parts.as_slice() {
            [kind, pattern, channel, payload] if kind.as_bytes() == Some(b"pmessage".as_slice()) => {
                match (pattern.as_bytes(), channel.as_bytes(), payload.as_bytes()) {
                    (Some(p), Some(c), Some(m)) => Ok(Some(PubSubMessage {
                        pattern: Bytes::copy_from_slice(p),
                        channel: Bytes::copy_from_slice(c),
                        payload: Bytes::copy_from_slice(m),
                    })),
                    _ => Err(SyncError::UnexpectedReply(
                        "pmessage with non-string parts".into(),
                    )),
                }
            }
            _ => Ok(None),
        }
    }
}

fn request(parts: &[&[u8]]) -> RespFrame {
    RespFrame::command(parts.iter().map(|part| Bytes::copy_from_slice(part)))
}

/// The process-wide handle to the broker.
pub struct StoreConnection {
    key: u64,
    pool: SessionPool,
    options: ConnectionOptions,
    active: AtomicBool,
    notifier: RwLock<Option<Arc<dyn ConnectionNotifier>>>,
    last_error: Mutex<Option<SyncError>>,
    delete_script: ScriptHandle,
}

impl std::fmt::Debug for StoreConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreConnection")
            .field("key", &self.key)
            .field("broker", &self.pool.connector().describe())
            .field("active", &self.is_active())
            .finish()
    }
}

impl StoreConnection {
    /// Creates the connection and probes the broker with `PING`.
    ///
    /// Fails with the probe's error if the broker cannot be reached; no handle
    /// exists in that case.
    pub async fn connect(
        connector: Arc<dyn Connector>,
        options: ConnectionOptions,
    ) -> Result<Self, SyncError> {
        let broker = connector.describe();
        let connection = Self {
            key: next_connection_key(),
            pool: SessionPool::new(connector, options.pool_size),
            options,
            active: AtomicBool::new(false),
            notifier: RwLock::new(None),
            last_error: Mutex::new(None),
            delete_script: ScriptHandle::new(BULK_DELETE_SCRIPT.as_str()),
        };

        let reply = connection.round_trip(request(&[b"PING"])).await?;
        if reply.as_bytes() != Some(b"PONG".as_slice()) {
            return Err(SyncError::UnexpectedReply(format!(
                "PING answered with {reply:?}"
            )));
        }
        connection.active.store(true, Ordering::Release);
        metrics::BROKER_CONNECTED.set(1.0);

        info!(
            "Connected to broker {} (connection key {:#018x}).",
            broker, connection.key
        );
        Ok(connection)
    }

    /// Installs the transition notifier, replacing any previous one.
    pub fn set_notifier(&self, notifier: Arc<dyn ConnectionNotifier>) {
        *self.notifier.write() = Some(notifier);
    }

    /// The identity token of this connection, unique within the process.
    pub fn key(&self) -> u64 {
        self.key
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// The most recent failure of any operation, if there was one.
    pub fn last_error(&self) -> Option<SyncError> {
        self.last_error.lock().clone()
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    /// Closes the pool. Idle sessions are dropped and later operations fail fast.
    pub fn shutdown(&self) {
        self.pool.close();
        info!("Broker connection {:#018x} shut down.", self.key);
    }

    /// Runs one request and returns the reply, feeding the outcome into the
    /// connectivity state machine. Error replies are returned as `Err`.
    pub async fn execute(&self, req: RespFrame) -> Result<RespFrame, SyncError> {
        let timer = metrics::OPERATION_LATENCY_SECONDS.start_timer();
        let result = self.round_trip(req).await;
        timer.observe_duration();
        match &result {
            Ok(_) => self.mark_active(),
            Err(e) => self.record_failure(e),
        }
        result
    }

    async fn round_trip(&self, req: RespFrame) -> Result<RespFrame, SyncError> {
        let mut session = self.pool.get().await?;
        match self.with_timeout(session.call(req)).await {
            Ok(reply) => reply.into_result(),
            Err(e) => {
                if e.is_connectivity() {
                    session.discard();
                }
                Err(e)
            }
        }
    }

    async fn with_timeout<T>(
        &self,
        fut: impl Future<Output = Result<T, SyncError>>,
    ) -> Result<T, SyncError> {
        match self.options.operation_timeout {
            Some(limit) => tokio::time::timeout(limit, fut)
                .await
                .map_err(|_| SyncError::Timeout(limit))?,
            None => fut.await,
        }
    }

    fn record_failure(&self, err: &SyncError) {
        metrics::BROKER_ERRORS_TOTAL
            .with_label_values(&[err.kind()])
            .inc();
        *self.last_error.lock() = Some(err.clone());
        if err.is_connectivity() {
            self.mark_inactive(err);
        } else {
            debug!("Broker operation failed: {}", err);
        }
    }

    /// An operation reached the broker but its reply was not what the caller expects.
    fn reject_reply(&self, op: &str, reply: &RespFrame) {
        let err = SyncError::UnexpectedReply(format!("{op} returned {reply:?}"));
        warn!("{}", err);
        self.record_failure(&err);
    }

    fn current_notifier(&self) -> Option<Arc<dyn ConnectionNotifier>> {
        self.notifier.read().clone()
    }

    fn mark_active(&self) {
        if self
            .active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            metrics::BROKER_CONNECTED.set(1.0);
            metrics::CONNECTION_TRANSITIONS_TOTAL
                .with_label_values(&["restored"])
                .inc();
            debug!("Broker connection {:#018x} is active again.", self.key);
            if let Some(notifier) = self.current_notifier() {
                notifier.on_connection_restored();
            }
        }
    }

    fn mark_inactive(&self, cause: &SyncError) {
        if self
            .active
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            metrics::BROKER_CONNECTED.set(0.0);
            metrics::CONNECTION_TRANSITIONS_TOTAL
                .with_label_values(&["lost"])
                .inc();
            debug!(
                "Broker connection {:#018x} is inactive: {}",
                self.key, cause
            );
            if let Some(notifier) = self.current_notifier() {
                notifier.on_connection_lost(cause);
            }
        }
    }

    /// Reads a key. Any failure is logged and reported as absence.
    pub async fn get(&self, key: impl AsRef<[u8]>) -> Option<Bytes> {
        match self.execute(request(&[b"GET", key.as_ref()])).await {
            Ok(RespFrame::BulkString(value)) => Some(value),
            Ok(RespFrame::Null) => None,
            Ok(other) => {
                self.reject_reply("GET", &other);
                None
            }
            Err(e) => {
                debug!("GET failed, treating as absent: {}", e);
                None
            }
        }
    }

    pub async fn set(&self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> bool {
        match self
            .execute(request(&[b"SET", key.as_ref(), value.as_ref()]))
            .await
        {
            Ok(RespFrame::SimpleString(s)) if s == "OK" => true,
            Ok(other) => {
                self.reject_reply("SET", &other);
                false
            }
            Err(_) => false,
        }
    }

    /// Deletes a key. Succeeds whether or not the key existed.
    pub async fn delete(&self, key: impl AsRef<[u8]>) -> bool {
        match self.execute(request(&[b"DEL", key.as_ref()])).await {
            Ok(RespFrame::Integer(_)) => true,
            Ok(other) => {
                self.reject_reply("DEL", &other);
                false
            }
            Err(_) => false,
        }
    }

    /// Lists keys matching a glob pattern. Empty on failure.
    pub async fn keys(&self, pattern: impl AsRef<[u8]>) -> Vec<Bytes> {
        match self.execute(request(&[b"KEYS", pattern.as_ref()])).await {
            Ok(RespFrame::Array(items)) => items
                .into_iter()
                .filter_map(|item| match item {
                    RespFrame::BulkString(key) => Some(key),
                    _ => None,
                })
                .collect(),
            Ok(other) => {
                self.reject_reply("KEYS", &other);
                Vec::new()
            }
            Err(_) => Vec::new(),
        }
    }

    /// Publishes without waiting for any subscriber.
    pub async fn publish(&self, channel: impl AsRef<[u8]>, payload: impl AsRef<[u8]>) -> bool {
        match self
            .execute(request(&[b"PUBLISH", channel.as_ref(), payload.as_ref()]))
            .await
        {
            Ok(RespFrame::Integer(receivers)) => {
                trace!("Published to {} receiver(s).", receivers);
                metrics::MESSAGES_PUBLISHED_TOTAL.inc();
                true
            }
            Ok(other) => {
                self.reject_reply("PUBLISH", &other);
                false
            }
            Err(_) => false,
        }
    }

    /// Deletes every key matching `pattern` through the bulk-delete script.
    pub async fn delete_pattern(&self, pattern: &str) -> bool {
        match self.run_bulk_delete(pattern).await {
            Ok(matched) => {
                debug!("Deleted {} key(s) matching '{}'.", matched, pattern);
                true
            }
            Err(e) => {
                debug!("Pattern delete of '{}' failed: {}", pattern, e);
                false
            }
        }
    }

    async fn run_bulk_delete(&self, pattern: &str) -> Result<i64, SyncError> {
        let sha1 = self.load_delete_script().await?;
        let reply = match self.eval_bulk_delete(&sha1, pattern).await {
            Err(SyncError::NoScript) => {
                warn!("Broker no longer knows the bulk-delete script, reloading it.");
                self.delete_script.invalidate();
                let sha1 = self.load_delete_script().await?;
                self.eval_bulk_delete(&sha1, pattern).await?
            }
            other => other?,
        };
        match reply {
            RespFrame::Integer(matched) => Ok(matched),
            other => {
                self.reject_reply("EVALSHA", &other);
                Err(SyncError::UnexpectedReply(format!("{other:?}")))
            }
        }
    }

    async fn eval_bulk_delete(&self, sha1: &str, pattern: &str) -> Result<RespFrame, SyncError> {
        self.execute(request(&[
            b"EVALSHA",
            sha1.as_bytes(),
            b"0",
            pattern.as_bytes(),
        ]))
        .await
    }

    async fn load_delete_script(&self) -> Result<String, SyncError> {
        if let Some(sha1) = self.delete_script.cached() {
            return Ok(sha1);
        }
        let reply = self
            .execute(request(&[
                b"SCRIPT",
                b"LOAD",
                self.delete_script.source().as_bytes(),
            ]))
            .await?;
        let sha1 = reply
            .as_bytes()
            .and_then(|b| std::str::from_utf8(b).ok())
            .map(str::to_owned)
            .ok_or_else(|| SyncError::UnexpectedReply(format!("SCRIPT LOAD returned {reply:?}")))?;
        debug!("Loaded bulk-delete script as {}.", sha1);
        self.delete_script.store(sha1.clone());
        Ok(sha1)
    }

    /// Sends a `PING`. The outcome drives the connectivity state like any other
    /// operation.
    pub async fn test_connection(&self) -> bool {
        matches!(
            self.execute(request(&[b"PING"])).await,
            Ok(ref reply) if reply.as_bytes() == Some(b"PONG".as_slice())
        )
    }

    /// Subscribes to a glob pattern and feeds every message to `handler` until a
    /// shutdown signal arrives.
    ///
    /// Meant to run on its own task: it only returns on shutdown (or once the pool
    /// is closed). A failed subscription is retried with exponential backoff, and
    /// the backoff resets after every successful subscription.
    pub async fn subscribe<F>(
        &self,
        pattern: &str,
        mut handler: F,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) where
        F: FnMut(PubSubMessage) + Send,
    {
        let policy = self.options.reconnect;
        let mut delay = policy.initial_delay;

        loop {
            let err = tokio::select! {
                biased;
                _ = shutdown_rx.recv() => {
                    info!("Subscription to '{}' received shutdown signal.", pattern);
                    return;
                }
                err = self.run_subscription(pattern, &mut handler, &mut delay) => err,
            };

            if matches!(err, SyncError::PoolClosed) {
                info!("Subscription to '{}' stopped: connection is shut down.", pattern);
                return;
            }

            metrics::SUBSCRIBE_RETRIES_TOTAL.inc();
            warn!(
                "Subscription to '{}' failed: {}. Retrying in {:?}.",
                pattern, err, delay
            );
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => {
                    info!("Subscription to '{}' received shutdown signal.", pattern);
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }
            delay = policy.next_delay(delay);
        }
    }

    /// One subscription attempt. Returns the error that ended it.
    async fn run_subscription<F>(
        &self,
        pattern: &str,
        handler: &mut F,
        delay: &mut Duration,
    ) -> SyncError
    where
        F: FnMut(PubSubMessage) + Send,
    {
        let mut session = match self.open_subscriber(pattern).await {
            Ok(session) => session,
            Err(e) => {
                self.record_failure(&e);
                return e;
            }
        };
        self.mark_active();
        *delay = self.options.reconnect.initial_delay;
        info!("Subscribed to pattern '{}'.", pattern);

        loop {
            match session.next_push().await.and_then(PubSubMessage::from_push) {
                Ok(Some(message)) => handler(message),
                Ok(None) => trace!("Ignoring non-message push on '{}'.", pattern),
                Err(e) => {
                    self.record_failure(&e);
                    return e;
                }
            }
        }
    }

    /// Opens a dedicated session (outside the pool's limit) and subscribes it.
    async fn open_subscriber(&self, pattern: &str) -> Result<Box<dyn BrokerSession>, SyncError> {
        let mut session = self.pool.get().await?.detach();
        let reply = self
            .with_timeout(session.call(request(&[b"PSUBSCRIBE", pattern.as_bytes()])))
            .await?
            .into_result()?;
        match reply {
            RespFrame::Array(parts)
                if parts.first().and_then(RespFrame::as_bytes) == Some(b"psubscribe".as_slice()) =>
            {
                Ok(session)
            }
            other => Err(SyncError::UnexpectedReply(format!(
                "PSUBSCRIBE returned {other:?}"
            ))),
        }
    }
}
