// src/core/broker/memory.rs

//! An in-process broker speaking the same RESP command subset as the real one.
//!
//! It backs single-node deployments (`backend = "memory"`) and the test-suite.
//! Besides key/value, pattern pub/sub and Lua scripting it supports fault
//! injection: it can be made unreachable (refusing new sessions and severing
//! live ones), stalled (requests never complete) or told to fail the next request
//! with an error reply.

use super::glob::glob_match;
use super::{BrokerSession, Connector};
use crate::core::SyncError;
use crate::core::protocol::{RespFrame, RespValue};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::FutureExt;
use mlua::prelude::*;
use parking_lot::Mutex;
use sha1::{Digest, Sha1};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};

/// Capacity of each pattern's broadcast channel.
const PATTERN_CHANNEL_CAPACITY: usize = 1024;

/// (matching pattern, channel, payload)
type PMessage = (Bytes, Bytes, Bytes);

/// Pattern subscriptions, one broadcast sender per distinct pattern.
#[derive(Debug, Default)]
struct PatternHub {
    patterns: DashMap<Bytes, broadcast::Sender<PMessage>>,
}

impl PatternHub {
    fn subscribe(&self, pattern: &Bytes) -> broadcast::Receiver<PMessage> {
        self.patterns
            .entry(pattern.clone())
            .or_insert_with(|| broadcast::channel(PATTERN_CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Delivers to every matching pattern, returning the number of receivers reached.
    fn publish(&self, channel: &Bytes, message: &Bytes) -> usize {
        self.patterns
            .iter()
            .filter(|entry| glob_match(entry.key(), channel))
            .map(|entry| {
                entry
                    .value()
                    .send((entry.key().clone(), channel.clone(), message.clone()))
                    .unwrap_or(0)
            })
            .sum()
    }

    fn purge_empty(&self) {
        self.patterns.retain(|_, sender| sender.receiver_count() > 0);
    }

    fn receiver_count(&self) -> usize {
        self.patterns
            .iter()
            .map(|entry| entry.value().receiver_count())
            .sum()
    }
}

/// Loaded Lua scripts keyed by the hex SHA1 of their source.
#[derive(Debug, Default)]
struct ScriptCache {
    scripts: DashMap<String, Bytes>,
    loads: AtomicUsize,
}

impl ScriptCache {
    fn load(&self, script: Bytes) -> String {
        let mut hasher = Sha1::new();
        hasher.update(&script);
        let sha1 = hex::encode(hasher.finalize());
        self.scripts.insert(sha1.clone(), script);
        self.loads.fetch_add(1, Ordering::Relaxed);
        sha1
    }

    fn get(&self, sha1: &str) -> Option<Bytes> {
        self.scripts.get(sha1).map(|v| v.value().clone())
    }
}

#[derive(Debug)]
struct BrokerState {
    store: DashMap<Bytes, Bytes>,
    hub: PatternHub,
    scripts: ScriptCache,
    reachable: AtomicBool,
    stalled: AtomicBool,
    fail_next: Mutex<Option<String>>,
    /// Bumped on every outage; sessions from an older generation are dead.
    generation: watch::Sender<u64>,
    del_batches: Mutex<Vec<usize>>,
}

impl BrokerState {
    fn generation(&self) -> u64 {
        *self.generation.borrow()
    }

    /// Commands that touch only data; this is also the surface exposed to Lua.
    fn execute_data_command(&self, args: &[Bytes]) -> RespValue {
        let Some(name) = args.first() else {
            return RespValue::Error("ERR empty command".into());
        };
        let name = String::from_utf8_lossy(name).to_ascii_uppercase();
        let argc = args.len() - 1;

        match (name.as_str(), argc) {
            ("PING", 0) => RespValue::SimpleString("PONG".into()),
            ("GET", 1) => self
                .store
                .get(&args[1])
                .map_or(RespValue::Null, |v| RespValue::BulkString(v.value().clone())),
            ("SET", 2) => {
                self.store.insert(args[1].clone(), args[2].clone());
                RespValue::ok()
            }
            ("DEL", n) if n >= 1 => {
                self.del_batches.lock().push(n);
                let removed = args[1..]
                    .iter()
                    .filter(|key| self.store.remove(*key).is_some())
                    .count();
                RespValue::Integer(removed as i64)
            }
            ("KEYS", 1) => RespValue::Array(
                self.store
                    .iter()
                    .filter(|entry| glob_match(&args[1], entry.key()))
                    .map(|entry| RespValue::BulkString(entry.key().clone()))
                    .collect(),
            ),
            ("PUBLISH", 2) => RespValue::Integer(self.hub.publish(&args[1], &args[2]) as i64),
            (
                "PING" | "GET" | "SET" | "DEL" | "KEYS" | "PUBLISH",
                _,
            ) => RespValue::Error(format!(
                "ERR wrong number of arguments for '{}' command",
                name.to_ascii_lowercase()
            )),
            _ => RespValue::Error(format!("ERR unknown command '{name}'")),
        }
    }

    fn execute_script_command(&self, args: &[Bytes]) -> RespValue {
        let sub = args
            .get(1)
            .map(|s| String::from_utf8_lossy(s).to_ascii_uppercase());
        match (sub.as_deref(), args.len()) {
            (Some("LOAD"), 3) => RespValue::BulkString(self.scripts.load(args[2].clone()).into()),
            (Some("FLUSH"), _) => {
                self.scripts.scripts.clear();
                RespValue::ok()
            }
            (Some("EXISTS"), _) => RespValue::Array(
                args[2..]
                    .iter()
                    .map(|sha| {
                        let sha = String::from_utf8_lossy(sha);
                        RespValue::Integer(self.scripts.scripts.contains_key(sha.as_ref()) as i64)
                    })
                    .collect(),
            ),
            _ => RespValue::Error("ERR unknown SCRIPT subcommand or wrong number of arguments".into()),
        }
    }
}

/// Splits `EVAL`/`EVALSHA` arguments after the script into (keys, argv).
fn split_script_args(args: &[Bytes]) -> Result<(Vec<Bytes>, Vec<Bytes>), RespValue> {
    let num_keys = args
        .get(2)
        .and_then(|n| std::str::from_utf8(n).ok())
        .and_then(|n| n.parse::<usize>().ok())
        .ok_or_else(|| RespValue::Error("ERR value is not an integer or out of range".into()))?;
    let rest = &args[3..];
    if rest.len() < num_keys {
        return Err(RespValue::Error(
            "ERR Number of keys can't be greater than number of args".into(),
        ));
    }
    Ok((rest[..num_keys].to_vec(), rest[num_keys..].to_vec()))
}

/// Runs a script on a fresh Lua state with a `redis.call` bridge into the store.
fn run_script(
    state: Arc<BrokerState>,
    script: Bytes,
    keys: Vec<Bytes>,
    argv: Vec<Bytes>,
) -> mlua::Result<RespValue> {
    let lua = Lua::new();
    let globals = lua.globals();

    // Scripts are written against the Lua 5.1 dialect, which has a global `unpack`.
    let table_lib: LuaTable = globals.get("table")?;
    globals.set("unpack", table_lib.get::<LuaFunction>("unpack")?)?;

    let redis_table = lua.create_table()?;
    let call_state = Arc::clone(&state);
    let call = lua.create_function(move |lua, m_args: LuaMultiValue| {
        let mut args = Vec::new();
        for val in m_args.into_vec() {
            args.push(lua_arg_to_bytes(val)?);
        }
        match call_state.execute_data_command(&args) {
            RespValue::Error(e) => Err(LuaError::RuntimeError(e)),
            value => resp_value_to_lua_value(lua, value),
        }
    })?;
    redis_table.set("call", call)?;
    globals.set("redis", redis_table)?;

    let keys_table =
        lua.create_table_from(keys.iter().enumerate().map(|(i, k)| (i + 1, k.as_ref())))?;
    globals.set("KEYS", keys_table)?;
    let argv_table =
        lua.create_table_from(argv.iter().enumerate().map(|(i, a)| (i + 1, a.as_ref())))?;
    globals.set("ARGV", argv_table)?;
    drop(globals);

    let result = lua.load(&*script).eval::<LuaValue>()?;
    lua_value_to_resp_value(result)
}

fn lua_arg_to_bytes(val: LuaValue) -> mlua::Result<Bytes> {
    match val {
        LuaValue::String(s) => Ok(Bytes::copy_from_slice(&s.as_bytes())),
        LuaValue::Integer(i) => Ok(i.to_string().into()),
        LuaValue::Number(n) => Ok(n.to_string().into()),
        other => Err(LuaError::FromLuaConversionError {
            from: other.type_name(),
            to: "command argument".to_string(),
            message: Some("redis.call arguments must be strings or numbers".to_string()),
        }),
    }
}

fn lua_value_to_resp_value(val: LuaValue) -> mlua::Result<RespValue> {
    match val {
        LuaValue::Nil | LuaValue::Boolean(false) => Ok(RespValue::Null),
        LuaValue::Boolean(true) => Ok(RespValue::Integer(1)),
        LuaValue::Integer(i) => Ok(RespValue::Integer(i)),
        LuaValue::Number(n) => Ok(RespValue::Integer(n as i64)),
        LuaValue::String(s) => Ok(RespValue::BulkString(Bytes::copy_from_slice(&s.as_bytes()))),
        LuaValue::Table(t) => {
            let mut items = Vec::new();
            for item in t.sequence_values::<LuaValue>() {
                items.push(lua_value_to_resp_value(item?)?);
            }
            Ok(RespValue::Array(items))
        }
        other => Err(LuaError::FromLuaConversionError {
            from: other.type_name(),
            to: "reply".to_string(),
            message: Some("unsupported script return type".to_string()),
        }),
    }
}

fn resp_value_to_lua_value(lua: &Lua, val: RespValue) -> mlua::Result<LuaValue> {
    match val {
        RespValue::SimpleString(s) => {
            let status = lua.create_table()?;
            status.set("ok", s)?;
            Ok(LuaValue::Table(status))
        }
        RespValue::BulkString(b) => Ok(LuaValue::String(lua.create_string(&b)?)),
        RespValue::Integer(i) => Ok(LuaValue::Integer(i)),
        RespValue::Null | RespValue::NullArray => Ok(LuaValue::Boolean(false)),
        RespValue::Error(e) => {
            let err = lua.create_table()?;
            err.set("err", e)?;
            Ok(LuaValue::Table(err))
        }
        RespValue::Array(items) => {
            let table = lua.create_table_with_capacity(items.len(), 0)?;
            for (i, item) in items.into_iter().enumerate() {
                table.set(i + 1, resp_value_to_lua_value(lua, item)?)?;
            }
            Ok(LuaValue::Table(table))
        }
    }
}

/// A handle to an in-process broker. Cloning shares the same broker.
#[derive(Debug, Clone)]
pub struct MemoryBroker {
    state: Arc<BrokerState>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(BrokerState {
                store: DashMap::new(),
                hub: PatternHub::default(),
                scripts: ScriptCache::default(),
                reachable: AtomicBool::new(true),
                stalled: AtomicBool::new(false),
                fail_next: Mutex::new(None),
                generation: watch::channel(0).0,
                del_batches: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Makes the broker unreachable (new sessions are refused and every live
    /// session is severed) or reachable again.
    pub fn set_reachable(&self, reachable: bool) {
        let was = self.state.reachable.swap(reachable, Ordering::SeqCst);
        if was && !reachable {
            self.state.generation.send_modify(|g| *g += 1);
            debug!("Memory broker is now unreachable.");
        } else if !was && reachable {
            debug!("Memory broker is reachable again.");
        }
    }

    /// While stalled, requests on existing sessions never complete.
    pub fn set_stalled(&self, stalled: bool) {
        self.state.stalled.store(stalled, Ordering::SeqCst);
    }

    /// The next request on any session fails with this error reply.
    pub fn fail_next(&self, message: impl Into<String>) {
        *self.state.fail_next.lock() = Some(message.into());
    }

    pub fn insert(&self, key: impl Into<Bytes>, value: impl Into<Bytes>) {
        self.state.store.insert(key.into(), value.into());
    }

    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.state.store.contains_key(key)
    }

    pub fn key_count(&self) -> usize {
        self.state.store.len()
    }

    /// The argument count of every `DEL` executed so far.
    pub fn del_batches(&self) -> Vec<usize> {
        self.state.del_batches.lock().clone()
    }

    /// How many times `SCRIPT LOAD` ran.
    pub fn script_loads(&self) -> usize {
        self.state.scripts.loads.load(Ordering::Relaxed)
    }

    /// Forgets all loaded scripts, as a broker restart would.
    pub fn flush_scripts(&self) {
        self.state.scripts.scripts.clear();
    }

    /// Number of live pattern-subscription receivers across all sessions.
    pub fn pattern_subscribers(&self) -> usize {
        self.state.hub.receiver_count()
    }

    /// Publishes directly, bypassing any session.
    pub fn publish(&self, channel: impl Into<Bytes>, payload: impl Into<Bytes>) -> usize {
        self.state.hub.publish(&channel.into(), &payload.into())
    }
}

#[async_trait]
impl Connector for MemoryBroker {
    async fn connect(&self) -> Result<Box<dyn BrokerSession>, SyncError> {
        if !self.state.reachable.load(Ordering::SeqCst) {
            return Err(SyncError::Unreachable("memory broker is offline".into()));
        }
        Ok(Box::new(MemorySession {
            generation: self.state.generation(),
            generation_rx: self.state.generation.subscribe(),
            state: Arc::clone(&self.state),
            subscriptions: Vec::new(),
            pending: VecDeque::new(),
        }))
    }

    fn describe(&self) -> String {
        "memory broker".to_string()
    }
}

/// One session on a [`MemoryBroker`].
pub struct MemorySession {
    state: Arc<BrokerState>,
    generation: u64,
    generation_rx: watch::Receiver<u64>,
    subscriptions: Vec<(Bytes, broadcast::Receiver<PMessage>)>,
    pending: VecDeque<RespFrame>,
}

impl MemorySession {
    fn ensure_alive(&self) -> Result<(), SyncError> {
        if self.generation != self.state.generation() {
            return Err(SyncError::ConnectionClosed);
        }
        Ok(())
    }

    fn psubscribe(&mut self, patterns: &[Bytes]) -> Result<RespFrame, SyncError> {
        if patterns.is_empty() {
            return Ok(RespFrame::Error(
                "ERR wrong number of arguments for 'psubscribe' command".into(),
            ));
        }
        for pattern in patterns {
            let rx = self.state.hub.subscribe(pattern);
            self.subscriptions.push((pattern.clone(), rx));
            self.pending.push_back(RespValue::Array(vec![
                RespValue::BulkString("psubscribe".into()),
                RespValue::BulkString(pattern.clone()),
                RespValue::Integer(self.subscriptions.len() as i64),
            ]).into());
        }
        self.pending.pop_front().ok_or(SyncError::Internal(
            "psubscribe produced no confirmation".into(),
        ))
    }

    fn punsubscribe(&mut self, patterns: &[Bytes]) -> Result<RespFrame, SyncError> {
        let targets: Vec<Bytes> = if patterns.is_empty() {
            self.subscriptions.iter().map(|(p, _)| p.clone()).collect()
        } else {
            patterns.to_vec()
        };
        for pattern in &targets {
            self.subscriptions.retain(|(p, _)| p != pattern);
            self.pending.push_back(RespValue::Array(vec![
                RespValue::BulkString("punsubscribe".into()),
                RespValue::BulkString(pattern.clone()),
                RespValue::Integer(self.subscriptions.len() as i64),
            ]).into());
        }
        self.state.hub.purge_empty();
        Ok(self.pending.pop_front().unwrap_or_else(|| {
            RespValue::Array(vec![
                RespValue::BulkString("punsubscribe".into()),
                RespValue::Null,
                RespValue::Integer(0),
            ])
            .into()
        }))
    }
}

fn request_args(request: RespFrame) -> Result<Vec<Bytes>, SyncError> {
    let RespFrame::Array(parts) = request else {
        return Err(SyncError::InvalidRequest(
            "requests must be RESP arrays".into(),
        ));
    };
    parts
        .into_iter()
        .map(|part| match part {
            RespFrame::BulkString(b) => Ok(b),
            RespFrame::SimpleString(s) => Ok(s.into()),
            RespFrame::Integer(i) => Ok(i.to_string().into()),
            other => Err(SyncError::InvalidRequest(format!(
                "unsupported argument {other:?}"
            ))),
        })
        .collect()
}

/// Waits for a message on any of the receivers.
async fn recv_any(
    subscriptions: &mut [(Bytes, broadcast::Receiver<PMessage>)],
) -> Result<PMessage, broadcast::error::RecvError> {
    let receivers = subscriptions
        .iter_mut()
        .map(|(_, rx)| async move { rx.recv().await }.boxed());
    let (result, _index, _remaining) = futures::future::select_all(receivers).await;
    result
}

#[async_trait]
impl BrokerSession for MemorySession {
    async fn call(&mut self, request: RespFrame) -> Result<RespFrame, SyncError> {
        self.ensure_alive()?;
        if self.state.stalled.load(Ordering::SeqCst) {
            futures::future::pending::<()>().await;
        }
        if let Some(message) = self.state.fail_next.lock().take() {
            return Ok(RespFrame::Error(message));
        }

        let args = request_args(request)?;
        let Some(name) = args.first() else {
            return Ok(RespFrame::Error("ERR empty command".into()));
        };
        let name = String::from_utf8_lossy(name).to_ascii_uppercase();

        let reply = match name.as_str() {
            "AUTH" => RespValue::ok(),
            "PSUBSCRIBE" => return self.psubscribe(&args[1..]),
            "PUNSUBSCRIBE" => return self.punsubscribe(&args[1..]),
            "SCRIPT" => self.state.execute_script_command(&args),
            "EVAL" | "EVALSHA" if args.len() >= 3 => {
                let script = if name == "EVAL" {
                    Some(args[1].clone())
                } else {
                    self.state.scripts.get(&String::from_utf8_lossy(&args[1]))
                };
                match (script, split_script_args(&args)) {
                    (None, _) => RespValue::Error(
                        "NOSCRIPT No matching script. Please use EVAL.".into(),
                    ),
                    (Some(_), Err(reply)) => reply,
                    (Some(script), Ok((keys, argv))) => {
                        let state = Arc::clone(&self.state);
                        let outcome = tokio::task::spawn_blocking(move || {
                            run_script(state, script, keys, argv)
                        })
                        .await
                        .map_err(|e| SyncError::Internal(format!("script task panicked: {e}")))?;
                        match outcome {
                            Ok(value) => value,
                            Err(e) => RespValue::Error(format!("ERR Error running script: {e}")),
                        }
                    }
                }
            }
            _ => self.state.execute_data_command(&args),
        };

        Ok(reply.into())
    }

    async fn next_push(&mut self) -> Result<RespFrame, SyncError> {
        if let Some(frame) = self.pending.pop_front() {
            return Ok(frame);
        }
        self.ensure_alive()?;
        if self.subscriptions.is_empty() {
            return Err(SyncError::InvalidRequest(
                "session has no active subscriptions".into(),
            ));
        }

        loop {
            tokio::select! {
                biased;
                _ = self.generation_rx.changed() => return Err(SyncError::ConnectionClosed),
                received = recv_any(&mut self.subscriptions) => match received {
                    Ok((pattern, channel, payload)) => {
                        return Ok(RespValue::Array(vec![
                            RespValue::BulkString("pmessage".into()),
                            RespValue::BulkString(pattern),
                            RespValue::BulkString(channel),
                            RespValue::BulkString(payload),
                        ])
                        .into());
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!("Memory broker subscriber lagged, {} message(s) lost.", missed);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(SyncError::ConnectionClosed);
                    }
                },
            }
        }
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        if !self.subscriptions.is_empty() {
            self.subscriptions.clear();
            self.state.hub.purge_empty();
        }
    }
}
