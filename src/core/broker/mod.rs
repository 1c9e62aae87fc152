// src/core/broker/mod.rs

//! Broker backends and the session pool.
//!
//! A [`Connector`] opens sessions to a broker; a [`BrokerSession`] exchanges RESP
//! frames over one of them. The resilient connection layer only ever talks to
//! these traits, so the TCP backend and the in-process broker are interchangeable.

use crate::core::SyncError;
use crate::core::protocol::RespFrame;
use async_trait::async_trait;

pub mod glob;
pub mod memory;
pub mod pool;
pub mod tcp;

pub use memory::MemoryBroker;
pub use pool::{PooledSession, SessionPool};
pub use tcp::TcpConnector;

/// Opens new sessions to a broker.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self) -> Result<Box<dyn BrokerSession>, SyncError>;

    /// A human-readable description of the target, used in logs.
    fn describe(&self) -> String;
}

/// One live session to the broker.
#[async_trait]
pub trait BrokerSession: Send {
    /// Sends a request and waits for its reply.
    async fn call(&mut self, request: RespFrame) -> Result<RespFrame, SyncError>;

    /// Waits for the next unsolicited frame (pub/sub deliveries on a subscribed session).
    async fn next_push(&mut self) -> Result<RespFrame, SyncError>;
}
