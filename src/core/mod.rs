// src/core/mod.rs

//! The synchronization transport: broker access, channel dispatch, the command
//! codec and the action router.

pub mod broker;
pub mod channel;
pub mod command;
pub mod connection;
pub mod errors;
pub mod metrics;
pub mod protocol;
pub mod router;

pub use command::Command;
pub use connection::StoreConnection;
pub use errors::SyncError;
