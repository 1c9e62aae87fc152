// src/core/errors.rs

//! Defines the primary error type for the synchronization transport.

use crate::core::command::CodecError;
use std::error::Error as StdError;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// The main error enum, representing all possible failures of broker operations,
/// frame handling and dispatch.
///
/// Errors fall into two classes, see [`SyncError::is_connectivity`]: connectivity
/// errors drive the connection's active/inactive state machine and invalidate the
/// pooled session, every other variant is an operation error reported to the caller.
#[derive(Error, Debug, Clone)]
pub enum SyncError {
    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("Incomplete data in stream")]
    IncompleteData,

    #[error("Connection closed by broker")]
    ConnectionClosed,

    #[error("Broker unreachable: {0}")]
    Unreachable(String),

    #[error("Broker operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Syntax error")]
    SyntaxError,

    #[error("Broker error: {0}")]
    Broker(String),

    #[error("NOSCRIPT No matching script")]
    NoScript,

    #[error("Unexpected reply: {0}")]
    UnexpectedReply(String),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Connection pool is shut down")]
    PoolClosed,

    #[error("Script error: {0}")]
    Script(String),

    #[error("Internal Error: {0}")]
    Internal(String),
}

impl SyncError {
    /// Returns true for errors that mean the broker (or the session to it) is gone:
    /// refused/reset sockets, closed streams, timeouts and protocol desync.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            SyncError::Io(_)
                | SyncError::IncompleteData
                | SyncError::ConnectionClosed
                | SyncError::Unreachable(_)
                | SyncError::Timeout(_)
                | SyncError::Protocol(_)
                | SyncError::SyntaxError
        )
    }

    /// A short, stable label used for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::Io(_) => "io",
            SyncError::IncompleteData => "incomplete",
            SyncError::ConnectionClosed => "closed",
            SyncError::Unreachable(_) => "unreachable",
            SyncError::Timeout(_) => "timeout",
            SyncError::Protocol(_) | SyncError::SyntaxError => "protocol",
            SyncError::Broker(_) => "broker",
            SyncError::NoScript => "noscript",
            SyncError::UnexpectedReply(_) => "unexpected_reply",
            SyncError::Codec(_) => "codec",
            SyncError::InvalidRequest(_) => "invalid_request",
            SyncError::PoolClosed => "pool_closed",
            SyncError::Script(_) => "script",
            SyncError::Internal(_) => "internal",
        }
    }

    /// Maps a RESP error reply (`-ERR ...`) to the matching variant.
    pub fn from_error_reply(message: &str) -> Self {
        if message.starts_with("NOSCRIPT") {
            SyncError::NoScript
        } else {
            SyncError::Broker(message.to_string())
        }
    }
}

impl PartialEq for SyncError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (SyncError::Io(e1), SyncError::Io(e2)) => e1.kind() == e2.kind(),
            (SyncError::Unreachable(s1), SyncError::Unreachable(s2)) => s1 == s2,
            (SyncError::Timeout(d1), SyncError::Timeout(d2)) => d1 == d2,
            (SyncError::Protocol(s1), SyncError::Protocol(s2)) => s1 == s2,
            (SyncError::Broker(s1), SyncError::Broker(s2)) => s1 == s2,
            (SyncError::UnexpectedReply(s1), SyncError::UnexpectedReply(s2)) => s1 == s2,
            (SyncError::Codec(c1), SyncError::Codec(c2)) => c1 == c2,
            (SyncError::InvalidRequest(s1), SyncError::InvalidRequest(s2)) => s1 == s2,
            (SyncError::Script(s1), SyncError::Script(s2)) => s1 == s2,
            (SyncError::Internal(s1), SyncError::Internal(s2)) => s1 == s2,
            _ => core::mem::discriminant(self) == core::mem::discriminant(other),
        }
    }
}

// --- From trait implementations for easy error conversion ---

impl From<std::io::Error> for SyncError {
    fn from(e: std::io::Error) -> Self {
        SyncError::Io(Arc::new(e))
    }
}

impl From<std::string::FromUtf8Error> for SyncError {
    fn from(e: std::string::FromUtf8Error) -> Self {
        SyncError::InvalidRequest(format!("invalid UTF-8: {e}"))
    }
}

impl From<mlua::Error> for SyncError {
    fn from(e: mlua::Error) -> Self {
        let mut source: Option<&(dyn StdError + 'static)> = e.source();
        while let Some(err) = source {
            if let Some(sync_err) = err.downcast_ref::<SyncError>() {
                return sync_err.clone();
            }
            source = err.source();
        }
        SyncError::Script(e.to_string())
    }
}

impl From<SyncError> for mlua::Error {
    fn from(e: SyncError) -> Self {
        mlua::Error::external(e)
    }
}
