// src/core/connection/notifier.rs

use crate::core::SyncError;
use tracing::{info, warn};

/// Receives connectivity transitions of a [`StoreConnection`](super::StoreConnection).
///
/// Each method is called exactly once per edge, never for a repeated state. Calls
/// happen inline on the task whose operation caused the transition, so
/// implementations should return quickly.
pub trait ConnectionNotifier: Send + Sync {
    /// The connection went from inactive to active.
    fn on_connection_restored(&self);

    /// The connection went from active to inactive because of `cause`.
    fn on_connection_lost(&self, cause: &SyncError);
}

/// A notifier that only writes the transitions to the log.
#[derive(Debug, Clone)]
pub struct LoggingNotifier {
    server_name: String,
}

impl LoggingNotifier {
    pub fn new(server_name: impl Into<String>) -> Self {
        Self {
            server_name: server_name.into(),
        }
    }
}

impl ConnectionNotifier for LoggingNotifier {
    fn on_connection_restored(&self) {
        info!(
            "[{}] Connection to the broker restored.",
            self.server_name
        );
    }

    fn on_connection_lost(&self, cause: &SyncError) {
        warn!(
            "[{}] Lost connection to the broker: {}. Cross-server features are unavailable until it returns.",
            self.server_name, cause
        );
    }
}
