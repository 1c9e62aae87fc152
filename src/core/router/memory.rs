// src/core/router/memory.rs

//! In-process collaborators for a node running without a game server attached.

use super::{PlayerDirectory, PlayerRef, PortalRecord, PortalRegistry, Teleporter};
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::info;
use uuid::Uuid;

/// Portal records keyed by name.
#[derive(Debug, Default)]
pub struct MemoryPortalRegistry {
    portals: DashMap<String, PortalRecord>,
}

impl MemoryPortalRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PortalRegistry for MemoryPortalRegistry {
    fn list(&self) -> Vec<PortalRecord> {
        let mut portals: Vec<PortalRecord> =
            self.portals.iter().map(|e| e.value().clone()).collect();
        portals.sort_by(|a, b| a.spec.name.cmp(&b.spec.name));
        portals
    }

    fn get(&self, name: &str) -> Option<PortalRecord> {
        self.portals.get(name).map(|e| e.value().clone())
    }

    fn upsert(&self, record: PortalRecord) -> bool {
        self.portals
            .insert(record.spec.name.clone(), record)
            .is_none()
    }

    fn remove(&self, name: &str) -> Option<PortalRecord> {
        self.portals.remove(name).map(|(_, record)| record)
    }
}

/// Online players by name, with every message sent to them kept in an inbox.
#[derive(Debug, Default)]
pub struct MemoryPlayerDirectory {
    players: DashMap<String, PlayerRef>,
    inbox: Mutex<Vec<(String, String)>>,
}

impl MemoryPlayerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, name: impl Into<String>) -> PlayerRef {
        let name = name.into();
        let player = PlayerRef {
            id: Uuid::new_v4(),
            name: name.clone(),
        };
        self.players.insert(name.to_lowercase(), player.clone());
        player
    }

    pub fn remove(&self, name: &str) {
        self.players.remove(&name.to_lowercase());
    }

    /// Messages sent to `name` so far, oldest first.
    pub fn messages_for(&self, name: &str) -> Vec<String> {
        self.inbox
            .lock()
            .iter()
            .filter(|(to, _)| to.eq_ignore_ascii_case(name))
            .map(|(_, text)| text.clone())
            .collect()
    }
}

impl PlayerDirectory for MemoryPlayerDirectory {
    fn resolve(&self, name: &str) -> Option<PlayerRef> {
        self.players
            .get(&name.to_lowercase())
            .map(|e| e.value().clone())
    }

    fn send_message(&self, player: &PlayerRef, message: &str) {
        info!("[to {}] {}", player.name, message);
        self.inbox
            .lock()
            .push((player.name.clone(), message.to_string()));
    }
}

/// Records teleport requests in the log. Used where no game server is attached.
#[derive(Debug, Default)]
pub struct LoggingTeleporter;

impl Teleporter for LoggingTeleporter {
    fn teleport(
        &self,
        player: &PlayerRef,
        server: &str,
        destination: &str,
        has_permission: bool,
    ) -> Result<(), String> {
        info!(
            "Teleport {} to '{}' on {} (permission: {}).",
            player.name, destination, server, has_permission
        );
        Ok(())
    }
}
