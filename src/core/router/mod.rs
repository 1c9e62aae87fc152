// src/core/router/mod.rs

//! Turns decoded commands into local side effects and response commands.
//!
//! The router never talks to the broker itself. [`ActionRouter::route`] returns
//! the commands to send back, and the [`PortalsHandler`] puts them on the wire.

pub mod handler;
pub mod memory;
pub mod messages;

pub use handler::PortalsHandler;
pub use memory::{LoggingTeleporter, MemoryPlayerDirectory, MemoryPortalRegistry};
pub use messages::Messages;

use crate::core::command::{Command, PortalSpec};
use crate::core::metrics;
use dashmap::DashMap;
use messages::render;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// An online player as known to the local server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerRef {
    pub id: Uuid,
    pub name: String,
}

/// A portal and the server it lives on.
#[derive(Debug, Clone, PartialEq)]
pub struct PortalRecord {
    pub server: String,
    pub spec: PortalSpec,
}

/// Resolves player names and delivers chat messages to players.
pub trait PlayerDirectory: Send + Sync {
    fn resolve(&self, name: &str) -> Option<PlayerRef>;
    fn send_message(&self, player: &PlayerRef, message: &str);
}

/// Local portal storage.
pub trait PortalRegistry: Send + Sync {
    /// All portals, sorted by name.
    fn list(&self) -> Vec<PortalRecord>;
    fn get(&self, name: &str) -> Option<PortalRecord>;
    /// Inserts or replaces a portal. Returns true if it did not exist before.
    fn upsert(&self, record: PortalRecord) -> bool;
    fn remove(&self, name: &str) -> Option<PortalRecord>;
}

/// Moves a player to a warp or point on another server.
pub trait Teleporter: Send + Sync {
    fn teleport(
        &self,
        player: &PlayerRef,
        server: &str,
        destination: &str,
        has_permission: bool,
    ) -> Result<(), String>;
}

/// Everything the router needs from the hosting process.
#[derive(Clone)]
pub struct RouterContext {
    pub server_name: String,
    pub players: Arc<dyn PlayerDirectory>,
    pub portals: Arc<dyn PortalRegistry>,
    pub teleporter: Arc<dyn Teleporter>,
    pub messages: Messages,
}

/// Where a response command goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// Back to the server the triggering command came from.
    Origin,
    Broadcast,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub target: Target,
    pub command: Command,
}

impl Outbound {
    fn to_origin(command: Command) -> Self {
        Self {
            target: Target::Origin,
            command,
        }
    }

    fn broadcast(command: Command) -> Self {
        Self {
            target: Target::Broadcast,
            command,
        }
    }
}

pub struct ActionRouter {
    ctx: RouterContext,
    versions: DashMap<String, String>,
}

impl ActionRouter {
    pub fn new(ctx: RouterContext) -> Self {
        Self {
            ctx,
            versions: DashMap::new(),
        }
    }

    pub fn context(&self) -> &RouterContext {
        &self.ctx
    }

    /// The last version announced by each server.
    pub fn versions(&self) -> HashMap<String, String> {
        self.versions
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    /// Handles one command received from `origin`.
    pub fn route(&self, origin: &str, command: Command) -> Vec<Outbound> {
        metrics::COMMANDS_ROUTED_TOTAL
            .with_label_values(&[command.tag().as_ref()])
            .inc();
        debug!("Routing {} from {}.", command.tag(), origin);

        match command {
            Command::TeleportPlayer {
                player,
                destination_server,
                destination,
                has_permission,
            } => {
                self.teleport(&player, &destination_server, &destination, has_permission);
                Vec::new()
            }
            Command::ListPortals { player } => {
                self.list_portals(&player);
                Vec::new()
            }
            Command::DeletePortal { player, portal } => self.delete_portal(&player, &portal),
            Command::SetPortal { player, selection } => match selection {
                None => {
                    self.tell(&player, self.ctx.messages.no_selection_made.clone());
                    Vec::new()
                }
                Some(spec) => self.set_portal(origin, &player, spec),
            },
            Command::RequestPortals => self
                .ctx
                .portals
                .list()
                .into_iter()
                .filter(|record| record.server == origin)
                .map(|record| Outbound::to_origin(Command::SendPortal(record.spec)))
                .collect(),
            Command::SendVersion { version } => {
                info!("{} is running {}.", origin, version);
                self.versions.insert(origin.to_string(), version);
                Vec::new()
            }
            // Portals are only ever sent to the server they live on.
            Command::SendPortal(spec) => {
                self.ctx.portals.upsert(PortalRecord {
                    server: self.ctx.server_name.clone(),
                    spec,
                });
                Vec::new()
            }
            Command::RemovePortal { portal } => {
                self.ctx.portals.remove(&portal);
                Vec::new()
            }
        }
    }

    /// Messages `player` if they are online here; otherwise the text is dropped.
    fn tell(&self, player: &str, message: String) {
        match self.ctx.players.resolve(player) {
            Some(player) => self.ctx.players.send_message(&player, &message),
            None => debug!("Player {} is not online, dropping message.", player),
        }
    }

    fn teleport(&self, name: &str, server: &str, destination: &str, has_permission: bool) {
        let Some(player) = self.ctx.players.resolve(name) else {
            warn!("Cannot teleport unknown player {}.", name);
            return;
        };
        if let Err(reason) = self
            .ctx
            .teleporter
            .teleport(&player, server, destination, has_permission)
        {
            let text = render(&self.ctx.messages.teleport_failed, &[("reason", reason.as_str())]);
            self.ctx.players.send_message(&player, &text);
        }
    }

    fn list_portals(&self, name: &str) {
        let Some(player) = self.ctx.players.resolve(name) else {
            debug!("Player {} is not online, skipping portal list.", name);
            return;
        };

        let mut by_server: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for record in self.ctx.portals.list() {
            by_server.entry(record.server).or_default().push(record.spec.name);
        }

        if by_server.is_empty() {
            self.ctx
                .players
                .send_message(&player, &self.ctx.messages.no_portals);
            return;
        }
        for (server, portals) in by_server {
            let text = render(
                &self.ctx.messages.portal_list_entry,
                &[("server", server.as_str()), ("portals", portals.join(", ").as_str())],
            );
            self.ctx.players.send_message(&player, &text);
        }
    }

    fn delete_portal(&self, player: &str, portal: &str) -> Vec<Outbound> {
        match self.ctx.portals.remove(portal) {
            Some(_) => {
                self.tell(player, render(&self.ctx.messages.portal_deleted, &[("portal", portal)]));
                vec![Outbound::broadcast(Command::RemovePortal {
                    portal: portal.to_string(),
                })]
            }
            None => {
                self.tell(
                    player,
                    render(&self.ctx.messages.portal_does_not_exist, &[("portal", portal)]),
                );
                Vec::new()
            }
        }
    }

    fn set_portal(&self, origin: &str, player: &str, spec: PortalSpec) -> Vec<Outbound> {
        let created = self.ctx.portals.upsert(PortalRecord {
            server: origin.to_string(),
            spec: spec.clone(),
        });
        let template = if created {
            &self.ctx.messages.portal_created
        } else {
            &self.ctx.messages.portal_updated
        };
        self.tell(player, render(template, &[("portal", spec.name.as_str())]));
        vec![Outbound::to_origin(Command::SendPortal(spec))]
    }
}
