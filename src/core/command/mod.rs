// src/core/command/mod.rs

//! The binary command protocol exchanged between server processes.
//!
//! A frame is a tag string followed by the fields that tag defines, in a fixed
//! order. There is no frame-level length or terminator: decoding stops after the
//! last declared field and ignores anything that follows, but fails if a declared
//! field cannot be read or the tag is unknown.

pub mod wire;

use bytes::Bytes;
use std::str::FromStr;
use strum_macros::{AsRefStr, Display, EnumString};

pub use wire::{CodecError, FrameReader, FrameWriter};

/// Every tag the codec understands. Matching is exact and case-sensitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, Display, AsRefStr)]
pub enum CommandTag {
    TeleportPlayer,
    ListPortals,
    DeletePortal,
    SetPortal,
    RequestPortals,
    SendVersion,
    SendPortal,
    RemovePortal,
}

/// A point in a named world.
#[derive(Debug, Clone, PartialEq)]
pub struct Location {
    pub world: String,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Location {
    pub fn new(world: impl Into<String>, x: f64, y: f64, z: f64) -> Self {
        Self {
            world: world.into(),
            x,
            y,
            z,
        }
    }
}

/// The portal body carried by `SetPortal` (after a selection) and `SendPortal`.
#[derive(Debug, Clone, PartialEq)]
pub struct PortalSpec {
    pub name: String,
    /// Portal type, e.g. `warp` or `server`.
    pub kind: String,
    pub destination: String,
    pub fill: String,
    pub min: Location,
    pub max: Location,
}

/// A decoded command frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    TeleportPlayer {
        player: String,
        destination_server: String,
        destination: String,
        has_permission: bool,
    },
    ListPortals {
        player: String,
    },
    DeletePortal {
        player: String,
        portal: String,
    },
    /// `selection` is `None` when the player had no region selected; the wire
    /// then carries only the `false` flag and no portal fields.
    SetPortal {
        player: String,
        selection: Option<PortalSpec>,
    },
    /// The requesting server is the envelope origin.
    RequestPortals,
    SendVersion {
        version: String,
    },
    SendPortal(PortalSpec),
    RemovePortal {
        portal: String,
    },
}

impl Command {
    pub fn tag(&self) -> CommandTag {
        match self {
            Command::TeleportPlayer { .. } => CommandTag::TeleportPlayer,
            Command::ListPortals { .. } => CommandTag::ListPortals,
            Command::DeletePortal { .. } => CommandTag::DeletePortal,
            Command::SetPortal { .. } => CommandTag::SetPortal,
            Command::RequestPortals => CommandTag::RequestPortals,
            Command::SendVersion { .. } => CommandTag::SendVersion,
            Command::SendPortal(_) => CommandTag::SendPortal,
            Command::RemovePortal { .. } => CommandTag::RemovePortal,
        }
    }

    /// Serializes the command into a self-contained frame.
    pub fn encode(&self) -> Result<Bytes, CodecError> {
        let mut w = FrameWriter::with_capacity(64);
        w.put_str("tag", self.tag().as_ref())?;

        match self {
            Command::TeleportPlayer {
                player,
                destination_server,
                destination,
                has_permission,
            } => {
                w.put_str("player", player)?;
                w.put_str("destination_server", destination_server)?;
                w.put_str("destination", destination)?;
                w.put_bool(*has_permission);
            }
            Command::ListPortals { player } => w.put_str("player", player)?,
            Command::DeletePortal { player, portal } => {
                w.put_str("player", player)?;
                w.put_str("portal", portal)?;
            }
            Command::SetPortal { player, selection } => {
                w.put_str("player", player)?;
                w.put_bool(selection.is_some());
                if let Some(spec) = selection {
                    put_portal(&mut w, spec)?;
                }
            }
            Command::RequestPortals => {}
            Command::SendVersion { version } => w.put_str("version", version)?,
            Command::SendPortal(spec) => put_portal(&mut w, spec)?,
            Command::RemovePortal { portal } => w.put_str("portal", portal)?,
        }

        Ok(w.finish())
    }

    /// Parses a frame. Trailing bytes after the last declared field are ignored.
    pub fn decode(frame: &[u8]) -> Result<Self, CodecError> {
        let mut r = FrameReader::new(frame);
        let tag = r.read_str("tag")?;
        let tag = CommandTag::from_str(&tag).map_err(|_| CodecError::UnknownTag(tag))?;

        let command = match tag {
            CommandTag::TeleportPlayer => Command::TeleportPlayer {
                player: r.read_str("player")?,
                destination_server: r.read_str("destination_server")?,
                destination: r.read_str("destination")?,
                has_permission: r.read_bool("has_permission")?,
            },
            CommandTag::ListPortals => Command::ListPortals {
                player: r.read_str("player")?,
            },
            CommandTag::DeletePortal => Command::DeletePortal {
                player: r.read_str("player")?,
                portal: r.read_str("portal")?,
            },
            CommandTag::SetPortal => {
                let player = r.read_str("player")?;
                let selection = if r.read_bool("selection")? {
                    Some(read_portal(&mut r)?)
                } else {
                    None
                };
                Command::SetPortal { player, selection }
            }
            CommandTag::RequestPortals => Command::RequestPortals,
            CommandTag::SendVersion => Command::SendVersion {
                version: r.read_str("version")?,
            },
            CommandTag::SendPortal => Command::SendPortal(read_portal(&mut r)?),
            CommandTag::RemovePortal => Command::RemovePortal {
                portal: r.read_str("portal")?,
            },
        };

        Ok(command)
    }
}

fn put_portal(w: &mut FrameWriter, spec: &PortalSpec) -> Result<(), CodecError> {
    w.put_str("portal", &spec.name)?;
    w.put_str("type", &spec.kind)?;
    w.put_str("destination", &spec.destination)?;
    w.put_str("fill", &spec.fill)?;
    put_location(w, "world", &spec.min)?;
    put_location(w, "world2", &spec.max)
}

fn put_location(w: &mut FrameWriter, field: &'static str, loc: &Location) -> Result<(), CodecError> {
    w.put_str(field, &loc.world)?;
    w.put_f64(loc.x);
    w.put_f64(loc.y);
    w.put_f64(loc.z);
    Ok(())
}

fn read_portal(r: &mut FrameReader<'_>) -> Result<PortalSpec, CodecError> {
    Ok(PortalSpec {
        name: r.read_str("portal")?,
        kind: r.read_str("type")?,
        destination: r.read_str("destination")?,
        fill: r.read_str("fill")?,
        min: Location {
            world: r.read_str("world")?,
            x: r.read_f64("x1")?,
            y: r.read_f64("y1")?,
            z: r.read_f64("z1")?,
        },
        max: Location {
            world: r.read_str("world2")?,
            x: r.read_f64("x2")?,
            y: r.read_f64("y2")?,
            z: r.read_f64("z2")?,
        },
    })
}
