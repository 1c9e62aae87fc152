// src/core/channel/envelope.rs

//! The wrapper put around every frame published on a channel.
//!
//! Layout: sender connection key (u64 BE), origin server name, target server
//! name (empty for a broadcast), then the frame bytes up to the end of the payload.

use crate::core::command::{CodecError, FrameReader, FrameWriter};
use bytes::Bytes;

#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Connection key of the publishing process.
    pub sender: u64,
    /// Server name of the publishing process.
    pub origin: String,
    /// `None` addresses every server on the channel.
    pub target: Option<String>,
    pub frame: Bytes,
}

impl Envelope {
    pub fn encode(&self) -> Result<Bytes, CodecError> {
        let target = self.target.as_deref().unwrap_or_default();
        let mut w = FrameWriter::with_capacity(8 + 4 + self.origin.len() + target.len() + self.frame.len());
        w.put_u64(self.sender);
        w.put_str("origin", &self.origin)?;
        w.put_str("target", target)?;
        w.put_raw(&self.frame);
        Ok(w.finish())
    }

    pub fn decode(payload: &Bytes) -> Result<Self, CodecError> {
        let mut r = FrameReader::new(payload);
        let sender = r.read_u64("sender")?;
        let origin = r.read_str("origin")?;
        let target = r.read_str("target")?;
        let frame = payload.slice(payload.len() - r.remaining()..);
        Ok(Self {
            sender,
            origin,
            target: (!target.is_empty()).then_some(target),
            frame,
        })
    }

    /// Whether a server called `server_name` should process this envelope.
    pub fn is_addressed_to(&self, server_name: &str) -> bool {
        self.target.as_deref().is_none_or(|target| target == server_name)
    }
}
