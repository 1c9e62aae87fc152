// src/core/router/handler.rs

use super::{ActionRouter, Outbound, Target};
use crate::core::SyncError;
use crate::core::channel::{ChannelDispatcher, ChannelHandler, ChannelMessage};
use crate::core::command::Command;
use crate::core::metrics;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// The responses to one routed frame, addressed relative to its origin.
struct Reply {
    origin: String,
    outbound: Vec<Outbound>,
}

/// Decodes frames on the portals channel, routes them and publishes the replies.
///
/// Replies go through a single publisher task, so they leave in the order their
/// frames were routed.
pub struct PortalsHandler {
    router: Arc<ActionRouter>,
    replies: mpsc::UnboundedSender<Reply>,
}

impl PortalsHandler {
    /// Spawns the publisher task; must be called inside a tokio runtime.
    pub fn new(
        router: Arc<ActionRouter>,
        dispatcher: &Arc<ChannelDispatcher>,
        channel: impl Into<String>,
    ) -> Self {
        let (replies, rx) = mpsc::unbounded_channel();
        tokio::spawn(publish_replies(Arc::downgrade(dispatcher), channel.into(), rx));
        Self { router, replies }
    }
}

/// Runs until the handler is dropped or the dispatcher is gone.
async fn publish_replies(
    dispatcher: Weak<ChannelDispatcher>,
    channel: String,
    mut rx: mpsc::UnboundedReceiver<Reply>,
) {
    while let Some(Reply { origin, outbound }) = rx.recv().await {
        let Some(dispatcher) = dispatcher.upgrade() else {
            trace!("Dispatcher is gone, dropping {} response(s).", outbound.len());
            break;
        };
        for Outbound { target, command } in outbound {
            let sent = match target {
                Target::Origin => dispatcher.send_to(&channel, &origin, &command).await,
                Target::Broadcast => dispatcher.send(&channel, &command).await,
            };
            if !sent {
                warn!("Failed to send {} on '{}'.", command.tag(), channel);
            }
        }
    }
    debug!("Reply publisher for '{}' stopped.", channel);
}

impl ChannelHandler for PortalsHandler {
    fn handle(&self, message: &ChannelMessage) -> Result<(), SyncError> {
        let command = Command::decode(&message.frame).inspect_err(|_| {
            metrics::DECODE_FAILURES_TOTAL.inc();
        })?;

        let outbound = self.router.route(&message.origin, command);
        if outbound.is_empty() {
            return Ok(());
        }
        let reply = Reply {
            origin: message.origin.clone(),
            outbound,
        };
        if let Err(mpsc::error::SendError(reply)) = self.replies.send(reply) {
            trace!(
                "Reply publisher is gone, dropping {} response(s).",
                reply.outbound.len()
            );
        }
        Ok(())
    }
}
