//! Fan-out of sync messages to admitted sessions.

use crate::error::ServerResult;
use crate::registry::{ClientRegistry, Enqueue};
use dirmirror_protocol::{encode_frame, Frame, SyncMessage};
use std::sync::Arc;
use tracing::{debug, warn};

/// Per-message delivery counts.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Sessions the frame was queued for.
    pub delivered: usize,
    /// Sessions whose ignore rules suppressed the frame.
    pub filtered: usize,
    /// Sessions disconnected because their queue was full or closed.
    pub dropped: usize,
}

/// Encodes each message once and queues it for every interested session.
#[derive(Debug, Clone)]
pub struct Broadcaster {
    registry: Arc<ClientRegistry>,
}

impl Broadcaster {
    /// Creates a broadcaster over `registry`.
    pub fn new(registry: Arc<ClientRegistry>) -> Self {
        Self { registry }
    }

    /// Returns the registry this broadcaster publishes to.
    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    /// Publishes one message.
    ///
    /// Never waits on a session: a session that cannot take the frame
    /// immediately is removed from the registry.
    pub fn broadcast(&self, message: &SyncMessage) -> ServerResult<BroadcastReport> {
        let frame = encode_frame(&Frame::Sync(message.clone()))?;
        let mut report = BroadcastReport::default();

        for session in self.registry.snapshot() {
            if session.rules().suppresses(message) {
                report.filtered += 1;
                continue;
            }
            match session.enqueue(frame.clone()) {
                Enqueue::Queued => report.delivered += 1,
                Enqueue::Full => {
                    warn!(session = %session.id(), peer = %session.peer(), "queue full, disconnecting");
                    self.registry.remove(session.id());
                    report.dropped += 1;
                }
                Enqueue::Closed => {
                    self.registry.remove(session.id());
                    report.dropped += 1;
                }
            }
        }

        debug!(
            tag = ?message.tag(),
            path = message.path(),
            delivered = report.delivered,
            filtered = report.filtered,
            dropped = report.dropped,
            "broadcast"
        );
        Ok(report)
    }
}
