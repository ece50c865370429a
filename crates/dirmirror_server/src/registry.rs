//! Admitted sessions and their outbound queues.

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use bytes::Bytes;
use dirmirror_protocol::IgnoreRules;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Identifier assigned to a session at admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    /// Returns the numeric id.
    pub fn as_raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// Outcome of offering a frame to a session queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Enqueue {
    Queued,
    Full,
    Closed,
}

/// A mirror admitted into the broadcast set.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    peer: String,
    rules: IgnoreRules,
    outbox: mpsc::Sender<Bytes>,
    alive: AtomicBool,
    shutdown: watch::Sender<bool>,
}

impl Session {
    /// Returns the session id.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Returns the peer address as reported at accept time.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Returns the ignore rules the peer sent in its handshake.
    pub fn rules(&self) -> &IgnoreRules {
        &self.rules
    }

    /// Returns false once the session has been removed from the registry.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Resolves once the session has been released.
    pub async fn closed(&self) {
        let mut rx = self.shutdown.subscribe();
        let _ = rx.wait_for(|released| *released).await;
    }

    pub(crate) fn enqueue(&self, frame: Bytes) -> Enqueue {
        if !self.is_alive() {
            return Enqueue::Closed;
        }
        match self.outbox.try_send(frame) {
            Ok(()) => Enqueue::Queued,
            Err(TrySendError::Full(_)) => Enqueue::Full,
            Err(TrySendError::Closed(_)) => Enqueue::Closed,
        }
    }

    fn release(&self) {
        self.alive.store(false, Ordering::Release);
        self.shutdown.send_replace(true);
    }
}

/// The set of live sessions.
///
/// Admission spawns a sender task per session that drains its queue into
/// the socket. Removal is idempotent: only the first caller for a given id
/// receives the session back, and only that call releases it.
#[derive(Debug)]
pub struct ClientRegistry {
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
    next_id: AtomicU64,
    max_sessions: usize,
    queue_capacity: usize,
    send_timeout: Duration,
}

impl ClientRegistry {
    /// Creates an empty registry.
    pub fn new(max_sessions: usize, queue_capacity: usize, send_timeout: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            max_sessions,
            queue_capacity: queue_capacity.max(1),
            send_timeout,
        }
    }

    /// Creates a registry sized from a server configuration.
    pub fn from_config(config: &ServerConfig) -> Self {
        Self::new(
            config.max_sessions,
            config.session_queue_capacity,
            config.send_timeout,
        )
    }

    /// Admits a session and starts its sender task on `writer`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn admit<W>(
        self: &Arc<Self>,
        peer: impl Into<String>,
        rules: IgnoreRules,
        writer: W,
    ) -> ServerResult<Arc<Session>>
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let (shutdown, _) = watch::channel(false);

        let session = {
            let mut sessions = self.sessions.write();
            if sessions.len() >= self.max_sessions {
                return Err(ServerError::SessionLimit(self.max_sessions));
            }
            let id = SessionId(self.next_id.fetch_add(1, Ordering::Relaxed));
            let session = Arc::new(Session {
                id,
                peer: peer.into(),
                rules,
                outbox: tx,
                alive: AtomicBool::new(true),
                shutdown,
            });
            sessions.insert(id, Arc::clone(&session));
            session
        };

        info!(
            session = %session.id,
            peer = %session.peer,
            rules = %session.rules.to_wire(),
            "session admitted"
        );

        tokio::spawn(drain_outbox(
            Arc::clone(self),
            Arc::clone(&session),
            rx,
            writer,
            self.send_timeout,
        ));

        Ok(session)
    }

    /// Removes a session, returning it only to the first caller.
    pub fn remove(&self, id: SessionId) -> Option<Arc<Session>> {
        let removed = self.sessions.write().remove(&id);
        if let Some(session) = &removed {
            session.release();
            info!(session = %id, peer = %session.peer, "session released");
        }
        removed
    }

    /// Returns the sessions live at this instant.
    pub fn snapshot(&self) -> Vec<Arc<Session>> {
        let mut sessions: Vec<_> = self.sessions.read().values().cloned().collect();
        sessions.sort_by_key(|s| s.id);
        sessions
    }

    /// Returns the number of live sessions.
    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    /// Returns true if no session is live.
    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Returns true if no further session can be admitted.
    pub fn is_full(&self) -> bool {
        self.len() >= self.max_sessions
    }

    /// Returns the session limit.
    pub fn max_sessions(&self) -> usize {
        self.max_sessions
    }
}

async fn drain_outbox<W>(
    registry: Arc<ClientRegistry>,
    session: Arc<Session>,
    mut rx: mpsc::Receiver<Bytes>,
    mut writer: W,
    send_timeout: Duration,
) where
    W: AsyncWrite + Unpin + Send + 'static,
{
    loop {
        let frame = tokio::select! {
            _ = session.closed() => break,
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        let write = async {
            writer.write_all(&frame).await?;
            writer.flush().await
        };
        match tokio::time::timeout(send_timeout, write).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(session = %session.id, error = %e, "send failed");
                break;
            }
            Err(_) => {
                warn!(session = %session.id, timeout = ?send_timeout, "send timed out");
                break;
            }
        }
    }

    registry.remove(session.id);
    let _ = writer.shutdown().await;
    debug!(session = %session.id, "sender stopped");
}
