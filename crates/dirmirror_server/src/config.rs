//! Server configuration.

use dirmirror_protocol::FrameLimits;
use dirmirror_watcher::DEFAULT_RENAME_WINDOW;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the sync server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Directory tree to mirror.
    pub root: PathBuf,
    /// Maximum concurrent sessions.
    pub max_sessions: usize,
    /// Frames buffered per session before it is disconnected.
    pub session_queue_capacity: usize,
    /// Longest a single frame write may take before the session is dropped.
    pub send_timeout: Duration,
    /// Time a new connection has to send its handshake.
    pub handshake_timeout: Duration,
    /// How long a rename source waits for its destination.
    pub rename_window: Duration,
    /// Interval at which unpaired rename sources are expired.
    pub expiry_tick: Duration,
    /// Limits applied to inbound frames.
    pub limits: FrameLimits,
}

impl ServerConfig {
    /// Creates a new server configuration.
    pub fn new(bind_addr: SocketAddr, root: impl Into<PathBuf>) -> Self {
        Self {
            bind_addr,
            root: root.into(),
            max_sessions: 64,
            session_queue_capacity: 256,
            send_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(10),
            rename_window: DEFAULT_RENAME_WINDOW,
            expiry_tick: Duration::from_millis(100),
            limits: FrameLimits::default(),
        }
    }

    /// Sets the maximum concurrent sessions.
    pub fn with_max_sessions(mut self, max: usize) -> Self {
        self.max_sessions = max;
        self
    }

    /// Sets the per-session queue capacity.
    pub fn with_session_queue_capacity(mut self, capacity: usize) -> Self {
        self.session_queue_capacity = capacity.max(1);
        self
    }

    /// Sets the per-frame send timeout.
    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    /// Sets the handshake timeout.
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Sets the rename correlation window.
    pub fn with_rename_window(mut self, window: Duration) -> Self {
        self.rename_window = window;
        self
    }

    /// Sets the inbound frame limits.
    pub fn with_limits(mut self, limits: FrameLimits) -> Self {
        self.limits = limits;
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new(SocketAddr::from(([127, 0, 0, 1], 7878)), ".")
    }
}
