//! Error types for the sync server.

use dirmirror_protocol::ProtocolError;
use dirmirror_watcher::WatchError;
use std::net::SocketAddr;
use thiserror::Error;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that can occur in the sync server.
#[derive(Error, Debug)]
pub enum ServerError {
    /// The listening socket could not be bound.
    #[error("cannot bind {addr}: {source}")]
    Bind {
        /// Requested address.
        addr: SocketAddr,
        /// Underlying failure.
        source: std::io::Error,
    },

    /// The watched root could not be opened.
    #[error("watcher error: {0}")]
    Watch(#[from] WatchError),

    /// A peer sent a malformed frame.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// A peer did not complete the handshake in time.
    #[error("handshake timed out")]
    HandshakeTimeout,

    /// A peer's first frame was not a handshake.
    #[error("expected handshake, got {0}")]
    UnexpectedFrame(String),

    /// A peer closed the connection before the handshake.
    #[error("connection closed during handshake")]
    ClosedDuringHandshake,

    /// The registry is full.
    #[error("session limit of {0} reached")]
    SessionLimit(usize),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServerError {
    /// Returns true if this error ends only the affected session.
    pub fn is_session_error(&self) -> bool {
        matches!(
            self,
            ServerError::Protocol(_)
                | ServerError::HandshakeTimeout
                | ServerError::UnexpectedFrame(_)
                | ServerError::ClosedDuringHandshake
                | ServerError::SessionLimit(_)
                | ServerError::Io(_)
        )
    }

    /// Returns true if this error stops the server.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ServerError::Bind { .. } | ServerError::Watch(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_classification() {
        assert!(ServerError::HandshakeTimeout.is_session_error());
        assert!(!ServerError::HandshakeTimeout.is_fatal());
        assert!(ServerError::Protocol(ProtocolError::UnknownTag(b'Q')).is_session_error());

        let bind = ServerError::Bind {
            addr: SocketAddr::from(([127, 0, 0, 1], 1)),
            source: std::io::Error::from(std::io::ErrorKind::AddrInUse),
        };
        assert!(bind.is_fatal());
        assert!(!bind.is_session_error());
    }

    #[test]
    fn error_display() {
        let msg = ServerError::SessionLimit(8).to_string();
        assert!(msg.contains('8'));
    }
}
