//! Error types for the mirror client.

use dirmirror_protocol::ProtocolError;
use thiserror::Error;

/// Result type for client operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// Result type for applying a single message.
pub type ApplyResult<T> = Result<T, ApplyError>;

/// Errors that end a client run.
#[derive(Error, Debug)]
pub enum ClientError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// The server sent a malformed frame.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The server sent a handshake frame while streaming.
    #[error("unexpected handshake from server")]
    UnexpectedHandshake,

    /// Every connection attempt failed.
    #[error("gave up after {attempts} connection attempts: {last_error}")]
    RetriesExhausted {
        /// Attempts made.
        attempts: u32,
        /// Error from the final attempt.
        last_error: String,
    },

    /// The mirror root could not be prepared.
    #[error("mirror root: {0}")]
    Apply(#[from] ApplyError),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ClientError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Transport { retryable, .. } => *retryable,
            _ => false,
        }
    }
}

/// Errors from replaying one message onto the mirror.
///
/// None of these end the stream; the frame is dropped and counted.
#[derive(Error, Debug)]
pub enum ApplyError {
    /// The message named a path outside the mirror root.
    #[error("rejected path: {0}")]
    UnsafePath(#[source] ProtocolError),

    /// A move whose source does not exist on the mirror.
    #[error("move source missing: {path}")]
    MissingSource {
        /// Wire path of the missing source.
        path: String,
    },

    /// Filesystem error.
    #[error("io error on {path}: {source}")]
    Io {
        /// Wire path being applied.
        path: String,
        /// Underlying failure.
        source: std::io::Error,
    },
}

impl ApplyError {
    pub(crate) fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Returns true if the message itself was unusable, as opposed to the
    /// filesystem refusing it.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            ApplyError::UnsafePath(_) | ApplyError::MissingSource { .. }
        )
    }
}
