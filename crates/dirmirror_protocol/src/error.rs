//! Error types for the protocol crate.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while decoding frames or validating wire paths.
///
/// Every decoding error is connection-fatal for the peer that produced the
/// bytes: the stream cannot be resynchronized mid-frame.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The frame tag is not one of the known operation tags.
    #[error("unknown frame tag 0x{0:02x}")]
    UnknownTag(u8),

    /// The declared field count does not match the tag's arity.
    #[error("frame '{tag}' declares {actual} fields, expected {expected}")]
    FieldCount {
        /// Frame tag as a character.
        tag: char,
        /// Expected field count.
        expected: u32,
        /// Declared field count.
        actual: u32,
    },

    /// A field length prefix exceeds the configured maximum.
    #[error("field length {claimed} exceeds limit of {max_allowed} bytes")]
    FieldTooLarge {
        /// Length declared by the peer.
        claimed: u64,
        /// Configured maximum.
        max_allowed: u64,
    },

    /// The buffer ended before the declared frame did.
    #[error("frame truncated: needed {needed} more bytes")]
    Truncated {
        /// Bytes still missing.
        needed: usize,
    },

    /// Bytes remained after a complete frame in a one-shot decode.
    #[error("{0} trailing bytes after frame")]
    TrailingBytes(usize),

    /// A path or rule field is not valid UTF-8.
    #[error("field {field} is not valid UTF-8")]
    InvalidUtf8 {
        /// Name of the offending field.
        field: &'static str,
    },

    /// The size field is malformed or disagrees with the content length.
    #[error("size field {declared} does not match content length {actual}")]
    SizeMismatch {
        /// Declared size.
        declared: u64,
        /// Actual content length.
        actual: u64,
    },

    /// The size field is not an 8-byte big-endian integer.
    #[error("size field has {0} bytes, expected 8")]
    MalformedSize(usize),

    /// A path is absolute, escapes its root, or is otherwise unusable.
    #[error("unsafe path {path:?}: {reason}")]
    UnsafePath {
        /// The rejected path.
        path: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// A field is too large to be described by a u32 length prefix.
    #[error("field of {0} bytes cannot be framed")]
    Unframeable(usize),
}

impl ProtocolError {
    /// Creates an unsafe path error.
    pub fn unsafe_path(path: impl Into<String>, reason: &'static str) -> Self {
        Self::UnsafePath {
            path: path.into(),
            reason,
        }
    }
}
