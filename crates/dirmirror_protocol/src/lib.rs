//! # dirmirror protocol
//!
//! Wire types and codecs shared by the dirmirror server and its mirrors.
//!
//! This crate provides:
//! - `SyncMessage`, the five filesystem operations streamed to mirrors
//! - `Frame`, the unit on the wire (a handshake or a sync message)
//! - A length-prefixed binary codec, one-shot and incremental
//! - `path`: normalization and root-confinement of relative wire paths
//! - `IgnoreRules`, the per-peer extension filter sent in the handshake
//!
//! This is a pure protocol crate with no I/O operations.
//!
//! ## Frame layout
//!
//! ```text
//! [tag: u8][field count: u32 BE]{ [len: u32 BE][len bytes] } * count
//! ```
//!
//! File content travels as a single length-prefixed field, so payload bytes
//! are never scanned for delimiters.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod codec;
mod error;
mod ignore;
mod message;
pub mod path;

pub use codec::{decode_frame, encode_frame, FrameDecoder, FrameLimits, DEFAULT_MAX_FIELD_LEN};
pub use error::{ProtocolError, ProtocolResult};
pub use ignore::{IgnoreRules, RULE_SEPARATOR};
pub use message::{Frame, FrameTag, SyncMessage};
