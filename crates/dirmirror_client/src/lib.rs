//! # dirmirror client
//!
//! The receiving side of dirmirror.
//!
//! This crate provides:
//! - Client state machine (connecting → handshake → streaming → closed)
//! - Connection retry with exponential backoff
//! - `MirrorApplier`, which replays sync messages onto a local directory
//!
//! ## Key Invariants
//!
//! - The server is authoritative; the mirror never sends changes back
//! - Frames are applied one at a time in arrival order
//! - Applying a message twice leaves the same tree as applying it once
//! - No message can touch anything outside the mirror root
//! - A frame that cannot be applied is dropped; only protocol errors end
//!   the connection

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod applier;
mod config;
mod error;
mod state;

pub use applier::{ApplyStats, MirrorApplier, TEMP_PREFIX};
pub use config::{ClientConfig, RetryConfig, MAX_RETRY_DELAY};
pub use error::{ApplyError, ApplyResult, ClientError, ClientResult};
pub use state::{ClientState, MirrorClient};
