//! # dirmirror server
//!
//! The authoritative side of dirmirror.
//!
//! This crate provides:
//! - `SyncServer`: watcher pipeline plus TCP accept loop
//! - `ClientRegistry`: the set of admitted sessions and their ignore rules
//! - `Broadcaster`: per-message fan-out with per-session filtering
//!
//! # Architecture
//!
//! ```text
//! DirectoryWatcher ─► EventTranslator ─► Broadcaster ─┬─► queue ─► sender task ─► peer 1
//!                                                     └─► queue ─► sender task ─► peer N
//! ```
//!
//! Each session has a bounded outbound queue drained by its own task. A
//! session whose queue overflows, or whose socket stalls past the send
//! timeout, is disconnected; the others never wait on it.
//!
//! # Protocol
//!
//! 1. A mirror connects and sends an `I` frame with its ignore rules
//! 2. The server admits the session into the broadcast set
//! 3. Every subsequent change under the root is streamed as one frame
//!
//! There is no catch-up: a mirror only sees changes made after it joined.

#![deny(unsafe_code)]
#![warn(missing_docs)]
// Production code MUST NOT use panic!/unwrap()/expect()
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod broadcaster;
mod config;
mod error;
mod registry;
mod server;

pub use broadcaster::{BroadcastReport, Broadcaster};
pub use config::ServerConfig;
pub use error::{ServerError, ServerResult};
pub use registry::{ClientRegistry, Session, SessionId};
pub use server::SyncServer;
