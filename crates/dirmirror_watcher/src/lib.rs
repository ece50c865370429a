//! # dirmirror watcher
//!
//! Turns filesystem activity under a root directory into [`SyncMessage`]s.
//!
//! This crate provides:
//! - `DirectoryWatcher`: one non-recursive watch per directory, a table
//!   from watch handle to directory path, and a stream of `RawEvent`s
//! - `EventTranslator`: raw events to sync messages, with rename pairs
//!   correlated by the notification cookie rather than by arrival order
//! - `WatchSet`: the seam between the two, with an in-memory implementation
//!   for tests
//!
//! ## Pipeline
//!
//! ```text
//! notify backend ──► DirectoryWatcher::next_event ──► EventTranslator::translate
//!                          ▲                                  │
//!                          └──── watch_tree / unwatch_tree ◄──┘
//! ```
//!
//! [`SyncMessage`]: dirmirror_protocol::SyncMessage

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod error;
mod translator;
mod watcher;

pub use error::{WatchError, WatchResult};
pub use translator::{EventTranslator, PendingRename, DEFAULT_RENAME_WINDOW};
pub use watcher::{
    DirectoryWatcher, MemoryWatchSet, RawEvent, RawEventKind, WatchEntry, WatchHandle, WatchSet,
    WatchTable,
};
