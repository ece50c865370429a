//! Error types for the watcher.

use std::path::PathBuf;
use thiserror::Error;

/// Result type for watcher operations.
pub type WatchResult<T> = Result<T, WatchError>;

/// Errors that stop a watcher from starting.
///
/// Once running, the watcher logs and skips failures instead of returning
/// them, so these only surface from construction.
#[derive(Error, Debug)]
pub enum WatchError {
    /// The root directory cannot be opened.
    #[error("cannot open root {path:?}: {source}")]
    RootUnavailable {
        /// The configured root.
        path: PathBuf,
        /// Underlying failure.
        source: std::io::Error,
    },

    /// The root exists but is not a directory.
    #[error("root {0:?} is not a directory")]
    NotADirectory(PathBuf),

    /// The root could not be registered with the notification backend.
    #[error("cannot watch root {0:?}")]
    RootNotWatched(PathBuf),

    /// The notification backend failed to initialize.
    #[error("watch backend error: {0}")]
    Backend(#[from] notify::Error),
}
