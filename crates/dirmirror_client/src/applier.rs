//! Replays sync messages onto the local mirror.

use crate::error::{ApplyError, ApplyResult};
use dirmirror_protocol::{path, SyncMessage};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

/// Prefix of the temporary files used for atomic writes.
pub const TEMP_PREFIX: &str = ".dirmirror-";

/// Counters kept by a [`MirrorApplier`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyStats {
    /// Messages that reached the filesystem.
    pub applied: u64,
    /// Messages dropped as unusable (unsafe path, missing move source).
    pub rejected: u64,
    /// Messages the filesystem refused.
    pub failed: u64,
}

/// Applies messages under a fixed mirror root.
///
/// Every operation is idempotent with respect to the end state: creating
/// something that exists overwrites or keeps it, deleting something absent
/// succeeds.
#[derive(Debug)]
pub struct MirrorApplier {
    root: PathBuf,
    applied: AtomicU64,
    rejected: AtomicU64,
    failed: AtomicU64,
}

impl MirrorApplier {
    /// Opens `root`, creating it if needed.
    pub fn open(root: impl AsRef<Path>) -> ApplyResult<Self> {
        let root = root.as_ref();
        let display = root.to_string_lossy().into_owned();
        fs::create_dir_all(root).map_err(|e| ApplyError::io(display.clone(), e))?;
        let root = root
            .canonicalize()
            .map_err(|e| ApplyError::io(display, e))?;
        Ok(Self {
            root,
            applied: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        })
    }

    /// Returns the mirror root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the counters so far.
    pub fn stats(&self) -> ApplyStats {
        ApplyStats {
            applied: self.applied.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }

    /// Applies one message and records the outcome in the counters.
    pub fn handle(&self, message: &SyncMessage) -> ApplyResult<()> {
        let result = self.apply(message);
        let counter = match &result {
            Ok(()) => &self.applied,
            Err(e) if e.is_rejection() => &self.rejected,
            Err(_) => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        result
    }

    /// Applies one message.
    pub fn apply(&self, message: &SyncMessage) -> ApplyResult<()> {
        match message {
            SyncMessage::CreateDir { path } => {
                let target = self.resolve(path)?;
                fs::create_dir_all(&target).map_err(|e| ApplyError::io(path.as_str(), e))?;
                debug!(path = %path, "created directory");
            }
            SyncMessage::CreateFile { path, content, .. } => {
                let target = self.resolve(path)?;
                self.write_file(path, &target, content)
                    .map_err(|e| ApplyError::io(path.as_str(), e))?;
                debug!(path = %path, bytes = content.len(), "wrote file");
            }
            SyncMessage::DeleteFile { path } | SyncMessage::DeleteDir { path } => {
                let target = self.resolve(path)?;
                if remove_entry(&target).map_err(|e| ApplyError::io(path.as_str(), e))? {
                    debug!(path = %path, "removed");
                }
            }
            SyncMessage::Move { from, to } => {
                let source = self.resolve(from)?;
                let dest = self.resolve(to)?;
                match fs::symlink_metadata(&source) {
                    Ok(_) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {
                        return Err(ApplyError::MissingSource { path: from.clone() });
                    }
                    Err(e) => return Err(ApplyError::io(from.as_str(), e)),
                }
                if let Some(parent) = dest.parent() {
                    fs::create_dir_all(parent).map_err(|e| ApplyError::io(to.as_str(), e))?;
                }
                fs::rename(&source, &dest).map_err(|e| ApplyError::io(to.as_str(), e))?;
                debug!(from = %from, to = %to, "moved");
            }
        }
        Ok(())
    }

    fn resolve(&self, wire: &str) -> ApplyResult<PathBuf> {
        path::resolve(&self.root, wire).map_err(ApplyError::UnsafePath)
    }

    /// Writes through a temp file in the target directory, then renames it
    /// over the target. Falls back to writing in place if the rename fails.
    fn write_file(&self, wire: &str, target: &Path, content: &[u8]) -> io::Result<()> {
        let parent = target.parent().unwrap_or(&self.root);
        fs::create_dir_all(parent)?;

        let mut temp = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .tempfile_in(parent)?;
        temp.write_all(content)?;
        temp.as_file().sync_all()?;

        match temp.persist(target) {
            Ok(_) => Ok(()),
            Err(e) => {
                warn!(path = %wire, error = %e.error, "atomic replace failed, writing in place");
                drop(e.file);
                fs::write(target, content)
            }
        }
    }
}

/// Removes whatever is at `target`. Returns false if nothing was there.
fn remove_entry(target: &Path) -> io::Result<bool> {
    let metadata = match fs::symlink_metadata(target) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };
    let removed = if metadata.is_dir() {
        fs::remove_dir_all(target)
    } else {
        fs::remove_file(target)
    };
    match removed {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}
