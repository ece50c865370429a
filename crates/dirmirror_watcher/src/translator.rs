//! Raw events to sync messages.

use crate::watcher::{RawEvent, RawEventKind, WatchSet};
use dirmirror_protocol::{path, SyncMessage, DEFAULT_MAX_FIELD_LEN};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// How long a rename source waits for its destination.
pub const DEFAULT_RENAME_WINDOW: Duration = Duration::from_millis(250);

/// A rename source awaiting its destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRename {
    /// Wire path the entry left.
    pub from: String,
    /// Absolute path the entry left.
    pub from_abs: PathBuf,
    /// Whether the entry is a directory.
    pub is_dir: bool,
    /// When the source is treated as moved out of the tree.
    pub deadline: Instant,
}

impl PendingRename {
    fn into_delete(self) -> SyncMessage {
        if self.is_dir {
            SyncMessage::DeleteDir { path: self.from }
        } else {
            SyncMessage::DeleteFile { path: self.from }
        }
    }
}

/// Translates [`RawEvent`]s into [`SyncMessage`]s.
///
/// Rename halves are paired by their correlation token. A source left
/// unpaired past the rename window becomes a delete; a destination with no
/// known source becomes a create.
///
/// Files larger than the configured maximum are logged and never sent, so
/// one oversized file cannot push a frame past what mirrors accept.
#[derive(Debug)]
pub struct EventTranslator {
    root: PathBuf,
    rename_window: Duration,
    max_file_len: u64,
    pending: HashMap<usize, PendingRename>,
}

impl EventTranslator {
    /// Creates a translator for paths under `root`.
    pub fn new(root: impl Into<PathBuf>, rename_window: Duration) -> Self {
        Self {
            root: root.into(),
            rename_window,
            max_file_len: u64::from(DEFAULT_MAX_FIELD_LEN),
            pending: HashMap::new(),
        }
    }

    /// Sets the largest file, in bytes, that is announced with its content.
    pub fn with_max_file_len(mut self, max: u64) -> Self {
        self.max_file_len = max;
        self
    }

    /// Returns the largest file that is announced.
    pub fn max_file_len(&self) -> u64 {
        self.max_file_len
    }

    /// Returns the number of unpaired rename sources.
    pub fn pending_renames(&self) -> usize {
        self.pending.len()
    }

    /// Returns the earliest pending deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|p| p.deadline).min()
    }

    /// Handles one event as the pipeline sees it: expired rename sources
    /// first, then any source whose name the event reuses, then the event.
    pub fn process<W: WatchSet>(
        &mut self,
        event: RawEvent,
        watches: &mut W,
        now: Instant,
    ) -> Vec<SyncMessage> {
        let mut messages = self.expire_pending(watches, now);
        if matches!(event.kind, RawEventKind::Created | RawEventKind::RenamedTo) {
            if let Some(parent) = watches.resolve(event.parent) {
                messages.extend(self.retire_reused(&parent.join(&event.name), event.token));
            }
        }
        messages.extend(self.translate(event, watches, now));
        messages
    }

    /// Translates one event.
    ///
    /// Never fails: unreadable files degrade to empty `CreateFile`s, while
    /// oversized files and events with unusable paths are logged and
    /// dropped.
    pub fn translate<W: WatchSet>(
        &mut self,
        event: RawEvent,
        watches: &mut W,
        now: Instant,
    ) -> Option<SyncMessage> {
        let Some(parent) = watches.resolve(event.parent) else {
            debug!(handle = %event.parent, "event for a released watch");
            return None;
        };
        let abs = parent.join(&event.name);
        let wire = self.wire_path(&abs)?;

        match event.kind {
            RawEventKind::Created => self.creation(wire, &abs, event.is_dir),
            RawEventKind::Written => self.rewritten(wire, &abs),
            RawEventKind::Deleted => {
                self.pending.retain(|_, p| p.from_abs != abs);
                Some(if event.is_dir {
                    SyncMessage::DeleteDir { path: wire }
                } else {
                    SyncMessage::DeleteFile { path: wire }
                })
            }
            RawEventKind::RenamedFrom => {
                let pending = PendingRename {
                    from: wire,
                    from_abs: abs,
                    is_dir: event.is_dir,
                    deadline: now + self.rename_window,
                };
                let Some(token) = event.token else {
                    return Some(self.moved_out(pending, watches));
                };
                self.pending
                    .insert(token, pending)
                    .map(|stale| self.moved_out(stale, watches))
            }
            RawEventKind::RenamedTo => {
                let source = event.token.and_then(|t| self.pending.remove(&t));
                match source {
                    Some(source) => {
                        let message = SyncMessage::Move {
                            from: source.from,
                            to: wire,
                        };
                        if source.is_dir || event.is_dir {
                            let released = watches.unwatch_tree(&source.from_abs);
                            let registered = watches.watch_tree(&abs);
                            debug!(released, registered, to = %abs.display(), "re-rooted moved directory");
                        }
                        Some(message)
                    }
                    None => {
                        let message = self.creation(wire, &abs, event.is_dir);
                        if matches!(message, Some(SyncMessage::CreateDir { .. })) {
                            watches.watch_tree(&abs);
                        }
                        message
                    }
                }
            }
        }
    }

    /// Turns rename sources whose window has closed into deletes, oldest
    /// first.
    pub fn expire_pending<W: WatchSet>(&mut self, watches: &mut W, now: Instant) -> Vec<SyncMessage> {
        let expired: Vec<usize> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(token, _)| *token)
            .collect();

        let mut sources: Vec<PendingRename> = expired
            .into_iter()
            .filter_map(|token| self.pending.remove(&token))
            .collect();
        sources.sort_by_key(|p| p.deadline);

        sources
            .into_iter()
            .map(|source| self.moved_out(source, watches))
            .collect()
    }

    fn moved_out<W: WatchSet>(&self, source: PendingRename, watches: &mut W) -> SyncMessage {
        if source.is_dir {
            watches.unwatch_tree(&source.from_abs);
        }
        debug!(path = %source.from, "rename source left the tree");
        source.into_delete()
    }

    /// Sources that left `abs` are gone for good once something else takes
    /// the name. Their watches were already handed over to the newcomer.
    fn retire_reused(&mut self, abs: &Path, token: Option<usize>) -> Vec<SyncMessage> {
        let reused: Vec<usize> = self
            .pending
            .iter()
            .filter(|(t, p)| p.from_abs == abs && token != Some(**t))
            .map(|(t, _)| *t)
            .collect();
        let mut sources: Vec<PendingRename> = reused
            .into_iter()
            .filter_map(|t| self.pending.remove(&t))
            .collect();
        sources.sort_by_key(|p| p.deadline);
        sources
            .into_iter()
            .map(|source| {
                debug!(path = %source.from, "rename source name reused");
                source.into_delete()
            })
            .collect()
    }

    /// Builds the message announcing an entry at `abs`.
    fn creation(&self, wire: String, abs: &Path, hinted_dir: bool) -> Option<SyncMessage> {
        let metadata = match std::fs::metadata(abs) {
            Ok(metadata) => metadata,
            Err(e) if hinted_dir => {
                debug!(path = %abs.display(), error = %e, "directory vanished before stat");
                return Some(SyncMessage::CreateDir { path: wire });
            }
            Err(e) => {
                warn!(path = %abs.display(), error = %e, "cannot stat new entry, sending empty file");
                return Some(SyncMessage::create_file(wire, Vec::new()));
            }
        };

        if metadata.is_dir() {
            return Some(SyncMessage::CreateDir { path: wire });
        }
        if !metadata.is_file() {
            debug!(path = %abs.display(), "skipping special file");
            return None;
        }

        match self.read_file(abs, metadata.len()) {
            Ok(content) => content.map(|content| SyncMessage::create_file(wire, content)),
            Err(e) => {
                warn!(path = %abs.display(), error = %e, "cannot read file, sending empty file");
                Some(SyncMessage::create_file(wire, Vec::new()))
            }
        }
    }

    /// Re-sends a file a writer just closed. A file that is already gone is
    /// skipped; its removal is reported separately.
    fn rewritten(&self, wire: String, abs: &Path) -> Option<SyncMessage> {
        let metadata = match std::fs::metadata(abs) {
            Ok(metadata) if metadata.is_file() => metadata,
            Ok(_) => return None,
            Err(e) => {
                debug!(path = %abs.display(), error = %e, "written file is gone");
                return None;
            }
        };

        match self.read_file(abs, metadata.len()) {
            Ok(content) => content.map(|content| SyncMessage::create_file(wire, content)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %abs.display(), "written file is gone");
                None
            }
            Err(e) => {
                warn!(path = %abs.display(), error = %e, "cannot read file, sending empty file");
                Some(SyncMessage::create_file(wire, Vec::new()))
            }
        }
    }

    /// Reads a file for announcement. `Ok(None)` when it is over the limit.
    fn read_file(&self, abs: &Path, len: u64) -> io::Result<Option<Vec<u8>>> {
        if len > self.max_file_len {
            warn!(path = %abs.display(), size = len, max = self.max_file_len, "file too large to mirror, skipping");
            return Ok(None);
        }
        let content = std::fs::read(abs)?;
        if content.len() as u64 > self.max_file_len {
            warn!(path = %abs.display(), size = content.len(), max = self.max_file_len, "file grew too large to mirror, skipping");
            return Ok(None);
        }
        Ok(Some(content))
    }

    fn wire_path(&self, abs: &Path) -> Option<String> {
        let relative = relative_to_root(&self.root, abs);
        match path::to_wire(relative) {
            Ok(wire) => Some(wire),
            Err(e) => {
                warn!(path = %abs.display(), error = %e, "dropping event with unusable path");
                None
            }
        }
    }
}

/// Strips `root` from `path`. A path outside `root` is returned unchanged.
pub(crate) fn relative_to_root<'a>(root: &Path, path: &'a Path) -> &'a Path {
    path.strip_prefix(root).unwrap_or(path)
}
