//! Recursive directory watcher.
//!
//! Every directory under the root gets its own non-recursive watch, so the
//! watcher always knows which directory an event came from and can tell a
//! deleted directory from a deleted file after the fact.

use crate::error::{WatchError, WatchResult};
use notify::event::{AccessKind, AccessMode, ModifyKind, RemoveKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet, VecDeque};
use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};
use walkdir::WalkDir;

/// Released directories remembered for duplicate-removal suppression.
const RELEASED_MEMORY: usize = 1024;

/// Opaque identifier of one watched directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatchHandle(u64);

impl WatchHandle {
    /// Creates a handle from its raw value.
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw value.
    pub const fn as_raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for WatchHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "w{}", self.0)
    }
}

/// One watched directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEntry {
    /// Handle of the watch.
    pub handle: WatchHandle,
    /// Absolute path of the directory.
    pub path: PathBuf,
}

#[derive(Debug, Default)]
struct TableInner {
    by_handle: HashMap<WatchHandle, PathBuf>,
    by_path: HashMap<PathBuf, WatchHandle>,
    next: u64,
}

/// Map between watch handles and the directories they cover.
#[derive(Debug, Default)]
pub struct WatchTable {
    inner: RwLock<TableInner>,
}

impl WatchTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `path`, returning its handle. An already recorded path keeps
    /// its handle.
    pub fn insert(&self, path: &Path) -> WatchHandle {
        let mut inner = self.inner.write();
        if let Some(handle) = inner.by_path.get(path) {
            return *handle;
        }
        inner.next += 1;
        let handle = WatchHandle(inner.next);
        inner.by_handle.insert(handle, path.to_path_buf());
        inner.by_path.insert(path.to_path_buf(), handle);
        handle
    }

    /// Removes `path` and every recorded directory below it.
    pub fn remove_tree(&self, path: &Path) -> Vec<WatchEntry> {
        let mut inner = self.inner.write();
        let doomed: Vec<PathBuf> = inner
            .by_path
            .keys()
            .filter(|p| p.starts_with(path))
            .cloned()
            .collect();

        let mut removed = Vec::with_capacity(doomed.len());
        for p in doomed {
            if let Some(handle) = inner.by_path.remove(&p) {
                inner.by_handle.remove(&handle);
                removed.push(WatchEntry { handle, path: p });
            }
        }
        removed
    }

    /// Returns the directory a handle covers.
    pub fn resolve(&self, handle: WatchHandle) -> Option<PathBuf> {
        self.inner.read().by_handle.get(&handle).cloned()
    }

    /// Returns the handle covering `path`.
    pub fn handle_of(&self, path: &Path) -> Option<WatchHandle> {
        self.inner.read().by_path.get(path).copied()
    }

    /// Returns true if `path` is a watched directory.
    pub fn contains(&self, path: &Path) -> bool {
        self.inner.read().by_path.contains_key(path)
    }

    /// Returns all entries, ordered by handle.
    pub fn entries(&self) -> Vec<WatchEntry> {
        let inner = self.inner.read();
        let mut entries: Vec<WatchEntry> = inner
            .by_handle
            .iter()
            .map(|(handle, path)| WatchEntry {
                handle: *handle,
                path: path.clone(),
            })
            .collect();
        entries.sort_by_key(|e| e.handle);
        entries
    }

    /// Returns the number of watched directories.
    pub fn len(&self) -> usize {
        self.inner.read().by_handle.len()
    }

    /// Returns true if nothing is watched.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// What happened to a directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawEventKind {
    /// The entry appeared.
    Created,
    /// A writer closed the file after writing to it.
    Written,
    /// The entry was removed.
    Deleted,
    /// First half of a rename: the entry left this name.
    RenamedFrom,
    /// Second half of a rename: the entry arrived at this name.
    RenamedTo,
}

/// A change notification, relative to the watched directory it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    /// What happened.
    pub kind: RawEventKind,
    /// Watch of the directory containing the entry.
    pub parent: WatchHandle,
    /// Entry name inside that directory.
    pub name: OsString,
    /// Cookie linking the two halves of a rename.
    pub token: Option<usize>,
    /// Whether the entry is a directory. Taken from `stat` for entries that
    /// exist and from the watch table for entries that are gone.
    pub is_dir: bool,
}

/// The watch operations the translator needs.
pub trait WatchSet {
    /// Returns the directory covered by `handle`.
    fn resolve(&self, handle: WatchHandle) -> Option<PathBuf>;

    /// Watches `path` and every directory below it. Returns how many
    /// directories were registered.
    fn watch_tree(&mut self, path: &Path) -> usize;

    /// Releases the watches on `path` and below. Returns how many were
    /// released.
    fn unwatch_tree(&mut self, path: &Path) -> usize;
}

/// Watches a directory tree and yields [`RawEvent`]s.
///
/// The event sequence is infinite and cannot be restarted: once
/// [`DirectoryWatcher::next_event`] returns `None` the backend is gone.
pub struct DirectoryWatcher {
    root: PathBuf,
    table: Arc<WatchTable>,
    backend: RecommendedWatcher,
    events: mpsc::UnboundedReceiver<notify::Result<Event>>,
    ready: VecDeque<RawEvent>,
    released: HashSet<PathBuf>,
    departed: HashSet<PathBuf>,
}

impl DirectoryWatcher {
    /// Starts watching `root` and every directory already below it.
    ///
    /// # Errors
    ///
    /// Fails if the root cannot be opened, is not a directory, or cannot be
    /// watched. Unwatchable subdirectories are logged and skipped.
    pub fn new(root: impl AsRef<Path>) -> WatchResult<Self> {
        let given = root.as_ref();
        let root = given
            .canonicalize()
            .map_err(|source| WatchError::RootUnavailable {
                path: given.to_path_buf(),
                source,
            })?;
        if !root.is_dir() {
            return Err(WatchError::NotADirectory(root));
        }

        // Unbounded: the backend thread must never block while the consumer
        // is inside watch(), which round-trips through that same thread.
        let (tx, events) = mpsc::unbounded_channel();
        let backend = notify::recommended_watcher(move |res| {
            let _ = tx.send(res);
        })?;

        let mut watcher = Self {
            root: root.clone(),
            table: Arc::new(WatchTable::new()),
            backend,
            events,
            ready: VecDeque::new(),
            released: HashSet::new(),
            departed: HashSet::new(),
        };

        let registered = watcher.watch_tree(&root);
        if !watcher.table.contains(&root) {
            return Err(WatchError::RootNotWatched(root));
        }
        info!(root = %root.display(), directories = registered, "watching tree");
        Ok(watcher)
    }

    /// Returns the canonical root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the watch table.
    pub fn table(&self) -> &Arc<WatchTable> {
        &self.table
    }

    /// Waits for the next event.
    ///
    /// A newly created directory is already watched when its `Created`
    /// event is returned. Entries created inside it before that point may
    /// go unreported.
    pub async fn next_event(&mut self) -> Option<RawEvent> {
        loop {
            if let Some(event) = self.ready.pop_front() {
                return Some(event);
            }
            match self.events.recv().await? {
                Ok(event) => self.ingest(event),
                Err(e) => warn!(error = %e, "watch backend error"),
            }
        }
    }

    fn ingest(&mut self, event: Event) {
        let token = event.tracker();
        match event.kind {
            EventKind::Create(_) => {
                for path in &event.paths {
                    self.reclaim(path);
                    let is_dir = path.is_dir();
                    if is_dir {
                        self.watch_tree(path);
                    }
                    self.push(RawEventKind::Created, path, None, is_dir);
                }
            }
            EventKind::Access(AccessKind::Close(AccessMode::Write)) => {
                for path in &event.paths {
                    self.push(RawEventKind::Written, path, None, false);
                }
            }
            EventKind::Remove(kind) => {
                for path in &event.paths {
                    self.removed(path, kind);
                }
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
                // A directory's own move notice carries no cookie; its
                // parent reports the same rename with one.
                if token.is_none() {
                    trace!(paths = ?event.paths, "ignoring uncorrelated rename notice");
                    return;
                }
                for path in &event.paths {
                    let is_dir = self.table.contains(path);
                    if is_dir {
                        self.departed.insert(path.clone());
                    }
                    self.push(RawEventKind::RenamedFrom, path, token, is_dir);
                }
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
                for path in &event.paths {
                    self.reclaim(path);
                    self.push(RawEventKind::RenamedTo, path, token, path.is_dir());
                }
            }
            other => trace!(kind = ?other, "ignoring event"),
        }
    }

    /// Handles a removal notice. A watched directory is reported both by its
    /// own watch and by its parent's; only the first notice is kept.
    ///
    /// A directory renamed out of the tree is still reported under its old
    /// path when it is later deleted, and only by its own watch. That notice
    /// is dropped: the rename already accounts for the directory leaving.
    fn removed(&mut self, path: &Path, kind: RemoveKind) {
        if self.departed.remove(path) && self.table.contains(path) {
            self.unwatch_tree(path);
            trace!(path = %path.display(), "removal of a directory that left the tree");
        } else if self.table.contains(path) {
            self.unwatch_tree(path);
            if self.released.len() >= RELEASED_MEMORY {
                self.released.clear();
            }
            self.released.insert(path.to_path_buf());
            self.push(RawEventKind::Deleted, path, None, true);
        } else if self.released.remove(path) {
            trace!(path = %path.display(), "duplicate removal notice");
        } else {
            let is_dir = matches!(kind, RemoveKind::Folder);
            self.push(RawEventKind::Deleted, path, None, is_dir);
        }
    }

    /// Forgets what is known about an earlier entry at `path` now that the
    /// name is in use again.
    fn reclaim(&mut self, path: &Path) {
        self.released.remove(path);
        if self.departed.remove(path) {
            self.unwatch_tree(path);
        }
    }

    fn push(&mut self, kind: RawEventKind, path: &Path, token: Option<usize>, is_dir: bool) {
        let (Some(parent), Some(name)) = (path.parent(), path.file_name()) else {
            debug!(path = %path.display(), "event without a parent directory");
            return;
        };
        let Some(handle) = self.table.handle_of(parent) else {
            debug!(path = %path.display(), "event outside watched directories");
            return;
        };
        self.ready.push_back(RawEvent {
            kind,
            parent: handle,
            name: name.to_os_string(),
            token,
            is_dir,
        });
    }
}

impl WatchSet for DirectoryWatcher {
    fn resolve(&self, handle: WatchHandle) -> Option<PathBuf> {
        self.table.resolve(handle)
    }

    fn watch_tree(&mut self, path: &Path) -> usize {
        let mut registered = 0;
        let mut walker = WalkDir::new(path).follow_links(false).into_iter();
        while let Some(entry) = walker.next() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(error = %e, "cannot read directory, skipping");
                    continue;
                }
            };
            if !entry.file_type().is_dir() {
                continue;
            }
            let dir = entry.path();
            if let Err(e) = self.backend.watch(dir, RecursiveMode::NonRecursive) {
                warn!(path = %dir.display(), error = %e, "cannot watch directory, skipping subtree");
                walker.skip_current_dir();
                continue;
            }
            let handle = self.table.insert(dir);
            debug!(path = %dir.display(), %handle, "watching directory");
            registered += 1;
        }
        registered
    }

    fn unwatch_tree(&mut self, path: &Path) -> usize {
        self.departed.retain(|p| !p.starts_with(path));
        let released = self.table.remove_tree(path);
        for entry in &released {
            // The backend drops watches on deleted directories by itself.
            if let Err(e) = self.backend.unwatch(&entry.path) {
                trace!(path = %entry.path.display(), error = %e, "unwatch");
            }
            debug!(path = %entry.path.display(), handle = %entry.handle, "released watch");
        }
        released.len()
    }
}

/// A [`WatchSet`] that only maintains a table.
///
/// Registers exactly the paths it is given without touching the
/// filesystem or any notification backend.
#[derive(Debug, Default)]
pub struct MemoryWatchSet {
    table: WatchTable,
}

impl MemoryWatchSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a single directory and returns its handle.
    pub fn register(&mut self, path: impl AsRef<Path>) -> WatchHandle {
        self.table.insert(path.as_ref())
    }

    /// Returns the underlying table.
    pub fn table(&self) -> &WatchTable {
        &self.table
    }
}

impl WatchSet for MemoryWatchSet {
    fn resolve(&self, handle: WatchHandle) -> Option<PathBuf> {
        self.table.resolve(handle)
    }

    fn watch_tree(&mut self, path: &Path) -> usize {
        self.table.insert(path);
        1
    }

    fn unwatch_tree(&mut self, path: &Path) -> usize {
        self.table.remove_tree(path).len()
    }
}
