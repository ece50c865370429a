//! Relative wire paths.
//!
//! Paths travel as UTF-8 strings with `/` separators, relative to the
//! watched root on the source and to the mirror root on the receiver.
//! Nothing that leaves this module can name a location outside its root.

use crate::error::{ProtocolError, ProtocolResult};
use std::path::{Component, Path, PathBuf};

/// Separator used between segments of a wire path.
pub const SEPARATOR: char = '/';

/// Normalizes a wire path.
///
/// Empty and `.` segments are dropped. Absolute paths, `..` segments and
/// NUL bytes are rejected, as is a path that normalizes to nothing.
///
/// # Errors
///
/// Returns [`ProtocolError::UnsafePath`] describing the first violation.
pub fn normalize(path: &str) -> ProtocolResult<String> {
    if path.contains('\0') {
        return Err(ProtocolError::unsafe_path(path, "contains NUL byte"));
    }
    if path.starts_with(SEPARATOR) || Path::new(path).has_root() {
        return Err(ProtocolError::unsafe_path(path, "absolute path"));
    }
    if Path::new(path)
        .components()
        .any(|c| matches!(c, Component::Prefix(_)))
    {
        return Err(ProtocolError::unsafe_path(path, "absolute path"));
    }

    let mut segments = Vec::new();
    for segment in path.split(SEPARATOR) {
        match segment {
            "" | "." => continue,
            ".." => return Err(ProtocolError::unsafe_path(path, "parent traversal")),
            s => segments.push(s),
        }
    }

    if segments.is_empty() {
        return Err(ProtocolError::unsafe_path(path, "empty path"));
    }
    Ok(segments.join("/"))
}

/// Resolves a wire path against `root`.
///
/// The result is always `root` joined with the normalized segments, so it
/// cannot escape `root` lexically.
///
/// # Errors
///
/// Returns an error if `path` fails [`normalize`].
pub fn resolve(root: &Path, path: &str) -> ProtocolResult<PathBuf> {
    let normalized = normalize(path)?;
    let mut resolved = root.to_path_buf();
    for segment in normalized.split(SEPARATOR) {
        resolved.push(segment);
    }
    Ok(resolved)
}

/// Converts a filesystem path relative to some root into a wire path.
///
/// # Errors
///
/// Rejects absolute paths, `..` components and non-UTF-8 names.
pub fn to_wire(relative: &Path) -> ProtocolResult<String> {
    let display = || relative.to_string_lossy().into_owned();
    let mut segments = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(name) => {
                let name = name
                    .to_str()
                    .ok_or_else(|| ProtocolError::unsafe_path(display(), "not valid UTF-8"))?;
                segments.push(name);
            }
            Component::CurDir => continue,
            Component::ParentDir => {
                return Err(ProtocolError::unsafe_path(display(), "parent traversal"))
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(ProtocolError::unsafe_path(display(), "absolute path"))
            }
        }
    }
    normalize(&segments.join("/"))
}

/// Returns the extension of the last segment, without the dot.
///
/// A leading dot (`.bashrc`) does not start an extension, and a trailing
/// dot yields none.
pub fn extension(path: &str) -> Option<&str> {
    let name = path.rsplit(SEPARATOR).next()?;
    let dot = name.rfind('.')?;
    if dot == 0 || dot + 1 == name.len() {
        return None;
    }
    Some(&name[dot + 1..])
}
