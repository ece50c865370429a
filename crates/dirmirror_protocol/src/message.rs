//! Protocol messages.

use crate::ignore::IgnoreRules;
use crate::path;

/// A filesystem operation streamed from the source tree to mirrors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncMessage {
    /// A regular file appeared (or was rewritten) with the given content.
    CreateFile {
        /// Relative path of the file.
        path: String,
        /// Size in bytes; always equals `content.len()`.
        size: u64,
        /// Full file content.
        content: Vec<u8>,
    },
    /// A directory appeared.
    CreateDir {
        /// Relative path of the directory.
        path: String,
    },
    /// A file was removed.
    DeleteFile {
        /// Relative path of the file.
        path: String,
    },
    /// A directory (and everything under it) was removed.
    DeleteDir {
        /// Relative path of the directory.
        path: String,
    },
    /// An entry was renamed within the tree.
    Move {
        /// Previous relative path.
        from: String,
        /// New relative path.
        to: String,
    },
}

impl SyncMessage {
    /// Creates a `CreateFile` message, deriving `size` from the content.
    pub fn create_file(path: impl Into<String>, content: Vec<u8>) -> Self {
        Self::CreateFile {
            path: path.into(),
            size: content.len() as u64,
            content,
        }
    }

    /// Returns the frame tag for this message.
    pub fn tag(&self) -> FrameTag {
        match self {
            SyncMessage::CreateFile { .. } => FrameTag::CreateFile,
            SyncMessage::CreateDir { .. } => FrameTag::CreateDir,
            SyncMessage::DeleteFile { .. } => FrameTag::DeleteFile,
            SyncMessage::DeleteDir { .. } => FrameTag::DeleteDir,
            SyncMessage::Move { .. } => FrameTag::Move,
        }
    }

    /// Returns the path the message is about (the destination for a move).
    pub fn path(&self) -> &str {
        match self {
            SyncMessage::CreateFile { path, .. }
            | SyncMessage::CreateDir { path }
            | SyncMessage::DeleteFile { path }
            | SyncMessage::DeleteDir { path } => path,
            SyncMessage::Move { to, .. } => to,
        }
    }

    /// Returns the extension of [`SyncMessage::path`], if any.
    pub fn extension(&self) -> Option<&str> {
        path::extension(self.path())
    }

    /// Returns true for messages subject to ignore rules.
    pub fn is_creation(&self) -> bool {
        matches!(
            self,
            SyncMessage::CreateFile { .. } | SyncMessage::CreateDir { .. }
        )
    }
}

/// A complete frame as read from or written to a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// First frame from a mirror: the extensions it does not want.
    Handshake(IgnoreRules),
    /// A filesystem operation.
    Sync(SyncMessage),
}

impl From<SyncMessage> for Frame {
    fn from(message: SyncMessage) -> Self {
        Frame::Sync(message)
    }
}

/// Single-byte frame tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameTag {
    /// `C`: path, size, content.
    CreateFile = b'C',
    /// `Z`: path.
    CreateDir = b'Z',
    /// `D`: path.
    DeleteFile = b'D',
    /// `E`: path.
    DeleteDir = b'E',
    /// `F`: from, to.
    Move = b'F',
    /// `I`: separator-joined ignore rules.
    Handshake = b'I',
}

impl FrameTag {
    /// Parses a tag byte.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            b'C' => Some(FrameTag::CreateFile),
            b'Z' => Some(FrameTag::CreateDir),
            b'D' => Some(FrameTag::DeleteFile),
            b'E' => Some(FrameTag::DeleteDir),
            b'F' => Some(FrameTag::Move),
            b'I' => Some(FrameTag::Handshake),
            _ => None,
        }
    }

    /// Returns the tag byte.
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Number of fields a frame with this tag carries.
    pub fn arity(self) -> u32 {
        match self {
            FrameTag::CreateFile => 3,
            FrameTag::Move => 2,
            FrameTag::CreateDir
            | FrameTag::DeleteFile
            | FrameTag::DeleteDir
            | FrameTag::Handshake => 1,
        }
    }
}
