//! Length-prefixed frame codec.

use crate::error::{ProtocolError, ProtocolResult};
use crate::ignore::IgnoreRules;
use crate::message::{Frame, FrameTag, SyncMessage};
use bytes::{BufMut, Bytes, BytesMut};

/// Default maximum length of a single field.
///
/// Bounds the allocation a corrupt or hostile peer can trigger.
pub const DEFAULT_MAX_FIELD_LEN: u32 = 256 * 1024 * 1024;

/// Tag byte plus field count.
const HEADER_LEN: usize = 5;

/// Length prefix of each field.
const LEN_PREFIX: usize = 4;

/// Decoding limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLimits {
    /// Largest accepted field, in bytes.
    pub max_field_len: u32,
}

impl FrameLimits {
    /// Creates limits with the given maximum field length.
    pub fn new(max_field_len: u32) -> Self {
        Self { max_field_len }
    }
}

impl Default for FrameLimits {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FIELD_LEN)
    }
}

/// Encodes a frame.
///
/// # Errors
///
/// Fails if a `CreateFile` size disagrees with its content, or if a field
/// does not fit a `u32` length prefix.
pub fn encode_frame(frame: &Frame) -> ProtocolResult<Bytes> {
    let size_field;
    let rules_field;
    let (tag, fields): (FrameTag, Vec<&[u8]>) = match frame {
        Frame::Handshake(rules) => {
            rules_field = rules.to_wire();
            (FrameTag::Handshake, vec![rules_field.as_bytes()])
        }
        Frame::Sync(message) => match message {
            SyncMessage::CreateFile {
                path,
                size,
                content,
            } => {
                if *size != content.len() as u64 {
                    return Err(ProtocolError::SizeMismatch {
                        declared: *size,
                        actual: content.len() as u64,
                    });
                }
                size_field = size.to_be_bytes();
                (
                    FrameTag::CreateFile,
                    vec![path.as_bytes(), &size_field[..], content.as_slice()],
                )
            }
            SyncMessage::CreateDir { path } => (FrameTag::CreateDir, vec![path.as_bytes()]),
            SyncMessage::DeleteFile { path } => (FrameTag::DeleteFile, vec![path.as_bytes()]),
            SyncMessage::DeleteDir { path } => (FrameTag::DeleteDir, vec![path.as_bytes()]),
            SyncMessage::Move { from, to } => {
                (FrameTag::Move, vec![from.as_bytes(), to.as_bytes()])
            }
        },
    };

    let body: usize = fields.iter().map(|f| LEN_PREFIX + f.len()).sum();
    let mut buf = BytesMut::with_capacity(HEADER_LEN + body);
    buf.put_u8(tag.as_byte());
    buf.put_u32(fields.len() as u32);
    for field in fields {
        let len = u32::try_from(field.len()).map_err(|_| ProtocolError::Unframeable(field.len()))?;
        buf.put_u32(len);
        buf.put_slice(field);
    }
    Ok(buf.freeze())
}

/// Decodes exactly one frame from `bytes`.
///
/// # Errors
///
/// Returns [`ProtocolError::Truncated`] if `bytes` ends early and
/// [`ProtocolError::TrailingBytes`] if anything follows the frame, besides
/// every structural error the streaming decoder reports.
pub fn decode_frame(bytes: &[u8], limits: &FrameLimits) -> ProtocolResult<Frame> {
    match scan(bytes, limits)? {
        Scan::Incomplete(needed) => Err(ProtocolError::Truncated { needed }),
        Scan::Complete(len) if len < bytes.len() => {
            Err(ProtocolError::TrailingBytes(bytes.len() - len))
        }
        Scan::Complete(_) => parse(bytes),
    }
}

/// Incremental decoder for a byte stream.
///
/// Feed it the connection's read buffer; each call either consumes one
/// whole frame or leaves the buffer untouched and asks for more input.
#[derive(Debug, Clone, Default)]
pub struct FrameDecoder {
    limits: FrameLimits,
}

impl FrameDecoder {
    /// Creates a decoder with the given limits.
    pub fn new(limits: FrameLimits) -> Self {
        Self { limits }
    }

    /// Returns the decoder's limits.
    pub fn limits(&self) -> &FrameLimits {
        &self.limits
    }

    /// Decodes the next frame from `buf`.
    ///
    /// Returns `Ok(None)` when `buf` does not yet hold a complete frame.
    /// Oversized fields are rejected as soon as their length prefix is
    /// buffered, before any payload is read.
    ///
    /// # Errors
    ///
    /// Any error means the stream is corrupt and the connection must be
    /// dropped.
    pub fn decode(&mut self, buf: &mut BytesMut) -> ProtocolResult<Option<Frame>> {
        match scan(&buf[..], &self.limits)? {
            Scan::Incomplete(needed) => {
                buf.reserve(needed);
                Ok(None)
            }
            Scan::Complete(len) => {
                let frame = buf.split_to(len);
                parse(&frame).map(Some)
            }
        }
    }
}

enum Scan {
    /// At least this many more bytes are needed.
    Incomplete(usize),
    /// A whole frame of this length is at the front of the buffer.
    Complete(usize),
}

fn read_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// Validates the frame structure without copying anything.
fn scan(buf: &[u8], limits: &FrameLimits) -> ProtocolResult<Scan> {
    let Some(&tag_byte) = buf.first() else {
        return Ok(Scan::Incomplete(HEADER_LEN));
    };
    let tag = FrameTag::from_byte(tag_byte).ok_or(ProtocolError::UnknownTag(tag_byte))?;
    if buf.len() < HEADER_LEN {
        return Ok(Scan::Incomplete(HEADER_LEN - buf.len()));
    }

    let count = read_u32(&buf[1..HEADER_LEN]);
    if count != tag.arity() {
        return Err(ProtocolError::FieldCount {
            tag: char::from(tag_byte),
            expected: tag.arity(),
            actual: count,
        });
    }

    let mut pos = HEADER_LEN;
    for _ in 0..count {
        if buf.len() < pos + LEN_PREFIX {
            return Ok(Scan::Incomplete(pos + LEN_PREFIX - buf.len()));
        }
        let len = read_u32(&buf[pos..pos + LEN_PREFIX]);
        if len > limits.max_field_len {
            return Err(ProtocolError::FieldTooLarge {
                claimed: u64::from(len),
                max_allowed: u64::from(limits.max_field_len),
            });
        }
        pos += LEN_PREFIX;
        let end = pos + len as usize;
        if buf.len() < end {
            return Ok(Scan::Incomplete(end - buf.len()));
        }
        pos = end;
    }
    Ok(Scan::Complete(pos))
}

/// Builds a frame from bytes that already passed [`scan`].
fn parse(frame: &[u8]) -> ProtocolResult<Frame> {
    let tag_byte = frame[0];
    let tag = FrameTag::from_byte(tag_byte).ok_or(ProtocolError::UnknownTag(tag_byte))?;

    let mut fields = Vec::with_capacity(tag.arity() as usize);
    let mut pos = HEADER_LEN;
    while pos < frame.len() {
        let len = read_u32(&frame[pos..pos + LEN_PREFIX]) as usize;
        pos += LEN_PREFIX;
        fields.push(&frame[pos..pos + len]);
        pos += len;
    }

    let text = |index: usize, field: &'static str| -> ProtocolResult<String> {
        std::str::from_utf8(fields[index])
            .map(str::to_string)
            .map_err(|_| ProtocolError::InvalidUtf8 { field })
    };

    let frame = match tag {
        FrameTag::Handshake => Frame::Handshake(IgnoreRules::from_wire(&text(0, "rules")?)),
        FrameTag::CreateFile => {
            let size_bytes: [u8; 8] = fields[1]
                .try_into()
                .map_err(|_| ProtocolError::MalformedSize(fields[1].len()))?;
            let size = u64::from_be_bytes(size_bytes);
            let content = fields[2];
            if size != content.len() as u64 {
                return Err(ProtocolError::SizeMismatch {
                    declared: size,
                    actual: content.len() as u64,
                });
            }
            Frame::Sync(SyncMessage::CreateFile {
                path: text(0, "path")?,
                size,
                content: content.to_vec(),
            })
        }
        FrameTag::CreateDir => Frame::Sync(SyncMessage::CreateDir {
            path: text(0, "path")?,
        }),
        FrameTag::DeleteFile => Frame::Sync(SyncMessage::DeleteFile {
            path: text(0, "path")?,
        }),
        FrameTag::DeleteDir => Frame::Sync(SyncMessage::DeleteDir {
            path: text(0, "path")?,
        }),
        FrameTag::Move => Frame::Sync(SyncMessage::Move {
            from: text(0, "from")?,
            to: text(1, "to")?,
        }),
    };
    Ok(frame)
}
