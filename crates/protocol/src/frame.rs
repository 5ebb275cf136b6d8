//! Frame model and byte codec.
//!
//! # Wire format
//!
//! ```text
//! HEADER:     [1 byte: type][4 bytes BE: payload_len]
//! STRING:     [2 bytes BE: len][len bytes UTF-8]
//!
//! LOGIN       (0x01): STRING device_id, STRING token
//! COMMAND     (0x02): raw JSON sub-command bytes
//! FILE_META   (0x03): [8 bytes BE: file_size], STRING file_name
//! FILE_CHUNK  (0x04): STRING session_id, STRING token,
//!                     [8 bytes BE: chunk_offset], chunk bytes (rest)
//! FILE_DONE   (0x05): STRING session_id, STRING token
//! ACK         (0x06): [2 bytes BE: status_code], STRING status_message
//! ERROR       (0x7F): [2 bytes BE: status_code], STRING status_message
//! ```

use crate::constants::{
    FRAME_HEADER_LEN, MAX_DEVICE_ID_LEN, MAX_FILE_NAME_LEN, MAX_PAYLOAD, MAX_SESSION_ID_LEN,
    MAX_STATUS_MESSAGE_LEN, MAX_TOKEN_LEN, STATUS_OK,
};
use crate::types::FrameType;

/// Errors produced while encoding or decoding frames.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("unknown frame type: 0x{0:02x}")]
    UnknownType(u8),

    #[error("payload too large: {len} bytes (max {max})")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("{field} too long: {len} bytes (max {max})")]
    FieldTooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },

    #[error("truncated payload while reading {0}")]
    Truncated(&'static str),

    #[error("invalid UTF-8 in {0}")]
    InvalidUtf8(&'static str),

    #[error("unexpected trailing bytes after {0}")]
    TrailingBytes(&'static str),
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub frame_type: FrameType,
    pub payload_len: usize,
}

impl FrameHeader {
    /// Parses and bounds-checks a raw header.
    pub fn parse(raw: [u8; FRAME_HEADER_LEN]) -> Result<Self, FrameError> {
        let frame_type = FrameType::try_from(raw[0]).map_err(FrameError::UnknownType)?;
        let payload_len = u32::from_be_bytes([raw[1], raw[2], raw[3], raw[4]]) as usize;
        if payload_len > MAX_PAYLOAD {
            return Err(FrameError::PayloadTooLarge {
                len: payload_len,
                max: MAX_PAYLOAD,
            });
        }
        Ok(Self {
            frame_type,
            payload_len,
        })
    }

    /// Serializes the header.
    pub fn to_bytes(self) -> [u8; FRAME_HEADER_LEN] {
        let len = (self.payload_len as u32).to_be_bytes();
        [self.frame_type as u8, len[0], len[1], len[2], len[3]]
    }
}

/// One message on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Login {
        device_id: String,
        token: String,
    },
    /// JSON sub-command bytes (`{action, data}` towards the hub,
    /// a [`CommandEnvelope`](crate::CommandEnvelope) towards an agent).
    Command {
        payload: Vec<u8>,
    },
    FileMeta {
        file_name: String,
        file_size: u64,
    },
    FileChunk {
        session_id: String,
        token: String,
        offset: u64,
        data: Vec<u8>,
    },
    FileDone {
        session_id: String,
        token: String,
    },
    Ack {
        code: u16,
        message: String,
    },
    Error {
        code: u16,
        message: String,
    },
}

impl Frame {
    /// Builds an ACK frame.
    pub fn ack(code: u16, message: impl Into<String>) -> Self {
        Self::Ack {
            code,
            message: message.into(),
        }
    }

    /// Builds an ERROR frame.
    pub fn error(code: u16, message: impl Into<String>) -> Self {
        Self::Error {
            code,
            message: message.into(),
        }
    }

    /// Returns the wire type of this frame.
    pub fn frame_type(&self) -> FrameType {
        match self {
            Self::Login { .. } => FrameType::Login,
            Self::Command { .. } => FrameType::Command,
            Self::FileMeta { .. } => FrameType::FileMeta,
            Self::FileChunk { .. } => FrameType::FileChunk,
            Self::FileDone { .. } => FrameType::FileDone,
            Self::Ack { .. } => FrameType::Ack,
            Self::Error { .. } => FrameType::Error,
        }
    }

    /// Returns `(code, message)` for ACK and ERROR frames.
    pub fn status(&self) -> Option<(u16, &str)> {
        match self {
            Self::Ack { code, message } | Self::Error { code, message } => {
                Some((*code, message.as_str()))
            }
            _ => None,
        }
    }

    /// Returns `true` for an ACK carrying a 2xx code.
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ack { code, .. } if (STATUS_OK..300).contains(code))
    }

    /// Serializes the payload (without header).
    pub fn encode_payload(&self) -> Result<Vec<u8>, FrameError> {
        let mut out = Vec::new();
        match self {
            Self::Login { device_id, token } => {
                put_str(&mut out, "device_id", device_id, MAX_DEVICE_ID_LEN)?;
                put_str(&mut out, "token", token, MAX_TOKEN_LEN)?;
            }
            Self::Command { payload } => out.extend_from_slice(payload),
            Self::FileMeta {
                file_name,
                file_size,
            } => {
                out.extend_from_slice(&file_size.to_be_bytes());
                put_str(&mut out, "file_name", file_name, MAX_FILE_NAME_LEN)?;
            }
            Self::FileChunk {
                session_id,
                token,
                offset,
                data,
            } => {
                put_str(&mut out, "session_id", session_id, MAX_SESSION_ID_LEN)?;
                put_str(&mut out, "token", token, MAX_TOKEN_LEN)?;
                out.extend_from_slice(&offset.to_be_bytes());
                out.extend_from_slice(data);
            }
            Self::FileDone { session_id, token } => {
                put_str(&mut out, "session_id", session_id, MAX_SESSION_ID_LEN)?;
                put_str(&mut out, "token", token, MAX_TOKEN_LEN)?;
            }
            Self::Ack { code, message } | Self::Error { code, message } => {
                out.extend_from_slice(&code.to_be_bytes());
                put_str(&mut out, "status_message", message, MAX_STATUS_MESSAGE_LEN)?;
            }
        }
        if out.len() > MAX_PAYLOAD {
            return Err(FrameError::PayloadTooLarge {
                len: out.len(),
                max: MAX_PAYLOAD,
            });
        }
        Ok(out)
    }

    /// Serializes the full frame (header + payload).
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        let payload = self.encode_payload()?;
        let header = FrameHeader {
            frame_type: self.frame_type(),
            payload_len: payload.len(),
        };
        let mut out = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
        out.extend_from_slice(&header.to_bytes());
        out.extend_from_slice(&payload);
        Ok(out)
    }

    /// Decodes a payload of the given type.
    pub fn decode(frame_type: FrameType, payload: &[u8]) -> Result<Self, FrameError> {
        let mut r = PayloadReader::new(payload);
        let frame = match frame_type {
            FrameType::Login => {
                let device_id = r.string("device_id", MAX_DEVICE_ID_LEN)?;
                let token = r.string("token", MAX_TOKEN_LEN)?;
                r.finish("login")?;
                Self::Login { device_id, token }
            }
            FrameType::Command => Self::Command {
                payload: r.rest().to_vec(),
            },
            FrameType::FileMeta => {
                let file_size = r.u64("file_size")?;
                let file_name = r.string("file_name", MAX_FILE_NAME_LEN)?;
                r.finish("file_meta")?;
                Self::FileMeta {
                    file_name,
                    file_size,
                }
            }
            FrameType::FileChunk => {
                let session_id = r.string("session_id", MAX_SESSION_ID_LEN)?;
                let token = r.string("token", MAX_TOKEN_LEN)?;
                let offset = r.u64("chunk_offset")?;
                Self::FileChunk {
                    session_id,
                    token,
                    offset,
                    data: r.rest().to_vec(),
                }
            }
            FrameType::FileDone => {
                let session_id = r.string("session_id", MAX_SESSION_ID_LEN)?;
                let token = r.string("token", MAX_TOKEN_LEN)?;
                r.finish("file_done")?;
                Self::FileDone { session_id, token }
            }
            FrameType::Ack | FrameType::Error => {
                let code = r.u16("status_code")?;
                let message = r.string("status_message", MAX_STATUS_MESSAGE_LEN)?;
                r.finish("status")?;
                if frame_type == FrameType::Ack {
                    Self::Ack { code, message }
                } else {
                    Self::Error { code, message }
                }
            }
        };
        Ok(frame)
    }

    /// Decodes one complete frame (header + payload) from `bytes`.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FrameError> {
        let raw: [u8; FRAME_HEADER_LEN] = bytes
            .get(..FRAME_HEADER_LEN)
            .and_then(|h| h.try_into().ok())
            .ok_or(FrameError::Truncated("header"))?;
        let header = FrameHeader::parse(raw)?;
        let body = &bytes[FRAME_HEADER_LEN..];
        if body.len() < header.payload_len {
            return Err(FrameError::Truncated("payload"));
        }
        if body.len() > header.payload_len {
            return Err(FrameError::TrailingBytes("frame"));
        }
        Self::decode(header.frame_type, body)
    }
}

fn put_str(
    out: &mut Vec<u8>,
    field: &'static str,
    value: &str,
    max: usize,
) -> Result<(), FrameError> {
    let bytes = value.as_bytes();
    if bytes.len() > max {
        return Err(FrameError::FieldTooLong {
            field,
            len: bytes.len(),
            max,
        });
    }
    out.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
    out.extend_from_slice(bytes);
    Ok(())
}

/// Cursor over a frame payload.
struct PayloadReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize, field: &'static str) -> Result<&'a [u8], FrameError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.buf.len())
            .ok_or(FrameError::Truncated(field))?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u16(&mut self, field: &'static str) -> Result<u16, FrameError> {
        let b = self.take(2, field)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u64(&mut self, field: &'static str) -> Result<u64, FrameError> {
        let b = self.take(8, field)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(u64::from_be_bytes(raw))
    }

    fn string(&mut self, field: &'static str, max: usize) -> Result<String, FrameError> {
        let len = self.u16(field)? as usize;
        if len > max {
            return Err(FrameError::FieldTooLong { field, len, max });
        }
        let bytes = self.take(len, field)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| FrameError::InvalidUtf8(field))
    }

    fn rest(&mut self) -> &'a [u8] {
        let rest = &self.buf[self.pos..];
        self.pos = self.buf.len();
        rest
    }

    fn finish(&self, what: &'static str) -> Result<(), FrameError> {
        if self.pos != self.buf.len() {
            return Err(FrameError::TrailingBytes(what));
        }
        Ok(())
    }
}
