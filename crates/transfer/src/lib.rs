//! Chunked file transfer sessions with resume support.
//!
//! The [`SessionManager`] owns every in-flight upload and download.
//! Sessions are addressed by id and authenticated by a per-session token;
//! they are not bound to the connection that created them.

mod chunked;
mod manager;
mod session;
mod token;
mod validation;

pub use chunked::{ChunkReader, file_checksum, write_at};
pub use manager::{CompletedUpload, SessionManager, TransferConfig};
pub use session::TransferSession;
pub use token::{generate_token, session_id, tokens_match};
pub use validation::{sanitize_file_name, validate_device_id};

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("invalid session: {0}")]
    InvalidSession(&'static str),

    #[error("incomplete upload: {actual} of {expected} bytes")]
    Incomplete { expected: u64, actual: u64 },

    #[error("checksum mismatch")]
    ChecksumMismatch,
}
