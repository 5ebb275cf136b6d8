//! Warden endpoint agent.
//!
//! Dials the hub, keeps the connection alive with exponential backoff,
//! executes queued commands and ships backups and file-tree changes.

pub mod agent;
pub mod backoff;
pub mod context;
pub mod dispatcher;
pub mod filetree;
pub mod handlers;
pub mod identity;
pub mod manager;
pub mod transfer;

#[cfg(test)]
pub(crate) mod testing;

pub use agent::{Agent, AgentConfig};
pub use backoff::{Backoff, ReconnectConfig};
pub use context::{AgentContext, Identity};
pub use dispatcher::{CommandDispatcher, CommandHandler, HandlerFuture};
pub use manager::{ConnectionManager, ConnectionState, ManagerConfig};
pub use warden_protocol::CommandEnvelope;
pub use transfer::{UploadReport, download_file, upload_file};

use warden_protocol::{FrameError, SessionStatus};
use warden_transfer::TransferError;
use warden_transport::TransportError;

/// Errors produced by the agent.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("hub answered {code}: {message}")]
    Rejected { code: u16, message: String },

    #[error("not connected to hub")]
    NotConnected,

    #[error("connection closed")]
    Closed,

    #[error("request timed out")]
    Timeout,

    #[error("gave up after {0} connection attempts")]
    RetriesExhausted(u32),

    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("cancelled")]
    Cancelled,

    #[error("upload {session_id} not stored: hub reports {status:?} at {offset} bytes")]
    UploadNotStored {
        session_id: String,
        status: SessionStatus,
        offset: u64,
    },
}

impl AgentError {
    /// Returns `true` if the hub refused the request as unauthorized.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Rejected { code, .. } if *code == warden_protocol::constants::STATUS_UNAUTHORIZED)
    }
}
