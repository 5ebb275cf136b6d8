use std::path::PathBuf;
use std::time::Instant;

use warden_protocol::messages::SessionDescriptor;
use warden_protocol::{Direction, SessionStatus};

/// One upload or download.
///
/// The manager hands out clones; mutating a clone has no effect on the
/// tracked session.
#[derive(Debug, Clone)]
pub struct TransferSession {
    pub session_id: String,
    pub token: String,
    pub direction: Direction,
    pub device_id: String,
    pub file_name: String,
    pub logical_path: String,
    pub file_size: u64,
    /// Bytes transferred so far. Only ever increases.
    pub offset: u64,
    pub chunk_size: usize,
    pub status: SessionStatus,
    /// Write target while an upload is in progress.
    pub temp_path: Option<PathBuf>,
    /// Destination of a finished upload, or the source of a download.
    pub final_path: PathBuf,
    pub checksum: Option<String>,
    pub created_at: Instant,
    pub updated_at: Instant,
}

impl TransferSession {
    /// Describes the session for the agent.
    pub fn descriptor(&self, tcp_host: &str, tcp_port: u16) -> SessionDescriptor {
        SessionDescriptor {
            session_id: self.session_id.clone(),
            token: self.token.clone(),
            file_name: self.file_name.clone(),
            file_size: self.file_size,
            offset: self.offset,
            chunk_size: self.chunk_size,
            tcp_host: tcp_host.to_string(),
            tcp_port,
            direction: self.direction,
            status: self.status,
        }
    }

    /// Returns `true` if the session saw no activity for `idle`.
    pub fn is_idle(&self, now: Instant, idle: std::time::Duration) -> bool {
        now.saturating_duration_since(self.updated_at) >= idle
    }
}
