//! JSON bodies of the sub-commands exchanged over COMMAND frames.

use serde::{Deserialize, Serialize};

use crate::types::{CommandKind, CommandStatus, Direction, SessionStatus};

// ---------------------------------------------------------------------------
// Authentication / device
// ---------------------------------------------------------------------------

/// `login` request: operator credentials plus optional device metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arch: Option<String>,
}

/// `login` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginResponse {
    pub token: String,
    pub device_id: String,
}

/// `device_register` request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arch: Option<String>,
}

/// One file-tree node reported by `filetree_sync`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    pub id: String,
    pub origin_path: String,
    pub cur_path: String,
    pub cur_name: String,
    #[serde(default)]
    pub cur_ext: String,
    #[serde(default)]
    pub total_size: u64,
    #[serde(default)]
    pub snapshot_number: u64,
    #[serde(default)]
    pub is_dir: bool,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub change_pending: bool,
    #[serde(default)]
    pub content_type_ids: Vec<u32>,
}

/// `agent_log` request: a block of newline-separated log lines.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentLog {
    pub lines: String,
}

// ---------------------------------------------------------------------------
// Backup sessions
// ---------------------------------------------------------------------------

/// `backup_init_upload` request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitUploadRequest {
    pub file_name: String,
    pub file_size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    /// Source path on the agent; keys resumable partial uploads.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logical_path: Option<String>,
}

/// `backup_init_download` request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitDownloadRequest {
    pub file_name: String,
}

/// Session descriptor returned by both init actions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescriptor {
    pub session_id: String,
    pub token: String,
    pub file_name: String,
    pub file_size: u64,
    pub offset: u64,
    pub chunk_size: usize,
    pub tcp_host: String,
    pub tcp_port: u16,
    pub direction: Direction,
    pub status: SessionStatus,
}

/// `backup_download_start` request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadStartRequest {
    pub session_id: String,
    pub token: String,
    #[serde(default)]
    pub offset: u64,
}

/// `backup_upload_status` request, sent after FILE_DONE.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadStatusRequest {
    pub session_id: String,
    pub token: String,
}

/// Outcome of an upload as seen by the hub.
///
/// `completed` means the file was stored; any other status means the
/// session is still open (`active`, `pending`) or failed (`error`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadStatus {
    pub session_id: String,
    pub status: SessionStatus,
    /// Bytes the hub holds for this upload.
    pub offset: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stored_name: Option<String>,
}

/// One stored backup version, as listed by `admin_list_backups`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupVersion {
    pub id: u64,
    pub device_id: String,
    pub logical_path: String,
    pub file_name: String,
    pub stored_name: String,
    pub version: u32,
    pub size: u64,
    pub created_at: String,
}

/// `admin_list_backups` request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListBackupsRequest {
    pub device_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logical_path: Option<String>,
}

// ---------------------------------------------------------------------------
// Administration
// ---------------------------------------------------------------------------

/// `admin_send_command` request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdminSendCommand {
    pub device_id: String,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<CommandKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

/// `admin_send_command` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminSendCommandResult {
    pub id: u64,
    pub status: CommandStatus,
    pub sent: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// `admin_list_tree` request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListTreeRequest {
    pub device_id: String,
}

/// Entry of `admin_list_devices`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSummary {
    pub uuid: String,
    pub name: String,
    pub online: bool,
}

// ---------------------------------------------------------------------------
// Agent command arguments
// ---------------------------------------------------------------------------

/// Argument of the agent's `get_logs` command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetLogsArgs {
    #[serde(default)]
    pub lines: Option<usize>,
}

/// Argument of the agent's `backup` command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupArgs {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logical_path: Option<String>,
}

/// Argument of the agent's `backup_auto` command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupAutoArgs {
    #[serde(default)]
    pub interval_sec: Option<u64>,
}

/// Argument of the agent's `restore` command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreArgs {
    pub file_name: String,
    pub dest_path: String,
}

/// Argument of the agent's reserved `stop` command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopArgs {
    pub name: String,
}
