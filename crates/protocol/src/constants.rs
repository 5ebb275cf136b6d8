use std::time::Duration;

/// Size of the frame header: 1 type byte + 4 byte big-endian length.
pub const FRAME_HEADER_LEN: usize = 5;

/// Maximum frame payload accepted from the wire.
///
/// Leaves room for a full [`DEFAULT_CHUNK_SIZE`] chunk plus the
/// session id / token / offset header fields of a FILE_CHUNK frame.
pub const MAX_PAYLOAD: usize = 1024 * 1024 + 4096;

/// Maximum device id length in bytes.
pub const MAX_DEVICE_ID_LEN: usize = 255;

/// Maximum bearer token length in bytes.
pub const MAX_TOKEN_LEN: usize = 1024;

/// Maximum transfer session id length in bytes.
pub const MAX_SESSION_ID_LEN: usize = 128;

/// Maximum file name length in bytes.
pub const MAX_FILE_NAME_LEN: usize = 512;

/// Maximum ACK/ERROR status message length in bytes.
///
/// Responses larger than this are answered with [`STATUS_TOO_LARGE`]
/// instead of being truncated.
pub const MAX_STATUS_MESSAGE_LEN: usize = 3800;

/// Default transfer chunk size (512 KiB).
pub const DEFAULT_CHUNK_SIZE: usize = 512 * 1024;

/// Default TCP port of the hub.
pub const DEFAULT_TCP_PORT: u16 = 9200;

/// Time allowed to establish an outbound TCP connection.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Time an agent waits for the ACK of a sub-command.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Time the hub allows one frame write to a device before dropping it.
pub const SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Default idle time after which a transfer session is reaped.
pub const SESSION_IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

// Status codes carried by ACK / ERROR frames.

pub const STATUS_OK: u16 = 200;
pub const STATUS_BAD_REQUEST: u16 = 400;
pub const STATUS_UNAUTHORIZED: u16 = 401;
pub const STATUS_NOT_FOUND: u16 = 404;
pub const STATUS_TOO_LARGE: u16 = 413;
pub const STATUS_INTERNAL: u16 = 500;

// Sub-command actions handled by the hub.

pub const ACTION_PING: &str = "ping";
pub const ACTION_LOGIN: &str = "login";
pub const ACTION_DEVICE_REGISTER: &str = "device_register";
pub const ACTION_FILETREE_SYNC: &str = "filetree_sync";
pub const ACTION_AGENT_LOG: &str = "agent_log";
pub const ACTION_BACKUP_INIT_UPLOAD: &str = "backup_init_upload";
pub const ACTION_BACKUP_INIT_DOWNLOAD: &str = "backup_init_download";
pub const ACTION_BACKUP_DOWNLOAD_START: &str = "backup_download_start";
pub const ACTION_BACKUP_UPLOAD_STATUS: &str = "backup_upload_status";
pub const ACTION_ADMIN_SEND_COMMAND: &str = "admin_send_command";
pub const ACTION_ADMIN_LIST_DEVICES: &str = "admin_list_devices";
pub const ACTION_ADMIN_LIST_ONLINE: &str = "admin_list_online";
pub const ACTION_ADMIN_LIST_TREE: &str = "admin_list_tree";
pub const ACTION_ADMIN_LIST_BACKUPS: &str = "admin_list_backups";

/// Actions the hub serves without a prior device login.
pub const AUTH_BYPASS_ACTIONS: &[&str] = &[
    ACTION_PING,
    ACTION_LOGIN,
    ACTION_ADMIN_SEND_COMMAND,
    ACTION_ADMIN_LIST_DEVICES,
    ACTION_ADMIN_LIST_ONLINE,
    ACTION_ADMIN_LIST_TREE,
    ACTION_ADMIN_LIST_BACKUPS,
];

/// Returns `true` if `action` may run on an unauthenticated connection.
pub fn bypasses_auth(action: &str) -> bool {
    AUTH_BYPASS_ACTIONS.contains(&action)
}

// Commands queued for agents.
pub const COMMAND_GET_LOGS: &str = "get_logs";
pub const COMMAND_BACKUP: &str = "backup";
pub const COMMAND_BACKUP_AUTO: &str = "backup_auto";
pub const COMMAND_RESTORE: &str = "restore";
/// Reserved: stops a running stream command (`{name}`).
pub const STOP_COMMAND: &str = "stop";
