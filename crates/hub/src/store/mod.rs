//! Repository seams consumed by the hub.
//!
//! Persistence is external; the hub only needs these queries. An
//! in-memory implementation ships for single-process deployments and
//! tests.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use warden_protocol::messages::{BackupVersion, FileChange};
use warden_protocol::{CommandKind, CommandStatus};

pub use memory::MemoryStore;

/// Errors returned by repository implementations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("storage error: {0}")]
    Internal(String),
}

/// A known device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub uuid: String,
    pub name: String,
    pub os_name: String,
    pub os_version: String,
    pub hostname: String,
    pub arch: String,
    pub last_seen: DateTime<Utc>,
}

/// An authenticated operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub username: String,
    pub role: String,
}

/// Input for [`CommandStore::create_command`].
#[derive(Debug, Clone)]
pub struct NewCommand {
    pub device_id: String,
    pub command: String,
    pub kind: CommandKind,
    pub payload: Option<serde_json::Value>,
}

/// A command queued for a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedCommand {
    pub id: u64,
    pub device_id: String,
    pub command: String,
    pub kind: CommandKind,
    pub payload: Option<serde_json::Value>,
    pub status: CommandStatus,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
}

/// Input for [`BackupStore::record_backup`].
#[derive(Debug, Clone)]
pub struct NewBackup {
    pub device_id: String,
    pub logical_path: String,
    pub file_name: String,
    pub stored_name: String,
    pub size: u64,
}

/// One stored version of a backed-up file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupRecord {
    pub id: u64,
    pub device_id: String,
    pub logical_path: String,
    pub file_name: String,
    pub stored_name: String,
    pub version: u32,
    pub size: u64,
    pub created_at: DateTime<Utc>,
}

impl BackupRecord {
    pub fn to_message(&self) -> BackupVersion {
        BackupVersion {
            id: self.id,
            device_id: self.device_id.clone(),
            logical_path: self.logical_path.clone(),
            file_name: self.file_name.clone(),
            stored_name: self.stored_name.clone(),
            version: self.version,
            size: self.size,
            created_at: self.created_at.to_rfc3339(),
        }
    }
}

#[async_trait]
pub trait UserStore: Send + Sync {
    /// Returns the user if the credentials match.
    async fn verify_credentials(
        &self,
        username: &str,
        password: &str,
    ) -> Result<Option<User>, StoreError>;
}

#[async_trait]
pub trait DeviceStore: Send + Sync {
    async fn upsert_device(&self, device: DeviceRecord) -> Result<(), StoreError>;
    async fn get_device(&self, uuid: &str) -> Result<Option<DeviceRecord>, StoreError>;
    async fn list_devices(&self) -> Result<Vec<DeviceRecord>, StoreError>;
}

#[async_trait]
pub trait FileTreeStore: Send + Sync {
    /// Applies a batch of changes; returns how many nodes were touched.
    async fn apply_changes(
        &self,
        device_id: &str,
        changes: Vec<FileChange>,
    ) -> Result<usize, StoreError>;

    /// Current (non-deleted) nodes of a device, ordered by path.
    async fn list_nodes(&self, device_id: &str) -> Result<Vec<FileChange>, StoreError>;
}

#[async_trait]
pub trait AgentLogStore: Send + Sync {
    async fn append_logs(&self, device_id: &str, lines: Vec<String>) -> Result<(), StoreError>;

    /// Last `limit` lines, oldest first.
    async fn recent_logs(&self, device_id: &str, limit: usize) -> Result<Vec<String>, StoreError>;
}

#[async_trait]
pub trait CommandStore: Send + Sync {
    /// Inserts a command with status `pending`.
    async fn create_command(&self, cmd: NewCommand) -> Result<QueuedCommand, StoreError>;

    async fn get_command(&self, id: u64) -> Result<Option<QueuedCommand>, StoreError>;

    /// Commands of a device in creation order; pending and failed only
    /// unless `include_sent`.
    async fn list_by_device(
        &self,
        device_id: &str,
        include_sent: bool,
    ) -> Result<Vec<QueuedCommand>, StoreError>;

    async fn mark_sent(&self, id: u64) -> Result<(), StoreError>;

    async fn update_status(
        &self,
        id: u64,
        status: CommandStatus,
        error: Option<String>,
    ) -> Result<(), StoreError>;
}

#[async_trait]
pub trait BackupStore: Send + Sync {
    /// Stores a backup under the next version number of its logical path.
    async fn record_backup(&self, backup: NewBackup) -> Result<BackupRecord, StoreError>;

    /// Backups of a device, newest version first per path.
    async fn list_backups(
        &self,
        device_id: &str,
        logical_path: Option<&str>,
    ) -> Result<Vec<BackupRecord>, StoreError>;
}

/// Every repository the hub consults.
pub trait Repository:
    UserStore + DeviceStore + FileTreeStore + AgentLogStore + CommandStore + BackupStore
{
}

impl<T> Repository for T where
    T: UserStore + DeviceStore + FileTreeStore + AgentLogStore + CommandStore + BackupStore
{
}
