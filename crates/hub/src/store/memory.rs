//! In-memory repository.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::Utc;
use sha2::{Digest, Sha256};
use warden_protocol::CommandStatus;
use warden_protocol::messages::FileChange;
use warden_transfer::tokens_match;

use super::{
    AgentLogStore, BackupRecord, BackupStore, CommandStore, DeviceRecord, DeviceStore,
    FileTreeStore, NewBackup, NewCommand, QueuedCommand, StoreError, User, UserStore,
};

/// Lines of agent log kept per device.
const MAX_LOG_LINES: usize = 10_000;

/// In-memory implementation of every hub repository.
///
/// Data is lost on restart.
#[derive(Default)]
pub struct MemoryStore {
    users: RwLock<HashMap<String, StoredUser>>,
    devices: RwLock<BTreeMap<String, DeviceRecord>>,
    trees: RwLock<HashMap<String, BTreeMap<String, FileChange>>>,
    logs: RwLock<HashMap<String, VecDeque<String>>>,
    commands: RwLock<CommandTable>,
    backups: RwLock<Vec<BackupRecord>>,
}

struct StoredUser {
    digest: String,
    role: String,
}

#[derive(Default)]
struct CommandTable {
    next_id: u64,
    rows: BTreeMap<u64, QueuedCommand>,
}

fn poisoned<E: std::fmt::Display>(e: E) -> StoreError {
    StoreError::Internal(e.to_string())
}

fn password_digest(username: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(username.as_bytes());
    hasher.update([0]);
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces an operator account.
    pub fn add_user(&self, username: &str, password: &str, role: &str) -> Result<(), StoreError> {
        self.users.write().map_err(poisoned)?.insert(
            username.to_string(),
            StoredUser {
                digest: password_digest(username, password),
                role: role.to_string(),
            },
        );
        Ok(())
    }
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn verify_credentials(
        &self,
        username: &str,
        password: &str,
    ) -> Result<Option<User>, StoreError> {
        let users = self.users.read().map_err(poisoned)?;
        let Some(user) = users.get(username) else {
            return Ok(None);
        };
        if !tokens_match(&password_digest(username, password), &user.digest) {
            return Ok(None);
        }
        Ok(Some(User {
            username: username.to_string(),
            role: user.role.clone(),
        }))
    }
}

#[async_trait]
impl DeviceStore for MemoryStore {
    async fn upsert_device(&self, device: DeviceRecord) -> Result<(), StoreError> {
        self.devices
            .write()
            .map_err(poisoned)?
            .insert(device.uuid.clone(), device);
        Ok(())
    }

    async fn get_device(&self, uuid: &str) -> Result<Option<DeviceRecord>, StoreError> {
        Ok(self.devices.read().map_err(poisoned)?.get(uuid).cloned())
    }

    async fn list_devices(&self) -> Result<Vec<DeviceRecord>, StoreError> {
        Ok(self.devices.read().map_err(poisoned)?.values().cloned().collect())
    }
}

#[async_trait]
impl FileTreeStore for MemoryStore {
    async fn apply_changes(
        &self,
        device_id: &str,
        changes: Vec<FileChange>,
    ) -> Result<usize, StoreError> {
        let mut trees = self.trees.write().map_err(poisoned)?;
        let tree = trees.entry(device_id.to_string()).or_default();
        let count = changes.len();
        for change in changes {
            if change.deleted {
                tree.remove(&change.id);
            } else {
                tree.insert(change.id.clone(), change);
            }
        }
        Ok(count)
    }

    async fn list_nodes(&self, device_id: &str) -> Result<Vec<FileChange>, StoreError> {
        let trees = self.trees.read().map_err(poisoned)?;
        let mut nodes: Vec<FileChange> = trees
            .get(device_id)
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default();
        nodes.sort_by(|a, b| a.cur_path.cmp(&b.cur_path));
        Ok(nodes)
    }
}

#[async_trait]
impl AgentLogStore for MemoryStore {
    async fn append_logs(&self, device_id: &str, lines: Vec<String>) -> Result<(), StoreError> {
        let mut logs = self.logs.write().map_err(poisoned)?;
        let buf = logs.entry(device_id.to_string()).or_default();
        buf.extend(lines);
        while buf.len() > MAX_LOG_LINES {
            buf.pop_front();
        }
        Ok(())
    }

    async fn recent_logs(&self, device_id: &str, limit: usize) -> Result<Vec<String>, StoreError> {
        let logs = self.logs.read().map_err(poisoned)?;
        Ok(logs
            .get(device_id)
            .map(|buf| buf.iter().skip(buf.len().saturating_sub(limit)).cloned().collect())
            .unwrap_or_default())
    }
}

#[async_trait]
impl CommandStore for MemoryStore {
    async fn create_command(&self, cmd: NewCommand) -> Result<QueuedCommand, StoreError> {
        let mut table = self.commands.write().map_err(poisoned)?;
        table.next_id += 1;
        let record = QueuedCommand {
            id: table.next_id,
            device_id: cmd.device_id,
            command: cmd.command,
            kind: cmd.kind,
            payload: cmd.payload,
            status: CommandStatus::Pending,
            last_error: None,
            created_at: Utc::now(),
            sent_at: None,
        };
        table.rows.insert(record.id, record.clone());
        Ok(record)
    }

    async fn get_command(&self, id: u64) -> Result<Option<QueuedCommand>, StoreError> {
        Ok(self.commands.read().map_err(poisoned)?.rows.get(&id).cloned())
    }

    async fn list_by_device(
        &self,
        device_id: &str,
        include_sent: bool,
    ) -> Result<Vec<QueuedCommand>, StoreError> {
        let table = self.commands.read().map_err(poisoned)?;
        // BTreeMap iteration is in id (= creation) order.
        Ok(table
            .rows
            .values()
            .filter(|c| c.device_id == device_id)
            .filter(|c| include_sent || c.status != CommandStatus::Sent)
            .cloned()
            .collect())
    }

    async fn mark_sent(&self, id: u64) -> Result<(), StoreError> {
        let mut table = self.commands.write().map_err(poisoned)?;
        let row = table
            .rows
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("command {id}")))?;
        row.status = CommandStatus::Sent;
        row.last_error = None;
        row.sent_at = Some(Utc::now());
        Ok(())
    }

    async fn update_status(
        &self,
        id: u64,
        status: CommandStatus,
        error: Option<String>,
    ) -> Result<(), StoreError> {
        let mut table = self.commands.write().map_err(poisoned)?;
        let row = table
            .rows
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("command {id}")))?;
        row.status = status;
        row.last_error = error;
        if status == CommandStatus::Sent {
            row.sent_at = Some(Utc::now());
        }
        Ok(())
    }
}

#[async_trait]
impl BackupStore for MemoryStore {
    async fn record_backup(&self, backup: NewBackup) -> Result<BackupRecord, StoreError> {
        let mut backups = self.backups.write().map_err(poisoned)?;
        let version = backups
            .iter()
            .filter(|b| b.device_id == backup.device_id && b.logical_path == backup.logical_path)
            .map(|b| b.version)
            .max()
            .unwrap_or(0)
            + 1;
        let record = BackupRecord {
            id: backups.len() as u64 + 1,
            device_id: backup.device_id,
            logical_path: backup.logical_path,
            file_name: backup.file_name,
            stored_name: backup.stored_name,
            version,
            size: backup.size,
            created_at: Utc::now(),
        };
        backups.push(record.clone());
        Ok(record)
    }

    async fn list_backups(
        &self,
        device_id: &str,
        logical_path: Option<&str>,
    ) -> Result<Vec<BackupRecord>, StoreError> {
        let backups = self.backups.read().map_err(poisoned)?;
        let mut out: Vec<BackupRecord> = backups
            .iter()
            .filter(|b| b.device_id == device_id)
            .filter(|b| logical_path.is_none_or(|p| b.logical_path == p))
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            a.logical_path
                .cmp(&b.logical_path)
                .then(b.version.cmp(&a.version))
        });
        Ok(out)
    }
}
