use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use warden_protocol::constants::{DEFAULT_CHUNK_SIZE, DEFAULT_TCP_PORT, SESSION_IDLE_TIMEOUT};
use warden_protocol::messages::{InitDownloadRequest, InitUploadRequest};
use warden_protocol::{Direction, SessionStatus};

use crate::chunked::{file_checksum, sync_file, write_at};
use crate::session::TransferSession;
use crate::token::{generate_token, session_id, tokens_match};
use crate::validation::{sanitize_file_name, validate_device_id};
use crate::TransferError;

/// Directory (under each device dir) holding in-progress uploads.
const PARTIAL_DIR: &str = ".partial";

/// Settings for the session manager.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Root of the backup store; each device gets a subdirectory.
    pub storage_dir: PathBuf,
    pub chunk_size: usize,
    /// Address advertised to agents in session descriptors.
    pub tcp_host: String,
    pub tcp_port: u16,
    /// Sessions without activity for this long are reaped.
    pub idle_timeout: Duration,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            storage_dir: PathBuf::from("backups"),
            chunk_size: DEFAULT_CHUNK_SIZE,
            tcp_host: "127.0.0.1".into(),
            tcp_port: DEFAULT_TCP_PORT,
            idle_timeout: SESSION_IDLE_TIMEOUT,
        }
    }
}

/// Summary of a successfully finalized upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedUpload {
    pub session_id: String,
    pub device_id: String,
    pub file_name: String,
    pub logical_path: String,
    /// File name inside the device directory.
    pub stored_name: String,
    pub final_path: PathBuf,
    pub size: u64,
}

/// Tracks every in-flight transfer session.
///
/// The map lock is never held across file I/O: session fields are copied
/// out, the I/O runs, then the map is updated again.
pub struct SessionManager {
    config: TransferConfig,
    sessions: RwLock<HashMap<String, TransferSession>>,
}

impl SessionManager {
    pub fn new(config: TransferConfig) -> Self {
        Self {
            config,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// Storage directory of one device.
    pub fn device_dir(&self, device_id: &str) -> PathBuf {
        self.config.storage_dir.join(device_id)
    }

    /// Opens (or resumes) an upload.
    ///
    /// The temp file is keyed by logical path, size and checksum, so
    /// re-initiating the same upload resumes from the bytes already on
    /// disk. Any older session writing to the same temp file is dropped.
    pub async fn prepare_upload(
        &self,
        device_id: &str,
        req: &InitUploadRequest,
    ) -> Result<TransferSession, TransferError> {
        validate_device_id(device_id)?;
        let file_name = sanitize_file_name(&req.file_name)?;
        if req.file_size == 0 {
            return Err(TransferError::InvalidRequest(
                "file_size must be positive".into(),
            ));
        }
        let logical_path = req
            .logical_path
            .clone()
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| file_name.clone());
        let checksum = req.checksum.clone().filter(|c| !c.is_empty());

        let device_dir = self.device_dir(device_id);
        let partial_dir = device_dir.join(PARTIAL_DIR);
        tokio::fs::create_dir_all(&partial_dir).await?;

        let temp_path = partial_dir.join(format!(
            "{}.part",
            partial_key(&logical_path, req.file_size, checksum.as_deref())
        ));
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&temp_path)
            .await?;
        let mut offset = file.metadata().await?.len();
        // A full-length partial that fails its checksum cannot be resumed.
        let restart = match (&checksum, offset.cmp(&req.file_size)) {
            (_, std::cmp::Ordering::Greater) => true,
            (Some(expected), std::cmp::Ordering::Equal) => {
                !file_checksum(&temp_path).await?.eq_ignore_ascii_case(expected)
            }
            _ => false,
        };
        if restart {
            debug!(temp = %temp_path.display(), "partial file unusable, restarting");
            file.set_len(0).await?;
            offset = 0;
        }
        drop(file);

        let final_path = device_dir.join(format!("{}_{}", unix_millis(), file_name));
        let now = Instant::now();

        let mut sessions = self.sessions.write().await;
        sessions.retain(|id, s| {
            let stale = s.temp_path.as_deref() == Some(temp_path.as_path());
            if stale {
                debug!(session = %id, "superseded by new upload of same file");
            }
            !stale
        });
        let session = TransferSession {
            session_id: unique_session_id(&sessions, Direction::Upload),
            token: generate_token(),
            direction: Direction::Upload,
            device_id: device_id.to_string(),
            file_name,
            logical_path,
            file_size: req.file_size,
            offset,
            chunk_size: self.config.chunk_size,
            status: SessionStatus::Pending,
            temp_path: Some(temp_path),
            final_path,
            checksum,
            created_at: now,
            updated_at: now,
        };
        sessions.insert(session.session_id.clone(), session.clone());

        info!(
            session = %session.session_id,
            device = %device_id,
            file = %session.file_name,
            size = session.file_size,
            offset,
            "upload session prepared"
        );
        Ok(session)
    }

    /// Opens a download of a stored file.
    ///
    /// `file_name` is either a stored name or an original file name, in
    /// which case the newest stored version is used.
    pub async fn prepare_download(
        &self,
        device_id: &str,
        req: &InitDownloadRequest,
    ) -> Result<TransferSession, TransferError> {
        validate_device_id(device_id)?;
        let file_name = sanitize_file_name(&req.file_name)?;
        let device_dir = self.device_dir(device_id);
        let path = resolve_stored(&device_dir, &file_name)
            .await
            .ok_or_else(|| TransferError::FileNotFound(file_name.clone()))?;
        let file_size = tokio::fs::metadata(&path).await?.len();
        let now = Instant::now();

        let mut sessions = self.sessions.write().await;
        let session = TransferSession {
            session_id: unique_session_id(&sessions, Direction::Download),
            token: generate_token(),
            direction: Direction::Download,
            device_id: device_id.to_string(),
            logical_path: file_name.clone(),
            file_name,
            file_size,
            offset: 0,
            chunk_size: self.config.chunk_size,
            status: SessionStatus::Pending,
            temp_path: None,
            final_path: path,
            checksum: None,
            created_at: now,
            updated_at: now,
        };
        sessions.insert(session.session_id.clone(), session.clone());

        info!(
            session = %session.session_id,
            device = %device_id,
            file = %session.file_name,
            size = file_size,
            "download session prepared"
        );
        Ok(session)
    }

    /// Checks id, token and direction; returns a snapshot of the session.
    pub async fn validate(
        &self,
        session_id: &str,
        token: &str,
        direction: Direction,
    ) -> Result<TransferSession, TransferError> {
        let sessions = self.sessions.read().await;
        let session = sessions
            .get(session_id)
            .ok_or(TransferError::InvalidSession("not found"))?;
        if !tokens_match(token, &session.token) {
            return Err(TransferError::InvalidSession("token mismatch"));
        }
        if session.direction != direction {
            return Err(TransferError::InvalidSession("direction mismatch"));
        }
        if matches!(session.status, SessionStatus::Error | SessionStatus::Completed) {
            return Err(TransferError::InvalidSession("session closed"));
        }
        Ok(session.clone())
    }

    /// Adds `n` bytes to the session offset and returns the new offset.
    pub async fn advance(&self, session_id: &str, n: u64) -> Result<u64, TransferError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(session_id)
            .ok_or(TransferError::InvalidSession("not found"))?;
        session.offset = session.offset.saturating_add(n);
        if session.status == SessionStatus::Pending {
            session.status = SessionStatus::Active;
        }
        session.updated_at = Instant::now();
        Ok(session.offset)
    }

    /// Validates an upload chunk, writes it at `offset` of the temp file,
    /// and advances the session.
    pub async fn write_chunk(
        &self,
        session_id: &str,
        token: &str,
        offset: u64,
        data: &[u8],
    ) -> Result<u64, TransferError> {
        let session = self.validate(session_id, token, Direction::Upload).await?;
        let end = offset
            .checked_add(data.len() as u64)
            .filter(|end| *end <= session.file_size)
            .ok_or_else(|| {
                TransferError::InvalidRequest(format!(
                    "chunk {offset}+{} past end of {}-byte file",
                    data.len(),
                    session.file_size
                ))
            })?;
        let temp_path = session
            .temp_path
            .as_deref()
            .ok_or(TransferError::InvalidSession("no temp file"))?;

        if let Err(e) = write_at(temp_path, offset, data).await {
            warn!(session = %session_id, "chunk write failed: {e}");
            self.set_status(session_id, SessionStatus::Error).await;
            return Err(e);
        }
        debug!(session = %session_id, offset, end, "chunk written");
        self.advance(session_id, data.len() as u64).await
    }

    /// Marks the session completed without touching the filesystem.
    pub async fn mark_completed(&self, session_id: &str) -> Result<(), TransferError> {
        if self.set_status(session_id, SessionStatus::Completed).await {
            Ok(())
        } else {
            Err(TransferError::InvalidSession("not found"))
        }
    }

    /// Completes an upload: verifies the temp file, renames it to the final
    /// path and drops the session.
    ///
    /// A short temp file leaves the session untouched so missing chunks can
    /// still arrive. A checksum mismatch or a failed rename moves the
    /// session to `error` and keeps the temp file on disk; the next
    /// `prepare_upload` of the same file restarts it.
    pub async fn finalize_upload(&self, session_id: &str) -> Result<CompletedUpload, TransferError> {
        let session = {
            let sessions = self.sessions.read().await;
            let session = sessions
                .get(session_id)
                .ok_or(TransferError::InvalidSession("not found"))?;
            if session.direction != Direction::Upload {
                return Err(TransferError::InvalidSession("direction mismatch"));
            }
            session.clone()
        };
        let temp_path = session
            .temp_path
            .clone()
            .ok_or(TransferError::InvalidSession("no temp file"))?;

        let actual = match tokio::fs::metadata(&temp_path).await {
            Ok(meta) => meta.len(),
            Err(e) => {
                self.set_status(session_id, SessionStatus::Error).await;
                return Err(e.into());
            }
        };
        if actual != session.file_size {
            return Err(TransferError::Incomplete {
                expected: session.file_size,
                actual,
            });
        }

        if let Some(expected) = &session.checksum {
            let actual = file_checksum(&temp_path).await?;
            if !actual.eq_ignore_ascii_case(expected) {
                warn!(
                    session = %session_id,
                    temp = %temp_path.display(),
                    "checksum mismatch, keeping partial file"
                );
                self.set_status(session_id, SessionStatus::Error).await;
                return Err(TransferError::ChecksumMismatch);
            }
        }

        // Claim the session; a concurrent finalize of the same id loses here.
        {
            let mut sessions = self.sessions.write().await;
            let s = sessions
                .get_mut(session_id)
                .ok_or(TransferError::InvalidSession("not found"))?;
            if s.status == SessionStatus::Completed {
                return Err(TransferError::InvalidSession("session closed"));
            }
            s.status = SessionStatus::Completed;
            s.updated_at = Instant::now();
        }

        let renamed = match sync_file(&temp_path).await {
            Ok(()) => tokio::fs::rename(&temp_path, &session.final_path).await,
            Err(e) => Err(e),
        };
        if let Err(e) = renamed {
            warn!(
                session = %session_id,
                temp = %temp_path.display(),
                "rename failed, keeping partial file: {e}"
            );
            self.set_status(session_id, SessionStatus::Error).await;
            return Err(e.into());
        }

        self.sessions.write().await.remove(session_id);
        let stored_name = session
            .final_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        info!(
            session = %session_id,
            device = %session.device_id,
            path = %session.final_path.display(),
            size = session.file_size,
            "upload finalized"
        );
        Ok(CompletedUpload {
            session_id: session.session_id,
            device_id: session.device_id,
            file_name: session.file_name,
            logical_path: session.logical_path,
            stored_name,
            final_path: session.final_path,
            size: session.file_size,
        })
    }

    /// Returns a snapshot of a session.
    pub async fn get(&self, session_id: &str) -> Option<TransferSession> {
        self.sessions.read().await.get(session_id).cloned()
    }

    /// Drops a session from the active map.
    pub async fn remove(&self, session_id: &str) -> Option<TransferSession> {
        self.sessions.write().await.remove(session_id)
    }

    /// Number of tracked sessions.
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Removes sessions idle for longer than the configured timeout.
    pub async fn reap_idle(&self) -> Vec<String> {
        self.reap_idle_at(Instant::now()).await
    }

    /// Like [`reap_idle`](Self::reap_idle) with an explicit clock reading.
    ///
    /// Upload temp files stay on disk so the upload can be resumed.
    pub async fn reap_idle_at(&self, now: Instant) -> Vec<String> {
        let idle = self.config.idle_timeout;
        let mut sessions = self.sessions.write().await;
        let expired: Vec<String> = sessions
            .iter()
            .filter(|(_, s)| s.is_idle(now, idle))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            if let Some(s) = sessions.remove(id) {
                info!(
                    session = %id,
                    device = %s.device_id,
                    offset = s.offset,
                    "reaped idle transfer session"
                );
            }
        }
        expired
    }

    /// Runs [`reap_idle`](Self::reap_idle) periodically until `cancel` fires.
    pub fn spawn_reaper(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let period = (manager.config.idle_timeout / 4).max(Duration::from_secs(1));
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(period) => {
                        manager.reap_idle().await;
                    }
                }
            }
            debug!("session reaper stopped");
        })
    }

    async fn set_status(&self, session_id: &str, status: SessionStatus) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(session_id) {
            Some(s) => {
                s.status = status;
                s.updated_at = Instant::now();
                true
            }
            None => false,
        }
    }
}

fn unique_session_id(sessions: &HashMap<String, TransferSession>, direction: Direction) -> String {
    loop {
        let id = session_id(direction);
        if !sessions.contains_key(&id) {
            return id;
        }
    }
}

fn partial_key(logical_path: &str, file_size: u64, checksum: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(logical_path.as_bytes());
    hasher.update([0]);
    hasher.update(file_size.to_be_bytes());
    hasher.update([0]);
    hasher.update(checksum.unwrap_or_default().to_ascii_lowercase().as_bytes());
    hex::encode(hasher.finalize())
}

fn unix_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default()
}

/// Finds `name` in `dir`, falling back to the newest `<millis>_<name>`.
async fn resolve_stored(dir: &Path, name: &str) -> Option<PathBuf> {
    let exact = dir.join(name);
    if tokio::fs::metadata(&exact).await.is_ok_and(|m| m.is_file()) {
        return Some(exact);
    }

    let suffix = format!("_{name}");
    let mut entries = tokio::fs::read_dir(dir).await.ok()?;
    let mut best: Option<(u128, PathBuf)> = None;
    while let Ok(Some(entry)) = entries.next_entry().await {
        let entry_name = entry.file_name();
        let Some(entry_name) = entry_name.to_str() else {
            continue;
        };
        let Some(stamp) = entry_name
            .strip_suffix(&suffix)
            .and_then(|s| s.parse::<u128>().ok())
        else {
            continue;
        };
        if best.as_ref().is_none_or(|(b, _)| stamp > *b) {
            best = Some((stamp, entry.path()));
        }
    }
    best.map(|(_, p)| p)
}
