//! Periodic file-tree snapshots and `filetree_sync` batches.
//!
//! Monitor paths are walked on every tick (size + mtime, no OS watcher);
//! the difference to the previous snapshot is reported to the hub.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use warden_protocol::constants::ACTION_FILETREE_SYNC;
use warden_protocol::messages::FileChange;

use crate::AgentError;
use crate::manager::{ConnectionManager, ConnectionState};

/// Maximum number of changes per `filetree_sync` command.
pub const SYNC_BATCH_SIZE: usize = 256;

/// Default interval between scans.
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(10);

/// What the scanner remembers about one path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entry {
    pub size: u64,
    pub modified: Option<SystemTime>,
    pub is_dir: bool,
}

/// Path -> entry for everything under the monitor paths.
pub type Snapshot = BTreeMap<PathBuf, Entry>;

/// Walks `roots` recursively. Unreadable entries are skipped.
pub async fn scan(roots: &[PathBuf]) -> Snapshot {
    let mut snapshot = Snapshot::new();
    let mut stack: Vec<PathBuf> = roots.to_vec();

    while let Some(path) = stack.pop() {
        let meta = match tokio::fs::symlink_metadata(&path).await {
            Ok(meta) => meta,
            Err(e) => {
                debug!(path = %path.display(), "skipping: {e}");
                continue;
            }
        };
        if meta.file_type().is_symlink() {
            continue;
        }
        let is_dir = meta.is_dir();
        if is_dir {
            match tokio::fs::read_dir(&path).await {
                Ok(mut dir) => {
                    while let Ok(Some(entry)) = dir.next_entry().await {
                        stack.push(entry.path());
                    }
                }
                Err(e) => debug!(path = %path.display(), "cannot list: {e}"),
            }
        }
        snapshot.insert(
            path,
            Entry {
                size: if is_dir { 0 } else { meta.len() },
                modified: meta.modified().ok(),
                is_dir,
            },
        );
    }
    snapshot
}

/// Paths that are new or changed in `current`, and paths gone from it.
pub fn diff(previous: &Snapshot, current: &Snapshot) -> (Vec<PathBuf>, Vec<PathBuf>) {
    let changed = current
        .iter()
        .filter(|(path, entry)| previous.get(*path) != Some(*entry))
        .map(|(path, _)| path.clone())
        .collect();
    let deleted = previous
        .keys()
        .filter(|path| !current.contains_key(*path))
        .cloned()
        .collect();
    (changed, deleted)
}

/// Stable node id for a path.
pub fn node_id(path: &Path) -> String {
    let digest = Sha256::digest(path.to_string_lossy().as_bytes());
    hex::encode(&digest[..16])
}

fn change_record(path: &Path, entry: Option<&Entry>, snapshot_number: u64) -> FileChange {
    let display = path.to_string_lossy().into_owned();
    FileChange {
        id: node_id(path),
        origin_path: display.clone(),
        cur_path: display,
        cur_name: path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        cur_ext: path
            .extension()
            .map(|e| e.to_string_lossy().into_owned())
            .unwrap_or_default(),
        total_size: entry.map(|e| e.size).unwrap_or_default(),
        snapshot_number,
        is_dir: entry.is_some_and(|e| e.is_dir),
        deleted: entry.is_none(),
        change_pending: false,
        content_type_ids: Vec::new(),
    }
}

/// Builds the change records between two snapshots.
pub fn changes(previous: &Snapshot, current: &Snapshot, snapshot_number: u64) -> Vec<FileChange> {
    let (changed, deleted) = diff(previous, current);
    changed
        .iter()
        .map(|p| change_record(p, current.get(p), snapshot_number))
        .chain(deleted.iter().map(|p| change_record(p, None, snapshot_number)))
        .collect()
}

/// Sends `changes` as `filetree_sync` batches of at most [`SYNC_BATCH_SIZE`].
pub async fn send_changes(
    manager: &ConnectionManager,
    changes: &[FileChange],
) -> Result<(), AgentError> {
    for batch in changes.chunks(SYNC_BATCH_SIZE) {
        manager
            .request(ACTION_FILETREE_SYNC, Some(&batch))
            .await?;
    }
    Ok(())
}

/// Scans `roots` every `interval` and reports changes while connected.
///
/// The baseline only advances after a successful sync, so changes made
/// while offline are reported on the next connected tick.
pub async fn run_sync(
    manager: &ConnectionManager,
    roots: Vec<PathBuf>,
    interval: Duration,
    cancel: CancellationToken,
) {
    if roots.is_empty() {
        debug!("no monitor paths, file-tree sync disabled");
        return;
    }
    let mut reported = Snapshot::new();
    let mut snapshot_number = 0u64;
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        if manager.state() != ConnectionState::Connected {
            continue;
        }

        let current = scan(&roots).await;
        let batch = changes(&reported, &current, snapshot_number + 1);
        if batch.is_empty() {
            continue;
        }
        match send_changes(manager, &batch).await {
            Ok(()) => {
                snapshot_number += 1;
                info!(changes = batch.len(), snapshot = snapshot_number, "file tree synced");
                reported = current;
            }
            Err(e) if e.is_unauthorized() => debug!("file-tree sync waiting for login"),
            Err(e) => warn!("file-tree sync failed: {e}"),
        }
    }
}
