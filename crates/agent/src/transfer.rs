//! Agent side of chunked backup and restore.

use std::path::Path;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use warden_protocol::constants::{
    ACTION_BACKUP_DOWNLOAD_START, ACTION_BACKUP_INIT_DOWNLOAD, ACTION_BACKUP_INIT_UPLOAD,
    ACTION_BACKUP_UPLOAD_STATUS,
};
use warden_protocol::messages::{
    DownloadStartRequest, InitDownloadRequest, InitUploadRequest, SessionDescriptor,
    UploadStatus, UploadStatusRequest,
};
use warden_protocol::{Frame, SessionStatus};
use warden_transfer::{ChunkReader, file_checksum};

use crate::AgentError;
use crate::manager::{ConnectionManager, part_path};

/// Summary of a finished upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReport {
    pub session_id: String,
    pub file_size: u64,
    /// Offset the hub already had when the upload started.
    pub resumed_from: u64,
    pub chunks: usize,
}

/// Time an in-flight chunk write may take to finish after cancellation
/// before the connection is dropped.
const CANCEL_DRAIN: Duration = Duration::from_secs(2);

/// Uploads `path` to the hub as a backup of `logical_path`.
///
/// If the hub holds a partial copy from an earlier attempt, only the
/// missing tail is sent. Succeeds only once the hub reports the file as
/// stored. Cancellation is checked between chunks; the partial copy stays
/// on the hub for the next attempt.
pub async fn upload_file(
    manager: &ConnectionManager,
    path: &Path,
    logical_path: Option<&str>,
    cancel: &CancellationToken,
) -> Result<UploadReport, AgentError> {
    let meta = tokio::fs::metadata(path).await?;
    if !meta.is_file() {
        return Err(AgentError::InvalidArgument(format!(
            "{} is not a regular file",
            path.display()
        )));
    }
    if meta.len() == 0 {
        return Err(AgentError::InvalidArgument(format!(
            "{} is empty",
            path.display()
        )));
    }
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| AgentError::InvalidArgument(format!("{} has no file name", path.display())))?;
    let logical_path = logical_path
        .map(str::to_string)
        .unwrap_or_else(|| path.to_string_lossy().into_owned());

    let req = InitUploadRequest {
        file_name,
        file_size: meta.len(),
        checksum: Some(file_checksum(path).await?),
        logical_path: Some(logical_path),
    };
    if cancel.is_cancelled() {
        return Err(AgentError::Cancelled);
    }
    let desc: SessionDescriptor = manager
        .request_json(ACTION_BACKUP_INIT_UPLOAD, Some(&req))
        .await?;
    debug!(
        session = %desc.session_id,
        offset = desc.offset,
        chunk_size = desc.chunk_size,
        "upload session opened"
    );

    let mut reader = ChunkReader::open(path, desc.chunk_size).await?;
    if reader.file_size() != desc.file_size {
        return Err(AgentError::InvalidArgument(format!(
            "{} changed while uploading",
            path.display()
        )));
    }
    reader.seek_to(desc.offset).await?;

    let mut chunks = 0;
    loop {
        if cancel.is_cancelled() {
            info!(session = %desc.session_id, sent = chunks, "upload cancelled");
            return Err(AgentError::Cancelled);
        }
        let Some((offset, data)) = reader.next_chunk().await? else {
            break;
        };
        let frame = Frame::FileChunk {
            session_id: desc.session_id.clone(),
            token: desc.token.clone(),
            offset,
            data,
        };
        send_cancellable(manager, &frame, cancel).await?;
        chunks += 1;
    }
    manager
        .send_frame(&Frame::FileDone {
            session_id: desc.session_id.clone(),
            token: desc.token.clone(),
        })
        .await?;

    // Answered after FILE_DONE has been handled, since the hub processes a
    // connection's frames in order.
    let status_req = UploadStatusRequest {
        session_id: desc.session_id.clone(),
        token: desc.token.clone(),
    };
    let outcome: UploadStatus = manager
        .request_json(ACTION_BACKUP_UPLOAD_STATUS, Some(&status_req))
        .await?;
    if outcome.status != SessionStatus::Completed {
        warn!(
            session = %desc.session_id,
            path = %path.display(),
            status = ?outcome.status,
            offset = outcome.offset,
            "hub did not store upload"
        );
        return Err(AgentError::UploadNotStored {
            session_id: desc.session_id,
            status: outcome.status,
            offset: outcome.offset,
        });
    }

    info!(
        session = %desc.session_id,
        path = %path.display(),
        size = desc.file_size,
        resumed_from = desc.offset,
        chunks,
        stored = outcome.stored_name.as_deref().unwrap_or_default(),
        "upload complete"
    );
    Ok(UploadReport {
        session_id: desc.session_id,
        file_size: desc.file_size,
        resumed_from: desc.offset,
        chunks,
    })
}

/// Sends one frame, giving up once `cancel` fires.
///
/// A write already in progress gets [`CANCEL_DRAIN`] to finish; after that
/// the frame is cut short, so the connection is dropped.
async fn send_cancellable(
    manager: &ConnectionManager,
    frame: &Frame,
    cancel: &CancellationToken,
) -> Result<(), AgentError> {
    let send = manager.send_frame(frame);
    tokio::pin!(send);
    tokio::select! {
        biased;
        result = &mut send => result,
        _ = cancel.cancelled() => {
            match tokio::time::timeout(CANCEL_DRAIN, &mut send).await {
                Ok(result) => result?,
                Err(_) => manager.drop_connection().await,
            }
            Err(AgentError::Cancelled)
        }
    }
}

/// Downloads the stored backup `file_name` to `dest`.
///
/// Bytes land in `<dest>.part` first; an existing partial file is resumed.
/// Returns the final file size.
pub async fn download_file(
    manager: &ConnectionManager,
    file_name: &str,
    dest: &Path,
) -> Result<u64, AgentError> {
    if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }

    let req = InitDownloadRequest {
        file_name: file_name.to_string(),
    };
    let desc: SessionDescriptor = manager
        .request_json(ACTION_BACKUP_INIT_DOWNLOAD, Some(&req))
        .await?;

    let part = part_path(dest);
    let offset = match tokio::fs::metadata(&part).await {
        Ok(meta) if meta.len() <= desc.file_size => meta.len(),
        Ok(_) => {
            warn!(path = %part.display(), "partial download larger than source, restarting");
            tokio::fs::remove_file(&part).await?;
            0
        }
        Err(_) => 0,
    };

    let done = manager.register_download(&desc, dest).await;
    let start = DownloadStartRequest {
        session_id: desc.session_id.clone(),
        token: desc.token.clone(),
        offset,
    };
    if let Err(e) = manager
        .request(ACTION_BACKUP_DOWNLOAD_START, Some(&start))
        .await
    {
        manager.cancel_download(&desc.session_id).await;
        return Err(e);
    }
    debug!(session = %desc.session_id, offset, "download started");

    done.await.map_err(|_| AgentError::Closed)?
}
