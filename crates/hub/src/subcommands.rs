//! Handlers for the sub-commands carried in COMMAND frames.

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;
use warden_protocol::constants::{
    ACTION_ADMIN_LIST_BACKUPS, ACTION_ADMIN_LIST_DEVICES, ACTION_ADMIN_LIST_ONLINE,
    ACTION_ADMIN_LIST_TREE, ACTION_ADMIN_SEND_COMMAND, ACTION_AGENT_LOG,
    ACTION_BACKUP_DOWNLOAD_START, ACTION_BACKUP_INIT_DOWNLOAD, ACTION_BACKUP_INIT_UPLOAD,
    ACTION_BACKUP_UPLOAD_STATUS, ACTION_DEVICE_REGISTER, ACTION_FILETREE_SYNC, ACTION_LOGIN,
    ACTION_PING, MAX_DEVICE_ID_LEN, STATUS_BAD_REQUEST, STATUS_INTERNAL, STATUS_NOT_FOUND,
    STATUS_UNAUTHORIZED,
};
use warden_protocol::messages::{
    AdminSendCommand, AdminSendCommandResult, AgentLog, DeviceInfo, DeviceSummary,
    DownloadStartRequest, FileChange, InitDownloadRequest, InitUploadRequest, ListBackupsRequest,
    ListTreeRequest, LoginRequest, LoginResponse, UploadStatus, UploadStatusRequest,
};
use warden_protocol::{CommandStatus, Direction, SessionStatus, SubCommand};
use warden_transfer::{TransferError, TransferSession, tokens_match};

use crate::HubError;
use crate::auth::Claims;
use crate::router::{ConnState, Phase, Router};
use crate::store::{DeviceRecord, NewCommand, StoreError};

/// A sub-command failure, answered with an ACK carrying [`code`](Self::code).
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Internal(String),
}

impl CommandError {
    pub fn code(&self) -> u16 {
        match self {
            Self::BadRequest(_) => STATUS_BAD_REQUEST,
            Self::Unauthorized(_) => STATUS_UNAUTHORIZED,
            Self::NotFound(_) => STATUS_NOT_FOUND,
            Self::Internal(_) => STATUS_INTERNAL,
        }
    }
}

impl From<serde_json::Error> for CommandError {
    fn from(e: serde_json::Error) -> Self {
        Self::BadRequest(format!("invalid data: {e}"))
    }
}

impl From<StoreError> for CommandError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(what) => Self::NotFound(format!("not found: {what}")),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<TransferError> for CommandError {
    fn from(e: TransferError) -> Self {
        match e {
            TransferError::InvalidPath(_) | TransferError::InvalidRequest(_) => {
                Self::BadRequest(e.to_string())
            }
            TransferError::FileNotFound(_) => Self::NotFound(e.to_string()),
            TransferError::InvalidSession(_) => Self::Unauthorized(e.to_string()),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<HubError> for CommandError {
    fn from(e: HubError) -> Self {
        match e {
            HubError::Store(e) => e.into(),
            HubError::Transfer(e) => e.into(),
            HubError::Json(e) => e.into(),
            other => Self::Internal(other.to_string()),
        }
    }
}

/// Successful outcome of a sub-command.
pub(crate) enum Reply {
    /// ACK 200 with a plain message.
    Message(String),
    /// ACK 200 with a JSON body.
    Json(String),
    /// ACK 200 "download started" followed by the file stream.
    Download {
        session: TransferSession,
        offset: u64,
    },
}

fn json<T: Serialize>(value: &T) -> Result<Reply, CommandError> {
    serde_json::to_string(value)
        .map(Reply::Json)
        .map_err(|e| CommandError::Internal(format!("encoding response: {e}")))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

impl Router {
    pub(crate) async fn dispatch(
        &self,
        state: &mut ConnState,
        cmd: &SubCommand,
    ) -> Result<Reply, CommandError> {
        match cmd.action.as_str() {
            ACTION_PING => Ok(Reply::Message("pong".into())),
            ACTION_LOGIN => self.login(state, cmd.parse_data()?).await,
            ACTION_DEVICE_REGISTER => {
                let info: Option<DeviceInfo> = cmd.parse_data()?;
                self.device_register(state, info.unwrap_or_default()).await
            }
            ACTION_FILETREE_SYNC => self.filetree_sync(state, cmd.parse_data()?).await,
            ACTION_AGENT_LOG => self.agent_log(state, cmd.parse_data()?).await,
            ACTION_BACKUP_INIT_UPLOAD => self.init_upload(state, cmd.parse_data()?).await,
            ACTION_BACKUP_INIT_DOWNLOAD => self.init_download(state, cmd.parse_data()?).await,
            ACTION_BACKUP_DOWNLOAD_START => self.download_start(state, cmd.parse_data()?).await,
            ACTION_BACKUP_UPLOAD_STATUS => self.upload_status(state, cmd.parse_data()?).await,
            ACTION_ADMIN_SEND_COMMAND => self.admin_send_command(cmd.parse_data()?).await,
            ACTION_ADMIN_LIST_DEVICES => self.admin_list_devices().await,
            ACTION_ADMIN_LIST_ONLINE => self.admin_list_online(state).await,
            ACTION_ADMIN_LIST_TREE => {
                let req: ListTreeRequest = cmd.parse_data()?;
                json(&self.repo.list_nodes(&req.device_id).await?)
            }
            ACTION_ADMIN_LIST_BACKUPS => {
                let req: ListBackupsRequest = cmd.parse_data()?;
                let backups = self
                    .repo
                    .list_backups(&req.device_id, req.logical_path.as_deref())
                    .await?;
                json(&backups.iter().map(|b| b.to_message()).collect::<Vec<_>>())
            }
            _ => Err(CommandError::BadRequest("unknown action".into())),
        }
    }

    /// Authenticates operator credentials and issues a device-bound token.
    ///
    /// The device id comes from the request, then the connection's LOGIN
    /// frame; admin tools without either get a minted `admin-<uuid>` id.
    async fn login(&self, state: &mut ConnState, req: LoginRequest) -> Result<Reply, CommandError> {
        let requested = non_empty(req.device_id.clone());
        let known = requested.is_some() || state.device_id.is_some();
        let device_id = requested
            .or_else(|| state.device_id.clone())
            .unwrap_or_else(|| format!("admin-{}", Uuid::new_v4()));
        if device_id.len() > MAX_DEVICE_ID_LEN {
            return Err(CommandError::BadRequest("device id too long".into()));
        }

        let user = self
            .repo
            .verify_credentials(&req.username, &req.password)
            .await?
            .ok_or_else(|| CommandError::Unauthorized("invalid credentials".into()))?;

        let claims = Claims::new(&user.username, &user.role, &device_id, self.token_ttl);
        let token = self.signer.sign(&claims).map_err(HubError::from)?;

        self.cache_token(&device_id, &token).await;
        match state.device_id.as_deref() {
            Some(own) if own != device_id => self.cache_token(own, &token).await,
            Some(_) => {}
            None => state.device_id = Some(device_id.clone()),
        }
        state.phase = Phase::Authenticated;

        if known {
            let existing = self.repo.get_device(&device_id).await?;
            let record = merge_device(
                &device_id,
                existing,
                DeviceInfo {
                    uuid: None,
                    name: req.name,
                    os_name: req.os_name,
                    os_version: req.os_version,
                    hostname: req.hostname,
                    arch: req.arch,
                },
            );
            self.repo.upsert_device(record).await?;
        }

        info!(device = %device_id, user = %user.username, "operator logged in");
        json(&LoginResponse { token, device_id })
    }

    async fn device_register(
        &self,
        state: &ConnState,
        info: DeviceInfo,
    ) -> Result<Reply, CommandError> {
        let uuid = non_empty(info.uuid.clone())
            .or_else(|| state.device_id.clone())
            .ok_or_else(|| CommandError::BadRequest("missing uuid".into()))?;
        if uuid != state.device_id() {
            return Err(CommandError::BadRequest(
                "uuid does not match connection device".into(),
            ));
        }
        let existing = self.repo.get_device(&uuid).await?;
        self.repo
            .upsert_device(merge_device(&uuid, existing, info))
            .await?;
        debug!(device = %uuid, "device registered");
        Ok(Reply::Message("device registered".into()))
    }

    async fn filetree_sync(
        &self,
        state: &ConnState,
        changes: Vec<FileChange>,
    ) -> Result<Reply, CommandError> {
        let touched = self.repo.apply_changes(state.device_id(), changes).await?;
        debug!(device = %state.device_id(), touched, "file tree synced");
        Ok(Reply::Message("filetree synced".into()))
    }

    async fn agent_log(&self, state: &ConnState, log: AgentLog) -> Result<Reply, CommandError> {
        let lines: Vec<String> = log
            .lines
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(str::to_string)
            .collect();
        if lines.is_empty() {
            return Err(CommandError::BadRequest("empty log".into()));
        }
        self.repo.append_logs(state.device_id(), lines).await?;
        Ok(Reply::Message("log stored".into()))
    }

    async fn init_upload(
        &self,
        state: &mut ConnState,
        req: InitUploadRequest,
    ) -> Result<Reply, CommandError> {
        let session = self.sessions.prepare_upload(state.device_id(), &req).await?;
        state.uploads.insert(session.session_id.clone());
        self.descriptor(&session)
    }

    async fn init_download(
        &self,
        state: &ConnState,
        req: InitDownloadRequest,
    ) -> Result<Reply, CommandError> {
        let session = self
            .sessions
            .prepare_download(state.device_id(), &req)
            .await?;
        self.descriptor(&session)
    }

    fn descriptor(&self, session: &TransferSession) -> Result<Reply, CommandError> {
        let config = self.sessions.config();
        json(&session.descriptor(&config.tcp_host, config.tcp_port))
    }

    async fn download_start(
        &self,
        state: &ConnState,
        req: DownloadStartRequest,
    ) -> Result<Reply, CommandError> {
        if req.session_id.is_empty() || req.token.is_empty() {
            return Err(CommandError::BadRequest("missing session id or token".into()));
        }
        let session = self
            .sessions
            .validate(&req.session_id, &req.token, Direction::Download)
            .await?;
        if session.device_id != state.device_id() {
            return Err(CommandError::Unauthorized("invalid session".into()));
        }
        if req.offset > session.file_size {
            return Err(CommandError::BadRequest("offset beyond end of file".into()));
        }
        Ok(Reply::Download {
            session,
            offset: req.offset,
        })
    }

    /// Reports how an upload ended. Frames of one connection are handled
    /// in order, so asked right after FILE_DONE this sees its outcome.
    async fn upload_status(
        &self,
        state: &mut ConnState,
        req: UploadStatusRequest,
    ) -> Result<Reply, CommandError> {
        if req.session_id.is_empty() || req.token.is_empty() {
            return Err(CommandError::BadRequest("missing session id or token".into()));
        }
        let finished = state
            .finished
            .get(&req.session_id)
            .filter(|(token, _)| tokens_match(&req.token, token))
            .map(|(_, stored_name)| stored_name.clone());
        if let Some(stored_name) = finished {
            state.finished.remove(&req.session_id);
            return json(&UploadStatus {
                session_id: req.session_id,
                status: SessionStatus::Completed,
                offset: 0,
                stored_name: Some(stored_name),
            });
        }

        let session = self
            .sessions
            .get(&req.session_id)
            .await
            .filter(|s| s.direction == Direction::Upload)
            .filter(|s| s.device_id == state.device_id())
            .filter(|s| tokens_match(&req.token, &s.token))
            .ok_or_else(|| CommandError::NotFound("unknown upload session".into()))?;
        json(&UploadStatus {
            session_id: session.session_id,
            status: session.status,
            offset: session.offset,
            stored_name: None,
        })
    }

    async fn admin_send_command(&self, req: AdminSendCommand) -> Result<Reply, CommandError> {
        if req.device_id.is_empty() || req.command.is_empty() {
            return Err(CommandError::BadRequest("missing device_id or command".into()));
        }
        let record = self
            .queue
            .enqueue(NewCommand {
                device_id: req.device_id,
                command: req.command,
                kind: req.kind.unwrap_or_default(),
                payload: req.payload,
            })
            .await?;
        json(&AdminSendCommandResult {
            id: record.id,
            status: record.status,
            sent: record.status == CommandStatus::Sent,
            error: record.last_error,
        })
    }

    async fn admin_list_devices(&self) -> Result<Reply, CommandError> {
        let devices = self.repo.list_devices().await?;
        let mut out = Vec::with_capacity(devices.len());
        for d in devices {
            let online = self.hub.is_online(&d.uuid).await;
            out.push(DeviceSummary {
                uuid: d.uuid,
                name: d.name,
                online,
            });
        }
        json(&out)
    }

    /// Online device ids other than the caller's own.
    async fn admin_list_online(&self, state: &ConnState) -> Result<Reply, CommandError> {
        let own = state.device_id();
        let online: Vec<String> = self
            .hub
            .online_devices()
            .await
            .into_iter()
            .filter(|d| d != own)
            .collect();
        json(&online)
    }
}

/// Overlays the fields present in `info` on an existing record.
fn merge_device(uuid: &str, existing: Option<DeviceRecord>, info: DeviceInfo) -> DeviceRecord {
    let base = existing.unwrap_or_else(|| DeviceRecord {
        uuid: uuid.to_string(),
        name: String::new(),
        os_name: String::new(),
        os_version: String::new(),
        hostname: String::new(),
        arch: String::new(),
        last_seen: Utc::now(),
    });
    DeviceRecord {
        uuid: uuid.to_string(),
        name: non_empty(info.name).unwrap_or(base.name),
        os_name: non_empty(info.os_name).unwrap_or(base.os_name),
        os_version: non_empty(info.os_version).unwrap_or(base.os_version),
        hostname: non_empty(info.hostname).unwrap_or(base.hostname),
        arch: non_empty(info.arch).unwrap_or(base.arch),
        last_seen: Utc::now(),
    }
}
