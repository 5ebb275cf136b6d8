//! Per-connection protocol router.
//!
//! Each accepted connection owns a [`ConnState`] and feeds every frame it
//! reads through [`Router::handle_frame`]. Shared state (hub, sessions,
//! queue, authorization cache) lives in the [`Router`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{debug, info, trace, warn};
use warden_protocol::constants::{
    MAX_STATUS_MESSAGE_LEN, STATUS_BAD_REQUEST, STATUS_OK, STATUS_TOO_LARGE, STATUS_UNAUTHORIZED,
    bypasses_auth,
};
use warden_protocol::{Direction, Frame, SubCommand};
use warden_transfer::{ChunkReader, SessionManager, TransferError, TransferSession};
use warden_transport::{Connection, TransportError};

use crate::HubError;
use crate::auth::{Claims, TokenSigner};
use crate::queue::CommandQueue;
use crate::registry::Hub;
use crate::store::{NewBackup, Repository};
use crate::subcommands::Reply;

/// Authentication phase of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Unauthenticated,
    Authenticated,
    Closed,
}

/// State of one accepted connection.
pub struct ConnState {
    pub(crate) conn: Arc<Connection>,
    pub(crate) device_id: Option<String>,
    pub(crate) phase: Phase,
    /// Upload sessions opened over this connection.
    pub(crate) uploads: HashSet<String>,
    /// Uploads finalized over this connection and not yet reported:
    /// session id -> (session token, stored name).
    pub(crate) finished: HashMap<String, (String, String)>,
}

impl ConnState {
    pub fn new(conn: Arc<Connection>) -> Self {
        Self {
            conn,
            device_id: None,
            phase: Phase::Unauthenticated,
            uploads: HashSet::new(),
            finished: HashMap::new(),
        }
    }

    /// Device id bound by the LOGIN frame (empty before login).
    pub fn device_id(&self) -> &str {
        self.device_id.as_deref().unwrap_or_default()
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }
}

/// Interprets frames and delegates to the hub's collaborators.
pub struct Router {
    pub(crate) hub: Arc<Hub>,
    pub(crate) sessions: Arc<SessionManager>,
    pub(crate) queue: Arc<CommandQueue>,
    pub(crate) repo: Arc<dyn Repository>,
    pub(crate) signer: Arc<dyn TokenSigner>,
    /// device id -> token issued or presented at login.
    auth_cache: RwLock<HashMap<String, String>>,
    pub(crate) token_ttl: chrono::Duration,
}

impl Router {
    pub fn new<R: Repository + 'static>(
        repo: Arc<R>,
        signer: Arc<dyn TokenSigner>,
        sessions: Arc<SessionManager>,
        token_ttl: Duration,
    ) -> Self {
        let hub = Arc::new(Hub::new());
        let queue = Arc::new(CommandQueue::new(repo.clone(), Arc::clone(&hub)));
        Self {
            hub,
            sessions,
            queue,
            repo,
            signer,
            auth_cache: RwLock::new(HashMap::new()),
            token_ttl: chrono::Duration::from_std(token_ttl)
                .unwrap_or_else(|_| chrono::Duration::days(1)),
        }
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn queue(&self) -> &Arc<CommandQueue> {
        &self.queue
    }

    /// Returns `true` if `device_id` holds an authorization-cache entry.
    pub async fn has_authorization(&self, device_id: &str) -> bool {
        self.auth_cache.read().await.contains_key(device_id)
    }

    pub(crate) async fn cache_token(&self, device_id: &str, token: &str) {
        self.auth_cache
            .write()
            .await
            .insert(device_id.to_string(), token.to_string());
    }

    /// A connection is authorized once it logged in itself and its device
    /// still holds a cache entry.
    pub(crate) async fn is_authorized(&self, state: &ConnState) -> bool {
        state.phase == Phase::Authenticated
            && !state.device_id().is_empty()
            && self.has_authorization(state.device_id()).await
    }

    /// Handles one frame read from `state`'s connection.
    ///
    /// Returns an error only when answering on the connection failed.
    pub async fn handle_frame(
        &self,
        state: &mut ConnState,
        frame: Frame,
    ) -> Result<(), TransportError> {
        match frame {
            Frame::Login { device_id, token } => {
                self.handle_login(state, device_id, token).await;
                Ok(())
            }
            Frame::Command { payload } => self.handle_command(state, &payload).await,
            Frame::FileChunk {
                session_id,
                token,
                offset,
                data,
            } => {
                self.handle_chunk(state, &session_id, &token, offset, &data)
                    .await;
                Ok(())
            }
            Frame::FileDone { session_id, token } => {
                self.handle_done(state, &session_id, &token).await;
                Ok(())
            }
            other => {
                debug!(
                    conn = %state.conn.id(),
                    frame = ?other.frame_type(),
                    "ignoring unexpected frame"
                );
                Ok(())
            }
        }
    }

    async fn handle_login(&self, state: &mut ConnState, device_id: String, token: String) {
        if device_id.is_empty() {
            warn!(conn = %state.conn.id(), "login frame without device id");
            return;
        }
        if state.device_id.as_deref().is_some_and(|prev| prev != device_id) {
            self.release_device(state).await;
        }
        state.device_id = Some(device_id.clone());
        // Route first: a late disconnect of an older connection for this
        // device then finds it replaced and leaves the cache entry alone.
        let previous = self.hub.register(&device_id, Arc::clone(&state.conn)).await;
        if let Some(old) = previous.filter(|old| old.id() != state.conn.id()) {
            debug!(device = %device_id, old = %old.id(), "closing superseded connection");
            old.close();
        }

        if !token.is_empty() {
            match self.verify_token(&device_id, &token) {
                Ok(claims) => {
                    self.cache_token(&device_id, &token).await;
                    state.phase = Phase::Authenticated;
                    info!(device = %device_id, user = %claims.username, "login token accepted");
                }
                Err(e) => {
                    warn!(device = %device_id, "login token rejected: {e}");
                }
            }
        }

        let queue = Arc::clone(&self.queue);
        tokio::spawn(async move {
            if let Err(e) = queue.replay(&device_id).await {
                warn!(device = %device_id, "command replay failed: {e}");
            }
        });
    }

    fn verify_token(&self, device_id: &str, token: &str) -> Result<Claims, HubError> {
        let claims = self.signer.parse(token)?;
        claims.check(device_id)?;
        Ok(claims)
    }

    async fn handle_command(&self, state: &mut ConnState, payload: &[u8]) -> Result<(), TransportError> {
        if payload.is_empty() {
            return self
                .send_status(&state.conn, STATUS_BAD_REQUEST, "empty command payload".into())
                .await;
        }
        let cmd = match SubCommand::from_slice(payload) {
            Ok(cmd) => cmd,
            Err(e) => {
                debug!(conn = %state.conn.id(), "invalid command json: {e}");
                return self
                    .send_status(&state.conn, STATUS_BAD_REQUEST, "invalid command json".into())
                    .await;
            }
        };
        debug!(device = %state.device_id(), action = %cmd.action, "sub-command received");

        if !bypasses_auth(&cmd.action) && !self.is_authorized(state).await {
            debug!(device = %state.device_id(), action = %cmd.action, "unauthorized sub-command");
            return self
                .send_status(&state.conn, STATUS_UNAUTHORIZED, "unauthorized".into())
                .await;
        }

        match self.dispatch(state, &cmd).await {
            Ok(Reply::Message(msg)) => self.send_status(&state.conn, STATUS_OK, msg).await,
            Ok(Reply::Json(json)) => self.send_status(&state.conn, STATUS_OK, json).await,
            Ok(Reply::Download { session, offset }) => {
                self.send_status(&state.conn, STATUS_OK, "download started".into())
                    .await?;
                match self.stream_download(&state.conn, &session, offset).await {
                    Ok(sent) => {
                        info!(session = %session.session_id, bytes = sent, "download streamed");
                        Ok(())
                    }
                    Err(HubError::Transport(e)) => Err(e),
                    Err(e) => {
                        warn!(session = %session.session_id, "download aborted: {e}");
                        Ok(())
                    }
                }
            }
            Err(e) => {
                let code = e.code();
                if code >= 500 {
                    warn!(device = %state.device_id(), action = %cmd.action, "sub-command failed: {e}");
                } else {
                    debug!(device = %state.device_id(), action = %cmd.action, code, "sub-command rejected: {e}");
                }
                self.send_status(&state.conn, code, e.to_string()).await
            }
        }
    }

    /// Sends an ACK, replacing bodies over the status-message limit with a
    /// "too large" status instead of truncating them.
    async fn send_status(
        &self,
        conn: &Connection,
        code: u16,
        message: String,
    ) -> Result<(), TransportError> {
        if message.len() > MAX_STATUS_MESSAGE_LEN {
            warn!(conn = %conn.id(), len = message.len(), "response too large");
            return conn.send_ack(STATUS_TOO_LARGE, "response too large").await;
        }
        conn.send_ack(code, message).await
    }

    /// Streams FILE_META, FILE_CHUNK* and FILE_DONE for a download session
    /// starting at `offset`. Returns the number of bytes sent.
    async fn stream_download(
        &self,
        conn: &Connection,
        session: &TransferSession,
        offset: u64,
    ) -> Result<u64, HubError> {
        let mut reader = ChunkReader::open(&session.final_path, session.chunk_size).await?;
        reader.seek_to(offset).await?;

        conn.send(&Frame::FileMeta {
            file_name: session.file_name.clone(),
            file_size: reader.file_size(),
        })
        .await?;

        let mut sent = 0u64;
        while let Some((at, data)) = reader.next_chunk().await? {
            let len = data.len() as u64;
            conn.send(&Frame::FileChunk {
                session_id: session.session_id.clone(),
                token: session.token.clone(),
                offset: at,
                data,
            })
            .await?;
            self.sessions.advance(&session.session_id, len).await?;
            sent += len;
        }

        conn.send(&Frame::FileDone {
            session_id: session.session_id.clone(),
            token: session.token.clone(),
        })
        .await?;
        self.sessions.mark_completed(&session.session_id).await?;
        self.sessions.remove(&session.session_id).await;
        Ok(sent)
    }

    /// Looks up an upload session for a chunk/done frame, silently
    /// rejecting anything that does not belong to this device.
    async fn upload_session(
        &self,
        state: &ConnState,
        session_id: &str,
        token: &str,
    ) -> Option<TransferSession> {
        if !self.is_authorized(state).await {
            debug!(conn = %state.conn.id(), session = %session_id, "transfer frame on unauthorized connection ignored");
            return None;
        }
        match self.sessions.validate(session_id, token, Direction::Upload).await {
            Ok(s) if s.device_id == state.device_id() => Some(s),
            Ok(_) => {
                debug!(device = %state.device_id(), session = %session_id, "session belongs to another device");
                None
            }
            Err(e) => {
                debug!(device = %state.device_id(), session = %session_id, "transfer frame ignored: {e}");
                None
            }
        }
    }

    async fn handle_chunk(
        &self,
        state: &ConnState,
        session_id: &str,
        token: &str,
        offset: u64,
        data: &[u8],
    ) {
        if data.is_empty() || self.upload_session(state, session_id, token).await.is_none() {
            return;
        }
        match self.sessions.write_chunk(session_id, token, offset, data).await {
            Ok(progress) => {
                trace!(session = %session_id, offset, len = data.len(), progress, "chunk stored");
            }
            Err(TransferError::InvalidSession(reason)) => {
                debug!(session = %session_id, reason, "chunk ignored");
            }
            Err(e) => warn!(session = %session_id, offset, "chunk rejected: {e}"),
        }
    }

    async fn handle_done(&self, state: &mut ConnState, session_id: &str, token: &str) {
        if self.upload_session(state, session_id, token).await.is_none() {
            return;
        }
        let done = match self.sessions.finalize_upload(session_id).await {
            Ok(done) => done,
            Err(e) => {
                warn!(device = %state.device_id(), session = %session_id, "finalize upload failed: {e}");
                return;
            }
        };
        state.uploads.remove(session_id);
        state
            .finished
            .insert(session_id.to_string(), (token.to_string(), done.stored_name.clone()));

        let record = self
            .repo
            .record_backup(NewBackup {
                device_id: done.device_id.clone(),
                logical_path: done.logical_path.clone(),
                file_name: done.file_name.clone(),
                stored_name: done.stored_name.clone(),
                size: done.size,
            })
            .await;
        match record {
            Ok(r) => info!(
                device = %done.device_id,
                session = %session_id,
                path = %done.logical_path,
                version = r.version,
                "backup stored"
            ),
            Err(e) => warn!(session = %session_id, "recording backup version failed: {e}"),
        }
    }

    /// Drops this connection's claim on its device: hub route and, if no
    /// newer connection took over, the authorization-cache entry.
    async fn release_device(&self, state: &mut ConnState) {
        let Some(device_id) = state.device_id.take() else {
            return;
        };
        // Held across unregister so a concurrent login cannot cache its
        // token between our unregister and the removal.
        let mut cache = self.auth_cache.write().await;
        let removed = self.hub.unregister(&device_id, &state.conn).await;
        if removed || self.hub.connection(&device_id).await.is_none() {
            cache.remove(&device_id);
        }
        drop(cache);
        state.phase = Phase::Unauthenticated;
    }

    /// Cleans up after a connection ends.
    ///
    /// Upload sessions opened over the connection are left alone: they can
    /// be resumed by the device and are reaped when idle.
    pub async fn on_disconnect(&self, state: &mut ConnState) {
        let device = state.device_id().to_string();
        self.release_device(state).await;
        state.phase = Phase::Closed;
        if !state.uploads.is_empty() {
            debug!(
                device = %device,
                sessions = state.uploads.len(),
                "open upload sessions left to the idle reaper"
            );
        }
        state.conn.close();
        info!(device = %device, conn = %state.conn.id(), "connection closed");
    }
}
