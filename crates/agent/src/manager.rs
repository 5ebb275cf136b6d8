//! Agent connection manager.
//!
//! Owns the single hub connection: dials with backoff, sends the LOGIN
//! frame, pairs ACKs with outstanding requests, hands queued commands to
//! the dispatcher and feeds file frames to active downloads.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::{Mutex, RwLock, mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use warden_protocol::constants::{REQUEST_TIMEOUT, STATUS_OK};
use warden_protocol::messages::SessionDescriptor;
use warden_protocol::{CommandEnvelope, Frame, SubCommand};
use warden_transfer::write_at;
use warden_transport::{Connection, FrameReader};

use crate::AgentError;
use crate::backoff::{Backoff, ReconnectConfig};
use crate::context::AgentContext;

/// Connection state, published through [`ConnectionManager::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Authenticating,
    Connected,
}

/// Connection manager configuration.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Hub address as `host:port`.
    pub hub_addr: String,
    pub reconnect: ReconnectConfig,
    pub request_timeout: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            hub_addr: format!("127.0.0.1:{}", warden_protocol::constants::DEFAULT_TCP_PORT),
            reconnect: ReconnectConfig::default(),
            request_timeout: REQUEST_TIMEOUT,
        }
    }
}

/// Result of a finished download: bytes written to the destination.
type DownloadResult = Result<u64, AgentError>;

/// A download receiving FILE_META / FILE_CHUNK / FILE_DONE frames.
struct DownloadSink {
    file_name: String,
    part_path: PathBuf,
    dest: PathBuf,
    file_size: u64,
    meta_seen: bool,
    done: oneshot::Sender<DownloadResult>,
}

pub struct ConnectionManager {
    config: ManagerConfig,
    ctx: AgentContext,
    state: watch::Sender<ConnectionState>,
    conn: RwLock<Option<Arc<Connection>>>,
    /// Serializes request writes so `pending` matches the wire order.
    request_lock: Mutex<()>,
    /// One slot per COMMAND sent to the hub, answered in FIFO order.
    pending: StdMutex<VecDeque<oneshot::Sender<Frame>>>,
    downloads: Mutex<HashMap<String, DownloadSink>>,
    commands: mpsc::UnboundedSender<CommandEnvelope>,
    cancel: CancellationToken,
}

impl ConnectionManager {
    /// Creates a manager; queued commands from the hub go to `commands`.
    pub fn new(
        config: ManagerConfig,
        ctx: AgentContext,
        commands: mpsc::UnboundedSender<CommandEnvelope>,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Arc::new(Self {
            config,
            ctx,
            state,
            conn: RwLock::new(None),
            request_lock: Mutex::new(()),
            pending: StdMutex::new(VecDeque::new()),
            downloads: Mutex::new(HashMap::new()),
            commands,
            cancel: CancellationToken::new(),
        })
    }

    pub fn context(&self) -> &AgentContext {
        &self.ctx
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_if_modified(|s| {
            if *s == state {
                false
            } else {
                debug!(from = ?*s, to = ?state, "connection state");
                *s = state;
                true
            }
        });
    }

    /// Keeps the agent connected until [`shutdown`](Self::shutdown).
    ///
    /// Returns an error only when `max_retries` consecutive attempts fail.
    pub async fn run(self: &Arc<Self>) -> Result<(), AgentError> {
        while !self.cancel.is_cancelled() {
            let reader = match self.connect().await {
                Ok(reader) => reader,
                Err(AgentError::Closed) => break,
                Err(e) => return Err(e),
            };
            self.receive_loop(reader).await;

            // Brief pause so a hub that drops us right away is not hammered.
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.reconnect.initial_delay) => {}
            }
        }
        self.set_state(ConnectionState::Disconnected);
        Ok(())
    }

    /// Dials the hub and sends the LOGIN frame, retrying with backoff.
    ///
    /// Returns the frame reader of the new connection. The attempt counter
    /// starts from zero on every call.
    pub async fn connect(&self) -> Result<FrameReader, AgentError> {
        let mut backoff = Backoff::new(self.config.reconnect.clone());
        loop {
            if self.cancel.is_cancelled() {
                return Err(AgentError::Closed);
            }
            match self.connect_once().await {
                Ok(reader) => {
                    if backoff.attempt() > 0 {
                        info!(attempts = backoff.attempt(), "reconnected");
                    }
                    return Ok(reader);
                }
                Err(e) => {
                    self.set_state(ConnectionState::Disconnected);
                    let Some(delay) = backoff.next_delay() else {
                        warn!(attempts = backoff.attempt(), "giving up connecting: {e}");
                        return Err(AgentError::RetriesExhausted(backoff.attempt()));
                    };
                    warn!(
                        attempt = backoff.attempt(),
                        delay_secs = format_args!("{:.1}", delay.as_secs_f64()),
                        "connect failed: {e}"
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Err(AgentError::Closed),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    async fn connect_once(&self) -> Result<FrameReader, AgentError> {
        self.set_state(ConnectionState::Connecting);
        let (conn, reader) = warden_transport::connect(self.config.hub_addr.as_str()).await?;

        self.set_state(ConnectionState::Authenticating);
        let id = self.ctx.identity();
        if let Err(e) = conn
            .send(&Frame::Login {
                device_id: id.device_id.clone(),
                token: id.token,
            })
            .await
        {
            conn.shutdown().await;
            return Err(e.into());
        }

        *self.conn.write().await = Some(conn);
        self.set_state(ConnectionState::Connected);
        info!(hub = %self.config.hub_addr, device = %id.device_id, "connected to hub");
        Ok(reader)
    }

    /// Reads frames until the connection dies or the manager shuts down,
    /// then fails everything still waiting on this connection.
    pub async fn receive_loop(&self, mut reader: FrameReader) {
        loop {
            let frame = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                frame = reader.recv() => frame,
            };
            match frame {
                Ok(Some(frame)) => self.handle_frame(frame).await,
                Ok(None) => {
                    info!("hub closed the connection");
                    break;
                }
                Err(e) => {
                    warn!("connection lost: {e}");
                    break;
                }
            }
        }
        self.on_disconnected().await;
    }

    async fn handle_frame(&self, frame: Frame) {
        match frame {
            Frame::Command { payload } => match CommandEnvelope::from_slice(&payload) {
                Ok(envelope) => {
                    debug!(command = %envelope.command, "command received");
                    if self.commands.send(envelope).is_err() {
                        warn!("command dispatcher is gone, dropping command");
                    }
                }
                Err(e) => warn!("dropping malformed command: {e}"),
            },
            Frame::Ack { .. } | Frame::Error { .. } => {
                let slot = self.pending.lock().ok().and_then(|mut p| p.pop_front());
                match slot {
                    Some(tx) => {
                        let _ = tx.send(frame);
                    }
                    None => debug!(status = ?frame.status(), "unsolicited answer"),
                }
            }
            Frame::FileMeta {
                file_name,
                file_size,
            } => self.on_file_meta(&file_name, file_size).await,
            Frame::FileChunk {
                session_id,
                offset,
                data,
                ..
            } => self.on_file_chunk(&session_id, offset, &data).await,
            Frame::FileDone { session_id, .. } => self.on_file_done(&session_id).await,
            Frame::Login { .. } => debug!("ignoring login frame from hub"),
        }
    }

    async fn on_disconnected(&self) {
        if let Some(conn) = self.conn.write().await.take() {
            conn.shutdown().await;
        }
        let dropped = self
            .pending
            .lock()
            .map(|mut p| p.drain(..).count())
            .unwrap_or_default();
        let downloads = std::mem::take(&mut *self.downloads.lock().await);
        for (_, sink) in downloads {
            let _ = sink.done.send(Err(AgentError::Closed));
        }
        if dropped > 0 {
            debug!(dropped, "failed pending requests");
        }
        self.set_state(ConnectionState::Disconnected);
    }

    async fn current(&self) -> Result<Arc<Connection>, AgentError> {
        self.conn
            .read()
            .await
            .as_ref()
            .filter(|c| c.is_open())
            .cloned()
            .ok_or(AgentError::NotConnected)
    }

    /// Closes the current connection; [`run`](Self::run) reconnects.
    ///
    /// Used when a frame write was abandoned halfway and the stream can no
    /// longer be trusted.
    pub async fn drop_connection(&self) {
        if let Some(conn) = self.conn.read().await.as_ref() {
            warn!(conn = %conn.id(), "dropping hub connection");
            conn.close();
        }
    }

    /// Writes a raw frame (chunks, done) on the current connection.
    pub async fn send_frame(&self, frame: &Frame) -> Result<(), AgentError> {
        let conn = self.current().await?;
        conn.send(frame).await?;
        Ok(())
    }

    /// Sends a sub-command and registers its answer slot.
    async fn submit<T: Serialize>(
        &self,
        action: &str,
        data: Option<&T>,
    ) -> Result<oneshot::Receiver<Frame>, AgentError> {
        let payload = SubCommand::new(action, data)?.to_vec()?;
        let _guard = self.request_lock.lock().await;
        let conn = self.current().await?;
        let (tx, rx) = oneshot::channel();
        if let Ok(mut pending) = self.pending.lock() {
            pending.push_back(tx);
        }
        if let Err(e) = conn.send(&Frame::Command { payload }).await {
            if let Ok(mut pending) = self.pending.lock() {
                pending.pop_back();
            }
            return Err(e.into());
        }
        trace!(action, "command sent");
        Ok(rx)
    }

    /// Sends a sub-command without waiting for its answer.
    pub async fn send<T: Serialize>(&self, action: &str, data: Option<&T>) -> Result<(), AgentError> {
        self.submit(action, data).await.map(drop)
    }

    /// Sends a sub-command and waits for its answer; returns the status
    /// message of a 2xx ACK.
    pub async fn request<T: Serialize>(
        &self,
        action: &str,
        data: Option<&T>,
    ) -> Result<String, AgentError> {
        let rx = self.submit(action, data).await?;
        let frame = match tokio::time::timeout(self.config.request_timeout, rx).await {
            Ok(Ok(frame)) => frame,
            Ok(Err(_)) => return Err(AgentError::Closed),
            Err(_) => return Err(AgentError::Timeout),
        };
        match frame {
            Frame::Ack { code, message } if (STATUS_OK..300).contains(&code) => Ok(message),
            Frame::Ack { code, message } | Frame::Error { code, message } => {
                Err(AgentError::Rejected { code, message })
            }
            _ => Err(AgentError::Closed),
        }
    }

    /// Like [`request`](Self::request), decoding the answer as JSON.
    pub async fn request_json<T: Serialize, R: DeserializeOwned>(
        &self,
        action: &str,
        data: Option<&T>,
    ) -> Result<R, AgentError> {
        let body = self.request(action, data).await?;
        Ok(serde_json::from_str(&body)?)
    }

    /// Registers a download before asking the hub to start streaming.
    ///
    /// Chunks are written into `<dest>.part` starting at `offset`, which is
    /// renamed to `dest` on FILE_DONE.
    pub(crate) async fn register_download(
        &self,
        desc: &SessionDescriptor,
        dest: &Path,
    ) -> oneshot::Receiver<DownloadResult> {
        let (tx, rx) = oneshot::channel();
        let sink = DownloadSink {
            file_name: desc.file_name.clone(),
            part_path: part_path(dest),
            dest: dest.to_path_buf(),
            file_size: desc.file_size,
            meta_seen: false,
            done: tx,
        };
        self.downloads
            .lock()
            .await
            .insert(desc.session_id.clone(), sink);
        rx
    }

    pub(crate) async fn cancel_download(&self, session_id: &str) {
        self.downloads.lock().await.remove(session_id);
    }

    async fn on_file_meta(&self, file_name: &str, file_size: u64) {
        let mut downloads = self.downloads.lock().await;
        let sink = downloads
            .values_mut()
            .find(|s| !s.meta_seen && s.file_name == file_name);
        match sink {
            Some(sink) => {
                sink.meta_seen = true;
                sink.file_size = file_size;
                debug!(file = %file_name, size = file_size, "download meta");
            }
            None => debug!(file = %file_name, "file meta for unknown download"),
        }
    }

    async fn on_file_chunk(&self, session_id: &str, offset: u64, data: &[u8]) {
        let part = {
            let downloads = self.downloads.lock().await;
            match downloads.get(session_id) {
                Some(sink) => sink.part_path.clone(),
                None => {
                    debug!(session = %session_id, "chunk for unknown download");
                    return;
                }
            }
        };
        if let Err(e) = write_at(&part, offset, data).await {
            warn!(session = %session_id, offset, "writing download chunk failed: {e}");
            if let Some(sink) = self.downloads.lock().await.remove(session_id) {
                let _ = sink.done.send(Err(e.into()));
            }
        }
    }

    async fn on_file_done(&self, session_id: &str) {
        let Some(sink) = self.downloads.lock().await.remove(session_id) else {
            debug!(session = %session_id, "done for unknown download");
            return;
        };
        let result = finish_download(&sink).await;
        if let Ok(size) = &result {
            info!(session = %session_id, dest = %sink.dest.display(), size, "download complete");
        }
        let _ = sink.done.send(result);
    }

    /// Stops the manager and closes the connection. Safe to call more
    /// than once and from any task.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        if let Some(conn) = self.conn.read().await.as_ref() {
            conn.close();
        }
    }
}

/// `<dest>.part`
pub(crate) fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_os_string();
    name.push(".part");
    PathBuf::from(name)
}

async fn finish_download(sink: &DownloadSink) -> DownloadResult {
    let size = match tokio::fs::metadata(&sink.part_path).await {
        Ok(meta) => meta.len(),
        // An empty file produces no chunks.
        Err(e) if e.kind() == std::io::ErrorKind::NotFound && sink.file_size == 0 => {
            tokio::fs::write(&sink.part_path, b"").await?;
            0
        }
        Err(e) => return Err(e.into()),
    };
    if size != sink.file_size {
        return Err(AgentError::Transfer(warden_transfer::TransferError::Incomplete {
            expected: sink.file_size,
            actual: size,
        }));
    }
    tokio::fs::rename(&sink.part_path, &sink.dest).await?;
    Ok(size)
}
