//! Harness for the end-to-end scenarios under `tests/`.
//!
//! [`TestHub`] runs a real hub on an ephemeral loopback port;
//! [`RawClient`] speaks frames directly so tests can observe the wire.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tempfile::TempDir;
use tokio::task::JoinHandle;
use warden_agent::{Agent, AgentConfig, ManagerConfig, ReconnectConfig};
use warden_hub::store::{
    AgentLogStore, BackupRecord, BackupStore, DeviceRecord, DeviceStore, FileTreeStore,
};
use warden_hub::{HubServer, MemorySigner, MemoryStore, Router, ServerConfig};
use warden_protocol::constants::{ACTION_LOGIN, DEFAULT_CHUNK_SIZE};
use warden_protocol::messages::{FileChange, LoginRequest, LoginResponse};
use warden_protocol::{Frame, SubCommand};
use warden_transfer::{SessionManager, TransferConfig};
use warden_transport::{Connection, FrameReader, connect};

pub const USERNAME: &str = "admin";
pub const PASSWORD: &str = "secret";

/// How long a test waits for any single frame or condition.
pub const WAIT: Duration = Duration::from_secs(10);

/// A hub listening on `127.0.0.1:<ephemeral>`.
pub struct TestHub {
    pub server: Arc<HubServer>,
    pub repo: Arc<MemoryStore>,
    pub storage: TempDir,
    task: JoinHandle<()>,
}

impl TestHub {
    pub async fn start() -> Self {
        Self::with_chunk_size(DEFAULT_CHUNK_SIZE).await
    }

    pub async fn with_chunk_size(chunk_size: usize) -> Self {
        let storage = tempfile::tempdir().unwrap();
        let repo = Arc::new(MemoryStore::new());
        repo.add_user(USERNAME, PASSWORD, "admin").unwrap();
        let sessions = Arc::new(SessionManager::new(TransferConfig {
            storage_dir: storage.path().to_path_buf(),
            chunk_size,
            ..Default::default()
        }));
        let router = Arc::new(Router::new(
            Arc::clone(&repo),
            Arc::new(MemorySigner::new()),
            sessions,
            Duration::from_secs(3600),
        ));
        let server = HubServer::bind(
            ServerConfig {
                listen: ([127, 0, 0, 1], 0).into(),
            },
            router,
        )
        .await
        .unwrap();
        let run = Arc::clone(&server);
        let task = tokio::spawn(async move {
            run.run().await.unwrap();
        });
        Self {
            server,
            repo,
            storage,
            task,
        }
    }

    pub fn addr(&self) -> String {
        self.server.local_addr().to_string()
    }

    /// Directory holding `device`'s finished backups.
    pub fn device_dir(&self, device: &str) -> PathBuf {
        self.storage.path().join(device)
    }

    pub async fn client(&self) -> RawClient {
        RawClient::connect(&self.addr()).await
    }

    /// Builds an agent for `device` that logs in with the test credentials.
    pub fn agent(&self, device: &str, state_dir: &Path, monitor_paths: Vec<PathBuf>) -> Arc<Agent> {
        Arc::new(Agent::new(AgentConfig {
            device_id: device.into(),
            token: None,
            username: USERNAME.into(),
            password: PASSWORD.into(),
            token_path: state_dir.join("token"),
            log_path: state_dir.join("agent.log"),
            monitor_paths,
            sync_interval: Duration::from_millis(200),
            connection: ManagerConfig {
                hub_addr: self.addr(),
                reconnect: fast_reconnect(0),
                request_timeout: WAIT,
            },
        }))
    }

    /// Stored record of `device`, which must exist.
    pub async fn repo_device(&self, device: &str) -> DeviceRecord {
        self.repo
            .get_device(device)
            .await
            .unwrap()
            .unwrap_or_else(|| panic!("device {device} not registered"))
    }

    /// Waits until `device` has been registered.
    pub async fn wait_for_device(&self, device: &str) -> DeviceRecord {
        let deadline = Deadline::new();
        loop {
            if let Some(d) = self.repo.get_device(device).await.unwrap() {
                return d;
            }
            deadline.tick(&format!("device {device} registered")).await;
        }
    }

    /// Waits until `device` has at least `count` backup versions.
    pub async fn wait_for_backups(&self, device: &str, count: usize) -> Vec<BackupRecord> {
        let deadline = Deadline::new();
        loop {
            let backups = self.repo.list_backups(device, None).await.unwrap();
            if backups.len() >= count {
                return backups;
            }
            deadline.tick(&format!("{count} backups of {device}")).await;
        }
    }

    /// Waits until `device` has shipped at least one log line.
    pub async fn wait_for_logs(&self, device: &str) -> Vec<String> {
        let deadline = Deadline::new();
        loop {
            let logs = self.repo.recent_logs(device, 100).await.unwrap();
            if !logs.is_empty() {
                return logs;
            }
            deadline.tick(&format!("logs of {device}")).await;
        }
    }

    /// Waits until the file tree of `device` has a node for `name`.
    pub async fn wait_for_node(&self, device: &str, name: &str) -> FileChange {
        let deadline = Deadline::new();
        loop {
            let nodes = self.repo.list_nodes(device).await.unwrap();
            if let Some(n) = nodes.into_iter().find(|n| n.cur_name == name) {
                return n;
            }
            deadline.tick(&format!("tree node {name} of {device}")).await;
        }
    }
}

/// Poll budget of one `wait_for_*` call.
struct Deadline(tokio::time::Instant);

impl Deadline {
    fn new() -> Self {
        Self(tokio::time::Instant::now() + WAIT)
    }

    async fn tick(&self, what: &str) {
        assert!(tokio::time::Instant::now() < self.0, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

impl Drop for TestHub {
    fn drop(&mut self) {
        self.server.shutdown();
        self.task.abort();
    }
}

/// Millisecond-scale backoff for tests.
pub fn fast_reconnect(max_retries: u32) -> ReconnectConfig {
    ReconnectConfig {
        initial_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(50),
        backoff_factor: 1.5,
        max_retries,
    }
}

/// A frame-level client.
pub struct RawClient {
    pub conn: Arc<Connection>,
    pub reader: FrameReader,
}

impl RawClient {
    pub async fn connect(addr: &str) -> Self {
        let (conn, reader) = connect(addr).await.unwrap();
        Self { conn, reader }
    }

    pub async fn send(&self, frame: Frame) {
        self.conn.send(&frame).await.unwrap();
    }

    pub async fn command<T: Serialize>(&self, action: &str, data: Option<&T>) {
        let payload = SubCommand::new(action, data).unwrap().to_vec().unwrap();
        self.send(Frame::Command { payload }).await;
    }

    /// Next frame, failing the test on timeout or EOF.
    pub async fn next(&mut self) -> Frame {
        tokio::time::timeout(WAIT, self.reader.recv())
            .await
            .expect("timed out waiting for a frame")
            .unwrap()
            .expect("connection closed")
    }

    /// Sends a sub-command and returns the ACK/ERROR status.
    pub async fn request<T: Serialize>(&mut self, action: &str, data: Option<&T>) -> (u16, String) {
        self.command(action, data).await;
        let frame = self.next().await;
        let (code, msg) = frame
            .status()
            .unwrap_or_else(|| panic!("expected a status frame, got {frame:?}"));
        (code, msg.to_string())
    }

    /// Like [`request`](Self::request) but requires 200 and decodes the body.
    pub async fn request_json<T: Serialize, R: DeserializeOwned>(
        &mut self,
        action: &str,
        data: Option<&T>,
    ) -> R {
        let (code, body) = self.request(action, data).await;
        assert_eq!(code, 200, "{action} failed: {body}");
        serde_json::from_str(&body).unwrap()
    }

    /// Binds `device` with a LOGIN frame, then authenticates with the
    /// test credentials. Returns the issued token.
    pub async fn login(&mut self, device: &str) -> String {
        self.send(Frame::Login {
            device_id: device.into(),
            token: String::new(),
        })
        .await;
        let req = LoginRequest {
            username: USERNAME.into(),
            password: PASSWORD.into(),
            device_id: Some(device.into()),
            name: None,
            os_name: None,
            os_version: None,
            hostname: None,
            arch: None,
        };
        let resp: LoginResponse = self.request_json(ACTION_LOGIN, Some(&req)).await;
        assert_eq!(resp.device_id, device);
        resp.token
    }
}
