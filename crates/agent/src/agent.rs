//! Wires the agent components together.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use warden_protocol::constants::{ACTION_DEVICE_REGISTER, ACTION_LOGIN};
use warden_protocol::messages::{DeviceInfo, LoginRequest, LoginResponse};

use crate::AgentError;
use crate::context::AgentContext;
use crate::dispatcher::CommandDispatcher;
use crate::filetree;
use crate::handlers::register_builtins;
use crate::identity::save_token;
use crate::manager::{ConnectionManager, ConnectionState, ManagerConfig};

/// Everything the agent needs to run.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub device_id: String,
    /// Token loaded from `token_path` at startup, if any.
    pub token: Option<String>,
    pub username: String,
    pub password: String,
    pub token_path: PathBuf,
    pub log_path: PathBuf,
    pub monitor_paths: Vec<PathBuf>,
    pub sync_interval: Duration,
    pub connection: ManagerConfig,
}

pub struct Agent {
    config: AgentConfig,
    ctx: AgentContext,
    manager: Arc<ConnectionManager>,
    dispatcher: Arc<CommandDispatcher>,
    commands: std::sync::Mutex<Option<mpsc::UnboundedReceiver<crate::CommandEnvelope>>>,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Self {
        let ctx = AgentContext::new(
            config.device_id.clone(),
            config.token.clone().unwrap_or_default(),
        );
        let (tx, rx) = mpsc::unbounded_channel();
        let manager = ConnectionManager::new(config.connection.clone(), ctx.clone(), tx);
        let dispatcher = Arc::new(CommandDispatcher::new());
        register_builtins(
            &dispatcher,
            &manager,
            config.log_path.clone(),
            config.monitor_paths.clone(),
        );
        Self {
            config,
            ctx,
            manager,
            dispatcher,
            commands: std::sync::Mutex::new(Some(rx)),
        }
    }

    pub fn context(&self) -> &AgentContext {
        &self.ctx
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    pub fn dispatcher(&self) -> &Arc<CommandDispatcher> {
        &self.dispatcher
    }

    /// Runs until [`shutdown`](Self::shutdown) or until reconnecting
    /// gives up.
    pub async fn run(&self) -> Result<(), AgentError> {
        let cancel = self.manager.cancel_token();
        let commands = self.commands.lock().ok().and_then(|mut c| c.take());

        let worker = commands.map(|rx| {
            let dispatcher = Arc::clone(&self.dispatcher);
            tokio::spawn(async move { dispatcher.run(rx).await })
        });

        let handshake = {
            let manager = Arc::clone(&self.manager);
            let config = self.config.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { handshake_loop(manager, config, cancel).await })
        };

        let sync = {
            let manager = Arc::clone(&self.manager);
            let roots = self.config.monitor_paths.clone();
            let interval = self.config.sync_interval;
            let cancel = cancel.clone();
            tokio::spawn(async move { filetree::run_sync(&manager, roots, interval, cancel).await })
        };

        info!(device = %self.ctx.device_id(), "agent running");
        let result = self.manager.run().await;

        self.manager.shutdown().await;
        let _ = handshake.await;
        let _ = sync.await;
        self.dispatcher.stop_all().await;
        if let Some(worker) = worker {
            worker.abort();
        }
        result
    }

    /// Stops the agent. Idempotent.
    pub async fn shutdown(&self) {
        self.manager.shutdown().await;
    }
}

/// Runs [`authenticate`] every time the connection comes up.
async fn handshake_loop(
    manager: Arc<ConnectionManager>,
    config: AgentConfig,
    cancel: CancellationToken,
) {
    let mut state = manager.subscribe();
    loop {
        let connected = *state.borrow_and_update() == ConnectionState::Connected;
        if connected {
            if let Err(e) = authenticate(&manager, &config).await {
                warn!("authentication failed: {e}");
            }
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
}

fn device_info(device_id: &str) -> DeviceInfo {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok());
    DeviceInfo {
        uuid: Some(device_id.to_string()),
        name: host.clone(),
        os_name: Some(std::env::consts::OS.to_string()),
        os_version: None,
        hostname: host,
        arch: Some(std::env::consts::ARCH.to_string()),
    }
}

/// Registers the device; on 401 logs in with the configured credentials,
/// stores the new token and registers again.
pub async fn authenticate(
    manager: &ConnectionManager,
    config: &AgentConfig,
) -> Result<(), AgentError> {
    let ctx = manager.context();
    let info = device_info(&ctx.device_id());
    match manager.request(ACTION_DEVICE_REGISTER, Some(&info)).await {
        Ok(_) => {
            info!(device = %ctx.device_id(), "device registered with stored token");
            return Ok(());
        }
        Err(e) if e.is_unauthorized() => {}
        Err(e) => return Err(e),
    }

    if config.username.is_empty() {
        warn!("hub requires login but no credentials are configured");
        return Err(AgentError::Rejected {
            code: warden_protocol::constants::STATUS_UNAUTHORIZED,
            message: "no credentials configured".into(),
        });
    }

    let req = LoginRequest {
        username: config.username.clone(),
        password: config.password.clone(),
        device_id: Some(ctx.device_id()),
        name: info.name.clone(),
        os_name: info.os_name.clone(),
        os_version: info.os_version.clone(),
        hostname: info.hostname.clone(),
        arch: info.arch.clone(),
    };
    let resp: LoginResponse = manager.request_json(ACTION_LOGIN, Some(&req)).await?;
    ctx.set_token(resp.token.clone());
    if let Err(e) = save_token(&config.token_path, &resp.token) {
        warn!(path = %config.token_path.display(), "persisting token failed: {e}");
    }

    manager.request(ACTION_DEVICE_REGISTER, Some(&info)).await?;
    info!(device = %resp.device_id, "logged in and registered");
    Ok(())
}
