//! Builds the agent from configuration and runs it.

use std::sync::Arc;

use warden_agent::identity::{load_token, resolve_device_id};
use warden_agent::{Agent, AgentConfig, ManagerConfig};
use warden_protocol::constants::REQUEST_TIMEOUT;

use crate::config::Config;

/// Runs the agent until SIGINT or until reconnecting gives up.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let device_id = resolve_device_id(config.device_id.as_deref(), &config.device_id_path)?;
    let token = load_token(&config.token_path);
    tracing::info!(device = %device_id, has_token = token.is_some(), "identity resolved");

    let agent = Arc::new(Agent::new(AgentConfig {
        device_id,
        token,
        username: config.username.clone(),
        password: config.password.clone(),
        token_path: config.token_path.clone(),
        log_path: config.log_path.clone(),
        monitor_paths: config.monitor_paths.clone(),
        sync_interval: config.sync_interval(),
        connection: ManagerConfig {
            hub_addr: config.hub_addr(),
            reconnect: config.reconnect(),
            request_timeout: REQUEST_TIMEOUT,
        },
    }));

    let agent_run = Arc::clone(&agent);
    let mut running = tokio::spawn(async move { agent_run.run().await });

    tokio::select! {
        res = &mut running => {
            res??;
            return Ok(());
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("SIGINT received, shutting down");
        }
    }

    agent.shutdown().await;
    running.await??;
    Ok(())
}
