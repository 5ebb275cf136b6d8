//! Wires the hub components together.

use std::sync::Arc;

use warden_hub::{HubServer, MemorySigner, MemoryStore, Router, ServerConfig};
use warden_transfer::{SessionManager, TransferConfig};

use crate::config::Config;

/// Runs the hub until SIGINT.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    for user in &config.users {
        store.add_user(&user.username, &user.password, &user.role)?;
    }
    if config.users.is_empty() {
        tracing::warn!("no users configured, credential logins will fail");
    }

    tokio::fs::create_dir_all(&config.backup.storage_path).await?;
    let listen = config.listen_addr()?;
    let sessions = Arc::new(SessionManager::new(TransferConfig {
        storage_dir: config.backup.storage_path.clone(),
        chunk_size: config.backup.chunk_size,
        tcp_host: config.advertise_host(),
        tcp_port: listen.port(),
        idle_timeout: config.idle_timeout(),
    }));

    let router = Arc::new(Router::new(
        store,
        Arc::new(MemorySigner::new()),
        sessions,
        config.token_ttl(),
    ));
    let server = HubServer::bind(ServerConfig { listen }, router).await?;

    let server_run = Arc::clone(&server);
    let mut accept = tokio::spawn(async move { server_run.run().await });

    tracing::info!(addr = %server.local_addr(), "hub ready");

    tokio::select! {
        res = &mut accept => {
            res??;
            return Ok(());
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("SIGINT received, shutting down");
        }
    }

    server.shutdown();
    accept.await??;
    Ok(())
}
