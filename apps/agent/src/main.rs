//! Warden agent entry point.

mod app;
mod config;

use std::path::Path;
use std::sync::Arc;

use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

fn main() -> anyhow::Result<()> {
    let path = config::resolve_path(std::env::args_os().nth(1));
    let config = config::Config::load(&path)?;

    init_logging(&config.log_path)?;
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting Warden agent");
    tracing::info!(
        path = %path.display(),
        found = path.exists(),
        hub = %config.hub_addr(),
        "configuration loaded"
    );

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(app::run(config))?;

    tracing::info!("agent shut down cleanly");
    Ok(())
}

/// Logs to stdout and appends to `log_path`, which `get_logs` tails.
fn init_logging(log_path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = log_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(Arc::new(file)),
        )
        .init();
    Ok(())
}
