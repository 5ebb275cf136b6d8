//! Warden hub entry point.

mod app;
mod config;

use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting Warden hub");

    let path = config::resolve_path(std::env::args_os().nth(1));
    let config = config::Config::load(&path)?;
    tracing::info!(path = %path.display(), port = config.tcp.port, "configuration loaded");

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(app::run(config))?;

    tracing::info!("hub shut down cleanly");
    Ok(())
}
