//! Agent configuration.
//!
//! Stored as TOML; the path is the first CLI argument, otherwise
//! `~/.config/warden/agent.toml` (`%APPDATA%\warden\agent.toml` on Windows).
//! Relative paths inside the file are taken as-is (relative to the
//! working directory).

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use warden_agent::ReconnectConfig;
use warden_protocol::constants::DEFAULT_TCP_PORT;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub backend: BackendConfig,
    /// Fixed device id; resolved and persisted automatically when unset.
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default = "default_device_id_path")]
    pub device_id_path: PathBuf,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_token_path")]
    pub token_path: PathBuf,
    #[serde(default = "default_log_path")]
    pub log_path: PathBuf,
    #[serde(default)]
    pub monitor_paths: Vec<PathBuf>,
    #[serde(default = "default_sync_interval")]
    pub sync_interval_sec: u64,
    #[serde(default)]
    pub reconnect: ReconnectSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectSection {
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    /// 0 = retry forever.
    #[serde(default)]
    pub max_retries: u32,
}

fn default_host() -> String {
    "127.0.0.1".into()
}

fn default_port() -> u16 {
    DEFAULT_TCP_PORT
}

fn default_device_id_path() -> PathBuf {
    state_dir().join("device_id")
}

fn default_token_path() -> PathBuf {
    state_dir().join("token")
}

fn default_log_path() -> PathBuf {
    state_dir().join("agent.log")
}

fn default_sync_interval() -> u64 {
    10
}

fn default_initial_delay() -> u64 {
    1_000
}

fn default_max_delay() -> u64 {
    30_000
}

fn default_backoff_factor() -> f64 {
    1.5
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            backoff_factor: default_backoff_factor(),
            max_retries: 0,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: BackendConfig::default(),
            device_id: None,
            device_id_path: default_device_id_path(),
            username: String::new(),
            password: String::new(),
            token_path: default_token_path(),
            log_path: default_log_path(),
            monitor_paths: Vec::new(),
            sync_interval_sec: default_sync_interval(),
            reconnect: ReconnectSection::default(),
        }
    }
}

impl Config {
    /// Reads `path`; a missing file yields the defaults.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn hub_addr(&self) -> String {
        format!("{}:{}", self.backend.host, self.backend.port)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_sec.max(1))
    }

    pub fn reconnect(&self) -> ReconnectConfig {
        ReconnectConfig {
            initial_delay: Duration::from_millis(self.reconnect.initial_delay_ms),
            max_delay: Duration::from_millis(self.reconnect.max_delay_ms),
            backoff_factor: self.reconnect.backoff_factor,
            max_retries: self.reconnect.max_retries,
        }
    }
}

/// Explicit path if given, else the platform default.
pub fn resolve_path(arg: Option<OsString>) -> PathBuf {
    arg.map(PathBuf::from)
        .unwrap_or_else(|| state_dir().join("agent.toml"))
}

fn state_dir() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        let appdata =
            std::env::var("APPDATA").unwrap_or_else(|_| "C:\\Users\\Default\\AppData".into());
        PathBuf::from(appdata).join("warden")
    }

    #[cfg(not(target_os = "windows"))]
    {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
        PathBuf::from(home).join(".config").join("warden")
    }
}
