//! Hub configuration.
//!
//! Stored as TOML; the path is the first CLI argument, otherwise
//! `~/.config/warden/hub.toml` (`%APPDATA%\warden\hub.toml` on Windows).

use std::ffi::OsString;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use warden_protocol::constants::{DEFAULT_CHUNK_SIZE, DEFAULT_TCP_PORT, SESSION_IDLE_TIMEOUT};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub tcp: TcpConfig,
    #[serde(default)]
    pub backup: BackupConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub users: Vec<UserConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Host advertised to agents in transfer descriptors. Defaults to `host`.
    #[serde(default)]
    pub advertise_host: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    #[serde(default = "default_storage_path")]
    pub storage_path: PathBuf,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_idle_timeout")]
    pub session_idle_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "default_token_ttl")]
    pub token_ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserConfig {
    pub username: String,
    pub password: String,
    #[serde(default = "default_role")]
    pub role: String,
}

fn default_host() -> String {
    "0.0.0.0".into()
}

fn default_port() -> u16 {
    DEFAULT_TCP_PORT
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("backups")
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_idle_timeout() -> u64 {
    SESSION_IDLE_TIMEOUT.as_secs()
}

fn default_token_ttl() -> u64 {
    24 * 60 * 60
}

fn default_role() -> String {
    "user".into()
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            advertise_host: None,
        }
    }
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            storage_path: default_storage_path(),
            chunk_size: default_chunk_size(),
            session_idle_timeout_secs: default_idle_timeout(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_ttl_secs: default_token_ttl(),
        }
    }
}

impl Config {
    /// Reads `path`; a missing file yields the defaults.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            tracing::warn!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn listen_addr(&self) -> anyhow::Result<SocketAddr> {
        let addr = format!("{}:{}", self.tcp.host, self.tcp.port).parse()?;
        Ok(addr)
    }

    /// Host written into session descriptors.
    pub fn advertise_host(&self) -> String {
        match &self.tcp.advertise_host {
            Some(h) => h.clone(),
            None if self.tcp.host == "0.0.0.0" => "127.0.0.1".into(),
            None => self.tcp.host.clone(),
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.backup.session_idle_timeout_secs.max(1))
    }

    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.auth.token_ttl_secs)
    }
}

/// Explicit path if given, else the platform default.
pub fn resolve_path(arg: Option<OsString>) -> PathBuf {
    arg.map(PathBuf::from).unwrap_or_else(default_path)
}

fn default_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        let appdata =
            std::env::var("APPDATA").unwrap_or_else(|_| "C:\\Users\\Default\\AppData".into());
        PathBuf::from(appdata).join("warden").join("hub.toml")
    }

    #[cfg(not(target_os = "windows"))]
    {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
        PathBuf::from(home).join(".config").join("warden").join("hub.toml")
    }
}
