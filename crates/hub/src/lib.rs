//! Warden backend: accepts agent connections and routes their frames.
//!
//! - [`registry::Hub`]: device id -> live connection.
//! - [`router::Router`]: per-connection frame handling and sub-commands.
//! - [`queue::CommandQueue`]: admin commands with replay on login.
//! - [`server::HubServer`]: TCP accept loop.

pub mod auth;
pub mod queue;
pub mod registry;
pub mod router;
pub mod server;
pub mod store;
mod subcommands;

pub use auth::{AuthError, Claims, MemorySigner, TokenSigner};
pub use queue::{CommandQueue, ReplayReport};
pub use registry::Hub;
pub use router::{ConnState, Phase, Router};
pub use server::{HubServer, ServerConfig};
pub use store::{MemoryStore, Repository, StoreError};
pub use subcommands::CommandError;

use warden_transfer::TransferError;
use warden_transport::TransportError;

/// Errors produced by the hub.
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("auth error: {0}")]
    Auth(#[from] AuthError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("device offline: {0}")]
    Offline(String),
}
