//! Identity shared by every agent component.

use std::sync::Arc;

use tokio::sync::watch;

/// Device id and bearer token the agent presents to the hub.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Identity {
    pub device_id: String,
    pub token: String,
}

/// Single-writer, many-reader holder of the agent [`Identity`].
///
/// Only the login flow writes; the connection manager, dispatcher and
/// handlers read the latest value or subscribe to changes.
#[derive(Clone)]
pub struct AgentContext {
    tx: Arc<watch::Sender<Identity>>,
}

impl AgentContext {
    pub fn new(device_id: impl Into<String>, token: impl Into<String>) -> Self {
        let (tx, _rx) = watch::channel(Identity {
            device_id: device_id.into(),
            token: token.into(),
        });
        Self { tx: Arc::new(tx) }
    }

    pub fn identity(&self) -> Identity {
        self.tx.borrow().clone()
    }

    pub fn device_id(&self) -> String {
        self.tx.borrow().device_id.clone()
    }

    pub fn token(&self) -> String {
        self.tx.borrow().token.clone()
    }

    pub fn set_token(&self, token: impl Into<String>) {
        let token = token.into();
        self.tx.send_modify(|id| id.token = token);
    }

    pub fn subscribe(&self) -> watch::Receiver<Identity> {
        self.tx.subscribe()
    }
}
