//! Device registry: device id -> live connection.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use warden_protocol::Frame;
use warden_protocol::constants::SEND_TIMEOUT;
use warden_transport::{Connection, TransportError};

use crate::HubError;

/// Routes frames to online devices.
///
/// Holds at most one connection per device: the most recently
/// registered one. This is the only liveness source on the hub.
pub struct Hub {
    devices: RwLock<HashMap<String, Arc<Connection>>>,
    send_timeout: Duration,
}

impl Default for Hub {
    fn default() -> Self {
        Self::with_send_timeout(SEND_TIMEOUT)
    }
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    /// A hub that gives up on a frame write after `send_timeout`.
    pub fn with_send_timeout(send_timeout: Duration) -> Self {
        Self {
            devices: RwLock::new(HashMap::new()),
            send_timeout,
        }
    }

    /// Stores `conn` as the route for `device_id`, replacing any older one.
    ///
    /// Returns the replaced connection, if any.
    pub async fn register(&self, device_id: &str, conn: Arc<Connection>) -> Option<Arc<Connection>> {
        let conn_id = conn.id();
        let previous = self
            .devices
            .write()
            .await
            .insert(device_id.to_string(), conn);
        match &previous {
            Some(old) if old.id() != conn_id => {
                info!(device = %device_id, old = %old.id(), new = %conn_id, "device re-registered");
            }
            _ => info!(device = %device_id, conn = %conn_id, "device registered"),
        }
        previous
    }

    /// Removes the route for `device_id` only if it still points at `conn`.
    ///
    /// A late disconnect of a superseded connection never evicts the
    /// newer one. Returns `true` if the entry was removed.
    pub async fn unregister(&self, device_id: &str, conn: &Connection) -> bool {
        let mut devices = self.devices.write().await;
        match devices.get(device_id) {
            Some(current) if current.id() == conn.id() => {
                devices.remove(device_id);
                info!(device = %device_id, conn = %conn.id(), "device unregistered");
                true
            }
            Some(current) => {
                debug!(
                    device = %device_id,
                    stale = %conn.id(),
                    current = %current.id(),
                    "ignoring stale unregister"
                );
                false
            }
            None => false,
        }
    }

    /// Returns `true` if the device has a registered, open connection.
    pub async fn is_online(&self, device_id: &str) -> bool {
        self.devices
            .read()
            .await
            .get(device_id)
            .is_some_and(|c| c.is_open())
    }

    /// Ids of all devices with an open connection, sorted.
    pub async fn online_devices(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .devices
            .read()
            .await
            .iter()
            .filter(|(_, c)| c.is_open())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Current connection of a device.
    pub async fn connection(&self, device_id: &str) -> Option<Arc<Connection>> {
        self.devices.read().await.get(device_id).cloned()
    }

    /// Delivers a frame to a device.
    ///
    /// No retry: a failed or timed-out write closes the connection, drops
    /// the route and reports the error; retry policy belongs to the
    /// command queue.
    pub async fn send(&self, device_id: &str, frame: &Frame) -> Result<(), HubError> {
        let conn = self
            .connection(device_id)
            .await
            .filter(|c| c.is_open())
            .ok_or_else(|| HubError::Offline(device_id.to_string()))?;

        let result = match tokio::time::timeout(self.send_timeout, conn.send(frame)).await {
            Ok(result) => result,
            Err(_) => {
                // A half-written frame leaves the stream unusable.
                conn.close();
                Err(TransportError::Timeout)
            }
        };
        if let Err(e) = result {
            warn!(device = %device_id, conn = %conn.id(), "delivery failed: {e}");
            self.unregister(device_id, &conn).await;
            return Err(e.into());
        }
        Ok(())
    }
}
