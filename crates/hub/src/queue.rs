//! Durable per-device command queue with replay on login.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use warden_protocol::envelope::to_raw;
use warden_protocol::{CommandEnvelope, CommandStatus, Frame};

use crate::HubError;
use crate::registry::Hub;
use crate::store::{CommandStore, NewCommand, QueuedCommand};

/// Outcome of one replay pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReplayReport {
    pub sent: usize,
    pub failed: usize,
    /// Commands left untouched because an earlier delivery failed.
    pub deferred: usize,
}

/// Queues admin commands and delivers them in creation order.
pub struct CommandQueue {
    store: Arc<dyn CommandStore>,
    hub: Arc<Hub>,
    /// One delivery lock per device, so two replays for the same device
    /// never interleave while other devices are unaffected.
    delivery: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl CommandQueue {
    pub fn new(store: Arc<dyn CommandStore>, hub: Arc<Hub>) -> Self {
        Self {
            store,
            hub,
            delivery: StdMutex::new(HashMap::new()),
        }
    }

    fn delivery_lock(&self, device_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self
            .delivery
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(locks.entry(device_id.to_string()).or_default())
    }

    /// Stores a command as pending and, if the device is online, delivers
    /// it right away behind any older queued commands.
    ///
    /// A failed immediate delivery leaves the command pending for the next
    /// login-triggered replay.
    pub async fn enqueue(&self, cmd: NewCommand) -> Result<QueuedCommand, HubError> {
        let record = self.store.create_command(cmd).await?;
        info!(
            id = record.id,
            device = %record.device_id,
            command = %record.command,
            "command queued"
        );

        if !self.hub.is_online(&record.device_id).await {
            debug!(id = record.id, device = %record.device_id, "device offline, command stays pending");
            return Ok(record);
        }

        self.replay(&record.device_id).await?;
        let current = self
            .store
            .get_command(record.id)
            .await?
            .unwrap_or(record);
        if current.status == CommandStatus::Failed {
            self.store
                .update_status(current.id, CommandStatus::Pending, current.last_error.clone())
                .await?;
            return Ok(QueuedCommand {
                status: CommandStatus::Pending,
                ..current
            });
        }
        Ok(current)
    }

    /// Re-sends every pending or failed command of a device, oldest first.
    ///
    /// Stops at the first delivery failure; that command is marked failed
    /// and the rest stay queued untouched.
    pub async fn replay(&self, device_id: &str) -> Result<ReplayReport, HubError> {
        let lock = self.delivery_lock(device_id);
        let _guard = lock.lock().await;
        let queued = self.store.list_by_device(device_id, false).await?;
        let total = queued.len();
        let mut report = ReplayReport::default();

        for (index, cmd) in queued.into_iter().enumerate() {
            let payload = match envelope_bytes(&cmd) {
                Ok(p) => p,
                Err(e) => {
                    warn!(id = cmd.id, "command not serializable: {e}");
                    self.store
                        .update_status(cmd.id, CommandStatus::Failed, Some(e.to_string()))
                        .await?;
                    report.failed += 1;
                    continue;
                }
            };

            match self.hub.send(device_id, &Frame::Command { payload }).await {
                Ok(()) => {
                    self.store.mark_sent(cmd.id).await?;
                    debug!(id = cmd.id, device = %device_id, command = %cmd.command, "command delivered");
                    report.sent += 1;
                }
                Err(e) => {
                    warn!(id = cmd.id, device = %device_id, "command delivery failed: {e}");
                    self.store
                        .update_status(cmd.id, CommandStatus::Failed, Some(e.to_string()))
                        .await?;
                    report.failed += 1;
                    report.deferred = total - index - 1;
                    break;
                }
            }
        }

        if total > 0 {
            info!(
                device = %device_id,
                sent = report.sent,
                failed = report.failed,
                deferred = report.deferred,
                "command replay finished"
            );
        }
        Ok(report)
    }
}

/// Wire form of a queued command.
fn envelope_bytes(cmd: &QueuedCommand) -> Result<Vec<u8>, serde_json::Error> {
    let envelope = CommandEnvelope {
        device_id: cmd.device_id.clone(),
        command: cmd.command.clone(),
        kind: Some(cmd.kind),
        argument: cmd.payload.as_ref().map(|p| to_raw(p)).transpose()?,
    };
    envelope.to_vec()
}
