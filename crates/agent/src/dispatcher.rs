//! Agent-side command dispatcher.
//!
//! Maps command names to typed handlers. `once` commands run to completion
//! on the dispatcher worker; `stream` commands run as background tasks,
//! at most one per name, until stopped.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use serde::de::DeserializeOwned;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use warden_protocol::constants::STOP_COMMAND;
use warden_protocol::messages::StopArgs;
use warden_protocol::{CommandEnvelope, CommandKind};

use crate::AgentError;

/// A boxed future returned by handler methods.
pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = Result<(), AgentError>> + Send + 'a>>;

/// A command the agent knows how to run.
///
/// `run` receives the decoded argument and a cancellation token; stream
/// handlers must return promptly once the token fires.
pub trait CommandHandler: Send + Sync + 'static {
    type Args: DeserializeOwned + Send + 'static;

    /// Kind used when the envelope does not specify one.
    fn kind(&self) -> CommandKind {
        CommandKind::Once
    }

    fn run(&self, args: Self::Args, cancel: CancellationToken) -> HandlerFuture<'_>;
}

type Task = Pin<Box<dyn Future<Output = Result<(), AgentError>> + Send + 'static>>;

/// Object-safe view of a [`CommandHandler`].
trait ErasedHandler: Send + Sync {
    fn kind(&self) -> CommandKind;
    fn start(&self, argument: &str, cancel: CancellationToken) -> Result<Task, serde_json::Error>;
}

struct Typed<H>(Arc<H>);

impl<H: CommandHandler> ErasedHandler for Typed<H> {
    fn kind(&self) -> CommandKind {
        self.0.kind()
    }

    fn start(&self, argument: &str, cancel: CancellationToken) -> Result<Task, serde_json::Error> {
        let args: H::Args = serde_json::from_str(argument)?;
        let handler = Arc::clone(&self.0);
        Ok(Box::pin(async move { handler.run(args, cancel).await }))
    }
}

struct StreamHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct CommandDispatcher {
    handlers: RwLock<HashMap<String, Arc<dyn ErasedHandler>>>,
    active: Mutex<HashMap<String, StreamHandle>>,
    cancel: CancellationToken,
}

impl Default for CommandDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandDispatcher {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            active: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
        }
    }

    /// Registers `handler` under `name`, replacing any previous one.
    pub fn register<H: CommandHandler>(&self, name: impl Into<String>, handler: H) {
        let name = name.into();
        if name == STOP_COMMAND {
            warn!("`{STOP_COMMAND}` is reserved, handler not registered");
            return;
        }
        if let Ok(mut handlers) = self.handlers.write() {
            handlers.insert(name, Arc::new(Typed(Arc::new(handler))));
        }
    }

    fn handler(&self, name: &str) -> Option<Arc<dyn ErasedHandler>> {
        self.handlers.read().ok()?.get(name).cloned()
    }

    /// Runs one queued command.
    ///
    /// `once` commands are awaited here; `stream` commands replace any
    /// running instance of the same name and return once started.
    pub async fn dispatch(&self, envelope: CommandEnvelope) -> Result<(), AgentError> {
        let name = envelope.command.as_str();
        if name == STOP_COMMAND {
            let args: StopArgs = serde_json::from_str(envelope.argument_json()).map_err(|e| {
                warn!("invalid stop argument: {e}");
                AgentError::InvalidArgument(e.to_string())
            })?;
            self.stop(&args.name).await;
            return Ok(());
        }

        let Some(handler) = self.handler(name) else {
            warn!(command = %name, "unknown command");
            return Err(AgentError::UnknownCommand(name.to_string()));
        };
        let kind = envelope.kind.unwrap_or_else(|| handler.kind());
        let cancel = self.cancel.child_token();
        let task = handler
            .start(envelope.argument_json(), cancel.clone())
            .map_err(|e| {
                warn!(command = %name, "dropping command with invalid argument: {e}");
                AgentError::InvalidArgument(e.to_string())
            })?;

        match kind {
            CommandKind::Once => {
                let result = task.await;
                match &result {
                    Ok(()) => info!(command = %name, "command completed"),
                    Err(e) => warn!(command = %name, "command failed: {e}"),
                }
                result
            }
            CommandKind::Stream => {
                self.stop(name).await;
                let label = name.to_string();
                let join = tokio::spawn(async move {
                    match task.await {
                        Ok(()) => debug!(command = %label, "stream command finished"),
                        Err(e) => warn!(command = %label, "stream command failed: {e}"),
                    }
                });
                self.active.lock().await.insert(
                    name.to_string(),
                    StreamHandle { cancel, task: join },
                );
                info!(command = %name, "stream command started");
                Ok(())
            }
        }
    }

    /// Stops a running stream command. Unknown or finished names are a no-op.
    pub async fn stop(&self, name: &str) -> bool {
        let Some(handle) = self.active.lock().await.remove(name) else {
            debug!(command = %name, "stop: not running");
            return false;
        };
        handle.cancel.cancel();
        let _ = handle.task.await;
        info!(command = %name, "stream command stopped");
        true
    }

    /// Stops every running stream command.
    pub async fn stop_all(&self) {
        let handles: Vec<_> = self.active.lock().await.drain().collect();
        for (name, handle) in handles {
            handle.cancel.cancel();
            let _ = handle.task.await;
            debug!(command = %name, "stream command stopped");
        }
    }

    /// Names of stream commands still running.
    pub async fn active(&self) -> Vec<String> {
        let active = self.active.lock().await;
        let mut names: Vec<String> = active
            .iter()
            .filter(|(_, h)| !h.task.is_finished())
            .map(|(n, _)| n.clone())
            .collect();
        names.sort();
        names
    }

    /// Dispatches commands one at a time in arrival order until the
    /// channel closes, then stops all stream commands.
    pub async fn run(&self, mut commands: mpsc::UnboundedReceiver<CommandEnvelope>) {
        while let Some(envelope) = commands.recv().await {
            let _ = self.dispatch(envelope).await;
        }
        self.stop_all().await;
    }
}
