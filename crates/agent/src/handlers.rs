//! Built-in agent commands.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use warden_protocol::CommandKind;
use warden_protocol::constants::{
    ACTION_AGENT_LOG, COMMAND_BACKUP, COMMAND_BACKUP_AUTO, COMMAND_GET_LOGS, COMMAND_RESTORE,
};
use warden_protocol::messages::{AgentLog, BackupArgs, BackupAutoArgs, GetLogsArgs, RestoreArgs};

use crate::AgentError;
use crate::dispatcher::{CommandDispatcher, CommandHandler, HandlerFuture};
use crate::filetree::{Snapshot, diff, scan};
use crate::manager::ConnectionManager;
use crate::transfer::{download_file, upload_file};

const DEFAULT_LOG_LINES: usize = 100;
const DEFAULT_BACKUP_INTERVAL_SECS: u64 = 300;

/// Registers every built-in command on `dispatcher`.
pub fn register_builtins(
    dispatcher: &CommandDispatcher,
    manager: &Arc<ConnectionManager>,
    log_path: PathBuf,
    monitor_paths: Vec<PathBuf>,
) {
    dispatcher.register(
        COMMAND_GET_LOGS,
        GetLogs {
            manager: Arc::clone(manager),
            log_path,
        },
    );
    dispatcher.register(
        COMMAND_BACKUP,
        Backup {
            manager: Arc::clone(manager),
        },
    );
    dispatcher.register(
        COMMAND_BACKUP_AUTO,
        BackupAuto {
            manager: Arc::clone(manager),
            monitor_paths,
        },
    );
    dispatcher.register(
        COMMAND_RESTORE,
        Restore {
            manager: Arc::clone(manager),
        },
    );
}

/// `get_logs`: sends the tail of the agent log file as `agent_log`.
pub struct GetLogs {
    manager: Arc<ConnectionManager>,
    log_path: PathBuf,
}

impl CommandHandler for GetLogs {
    type Args = Option<GetLogsArgs>;

    fn run(&self, args: Self::Args, _cancel: CancellationToken) -> HandlerFuture<'_> {
        Box::pin(async move {
            let lines = args
                .and_then(|a| a.lines)
                .filter(|n| *n > 0)
                .unwrap_or(DEFAULT_LOG_LINES);
            let text = match tokio::fs::read_to_string(&self.log_path).await {
                Ok(text) => tail(&text, lines),
                Err(e) => {
                    warn!(path = %self.log_path.display(), "reading agent log failed: {e}");
                    "<no log available>".to_string()
                }
            };
            debug!(bytes = text.len(), "sending agent log");
            self.manager
                .request(ACTION_AGENT_LOG, Some(&AgentLog { lines: text }))
                .await?;
            Ok(())
        })
    }
}

/// Last `n` lines of `text`.
fn tail(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}

/// `backup`: uploads one file.
pub struct Backup {
    manager: Arc<ConnectionManager>,
}

impl CommandHandler for Backup {
    type Args = BackupArgs;

    fn run(&self, args: BackupArgs, cancel: CancellationToken) -> HandlerFuture<'_> {
        Box::pin(async move {
            if args.path.is_empty() {
                return Err(AgentError::InvalidArgument("missing path".into()));
            }
            upload_file(
                &self.manager,
                Path::new(&args.path),
                args.logical_path.as_deref(),
                &cancel,
            )
            .await?;
            Ok(())
        })
    }
}

/// `backup_auto`: uploads new and modified files under the monitor paths
/// every `interval_sec` until stopped. The first pass uploads everything.
pub struct BackupAuto {
    manager: Arc<ConnectionManager>,
    monitor_paths: Vec<PathBuf>,
}

impl CommandHandler for BackupAuto {
    type Args = Option<BackupAutoArgs>;

    fn kind(&self) -> CommandKind {
        CommandKind::Stream
    }

    fn run(&self, args: Self::Args, cancel: CancellationToken) -> HandlerFuture<'_> {
        Box::pin(async move {
            let secs = args
                .and_then(|a| a.interval_sec)
                .filter(|s| *s > 0)
                .unwrap_or(DEFAULT_BACKUP_INTERVAL_SECS);
            info!(interval_secs = secs, paths = self.monitor_paths.len(), "auto backup running");

            let mut backed_up = Snapshot::new();
            let mut ticker = tokio::time::interval(Duration::from_secs(secs));
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let current = scan(&self.monitor_paths).await;
                let (changed, _) = diff(&backed_up, &current);
                let mut uploaded = 0;
                for path in changed {
                    if cancel.is_cancelled() {
                        break;
                    }
                    let Some(entry) = current.get(&path) else {
                        continue;
                    };
                    if entry.is_dir || entry.size == 0 {
                        backed_up.insert(path, *entry);
                        continue;
                    }
                    // Only stored files are recorded; anything else is
                    // retried on the next pass.
                    match upload_file(&self.manager, &path, None, &cancel).await {
                        Ok(_) => {
                            backed_up.insert(path, *entry);
                            uploaded += 1;
                        }
                        Err(AgentError::Cancelled) => break,
                        Err(e) => warn!(path = %path.display(), "auto backup failed: {e}"),
                    }
                }
                backed_up.retain(|p, _| current.contains_key(p));
                if uploaded > 0 {
                    info!(files = uploaded, "auto backup pass complete");
                }
            }
            info!("auto backup stopped");
            Ok(())
        })
    }
}

/// `restore`: downloads a stored backup to `dest_path`.
pub struct Restore {
    manager: Arc<ConnectionManager>,
}

impl CommandHandler for Restore {
    type Args = RestoreArgs;

    fn run(&self, args: RestoreArgs, _cancel: CancellationToken) -> HandlerFuture<'_> {
        Box::pin(async move {
            if args.file_name.is_empty() || args.dest_path.is_empty() {
                return Err(AgentError::InvalidArgument(
                    "file_name and dest_path are required".into(),
                ));
            }
            let size =
                download_file(&self.manager, &args.file_name, Path::new(&args.dest_path)).await?;
            info!(file = %args.file_name, dest = %args.dest_path, size, "restore complete");
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use warden_protocol::constants::ACTION_BACKUP_INIT_UPLOAD;
    use warden_protocol::envelope::raw_from_str;
    use warden_protocol::messages::InitUploadRequest;
    use warden_protocol::{CommandEnvelope, Frame, SessionStatus};

    use crate::testing::{action, answer_status, connected, descriptor, drain_upload};

    fn auto_backup(interval_sec: u64) -> CommandEnvelope {
        let argument = format!(r#"{{"interval_sec":{interval_sec}}}"#);
        CommandEnvelope {
            device_id: "dev-1".into(),
            command: COMMAND_BACKUP_AUTO.into(),
            kind: None,
            argument: Some(raw_from_str(&argument).unwrap()),
        }
    }

    #[tokio::test]
    async fn stopping_auto_backup_interrupts_running_upload() {
        let tmp = tempfile::tempdir().unwrap();
        let watched = tmp.path().join("watched");
        std::fs::create_dir_all(&watched).unwrap();
        let size = 16 * 1024 * 1024;
        std::fs::write(watched.join("big.bin"), vec![1u8; size]).unwrap();

        let (mgr, hub, mut rx) = connected().await;
        let dispatcher = CommandDispatcher::new();
        register_builtins(&dispatcher, &mgr, tmp.path().join("agent.log"), vec![watched]);
        dispatcher.dispatch(auto_backup(3600)).await.unwrap();

        let init = action(&rx.recv().await.unwrap().unwrap());
        assert_eq!(init.action, ACTION_BACKUP_INIT_UPLOAD);
        let desc = descriptor("up-big", "big.bin", size as u64, 0, 64 * 1024);
        hub.send_ack(200, serde_json::to_string(&desc).unwrap())
            .await
            .unwrap();
        assert!(matches!(rx.recv().await.unwrap().unwrap(), Frame::FileChunk { .. }));

        // Mid-upload, with the hub no longer reading.
        let started = Instant::now();
        assert!(dispatcher.stop(COMMAND_BACKUP_AUTO).await);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(dispatcher.active().await.is_empty());
        mgr.shutdown().await;
    }

    #[tokio::test]
    async fn auto_backup_retries_file_the_hub_did_not_store() {
        let tmp = tempfile::tempdir().unwrap();
        let watched = tmp.path().join("watched");
        std::fs::create_dir_all(&watched).unwrap();
        std::fs::write(watched.join("a.txt"), b"hello").unwrap();

        let (mgr, hub, mut rx) = connected().await;
        let dispatcher = CommandDispatcher::new();
        register_builtins(&dispatcher, &mgr, tmp.path().join("agent.log"), vec![watched]);
        dispatcher.dispatch(auto_backup(1)).await.unwrap();

        for (session, outcome) in [
            ("up-1", SessionStatus::Error),
            ("up-2", SessionStatus::Completed),
        ] {
            let init = action(&rx.recv().await.unwrap().unwrap());
            assert_eq!(init.action, ACTION_BACKUP_INIT_UPLOAD);
            let req: InitUploadRequest = init.parse_data().unwrap();
            assert_eq!(req.file_name, "a.txt");
            let desc = descriptor(session, "a.txt", 5, 0, 4);
            hub.send_ack(200, serde_json::to_string(&desc).unwrap())
                .await
                .unwrap();
            assert_eq!(drain_upload(&mut rx).await, b"hello");
            answer_status(&hub, &mut rx, session, outcome).await;
        }

        // Stored now: the next pass has nothing to send.
        let quiet = tokio::time::timeout(Duration::from_millis(1500), rx.recv()).await;
        assert!(quiet.is_err());
        dispatcher.stop(COMMAND_BACKUP_AUTO).await;
        mgr.shutdown().await;
    }

    #[test]
    fn tail_keeps_last_lines() {
        assert_eq!(tail("a\nb\nc\n", 2), "b\nc");
        assert_eq!(tail("a\nb", 10), "a\nb");
        assert_eq!(tail("", 5), "");
    }

    #[test]
    fn restore_args_require_fields() {
        assert!(serde_json::from_str::<RestoreArgs>(r#"{"file_name":"a"}"#).is_err());
        let args: RestoreArgs =
            serde_json::from_str(r#"{"file_name":"a","dest_path":"/tmp/a"}"#).unwrap();
        assert_eq!(args.dest_path, "/tmp/a");
    }

    #[test]
    fn optional_args_accept_null() {
        let args: Option<GetLogsArgs> = serde_json::from_str("null").unwrap();
        assert!(args.is_none());
        let args: Option<BackupAutoArgs> = serde_json::from_str(r#"{"interval_sec":5}"#).unwrap();
        assert_eq!(args.unwrap().interval_sec, Some(5));
    }
}
