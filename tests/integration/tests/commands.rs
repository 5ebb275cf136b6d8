use std::time::Duration;

use warden_integration::TestHub;
use warden_protocol::messages::{AdminSendCommand, AdminSendCommandResult, DeviceSummary};
use warden_protocol::{CommandEnvelope, CommandKind, CommandStatus, Frame};

fn send_command(device: &str, command: &str, payload: serde_json::Value) -> AdminSendCommand {
    AdminSendCommand {
        device_id: device.into(),
        command: command.into(),
        kind: None,
        payload: Some(payload),
    }
}

fn envelope(frame: Frame) -> CommandEnvelope {
    match frame {
        Frame::Command { payload } => CommandEnvelope::from_slice(&payload).unwrap(),
        other => panic!("expected a queued command, got {other:?}"),
    }
}

#[tokio::test]
async fn command_to_online_device_is_sent_immediately() {
    let hub = TestHub::start().await;
    let mut device = hub.client().await;
    device.login("dev-a").await;

    let mut admin = hub.client().await;
    let req = send_command("dev-a", "get_logs", serde_json::json!({ "lines": 5 }));
    let result: AdminSendCommandResult = admin.request_json("admin_send_command", Some(&req)).await;
    assert!(result.sent);
    assert_eq!(result.status, CommandStatus::Sent);

    let env = envelope(device.next().await);
    assert_eq!(env.device_id, "dev-a");
    assert_eq!(env.command, "get_logs");
    let arg: serde_json::Value = serde_json::from_str(env.argument_json()).unwrap();
    assert_eq!(arg["lines"], 5);
}

#[tokio::test]
async fn command_to_offline_device_waits_for_login() {
    let hub = TestHub::start().await;
    let mut admin = hub.client().await;

    let first: AdminSendCommandResult = admin
        .request_json(
            "admin_send_command",
            Some(&send_command("dev-b", "backup", serde_json::json!({ "path": "/a" }))),
        )
        .await;
    assert!(!first.sent);
    assert_eq!(first.status, CommandStatus::Pending);

    let second: AdminSendCommandResult = admin
        .request_json(
            "admin_send_command",
            Some(&send_command("dev-b", "backup", serde_json::json!({ "path": "/b" }))),
        )
        .await;
    assert!(second.id > first.id);

    // A bare LOGIN frame is enough to trigger the replay, in FIFO order.
    let mut device = hub.client().await;
    device
        .send(Frame::Login {
            device_id: "dev-b".into(),
            token: String::new(),
        })
        .await;
    let paths: Vec<String> = [device.next().await, device.next().await]
        .into_iter()
        .map(|f| {
            let arg: serde_json::Value = serde_json::from_str(envelope(f).argument_json()).unwrap();
            arg["path"].as_str().unwrap().to_string()
        })
        .collect();
    assert_eq!(paths, ["/a", "/b"]);
}

#[tokio::test]
async fn admin_lists_devices_and_online_peers() {
    let hub = TestHub::start().await;
    let mut device = hub.client().await;
    device.login("dev-c").await;

    let mut admin = hub.client().await;
    let devices: Vec<DeviceSummary> = admin.request_json::<(), _>("admin_list_devices", None).await;
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].uuid, "dev-c");
    assert!(devices[0].online);

    let online: Vec<String> = admin.request_json::<(), _>("admin_list_online", None).await;
    assert_eq!(online, ["dev-c"]);

    // The caller's own id is excluded.
    let own: Vec<String> = device.request_json::<(), _>("admin_list_online", None).await;
    assert!(own.is_empty());
}

#[tokio::test]
async fn agent_runs_queued_commands() {
    let hub = TestHub::start().await;
    let state = tempfile::tempdir().unwrap();
    std::fs::write(state.path().join("agent.log"), "line one\nline two\nline three\n").unwrap();
    let source = state.path().join("report.txt");
    std::fs::write(&source, "quarterly numbers").unwrap();

    let agent = hub.agent("dev-d", state.path(), Vec::new());
    let run = agent.clone();
    let task = tokio::spawn(async move { run.run().await });
    hub.wait_for_device("dev-d").await;

    let mut admin = hub.client().await;
    let _: AdminSendCommandResult = admin
        .request_json(
            "admin_send_command",
            Some(&send_command("dev-d", "get_logs", serde_json::json!({ "lines": 2 }))),
        )
        .await;
    let logs = hub.wait_for_logs("dev-d").await;
    assert_eq!(logs, ["line two", "line three"]);

    let backup = serde_json::json!({ "path": source, "logical_path": "reports/q.txt" });
    let _: AdminSendCommandResult = admin
        .request_json("admin_send_command", Some(&send_command("dev-d", "backup", backup)))
        .await;
    let backups = hub.wait_for_backups("dev-d", 1).await;
    assert_eq!(backups[0].logical_path, "reports/q.txt");
    assert_eq!(backups[0].size, 17);

    let dest = state.path().join("restored.txt");
    let restore = serde_json::json!({ "file_name": "report.txt", "dest_path": dest });
    let _: AdminSendCommandResult = admin
        .request_json("admin_send_command", Some(&send_command("dev-d", "restore", restore)))
        .await;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !dest.exists() {
        assert!(tokio::time::Instant::now() < deadline, "restore did not finish");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(std::fs::read_to_string(&dest).unwrap(), "quarterly numbers");

    agent.shutdown().await;
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn stream_command_runs_until_stopped() {
    let hub = TestHub::start().await;
    let state = tempfile::tempdir().unwrap();
    let agent = hub.agent("dev-e", state.path(), Vec::new());
    let run = agent.clone();
    let task = tokio::spawn(async move { run.run().await });
    hub.wait_for_device("dev-e").await;

    let mut admin = hub.client().await;
    let start = AdminSendCommand {
        device_id: "dev-e".into(),
        command: "backup_auto".into(),
        kind: Some(CommandKind::Stream),
        payload: Some(serde_json::json!({ "interval_sec": 3600 })),
    };
    let _: AdminSendCommandResult = admin.request_json("admin_send_command", Some(&start)).await;
    wait_active(&agent, true).await;

    let stop = send_command("dev-e", "stop", serde_json::json!({ "name": "backup_auto" }));
    let _: AdminSendCommandResult = admin.request_json("admin_send_command", Some(&stop)).await;
    wait_active(&agent, false).await;

    agent.shutdown().await;
    task.await.unwrap().unwrap();
}

async fn wait_active(agent: &warden_agent::Agent, running: bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let active = agent.dispatcher().active().await;
        if active.iter().any(|n| n == "backup_auto") == running {
            return;
        }
        assert!(tokio::time::Instant::now() < deadline, "backup_auto running != {running}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
