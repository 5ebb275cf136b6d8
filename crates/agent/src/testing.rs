//! Scripted hub end for unit tests: a real TCP socket the test drives by
//! hand, frame by frame.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use warden_protocol::messages::{SessionDescriptor, UploadStatus};
use warden_protocol::{Direction, Frame, SessionStatus, SubCommand};
use warden_transport::{Connection, FrameReader, split_stream};

use crate::backoff::ReconnectConfig;
use crate::context::AgentContext;
use crate::manager::{ConnectionManager, ManagerConfig};

/// Starts a manager against a local listener and returns it with the
/// hub's side of the accepted connection, LOGIN already consumed.
pub(crate) async fn connected() -> (Arc<ConnectionManager>, Arc<Connection>, FrameReader) {
    let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = l.local_addr().unwrap().to_string();
    let (tx, _rx) = mpsc::unbounded_channel();
    let mgr = ConnectionManager::new(
        ManagerConfig {
            hub_addr: addr,
            reconnect: ReconnectConfig {
                initial_delay: Duration::from_millis(10),
                ..Default::default()
            },
            request_timeout: Duration::from_secs(5),
        },
        AgentContext::new("dev-1", ""),
        tx,
    );
    let runner = Arc::clone(&mgr);
    tokio::spawn(async move { runner.run().await });
    let (stream, _) = l.accept().await.unwrap();
    let (hub, mut reader) = split_stream(stream);
    assert!(matches!(reader.recv().await.unwrap().unwrap(), Frame::Login { .. }));
    (mgr, hub, reader)
}

pub(crate) fn descriptor(
    id: &str,
    name: &str,
    size: u64,
    offset: u64,
    chunk: usize,
) -> SessionDescriptor {
    SessionDescriptor {
        session_id: id.into(),
        token: "tok".into(),
        file_name: name.into(),
        file_size: size,
        offset,
        chunk_size: chunk,
        tcp_host: "127.0.0.1".into(),
        tcp_port: 0,
        direction: Direction::Upload,
        status: SessionStatus::Pending,
    }
}

pub(crate) fn action(frame: &Frame) -> SubCommand {
    match frame {
        Frame::Command { payload } => SubCommand::from_slice(payload).unwrap(),
        other => panic!("expected command, got {other:?}"),
    }
}

/// Reads FILE_CHUNK frames up to FILE_DONE; returns the bytes received.
pub(crate) async fn drain_upload(rx: &mut FrameReader) -> Vec<u8> {
    let mut bytes = Vec::new();
    loop {
        match rx.recv().await.unwrap().unwrap() {
            Frame::FileChunk { data, .. } => bytes.extend_from_slice(&data),
            Frame::FileDone { .. } => return bytes,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

/// Answers the post-upload status request with `status`.
pub(crate) async fn answer_status(
    hub: &Connection,
    rx: &mut FrameReader,
    session_id: &str,
    status: SessionStatus,
) {
    let cmd = action(&rx.recv().await.unwrap().unwrap());
    assert_eq!(cmd.action, warden_protocol::constants::ACTION_BACKUP_UPLOAD_STATUS);
    let report = UploadStatus {
        session_id: session_id.into(),
        status,
        offset: 0,
        stored_name: (status == SessionStatus::Completed).then(|| format!("1_{session_id}")),
    };
    hub.send_ack(200, serde_json::to_string(&report).unwrap())
        .await
        .unwrap();
}
