use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use warden_agent::{download_file, upload_file};
use warden_hub::store::BackupStore;
use warden_integration::{RawClient, TestHub};
use warden_protocol::messages::{
    BackupVersion, InitUploadRequest, ListBackupsRequest, SessionDescriptor, UploadStatus,
    UploadStatusRequest,
};
use warden_protocol::{Frame, SessionStatus};

const CHUNK: usize = 512 * 1024;

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Finished backups in `dir` whose stored name ends with `_<name>`.
fn stored(dir: &Path, name: &str) -> Vec<PathBuf> {
    let suffix = format!("_{name}");
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(&suffix))
        })
        .collect()
}

async fn init_upload(client: &mut RawClient, name: &str, size: u64) -> SessionDescriptor {
    let req = InitUploadRequest {
        file_name: name.into(),
        file_size: size,
        checksum: None,
        logical_path: Some(format!("docs/{name}")),
    };
    client.request_json("backup_init_upload", Some(&req)).await
}

async fn send_chunk(client: &RawClient, desc: &SessionDescriptor, offset: u64, data: &[u8]) {
    client
        .send(Frame::FileChunk {
            session_id: desc.session_id.clone(),
            token: desc.token.clone(),
            offset,
            data: data.to_vec(),
        })
        .await;
}

async fn send_done(client: &RawClient, desc: &SessionDescriptor) {
    client
        .send(Frame::FileDone {
            session_id: desc.session_id.clone(),
            token: desc.token.clone(),
        })
        .await;
}

#[tokio::test]
async fn one_and_a_half_mib_upload_in_three_chunks() {
    let hub = TestHub::start().await;
    let mut client = hub.client().await;
    client.login("dev-up").await;

    let data = payload(1_572_864);
    let desc = init_upload(&mut client, "big.bin", data.len() as u64).await;
    assert_eq!(desc.offset, 0);
    assert_eq!(desc.chunk_size, CHUNK);

    for offset in [0usize, 524_288, 1_048_576] {
        send_chunk(&client, &desc, offset as u64, &data[offset..offset + CHUNK]).await;
    }
    send_done(&client, &desc).await;
    // Frames on one connection are handled in order, so the pong means
    // the upload has been finalized.
    assert_eq!(client.request::<()>("ping", None).await, (200, "pong".into()));
    assert!(hub.server.router().sessions().get(&desc.session_id).await.is_none());

    let files = stored(&hub.device_dir("dev-up"), "big.bin");
    assert_eq!(files.len(), 1);
    assert_eq!(std::fs::read(&files[0]).unwrap(), data);

    let versions = hub.repo.list_backups("dev-up", None).await.unwrap();
    assert_eq!(versions.len(), 1);
    assert_eq!(versions[0].logical_path, "docs/big.bin");
    assert_eq!(versions[0].size, 1_572_864);
    assert_eq!(versions[0].version, 1);

    let mut admin = hub.client().await;
    let req = ListBackupsRequest {
        device_id: "dev-up".into(),
        logical_path: Some("docs/big.bin".into()),
    };
    let listed: Vec<BackupVersion> = admin.request_json("admin_list_backups", Some(&req)).await;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].stored_name, versions[0].stored_name);
}

async fn upload_status(client: &mut RawClient, desc: &SessionDescriptor) -> UploadStatus {
    let req = UploadStatusRequest {
        session_id: desc.session_id.clone(),
        token: desc.token.clone(),
    };
    client.request_json("backup_upload_status", Some(&req)).await
}

#[tokio::test]
async fn checksum_failure_keeps_partial_and_restarts_on_retry() {
    let hub = TestHub::start().await;
    let mut client = hub.client().await;
    client.login("dev-sum").await;

    let good = payload(4096);
    let mut bad = good.clone();
    bad[100] ^= 0xFF;
    let req = InitUploadRequest {
        file_name: "s.bin".into(),
        file_size: good.len() as u64,
        checksum: Some(hex::encode(Sha256::digest(&good))),
        logical_path: Some("docs/s.bin".into()),
    };

    let desc: SessionDescriptor = client.request_json("backup_init_upload", Some(&req)).await;
    send_chunk(&client, &desc, 0, &bad).await;
    send_done(&client, &desc).await;
    let outcome = upload_status(&mut client, &desc).await;
    assert_eq!(outcome.status, SessionStatus::Error);
    assert!(stored(&hub.device_dir("dev-sum"), "s.bin").is_empty());

    // The rejected bytes stay on disk.
    let partial = hub.device_dir("dev-sum").join(".partial");
    let parts: Vec<_> = std::fs::read_dir(&partial).unwrap().collect();
    assert_eq!(parts.len(), 1);

    let retry: SessionDescriptor = client.request_json("backup_init_upload", Some(&req)).await;
    assert_eq!(retry.offset, 0);
    send_chunk(&client, &retry, 0, &good).await;
    send_done(&client, &retry).await;
    let outcome = upload_status(&mut client, &retry).await;
    assert_eq!(outcome.status, SessionStatus::Completed);

    let files = stored(&hub.device_dir("dev-sum"), "s.bin");
    assert_eq!(files.len(), 1);
    assert_eq!(std::fs::read(&files[0]).unwrap(), good);
}

#[tokio::test]
async fn interrupted_upload_resumes_from_partial_file() {
    let hub = TestHub::start().await;
    let data = payload(CHUNK + 1000);

    {
        let mut first = hub.client().await;
        first.login("dev-resume").await;
        let desc = init_upload(&mut first, "r.bin", data.len() as u64).await;
        send_chunk(&first, &desc, 0, &data[..CHUNK]).await;
        assert_eq!(first.request::<()>("ping", None).await.0, 200);
        first.conn.shutdown().await;
    }

    let mut second = hub.client().await;
    second.login("dev-resume").await;
    let desc = init_upload(&mut second, "r.bin", data.len() as u64).await;
    assert_eq!(desc.offset, CHUNK as u64);

    send_chunk(&second, &desc, desc.offset, &data[CHUNK..]).await;
    send_done(&second, &desc).await;
    assert_eq!(second.request::<()>("ping", None).await.0, 200);

    let files = stored(&hub.device_dir("dev-resume"), "r.bin");
    assert_eq!(files.len(), 1);
    assert_eq!(std::fs::read(&files[0]).unwrap(), data);
}

#[tokio::test]
async fn chunks_for_unknown_session_are_ignored() {
    let hub = TestHub::start().await;
    let mut client = hub.client().await;
    client.login("dev-x").await;

    client
        .send(Frame::FileChunk {
            session_id: "up-doesnotexist".into(),
            token: "bogus".into(),
            offset: 0,
            data: vec![1, 2, 3],
        })
        .await;
    client
        .send(Frame::FileDone {
            session_id: "up-doesnotexist".into(),
            token: "bogus".into(),
        })
        .await;

    // No reply to either frame: the next one is the pong.
    assert_eq!(client.request::<()>("ping", None).await, (200, "pong".into()));
    assert!(hub.repo.list_backups("dev-x", None).await.unwrap().is_empty());
}

#[tokio::test]
async fn chunk_with_foreign_session_is_ignored() {
    let hub = TestHub::start().await;
    let mut owner = hub.client().await;
    owner.login("dev-owner").await;
    let desc = init_upload(&mut owner, "own.bin", 4).await;

    let mut intruder = hub.client().await;
    intruder.login("dev-intruder").await;
    send_chunk(&intruder, &desc, 0, b"evil").await;
    send_done(&intruder, &desc).await;
    assert_eq!(intruder.request::<()>("ping", None).await.0, 200);

    assert!(stored(&hub.device_dir("dev-owner"), "own.bin").is_empty());

    // The owner can still complete its own upload.
    send_chunk(&owner, &desc, 0, b"good").await;
    send_done(&owner, &desc).await;
    assert_eq!(owner.request::<()>("ping", None).await.0, 200);
    let files = stored(&hub.device_dir("dev-owner"), "own.bin");
    assert_eq!(std::fs::read(&files[0]).unwrap(), b"good");
}

#[tokio::test]
async fn agent_uploads_and_restores_a_file() {
    let hub = TestHub::start().await;
    let state = tempfile::tempdir().unwrap();
    let agent = hub.agent("dev-agent", state.path(), Vec::new());
    let run = agent.clone();
    let task = tokio::spawn(async move { run.run().await });

    // Registered means the credential handshake finished.
    hub.wait_for_device("dev-agent").await;

    let source = state.path().join("photo.raw");
    let data = payload(1_572_864);
    std::fs::write(&source, &data).unwrap();

    let report = upload_file(
        agent.manager(),
        &source,
        Some("pictures/photo.raw"),
        &CancellationToken::new(),
    )
    .await
    .unwrap();
    assert_eq!(report.file_size, 1_572_864);
    assert_eq!(report.resumed_from, 0);
    assert_eq!(report.chunks, 3);
    assert_eq!(stored(&hub.device_dir("dev-agent"), "photo.raw").len(), 1);

    let dest = state.path().join("restore").join("photo.raw");
    let size = download_file(agent.manager(), "photo.raw", &dest).await.unwrap();
    assert_eq!(size, 1_572_864);
    assert_eq!(std::fs::read(&dest).unwrap(), data);

    agent.shutdown().await;
    task.await.unwrap().unwrap();
}
