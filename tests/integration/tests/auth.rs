use warden_integration::{PASSWORD, TestHub, USERNAME};
use warden_protocol::Frame;
use warden_protocol::messages::{DeviceInfo, LoginRequest};

fn credentials(password: &str, device: &str) -> LoginRequest {
    LoginRequest {
        username: USERNAME.into(),
        password: password.into(),
        device_id: Some(device.into()),
        name: None,
        os_name: None,
        os_version: None,
        hostname: None,
        arch: None,
    }
}

#[tokio::test]
async fn device_command_without_login_is_unauthorized() {
    let hub = TestHub::start().await;
    let mut client = hub.client().await;

    let status = client.request("get_logs", Some(&serde_json::json!({}))).await;
    assert_eq!(status, (401, "unauthorized".into()));

    // The connection survives the refusal.
    assert_eq!(client.request::<()>("ping", None).await, (200, "pong".into()));
}

#[tokio::test]
async fn unknown_login_token_leaves_connection_unauthenticated() {
    let hub = TestHub::start().await;
    let mut client = hub.client().await;
    client
        .send(Frame::Login {
            device_id: "dev-1".into(),
            token: "not-a-token".into(),
        })
        .await;

    let info = DeviceInfo {
        uuid: None,
        name: Some("laptop".into()),
        os_name: None,
        os_version: None,
        hostname: None,
        arch: None,
    };
    let (code, _) = client.request("device_register", Some(&info)).await;
    assert_eq!(code, 401);

    let wrong = credentials("wrong", "dev-1");
    let (code, msg) = client.request("login", Some(&wrong)).await;
    assert_eq!((code, msg.as_str()), (401, "invalid credentials"));

    let right = credentials(PASSWORD, "dev-1");
    let (code, _) = client.request("login", Some(&right)).await;
    assert_eq!(code, 200);
    assert_eq!(client.request("device_register", Some(&info)).await.0, 200);

    let device = hub.repo_device("dev-1").await;
    assert_eq!(device.name, "laptop");
}

#[tokio::test]
async fn token_from_login_authenticates_a_new_connection() {
    let hub = TestHub::start().await;
    let mut first = hub.client().await;
    let token = first.login("dev-2").await;

    let mut second = hub.client().await;
    second
        .send(Frame::Login {
            device_id: "dev-2".into(),
            token,
        })
        .await;
    let log = serde_json::json!({ "lines": "boot ok" });
    assert_eq!(second.request("agent_log", Some(&log)).await, (200, "log stored".into()));
}

#[tokio::test]
async fn malformed_command_json_keeps_connection() {
    let hub = TestHub::start().await;
    let mut client = hub.client().await;
    client
        .send(Frame::Command {
            payload: b"{not json".to_vec(),
        })
        .await;
    let frame = client.next().await;
    assert_eq!(frame.status(), Some((400, "invalid command json")));
    assert_eq!(client.request::<()>("ping", None).await, (200, "pong".into()));
}
