use std::time::Duration;

use tokio::sync::mpsc;
use warden_agent::{
    AgentContext, AgentError, ConnectionManager, ConnectionState, ManagerConfig, ReconnectConfig,
};
use warden_integration::{TestHub, WAIT, fast_reconnect};

#[test]
fn backoff_delays_never_decrease_and_respect_the_cap() {
    let configs = [
        ReconnectConfig::default(),
        ReconnectConfig {
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
            backoff_factor: 2.0,
            max_retries: 0,
        },
        ReconnectConfig {
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(2),
            backoff_factor: 0.5,
            max_retries: 0,
        },
    ];
    for cfg in configs {
        let delays: Vec<Duration> = (1..=40).map(|a| cfg.delay_for_attempt(a)).collect();
        assert!(delays.windows(2).all(|w| w[0] <= w[1]), "{cfg:?}");
        assert!(delays.iter().all(|d| *d <= cfg.max_delay), "{cfg:?}");
        assert_eq!(*delays.last().unwrap(), cfg.max_delay);
    }
}

async fn closed_port() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr.to_string()
}

#[tokio::test]
async fn gives_up_after_max_retries() {
    let (tx, _rx) = mpsc::unbounded_channel();
    let manager = ConnectionManager::new(
        ManagerConfig {
            hub_addr: closed_port().await,
            reconnect: fast_reconnect(3),
            request_timeout: WAIT,
        },
        AgentContext::new("dev-r", ""),
        tx,
    );
    match manager.run().await {
        Err(AgentError::RetriesExhausted(n)) => assert_eq!(n, 3),
        other => panic!("expected RetriesExhausted, got {other:?}"),
    }
    assert_eq!(manager.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn agent_reconnects_after_connection_loss() {
    let hub = TestHub::start().await;
    let state = tempfile::tempdir().unwrap();
    let agent = hub.agent("dev-r2", state.path(), Vec::new());
    let run = agent.clone();
    let task = tokio::spawn(async move { run.run().await });
    hub.wait_for_device("dev-r2").await;

    let conn = hub
        .server
        .router()
        .hub()
        .connection("dev-r2")
        .await
        .expect("agent connection registered");
    conn.shutdown().await;

    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let current = hub.server.router().hub().connection("dev-r2").await;
        if current.is_some_and(|c| c.id() != conn.id()) {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "agent did not reconnect");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // The token from the first login was persisted and authorizes the
    // new connection.
    assert!(!std::fs::read_to_string(state.path().join("token")).unwrap().is_empty());
    let log = serde_json::json!({ "lines": "back online" });
    assert_eq!(agent.manager().request("agent_log", Some(&log)).await.unwrap(), "log stored");

    agent.shutdown().await;
    task.await.unwrap().unwrap();
}
