use chrono::Utc;
use pulse_client::{ClientConfig, ClientHandle, ConnectionStatus};
use pulse_core::{AgentStatus, EventType};
use pulse_hub::config::Config;
use pulse_hub::run_hub;
use pulse_reader::SessionDirReader;
use serde_json::{json, Map, Value};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::watch;

fn write_agent(root: &Path, agent_id: &str, model: &str, transcript: &str) {
    let dir = root.join(agent_id).join("sessions");
    fs::create_dir_all(&dir).expect("create sessions dir");
    let mut index = Map::new();
    index.insert(
        format!("agent:{agent_id}:main"),
        json!({
            "sessionId": "s-1",
            "updatedAt": Utc::now().timestamp_millis(),
            "model": model,
            "inputTokens": 100,
            "outputTokens": 20
        }),
    );
    fs::write(dir.join("sessions.json"), Value::Object(index).to_string()).expect("write index");
    fs::write(dir.join("s-1.jsonl"), transcript).expect("write transcript");
}

async fn wait_for<T, F>(receiver: &mut watch::Receiver<T>, mut predicate: F)
where
    F: FnMut(&T) -> bool,
{
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if predicate(&receiver.borrow_and_update()) {
                return;
            }
            if receiver.changed().await.is_err() {
                return;
            }
        }
    })
    .await
    .expect("condition reached in time");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn client_receives_sync_and_live_deltas() {
    let sessions = TempDir::new().expect("sessions dir");
    write_agent(
        sessions.path(),
        "alpha",
        "k2p5",
        "{\"type\":\"message\",\"message\":{\"content\":[{\"type\":\"toolCall\",\"name\":\"read\"}]}}\n",
    );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral port");
    let addr = listener.local_addr().expect("local addr");
    let config = Config {
        poll_interval: Duration::from_millis(100),
        heartbeat_interval: Duration::from_secs(30),
        sessions_dir: sessions.path().to_path_buf(),
        log_dir: String::new(),
        ..Config::default()
    };
    let source = Arc::new(SessionDirReader::new(sessions.path()));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let hub = tokio::spawn(run_hub(config, listener, source, shutdown_rx));

    // Give the first poll a chance to land so the client joins late.
    tokio::time::sleep(Duration::from_millis(300)).await;

    let client = ClientHandle::spawn(ClientConfig::new(format!("ws://{addr}/ws")));
    let mut status = client.status();
    wait_for(&mut status, |status| *status == ConnectionStatus::Connected).await;

    let mut view = client.view();
    wait_for(&mut view, |view| view.agent("alpha").is_some()).await;
    {
        let view = view.borrow();
        let alpha = view.agent("alpha").expect("alpha synced");
        assert_eq!(alpha.model, "k2p5");
        assert!(alpha.tools.contains("read"));
        assert_eq!(alpha.status, AgentStatus::Active);
    }

    write_agent(
        sessions.path(),
        "alpha",
        "claude-sonnet",
        "{\"tool\":\"read\"}\n{\"tool_name\":\"bash\"}\n",
    );
    wait_for(&mut view, |view| {
        view.agent("alpha")
            .is_some_and(|alpha| alpha.model == "claude-sonnet" && alpha.tools.contains("bash"))
    })
    .await;

    let feed = client.feed().borrow().clone();
    let types: Vec<EventType> = feed.iter().map(|event| event.event_type).collect();
    assert_eq!(types.first(), Some(&EventType::Heartbeat));
    assert_eq!(feed.iter().next().and_then(|e| e.payload_str("kind")), Some("connected"));
    assert!(feed
        .iter()
        .any(|event| event.event_type == EventType::AgentStarted && event.payload["sync"] == true));
    assert!(types.contains(&EventType::ModelSwitched));
    assert!(types.contains(&EventType::ToolCalled));

    let _ = shutdown_tx.send(true);
    tokio::time::timeout(Duration::from_secs(10), hub)
        .await
        .expect("hub stops")
        .expect("join hub")
        .expect("hub result");
    client.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn state_endpoint_reports_aggregates() {
    let sessions = TempDir::new().expect("sessions dir");
    write_agent(sessions.path(), "alpha", "k2p5", "");

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral port");
    let addr = listener.local_addr().expect("local addr");
    let config = Config {
        poll_interval: Duration::from_millis(50),
        log_dir: String::new(),
        ..Config::default()
    };
    let source = Arc::new(SessionDirReader::new(sessions.path()));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let hub = tokio::spawn(run_hub(config, listener, source, shutdown_rx));
    tokio::time::sleep(Duration::from_millis(300)).await;

    let body = http_get(&addr.to_string(), "/api/state").await;
    let value: Value = serde_json::from_str(&body).expect("state json");
    assert_eq!(value["totalAgents"], 1);
    assert_eq!(value["totalSessions"], 1);
    assert_eq!(value["totalTokens"], 120);
    assert_eq!(value["agents"]["alpha"]["currentModel"], "k2p5");

    let health = http_get(&addr.to_string(), "/health").await;
    assert_eq!(health, "ok");

    let _ = shutdown_tx.send(true);
    let _ = tokio::time::timeout(Duration::from_secs(10), hub).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn client_reconnects_after_hub_restart() {
    let sessions = TempDir::new().expect("sessions dir");
    write_agent(sessions.path(), "alpha", "k2p5", "");
    let config = Config {
        poll_interval: Duration::from_millis(100),
        sessions_dir: sessions.path().to_path_buf(),
        log_dir: String::new(),
        ..Config::default()
    };

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral port");
    let addr = listener.local_addr().expect("local addr");
    let source = Arc::new(SessionDirReader::new(sessions.path()));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let hub = tokio::spawn(run_hub(config.clone(), listener, source.clone(), shutdown_rx));

    let client = ClientHandle::spawn(ClientConfig::new(format!("ws://{addr}/ws")));
    let mut status = client.status();
    wait_for(&mut status, |status| *status == ConnectionStatus::Connected).await;

    let _ = shutdown_tx.send(true);
    tokio::time::timeout(Duration::from_secs(10), hub)
        .await
        .expect("hub stops")
        .expect("join hub")
        .expect("hub result");
    wait_for(&mut status, |status| *status != ConnectionStatus::Connected).await;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("rebind same port");
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let hub = tokio::spawn(run_hub(config, listener, source, shutdown_rx));

    wait_for(&mut status, |status| *status == ConnectionStatus::Connected).await;
    let mut feed = client.feed();
    wait_for(&mut feed, |feed| {
        feed.iter()
            .filter(|event| event.payload_str("kind") == Some("connected"))
            .count()
            >= 2
    })
    .await;
    let mut view = client.view();
    wait_for(&mut view, |view| view.agent("alpha").is_some()).await;

    let _ = shutdown_tx.send(true);
    let _ = tokio::time::timeout(Duration::from_secs(10), hub).await;
    client.shutdown().await;
}

/// Minimal HTTP/1.1 GET returning the response body.
async fn http_get(addr: &str, path: &str) -> String {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let mut stream = tokio::net::TcpStream::connect(addr).await.expect("connect");
    let request = format!("GET {path} HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.expect("write request");
    let mut response = String::new();
    stream
        .read_to_string(&mut response)
        .await
        .expect("read response");
    let (head, body) = response.split_once("\r\n\r\n").expect("http response");
    assert!(head.starts_with("HTTP/1.1 200"), "unexpected response: {head}");
    body.to_string()
}
