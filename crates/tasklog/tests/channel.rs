use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use opman_common::{LogLevel, StaticToken, TaskId};
use opman_tasklog::{
    ChannelError, ChannelHandle, ChannelHandler, ChannelOptions, Connector, SocketState,
    TaskChannel, TaskEvent, TaskLogs, TaskMonitor, WsConnector,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

const WAIT: Duration = Duration::from_secs(5);

#[derive(Clone)]
enum Then {
    Close,
    Hold,
}

#[derive(Clone)]
struct Script {
    frames: Vec<String>,
    then: Then,
}

impl Script {
    fn new(frames: &[&str], then: Then) -> Self {
        Self {
            frames: frames.iter().map(|f| f.to_string()).collect(),
            then,
        }
    }
}

struct Accepted {
    task_id: u64,
    authorization: Option<String>,
    at: Instant,
}

#[derive(Clone)]
struct MockServer {
    base_url: String,
    scripts: Arc<Vec<Script>>,
    accepted: Arc<Mutex<Vec<Accepted>>>,
    received: Arc<Mutex<Vec<String>>>,
}

impl MockServer {
    /// Connection `n` plays `scripts[n]`; later connections replay the last script.
    async fn start(scripts: Vec<Script>) -> anyhow::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let server = MockServer {
            base_url: format!("ws://{}/api/ws", addr),
            scripts: Arc::new(scripts),
            accepted: Arc::default(),
            received: Arc::default(),
        };
        let app = Router::new()
            .route("/api/ws/tasks/:task_id", get(upgrade))
            .with_state(server.clone());
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Ok(server)
    }

    fn options(&self, reconnect_ms: u64) -> ChannelOptions {
        ChannelOptions {
            base_url: self.base_url.clone(),
            auto_reconnect: true,
            reconnect_interval: Duration::from_millis(reconnect_ms),
        }
    }

    fn connections(&self) -> usize {
        self.accepted.lock().unwrap().len()
    }

    fn received(&self) -> Vec<String> {
        self.received.lock().unwrap().clone()
    }
}

async fn upgrade(
    ws: WebSocketUpgrade,
    Path(task_id): Path<u64>,
    headers: HeaderMap,
    State(server): State<MockServer>,
) -> Response {
    let script = {
        let mut accepted = server.accepted.lock().unwrap();
        let index = accepted.len();
        accepted.push(Accepted {
            task_id,
            authorization: headers
                .get(AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned),
            at: Instant::now(),
        });
        server
            .scripts
            .get(index)
            .or(server.scripts.last())
            .cloned()
            .unwrap_or_else(|| Script::new(&[], Then::Hold))
    };
    ws.on_upgrade(move |socket| play(socket, script, server))
}

async fn play(mut socket: WebSocket, script: Script, server: MockServer) {
    for frame in script.frames {
        if socket.send(Message::Text(frame)).await.is_err() {
            return;
        }
    }
    match script.then {
        Then::Close => {
            let _ = socket.send(Message::Close(None)).await;
        }
        Then::Hold => {
            while let Some(Ok(message)) = socket.recv().await {
                if let Message::Text(text) = message {
                    server.received.lock().unwrap().push(text);
                }
            }
        }
    }
}

fn anonymous() -> Arc<WsConnector> {
    Arc::new(WsConnector::new(Arc::new(StaticToken::anonymous())))
}

async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let polled = timeout(WAIT, async {
        while !condition() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(polled.is_ok(), "timed out waiting for {}", what);
}

#[derive(Clone, Default)]
struct Recorded(Arc<Mutex<Vec<String>>>);

impl Recorded {
    fn all(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    fn count(&self, prefix: &str) -> usize {
        self.all().iter().filter(|c| c.starts_with(prefix)).count()
    }
}

struct Recorder(Recorded);

impl ChannelHandler for Recorder {
    fn on_message(&mut self, event: &TaskEvent) {
        self.0 .0.lock().unwrap().push(format!("message:{:?}", event.kind()));
    }

    fn on_state_change(&mut self, state: SocketState) {
        self.0 .0.lock().unwrap().push(format!("state:{:?}", state));
    }

    fn on_transport_error(&mut self, _error: &ChannelError) {
        self.0 .0.lock().unwrap().push("error".to_string());
    }
}

const WELCOME: &str = r#"{"type":"welcome","taskId":7,"message":"Connected to task log stream"}"#;
const LOG_START: &str = r#"{"type":"log","level":"INFO","message":"starting","source":"worker"}"#;
const DONE: &str = r#"{"type":"completion","success":true,"output":"done"}"#;

#[tokio::test(flavor = "multi_thread")]
async fn completion_retires_channel_without_reconnect() -> anyhow::Result<()> {
    let server = MockServer::start(vec![Script::new(
        &[
            WELCOME,
            LOG_START,
            r#"{"type":"progress","progress":42}"#,
            DONE,
        ],
        Then::Hold,
    )])
    .await?;

    let logs = TaskLogs::follow(TaskId(7), server.options(50), anonymous());
    timeout(WAIT, logs.terminated()).await?;

    let snapshot = logs.snapshot();
    assert!(snapshot.is_complete);
    assert_eq!(snapshot.progress_percent, 100);
    assert_eq!(snapshot.entries.len(), 1);
    assert_eq!(snapshot.entries[0].level, LogLevel::Info);
    assert_eq!(snapshot.entries[0].source.as_deref(), Some("worker"));
    let result = snapshot.result.expect("completion result");
    assert!(result.success);
    assert_eq!(result.output.as_deref(), Some("done"));
    assert_eq!(result.error, None);
    assert!(!snapshot.is_connected);
    assert_eq!(logs.state(), SocketState::Closed);

    sleep(Duration::from_millis(300)).await;
    assert_eq!(server.connections(), 1);
    assert_eq!(server.accepted.lock().unwrap()[0].task_id, 7);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn reconnects_after_unexpected_close_and_keeps_entries() -> anyhow::Result<()> {
    let server = MockServer::start(vec![
        Script::new(&[r#"{"type":"log","level":"INFO","message":"first"}"#], Then::Close),
        Script::new(
            &[r#"{"type":"log","level":"WARN","message":"second"}"#, DONE],
            Then::Hold,
        ),
    ])
    .await?;

    let logs = TaskLogs::follow(TaskId(3), server.options(300), anonymous());
    timeout(WAIT, logs.terminated()).await?;

    let messages: Vec<_> = logs
        .snapshot()
        .entries
        .into_iter()
        .map(|e| e.message)
        .collect();
    assert_eq!(messages, ["first", "second"]);

    let accepted = server.accepted.lock().unwrap();
    assert_eq!(accepted.len(), 2);
    let gap = accepted[1].at.duration_since(accepted[0].at);
    assert!(gap >= Duration::from_millis(300), "reconnected after {:?}", gap);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn malformed_frame_is_dropped_and_channel_stays_open() -> anyhow::Result<()> {
    let server = MockServer::start(vec![Script::new(
        &[
            "not json",
            r#"{"type":"log","level":"LOUD","message":"bad level"}"#,
            r#"{"type":"heartbeat"}"#,
            LOG_START,
        ],
        Then::Hold,
    )])
    .await?;

    let logs = TaskLogs::follow(TaskId(4), server.options(50), anonymous());
    wait_until("one entry", || logs.snapshot().entries.len() == 1).await;
    sleep(Duration::from_millis(100)).await;

    let snapshot = logs.snapshot();
    assert_eq!(snapshot.entries.len(), 1);
    assert_eq!(snapshot.entries[0].message, "starting");
    assert_eq!(snapshot.progress_percent, 0);
    assert!(!snapshot.is_complete);
    assert_eq!(logs.state(), SocketState::Open);
    assert_eq!(server.connections(), 1);
    logs.disconnect();
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn close_twice_tears_down_once_and_stops_reconnect() -> anyhow::Result<()> {
    let server = MockServer::start(vec![Script::new(&[WELCOME], Then::Hold)]).await?;
    let recorded = Recorded::default();
    let channel = TaskChannel::open(
        TaskId(5),
        server.options(50),
        anonymous(),
        Recorder(recorded.clone()),
    );

    wait_until("welcome", || recorded.count("message:Welcome") == 1).await;
    channel.close();
    channel.close();
    timeout(WAIT, channel.terminated()).await?;

    assert_eq!(channel.state(), SocketState::Closed);
    assert_eq!(recorded.count("state:Closed"), 1);
    assert_eq!(recorded.count("error"), 0);

    sleep(Duration::from_millis(200)).await;
    assert_eq!(server.connections(), 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn send_is_delivered_only_while_open() -> anyhow::Result<()> {
    let server = MockServer::start(vec![Script::new(&[WELCOME], Then::Hold)]).await?;
    let recorded = Recorded::default();
    let channel = TaskChannel::open(
        TaskId(6),
        server.options(50),
        anonymous(),
        Recorder(recorded.clone()),
    );

    wait_until("open socket", || channel.state() == SocketState::Open).await;
    channel.send(&serde_json::json!({"type": "ping"}));
    wait_until("frame at server", || server.received().len() == 1).await;
    assert_eq!(server.received()[0], r#"{"type":"ping"}"#);

    channel.close();
    channel.send(&serde_json::json!({"type": "ping"}));
    timeout(WAIT, channel.terminated()).await?;
    assert_eq!(server.received().len(), 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn handshake_carries_bearer_token() -> anyhow::Result<()> {
    let server = MockServer::start(vec![Script::new(&[DONE], Then::Hold)]).await?;
    let connector = Arc::new(WsConnector::new(Arc::new(StaticToken::new("s3cret"))));

    let logs = TaskLogs::follow(TaskId(8), server.options(50), connector);
    timeout(WAIT, logs.terminated()).await?;

    let accepted = server.accepted.lock().unwrap();
    assert_eq!(accepted[0].authorization.as_deref(), Some("Bearer s3cret"));
    Ok(())
}

struct Refusing {
    attempts: AtomicUsize,
}

#[async_trait]
impl Connector for Refusing {
    type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

    async fn connect(&self, _url: &str) -> Result<Self::Socket, ChannelError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(ChannelError::Connect("connection refused".into()))
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn refused_connections_retry_until_closed() -> anyhow::Result<()> {
    let connector = Arc::new(Refusing {
        attempts: AtomicUsize::new(0),
    });
    let recorded = Recorded::default();
    let options = ChannelOptions {
        base_url: "ws://127.0.0.1:1/api/ws".into(),
        auto_reconnect: true,
        reconnect_interval: Duration::from_millis(20),
    };
    let channel = TaskChannel::open(TaskId(9), options, connector.clone(), Recorder(recorded.clone()));

    wait_until("three attempts", || connector.attempts.load(Ordering::SeqCst) >= 3).await;
    channel.send(&"ignored");
    channel.close();
    timeout(WAIT, channel.terminated()).await?;

    assert!(recorded.count("error") >= 3);
    let attempts = connector.attempts.load(Ordering::SeqCst);
    sleep(Duration::from_millis(100)).await;
    assert_eq!(connector.attempts.load(Ordering::SeqCst), attempts);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn without_auto_reconnect_a_failure_ends_the_channel() -> anyhow::Result<()> {
    let connector = Arc::new(Refusing {
        attempts: AtomicUsize::new(0),
    });
    let options = ChannelOptions {
        base_url: "ws://127.0.0.1:1/api/ws".into(),
        auto_reconnect: false,
        reconnect_interval: Duration::from_millis(10),
    };
    let logs = TaskLogs::follow(TaskId(10), options, connector.clone());

    timeout(WAIT, logs.terminated()).await?;
    assert_eq!(connector.attempts.load(Ordering::SeqCst), 1);
    assert_eq!(logs.state(), SocketState::Closed);
    assert!(!logs.is_live());
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn updates_signal_new_entries() -> anyhow::Result<()> {
    let server = MockServer::start(vec![Script::new(&[LOG_START], Then::Hold)]).await?;
    let logs = TaskLogs::follow(TaskId(11), server.options(50), anonymous());
    let mut updates = logs.updates();

    timeout(WAIT, async {
        while logs.snapshot().entries.is_empty() {
            if updates.changed().await.is_err() {
                break;
            }
        }
    })
    .await?;
    assert_eq!(logs.entries_since(0).len(), 1);
    assert!(logs.entries_since(1).is_empty());

    logs.clear();
    assert!(logs.snapshot().entries.is_empty());
    logs.disconnect();
    assert!(!logs.snapshot().is_connected);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn monitor_keeps_one_live_subscription_per_task() -> anyhow::Result<()> {
    let server = MockServer::start(vec![
        Script::new(&[WELCOME], Then::Hold),
        Script::new(&[WELCOME], Then::Hold),
        Script::new(&[DONE], Then::Hold),
    ])
    .await?;
    let monitor = TaskMonitor::new(anonymous(), server.options(50));

    let first = monitor.follow(TaskId(1));
    wait_until("first subscription open", || first.state() == SocketState::Open).await;
    let again = monitor.follow(TaskId(1));
    assert!(Arc::ptr_eq(&first, &again));

    let other = monitor.follow(TaskId(2));
    wait_until("second subscription open", || other.state() == SocketState::Open).await;
    assert_eq!(monitor.active(), vec![TaskId(1), TaskId(2)]);

    assert!(monitor.unfollow(TaskId(1)));
    assert!(!monitor.unfollow(TaskId(1)));
    assert!(!first.is_live());

    let finishing = monitor.follow(TaskId(3));
    timeout(WAIT, finishing.terminated()).await?;
    assert_eq!(monitor.prune_finished(), 1);
    assert_eq!(monitor.active(), vec![TaskId(2)]);

    let replacement = monitor.follow(TaskId(3));
    assert!(!Arc::ptr_eq(&finishing, &replacement));

    monitor.shutdown();
    assert!(monitor.active().is_empty());
    assert!(!replacement.is_live());
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_events_reach_on_message_only() -> anyhow::Result<()> {
    let server = MockServer::start(vec![Script::new(
        &[
            r#"{"type":"heartbeat"}"#,
            r#"{"type":"log","level":"INFO"}"#,
            "not json",
            WELCOME,
        ],
        Then::Hold,
    )])
    .await?;
    let recorded = Recorded::default();
    let channel = TaskChannel::open(
        TaskId(12),
        server.options(50),
        anonymous(),
        Recorder(recorded.clone()),
    );

    wait_until("welcome", || recorded.count("message:Welcome") == 1).await;
    let messages: Vec<_> = recorded
        .all()
        .into_iter()
        .filter(|c| c.starts_with("message:"))
        .collect();
    assert_eq!(messages, ["message:Unknown", "message:Unknown", "message:Welcome"]);
    assert_eq!(channel.state(), SocketState::Open);
    channel.close();
    Ok(())
}

/// Holds the connect until the test has published the handle.
struct Gated {
    inner: Arc<WsConnector>,
    ready: Notify,
}

#[async_trait]
impl Connector for Gated {
    type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

    async fn connect(&self, url: &str) -> Result<Self::Socket, ChannelError> {
        self.ready.notified().await;
        self.inner.connect(url).await
    }
}

struct ClosesOnFirstMessage {
    handle: Arc<OnceLock<ChannelHandle>>,
    calls: Recorded,
}

impl ChannelHandler for ClosesOnFirstMessage {
    fn on_message(&mut self, event: &TaskEvent) {
        let mut calls = self.calls.0.lock().unwrap();
        calls.push(format!("message:{:?}", event.kind()));
        if let Some(handle) = self.handle.get() {
            handle.close();
            calls.push("closed".to_string());
        }
    }

    fn on_log(&mut self, _level: LogLevel, message: &str, _source: Option<&str>) {
        self.calls.0.lock().unwrap().push(format!("log:{}", message));
    }

    fn on_state_change(&mut self, state: SocketState) {
        self.calls.0.lock().unwrap().push(format!("state:{:?}", state));
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn close_inside_on_message_suppresses_the_kind_callback() -> anyhow::Result<()> {
    let server = MockServer::start(vec![Script::new(
        &[
            r#"{"type":"log","level":"INFO","message":"a"}"#,
            r#"{"type":"log","level":"INFO","message":"b"}"#,
        ],
        Then::Hold,
    )])
    .await?;
    let connector = Arc::new(Gated {
        inner: anonymous(),
        ready: Notify::new(),
    });
    let handle = Arc::new(OnceLock::new());
    let recorded = Recorded::default();
    let channel = TaskChannel::open(
        TaskId(13),
        server.options(50),
        connector.clone(),
        ClosesOnFirstMessage {
            handle: handle.clone(),
            calls: recorded.clone(),
        },
    );
    assert!(handle.set(channel).is_ok());
    connector.ready.notify_one();

    let channel = handle.get().expect("published handle");
    timeout(WAIT, channel.terminated()).await?;
    sleep(Duration::from_millis(100)).await;

    let calls: Vec<_> = recorded
        .all()
        .into_iter()
        .filter(|c| !c.starts_with("state:"))
        .collect();
    assert_eq!(calls, ["message:Log", "closed"]);
    assert!(channel.is_closed());
    assert_eq!(channel.state(), SocketState::Closed);
    Ok(())
}
