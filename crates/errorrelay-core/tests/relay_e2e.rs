//! End-to-end tests: real WebSocket reporting clients against a bound
//! listener, read back through the query interface and the MCP handler.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::SinkExt;
use serde_json::json;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use errorrelay_core::arbiter::{PortInspector, TakeoverOutcome};
use errorrelay_core::config::Config;
use errorrelay_core::error::ArbiterError;
use errorrelay_core::history::HistoryBuffer;
use errorrelay_core::listener::{ListenerState, ListenerStats, ReportListener};
use errorrelay_core::mcp::McpServer;
use errorrelay_core::query::{EMPTY_HISTORY_GUIDANCE, GET_BROWSER_LOGS, QueryInterface};
use errorrelay_core::relay::Relay;

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Harness {
    addr: SocketAddr,
    history: Arc<HistoryBuffer>,
    stats: Arc<ListenerStats>,
    stop: Option<oneshot::Sender<()>>,
}

impl Harness {
    async fn start() -> Self {
        let history = Arc::new(HistoryBuffer::new());
        let listener = ReportListener::bind("127.0.0.1:0".parse().unwrap(), Arc::clone(&history))
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        let stats = listener.stats();
        let (stop, stopped) = oneshot::channel::<()>();
        tokio::spawn(listener.run_until(async move {
            let _ = stopped.await;
        }));
        Self {
            addr,
            history,
            stats,
            stop: Some(stop),
        }
    }

    async fn client(&self) -> Client {
        let (ws, _response) = connect_async(format!("ws://{}", self.addr)).await.unwrap();
        ws
    }

    fn query(&self) -> QueryInterface {
        QueryInterface::new(Arc::clone(&self.history))
    }

    /// Wait until the listener has processed `frames` frames in total.
    async fn settle(&self, frames: u64) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let counters = self.stats.counters();
                if counters.accepted + counters.dropped >= frames {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("listener did not process frames in time");
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

async fn send(client: &mut Client, frame: serde_json::Value) {
    client.send(Message::text(frame.to_string())).await.unwrap();
}

#[tokio::test]
async fn empty_history_returns_guidance() {
    let harness = Harness::start().await;
    let text = harness.query().get_logs();
    assert_eq!(text, EMPTY_HISTORY_GUIDANCE);
    assert!(text.contains("development mode"));
}

#[tokio::test]
async fn single_report_is_rendered() {
    let harness = Harness::start().await;
    let mut client = harness.client().await;

    send(
        &mut client,
        json!({ "type": "error", "message": "X", "timestamp": 1_700_000_000_000_i64 }),
    )
    .await;
    harness.settle(1).await;

    let text = harness.query().get_logs();
    assert!(text.starts_with("Recent browser errors (1 total"), "{text}");
    assert!(text.contains("1. ["), "{text}");
    assert!(text.contains("ERROR: X"), "{text}");
}

#[tokio::test]
async fn overflow_keeps_most_recent_twenty() {
    let harness = Harness::start().await;
    let mut client = harness.client().await;

    for n in 1..=25_i64 {
        send(
            &mut client,
            json!({ "type": "error", "message": format!("failure #{n}"), "timestamp": n }),
        )
        .await;
    }
    harness.settle(25).await;

    let snapshot = harness.history.snapshot();
    assert_eq!(snapshot.len(), 20);
    assert_eq!(snapshot[0].message, "failure #6");
    assert_eq!(snapshot[19].message, "failure #25");

    let text = harness.query().get_logs();
    assert!(text.contains("(20 total"), "{text}");
    assert!(text.contains("1. ["), "{text}");
    assert!(text.contains("20. ["), "{text}");
    assert!(!text.contains("21. ["), "{text}");
    assert!(!text.contains("failure #5\n"), "{text}");
    let first = text.find("failure #6").unwrap();
    let last = text.find("failure #25").unwrap();
    assert!(first < last);
}

#[tokio::test]
async fn frame_without_timestamp_is_dropped() {
    let harness = Harness::start().await;
    let mut client = harness.client().await;

    send(
        &mut client,
        json!({ "type": "crash", "message": "kept", "timestamp": 10 }),
    )
    .await;
    harness.settle(1).await;
    let before = harness.history.snapshot();

    send(&mut client, json!({ "type": "error", "message": "no clock" })).await;
    client.send(Message::text("not json")).await.unwrap();
    harness.settle(3).await;

    assert_eq!(harness.history.snapshot(), before);
    assert_eq!(harness.stats.counters().dropped, 2);
    assert!(!harness.query().get_logs().contains("no clock"));
}

#[tokio::test]
async fn concurrent_clients_share_history() {
    let harness = Harness::start().await;
    let mut first = harness.client().await;
    let mut second = harness.client().await;

    send(
        &mut first,
        json!({ "type": "error", "message": "from first", "timestamp": 1 }),
    )
    .await;
    send(
        &mut second,
        json!({
            "type": "unhandledrejection",
            "message": "from second",
            "timestamp": 2,
            "stack": "at a\nat b\nat c\nat d",
            "url": "http://localhost:3000/",
        }),
    )
    .await;
    harness.settle(2).await;

    let text = harness.query().get_logs();
    assert!(text.contains("ERROR: from first"), "{text}");
    assert!(text.contains("UNHANDLEDREJECTION: from second"), "{text}");
    assert!(text.contains("   URL: http://localhost:3000/"), "{text}");
    assert!(text.contains("   at c"), "{text}");
    assert!(!text.contains("at d"), "{text}");
    assert_eq!(harness.stats.counters().connections, 2);
}

#[tokio::test]
async fn mcp_tool_call_sees_reported_errors() {
    let harness = Harness::start().await;
    let mut client = harness.client().await;
    send(
        &mut client,
        json!({ "type": "crash", "message": "renderer gone", "timestamp": 5 }),
    )
    .await;
    harness.settle(1).await;

    let server = McpServer::new(harness.query());
    let request = json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": "tools/call",
        "params": { "name": GET_BROWSER_LOGS, "arguments": {} },
    });
    let response = server.handle_line(&request.to_string()).unwrap();
    let text = response["result"]["content"][0]["text"].as_str().unwrap();
    assert!(text.contains("CRASH: renderer gone"), "{text}");
}

struct ForeignHolder;

impl PortInspector for ForeignHolder {
    fn enumerate_owners(&self, _port: u16) -> Result<Vec<u32>, ArbiterError> {
        Ok(vec![4242])
    }
    fn process_name(&self, _pid: u32) -> Option<String> {
        Some("postgres".into())
    }
    fn terminate(&self, pid: u32) -> Result<(), String> {
        panic!("foreign pid {pid} must never be terminated");
    }
    fn is_alive(&self, _pid: u32) -> bool {
        true
    }
}

#[tokio::test]
async fn foreign_owner_keeps_port_and_query_still_answers() {
    let held = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = held.local_addr().unwrap();

    let mut config = Config::default();
    config.relay.host = addr.ip();
    config.relay.port = addr.port();
    config.arbiter.grace_ms = 0;

    let relay = Relay::with_inspector(config, Arc::new(ForeignHolder));
    let (report, listener) = relay.start().await;

    let arbitration = report.arbitration.clone().unwrap();
    assert!(matches!(
        arbitration.outcome,
        TakeoverOutcome::ForeignOwner { .. }
    ));
    assert_eq!(arbitration.terminations, 0);
    assert!(arbitration.summary().contains("postgres"));

    assert!(listener.is_none());
    assert_eq!(report.listener, ListenerState::BindFailed);
    assert_eq!(relay.query().get_logs(), EMPTY_HISTORY_GUIDANCE);

    // The foreign owner still holds its socket.
    assert!(held.local_addr().is_ok());
}
