//! End-to-end sync integration tests.
//!
//! Real WebSocket clients against a server bound to a random local port:
//!
//! - Push relay between sessions of one room
//! - Room teardown on last leave and rehydration from disk
//! - Handshake rejection for incompatible clients
//! - Admin delete of a live room

use axum::body::Body;
use axum::http::{Request, StatusCode};
use futures::{SinkExt, StreamExt};
use gachaboard_sync::RoomId;
use gachaboard_sync::engine::RecordEngineFactory;
use gachaboard_sync::protocol::PROTOCOL_VERSION;
use gachaboard_sync::schema::SchemaDescriptor;
use gachaboard_sync::storage::RoomStore;
use gachaboard_sync_server::handlers::{AppState, router};
use gachaboard_sync_server::sync::RoomRegistry;
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tower::util::ServiceExt;

// =============================================================================
// Test Infrastructure
// =============================================================================

struct TestServer {
    addr: SocketAddr,
    state: AppState,
    _dir: tempfile::TempDir,
    _shutdown: oneshot::Sender<()>,
}

impl TestServer {
    /// Start a server over a fresh rooms directory on a random available port
    async fn start() -> Self {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let registry = RoomRegistry::new(
            RoomStore::new(dir.path().join("rooms")),
            Arc::new(RecordEngineFactory::default()),
        );
        let state = AppState { registry };
        let app = router(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .unwrap();
        });

        Self {
            addr,
            state,
            _dir: dir,
            _shutdown: shutdown_tx,
        }
    }

    fn registry(&self) -> &Arc<RoomRegistry> {
        &self.state.registry
    }

    async fn client(&self, room: &str, session: &str) -> TestClient {
        let url = format!("ws://{}/sync/{}?sessionId={}", self.addr, room, session);
        let (ws, _) = connect_async(url).await.expect("Failed to connect");
        TestClient { ws }
    }

    /// Issue an admin request against the same registry the server uses
    async fn admin(&self, method: &str, uri: &str) -> (StatusCode, Value) {
        let response = router(self.state.clone())
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    async fn wait_until_unloaded(&self, room: &str) {
        let id = RoomId::parse(room).unwrap();
        for _ in 0..300 {
            if !self.registry().is_loaded(&id).await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("room {} was never unloaded", room);
    }
}

struct TestClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl TestClient {
    async fn send(&mut self, value: Value) {
        self.ws
            .send(Message::Text(value.to_string().into()))
            .await
            .expect("send failed");
    }

    /// Next JSON frame; `None` once the server has closed the socket
    async fn recv(&mut self) -> Option<Value> {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(5), self.ws.next())
                .await
                .expect("timed out waiting for a frame");
            match frame {
                Some(Ok(Message::Text(text))) => {
                    return Some(serde_json::from_str(text.as_str()).expect("invalid JSON"));
                }
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return None,
                Some(Ok(_)) => continue,
            }
        }
    }

    /// Skip frames until one of the given type arrives
    async fn recv_type(&mut self, kind: &str) -> Value {
        loop {
            let msg = self
                .recv()
                .await
                .unwrap_or_else(|| panic!("socket closed while waiting for {}", kind));
            if msg["type"] == kind {
                return msg;
            }
        }
    }

    async fn handshake(&mut self, last_server_clock: u64) -> Value {
        self.send(connect_message(PROTOCOL_VERSION, last_server_clock))
            .await;
        self.recv_type("connect").await
    }

    async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }
}

fn connect_message(protocol_version: u32, last_server_clock: u64) -> Value {
    json!({
        "type": "connect",
        "connectRequestId": uuid::Uuid::new_v4().to_string(),
        "lastServerClock": last_server_clock,
        "protocolVersion": protocol_version,
        "schema": serde_json::to_value(SchemaDescriptor::board()).unwrap(),
    })
}

fn shape(id: &str, x: i64) -> Value {
    json!({"id": id, "typeName": "shape", "type": "geo", "x": x, "y": 0})
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn test_push_relayed_between_clients() {
    let server = TestServer::start().await;

    let mut alice = server.client("board", "alice").await;
    let mut bob = server.client("board", "bob").await;
    let ack = alice.handshake(0).await;
    assert_eq!(ack["protocolVersion"], PROTOCOL_VERSION);
    bob.handshake(0).await;

    let (status, body) = server.admin("GET", "/status/board").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"roomId": "board", "activeSessions": 2}));

    alice
        .send(json!({
            "type": "push",
            "clientClock": 1,
            "diff": {"shape:a": [0, shape("shape:a", 10)]},
        }))
        .await;

    let result = alice.recv_type("push_result").await;
    assert_eq!(result["action"], "commit");
    assert_eq!(result["serverClock"], 1);

    let data = bob.recv_type("data").await;
    assert_eq!(data["serverClock"], 1);
    assert_eq!(data["diff"]["shape:a"][1]["x"], 10);

    alice.close().await;
    bob.close().await;
}

#[tokio::test]
async fn test_room_rehydrates_after_teardown() {
    let server = TestServer::start().await;

    let mut alice = server.client("persist", "alice").await;
    alice.handshake(0).await;
    alice
        .send(json!({
            "type": "push",
            "clientClock": 1,
            "diff": {"shape:a": [0, shape("shape:a", 42)]},
        }))
        .await;
    alice.recv_type("push_result").await;
    alice.close().await;

    server.wait_until_unloaded("persist").await;
    assert!(
        server
            .registry()
            .store()
            .exists(&RoomId::parse("persist").unwrap())
    );

    let mut bob = server.client("persist", "bob").await;
    let ack = bob.handshake(0).await;
    assert_eq!(ack["hydrationType"], "wipe_all");
    assert_eq!(ack["serverClock"], 1);
    assert_eq!(ack["diff"]["shape:a"][1]["x"], 42);

    let mut carol = server.client("persist", "carol").await;
    let ack = carol.handshake(1).await;
    assert_eq!(ack["hydrationType"], "wipe_presence");
    assert_eq!(ack["diff"], json!({}));

    bob.close().await;
    carol.close().await;
}

#[tokio::test]
async fn test_incompatible_client_is_rejected() {
    let server = TestServer::start().await;

    let mut client = server.client("strict", "old").await;
    client.send(connect_message(PROTOCOL_VERSION - 1, 0)).await;

    let msg = client.recv().await.expect("expected incompatibility_error");
    assert_eq!(
        msg,
        json!({"type": "incompatibility_error", "reason": "clientTooOld"})
    );
    assert!(client.recv().await.is_none());

    server.wait_until_unloaded("strict").await;
}

#[tokio::test]
async fn test_ping_is_answered() {
    let server = TestServer::start().await;

    let mut client = server.client("pings", "alice").await;
    client.handshake(0).await;
    client.send(json!({"type": "ping"})).await;
    assert_eq!(client.recv_type("pong").await, json!({"type": "pong"}));
    client.close().await;
}

#[tokio::test]
async fn test_delete_live_room() {
    let server = TestServer::start().await;

    let mut client = server.client("doomed", "alice").await;
    client.handshake(0).await;

    let (status, body) = server.admin("DELETE", "/room/doomed").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"ok": true}));
    assert!(client.recv().await.is_none());

    let (_, body) = server.admin("GET", "/status/doomed").await;
    assert_eq!(body["activeSessions"], 0);
    assert!(
        !server
            .registry()
            .store()
            .exists(&RoomId::parse("doomed").unwrap())
    );

    let (_, body) = server.admin("DELETE", "/room/doomed").await;
    assert_eq!(body, json!({"ok": false}));
}

#[tokio::test]
async fn test_health() {
    let server = TestServer::start().await;
    let (status, body) = server.admin("GET", "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"ok": true}));
}
