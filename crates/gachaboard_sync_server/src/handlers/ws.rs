use super::AppState;
use crate::sync::RoomRegistry;
use async_trait::async_trait;
use axum::{
    extract::{
        Path, Query, State,
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade, close_code},
    },
    response::IntoResponse,
};
use gachaboard_sync::RoomId;
use gachaboard_sync::transport::{Transport, TransportError};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Query parameters for the sync socket
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncQuery {
    /// Client-chosen session id; a random one is assigned when absent
    pub session_id: Option<String>,
}

/// WebSocket upgrade handler for `/sync/{room_id}`
pub async fn sync_handler(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
    Query(query): Query<SyncQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let session_id = query
        .session_id
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    ws.on_upgrade(move |socket| async move {
        serve_session(
            state.registry,
            &room_id,
            session_id,
            Box::new(WsTransport::new(socket)),
        )
        .await
    })
}

/// Run one socket from upgrade to disconnect.
///
/// The room is held by a handshake lease until the engine has either
/// accepted the session (and it has been counted) or rejected it, so a
/// concurrent last-leave cannot close the room under a joining socket.
pub async fn serve_session(
    registry: Arc<RoomRegistry>,
    raw_room_id: &str,
    session_id: String,
    mut transport: Box<dyn Transport>,
) {
    info!(
        "[sync] ws_connect roomId={} sessionId={}",
        raw_room_id, session_id
    );

    let room_id = match RoomId::parse(raw_room_id) {
        Ok(id) => id,
        Err(e) => {
            warn!(
                "[sync] ws_rejected roomId={:?} sessionId={}: {}",
                raw_room_id, session_id, e
            );
            transport.close(&e.to_string()).await;
            return;
        }
    };

    let lease = match registry.get_or_create_room(&room_id).await {
        Ok(lease) => lease,
        Err(e) => {
            error!(
                "[sync] ws_connect_failed roomId={} sessionId={}: {}",
                room_id, session_id, e
            );
            transport.close("room unavailable").await;
            return;
        }
    };

    let room = lease.room().clone();
    let session = match room.engine().handle_connect(&session_id, transport).await {
        Ok(session) => {
            room.accountant().on_session_joined(&room_id, &session_id);
            room.touch();
            Some(session)
        }
        Err(e) => {
            warn!(
                "[sync] handshake_failed roomId={} sessionId={}: {}",
                room_id, session_id, e
            );
            None
        }
    };
    lease.release().await;

    let Some(session) = session else {
        return;
    };
    debug!(
        "[sync] session_connected roomId={} sessionId={} hydration={:?}",
        room_id, session_id, session.hydration
    );
    session.run().await;
    info!(
        "[sync] ws_disconnect roomId={} sessionId={}",
        room_id, session_id
    );
}

// ==================== WsTransport ====================

/// Adapts an axum WebSocket to the engine's [`Transport`].
pub struct WsTransport {
    socket: WebSocket,
}

impl WsTransport {
    pub fn new(socket: WebSocket) -> Self {
        Self { socket }
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn recv(&mut self) -> Option<Result<String, TransportError>> {
        loop {
            match self.socket.recv().await? {
                Ok(Message::Text(text)) => return Some(Ok(text.as_str().to_owned())),
                Ok(Message::Binary(data)) => match String::from_utf8(data.to_vec()) {
                    Ok(text) => return Some(Ok(text)),
                    Err(_) => {
                        debug!("Ignoring non-UTF-8 binary frame");
                        continue;
                    }
                },
                // Pings are answered by the socket itself.
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
                Ok(Message::Close(_)) => return None,
                Err(e) => return Some(Err(TransportError::Other(e.to_string()))),
            }
        }
    }

    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        self.socket
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| TransportError::Other(e.to_string()))
    }

    async fn close(&mut self, reason: &str) {
        let frame = CloseFrame {
            code: close_code::NORMAL,
            reason: reason.to_string().into(),
        };
        if let Err(e) = self.socket.send(Message::Close(Some(frame))).await {
            debug!("Close frame not delivered: {}", e);
        }
    }
}

// ==================== Tests ====================

#[cfg(test)]
mod tests {
    use super::*;
    use gachaboard_sync::engine::RecordEngineFactory;
    use gachaboard_sync::protocol::{
        ClientMessage, IncompatibilityReason, PROTOCOL_VERSION, PushAction, ServerMessage,
    };
    use gachaboard_sync::schema::SchemaDescriptor;
    use gachaboard_sync::storage::RoomStore;
    use gachaboard_sync::transport::{MemoryPeer, PeerFrame, memory_pair};
    use serde_json::json;
    use std::time::Duration;
    use tokio::task::JoinHandle;

    fn registry() -> (tempfile::TempDir, Arc<RoomRegistry>) {
        let dir = tempfile::tempdir().unwrap();
        let registry = RoomRegistry::new(
            RoomStore::new(dir.path().join("rooms")),
            Arc::new(RecordEngineFactory::default()),
        );
        (dir, registry)
    }

    fn connect_message(schema: serde_json::Value) -> ClientMessage {
        ClientMessage::Connect {
            connect_request_id: "c1".to_string(),
            last_server_clock: 0,
            protocol_version: PROTOCOL_VERSION,
            schema,
        }
    }

    fn board_schema() -> serde_json::Value {
        serde_json::to_value(SchemaDescriptor::board()).unwrap()
    }

    fn open_socket(
        registry: &Arc<RoomRegistry>,
        room: &str,
        session: &str,
    ) -> (MemoryPeer, JoinHandle<()>) {
        let (transport, peer) = memory_pair();
        let registry = registry.clone();
        let room = room.to_string();
        let session = session.to_string();
        let handle = tokio::spawn(async move {
            serve_session(registry, &room, session, Box::new(transport)).await
        });
        (peer, handle)
    }

    async fn connected(
        registry: &Arc<RoomRegistry>,
        room: &str,
        session: &str,
    ) -> (MemoryPeer, JoinHandle<()>) {
        let (mut peer, handle) = open_socket(registry, room, session);
        peer.send(&connect_message(board_schema()));
        assert!(matches!(
            peer.recv().await,
            Some(ServerMessage::ConnectAck { .. })
        ));
        (peer, handle)
    }

    async fn wait_for_rooms(registry: &RoomRegistry, expected: usize) {
        for _ in 0..200 {
            if registry.stats().await.active_rooms == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {} active rooms", expected);
    }

    async fn wait_for_sessions(registry: &RoomRegistry, room: &RoomId, expected: usize) {
        for _ in 0..200 {
            if registry.session_count(room).await == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "expected {} sessions, registry reports {}",
            expected,
            registry.session_count(room).await
        );
    }

    #[tokio::test]
    async fn test_push_reaches_other_session() {
        let (_dir, registry) = registry();
        let (mut alice, _a) = connected(&registry, "board-1", "alice").await;
        let (mut bob, _b) = connected(&registry, "board-1", "bob").await;
        assert_eq!(
            registry
                .session_count(&RoomId::parse("board-1").unwrap())
                .await,
            2
        );

        alice.send(&ClientMessage::Push {
            client_clock: 1,
            diff: json!({"shape:a": [0, {"x": 1}]}),
        });

        match alice.recv().await {
            Some(ServerMessage::PushResult { action, .. }) => {
                assert_eq!(action, PushAction::Commit)
            }
            other => panic!("Expected push_result, got {:?}", other),
        }
        loop {
            match bob.recv().await {
                Some(ServerMessage::Data { diff, .. }) => {
                    assert_eq!(diff["shape:a"], json!([0, {"x": 1}]));
                    break;
                }
                Some(_) => continue,
                None => panic!("bob was disconnected"),
            }
        }
    }

    #[tokio::test]
    async fn test_room_unloads_after_everyone_leaves() {
        let (_dir, registry) = registry();
        let (mut alice, a) = connected(&registry, "r1", "alice").await;
        let (mut bob, b) = connected(&registry, "r1", "bob").await;
        wait_for_rooms(&registry, 1).await;

        alice.disconnect();
        bob.disconnect();
        a.await.unwrap();
        b.await.unwrap();

        wait_for_rooms(&registry, 0).await;
        assert!(registry.store().exists(&RoomId::parse("r1").unwrap()));
    }

    #[tokio::test]
    async fn test_unsafe_room_id_is_sanitized() {
        let (_dir, registry) = registry();
        let (_peer, _h) = connected(&registry, "../evil", "alice").await;

        let stats = registry.stats().await;
        assert_eq!(stats.rooms[0].room_id, "___evil");
    }

    #[tokio::test]
    async fn test_empty_room_id_closes_socket() {
        let (_dir, registry) = registry();
        let (mut peer, handle) = open_socket(&registry, "", "alice");

        assert!(matches!(peer.recv_frame().await, Some(PeerFrame::Close(_))));
        handle.await.unwrap();
        assert_eq!(registry.stats().await.active_rooms, 0);
    }

    #[tokio::test]
    async fn test_incompatible_client_does_not_keep_room() {
        let (_dir, registry) = registry();
        let (mut peer, handle) = open_socket(&registry, "r1", "old");
        peer.send(&connect_message(json!({"schemaVersion": 1, "sequences": {}})));

        match peer.recv_frame().await {
            Some(PeerFrame::Text(text)) => {
                let msg: ServerMessage = serde_json::from_str(&text).unwrap();
                assert!(matches!(
                    msg,
                    ServerMessage::IncompatibilityError {
                        reason: IncompatibilityReason::ClientTooOld
                    }
                ));
            }
            other => panic!("Expected incompatibility_error, got {:?}", other),
        }
        assert!(matches!(peer.recv_frame().await, Some(PeerFrame::Close(_))));

        handle.await.unwrap();
        assert_eq!(registry.stats().await.active_rooms, 0);
    }

    #[tokio::test]
    async fn test_disconnect_during_handshake_releases_room() {
        let (_dir, registry) = registry();
        let (mut peer, handle) = open_socket(&registry, "r1", "shy");
        tokio::time::sleep(Duration::from_millis(20)).await;
        peer.disconnect();

        handle.await.unwrap();
        wait_for_rooms(&registry, 0).await;
    }

    #[tokio::test]
    async fn test_concurrent_first_connects() {
        let (_dir, registry) = registry();

        let mut peers = Vec::new();
        for i in 0..10 {
            let (mut peer, handle) = open_socket(&registry, "rush", &format!("s{}", i));
            peer.send(&connect_message(board_schema()));
            peers.push((peer, handle));
        }
        for (peer, _) in peers.iter_mut() {
            assert!(matches!(
                peer.recv().await,
                Some(ServerMessage::ConnectAck { .. })
            ));
        }

        let stats = registry.stats().await;
        assert_eq!(stats.active_rooms, 1);
        assert_eq!(stats.active_sessions, 10);
    }

    #[tokio::test]
    async fn test_session_count_tracks_open_sockets() {
        let (_dir, registry) = registry();
        let room = RoomId::parse("churn").unwrap();
        let mut open: Vec<(String, MemoryPeer, JoinHandle<()>)> = Vec::new();
        let mut seed: u64 = 0x5eed;

        for step in 0..60 {
            seed = seed
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            let roll = (seed >> 33) % 6;

            if open.is_empty() || roll < 3 {
                let id = format!("s{}", step);
                let (peer, handle) = connected(&registry, "churn", &id).await;
                open.push((id, peer, handle));
            } else if roll < 5 {
                let idx = (seed >> 40) as usize % open.len();
                let (_, mut peer, handle) = open.swap_remove(idx);
                peer.disconnect();
                handle.await.unwrap();
            } else {
                // Same session id on a new socket; the old one is closed.
                let idx = (seed >> 40) as usize % open.len();
                let (id, mut old_peer, old_handle) = open.swap_remove(idx);
                let (peer, handle) = connected(&registry, "churn", &id).await;
                assert!(old_peer.recv().await.is_none());
                old_handle.await.unwrap();
                open.push((id, peer, handle));
            }

            wait_for_sessions(&registry, &room, open.len()).await;
        }

        for (_, mut peer, handle) in open.drain(..) {
            peer.disconnect();
            handle.await.unwrap();
        }
        wait_for_sessions(&registry, &room, 0).await;
        wait_for_rooms(&registry, 0).await;
    }
}
