//! Replication engine seam and the bundled record engine.
//!
//! The registry only ever sees a room's engine through [`ReplicationEngine`]:
//! hand it a socket, watch its [`SessionEvent`]s, close it. Anything that
//! implements the trait can own a room's document.
//!
//! ## Session lifecycle
//!
//! ```text
//! handle_connect()            ConnectedSession::run()
//!   AwaitingConnect  ──ack──▶   Connected  ──socket gone / idle / engine closed──▶  Closed
//!         │                                                                         ▲
//!         └──────── incompatible / timeout / disconnect ────────────────────────────┘
//! ```
//!
//! Only sessions that reached `Connected` emit [`SessionEvent::Removed`], and
//! each emits it exactly once.
//!
//! Each session has a bounded outbound queue. A session that falls a full
//! queue behind is dropped from the room and its socket is closed.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::protocol::{
    ClientMessage, Diff, HydrationType, IncompatibilityReason, PROTOCOL_VERSION, PushAction,
    ServerMessage,
};
use crate::room_id::RoomId;
use crate::schema::SchemaDescriptor;
use crate::storage::{RecordChange, RoomStorage, StorageError};
use crate::transport::{Transport, TransportError};

// ==================== Errors ====================

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Why a socket never reached the `Connected` state.
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("socket closed before connect")]
    Disconnected,
    #[error("no connect message within {0:?}")]
    Timeout(Duration),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("incompatible client: {0}")]
    Incompatible(IncompatibilityReason),
    #[error("room is closed")]
    RoomClosed,
}

// ==================== Seam ====================

/// Notification emitted by an engine when a connected session goes away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Removed { session_id: String, remaining: usize },
}

/// Tunables shared by every engine a factory builds.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub schema: SchemaDescriptor,
    pub handshake_timeout: Duration,
    /// Close sessions that send nothing for this long. `None` disables it.
    pub idle_timeout: Option<Duration>,
    /// Frames queued per session before it is disconnected as too slow.
    pub outbound_queue: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            schema: SchemaDescriptor::board(),
            handshake_timeout: Duration::from_secs(10),
            idle_timeout: None,
            outbound_queue: 1024,
        }
    }
}

/// One room's authoritative document plus its live sessions.
#[async_trait]
pub trait ReplicationEngine: Send + Sync {
    /// Run the handshake on `transport`. On success the session is registered
    /// and the returned [`ConnectedSession`] must be driven to completion.
    async fn handle_connect(
        &self,
        session_id: &str,
        transport: Box<dyn Transport>,
    ) -> Result<ConnectedSession, HandshakeError>;

    /// Subscribe to session events. The channel closes when the engine does.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<SessionEvent>;

    fn session_count(&self) -> usize;

    fn is_closed(&self) -> bool;

    /// Disconnect every session and refuse new ones. Idempotent.
    async fn close(&self) -> Result<(), EngineError>;
}

/// Builds one engine per room over an open storage handle.
pub trait EngineFactory: Send + Sync {
    fn open(
        &self,
        room_id: &RoomId,
        storage: Arc<RoomStorage>,
    ) -> Result<Arc<dyn ReplicationEngine>, EngineError>;
}

/// A session that completed the handshake.
pub struct ConnectedSession {
    pub session_id: String,
    pub hydration: HydrationType,
    pub joined_at: DateTime<Utc>,
    driver: Pin<Box<dyn Future<Output = ()> + Send>>,
}

impl ConnectedSession {
    /// Drive the session until its socket closes. Emits the removal event
    /// before returning.
    pub async fn run(self) {
        self.driver.await
    }
}

impl std::fmt::Debug for ConnectedSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectedSession")
            .field("session_id", &self.session_id)
            .field("hydration", &self.hydration)
            .field("joined_at", &self.joined_at)
            .finish_non_exhaustive()
    }
}

// ==================== RecordEngine ====================

const OP_PUT: u64 = 0;
const OP_PATCH: u64 = 1;
const OP_REMOVE: u64 = 2;

/// How long a detached session may spend delivering its close frame.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Factory for [`RecordEngine`].
#[derive(Debug, Clone, Default)]
pub struct RecordEngineFactory {
    config: EngineConfig,
}

impl RecordEngineFactory {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }
}

impl EngineFactory for RecordEngineFactory {
    fn open(
        &self,
        room_id: &RoomId,
        storage: Arc<RoomStorage>,
    ) -> Result<Arc<dyn ReplicationEngine>, EngineError> {
        Ok(Arc::new(RecordEngine::open(
            room_id.clone(),
            storage,
            self.config.clone(),
        )?))
    }
}

/// Last-writer-wins record map.
///
/// Diffs are `{record_id: [op, payload]}` with op 0 = put, 1 = shallow patch,
/// 2 = remove. Pushes to one room are applied one at a time under the room
/// mutex, persisted, then fanned out, so every session observes the same order.
pub struct RecordEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    room_id: RoomId,
    config: EngineConfig,
    storage: Arc<RoomStorage>,
    state: tokio::sync::Mutex<RoomState>,
    closed: AtomicBool,
    session_count: AtomicUsize,
    next_token: AtomicU64,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<SessionEvent>>>,
}

struct RoomState {
    clock: u64,
    records: BTreeMap<String, Value>,
    sessions: HashMap<String, SessionSlot>,
}

struct SessionSlot {
    /// Distinguishes a session from a later one that reused its id.
    token: u64,
    outbound: mpsc::Sender<ServerMessage>,
    /// Dropped with the slot, which stops the session loop.
    _attached: oneshot::Sender<()>,
    last_client_clock: u64,
    presence: Value,
}

impl RecordEngine {
    /// Load the room's snapshot from `storage` and build the engine over it.
    pub fn open(
        room_id: RoomId,
        storage: Arc<RoomStorage>,
        config: EngineConfig,
    ) -> Result<Self, EngineError> {
        let snapshot = storage.load_snapshot()?;
        debug!(
            "room={} engine opened clock={} records={}",
            room_id,
            snapshot.clock,
            snapshot.records.len()
        );

        Ok(Self {
            inner: Arc::new(EngineInner {
                room_id,
                config,
                storage,
                state: tokio::sync::Mutex::new(RoomState {
                    clock: snapshot.clock,
                    records: snapshot.records,
                    sessions: HashMap::new(),
                }),
                closed: AtomicBool::new(false),
                session_count: AtomicUsize::new(0),
                next_token: AtomicU64::new(1),
                subscribers: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Current server clock.
    pub async fn clock(&self) -> u64 {
        self.inner.state.lock().await.clock
    }

    /// Copy of one record, if present.
    pub async fn record(&self, id: &str) -> Option<Value> {
        self.inner.state.lock().await.records.get(id).cloned()
    }
}

#[async_trait]
impl ReplicationEngine for RecordEngine {
    async fn handle_connect(
        &self,
        session_id: &str,
        mut transport: Box<dyn Transport>,
    ) -> Result<ConnectedSession, HandshakeError> {
        let inner = &self.inner;

        if inner.closed.load(Ordering::Acquire) {
            transport.close("room closed").await;
            return Err(HandshakeError::RoomClosed);
        }

        let (connect_request_id, last_server_clock) =
            match await_connect(inner, session_id, transport.as_mut()).await {
                Ok(connect) => connect,
                Err(err) => {
                    transport.close("handshake failed").await;
                    return Err(err);
                }
            };

        let token = inner.next_token.fetch_add(1, Ordering::Relaxed);
        let (attached, detached) = oneshot::channel();
        let hydration;
        let rx;
        {
            let mut state = inner.state.lock().await;
            if inner.closed.load(Ordering::Acquire) {
                drop(state);
                transport.close("room closed").await;
                return Err(HandshakeError::RoomClosed);
            }

            // Room for the ack plus one presence replay per session.
            let capacity = inner.config.outbound_queue.max(state.sessions.len() + 1);
            let (tx, outbound) = mpsc::channel(capacity);
            rx = outbound;

            let diff = if last_server_clock == state.clock {
                hydration = HydrationType::Incremental;
                Diff::new()
            } else {
                hydration = HydrationType::Full;
                state
                    .records
                    .iter()
                    .map(|(id, record)| {
                        let entry = Value::from(vec![Value::from(OP_PUT), record.clone()]);
                        (id.clone(), entry)
                    })
                    .collect()
            };

            let _ = tx.try_send(ServerMessage::ConnectAck {
                connect_request_id,
                hydration_type: hydration,
                protocol_version: PROTOCOL_VERSION,
                schema: inner.config.schema.clone(),
                server_clock: state.clock,
                diff,
            });

            for (other_id, slot) in &state.sessions {
                if other_id != session_id && !slot.presence.is_null() {
                    let _ = tx.try_send(ServerMessage::Presence {
                        session_id: other_id.clone(),
                        presence: slot.presence.clone(),
                    });
                }
            }

            let replaced = state.sessions.insert(
                session_id.to_string(),
                SessionSlot {
                    token,
                    outbound: tx,
                    _attached: attached,
                    last_client_clock: 0,
                    presence: Value::Null,
                },
            );
            if let Some(previous) = replaced {
                warn!(
                    "room={} session {} reconnected, replacing previous socket",
                    inner.room_id, session_id
                );
                if !previous.presence.is_null() {
                    inner.broadcast(
                        &mut state,
                        session_id,
                        &ServerMessage::Presence {
                            session_id: session_id.to_string(),
                            presence: Value::Null,
                        },
                    );
                }
            }
            inner
                .session_count
                .store(state.sessions.len(), Ordering::Release);
        }

        info!(
            "room={} handshake complete sessionId={} hydration={:?}",
            inner.room_id, session_id, hydration
        );

        let driver = run_session(
            inner.clone(),
            session_id.to_string(),
            token,
            transport,
            rx,
            detached,
        );
        Ok(ConnectedSession {
            session_id: session_id.to_string(),
            hydration,
            joined_at: Utc::now(),
            driver: Box::pin(driver),
        })
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<SessionEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        if !self.inner.closed.load(Ordering::Acquire) {
            self.inner
                .subscribers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(tx);
        }
        rx
    }

    fn session_count(&self) -> usize {
        self.inner.session_count.load(Ordering::Acquire)
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    async fn close(&self) -> Result<(), EngineError> {
        let inner = &self.inner;
        let mut state = inner.state.lock().await;
        if inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        // Dropping each slot ends that session's loop.
        let evicted = state.sessions.len();
        state.sessions.clear();
        inner.session_count.store(0, Ordering::Release);
        inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();

        info!(
            "room={} engine closed clock={} evicted_sessions={}",
            inner.room_id, state.clock, evicted
        );
        Ok(())
    }
}

/// Read frames until a `connect` arrives, then validate it.
async fn await_connect(
    inner: &EngineInner,
    session_id: &str,
    transport: &mut dyn Transport,
) -> Result<(String, u64), HandshakeError> {
    let timeout = inner.config.handshake_timeout;
    let deadline = Instant::now() + timeout;

    loop {
        let frame = match tokio::time::timeout_at(deadline, transport.recv()).await {
            Ok(frame) => frame,
            Err(_) => return Err(HandshakeError::Timeout(timeout)),
        };
        let text = match frame {
            None => return Err(HandshakeError::Disconnected),
            Some(Err(e)) => return Err(e.into()),
            Some(Ok(text)) => text,
        };

        match serde_json::from_str::<ClientMessage>(&text) {
            Ok(ClientMessage::Connect {
                connect_request_id,
                last_server_clock,
                protocol_version,
                schema,
            }) => {
                if let Err(reason) = inner.config.schema.check_client(protocol_version, &schema) {
                    warn!(
                        "room={} sessionId={} incompatible client: {}",
                        inner.room_id, session_id, reason
                    );
                    let msg = ServerMessage::IncompatibilityError { reason };
                    let _ = transport.send(msg.to_json()).await;
                    return Err(HandshakeError::Incompatible(reason));
                }
                return Ok((connect_request_id, last_server_clock));
            }
            Ok(ClientMessage::Ping) => {
                transport.send(ServerMessage::Pong.to_json()).await?;
            }
            Ok(other) => {
                debug!(
                    "room={} sessionId={} ignoring {:?} before connect",
                    inner.room_id, session_id, other
                );
            }
            Err(e) => {
                debug!(
                    "room={} sessionId={} ignoring unparseable frame before connect: {}",
                    inner.room_id, session_id, e
                );
            }
        }
    }
}

/// The `Connected` state: pump the outbound queue, feed inbound frames to the
/// engine, and unregister when the socket goes away.
async fn run_session(
    inner: Arc<EngineInner>,
    session_id: String,
    token: u64,
    mut transport: Box<dyn Transport>,
    mut outbound: mpsc::Receiver<ServerMessage>,
    mut detached: oneshot::Receiver<()>,
) {
    let idle_timeout = inner.config.idle_timeout;
    let mut last_inbound = Instant::now();

    loop {
        let idle_deadline = idle_timeout.map(|limit| last_inbound + limit);
        let idle = async move {
            match idle_deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            frame = transport.recv() => match frame {
                Some(Ok(text)) => {
                    last_inbound = Instant::now();
                    inner.handle_frame(&session_id, token, &text).await;
                }
                Some(Err(e)) => {
                    warn!("room={} sessionId={} socket error: {}", inner.room_id, session_id, e);
                    break;
                }
                None => {
                    debug!("room={} sessionId={} client closed", inner.room_id, session_id);
                    break;
                }
            },
            msg = outbound.recv() => match msg {
                Some(msg) => {
                    let sent = tokio::select! {
                        sent = transport.send(msg.to_json()) => sent,
                        _ = &mut detached => {
                            debug!(
                                "room={} sessionId={} dropped while a send was pending",
                                inner.room_id, session_id
                            );
                            break;
                        }
                    };
                    if let Err(e) = sent {
                        warn!("room={} sessionId={} send failed: {}", inner.room_id, session_id, e);
                        break;
                    }
                }
                None => {
                    transport.close("room closed").await;
                    break;
                }
            },
            // Engine closed, a newer socket took over this session id, or the
            // session fell too far behind.
            _ = &mut detached => {
                let closing = transport.close("session closed");
                if tokio::time::timeout(CLOSE_TIMEOUT, closing).await.is_err() {
                    debug!("room={} sessionId={} close frame timed out", inner.room_id, session_id);
                }
                break;
            }
            _ = idle => {
                info!("room={} sessionId={} idle timeout", inner.room_id, session_id);
                transport.close("idle timeout").await;
                break;
            }
        }
    }

    inner.remove_session(&session_id, token).await;
}

impl EngineInner {
    async fn handle_frame(&self, session_id: &str, token: u64, text: &str) {
        let msg = match serde_json::from_str::<ClientMessage>(text) {
            Ok(msg) => msg,
            Err(e) => {
                debug!(
                    "room={} sessionId={} ignoring unparseable frame: {}",
                    self.room_id, session_id, e
                );
                return;
            }
        };

        match msg {
            ClientMessage::Push { client_clock, diff } => {
                self.apply_push(session_id, token, client_clock, diff).await
            }
            ClientMessage::Presence { presence } => {
                self.set_presence(session_id, token, presence).await
            }
            ClientMessage::Ping => {
                let mut state = self.state.lock().await;
                if own_slot(&state, session_id, token).is_some() {
                    self.send_to(&mut state, session_id, ServerMessage::Pong);
                }
            }
            ClientMessage::Connect { .. } => {
                warn!(
                    "room={} sessionId={} ignoring repeated connect",
                    self.room_id, session_id
                );
            }
        }
    }

    async fn apply_push(&self, session_id: &str, token: u64, client_clock: u64, diff: Value) {
        let mut state = self.state.lock().await;
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let Some(last_client_clock) =
            own_slot(&state, session_id, token).map(|slot| slot.last_client_clock)
        else {
            return;
        };

        let discard = ServerMessage::PushResult {
            client_clock,
            server_clock: state.clock,
            action: PushAction::Discard,
        };

        if client_clock <= last_client_clock {
            debug!(
                "room={} sessionId={} stale clientClock {} <= {}",
                self.room_id, session_id, client_clock, last_client_clock
            );
            self.send_to(&mut state, session_id, discard);
            return;
        }

        let (diff, changes) = match parse_diff(&state.records, diff) {
            Ok(parsed) => parsed,
            Err(reason) => {
                warn!(
                    "room={} sessionId={} discarding push: {}",
                    self.room_id, session_id, reason
                );
                self.send_to(&mut state, session_id, discard);
                return;
            }
        };

        let changed = !changes.is_empty();
        if changed {
            let server_clock = state.clock + 1;
            if let Err(e) = self.storage.commit(server_clock, &changes) {
                error!(
                    "room={} failed to persist push from {}: {}",
                    self.room_id, session_id, e
                );
                self.send_to(&mut state, session_id, discard);
                return;
            }

            for change in changes {
                match change {
                    RecordChange::Put { id, state: record } => {
                        state.records.insert(id, record);
                    }
                    RecordChange::Remove { id } => {
                        state.records.remove(&id);
                    }
                }
            }
            state.clock = server_clock;
        }

        let server_clock = state.clock;
        if let Some(slot) = own_slot_mut(&mut state, session_id, token) {
            slot.last_client_clock = client_clock;
        }
        self.send_to(
            &mut state,
            session_id,
            ServerMessage::PushResult {
                client_clock,
                server_clock,
                action: PushAction::Commit,
            },
        );
        if changed {
            self.broadcast(
                &mut state,
                session_id,
                &ServerMessage::Data { server_clock, diff },
            );
        }
    }

    async fn set_presence(&self, session_id: &str, token: u64, presence: Value) {
        let mut state = self.state.lock().await;
        let Some(slot) = own_slot_mut(&mut state, session_id, token) else {
            return;
        };
        slot.presence = presence.clone();

        self.broadcast(
            &mut state,
            session_id,
            &ServerMessage::Presence {
                session_id: session_id.to_string(),
                presence,
            },
        );
    }

    async fn remove_session(&self, session_id: &str, token: u64) {
        let remaining = {
            let mut state = self.state.lock().await;
            if own_slot(&state, session_id, token).is_some() {
                state.sessions.remove(session_id);
                self.broadcast(
                    &mut state,
                    session_id,
                    &ServerMessage::Presence {
                        session_id: session_id.to_string(),
                        presence: Value::Null,
                    },
                );
            }
            let remaining = state.sessions.len();
            self.session_count.store(remaining, Ordering::Release);
            remaining
        };

        let event = SessionEvent::Removed {
            session_id: session_id.to_string(),
            remaining,
        };
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Queue `msg` for one session, dropping the session if its queue is full.
    fn send_to(&self, state: &mut RoomState, session_id: &str, msg: ServerMessage) {
        let lagging = state
            .sessions
            .get(session_id)
            .is_some_and(|slot| !enqueue(slot, msg));
        if lagging {
            self.evict(state, session_id);
        }
    }

    /// Queue `msg` for every session except `from`, dropping any that lag.
    fn broadcast(&self, state: &mut RoomState, from: &str, msg: &ServerMessage) {
        let lagging: Vec<String> = state
            .sessions
            .iter()
            .filter(|(id, slot)| id.as_str() != from && !enqueue(slot, msg.clone()))
            .map(|(id, _)| id.clone())
            .collect();
        for id in lagging {
            self.evict(state, &id);
        }
    }

    /// Drop a session whose queue is full. Its loop sees the slot go and
    /// closes the socket; the removal event follows from there.
    fn evict(&self, state: &mut RoomState, session_id: &str) {
        let Some(slot) = state.sessions.remove(session_id) else {
            return;
        };
        warn!(
            "room={} sessionId={} outbound queue full, disconnecting",
            self.room_id, session_id
        );
        self.session_count
            .store(state.sessions.len(), Ordering::Release);

        if !slot.presence.is_null() {
            self.broadcast(
                state,
                session_id,
                &ServerMessage::Presence {
                    session_id: session_id.to_string(),
                    presence: Value::Null,
                },
            );
        }
    }
}

/// `false` only when the session's queue is full. A closed queue means its
/// loop is already on the way out.
fn enqueue(slot: &SessionSlot, msg: ServerMessage) -> bool {
    !matches!(slot.outbound.try_send(msg), Err(TrySendError::Full(_)))
}

fn own_slot<'a>(state: &'a RoomState, session_id: &str, token: u64) -> Option<&'a SessionSlot> {
    state.sessions.get(session_id).filter(|s| s.token == token)
}

fn own_slot_mut<'a>(
    state: &'a mut RoomState,
    session_id: &str,
    token: u64,
) -> Option<&'a mut SessionSlot> {
    state
        .sessions
        .get_mut(session_id)
        .filter(|s| s.token == token)
}

/// Validate a push diff against the current records and turn it into storage
/// changes. Ops inside one diff apply in key order.
fn parse_diff(
    records: &BTreeMap<String, Value>,
    diff: Value,
) -> Result<(Diff, Vec<RecordChange>), String> {
    let Value::Object(diff) = diff else {
        return Err("diff is not an object".to_string());
    };

    let mut changes = Vec::with_capacity(diff.len());
    for (id, entry) in &diff {
        let (op, payload) = match entry.as_array().map(Vec::as_slice) {
            Some([op, payload]) => (op.as_u64(), payload),
            Some([op]) => (op.as_u64(), &Value::Null),
            _ => return Err(format!("entry for {} is not [op, payload]", id)),
        };

        match op {
            Some(OP_PUT) => {
                if !payload.is_object() {
                    return Err(format!("put for {} carries no record", id));
                }
                changes.push(RecordChange::Put {
                    id: id.clone(),
                    state: payload.clone(),
                });
            }
            Some(OP_PATCH) => {
                let Some(patch) = payload.as_object() else {
                    return Err(format!("patch for {} is not an object", id));
                };
                let Some(Value::Object(existing)) = records.get(id) else {
                    return Err(format!("patch for unknown record {}", id));
                };
                let mut merged: Map<String, Value> = existing.clone();
                for (key, value) in patch {
                    merged.insert(key.clone(), value.clone());
                }
                changes.push(RecordChange::Put {
                    id: id.clone(),
                    state: Value::Object(merged),
                });
            }
            Some(OP_REMOVE) => changes.push(RecordChange::Remove { id: id.clone() }),
            _ => return Err(format!("unknown op for {}", id)),
        }
    }

    Ok((diff, changes))
}

// ==================== Tests ====================
