//! Room registry: one live engine per room id, created on first use and torn
//! down when the last session leaves.
//!
//! Every room id maps to a slot guarded by its own async mutex. Loading,
//! teardown, deletion and handshake leases for a room all happen while that
//! slot is held, so there is never more than one engine per id and a room is
//! never closed under a socket that is still joining. Different rooms never
//! contend.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use gachaboard_sync::RoomId;
use gachaboard_sync::engine::{EngineError, EngineFactory, ReplicationEngine, SessionEvent};
use gachaboard_sync::storage::{RoomStorage, RoomStore, StorageError};
use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::accountant::SessionAccountant;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("failed to load room {room}: {source}")]
    Load {
        room: RoomId,
        #[source]
        source: EngineError,
    },
    #[error("failed to close engine for room {room}: {source}")]
    EngineClose {
        room: RoomId,
        #[source]
        source: EngineError,
    },
    #[error("failed to close storage for room {room}: {source}")]
    StorageClose {
        room: RoomId,
        #[source]
        source: StorageError,
    },
    #[error("failed to delete storage for room {room}: {source}")]
    Delete {
        room: RoomId,
        #[source]
        source: StorageError,
    },
    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

// ==================== Room ====================

/// A loaded room: its engine, its open storage and its session count.
pub struct Room {
    id: RoomId,
    engine: Arc<dyn ReplicationEngine>,
    storage: Arc<RoomStorage>,
    accountant: SessionAccountant,
    created_at: DateTime<Utc>,
    last_activity: Mutex<DateTime<Utc>>,
}

impl Room {
    fn new(id: RoomId, engine: Arc<dyn ReplicationEngine>, storage: Arc<RoomStorage>) -> Self {
        let now = Utc::now();
        Self {
            id,
            engine,
            storage,
            accountant: SessionAccountant::new(),
            created_at: now,
            last_activity: Mutex::new(now),
        }
    }

    pub fn id(&self) -> &RoomId {
        &self.id
    }

    pub fn engine(&self) -> &Arc<dyn ReplicationEngine> {
        &self.engine
    }

    pub fn storage(&self) -> &Arc<RoomStorage> {
        &self.storage
    }

    pub fn accountant(&self) -> &SessionAccountant {
        &self.accountant
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Mark the room as active now.
    pub fn touch(&self) {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Utc::now();
    }
}

impl std::fmt::Debug for Room {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Room")
            .field("id", &self.id)
            .field("sessions", &self.accountant.active_sessions())
            .field("closed", &self.engine.is_closed())
            .field("created_at", &self.created_at)
            .finish()
    }
}

/// Per-room status row.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomStats {
    pub room_id: String,
    pub active_sessions: usize,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

/// Registry-wide status.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStats {
    pub active_rooms: usize,
    pub active_sessions: usize,
    pub rooms: Vec<RoomStats>,
}

// ==================== RoomLease ====================

/// A room handed to a joining socket.
///
/// While a lease is held the room counts as busy and cannot be torn down.
/// Call [`RoomLease::release`] once the handshake has finished, after the
/// session (if any) has been counted.
pub struct RoomLease {
    room: Arc<Room>,
    registry: Arc<RoomRegistry>,
    released: bool,
}

impl RoomLease {
    pub fn room(&self) -> &Arc<Room> {
        &self.room
    }

    pub async fn release(mut self) {
        self.released = true;
        self.room.accountant.end_handshake();
        self.registry.reap_if_idle(&self.room).await;
    }
}

impl Drop for RoomLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.room.accountant.end_handshake();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let registry = self.registry.clone();
            let room = self.room.clone();
            handle.spawn(async move { registry.reap_if_idle(&room).await });
        }
    }
}

// ==================== RoomRegistry ====================

type RoomSlot = Arc<tokio::sync::Mutex<Option<Arc<Room>>>>;

/// Map of loaded rooms.
pub struct RoomRegistry {
    store: RoomStore,
    factory: Arc<dyn EngineFactory>,
    rooms: DashMap<RoomId, RoomSlot>,
}

impl RoomRegistry {
    pub fn new(store: RoomStore, factory: Arc<dyn EngineFactory>) -> Arc<Self> {
        Arc::new(Self {
            store,
            factory,
            rooms: DashMap::new(),
        })
    }

    pub fn store(&self) -> &RoomStore {
        &self.store
    }

    fn slot(&self, room_id: &RoomId) -> RoomSlot {
        self.rooms.entry(room_id.clone()).or_default().value().clone()
    }

    /// Whether `slot` is still the one registered for `room_id`.
    fn is_current(&self, room_id: &RoomId, slot: &RoomSlot) -> bool {
        self.rooms
            .get(room_id)
            .is_some_and(|entry| Arc::ptr_eq(entry.value(), slot))
    }

    fn forget(&self, room_id: &RoomId, slot: &RoomSlot) {
        self.rooms
            .remove_if(room_id, |_, current| Arc::ptr_eq(current, slot));
    }

    /// Return the live room for `room_id`, loading it from storage if needed,
    /// with a handshake lease already taken on it.
    ///
    /// Concurrent callers for the same id share one load and one engine.
    pub async fn get_or_create_room(
        self: &Arc<Self>,
        room_id: &RoomId,
    ) -> Result<RoomLease, RegistryError> {
        loop {
            let slot = self.slot(room_id);
            let mut guard = slot.lock().await;
            if !self.is_current(room_id, &slot) {
                // Torn down while we waited for the slot.
                continue;
            }

            if let Some(room) = guard.as_ref().filter(|room| !room.engine.is_closed()) {
                room.accountant.begin_handshake();
                return Ok(self.lease(room.clone()));
            }

            let room = match self.load(room_id).await {
                Ok(room) => room,
                Err(e) => {
                    if guard.is_none() {
                        self.forget(room_id, &slot);
                    }
                    return Err(e);
                }
            };
            room.accountant.begin_handshake();
            *guard = Some(room.clone());
            return Ok(self.lease(room));
        }
    }

    fn lease(self: &Arc<Self>, room: Arc<Room>) -> RoomLease {
        RoomLease {
            room,
            registry: self.clone(),
            released: false,
        }
    }

    async fn load(self: &Arc<Self>, room_id: &RoomId) -> Result<Arc<Room>, RegistryError> {
        info!("room={} loading from disk", room_id);

        let store = self.store.clone();
        let factory = self.factory.clone();
        let id = room_id.clone();
        let (storage, engine) = tokio::task::spawn_blocking(move || -> Result<_, EngineError> {
            let storage = Arc::new(store.open(&id)?);
            match factory.open(&id, storage.clone()) {
                Ok(engine) => Ok((storage, engine)),
                Err(e) => {
                    if let Err(close_err) = storage.close() {
                        warn!("room={} failed to close storage after load error: {}", id, close_err);
                    }
                    Err(e)
                }
            }
        })
        .await?
        .map_err(|source| RegistryError::Load {
            room: room_id.clone(),
            source,
        })?;

        let events = engine.subscribe();
        let room = Arc::new(Room::new(room_id.clone(), engine, storage));
        tokio::spawn(watch_sessions(Arc::downgrade(self), room.clone(), events));

        info!("room={} created session_count=0", room_id);
        Ok(room)
    }

    /// Tear `room` down if it is still registered and nobody is in it or
    /// joining it. Returns whether it was torn down.
    pub async fn teardown_if_idle(&self, room: &Arc<Room>) -> Result<bool, RegistryError> {
        let Some(slot) = self.rooms.get(&room.id).map(|entry| entry.value().clone()) else {
            return Ok(false);
        };
        let mut guard = slot.lock().await;
        match guard.as_ref() {
            Some(current) if Arc::ptr_eq(current, room) => {}
            _ => return Ok(false),
        }

        if !room.accountant.is_idle() || room.engine.session_count() > 0 {
            debug!(
                "room={} still in use sessions={} handshakes={}",
                room.id,
                room.accountant.active_sessions(),
                room.accountant.pending_handshakes()
            );
            return Ok(false);
        }

        info!("room={} closing (no sessions left)", room.id);
        self.close_room(room).await?;
        *guard = None;
        self.forget(&room.id, &slot);
        info!("room={} evicted from registry", room.id);
        Ok(true)
    }

    async fn reap_if_idle(&self, room: &Arc<Room>) {
        if !room.accountant.is_idle() {
            return;
        }
        if let Err(e) = self.teardown_if_idle(room).await {
            error!("room={} teardown failed: {}", room.id, e);
        }
    }

    /// Close the engine, then the storage. Either failure leaves the engine
    /// closed, so the next join loads a fresh one.
    async fn close_room(&self, room: &Arc<Room>) -> Result<(), RegistryError> {
        room.engine
            .close()
            .await
            .map_err(|source| RegistryError::EngineClose {
                room: room.id.clone(),
                source,
            })?;

        let store = self.store.clone();
        let storage = room.storage.clone();
        tokio::task::spawn_blocking(move || store.close(&storage))
            .await?
            .map_err(|source| RegistryError::StorageClose {
                room: room.id.clone(),
                source,
            })?;

        debug!("room={} db closed", room.id);
        Ok(())
    }

    /// Unload `room_id` if it is live, disconnecting its sessions, then delete
    /// its stored state. Returns whether anything was deleted from storage.
    pub async fn delete_room(&self, room_id: &RoomId) -> Result<bool, RegistryError> {
        loop {
            let slot = self.slot(room_id);
            let mut guard = slot.lock().await;
            if !self.is_current(room_id, &slot) {
                continue;
            }

            if let Some(room) = guard.as_ref().cloned() {
                info!(
                    "room={} force-unloading for delete sessions={}",
                    room_id,
                    room.accountant.active_sessions()
                );
                self.close_room(&room).await?;
                *guard = None;
            }

            let store = self.store.clone();
            let id = room_id.clone();
            let deleted = tokio::task::spawn_blocking(move || store.delete(&id)).await;
            self.forget(room_id, &slot);

            return deleted?.map_err(|source| RegistryError::Delete {
                room: room_id.clone(),
                source,
            });
        }
    }

    /// Active sessions in `room_id`; zero when it is not loaded.
    pub async fn session_count(&self, room_id: &RoomId) -> usize {
        let Some(slot) = self.rooms.get(room_id).map(|entry| entry.value().clone()) else {
            return 0;
        };
        let guard = slot.lock().await;
        guard
            .as_ref()
            .map_or(0, |room| room.accountant.active_sessions())
    }

    /// Whether `room_id` currently has a live engine.
    pub async fn is_loaded(&self, room_id: &RoomId) -> bool {
        let Some(slot) = self.rooms.get(room_id).map(|entry| entry.value().clone()) else {
            return false;
        };
        let guard = slot.lock().await;
        guard.as_ref().is_some_and(|room| !room.engine.is_closed())
    }

    async fn loaded_rooms(&self) -> Vec<Arc<Room>> {
        let slots: Vec<RoomSlot> = self
            .rooms
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        let mut rooms = Vec::with_capacity(slots.len());
        for slot in slots {
            if let Some(room) = slot.lock().await.as_ref().cloned() {
                rooms.push(room);
            }
        }
        rooms
    }

    pub async fn stats(&self) -> RegistryStats {
        let mut rooms: Vec<RoomStats> = self
            .loaded_rooms()
            .await
            .into_iter()
            .filter(|room| !room.engine.is_closed())
            .map(|room| RoomStats {
                room_id: room.id.to_string(),
                active_sessions: room.accountant.active_sessions(),
                created_at: room.created_at,
                last_activity: room.last_activity(),
            })
            .collect();
        rooms.sort_by(|a, b| a.room_id.cmp(&b.room_id));

        RegistryStats {
            active_rooms: rooms.len(),
            active_sessions: rooms.iter().map(|r| r.active_sessions).sum(),
            rooms,
        }
    }

    /// Close every loaded room. Used on server shutdown.
    pub async fn shutdown(&self) {
        let ids: Vec<RoomId> = self.rooms.iter().map(|entry| entry.key().clone()).collect();
        for room_id in ids {
            let Some(slot) = self.rooms.get(&room_id).map(|entry| entry.value().clone()) else {
                continue;
            };
            let mut guard = slot.lock().await;
            if let Some(room) = guard.take() {
                if let Err(e) = self.close_room(&room).await {
                    error!("room={} close on shutdown failed: {}", room_id, e);
                }
            }
            self.forget(&room_id, &slot);
        }
        info!("All rooms closed");
    }
}

/// Feed a room's session removals into its accountant and tear the room down
/// when the count reaches zero. Ends when the engine closes.
async fn watch_sessions(
    registry: Weak<RoomRegistry>,
    room: Arc<Room>,
    mut events: mpsc::UnboundedReceiver<SessionEvent>,
) {
    while let Some(event) = events.recv().await {
        let SessionEvent::Removed {
            session_id,
            remaining,
        } = event;
        room.touch();

        let count = room.accountant.on_session_left(&room.id, &session_id);
        if count != remaining {
            debug!(
                "room={} accountant={} engine={} after removing {}",
                room.id, count, remaining, session_id
            );
        }
        if count > 0 {
            continue;
        }

        let Some(registry) = registry.upgrade() else {
            break;
        };
        registry.reap_if_idle(&room).await;
    }
    debug!("room={} session watcher stopped", room.id);
}

// ==================== Tests ====================
