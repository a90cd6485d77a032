//! Per-room durable storage.
//!
//! Each room gets its own SQLite database file at `{rooms_dir}/{room_id}.db`.
//! [`RoomStore`] is the persistence adapter the registry talks to;
//! [`RoomStorage`] is the open handle one room's engine reads and writes.

use rusqlite::{Connection, OptionalExtension, params};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

use crate::room_id::RoomId;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Stored record is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Storage handle is closed")]
    Closed,
    #[error("Failed to close storage: {0}")]
    CloseFailed(rusqlite::Error),
}

/// Everything persisted for one room.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    pub clock: u64,
    pub records: BTreeMap<String, Value>,
}

/// A single record write, applied inside one commit.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordChange {
    Put { id: String, state: Value },
    Remove { id: String },
}

// ==================== RoomStorage ====================

/// An open SQLite handle for one room.
///
/// Closing is idempotent; every other call on a closed handle returns
/// [`StorageError::Closed`].
pub struct RoomStorage {
    path: PathBuf,
    conn: Mutex<Option<Connection>>,
}

impl RoomStorage {
    /// Open (creating if absent) the database at `path`.
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS records (
                id TEXT PRIMARY KEY,
                state TEXT NOT NULL,
                last_changed_clock INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS meta (
                key TEXT PRIMARY KEY,
                value INTEGER NOT NULL
            );",
        )?;

        Ok(Self {
            path: path.to_path_buf(),
            conn: Mutex::new(Some(conn)),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.lock().is_none()
    }

    fn lock(&self) -> MutexGuard<'_, Option<Connection>> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Load the current clock and all live records.
    pub fn load_snapshot(&self) -> Result<Snapshot, StorageError> {
        let guard = self.lock();
        let conn = guard.as_ref().ok_or(StorageError::Closed)?;

        let clock: Option<i64> = conn
            .query_row("SELECT value FROM meta WHERE key = 'clock'", [], |row| {
                row.get(0)
            })
            .optional()?;

        let mut stmt = conn.prepare("SELECT id, state FROM records")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut records = BTreeMap::new();
        for row in rows {
            let (id, state) = row?;
            records.insert(id, serde_json::from_str(&state)?);
        }

        Ok(Snapshot {
            clock: clock.unwrap_or(0).max(0) as u64,
            records,
        })
    }

    /// Apply `changes` and advance the stored clock in one transaction.
    pub fn commit(&self, clock: u64, changes: &[RecordChange]) -> Result<(), StorageError> {
        let mut guard = self.lock();
        let conn = guard.as_mut().ok_or(StorageError::Closed)?;

        let tx = conn.transaction()?;
        for change in changes {
            match change {
                RecordChange::Put { id, state } => {
                    tx.execute(
                        "INSERT INTO records (id, state, last_changed_clock) VALUES (?1, ?2, ?3)
                         ON CONFLICT(id) DO UPDATE SET
                            state = excluded.state,
                            last_changed_clock = excluded.last_changed_clock",
                        params![id, serde_json::to_string(state)?, clock as i64],
                    )?;
                }
                RecordChange::Remove { id } => {
                    tx.execute("DELETE FROM records WHERE id = ?1", params![id])?;
                }
            }
        }
        tx.execute(
            "INSERT INTO meta (key, value) VALUES ('clock', ?1)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![clock as i64],
        )?;
        tx.commit()?;

        debug!(
            "Committed {} changes at clock {} to {:?}",
            changes.len(),
            clock,
            self.path
        );
        Ok(())
    }

    /// Close the underlying connection. A second call is a no-op.
    pub fn close(&self) -> Result<(), StorageError> {
        let Some(conn) = self.lock().take() else {
            return Ok(());
        };
        conn.close().map_err(|(_, e)| StorageError::CloseFailed(e))
    }
}

impl std::fmt::Debug for RoomStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomStorage")
            .field("path", &self.path)
            .field("closed", &self.is_closed())
            .finish()
    }
}

// ==================== RoomStore ====================

/// Opens, checks and deletes room databases under one directory.
#[derive(Debug, Clone)]
pub struct RoomStore {
    rooms_dir: PathBuf,
}

impl RoomStore {
    /// Create a new RoomStore rooted at the given directory.
    pub fn new(rooms_dir: PathBuf) -> Self {
        Self { rooms_dir }
    }

    /// Get the path where the database for a room lives.
    pub fn path_for(&self, room_id: &RoomId) -> PathBuf {
        self.rooms_dir.join(room_id.db_file_name())
    }

    pub fn exists(&self, room_id: &RoomId) -> bool {
        self.path_for(room_id).is_file()
    }

    /// Open a room's storage, creating an empty database if none exists.
    pub fn open(&self, room_id: &RoomId) -> Result<RoomStorage, StorageError> {
        std::fs::create_dir_all(&self.rooms_dir)?;
        let path = self.path_for(room_id);
        let storage = RoomStorage::open(&path)?;
        debug!("Opened storage for room {} at {:?}", room_id, path);
        Ok(storage)
    }

    pub fn close(&self, storage: &RoomStorage) -> Result<(), StorageError> {
        storage.close()
    }

    /// Unlink a room's database. Returns `false` when there was nothing to delete.
    ///
    /// The caller must make sure no handle to the room is still open.
    pub fn delete(&self, room_id: &RoomId) -> Result<bool, StorageError> {
        let path = self.path_for(room_id);
        if !path.is_file() {
            return Ok(false);
        }

        std::fs::remove_file(&path)?;
        let journal = self.rooms_dir.join(format!("{}-journal", room_id.db_file_name()));
        if journal.is_file() {
            std::fs::remove_file(journal)?;
        }

        info!("room={} db deleted", room_id);
        Ok(true)
    }
}

// ==================== Tests ====================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> (tempfile::TempDir, RoomStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = RoomStore::new(dir.path().join("rooms"));
        (dir, store)
    }

    #[test]
    fn test_open_creates_empty_room() {
        let (_dir, store) = store();
        let id = RoomId::parse("r1").unwrap();
        assert!(!store.exists(&id));

        let storage = store.open(&id).unwrap();
        assert!(store.exists(&id));
        assert_eq!(storage.load_snapshot().unwrap(), Snapshot::default());
    }

    #[test]
    fn test_commit_survives_reopen() {
        let (_dir, store) = store();
        let id = RoomId::parse("r1").unwrap();

        let storage = store.open(&id).unwrap();
        storage
            .commit(
                1,
                &[
                    RecordChange::Put {
                        id: "shape:a".to_string(),
                        state: json!({"x": 1}),
                    },
                    RecordChange::Put {
                        id: "shape:b".to_string(),
                        state: json!({"x": 2}),
                    },
                ],
            )
            .unwrap();
        storage
            .commit(
                2,
                &[RecordChange::Remove {
                    id: "shape:b".to_string(),
                }],
            )
            .unwrap();
        storage.close().unwrap();

        let reopened = store.open(&id).unwrap();
        let snapshot = reopened.load_snapshot().unwrap();
        assert_eq!(snapshot.clock, 2);
        assert_eq!(snapshot.records.len(), 1);
        assert_eq!(snapshot.records["shape:a"], json!({"x": 1}));
    }

    #[test]
    fn test_close_is_idempotent_and_blocks_use() {
        let (_dir, store) = store();
        let storage = store.open(&RoomId::parse("r1").unwrap()).unwrap();

        storage.close().unwrap();
        storage.close().unwrap();
        assert!(storage.is_closed());
        assert!(matches!(storage.load_snapshot(), Err(StorageError::Closed)));
        assert!(matches!(storage.commit(1, &[]), Err(StorageError::Closed)));
    }

    #[test]
    fn test_delete_reports_whether_store_existed() {
        let (_dir, store) = store();
        let id = RoomId::parse("r1").unwrap();

        assert!(!store.delete(&id).unwrap());

        store.open(&id).unwrap().close().unwrap();
        assert!(store.delete(&id).unwrap());
        assert!(!store.exists(&id));
        assert!(!store.delete(&id).unwrap());
    }
}
