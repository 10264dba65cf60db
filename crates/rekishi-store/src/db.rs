//! SQLite persistence for sync state.
//!
//! One accumulated sync snapshot, user presence, lazily loaded room members,
//! client options, and the outgoing to-device queue.

use std::path::Path;

use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use rekishi_types::{RoomId, UserId};

use crate::error::StoreResult;

/// Accumulated sync response, saved so startup can skip an initial sync.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SavedSync {
    pub next_batch: String,
    #[serde(default)]
    pub rooms: Value,
    #[serde(default)]
    pub account_data: Value,
}

/// Latest presence event for one user.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UserPresence {
    pub user_id: UserId,
    pub event: Value,
}

/// A batch of to-device messages sharing one transaction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToDeviceBatch {
    pub event_type: String,
    pub txn_id: String,
    pub batch: Vec<Value>,
}

/// A queued [`ToDeviceBatch`] with its queue id.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueuedToDeviceBatch {
    pub id: i64,
    #[serde(flatten)]
    pub batch: ToDeviceBatch,
}

const SCHEMA: &str = r#"
-- Single-row accumulated sync
CREATE TABLE IF NOT EXISTS sync (
    id INTEGER PRIMARY KEY CHECK (id = 0),
    next_batch TEXT NOT NULL,
    rooms TEXT NOT NULL,
    account_data TEXT NOT NULL
);

-- Presence, one row per user
CREATE TABLE IF NOT EXISTS users (
    user_id TEXT PRIMARY KEY,
    event TEXT NOT NULL
);

-- Rooms whose out-of-band members were written (possibly zero of them)
CREATE TABLE IF NOT EXISTS oob_rooms (
    room_id TEXT PRIMARY KEY
);
CREATE TABLE IF NOT EXISTS oob_members (
    room_id TEXT NOT NULL,
    seq INTEGER NOT NULL,
    event TEXT NOT NULL,
    PRIMARY KEY (room_id, seq)
);

-- Single-row client options
CREATE TABLE IF NOT EXISTS client_options (
    id INTEGER PRIMARY KEY CHECK (id = 0),
    options TEXT NOT NULL
);

-- Outgoing to-device queue (FIFO by id)
CREATE TABLE IF NOT EXISTS to_device_queue (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    event_type TEXT NOT NULL,
    txn_id TEXT NOT NULL,
    batch TEXT NOT NULL
);
"#;

/// Database handle for sync persistence.
pub struct StoreDb {
    conn: Connection,
    newly_created: bool,
}

impl StoreDb {
    /// Open or create a database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let conn = Connection::open(path.as_ref())?;
        let db = Self::init(conn)?;
        info!(path = %path.as_ref().display(), newly_created = db.newly_created, "opened store");
        Ok(db)
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> StoreResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> StoreResult<Self> {
        let existing: i64 = conn.query_row(
            "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name = 'sync'",
            [],
            |row| row.get(0),
        )?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn, newly_created: existing == 0 })
    }

    /// True when this open created the schema.
    pub fn is_newly_created(&self) -> bool {
        self.newly_created
    }

    /// Delete everything.
    pub fn clear(&mut self) -> StoreResult<()> {
        self.conn.execute_batch(
            "DELETE FROM sync;
             DELETE FROM users;
             DELETE FROM oob_rooms;
             DELETE FROM oob_members;
             DELETE FROM client_options;
             DELETE FROM to_device_queue;",
        )?;
        debug!("cleared store");
        Ok(())
    }

    // =========================================================================
    // Sync
    // =========================================================================

    pub fn saved_sync(&self) -> StoreResult<Option<SavedSync>> {
        let row = self
            .conn
            .query_row(
                "SELECT next_batch, rooms, account_data FROM sync WHERE id = 0",
                [],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?)),
            )
            .optional()?;
        match row {
            Some((next_batch, rooms, account_data)) => Ok(Some(SavedSync {
                next_batch,
                rooms: serde_json::from_str(&rooms)?,
                account_data: serde_json::from_str(&account_data)?,
            })),
            None => Ok(None),
        }
    }

    pub fn next_batch_token(&self) -> StoreResult<Option<String>> {
        let token = self
            .conn
            .query_row("SELECT next_batch FROM sync WHERE id = 0", [], |row| row.get(0))
            .optional()?;
        Ok(token)
    }

    pub fn set_sync_data(&self, sync: &SavedSync) -> StoreResult<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO sync (id, next_batch, rooms, account_data)
             VALUES (0, ?1, ?2, ?3)",
            params![
                sync.next_batch,
                serde_json::to_string(&sync.rooms)?,
                serde_json::to_string(&sync.account_data)?,
            ],
        )?;
        Ok(())
    }

    // =========================================================================
    // Presence
    // =========================================================================

    /// Upsert presence for each user.
    pub fn sync_to_database(&mut self, users: &[UserPresence]) -> StoreResult<()> {
        let tx = self.conn.transaction()?;
        for user in users {
            tx.execute(
                "INSERT OR REPLACE INTO users (user_id, event) VALUES (?1, ?2)",
                params![user.user_id.as_str(), serde_json::to_string(&user.event)?],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn user_presence_events(&self) -> StoreResult<Vec<UserPresence>> {
        let mut stmt = self
            .conn
            .prepare("SELECT user_id, event FROM users ORDER BY user_id")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?;

        let mut out = Vec::new();
        for row in rows {
            let (user_id, event) = row?;
            out.push(UserPresence { user_id: UserId::new(user_id), event: serde_json::from_str(&event)? });
        }
        Ok(out)
    }

    // =========================================================================
    // Out-of-band members
    // =========================================================================

    /// `None` if never written for this room; `Some(vec![])` if written empty.
    pub fn out_of_band_members(&self, room_id: &RoomId) -> StoreResult<Option<Vec<Value>>> {
        let written = self
            .conn
            .query_row(
                "SELECT 1 FROM oob_rooms WHERE room_id = ?1",
                params![room_id.as_str()],
                |_| Ok(()),
            )
            .optional()?;
        if written.is_none() {
            return Ok(None);
        }

        let mut stmt = self
            .conn
            .prepare("SELECT event FROM oob_members WHERE room_id = ?1 ORDER BY seq")?;
        let rows = stmt.query_map(params![room_id.as_str()], |row| row.get::<_, String>(0))?;
        let mut events = Vec::new();
        for row in rows {
            events.push(serde_json::from_str(&row?)?);
        }
        Ok(Some(events))
    }

    /// Replace the stored members for a room.
    pub fn set_out_of_band_members(&mut self, room_id: &RoomId, events: &[Value]) -> StoreResult<()> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM oob_members WHERE room_id = ?1", params![room_id.as_str()])?;
        tx.execute(
            "INSERT OR IGNORE INTO oob_rooms (room_id) VALUES (?1)",
            params![room_id.as_str()],
        )?;
        for (seq, event) in events.iter().enumerate() {
            tx.execute(
                "INSERT INTO oob_members (room_id, seq, event) VALUES (?1, ?2, ?3)",
                params![room_id.as_str(), seq as i64, serde_json::to_string(event)?],
            )?;
        }
        tx.commit()?;
        debug!(room_id = %room_id, count = events.len(), "stored out-of-band members");
        Ok(())
    }

    pub fn clear_out_of_band_members(&mut self, room_id: &RoomId) -> StoreResult<()> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM oob_members WHERE room_id = ?1", params![room_id.as_str()])?;
        tx.execute("DELETE FROM oob_rooms WHERE room_id = ?1", params![room_id.as_str()])?;
        tx.commit()?;
        Ok(())
    }

    // =========================================================================
    // Client options
    // =========================================================================

    pub fn client_options(&self) -> StoreResult<Option<Value>> {
        let raw: Option<String> = self
            .conn
            .query_row("SELECT options FROM client_options WHERE id = 0", [], |row| row.get(0))
            .optional()?;
        Ok(raw.map(|s| serde_json::from_str(&s)).transpose()?)
    }

    pub fn store_client_options(&self, options: &Value) -> StoreResult<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO client_options (id, options) VALUES (0, ?1)",
            params![serde_json::to_string(options)?],
        )?;
        Ok(())
    }

    // =========================================================================
    // To-device queue
    // =========================================================================

    pub fn save_to_device_batches(&mut self, batches: &[ToDeviceBatch]) -> StoreResult<()> {
        let tx = self.conn.transaction()?;
        for batch in batches {
            tx.execute(
                "INSERT INTO to_device_queue (event_type, txn_id, batch) VALUES (?1, ?2, ?3)",
                params![batch.event_type, batch.txn_id, serde_json::to_string(&batch.batch)?],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn oldest_to_device_batch(&self) -> StoreResult<Option<QueuedToDeviceBatch>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, event_type, txn_id, batch FROM to_device_queue ORDER BY id LIMIT 1",
                [],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?;
        match row {
            Some((id, event_type, txn_id, batch)) => Ok(Some(QueuedToDeviceBatch {
                id,
                batch: ToDeviceBatch { event_type, txn_id, batch: serde_json::from_str(&batch)? },
            })),
            None => Ok(None),
        }
    }

    /// Returns whether a batch was removed.
    pub fn remove_to_device_batch(&self, id: i64) -> StoreResult<bool> {
        let removed = self
            .conn
            .execute("DELETE FROM to_device_queue WHERE id = ?1", params![id])?;
        Ok(removed > 0)
    }
}
