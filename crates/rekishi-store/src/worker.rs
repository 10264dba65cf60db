//! Store worker and its async handle.
//!
//! SQLite is blocking and [`rusqlite::Connection`] is `!Sync`, so the
//! database lives on a dedicated thread. Callers hold a cheap, cloneable
//! [`StoreHandle`]; each method sends a sequenced command over mpsc and
//! awaits the oneshot reply.
//!
//! ```text
//!   StoreHandle (Clone+Send+Sync)   mpsc      worker thread
//!   ┌──────────────────────────┐  ───────▶  ┌──────────────────────┐
//!   │ .connect()               │            │ StoreDb (rusqlite)   │
//!   │ .set_sync_data()         │  ◀───────  │ one command at a time│
//!   │ .get_saved_sync()        │   oneshot  └──────────────────────┘
//!   └──────────────────────────┘
//! ```
//!
//! The thread starts on first use and stops when the last handle is dropped.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;
use tokio::sync::{OnceCell, mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use rekishi_types::RoomId;

use crate::db::{QueuedToDeviceBatch, SavedSync, StoreDb, ToDeviceBatch, UserPresence};
use crate::error::{StoreError, StoreResult};

// ============================================================================
// Commands (internal)
// ============================================================================

type Reply<T> = oneshot::Sender<StoreResult<T>>;

/// Internal command sent from StoreHandle → worker via mpsc.
enum StoreCommand {
    Connect { reply: Reply<()> },
    ClearDatabase { reply: Reply<()> },
    IsNewlyCreated { reply: Reply<bool> },

    // Sync
    GetSavedSync { reply: Reply<Option<SavedSync>> },
    GetNextBatchToken { reply: Reply<Option<String>> },
    SetSyncData { sync: SavedSync, reply: Reply<()> },

    // Presence
    SyncToDatabase { users: Vec<UserPresence>, reply: Reply<()> },
    GetUserPresenceEvents { reply: Reply<Vec<UserPresence>> },

    // Out-of-band members
    GetOutOfBandMembers { room_id: RoomId, reply: Reply<Option<Vec<Value>>> },
    SetOutOfBandMembers { room_id: RoomId, events: Vec<Value>, reply: Reply<()> },
    ClearOutOfBandMembers { room_id: RoomId, reply: Reply<()> },

    // Client options
    GetClientOptions { reply: Reply<Option<Value>> },
    StoreClientOptions { options: Value, reply: Reply<()> },

    // To-device queue
    SaveToDeviceBatches { batches: Vec<ToDeviceBatch>, reply: Reply<()> },
    GetOldestToDeviceBatch { reply: Reply<Option<QueuedToDeviceBatch>> },
    RemoveToDeviceBatch { id: i64, reply: Reply<bool> },
}

impl StoreCommand {
    fn name(&self) -> &'static str {
        match self {
            StoreCommand::Connect { .. } => "connect",
            StoreCommand::ClearDatabase { .. } => "clear_database",
            StoreCommand::IsNewlyCreated { .. } => "is_newly_created",
            StoreCommand::GetSavedSync { .. } => "get_saved_sync",
            StoreCommand::GetNextBatchToken { .. } => "get_next_batch_token",
            StoreCommand::SetSyncData { .. } => "set_sync_data",
            StoreCommand::SyncToDatabase { .. } => "sync_to_database",
            StoreCommand::GetUserPresenceEvents { .. } => "get_user_presence_events",
            StoreCommand::GetOutOfBandMembers { .. } => "get_out_of_band_members",
            StoreCommand::SetOutOfBandMembers { .. } => "set_out_of_band_members",
            StoreCommand::ClearOutOfBandMembers { .. } => "clear_out_of_band_members",
            StoreCommand::GetClientOptions { .. } => "get_client_options",
            StoreCommand::StoreClientOptions { .. } => "store_client_options",
            StoreCommand::SaveToDeviceBatches { .. } => "save_to_device_batches",
            StoreCommand::GetOldestToDeviceBatch { .. } => "get_oldest_to_device_batch",
            StoreCommand::RemoveToDeviceBatch { .. } => "remove_to_device_batch",
        }
    }
}

struct Envelope {
    seq: u64,
    command: StoreCommand,
}

/// Where the worker keeps its database.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreLocation {
    Path(PathBuf),
    InMemory,
}

// ============================================================================
// Worker (internal, owns the connection)
// ============================================================================

struct StoreWorker {
    location: StoreLocation,
    db: Option<StoreDb>,
}

impl StoreWorker {
    fn run(mut self, mut rx: mpsc::UnboundedReceiver<Envelope>) {
        info!(location = ?self.location, "store worker started");
        while let Some(Envelope { seq, command }) = rx.blocking_recv() {
            trace!(seq, command = command.name(), "store command");
            self.handle(seq, command);
        }
        info!("store worker stopped");
    }

    fn db(&mut self) -> StoreResult<&mut StoreDb> {
        self.db.as_mut().ok_or(StoreError::NotConnected)
    }

    /// Open on first connect; later connects reuse the open database.
    fn connect(&mut self) -> StoreResult<&mut StoreDb> {
        if self.db.is_none() {
            let db = match &self.location {
                StoreLocation::Path(path) => StoreDb::open(path)?,
                StoreLocation::InMemory => StoreDb::in_memory()?,
            };
            self.db = Some(db);
        }
        self.db()
    }

    fn handle(&mut self, seq: u64, command: StoreCommand) {
        match command {
            StoreCommand::Connect { reply } => {
                let result = self.connect().map(|_| ());
                respond(seq, reply, result);
            }
            StoreCommand::ClearDatabase { reply } => {
                let result = self.connect().and_then(|db| db.clear());
                respond(seq, reply, result);
            }
            StoreCommand::IsNewlyCreated { reply } => {
                let result = self.db().map(|db| db.is_newly_created());
                respond(seq, reply, result);
            }
            StoreCommand::GetSavedSync { reply } => {
                let result = self.db().and_then(|db| db.saved_sync());
                respond(seq, reply, result);
            }
            StoreCommand::GetNextBatchToken { reply } => {
                let result = self.db().and_then(|db| db.next_batch_token());
                respond(seq, reply, result);
            }
            StoreCommand::SetSyncData { sync, reply } => {
                let result = self.db().and_then(|db| db.set_sync_data(&sync));
                respond(seq, reply, result);
            }
            StoreCommand::SyncToDatabase { users, reply } => {
                let result = self.db().and_then(|db| db.sync_to_database(&users));
                respond(seq, reply, result);
            }
            StoreCommand::GetUserPresenceEvents { reply } => {
                let result = self.db().and_then(|db| db.user_presence_events());
                respond(seq, reply, result);
            }
            StoreCommand::GetOutOfBandMembers { room_id, reply } => {
                let result = self.db().and_then(|db| db.out_of_band_members(&room_id));
                respond(seq, reply, result);
            }
            StoreCommand::SetOutOfBandMembers { room_id, events, reply } => {
                let result = self
                    .db()
                    .and_then(|db| db.set_out_of_band_members(&room_id, &events));
                respond(seq, reply, result);
            }
            StoreCommand::ClearOutOfBandMembers { room_id, reply } => {
                let result = self.db().and_then(|db| db.clear_out_of_band_members(&room_id));
                respond(seq, reply, result);
            }
            StoreCommand::GetClientOptions { reply } => {
                let result = self.db().and_then(|db| db.client_options());
                respond(seq, reply, result);
            }
            StoreCommand::StoreClientOptions { options, reply } => {
                let result = self.db().and_then(|db| db.store_client_options(&options));
                respond(seq, reply, result);
            }
            StoreCommand::SaveToDeviceBatches { batches, reply } => {
                let result = self.db().and_then(|db| db.save_to_device_batches(&batches));
                respond(seq, reply, result);
            }
            StoreCommand::GetOldestToDeviceBatch { reply } => {
                let result = self.db().and_then(|db| db.oldest_to_device_batch());
                respond(seq, reply, result);
            }
            StoreCommand::RemoveToDeviceBatch { id, reply } => {
                let result = self.db().and_then(|db| db.remove_to_device_batch(id));
                respond(seq, reply, result);
            }
        }
    }
}

fn respond<T>(seq: u64, reply: Reply<T>, result: StoreResult<T>) {
    if let Err(e) = &result {
        warn!(seq, "store command failed: {}", e);
    }
    if reply.send(result).is_err() {
        debug!(seq, "caller dropped before store reply");
    }
}

// ============================================================================
// StoreHandle (Send + Sync public API)
// ============================================================================

struct HandleInner {
    location: StoreLocation,
    tx: OnceCell<mpsc::UnboundedSender<Envelope>>,
    next_seq: AtomicU64,
}

/// Send+Sync handle to the store worker.
///
/// `connect` (or `clear_database`) must come first; other commands fail with
/// [`StoreError::NotConnected`] until then.
#[derive(Clone)]
pub struct StoreHandle {
    inner: Arc<HandleInner>,
}

impl StoreHandle {
    /// Handle for a database file; nothing is opened until `connect`.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self::with_location(StoreLocation::Path(path.into()))
    }

    /// Handle for a throwaway in-memory database.
    pub fn in_memory() -> Self {
        Self::with_location(StoreLocation::InMemory)
    }

    fn with_location(location: StoreLocation) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                location,
                tx: OnceCell::new(),
                next_seq: AtomicU64::new(0),
            }),
        }
    }

    pub fn location(&self) -> &StoreLocation {
        &self.inner.location
    }

    /// Start the worker thread if it is not running yet.
    async fn ensure_started(&self) -> StoreResult<&mpsc::UnboundedSender<Envelope>> {
        self.inner
            .tx
            .get_or_try_init(|| async {
                let (tx, rx) = mpsc::unbounded_channel();
                let worker = StoreWorker { location: self.inner.location.clone(), db: None };
                std::thread::Builder::new()
                    .name("rekishi-store".into())
                    .spawn(move || worker.run(rx))
                    .map_err(|e| StoreError::Worker(e.to_string()))?;
                Ok::<_, StoreError>(tx)
            })
            .await
    }

    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> StoreCommand) -> StoreResult<T> {
        let tx = self.ensure_started().await?;
        let seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed);
        let (reply, rx) = oneshot::channel();
        tx.send(Envelope { seq, command: build(reply) })
            .map_err(|_| StoreError::Shutdown)?;
        rx.await.map_err(|_| StoreError::Shutdown)?
    }

    // ── Lifecycle ────────────────────────────────────────────────────────

    /// Open the database.
    pub async fn connect(&self) -> StoreResult<()> {
        self.request(|reply| StoreCommand::Connect { reply }).await
    }

    /// Delete all stored data (connecting first if needed).
    pub async fn clear_database(&self) -> StoreResult<()> {
        self.request(|reply| StoreCommand::ClearDatabase { reply }).await
    }

    /// True if `connect` created the database rather than opening one.
    pub async fn is_newly_created(&self) -> StoreResult<bool> {
        self.request(|reply| StoreCommand::IsNewlyCreated { reply }).await
    }

    // ── Sync ─────────────────────────────────────────────────────────────

    pub async fn get_saved_sync(&self) -> StoreResult<Option<SavedSync>> {
        self.request(|reply| StoreCommand::GetSavedSync { reply }).await
    }

    pub async fn get_next_batch_token(&self) -> StoreResult<Option<String>> {
        self.request(|reply| StoreCommand::GetNextBatchToken { reply }).await
    }

    pub async fn set_sync_data(&self, sync: SavedSync) -> StoreResult<()> {
        self.request(|reply| StoreCommand::SetSyncData { sync, reply }).await
    }

    // ── Presence ─────────────────────────────────────────────────────────

    /// Persist the latest presence of each user.
    pub async fn sync_to_database(&self, users: Vec<UserPresence>) -> StoreResult<()> {
        self.request(|reply| StoreCommand::SyncToDatabase { users, reply }).await
    }

    pub async fn get_user_presence_events(&self) -> StoreResult<Vec<UserPresence>> {
        self.request(|reply| StoreCommand::GetUserPresenceEvents { reply }).await
    }

    // ── Out-of-band members ──────────────────────────────────────────────

    /// `None` when never stored for the room, `Some(vec![])` when stored empty.
    pub async fn get_out_of_band_members(&self, room_id: &RoomId) -> StoreResult<Option<Vec<Value>>> {
        let room_id = room_id.clone();
        self.request(|reply| StoreCommand::GetOutOfBandMembers { room_id, reply }).await
    }

    pub async fn set_out_of_band_members(&self, room_id: &RoomId, events: Vec<Value>) -> StoreResult<()> {
        let room_id = room_id.clone();
        self.request(|reply| StoreCommand::SetOutOfBandMembers { room_id, events, reply })
            .await
    }

    pub async fn clear_out_of_band_members(&self, room_id: &RoomId) -> StoreResult<()> {
        let room_id = room_id.clone();
        self.request(|reply| StoreCommand::ClearOutOfBandMembers { room_id, reply }).await
    }

    // ── Client options ───────────────────────────────────────────────────

    pub async fn get_client_options(&self) -> StoreResult<Option<Value>> {
        self.request(|reply| StoreCommand::GetClientOptions { reply }).await
    }

    pub async fn store_client_options(&self, options: Value) -> StoreResult<()> {
        self.request(|reply| StoreCommand::StoreClientOptions { options, reply }).await
    }

    // ── To-device queue ──────────────────────────────────────────────────

    pub async fn save_to_device_batches(&self, batches: Vec<ToDeviceBatch>) -> StoreResult<()> {
        self.request(|reply| StoreCommand::SaveToDeviceBatches { batches, reply }).await
    }

    pub async fn get_oldest_to_device_batch(&self) -> StoreResult<Option<QueuedToDeviceBatch>> {
        self.request(|reply| StoreCommand::GetOldestToDeviceBatch { reply }).await
    }

    pub async fn remove_to_device_batch(&self, id: i64) -> StoreResult<bool> {
        self.request(|reply| StoreCommand::RemoveToDeviceBatch { id, reply }).await
    }
}

impl std::fmt::Debug for StoreHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreHandle")
            .field("location", &self.inner.location)
            .field("started", &self.inner.tx.initialized())
            .finish()
    }
}
