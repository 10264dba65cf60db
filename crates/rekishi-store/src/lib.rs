//! Persistent sync store for Rekishi.
//!
//! A SQLite database holding the last sync response, user presence,
//! out-of-band room members, client options and the outgoing to-device
//! queue. All database work runs on one worker thread; callers talk to it
//! through [`StoreHandle`], which starts the worker lazily and tags every
//! command with a sequence number for log correlation.

mod db;
mod error;
mod worker;

pub use db::{QueuedToDeviceBatch, SavedSync, StoreDb, ToDeviceBatch, UserPresence};
pub use error::{StoreError, StoreResult};
pub use worker::{StoreHandle, StoreLocation};
