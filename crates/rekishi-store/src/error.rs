//! Store error type.

/// Errors from the store and its worker.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    /// A command other than `connect`/`clear_database` arrived first.
    #[error("store not connected")]
    NotConnected,
    #[error("store worker shut down")]
    Shutdown,
    #[error("store worker error: {0}")]
    Worker(String),
}

/// Result type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;
