//! Decryption seam.
//!
//! The engine never holds keys. It hands encrypted events to a [`Decryptor`]
//! supplied by the embedding client and tracks the attempt on the event
//! itself, so a second caller can await an in-flight decryption instead of
//! starting another one.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::event::Event;

/// Clear-text result of decrypting an `m.room.encrypted` event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DecryptedPayload {
    #[serde(rename = "type")]
    pub event_type: String,
    pub content: serde_json::Value,
}

impl DecryptedPayload {
    pub fn new(event_type: impl Into<String>, content: serde_json::Value) -> Self {
        Self { event_type: event_type.into(), content }
    }
}

/// Why a decryption attempt did not produce a payload.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecryptionError {
    /// Megolm session for this event is not known (yet).
    #[error("missing room key: {0}")]
    MissingKey(String),

    #[error("decryption failed: {0}")]
    Failed(String),

    /// The event needs decrypting but no decryptor was configured.
    #[error("no decryptor configured")]
    NoDecryptor,
}

/// Where an event is in its decryption lifecycle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DecryptionState {
    /// Plain-text event; nothing to do.
    NotEncrypted,
    /// Encrypted and not attempted yet.
    Pending,
    /// An attempt is running; await it rather than starting another.
    InFlight,
    Decrypted,
    /// Last attempt failed; a later attempt may succeed once keys arrive.
    Failed(DecryptionError),
}

impl DecryptionState {
    pub fn is_settled(&self) -> bool {
        !matches!(self, DecryptionState::InFlight)
    }
}

/// Decrypts events on behalf of the engine.
#[async_trait]
pub trait Decryptor: Send + Sync {
    async fn decrypt(&self, event: &Event) -> Result<DecryptedPayload, DecryptionError>;
}
