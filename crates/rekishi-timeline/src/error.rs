//! Error types for timeline and relation operations.

use thiserror::Error;

use crate::crypto::DecryptionError;
use crate::direction::Direction;
use crate::ids::SegmentId;

/// Contract violations on segments and the segment arena.
///
/// These indicate a bug in the caller (the sync layer), not a transient
/// condition; they are returned rather than panicking so the caller can log
/// and resync.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TimelineError {
    /// Direction string was neither `b` nor `f`.
    #[error("invalid direction '{0}'")]
    InvalidDirection(String),

    /// `initialise_state` called on a segment that already holds events.
    #[error("cannot initialise state after events are added")]
    StateAfterEvents,

    /// Neighbour links are write-once.
    #[error("segment already has a neighbouring segment - cannot reset neighbour (direction: {direction})")]
    NeighbourAlreadySet { direction: Direction },

    /// Handle does not name a segment in this set.
    #[error("segment not found: {0:?}")]
    SegmentNotFound(SegmentId),
}

/// Failures surfaced by relation aggregation.
#[derive(Error, Debug, Clone)]
pub enum RelationsError {
    /// The winning replacement could not be decrypted.
    #[error("replacement decryption failed: {0}")]
    Decryption(#[from] DecryptionError),
}
