//! Timeline segments and relation aggregation for Rekishi.
//!
//! Events arrive from sync (appended to the live segment) and from
//! back-pagination (prepended to whichever segment is being filled). This
//! crate organises them into navigable history and keeps relation
//! aggregations (reactions, edits) consistent as events arrive, are
//! cancelled, or are redacted.
//!
//! # Structure
//!
//! - [`TimelineSegment`]: a contiguous run of events with room state at both
//!   ends, pagination tokens, and stable relative indexing across prepends
//! - [`TimelineSet`]: the arena of segments for one room view, linked by
//!   [`SegmentId`] handles, plus an event index and the room's relations
//! - [`Relations`]: all relations of one `(relation type, event type)` to one
//!   target; annotation grouping and edit resolution
//! - [`RelationsIndex`]: containers keyed by target, created on demand
//!
//! # Concurrency
//!
//! Structural mutation goes through `&mut`, so there is a single writer.
//! [`Event`]s are shared as `Arc<Event>` with runtime state behind interior
//! locks; they publish [`EventSignal`]s that containers drain in
//! [`Relations::process_signals`].

mod config;
mod crypto;
mod direction;
mod error;
mod event;
pub mod ids;
mod relations;
mod relations_index;
mod segment;
mod state;
mod timeline_set;

pub use config::{ConfigError, EngineConfig};
pub use crypto::{DecryptedPayload, DecryptionError, DecryptionState, Decryptor};
pub use direction::Direction;
pub use error::{RelationsError, TimelineError};
pub use event::{Event, EventSignal};
pub use ids::SegmentId;
pub use relations::{AnnotationGroup, EventSet, RelationOutcome, Relations, RelationsEvent, SkipReason};
pub use relations_index::{RelationKey, RelationsIndex};
pub use segment::{AppendOptions, TimelineSegment};
pub use state::{ApplyOptions, RoomState, StateSnapshot, StateUpdate};
pub use timeline_set::TimelineSet;

/// Result type for timeline operations.
pub type Result<T> = std::result::Result<T, TimelineError>;

/// Current time as Unix milliseconds.
pub(crate) fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
