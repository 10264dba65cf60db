//! Shared identity, event and relation types for Rekishi.
//!
//! This crate is the wire foundation: typed IDs, serializable event records,
//! relation metadata, send status, and membership views. It has **no internal
//! rekishi dependencies**; it is a leaf crate that the timeline engine and the
//! store build on.
//!
//! # Key Types
//!
//! |-------------------|----------------------------------------------|
//! | Type              | Purpose                                      |
//! |-------------------|----------------------------------------------|
//! | [`EventId`]       | Which event (`$…`, or `~txn` local echo)     |
//! | [`UserId`]        | Who (`@local:server`)                        |
//! | [`RoomId`]        | Which conversation (`!…:server`)             |
//! | [`EventRecord`]   | Event as delivered by the transport          |
//! | [`RelationInfo`]  | Parsed `m.relates_to`                        |
//! | [`EventStatus`]   | Local send lifecycle                         |
//! | [`MemberView`]    | Resolved sender/target (real or sentinel)    |
//! |-------------------|----------------------------------------------|

pub mod event;
pub mod ids;
pub mod member;
pub mod relation;

// Re-export primary types at crate root for convenience.
pub use event::{
    AggregatedRelations, EventRecord, EventStatus, ReplaceSummary, Unsigned, event_type,
};
pub use ids::{EventId, IdError, RoomId, UserId};
pub use member::{MemberView, Membership, RoomMember};
pub use relation::{RelationInfo, RelationType};
