//! Wire event records and local send status.
//!
//! [`EventRecord`] is the serializable form the transport delivers: the
//! Matrix client-server JSON shape, minus anything the timeline engine does
//! not read. The live, shareable event with runtime state is built on top of
//! it in `rekishi-timeline`.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use strum::EnumString;

use crate::ids::{EventId, RoomId, UserId};
use crate::relation::{RelationInfo, RelationType};

/// Well-known event type strings.
pub mod event_type {
    pub const ROOM_MEMBER: &str = "m.room.member";
    pub const ROOM_MESSAGE: &str = "m.room.message";
    pub const ROOM_NAME: &str = "m.room.name";
    pub const ROOM_ENCRYPTED: &str = "m.room.encrypted";
    pub const ROOM_REDACTION: &str = "m.room.redaction";
    pub const REACTION: &str = "m.reaction";
}

/// Serializable event as delivered by sync or pagination.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub event_id: EventId,
    #[serde(rename = "type")]
    pub event_type: String,
    pub sender: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<RoomId>,
    /// Present (possibly empty) on state events only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_key: Option<String>,
    /// Milliseconds since the Unix epoch, as stamped by the origin server.
    pub origin_server_ts: u64,
    #[serde(default)]
    pub content: serde_json::Value,
    #[serde(default)]
    pub unsigned: Unsigned,
}

/// Server-computed metadata outside the signed event.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Unsigned {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_content: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redacted_because: Option<serde_json::Value>,
    #[serde(rename = "m.relations", default, skip_serializing_if = "Option::is_none")]
    pub relations: Option<AggregatedRelations>,
}

/// Bundled aggregations the server attaches to a target event.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregatedRelations {
    #[serde(rename = "m.replace", default, skip_serializing_if = "Option::is_none")]
    pub replace: Option<ReplaceSummary>,
}

/// The server's view of the latest edit of a target event.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplaceSummary {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<EventId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_server_ts: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<UserId>,
}

impl EventRecord {
    /// Minimal record with empty content; the usual starting point in tests
    /// and for local echoes.
    pub fn new(
        event_id: impl Into<EventId>,
        event_type: impl Into<String>,
        sender: impl Into<UserId>,
        origin_server_ts: u64,
    ) -> Self {
        Self {
            event_id: event_id.into(),
            event_type: event_type.into(),
            sender: sender.into(),
            room_id: None,
            state_key: None,
            origin_server_ts,
            content: serde_json::Value::Object(Default::default()),
            unsigned: Unsigned::default(),
        }
    }

    /// Builder: set content.
    pub fn with_content(mut self, content: serde_json::Value) -> Self {
        self.content = content;
        self
    }

    /// Builder: mark as a state event with the given key.
    pub fn with_state_key(mut self, state_key: impl Into<String>) -> Self {
        self.state_key = Some(state_key.into());
        self
    }

    /// Builder: set the room.
    pub fn with_room(mut self, room_id: impl Into<RoomId>) -> Self {
        self.room_id = Some(room_id.into());
        self
    }

    /// Builder: set the previous content of a state event.
    pub fn with_prev_content(mut self, prev_content: serde_json::Value) -> Self {
        self.unsigned.prev_content = Some(prev_content);
        self
    }

    /// Builder: attach relation metadata to the content.
    pub fn with_relation(mut self, relation: RelationInfo) -> Self {
        if !self.content.is_object() {
            self.content = serde_json::Value::Object(Default::default());
        }
        if let Some(obj) = self.content.as_object_mut() {
            obj.insert("m.relates_to".to_string(), relation.to_content());
        }
        self
    }

    /// Builder: record the server's latest-edit timestamp for this event.
    pub fn with_server_replace_ts(mut self, ts: u64) -> Self {
        let relations = self.unsigned.relations.get_or_insert_with(Default::default);
        let replace = relations.replace.get_or_insert_with(Default::default);
        replace.origin_server_ts = Some(ts);
        self
    }

    /// State events carry a `state_key`, even an empty one.
    pub fn is_state(&self) -> bool {
        self.state_key.is_some()
    }

    /// Relation metadata, if any.
    pub fn relation(&self) -> Option<RelationInfo> {
        RelationInfo::from_content(&self.content)
    }

    /// Timestamp of the server-aggregated edit, if the server bundled one.
    pub fn server_aggregated_ts(&self, rel_type: RelationType) -> Option<u64> {
        match rel_type {
            RelationType::Replace => self
                .unsigned
                .relations
                .as_ref()
                .and_then(|r| r.replace.as_ref())
                .and_then(|r| r.origin_server_ts),
            _ => None,
        }
    }
}

/// Local send lifecycle of an event this client originated.
///
/// Remote events have no status at all (`Option::None` on the live event).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum EventStatus {
    /// Send failed; may be retried or cancelled.
    NotSent,
    /// Being encrypted before send.
    Encrypting,
    /// Request in flight.
    Sending,
    /// Waiting behind other sends.
    Queued,
    /// Server accepted it.
    Sent,
    /// User cancelled before the server accepted it.
    Cancelled,
}

impl EventStatus {
    /// Parse from string (case-insensitive).
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        <Self as FromStr>::from_str(s).ok()
    }

    /// Convert to string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::NotSent => "not_sent",
            EventStatus::Encrypting => "encrypting",
            EventStatus::Sending => "sending",
            EventStatus::Queued => "queued",
            EventStatus::Sent => "sent",
            EventStatus::Cancelled => "cancelled",
        }
    }

    /// Check if the event has left the sending pipeline for good.
    pub fn is_terminal(&self) -> bool {
        matches!(self, EventStatus::Sent | EventStatus::Cancelled)
    }
}

impl std::fmt::Display for EventStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_deserialize_wire_shape() {
        let raw = json!({
            "event_id": "$edit",
            "type": "m.room.message",
            "sender": "@alice:example.org",
            "origin_server_ts": 1234,
            "content": {
                "body": "* fixed",
                "m.relates_to": { "rel_type": "m.replace", "event_id": "$orig" }
            },
            "unsigned": {
                "m.relations": { "m.replace": { "origin_server_ts": 1200 } }
            }
        });
        let record: EventRecord = serde_json::from_value(raw).unwrap();
        assert_eq!(record.event_type, "m.room.message");
        assert!(!record.is_state());
        let rel = record.relation().unwrap();
        assert_eq!(rel.rel_type, RelationType::Replace);
        assert_eq!(rel.event_id, EventId::new("$orig"));
        assert_eq!(record.server_aggregated_ts(RelationType::Replace), Some(1200));
        assert_eq!(record.server_aggregated_ts(RelationType::Annotation), None);
    }

    #[test]
    fn test_empty_state_key_is_state() {
        let record = EventRecord::new("$n", event_type::ROOM_NAME, "@a:x", 1).with_state_key("");
        assert!(record.is_state());
    }

    #[test]
    fn test_with_relation_preserves_body() {
        let record = EventRecord::new("$r", event_type::REACTION, "@a:x", 1)
            .with_content(json!({"body": "kept"}))
            .with_relation(RelationInfo::annotation(EventId::new("$t"), "🎉"));
        assert_eq!(record.content["body"], "kept");
        assert_eq!(record.relation().unwrap().key.as_deref(), Some("🎉"));
    }

    #[test]
    fn test_status_parse_and_terminal() {
        assert_eq!(EventStatus::from_str("SENDING"), Some(EventStatus::Sending));
        assert_eq!(EventStatus::from_str("not_sent"), Some(EventStatus::NotSent));
        assert!(EventStatus::Sent.is_terminal());
        assert!(EventStatus::Cancelled.is_terminal());
        assert!(!EventStatus::NotSent.is_terminal());
    }
}
