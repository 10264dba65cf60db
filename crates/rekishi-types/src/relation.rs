//! Relation metadata carried in `content["m.relates_to"]`.
//!
//! A relation is a typed reference from one event to another. Only the
//! relation kinds the aggregation engine understands are modelled; anything
//! else parses as "no relation" so a stray custom kind can't be mis-aggregated.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use strum::EnumString;

use crate::ids::EventId;

/// Kind of relation between two events.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString)]
pub enum RelationType {
    /// Reaction keyed by a short string (usually an emoji).
    #[serde(rename = "m.annotation")]
    #[strum(serialize = "m.annotation")]
    Annotation,
    /// Edit superseding the content of its target.
    #[serde(rename = "m.replace")]
    #[strum(serialize = "m.replace")]
    Replace,
    /// Plain reference (quotes, verification flows).
    #[serde(rename = "m.reference")]
    #[strum(serialize = "m.reference")]
    Reference,
    /// Thread reply.
    #[serde(rename = "m.thread")]
    #[strum(serialize = "m.thread")]
    Thread,
}

impl RelationType {
    /// Parse from the wire string (exact match).
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        <Self as FromStr>::from_str(s).ok()
    }

    /// Wire string.
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationType::Annotation => "m.annotation",
            RelationType::Replace => "m.replace",
            RelationType::Reference => "m.reference",
            RelationType::Thread => "m.thread",
        }
    }
}

impl std::fmt::Display for RelationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Parsed `m.relates_to` block.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationInfo {
    /// Relation kind.
    pub rel_type: RelationType,
    /// Event this relation points at.
    pub event_id: EventId,
    /// Annotation key (only meaningful for [`RelationType::Annotation`]).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

impl RelationInfo {
    /// Build a relation of any kind.
    pub fn new(rel_type: RelationType, event_id: EventId) -> Self {
        Self { rel_type, event_id, key: None }
    }

    /// Build an annotation relation with its key.
    pub fn annotation(event_id: EventId, key: impl Into<String>) -> Self {
        Self {
            rel_type: RelationType::Annotation,
            event_id,
            key: Some(key.into()),
        }
    }

    /// Extract from an event content object.
    ///
    /// Returns `None` when `m.relates_to` is absent, malformed, or names a
    /// relation kind not listed in [`RelationType`].
    pub fn from_content(content: &serde_json::Value) -> Option<Self> {
        let relates_to = content.get("m.relates_to")?;
        serde_json::from_value(relates_to.clone()).ok()
    }

    /// Render back into the `m.relates_to` JSON shape.
    pub fn to_content(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
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
    fn test_relation_type_roundtrip_str() {
        for rt in [
            RelationType::Annotation,
            RelationType::Replace,
            RelationType::Reference,
            RelationType::Thread,
        ] {
            assert_eq!(RelationType::from_str(rt.as_str()), Some(rt));
        }
        assert_eq!(RelationType::from_str("m.custom"), None);
    }

    #[test]
    fn test_from_content_annotation() {
        let content = json!({
            "m.relates_to": {
                "rel_type": "m.annotation",
                "event_id": "$target",
                "key": "👍"
            }
        });
        let rel = RelationInfo::from_content(&content).unwrap();
        assert_eq!(rel, RelationInfo::annotation(EventId::new("$target"), "👍"));
    }

    #[test]
    fn test_from_content_unknown_kind_is_none() {
        let content = json!({
            "m.relates_to": { "rel_type": "org.example.custom", "event_id": "$t" }
        });
        assert!(RelationInfo::from_content(&content).is_none());
        assert!(RelationInfo::from_content(&json!({"body": "hi"})).is_none());
    }

    #[test]
    fn test_to_content_omits_missing_key() {
        let rel = RelationInfo::new(RelationType::Replace, EventId::new("$t"));
        assert_eq!(
            rel.to_content(),
            json!({ "rel_type": "m.replace", "event_id": "$t" })
        );
    }
}
