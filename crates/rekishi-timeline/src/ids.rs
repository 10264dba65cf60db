//! Segment handles.
//!
//! Segments live in an arena owned by [`TimelineSet`](crate::TimelineSet) and
//! refer to their neighbours by handle, never by reference, so the chain has
//! no ownership cycles. Handles wrap UUIDv7 (time-ordered) and display as
//! standard UUID text for logging.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A timeline segment identifier (UUIDv7).
#[derive(Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SegmentId(uuid::Uuid);

impl SegmentId {
    /// Create a new time-ordered ID (UUIDv7).
    pub fn new() -> Self {
        Self(uuid::Uuid::now_v7())
    }

    /// First 8 hex characters, for human display only.
    pub fn short(&self) -> String {
        self.0.as_simple().to_string()[..8].to_string()
    }

    /// Parse from a hex string (32 chars, no hyphens) or standard UUID format.
    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        uuid::Uuid::parse_str(s).map(Self)
    }
}

impl Default for SegmentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SegmentId({})", self.short())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_is_unique_and_ordered() {
        let ids: Vec<SegmentId> = (0..10).map(|_| SegmentId::new()).collect();
        for i in 1..ids.len() {
            assert_ne!(ids[i], ids[i - 1]);
            assert!(ids[i] >= ids[i - 1]);
        }
    }

    #[test]
    fn test_parse_roundtrip() {
        let id = SegmentId::new();
        assert_eq!(SegmentId::parse(&id.to_string()).unwrap(), id);
        assert_eq!(id.short().len(), 8);
    }
}
