//! Typed identifiers for events, users, and rooms.
//!
//! All ID types wrap the opaque string the homeserver hands out. They are
//! sigil-prefixed on the wire (`$event`, `@user:server`, `!room:server`) and
//! display verbatim for logging. The `short()` form is for human-facing UI
//! and log lines, never as a lookup key.
//!
//! `EventId` also has a local-echo form (`~txn`) for events that exist only
//! on this client until the server assigns the real ID.

use std::borrow::Borrow;
use std::fmt;

use serde::{Deserialize, Serialize};

/// An event identifier (`$opaque` or `~txn` for local echoes).
#[derive(Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(String);

/// A user identifier (`@localpart:server`).
#[derive(Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

/// A room identifier (`!opaque:server`).
#[derive(Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

/// Error from strict ID parsing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdError {
    #[error("empty {0}")]
    Empty(&'static str),
    #[error("{kind} '{value}' must start with one of {sigils:?}")]
    BadSigil {
        kind: &'static str,
        value: String,
        sigils: &'static [char],
    },
}

// ── Shared behavior ─────────────────────────────────────────────────────────

macro_rules! impl_string_id {
    ($T:ident, $name:literal, $sigils:expr) => {
        impl $T {
            /// Sigils accepted by [`Self::parse`].
            pub const SIGILS: &'static [char] = $sigils;

            /// Wrap a raw ID without validation (trusted transport input).
            pub fn new(raw: impl Into<String>) -> Self {
                Self(raw.into())
            }

            /// Parse with sigil validation.
            pub fn parse(raw: &str) -> Result<Self, IdError> {
                let Some(first) = raw.chars().next() else {
                    return Err(IdError::Empty($name));
                };
                if !Self::SIGILS.contains(&first) {
                    return Err(IdError::BadSigil {
                        kind: $name,
                        value: raw.to_string(),
                        sigils: Self::SIGILS,
                    });
                }
                Ok(Self(raw.to_string()))
            }

            /// The raw string, sigil included.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Up to 8 characters after the sigil, for display only.
            pub fn short(&self) -> String {
                self.0.chars().skip(1).take(8).collect()
            }

            /// Server name after the first `:`, if the ID carries one.
            pub fn server_name(&self) -> Option<&str> {
                self.0.split_once(':').map(|(_, server)| server)
            }
        }

        impl From<&str> for $T {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $T {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<$T> for String {
            fn from(id: $T) -> String {
                id.0
            }
        }

        impl AsRef<str> for $T {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl Borrow<str> for $T {
            fn borrow(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $T {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl fmt::Debug for $T {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", $name, self.0)
            }
        }
    };
}

impl_string_id!(EventId, "EventId", &['$', '~']);
impl_string_id!(UserId, "UserId", &['@']);
impl_string_id!(RoomId, "RoomId", &['!']);

// ── EventId local echoes ────────────────────────────────────────────────────

impl EventId {
    /// Placeholder ID for a locally-sent event awaiting its remote echo.
    pub fn local_echo(txn_id: &str) -> Self {
        Self(format!("~{txn_id}"))
    }

    /// Check if this is a local-echo placeholder.
    pub fn is_local_echo(&self) -> bool {
        self.0.starts_with('~')
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_parse_accepts_sigils() {
        assert!(EventId::parse("$abc").is_ok());
        assert!(EventId::parse("~txn1").is_ok());
        assert!(UserId::parse("@alice:example.org").is_ok());
        assert!(RoomId::parse("!room:example.org").is_ok());
    }

    #[test]
    fn test_parse_rejects_bad_sigil() {
        let err = UserId::parse("alice").unwrap_err();
        assert!(matches!(err, IdError::BadSigil { kind: "UserId", .. }));
        assert_eq!(RoomId::parse(""), Err(IdError::Empty("RoomId")));
    }

    #[test]
    fn test_server_name() {
        let user = UserId::new("@alice:example.org");
        assert_eq!(user.server_name(), Some("example.org"));
        assert_eq!(EventId::new("$opaque").server_name(), None);
    }

    #[test]
    fn test_short_skips_sigil() {
        let id = EventId::new("$0123456789abcdef");
        assert_eq!(id.short(), "01234567");
    }

    #[test]
    fn test_local_echo() {
        let id = EventId::local_echo("m123");
        assert_eq!(id.as_str(), "~m123");
        assert!(id.is_local_echo());
        assert!(!EventId::new("$remote").is_local_echo());
    }

    #[test]
    fn test_borrow_str_lookup() {
        let mut map = HashMap::new();
        map.insert(EventId::new("$a"), 1);
        assert_eq!(map.get("$a"), Some(&1));
    }

    #[test]
    fn test_serde_is_transparent() {
        let id = UserId::new("@bob:example.org");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"@bob:example.org\"");
        let parsed: UserId = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, id);
    }
}
