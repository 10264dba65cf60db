//! Room membership views.
//!
//! The timeline resolves "who sent this" against a state snapshot. When the
//! snapshot has the member's `m.room.member` event the answer is a
//! [`MemberView::Known`]; otherwise a placeholder [`MemberView::Sentinel`] is
//! synthesized so rendering never has to wait on lazy-loaded membership.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use strum::EnumString;

use crate::ids::{EventId, UserId};

/// Membership state from `m.room.member` content.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Membership {
    Join,
    Invite,
    #[default]
    Leave,
    Ban,
    Knock,
}

impl Membership {
    /// Parse from string (case-insensitive).
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        <Self as FromStr>::from_str(s).ok()
    }

    /// Convert to string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Membership::Join => "join",
            Membership::Invite => "invite",
            Membership::Leave => "leave",
            Membership::Ban => "ban",
            Membership::Knock => "knock",
        }
    }
}

impl std::fmt::Display for Membership {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A member as of some point in the timeline, backed by a membership event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomMember {
    pub user_id: UserId,
    pub membership: Membership,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    /// The `m.room.member` event this view was derived from.
    pub member_event: EventId,
}

impl RoomMember {
    /// Build from `m.room.member` content. Unknown membership strings fall
    /// back to `leave`.
    pub fn from_content(user_id: UserId, member_event: EventId, content: &serde_json::Value) -> Self {
        let membership = content
            .get("membership")
            .and_then(|v| v.as_str())
            .and_then(Membership::from_str)
            .unwrap_or_default();
        let display_name = content
            .get("displayname")
            .and_then(|v| v.as_str())
            .map(String::from);
        let avatar_url = content
            .get("avatar_url")
            .and_then(|v| v.as_str())
            .map(String::from);
        Self { user_id, membership, display_name, avatar_url, member_event }
    }
}

/// Resolved sender/target identity.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MemberView {
    /// Backed by a membership event in the snapshot.
    Known(RoomMember),
    /// Placeholder; membership not loaded (yet) at this point in the timeline.
    Sentinel { user_id: UserId },
}

impl MemberView {
    pub fn user_id(&self) -> &UserId {
        match self {
            MemberView::Known(m) => &m.user_id,
            MemberView::Sentinel { user_id } => user_id,
        }
    }

    /// True when backed by a real membership event.
    pub fn has_member_event(&self) -> bool {
        matches!(self, MemberView::Known(_))
    }

    /// Display name, falling back to the raw user ID.
    pub fn display_name(&self) -> &str {
        match self {
            MemberView::Known(m) => m.display_name.as_deref().unwrap_or(m.user_id.as_str()),
            MemberView::Sentinel { user_id } => user_id.as_str(),
        }
    }

    pub fn membership(&self) -> Option<Membership> {
        match self {
            MemberView::Known(m) => Some(m.membership),
            MemberView::Sentinel { .. } => None,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
