//! Room state snapshots.
//!
//! A segment holds two snapshots: the state at its start and at its end.
//! The segment only needs a handful of operations from them, captured by
//! [`StateSnapshot`]; [`RoomState`] is the in-memory implementation.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::broadcast;
use tracing::{debug, trace};

use rekishi_types::{EventId, MemberView, RoomId, RoomMember, UserId, event_type};

use crate::config::EngineConfig;
use crate::event::Event;

/// Options for applying state events.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ApplyOptions {
    /// The owning segment had no events when these were applied.
    pub timeline_was_empty: bool,
}

/// What a segment needs from a state snapshot.
pub trait StateSnapshot: Send + Sync + Sized + 'static {
    /// Blank snapshot for `room_id`.
    fn empty(room_id: Option<RoomId>, config: &EngineConfig) -> Self;

    fn apply_state_events(&mut self, events: &[Arc<Event>], opts: ApplyOptions);

    /// Independent copy. Listeners on `self` do not carry over.
    fn clone_state(&self) -> Self;

    /// Member view of `user_id` as of this snapshot.
    fn sentinel_member(&self, user_id: &UserId) -> MemberView;

    fn pagination_token(&self) -> Option<&str>;

    fn set_pagination_token(&mut self, token: Option<String>);
}

/// Published by [`RoomState`] for every state event it applies.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StateUpdate {
    pub event_id: EventId,
    pub event_type: String,
    pub state_key: String,
    pub timeline_was_empty: bool,
}

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

/// In-memory room state keyed by `(type, state_key)`.
pub struct RoomState {
    instance_id: u64,
    room_id: Option<RoomId>,
    events: HashMap<(String, String), Arc<Event>>,
    members: HashMap<UserId, RoomMember>,
    pagination_token: Option<String>,
    capacity: usize,
    updates: broadcast::Sender<StateUpdate>,
}

impl RoomState {
    pub fn new(room_id: Option<RoomId>, config: &EngineConfig) -> Self {
        let capacity = config.state_channel_capacity.max(1);
        let (updates, _) = broadcast::channel(capacity);
        Self {
            instance_id: NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed),
            room_id,
            events: HashMap::new(),
            members: HashMap::new(),
            pagination_token: None,
            capacity,
            updates,
        }
    }

    /// Identity of this object. Clones get a new one; moves keep it.
    pub fn instance_id(&self) -> u64 {
        self.instance_id
    }

    pub fn room_id(&self) -> Option<&RoomId> {
        self.room_id.as_ref()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateUpdate> {
        self.updates.subscribe()
    }

    pub fn state_event(&self, event_type: &str, state_key: &str) -> Option<&Arc<Event>> {
        self.events.get(&(event_type.to_string(), state_key.to_string()))
    }

    pub fn member(&self, user_id: &UserId) -> Option<&RoomMember> {
        self.members.get(user_id)
    }

    pub fn members(&self) -> impl Iterator<Item = &RoomMember> {
        self.members.values()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

impl StateSnapshot for RoomState {
    fn empty(room_id: Option<RoomId>, config: &EngineConfig) -> Self {
        Self::new(room_id, config)
    }

    fn apply_state_events(&mut self, events: &[Arc<Event>], opts: ApplyOptions) {
        for event in events {
            let Some(state_key) = event.state_key() else {
                trace!(event_id = %event.event_id(), "skipping non-state event");
                continue;
            };
            let ev_type = event.event_type();

            if ev_type == event_type::ROOM_MEMBER {
                let user_id = UserId::new(state_key);
                let member = RoomMember::from_content(
                    user_id.clone(),
                    event.event_id().clone(),
                    &event.directional_content(),
                );
                self.members.insert(user_id, member);
            }

            self.events
                .insert((ev_type.clone(), state_key.to_string()), event.clone());

            // No receivers is fine
            let _ = self.updates.send(StateUpdate {
                event_id: event.event_id().clone(),
                event_type: ev_type,
                state_key: state_key.to_string(),
                timeline_was_empty: opts.timeline_was_empty,
            });
        }
    }

    fn clone_state(&self) -> Self {
        let (updates, _) = broadcast::channel(self.capacity);
        let copy = Self {
            instance_id: NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed),
            room_id: self.room_id.clone(),
            events: self.events.clone(),
            members: self.members.clone(),
            pagination_token: self.pagination_token.clone(),
            capacity: self.capacity,
            updates,
        };
        debug!(from = self.instance_id, to = copy.instance_id, "cloned room state");
        copy
    }

    fn sentinel_member(&self, user_id: &UserId) -> MemberView {
        match self.members.get(user_id) {
            Some(member) => MemberView::Known(member.clone()),
            None => MemberView::Sentinel { user_id: user_id.clone() },
        }
    }

    fn pagination_token(&self) -> Option<&str> {
        self.pagination_token.as_deref()
    }

    fn set_pagination_token(&mut self, token: Option<String>) {
        self.pagination_token = token;
    }
}

/// Content equality: same room, same state events, same members, same token.
impl PartialEq for RoomState {
    fn eq(&self, other: &Self) -> bool {
        self.room_id == other.room_id
            && self.pagination_token == other.pagination_token
            && self.members == other.members
            && self.events.len() == other.events.len()
            && self.events.iter().all(|(key, ev)| {
                other
                    .events
                    .get(key)
                    .is_some_and(|o| o.event_id() == ev.event_id())
            })
    }
}

impl std::fmt::Debug for RoomState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomState")
            .field("instance_id", &self.instance_id)
            .field("room_id", &self.room_id)
            .field("events", &self.events.len())
            .field("members", &self.members.len())
            .field("pagination_token", &self.pagination_token)
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rekishi_types::{EventRecord, Membership};
    use serde_json::json;

    fn member_event(id: &str, user: &str, membership: &str) -> Arc<Event> {
        Event::shared(
            EventRecord::new(id, event_type::ROOM_MEMBER, user, 1)
                .with_state_key(user)
                .with_content(json!({"membership": membership, "displayname": "Al"}))
                .with_prev_content(json!({"membership": "invite"})),
        )
    }

    fn state() -> RoomState {
        RoomState::new(Some(RoomId::new("!r:x")), &EngineConfig::default())
    }

    #[test]
    fn test_apply_member_event() {
        let mut st = state();
        let mut rx = st.subscribe();
        st.apply_state_events(&[member_event("$j", "@al:x", "join")], ApplyOptions::default());

        let view = st.sentinel_member(&UserId::new("@al:x"));
        assert!(view.has_member_event());
        assert_eq!(view.membership(), Some(Membership::Join));
        assert_eq!(rx.try_recv().unwrap().event_id, EventId::new("$j"));
        assert!(st.state_event(event_type::ROOM_MEMBER, "@al:x").is_some());
    }

    #[test]
    fn test_backward_event_uses_prev_content() {
        let mut st = state();
        let ev = member_event("$j", "@al:x", "join");
        ev.set_forward_looking(false);
        st.apply_state_events(&[ev], ApplyOptions::default());
        assert_eq!(st.member(&UserId::new("@al:x")).unwrap().membership, Membership::Invite);
    }

    #[test]
    fn test_unknown_member_is_sentinel() {
        let st = state();
        let view = st.sentinel_member(&UserId::new("@ghost:x"));
        assert_eq!(view, MemberView::Sentinel { user_id: UserId::new("@ghost:x") });
    }

    #[test]
    fn test_clone_is_equal_but_distinct() {
        let mut st = state();
        st.apply_state_events(&[member_event("$j", "@al:x", "join")], ApplyOptions::default());
        st.set_pagination_token(Some("t1".into()));

        let mut copy = st.clone_state();
        assert_eq!(copy, st);
        assert_ne!(copy.instance_id(), st.instance_id());

        // Listeners stay with the original
        let mut rx = st.subscribe();
        copy.apply_state_events(&[member_event("$k", "@bo:x", "join")], ApplyOptions::default());
        assert!(rx.try_recv().is_err());
        assert_ne!(copy, st);
    }

    #[test]
    fn test_non_state_events_ignored() {
        let mut st = state();
        let msg = Event::shared(EventRecord::new("$m", event_type::ROOM_MESSAGE, "@al:x", 1));
        st.apply_state_events(&[msg], ApplyOptions::default());
        assert!(st.is_empty());
    }
}
