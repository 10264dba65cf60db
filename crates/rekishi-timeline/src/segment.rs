//! Timeline segments.
//!
//! A [`TimelineSegment`] is a contiguous, chronologically ordered run of
//! events together with the room state at either end and the pagination
//! tokens needed to extend it. Segments link to their neighbours by
//! [`SegmentId`]; the arena that owns them is
//! [`TimelineSet`](crate::TimelineSet).
//!
//! # Indexing
//!
//! Prepending shifts every position by one, so raw `Vec` indices are not
//! stable. `base_index` counts prepends; the *relative index* of the event at
//! position `i` is `i - base_index` and stays fixed for as long as the event
//! remains in the segment:
//!
//! ```text
//!   position:   0    1    2    3
//!   events:   [ p1,  e0,  e1,  e2 ]   base_index = 1
//!   relative:  -1    0    1    2
//! ```

use std::sync::Arc;

use tracing::{debug, trace};

use rekishi_types::{EventId, RoomId, UserId, event_type};

use crate::config::EngineConfig;
use crate::direction::Direction;
use crate::event::Event;
use crate::ids::SegmentId;
use crate::state::{ApplyOptions, RoomState, StateSnapshot};
use crate::{Result, TimelineError};

/// Options for [`TimelineSegment::append_event`].
pub struct AppendOptions<'a, S> {
    /// Prepend (back-pagination) instead of append.
    pub to_start: bool,
    /// Snapshot to resolve and apply against instead of the segment's own
    /// boundary state.
    pub state: Option<&'a mut S>,
    pub timeline_was_empty: bool,
}

impl<S> Default for AppendOptions<'_, S> {
    fn default() -> Self {
        Self { to_start: false, state: None, timeline_was_empty: false }
    }
}

impl<'a, S> AppendOptions<'a, S> {
    pub fn forward() -> Self {
        Self::default()
    }

    pub fn backward() -> Self {
        Self { to_start: true, ..Self::default() }
    }

    pub fn with_state(mut self, state: &'a mut S) -> Self {
        self.state = Some(state);
        self
    }

    pub fn timeline_was_empty(mut self, was_empty: bool) -> Self {
        self.timeline_was_empty = was_empty;
        self
    }
}

/// A contiguous run of events with boundary state.
pub struct TimelineSegment<S: StateSnapshot = RoomState> {
    id: SegmentId,
    room_id: Option<RoomId>,
    unfiltered: bool,
    name: String,
    events: Vec<Arc<Event>>,
    base_index: usize,
    start_state: S,
    end_state: S,
    prev: Option<SegmentId>,
    next: Option<SegmentId>,
}

impl<S: StateSnapshot> TimelineSegment<S> {
    /// Empty segment with blank boundary state.
    ///
    /// `unfiltered` marks the canonical view of the room; only canonical
    /// segments apply state events to their snapshots.
    pub fn new(room_id: Option<RoomId>, unfiltered: bool, config: &EngineConfig) -> Self {
        let start = S::empty(room_id.clone(), config);
        let end = S::empty(room_id.clone(), config);
        Self::with_states(room_id, unfiltered, start, end)
    }

    pub fn with_states(room_id: Option<RoomId>, unfiltered: bool, start_state: S, end_state: S) -> Self {
        let name = format!(
            "{}:{}",
            room_id.as_ref().map(RoomId::as_str).unwrap_or_default(),
            crate::now_millis()
        );
        Self {
            id: SegmentId::new(),
            room_id,
            unfiltered,
            name,
            events: Vec::new(),
            base_index: 0,
            start_state,
            end_state,
            prev: None,
            next: None,
        }
    }

    pub fn id(&self) -> SegmentId {
        self.id
    }

    /// Diagnostic name, `{room}:{created millis}`.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn room_id(&self) -> Option<&RoomId> {
        self.room_id.as_ref()
    }

    pub fn is_unfiltered(&self) -> bool {
        self.unfiltered
    }

    // ========================================================================
    // State
    // ========================================================================

    /// Seed both boundary states. Only valid on an empty segment.
    ///
    /// The seeding events are frozen: later metadata writes to them are
    /// refused.
    pub fn initialise_state(&mut self, state_events: &[Arc<Event>], opts: ApplyOptions) -> Result<()> {
        if !self.events.is_empty() {
            return Err(TimelineError::StateAfterEvents);
        }
        for event in state_events {
            event.freeze();
        }
        self.start_state.apply_state_events(state_events, opts);
        self.end_state.apply_state_events(state_events, opts);
        debug!(segment = %self.name, count = state_events.len(), "initialised state");
        Ok(())
    }

    /// `Backward` is the state at the start, `Forward` at the end.
    pub fn state(&self, direction: Direction) -> &S {
        match direction {
            Direction::Backward => &self.start_state,
            Direction::Forward => &self.end_state,
        }
    }

    pub fn state_mut(&mut self, direction: Direction) -> &mut S {
        match direction {
            Direction::Backward => &mut self.start_state,
            Direction::Forward => &mut self.end_state,
        }
    }

    /// `None` means unknown: ask the transport.
    pub fn pagination_token(&self, direction: Direction) -> Option<&str> {
        self.state(direction).pagination_token()
    }

    pub fn set_pagination_token(&mut self, token: Option<String>, direction: Direction) {
        self.state_mut(direction).set_pagination_token(token);
    }

    // ========================================================================
    // Neighbours
    // ========================================================================

    pub fn neighbour(&self, direction: Direction) -> Option<SegmentId> {
        match direction {
            Direction::Backward => self.prev,
            Direction::Forward => self.next,
        }
    }

    /// Link a neighbour. Write-once per direction; clears that direction's
    /// pagination token since the neighbour now covers the gap.
    pub fn set_neighbour(&mut self, neighbour: SegmentId, direction: Direction) -> Result<()> {
        let slot = match direction {
            Direction::Backward => &mut self.prev,
            Direction::Forward => &mut self.next,
        };
        if slot.is_some() {
            return Err(TimelineError::NeighbourAlreadySet { direction });
        }
        *slot = Some(neighbour);
        self.set_pagination_token(None, direction);
        debug!(segment = %self.name, %direction, neighbour = %neighbour, "linked neighbour");
        Ok(())
    }

    // ========================================================================
    // Events
    // ========================================================================

    pub fn events(&self) -> &[Arc<Event>] {
        &self.events
    }

    pub fn base_index(&self) -> usize {
        self.base_index
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Stable index of the newest copy of `event_id` (see module docs).
    pub fn relative_index(&self, event_id: &EventId) -> Option<i64> {
        self.events
            .iter()
            .rposition(|e| e.event_id() == event_id)
            .map(|i| i as i64 - self.base_index as i64)
    }

    pub fn event_at_relative(&self, relative: i64) -> Option<&Arc<Event>> {
        let pos = relative + self.base_index as i64;
        if pos < 0 {
            return None;
        }
        self.events.get(pos as usize)
    }

    pub fn contains(&self, event_id: &EventId) -> bool {
        self.events.iter().any(|e| e.event_id() == event_id)
    }

    /// Add an event at either end, resolving its sender/target against the
    /// relevant snapshot and applying it to that snapshot when it is a state
    /// event on an unfiltered segment.
    pub fn append_event(&mut self, event: Arc<Event>, opts: AppendOptions<'_, S>) {
        let to_start = opts.to_start;

        if self.room_id.is_some() {
            let state: &mut S = match opts.state {
                Some(state) => state,
                None if to_start => &mut self.start_state,
                None => &mut self.end_state,
            };

            resolve_metadata(&event, &*state, to_start, false);

            if event.is_state() && self.unfiltered {
                state.apply_state_events(
                    std::slice::from_ref(&event),
                    ApplyOptions { timeline_was_empty: opts.timeline_was_empty },
                );
                // Applying may have produced the sender's member. A forward
                // membership event must describe the member as of itself.
                let force = event.event_type() == event_type::ROOM_MEMBER && !to_start;
                resolve_metadata(&event, &*state, to_start, force);
            }
        }

        trace!(segment = %self.name, event_id = %event.event_id(), to_start, "appending event");
        if to_start {
            self.events.insert(0, event);
            self.base_index += 1;
        } else {
            self.events.push(event);
        }
    }

    /// Remove the newest event with this id.
    pub fn remove_event(&mut self, event_id: &EventId) -> Option<Arc<Event>> {
        let pos = self.events.iter().rposition(|e| e.event_id() == event_id)?;
        let removed = self.events.remove(pos);
        if pos < self.base_index {
            self.base_index -= 1;
        }
        trace!(segment = %self.name, %event_id, pos, "removed event");
        Some(removed)
    }

    // ========================================================================
    // Forking
    // ========================================================================

    /// Independent empty segment whose start and end state are both copies
    /// of this segment's state in `direction`.
    pub fn fork(&self, direction: Direction) -> Self {
        let boundary = self.state(direction);
        let fork = Self::with_states(
            self.room_id.clone(),
            self.unfiltered,
            boundary.clone_state(),
            boundary.clone_state(),
        );
        debug!(from = %self.name, to = %fork.name, %direction, "forked segment");
        fork
    }

    /// Fork a new live segment that takes over the boundary state object.
    ///
    /// The new segment's end state *is* the old boundary snapshot (moved, so
    /// its listeners keep firing); its start state is a copy. This segment
    /// keeps an equal-content copy at that boundary so back-pagination still
    /// resolves members as they were.
    pub fn fork_live(&mut self, direction: Direction) -> Self {
        let copy = self.state(direction).clone_state();
        let live = std::mem::replace(self.state_mut(direction), copy);
        let start = live.clone_state();
        let fork = Self::with_states(self.room_id.clone(), self.unfiltered, start, live);
        debug!(from = %self.name, to = %fork.name, %direction, "forked live segment");
        fork
    }
}

impl<S: StateSnapshot> std::fmt::Debug for TimelineSegment<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimelineSegment")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("events", &self.events.len())
            .field("base_index", &self.base_index)
            .field("prev", &self.prev)
            .field("next", &self.next)
            .finish()
    }
}

/// Resolve sender (and target, for membership events) against `state`.
///
/// Without `force`, a member already backed by a membership event is kept.
fn resolve_metadata<S: StateSnapshot>(event: &Event, state: &S, to_start: bool, force: bool) {
    let sender_known = event.sender_member().is_some_and(|m| m.has_member_event());
    if force || !sender_known {
        event.set_sender_member(state.sentinel_member(event.sender()));
    }

    if event.event_type() == event_type::ROOM_MEMBER {
        let target_known = event.target_member().is_some_and(|m| m.has_member_event());
        if let (true, Some(key)) = (force || !target_known, event.state_key()) {
            event.set_target_member(state.sentinel_member(&UserId::new(key)));
        }
    }

    if event.is_state() && to_start {
        event.set_forward_looking(false);
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

    const ROOM: &str = "!room:x";

    fn segment() -> TimelineSegment {
        TimelineSegment::new(Some(RoomId::new(ROOM)), true, &EngineConfig::default())
    }

    fn msg(id: &str, sender: &str) -> Arc<Event> {
        Event::shared(EventRecord::new(id, event_type::ROOM_MESSAGE, sender, 1).with_room(ROOM))
    }

    fn join(id: &str, user: &str, name: &str) -> Arc<Event> {
        Event::shared(
            EventRecord::new(id, event_type::ROOM_MEMBER, user, 1)
                .with_room(ROOM)
                .with_state_key(user)
                .with_content(json!({"membership": "join", "displayname": name}))
                .with_prev_content(json!({"membership": "invite", "displayname": "Invitee"})),
        )
    }

    fn ids(seg: &TimelineSegment) -> Vec<String> {
        seg.events().iter().map(|e| e.event_id().to_string()).collect()
    }

    #[test]
    fn test_prepend_base_index() {
        let mut seg = segment();
        seg.append_event(msg("$e0", "@a:x"), AppendOptions::forward());
        seg.append_event(msg("$e1", "@a:x"), AppendOptions::forward());
        seg.append_event(msg("$p1", "@a:x"), AppendOptions::backward());
        seg.append_event(msg("$p2", "@a:x"), AppendOptions::backward());

        assert_eq!(ids(&seg), ["$p2", "$p1", "$e0", "$e1"]);
        assert_eq!(seg.base_index(), 2);
        assert_eq!(seg.relative_index(&EventId::new("$e0")), Some(0));
        assert_eq!(seg.relative_index(&EventId::new("$p2")), Some(-2));
        assert_eq!(seg.event_at_relative(-1).unwrap().event_id(), &EventId::new("$p1"));
        assert!(seg.event_at_relative(-3).is_none());
        assert!(seg.event_at_relative(2).is_none());
    }

    #[test]
    fn test_remove_before_base_index() {
        let mut seg = segment();
        seg.append_event(msg("$e0", "@a:x"), AppendOptions::forward());
        seg.append_event(msg("$p1", "@a:x"), AppendOptions::backward());
        seg.append_event(msg("$p2", "@a:x"), AppendOptions::backward());

        let removed = seg.remove_event(&EventId::new("$p1")).unwrap();
        assert_eq!(removed.event_id(), &EventId::new("$p1"));
        assert_eq!(seg.base_index(), 1);
        assert_eq!(seg.relative_index(&EventId::new("$e0")), Some(0));
    }

    #[test]
    fn test_remove_after_base_index() {
        let mut seg = segment();
        seg.append_event(msg("$e0", "@a:x"), AppendOptions::forward());
        seg.append_event(msg("$e1", "@a:x"), AppendOptions::forward());
        seg.append_event(msg("$p1", "@a:x"), AppendOptions::backward());

        seg.remove_event(&EventId::new("$e1"));
        assert_eq!(seg.base_index(), 1);
        assert_eq!(ids(&seg), ["$p1", "$e0"]);
        assert!(seg.remove_event(&EventId::new("$missing")).is_none());
    }

    #[test]
    fn test_initialise_state_after_events_fails() {
        let mut seg = segment();
        seg.append_event(msg("$e0", "@a:x"), AppendOptions::forward());
        let err = seg
            .initialise_state(&[join("$j", "@a:x", "A")], ApplyOptions::default())
            .unwrap_err();
        assert_eq!(err, TimelineError::StateAfterEvents);
    }

    #[test]
    fn test_initialise_state_freezes_and_applies_both() {
        let mut seg = segment();
        let j = join("$j", "@a:x", "A");
        seg.initialise_state(std::slice::from_ref(&j), ApplyOptions::default()).unwrap();

        assert!(j.is_frozen());
        for dir in [Direction::Backward, Direction::Forward] {
            assert!(seg.state(dir).member(&UserId::new("@a:x")).is_some());
        }
        // Independent snapshots
        assert_ne!(
            seg.state(Direction::Backward).instance_id(),
            seg.state(Direction::Forward).instance_id()
        );
    }

    #[test]
    fn test_set_neighbour_twice_fails_and_clears_token() {
        let mut seg = segment();
        seg.set_pagination_token(Some("fwd".into()), Direction::Forward);
        seg.set_pagination_token(Some("back".into()), Direction::Backward);

        let other = SegmentId::new();
        seg.set_neighbour(other, Direction::Forward).unwrap();
        assert_eq!(seg.neighbour(Direction::Forward), Some(other));
        assert_eq!(seg.pagination_token(Direction::Forward), None);
        assert_eq!(seg.pagination_token(Direction::Backward), Some("back"));

        let err = seg.set_neighbour(SegmentId::new(), Direction::Forward).unwrap_err();
        assert_eq!(err, TimelineError::NeighbourAlreadySet { direction: Direction::Forward });
        assert_eq!(seg.neighbour(Direction::Forward), Some(other));
    }

    #[test]
    fn test_forward_member_event_resolves_to_itself() {
        let mut seg = segment();
        let j = join("$j", "@bob:x", "Bob");
        seg.append_event(j.clone(), AppendOptions::forward());

        let sender = j.sender_member().unwrap();
        assert!(sender.has_member_event());
        assert_eq!(sender.display_name(), "Bob");
        assert_eq!(j.target_member().unwrap().membership(), Some(Membership::Join));
        assert!(j.is_forward_looking());
    }

    #[test]
    fn test_prepended_state_is_backward_looking() {
        let mut seg = segment();
        let j = join("$j", "@bob:x", "Bob");
        seg.append_event(j.clone(), AppendOptions::backward());

        assert!(!j.is_forward_looking());
        // Start state regressed to the prev_content
        let member = seg.state(Direction::Backward).member(&UserId::new("@bob:x")).unwrap();
        assert_eq!(member.membership, Membership::Invite);
        assert!(seg.state(Direction::Forward).member(&UserId::new("@bob:x")).is_none());
    }

    #[test]
    fn test_unknown_sender_gets_sentinel() {
        let mut seg = segment();
        let m = msg("$m", "@ghost:x");
        seg.append_event(m.clone(), AppendOptions::forward());
        assert!(!m.sender_member().unwrap().has_member_event());
    }

    #[test]
    fn test_filtered_segment_does_not_apply_state() {
        let mut seg: TimelineSegment =
            TimelineSegment::new(Some(RoomId::new(ROOM)), false, &EngineConfig::default());
        seg.append_event(join("$j", "@bob:x", "Bob"), AppendOptions::forward());
        assert!(seg.state(Direction::Forward).is_empty());
    }

    #[test]
    fn test_roomless_segment_skips_metadata() {
        let mut seg: TimelineSegment = TimelineSegment::new(None, true, &EngineConfig::default());
        let j = join("$j", "@bob:x", "Bob");
        seg.append_event(j.clone(), AppendOptions::forward());
        assert!(j.sender_member().is_none());
        assert!(seg.state(Direction::Forward).is_empty());
        assert_eq!(seg.len(), 1);
    }

    #[test]
    fn test_explicit_state_overrides_boundary() {
        let mut seg = segment();
        let mut external = RoomState::new(Some(RoomId::new(ROOM)), &EngineConfig::default());
        seg.append_event(
            join("$j", "@bob:x", "Bob"),
            AppendOptions::forward().with_state(&mut external),
        );
        assert!(external.member(&UserId::new("@bob:x")).is_some());
        assert!(seg.state(Direction::Forward).is_empty());
    }

    #[test]
    fn test_fork_copies_boundary() {
        let mut seg = segment();
        seg.append_event(join("$j", "@bob:x", "Bob"), AppendOptions::forward());
        let fork = seg.fork(Direction::Forward);

        assert!(fork.is_empty());
        assert_eq!(fork.state(Direction::Backward), seg.state(Direction::Forward));
        assert_eq!(fork.state(Direction::Forward), seg.state(Direction::Forward));
        assert_ne!(
            fork.state(Direction::Forward).instance_id(),
            seg.state(Direction::Forward).instance_id()
        );
    }

    #[test]
    fn test_fork_live_moves_end_state() {
        let mut seg = segment();
        seg.append_event(join("$j", "@bob:x", "Bob"), AppendOptions::forward());
        let original_id = seg.state(Direction::Forward).instance_id();
        let mut rx = seg.state(Direction::Forward).subscribe();

        let mut live = seg.fork_live(Direction::Forward);

        assert_eq!(live.state(Direction::Forward).instance_id(), original_id);
        assert_ne!(seg.state(Direction::Forward).instance_id(), original_id);
        assert_eq!(seg.state(Direction::Forward), live.state(Direction::Forward));
        assert_eq!(live.state(Direction::Backward), live.state(Direction::Forward));

        // Listeners on the moved snapshot still fire
        live.append_event(join("$k", "@cat:x", "Cat"), AppendOptions::forward());
        assert_eq!(rx.try_recv().unwrap().event_id, EventId::new("$k"));
        assert!(seg.state(Direction::Forward).member(&UserId::new("@cat:x")).is_none());
    }

    #[test]
    fn test_name_includes_room() {
        assert!(segment().name().starts_with("!room:x:"));
    }

    #[test]
    fn test_duplicate_event_resolves_to_newest_copy() {
        let mut seg = segment();
        seg.append_event(msg("$dup", "@a:x"), AppendOptions::forward());
        seg.append_event(msg("$e", "@a:x"), AppendOptions::forward());
        seg.append_event(msg("$dup", "@a:x"), AppendOptions::forward());

        let dup = EventId::new("$dup");
        assert_eq!(seg.relative_index(&dup), Some(2));
        assert!(seg.remove_event(&dup).is_some());
        assert_eq!(ids(&seg), ["$dup", "$e"]);
        assert_eq!(seg.relative_index(&dup), Some(0));
    }
}
