//! The segment arena for one room view.
//!
//! A [`TimelineSet`] owns every [`TimelineSegment`] of a room view, the
//! links between them, an index from event id to segment, and the room's
//! relation containers. Exactly one segment is *live*: new events from sync
//! land there.
//!
//! ```text
//!   [seg A] <-> [seg B] <-> [live]
//!                  ^ gap filled by back-pagination from live
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, trace};

use rekishi_types::{EventId, RoomId, event_type};

use crate::config::EngineConfig;
use crate::crypto::Decryptor;
use crate::direction::Direction;
use crate::event::Event;
use crate::ids::SegmentId;
use crate::relations_index::RelationsIndex;
use crate::segment::{AppendOptions, TimelineSegment};
use crate::state::{RoomState, StateSnapshot};
use crate::{Result, TimelineError};

/// Segments, links, event index and relations for one room view.
pub struct TimelineSet<S: StateSnapshot = RoomState> {
    room_id: Option<RoomId>,
    unfiltered: bool,
    config: EngineConfig,
    segments: HashMap<SegmentId, TimelineSegment<S>>,
    live: SegmentId,
    event_index: HashMap<EventId, SegmentId>,
    relations: RelationsIndex,
}

impl<S: StateSnapshot> TimelineSet<S> {
    /// New set with a single empty live segment.
    pub fn new(room_id: Option<RoomId>, unfiltered: bool, config: EngineConfig) -> Self {
        let live = TimelineSegment::new(room_id.clone(), unfiltered, &config);
        let live_id = live.id();
        let mut segments = HashMap::new();
        segments.insert(live_id, live);
        Self {
            room_id,
            unfiltered,
            relations: RelationsIndex::new(config.clone()),
            config,
            segments,
            live: live_id,
            event_index: HashMap::new(),
        }
    }

    pub fn with_decryptor(mut self, decryptor: Arc<dyn Decryptor>) -> Self {
        self.relations.set_decryptor(decryptor);
        self
    }

    pub fn room_id(&self) -> Option<&RoomId> {
        self.room_id.as_ref()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ========================================================================
    // Segments
    // ========================================================================

    pub fn live_segment_id(&self) -> SegmentId {
        self.live
    }

    pub fn live_segment(&self) -> Result<&TimelineSegment<S>> {
        self.segment(self.live)
    }

    pub fn segment(&self, id: SegmentId) -> Result<&TimelineSegment<S>> {
        self.segments.get(&id).ok_or(TimelineError::SegmentNotFound(id))
    }

    pub fn segment_mut(&mut self, id: SegmentId) -> Result<&mut TimelineSegment<S>> {
        self.segments.get_mut(&id).ok_or(TimelineError::SegmentNotFound(id))
    }

    pub fn segments(&self) -> impl Iterator<Item = &TimelineSegment<S>> {
        self.segments.values()
    }

    /// Empty segment with blank state, not linked to anything.
    pub fn add_segment(&mut self) -> SegmentId {
        let segment = TimelineSegment::new(self.room_id.clone(), self.unfiltered, &self.config);
        self.insert_segment(segment)
    }

    fn insert_segment(&mut self, segment: TimelineSegment<S>) -> SegmentId {
        let id = segment.id();
        self.segments.insert(id, segment);
        id
    }

    /// Link `prev` before `next`. Both links are checked before either is
    /// written.
    pub fn link(&mut self, prev: SegmentId, next: SegmentId) -> Result<()> {
        if self.segment(prev)?.neighbour(Direction::Forward).is_some() {
            return Err(TimelineError::NeighbourAlreadySet { direction: Direction::Forward });
        }
        if self.segment(next)?.neighbour(Direction::Backward).is_some() {
            return Err(TimelineError::NeighbourAlreadySet { direction: Direction::Backward });
        }
        self.segment_mut(prev)?.set_neighbour(next, Direction::Forward)?;
        self.segment_mut(next)?.set_neighbour(prev, Direction::Backward)?;
        Ok(())
    }

    /// Start a new live segment, e.g. after a gappy sync.
    ///
    /// The new live segment takes over the old one's end state (listeners
    /// included); the old segment keeps a copy and becomes an ordinary
    /// historical segment. Tokens are set when given.
    pub fn reset_live_segment(
        &mut self,
        backward_token: Option<String>,
        forward_token: Option<String>,
    ) -> Result<SegmentId> {
        let old_id = self.live;
        let old = self.segment_mut(old_id)?;
        let mut live = old.fork_live(Direction::Forward);
        if forward_token.is_some() {
            old.set_pagination_token(forward_token, Direction::Forward);
        }
        live.set_pagination_token(backward_token, Direction::Backward);

        let live_id = self.insert_segment(live);
        self.live = live_id;
        info!(old = %old_id, new = %live_id, "reset live segment");
        Ok(live_id)
    }

    /// Branch an empty, non-live segment off `id`'s state in `direction`.
    pub fn fork_segment(&mut self, id: SegmentId, direction: Direction) -> Result<SegmentId> {
        let fork = self.segment(id)?.fork(direction);
        Ok(self.insert_segment(fork))
    }

    // ========================================================================
    // Events
    // ========================================================================

    /// Add events to one end of a segment.
    ///
    /// With `to_start` each event is prepended in turn, so back-pagination
    /// results go in newest first. Every event is indexed, attached as target
    /// to any relation containers waiting on it, and aggregated if it is a
    /// relation. Redaction events redact their target.
    pub async fn add_events_to_segment(
        &mut self,
        id: SegmentId,
        events: Vec<Arc<Event>>,
        to_start: bool,
    ) -> Result<()> {
        for event in events {
            let segment = self.segment_mut(id)?;
            let opts = AppendOptions {
                to_start,
                state: None,
                timeline_was_empty: segment.is_empty(),
            };
            segment.append_event(event.clone(), opts);
            self.event_index.insert(event.event_id().clone(), id);

            self.relations.set_target(&event).await;
            if let Some(relation) = event.relation() {
                let target = self.find_event(&relation.event_id);
                self.relations.aggregate(event.clone(), target).await;
            }

            if event.event_type() == event_type::ROOM_REDACTION {
                if let Some(redacts) = redacted_event_id(&event) {
                    self.redact_event(&redacts, event.event_id().clone()).await;
                }
            }
        }
        trace!(segment = %id, to_start, "added events to segment");
        Ok(())
    }

    /// Append a single event to the live segment.
    pub async fn add_live_event(&mut self, event: Arc<Event>) -> Result<()> {
        self.add_events_to_segment(self.live, vec![event], false).await
    }

    /// Redact a known event and let relation containers react.
    pub async fn redact_event(&mut self, event_id: &EventId, redacted_by: EventId) -> Option<Arc<Event>> {
        let Some(event) = self.find_event(event_id) else {
            debug!(%event_id, "redaction target not in any segment");
            return None;
        };
        event.apply_redaction(redacted_by);
        self.relations.process_signals().await;
        Some(event)
    }

    pub fn find_event(&self, event_id: &EventId) -> Option<Arc<Event>> {
        let segment = self.segments.get(self.event_index.get(event_id)?)?;
        segment
            .events()
            .iter()
            .rev()
            .find(|e| e.event_id() == event_id)
            .cloned()
    }

    pub fn segment_for_event(&self, event_id: &EventId) -> Option<SegmentId> {
        self.event_index.get(event_id).copied()
    }

    /// Remove an event from its segment and the index.
    pub fn remove_event(&mut self, event_id: &EventId) -> Option<Arc<Event>> {
        let id = self.event_index.remove(event_id)?;
        self.segments.get_mut(&id)?.remove_event(event_id)
    }

    // ========================================================================
    // Relations
    // ========================================================================

    pub fn relations(&self) -> &RelationsIndex {
        &self.relations
    }

    pub fn relations_mut(&mut self) -> &mut RelationsIndex {
        &mut self.relations
    }

    /// Drain pending event signals into the relation containers, then route
    /// deferred relations that have been decrypted since.
    pub async fn process_signals(&mut self) -> usize {
        let mut handled = self.relations.process_signals().await;
        for event in self.relations.take_decrypted() {
            let target = event.relation().and_then(|r| self.find_event(&r.event_id));
            self.relations.aggregate(event, target).await;
            handled += 1;
        }
        handled
    }
}

/// `redacts` from the content (room v11 layout).
fn redacted_event_id(event: &Event) -> Option<EventId> {
    let content = event.content();
    content
        .get("redacts")
        .and_then(|v| v.as_str())
        .map(EventId::new)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{DecryptedPayload, DecryptionError};
    use crate::relations::RelationOutcome;
    use async_trait::async_trait;
    use rekishi_types::{EventRecord, RelationInfo, RelationType};
    use serde_json::json;

    struct StaticDecryptor(DecryptedPayload);

    #[async_trait]
    impl Decryptor for StaticDecryptor {
        async fn decrypt(&self, _event: &Event) -> std::result::Result<DecryptedPayload, DecryptionError> {
            Ok(self.0.clone())
        }
    }

    fn decrypted_edit(body: &str) -> Arc<dyn Decryptor> {
        Arc::new(StaticDecryptor(DecryptedPayload::new(
            event_type::ROOM_MESSAGE,
            json!({"body": "* edit", "m.new_content": {"body": body}}),
        )))
    }

    fn encrypted_edit(id: &str, target: &str, ts: u64) -> Arc<Event> {
        Event::shared(
            EventRecord::new(id, event_type::ROOM_ENCRYPTED, "@alice:x", ts)
                .with_room(ROOM)
                .with_relation(RelationInfo::new(RelationType::Replace, EventId::new(target))),
        )
    }

    fn plain_edit(id: &str, target: &str, ts: u64, body: &str) -> Arc<Event> {
        Event::shared(
            EventRecord::new(id, event_type::ROOM_MESSAGE, "@alice:x", ts)
                .with_room(ROOM)
                .with_content(json!({"body": "* edit", "m.new_content": {"body": body}}))
                .with_relation(RelationInfo::new(RelationType::Replace, EventId::new(target))),
        )
    }

    const ROOM: &str = "!room:x";

    fn set() -> TimelineSet {
        TimelineSet::new(Some(RoomId::new(ROOM)), true, EngineConfig::default())
    }

    fn msg(id: &str, ts: u64) -> Arc<Event> {
        Event::shared(
            EventRecord::new(id, event_type::ROOM_MESSAGE, "@alice:x", ts)
                .with_room(ROOM)
                .with_content(json!({"body": id})),
        )
    }

    fn reaction(id: &str, target: &str, key: &str) -> Arc<Event> {
        Event::shared(
            EventRecord::new(id, event_type::REACTION, "@bob:x", 5)
                .with_room(ROOM)
                .with_relation(RelationInfo::annotation(EventId::new(target), key)),
        )
    }

    #[test]
    fn test_new_has_live_segment() {
        let ts = set();
        assert_eq!(ts.segments().count(), 1);
        assert!(ts.live_segment().unwrap().is_empty());
    }

    #[test]
    fn test_link_checks_both_sides() {
        let mut ts = set();
        let a = ts.add_segment();
        let b = ts.add_segment();
        let live = ts.live_segment_id();

        ts.link(a, b).unwrap();
        assert_eq!(ts.segment(a).unwrap().neighbour(Direction::Forward), Some(b));
        assert_eq!(ts.segment(b).unwrap().neighbour(Direction::Backward), Some(a));

        // `a` already has a next; nothing written to `live`
        let err = ts.link(a, live).unwrap_err();
        assert_eq!(err, TimelineError::NeighbourAlreadySet { direction: Direction::Forward });
        assert_eq!(ts.segment(live).unwrap().neighbour(Direction::Backward), None);

        let missing = SegmentId::new();
        assert_eq!(ts.link(missing, live), Err(TimelineError::SegmentNotFound(missing)));
    }

    #[tokio::test]
    async fn test_reset_live_segment() {
        let mut ts = set();
        ts.add_live_event(msg("$1", 1)).await.unwrap();
        let old = ts.live_segment_id();
        let old_end = ts.segment(old).unwrap().state(Direction::Forward).instance_id();

        let live = ts
            .reset_live_segment(Some("back".into()), Some("fwd".into()))
            .unwrap();
        assert_ne!(live, old);
        assert_eq!(ts.live_segment_id(), live);

        let new_seg = ts.segment(live).unwrap();
        assert!(new_seg.is_empty());
        assert_eq!(new_seg.pagination_token(Direction::Backward), Some("back"));
        assert_eq!(new_seg.state(Direction::Forward).instance_id(), old_end);
        assert_eq!(ts.segment(old).unwrap().pagination_token(Direction::Forward), Some("fwd"));
    }

    #[tokio::test]
    async fn test_events_are_indexed_and_removable() {
        let mut ts = set();
        let live = ts.live_segment_id();
        ts.add_events_to_segment(live, vec![msg("$1", 1), msg("$2", 2)], false)
            .await
            .unwrap();
        ts.add_events_to_segment(live, vec![msg("$0", 0)], true).await.unwrap();

        assert_eq!(ts.segment_for_event(&EventId::new("$0")), Some(live));
        assert_eq!(ts.live_segment().unwrap().base_index(), 1);
        assert!(ts.find_event(&EventId::new("$2")).is_some());

        let removed = ts.remove_event(&EventId::new("$0")).unwrap();
        assert_eq!(removed.event_id(), &EventId::new("$0"));
        assert!(ts.find_event(&EventId::new("$0")).is_none());
        assert_eq!(ts.live_segment().unwrap().base_index(), 0);
    }

    #[tokio::test]
    async fn test_relation_before_target() {
        let mut ts = set();
        ts.add_live_event(reaction("$r", "$t", "👍")).await.unwrap();
        let rel = ts
            .relations()
            .get(&EventId::new("$t"), RelationType::Annotation, event_type::REACTION)
            .unwrap();
        assert!(rel.target_event().is_none());

        // Target arrives by back-pagination
        let live = ts.live_segment_id();
        ts.add_events_to_segment(live, vec![msg("$t", 1)], true).await.unwrap();
        let rel = ts
            .relations()
            .get(&EventId::new("$t"), RelationType::Annotation, event_type::REACTION)
            .unwrap();
        assert_eq!(rel.target_event().unwrap().event_id(), &EventId::new("$t"));
    }

    #[tokio::test]
    async fn test_edit_after_target_replaces() {
        let mut ts = set();
        let target = msg("$t", 1);
        ts.add_live_event(target.clone()).await.unwrap();
        let edit = Event::shared(
            EventRecord::new("$e", event_type::ROOM_MESSAGE, "@alice:x", 2)
                .with_room(ROOM)
                .with_content(json!({"body": "* new", "m.new_content": {"body": "new"}}))
                .with_relation(RelationInfo::new(RelationType::Replace, EventId::new("$t"))),
        );
        ts.add_live_event(edit).await.unwrap();
        assert_eq!(target.effective_content(), json!({"body": "new"}));
    }

    #[tokio::test]
    async fn test_redaction_event_deaggregates() {
        let mut ts = set();
        ts.add_live_event(msg("$t", 1)).await.unwrap();
        ts.add_live_event(reaction("$r", "$t", "👍")).await.unwrap();

        let redaction = Event::shared(
            EventRecord::new("$red", event_type::ROOM_REDACTION, "@bob:x", 9)
                .with_room(ROOM)
                .with_content(json!({"redacts": "$r"})),
        );
        ts.add_live_event(redaction).await.unwrap();

        assert!(ts.find_event(&EventId::new("$r")).unwrap().is_redacted());
        let rel = ts
            .relations()
            .get(&EventId::new("$t"), RelationType::Annotation, event_type::REACTION)
            .unwrap();
        assert!(rel.is_empty());
        assert_eq!(rel.sorted_annotations_by_key().unwrap()[0].count(), 0);
    }

    #[tokio::test]
    async fn test_fork_segment_is_unlinked() {
        let mut ts = set();
        let live = ts.live_segment_id();
        let fork = ts.fork_segment(live, Direction::Backward).unwrap();
        assert_ne!(fork, live);
        assert_eq!(ts.live_segment_id(), live);
        assert!(ts.segment(fork).unwrap().neighbour(Direction::Forward).is_none());
        assert!(ts.fork_segment(SegmentId::new(), Direction::Forward).is_err());
    }

    #[tokio::test]
    async fn test_encrypted_and_plain_edits_share_one_container() {
        let mut ts = set().with_decryptor(decrypted_edit("newer"));
        let target = msg("$t", 100);
        ts.add_live_event(target.clone()).await.unwrap();

        // Newer encrypted edit arrives before an older plain one
        ts.add_live_event(encrypted_edit("$enc", "$t", 120)).await.unwrap();
        ts.add_live_event(plain_edit("$plain", "$t", 110, "older")).await.unwrap();

        let t = EventId::new("$t");
        assert_eq!(ts.relations().for_target(&t).count(), 1);
        let edits = ts
            .relations()
            .get(&t, RelationType::Replace, event_type::ROOM_MESSAGE)
            .unwrap();
        assert_eq!(edits.len(), 2);
        assert_eq!(target.replacing_event().unwrap().event_id(), &EventId::new("$enc"));
        assert_eq!(target.effective_content(), json!({"body": "newer"}));
    }

    #[tokio::test]
    async fn test_undecryptable_edit_waits_for_decryption() {
        let mut ts = set();
        let target = msg("$t", 100);
        ts.add_live_event(target.clone()).await.unwrap();

        let enc = encrypted_edit("$enc", "$t", 120);
        let outcome = ts.relations_mut().aggregate(enc.clone(), Some(target.clone())).await;
        assert_eq!(outcome, Some(RelationOutcome::Deferred));
        assert_eq!(ts.relations().deferred_len(), 1);
        assert!(target.replacing_event().is_none());

        // Keys arrive and the event is decrypted out of band
        enc.attempt_decryption(decrypted_edit("late").as_ref()).await.unwrap();
        assert_eq!(ts.process_signals().await, 1);

        assert_eq!(ts.relations().deferred_len(), 0);
        assert_eq!(target.replacing_event().unwrap().event_id(), &EventId::new("$enc"));
        assert_eq!(target.effective_content(), json!({"body": "late"}));
    }
}
