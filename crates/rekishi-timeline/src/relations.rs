//! Relation aggregation.
//!
//! A [`Relations`] container collects every event that relates to one target
//! event with one `(relation type, event type)` pair: all `m.annotation`
//! reactions to a message, or all `m.replace` edits of it. It keeps
//! derived views up to date as relations arrive, are cancelled, or are
//! redacted:
//!
//! - annotations grouped by key (sorted by count) and by sender
//! - for edits, the current replacement applied to the target event
//!
//! Containers may be created before their target is known; the target is
//! attached once with [`Relations::set_target_event`].
//!
//! # Signals
//!
//! Each held event is watched through its broadcast channel. Signals are
//! drained by [`Relations::process_signals`], which the owner calls after
//! mutating events (status changes, redactions). A cancelled local echo is
//! removed; a redacted relation is dropped and the aggregation recomputed.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::Arc;

use indexmap::IndexMap;
use tokio::sync::broadcast::{self, error::TryRecvError};
use tracing::{debug, error, trace, warn};

use rekishi_types::{EventId, EventStatus, RelationType, UserId};

use crate::config::EngineConfig;
use crate::crypto::{DecryptionError, Decryptor};
use crate::error::RelationsError;
use crate::event::{Event, EventSignal};

/// Events grouped by annotation key or sender, in arrival order.
pub type EventSet = IndexMap<EventId, Arc<Event>>;

/// Notification published by a container.
#[derive(Clone, Debug)]
pub enum RelationsEvent {
    Added(Arc<Event>),
    Removed(Arc<Event>),
    /// A held relation was redacted and dropped.
    Redaction(Arc<Event>),
    /// First time the container had both a target and a relation.
    Created {
        target: EventId,
        relation_type: RelationType,
        event_type: String,
    },
}

/// Result of adding or removing a relation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RelationOutcome {
    Added,
    Removed,
    Skipped { reason: SkipReason },
    /// Held back by [`RelationsIndex`](crate::RelationsIndex) until the
    /// event is decrypted.
    Deferred,
}

/// Why an add or remove did nothing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SkipReason {
    /// Already held.
    Duplicate,
    /// Not held.
    NotPresent,
    /// Event carries no `m.relates_to`.
    MissingRelation,
    /// Relation or event type belongs to another container.
    Mismatch { expected: String, got: String },
}

/// One annotation key and the events that used it.
#[derive(Debug)]
pub struct AnnotationGroup<'a> {
    pub key: &'a str,
    pub events: &'a EventSet,
}

impl AnnotationGroup<'_> {
    pub fn count(&self) -> usize {
        self.events.len()
    }
}

/// Receiver plus which signals we still care about.
struct EventWatch {
    rx: broadcast::Receiver<EventSignal>,
    status: bool,
    redaction: bool,
}

struct Tracked {
    event: Arc<Event>,
    watch: Option<EventWatch>,
}

enum SignalAction {
    Cancelled(EventId),
    Redacted(EventId),
}

/// All relations of one kind to one target.
pub struct Relations {
    relation_type: RelationType,
    event_type: String,
    relations: IndexMap<EventId, Tracked>,
    annotations_by_key: HashMap<String, EventSet>,
    sorted_annotation_keys: Vec<String>,
    annotations_by_sender: HashMap<UserId, EventSet>,
    target_event: Option<Arc<Event>>,
    creation_emitted: bool,
    decryptor: Option<Arc<dyn Decryptor>>,
    events_tx: broadcast::Sender<RelationsEvent>,
}

impl Relations {
    pub fn new(relation_type: RelationType, event_type: impl Into<String>, config: &EngineConfig) -> Self {
        let (events_tx, _) = broadcast::channel(config.relations_channel_capacity.max(1));
        Self {
            relation_type,
            event_type: event_type.into(),
            relations: IndexMap::new(),
            annotations_by_key: HashMap::new(),
            sorted_annotation_keys: Vec::new(),
            annotations_by_sender: HashMap::new(),
            target_event: None,
            creation_emitted: false,
            decryptor: None,
            events_tx,
        }
    }

    /// Decryptor used when the winning replacement is still encrypted.
    pub fn with_decryptor(mut self, decryptor: Arc<dyn Decryptor>) -> Self {
        self.decryptor = Some(decryptor);
        self
    }

    pub fn relation_type(&self) -> RelationType {
        self.relation_type
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RelationsEvent> {
        self.events_tx.subscribe()
    }

    // ========================================================================
    // Mutation
    // ========================================================================

    /// Add a relation event.
    pub async fn add_event(&mut self, event: Arc<Event>) -> RelationOutcome {
        if self.relations.contains_key(event.event_id()) {
            trace!(event_id = %event.event_id(), "relation already held");
            return RelationOutcome::Skipped { reason: SkipReason::Duplicate };
        }
        if let Err(reason) = self.check_routing(&event) {
            error!(event_id = %event.event_id(), ?reason, "event does not belong in this relations container");
            return RelationOutcome::Skipped { reason };
        }

        // Local echoes are watched for cancellation until they are sent
        let watch = EventWatch {
            rx: event.subscribe(),
            status: event.is_sending(),
            redaction: true,
        };
        self.relations.insert(
            event.event_id().clone(),
            Tracked { event: event.clone(), watch: Some(watch) },
        );

        match self.relation_type {
            RelationType::Annotation => self.add_annotation(&event),
            RelationType::Replace if self.target_event.is_some() => {
                self.apply_replacement(true).await
            }
            _ => {}
        }

        trace!(event_id = %event.event_id(), rel_type = %self.relation_type, "relation added");
        self.emit(RelationsEvent::Added(event));
        self.maybe_emit_created();
        RelationOutcome::Added
    }

    /// Remove a relation event (e.g. a cancelled local echo).
    pub async fn remove_event(&mut self, event: &Arc<Event>) -> RelationOutcome {
        if !self.relations.contains_key(event.event_id()) {
            return RelationOutcome::Skipped { reason: SkipReason::NotPresent };
        }
        if let Err(reason) = self.check_routing(event) {
            error!(event_id = %event.event_id(), ?reason, "event does not belong in this relations container");
            return RelationOutcome::Skipped { reason };
        }

        self.relations.shift_remove(event.event_id());

        match self.relation_type {
            RelationType::Annotation => self.remove_annotation(event),
            RelationType::Replace if self.target_event.is_some() => {
                self.apply_replacement(true).await
            }
            _ => {}
        }

        trace!(event_id = %event.event_id(), rel_type = %self.relation_type, "relation removed");
        self.emit(RelationsEvent::Removed(event.clone()));
        RelationOutcome::Removed
    }

    /// Attach the target. First writer wins; later calls are ignored.
    pub async fn set_target_event(&mut self, event: Arc<Event>) {
        if self.target_event.is_some() {
            trace!(event_id = %event.event_id(), "target already set");
            return;
        }
        debug!(target = %event.event_id(), rel_type = %self.relation_type, "relations target attached");
        self.target_event = Some(event);

        if self.relation_type == RelationType::Replace {
            // Initial update: only touch the target when there is something to apply
            self.apply_replacement(false).await;
        }
        self.maybe_emit_created();
    }

    /// Drain pending event signals. Returns the number of cancellations and
    /// redactions handled.
    pub async fn process_signals(&mut self) -> usize {
        let mut actions = Vec::new();

        for (id, tracked) in self.relations.iter_mut() {
            let Some(watch) = tracked.watch.as_mut() else {
                continue;
            };
            loop {
                match watch.rx.try_recv() {
                    Ok(EventSignal::Status(status)) if watch.status => {
                        if status == EventStatus::Cancelled {
                            actions.push(SignalAction::Cancelled(id.clone()));
                            break;
                        }
                        if status == EventStatus::Sent {
                            watch.status = false;
                        }
                    }
                    Ok(EventSignal::BeforeRedaction { .. }) if watch.redaction => {
                        actions.push(SignalAction::Redacted(id.clone()));
                        break;
                    }
                    Ok(_) => {}
                    Err(TryRecvError::Lagged(skipped)) => {
                        warn!(event_id = %id, skipped, "relation signal receiver lagged, reconciling");
                        let event = &tracked.event;
                        if watch.redaction && event.is_redacted() {
                            actions.push(SignalAction::Redacted(id.clone()));
                            break;
                        }
                        if watch.status && event.status() == Some(EventStatus::Cancelled) {
                            actions.push(SignalAction::Cancelled(id.clone()));
                            break;
                        }
                        if !event.is_sending() {
                            watch.status = false;
                        }
                    }
                    Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
                }
            }
            if !watch.status && !watch.redaction {
                tracked.watch = None;
            }
        }

        let handled = actions.len();
        for action in actions {
            match action {
                SignalAction::Cancelled(id) => {
                    if let Some(event) = self.relations.get(&id).map(|t| t.event.clone()) {
                        debug!(event_id = %id, "relation cancelled");
                        self.remove_event(&event).await;
                    }
                }
                SignalAction::Redacted(id) => self.handle_redaction(&id).await,
            }
        }
        handled
    }

    async fn handle_redaction(&mut self, id: &EventId) {
        // Dropping the tracked entry drops its watch
        let Some(Tracked { event, .. }) = self.relations.shift_remove(id) else {
            return;
        };
        match self.relation_type {
            RelationType::Annotation => self.remove_annotation(&event),
            RelationType::Replace if self.target_event.is_some() => {
                self.apply_replacement(true).await
            }
            _ => {}
        }
        debug!(event_id = %id, rel_type = %self.relation_type, "relation redacted");
        self.emit(RelationsEvent::Redaction(event));
    }

    // ========================================================================
    // Replacement
    // ========================================================================

    /// The edit that should currently replace the target's content.
    ///
    /// Only the target's author may edit it; edits older than the server's
    /// acknowledged replacement are ignored; among the rest the newest wins,
    /// with timestamp ties going to the one seen first. An encrypted winner
    /// is decrypted (or its in-flight decryption awaited) before returning.
    pub async fn last_replacement(&self) -> Result<Option<Arc<Event>>, RelationsError> {
        if self.relation_type != RelationType::Replace {
            return Ok(None);
        }
        let Some(target) = &self.target_event else {
            return Ok(None);
        };

        let floor = target.server_aggregated_ts(RelationType::Replace);
        let best = self
            .relations
            .values()
            .map(|t| &t.event)
            .fold(None::<&Arc<Event>>, |best, event| {
                if event.sender() != target.sender() {
                    return best;
                }
                if floor.is_some_and(|min| event.origin_server_ts() < min) {
                    return best;
                }
                if best.is_some_and(|b| event.origin_server_ts() <= b.origin_server_ts()) {
                    return best;
                }
                Some(event)
            })
            .cloned();

        if let Some(event) = &best {
            if event.should_attempt_decryption() {
                let decryptor = self.decryptor.as_ref().ok_or(DecryptionError::NoDecryptor)?;
                event.attempt_decryption(decryptor.as_ref()).await?;
            } else if event.is_being_decrypted() {
                event.decryption_settled().await?;
            }
        }
        Ok(best)
    }

    /// Recompute and apply to the target. Errors keep the previous replacement.
    async fn apply_replacement(&self, apply_none: bool) {
        let Some(target) = self.target_event.clone() else {
            return;
        };
        match self.last_replacement().await {
            Ok(Some(replacement)) => target.make_replaced(Some(replacement)),
            Ok(None) if apply_none => target.make_replaced(None),
            Ok(None) => {}
            Err(e) => {
                warn!(target = %target.event_id(), "failed to recompute replacement: {}", e);
            }
        }
    }

    // ========================================================================
    // Annotations
    // ========================================================================

    fn add_annotation(&mut self, event: &Arc<Event>) {
        let Some(key) = annotation_key(event) else {
            return;
        };
        if !self.annotations_by_key.contains_key(&key) {
            self.sorted_annotation_keys.push(key.clone());
        }
        self.annotations_by_key
            .entry(key)
            .or_default()
            .insert(event.event_id().clone(), event.clone());
        self.resort_annotations();

        self.annotations_by_sender
            .entry(event.sender().clone())
            .or_default()
            .insert(event.event_id().clone(), event.clone());
    }

    fn remove_annotation(&mut self, event: &Arc<Event>) {
        let Some(key) = annotation_key(event) else {
            return;
        };
        // Emptied keys stay tracked with a count of zero
        if let Some(set) = self.annotations_by_key.get_mut(&key) {
            set.shift_remove(event.event_id());
            self.resort_annotations();
        }
        if let Some(set) = self.annotations_by_sender.get_mut(event.sender()) {
            set.shift_remove(event.event_id());
        }
    }

    /// Descending by count; stable, so ties keep their previous order.
    fn resort_annotations(&mut self) {
        let by_key = &self.annotations_by_key;
        self.sorted_annotation_keys
            .sort_by_key(|k| Reverse(by_key.get(k).map_or(0, |set| set.len())));
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Held relations in insertion order.
    pub fn relations(&self) -> Vec<Arc<Event>> {
        self.relations.values().map(|t| t.event.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.relations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.relations.is_empty()
    }

    pub fn contains(&self, event_id: &EventId) -> bool {
        self.relations.contains_key(event_id)
    }

    /// Annotation keys by descending count. `None` for other relation types.
    pub fn sorted_annotations_by_key(&self) -> Option<Vec<AnnotationGroup<'_>>> {
        if self.relation_type != RelationType::Annotation {
            return None;
        }
        Some(
            self.sorted_annotation_keys
                .iter()
                .filter_map(|key| {
                    self.annotations_by_key
                        .get(key)
                        .map(|events| AnnotationGroup { key: key.as_str(), events })
                })
                .collect(),
        )
    }

    /// `None` for other relation types.
    pub fn annotations_by_sender(&self) -> Option<&HashMap<UserId, EventSet>> {
        if self.relation_type != RelationType::Annotation {
            return None;
        }
        Some(&self.annotations_by_sender)
    }

    pub fn target_event(&self) -> Option<&Arc<Event>> {
        self.target_event.as_ref()
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn check_routing(&self, event: &Event) -> Result<(), SkipReason> {
        let Some(relation) = event.relation() else {
            return Err(SkipReason::MissingRelation);
        };
        if relation.rel_type != self.relation_type {
            return Err(SkipReason::Mismatch {
                expected: self.relation_type.to_string(),
                got: relation.rel_type.to_string(),
            });
        }
        let event_type = event.event_type();
        if event_type != self.event_type {
            return Err(SkipReason::Mismatch { expected: self.event_type.clone(), got: event_type });
        }
        Ok(())
    }

    fn maybe_emit_created(&mut self) {
        if self.creation_emitted || self.relations.is_empty() {
            return;
        }
        let Some(target) = &self.target_event else {
            return;
        };
        self.creation_emitted = true;
        target.emit_relations_created(self.relation_type, &self.event_type);
        self.emit(RelationsEvent::Created {
            target: target.event_id().clone(),
            relation_type: self.relation_type,
            event_type: self.event_type.clone(),
        });
    }

    fn emit(&self, event: RelationsEvent) {
        // No receivers is fine
        let _ = self.events_tx.send(event);
    }
}

impl std::fmt::Debug for Relations {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relations")
            .field("relation_type", &self.relation_type)
            .field("event_type", &self.event_type)
            .field("relations", &self.relations.len())
            .field("target", &self.target_event.as_ref().map(|t| t.event_id()))
            .field("creation_emitted", &self.creation_emitted)
            .finish()
    }
}

fn annotation_key(event: &Event) -> Option<String> {
    event
        .relation()
        .and_then(|r| r.key.clone())
        .filter(|k| !k.is_empty())
}

// ============================================================================
// Tests
// ============================================================================
