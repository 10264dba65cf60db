//! Live events.
//!
//! An [`Event`] wraps the immutable wire [`EventRecord`] with the runtime
//! state the timeline and relation containers mutate: local send status,
//! resolved sender/target members, redaction, the current replacement (edit)
//! and decryption progress. Events are shared as `Arc<Event>` between
//! segments and containers; all runtime state sits behind interior locks so
//! readers never need `&mut`.
//!
//! Changes are published on a per-event broadcast channel
//! ([`Event::subscribe`]). Holding a receiver is the subscription; dropping it
//! unsubscribes.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tracing::{trace, warn};

use rekishi_types::{
    EventId, EventRecord, EventStatus, MemberView, RelationInfo, RelationType, RoomId, UserId,
    event_type,
};

use crate::config::EngineConfig;
use crate::crypto::{DecryptedPayload, DecryptionError, DecryptionState, Decryptor};

/// Notification published by an event.
#[derive(Clone, Debug, PartialEq)]
pub enum EventSignal {
    /// Local send status changed.
    Status(EventStatus),
    /// Published immediately before the event is marked redacted.
    BeforeRedaction { redacted_by: EventId },
    /// The event's current replacement changed (`None` = no longer edited).
    Replaced { replacement: Option<EventId> },
    /// A decryption attempt finished.
    Decrypted { ok: bool },
    /// The first relation of this kind was attached to the event.
    RelationsCreated { relation_type: RelationType, event_type: String },
}

#[derive(Debug)]
struct Metadata {
    sender: Option<MemberView>,
    target: Option<MemberView>,
    forward_looking: bool,
}

impl Default for Metadata {
    fn default() -> Self {
        Self { sender: None, target: None, forward_looking: true }
    }
}

/// A timeline event with runtime state.
pub struct Event {
    record: EventRecord,
    /// Parsed once; kept after redaction so containers can still de-aggregate.
    relation: Option<RelationInfo>,
    status: RwLock<Option<EventStatus>>,
    meta: RwLock<Metadata>,
    frozen: AtomicBool,
    redacted_by: RwLock<Option<EventId>>,
    replacement: RwLock<Option<Arc<Event>>>,
    decrypted: RwLock<Option<DecryptedPayload>>,
    decryption: watch::Sender<DecryptionState>,
    signals: broadcast::Sender<EventSignal>,
}

impl Event {
    /// Wrap a wire record using default channel sizing.
    pub fn from_record(record: EventRecord) -> Self {
        Self::with_config(record, &EngineConfig::default())
    }

    /// Wrap a wire record.
    pub fn with_config(record: EventRecord, config: &EngineConfig) -> Self {
        let initial = if record.event_type == event_type::ROOM_ENCRYPTED {
            DecryptionState::Pending
        } else {
            DecryptionState::NotEncrypted
        };
        let (decryption, _) = watch::channel(initial);
        let (signals, _) = broadcast::channel(config.event_signal_capacity.max(1));
        let relation = record.relation();
        Self {
            record,
            relation,
            status: RwLock::new(None),
            meta: RwLock::new(Metadata::default()),
            frozen: AtomicBool::new(false),
            redacted_by: RwLock::new(None),
            replacement: RwLock::new(None),
            decrypted: RwLock::new(None),
            decryption,
            signals,
        }
    }

    /// Shorthand for `Arc::new(Event::from_record(record))`.
    pub fn shared(record: EventRecord) -> Arc<Self> {
        Arc::new(Self::from_record(record))
    }

    /// A locally originated event that has not reached the server yet.
    pub fn local_echo(record: EventRecord, status: EventStatus) -> Self {
        let event = Self::from_record(record);
        *event.status.write() = Some(status);
        event
    }

    // ========================================================================
    // Wire fields
    // ========================================================================

    pub fn record(&self) -> &EventRecord {
        &self.record
    }

    pub fn event_id(&self) -> &EventId {
        &self.record.event_id
    }

    pub fn sender(&self) -> &UserId {
        &self.record.sender
    }

    pub fn room_id(&self) -> Option<&RoomId> {
        self.record.room_id.as_ref()
    }

    /// Clear-text type: the decrypted type once available, else the wire type.
    pub fn event_type(&self) -> String {
        match &*self.decrypted.read() {
            Some(payload) => payload.event_type.clone(),
            None => self.record.event_type.clone(),
        }
    }

    /// Type as delivered (`m.room.encrypted` for encrypted events).
    pub fn wire_event_type(&self) -> &str {
        &self.record.event_type
    }

    pub fn state_key(&self) -> Option<&str> {
        self.record.state_key.as_deref()
    }

    pub fn is_state(&self) -> bool {
        self.record.is_state()
    }

    pub fn origin_server_ts(&self) -> u64 {
        self.record.origin_server_ts
    }

    /// Current content: empty once redacted, decrypted content when available.
    pub fn content(&self) -> Value {
        if self.is_redacted() {
            return Value::Object(Default::default());
        }
        match &*self.decrypted.read() {
            Some(payload) => payload.content.clone(),
            None => self.record.content.clone(),
        }
    }

    pub fn prev_content(&self) -> Option<&Value> {
        self.record.unsigned.prev_content.as_ref()
    }

    /// Content for state application: `prev_content` (or empty) when the
    /// event is not forward-looking.
    pub fn directional_content(&self) -> Value {
        if self.is_forward_looking() {
            self.content()
        } else {
            self.prev_content()
                .cloned()
                .unwrap_or_else(|| Value::Object(Default::default()))
        }
    }

    pub fn relation(&self) -> Option<&RelationInfo> {
        self.relation.as_ref()
    }

    /// Timestamp of the server's bundled aggregation for `rel_type`.
    pub fn server_aggregated_ts(&self, rel_type: RelationType) -> Option<u64> {
        self.record.server_aggregated_ts(rel_type)
    }

    // ========================================================================
    // Send status
    // ========================================================================

    /// `None` for events received from the server.
    pub fn status(&self) -> Option<EventStatus> {
        *self.status.read()
    }

    pub fn set_status(&self, status: EventStatus) {
        *self.status.write() = Some(status);
        trace!(event_id = %self.event_id(), %status, "event status changed");
        self.publish(EventSignal::Status(status));
    }

    /// Local echo that the server has not accepted yet.
    pub fn is_sending(&self) -> bool {
        matches!(self.status(), Some(s) if s != EventStatus::Sent)
    }

    // ========================================================================
    // Member metadata
    // ========================================================================

    pub fn sender_member(&self) -> Option<MemberView> {
        self.meta.read().sender.clone()
    }

    pub fn target_member(&self) -> Option<MemberView> {
        self.meta.read().target.clone()
    }

    /// False for state events whose effect is read backwards (prepended
    /// during back-pagination, so `prev_content` is the value after them).
    pub fn is_forward_looking(&self) -> bool {
        self.meta.read().forward_looking
    }

    /// Returns false when the event is frozen.
    pub fn set_sender_member(&self, member: MemberView) -> bool {
        self.update_meta("sender", |m| m.sender = Some(member))
    }

    pub fn set_target_member(&self, member: MemberView) -> bool {
        self.update_meta("target", |m| m.target = Some(member))
    }

    pub fn set_forward_looking(&self, forward_looking: bool) -> bool {
        self.update_meta("forward_looking", |m| m.forward_looking = forward_looking)
    }

    fn update_meta(&self, field: &str, f: impl FnOnce(&mut Metadata)) -> bool {
        if self.is_frozen() {
            trace!(event_id = %self.event_id(), field, "refusing metadata update on frozen event");
            return false;
        }
        f(&mut self.meta.write());
        true
    }

    /// Pin metadata. Used for events that seed a segment's initial state.
    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::Release);
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }

    // ========================================================================
    // Redaction and replacement
    // ========================================================================

    /// Publish `BeforeRedaction`, then mark redacted. Content reads as empty
    /// afterwards; relation metadata is kept.
    pub fn apply_redaction(&self, redacted_by: EventId) {
        if self.is_redacted() {
            trace!(event_id = %self.event_id(), "already redacted");
            return;
        }
        self.publish(EventSignal::BeforeRedaction { redacted_by: redacted_by.clone() });
        *self.redacted_by.write() = Some(redacted_by);
        *self.decrypted.write() = None;
        *self.replacement.write() = None;
    }

    pub fn is_redacted(&self) -> bool {
        self.redacted_by.read().is_some()
    }

    pub fn redacted_by(&self) -> Option<EventId> {
        self.redacted_by.read().clone()
    }

    /// Record the event that currently edits this one.
    pub fn make_replaced(&self, replacement: Option<Arc<Event>>) {
        if self.is_redacted() {
            trace!(event_id = %self.event_id(), "ignoring replacement of redacted event");
            return;
        }
        let new_id = replacement.as_ref().map(|r| r.event_id().clone());
        let changed = {
            let mut current = self.replacement.write();
            let old_id = current.as_ref().map(|r| r.event_id().clone());
            *current = replacement;
            old_id != new_id
        };
        if changed {
            self.publish(EventSignal::Replaced { replacement: new_id });
        }
    }

    pub fn replacing_event(&self) -> Option<Arc<Event>> {
        self.replacement.read().clone()
    }

    /// Content as the user should see it: the replacement's `m.new_content`
    /// when edited, else [`Event::content`].
    pub fn effective_content(&self) -> Value {
        if let Some(replacement) = self.replacing_event() {
            if let Some(new_content) = replacement.content().get("m.new_content") {
                return new_content.clone();
            }
        }
        self.content()
    }

    // ========================================================================
    // Decryption
    // ========================================================================

    pub fn decryption_state(&self) -> DecryptionState {
        self.decryption.borrow().clone()
    }

    /// Encrypted, not redacted, and not already decrypted or in flight.
    pub fn should_attempt_decryption(&self) -> bool {
        !self.is_redacted()
            && matches!(
                *self.decryption.borrow(),
                DecryptionState::Pending | DecryptionState::Failed(_)
            )
    }

    pub fn is_being_decrypted(&self) -> bool {
        matches!(*self.decryption.borrow(), DecryptionState::InFlight)
    }

    /// Decrypt with `decryptor`. If another attempt is already running this
    /// awaits that one instead of starting a second.
    pub async fn attempt_decryption(&self, decryptor: &dyn Decryptor) -> Result<(), DecryptionError> {
        let claimed = !self.is_redacted()
            && self.decryption.send_if_modified(|state| match state {
                DecryptionState::Pending | DecryptionState::Failed(_) => {
                    *state = DecryptionState::InFlight;
                    true
                }
                _ => false,
            });
        if !claimed {
            return self.decryption_settled().await;
        }

        trace!(event_id = %self.event_id(), "decrypting");
        match decryptor.decrypt(self).await {
            Ok(payload) => {
                *self.decrypted.write() = Some(payload);
                self.decryption.send_replace(DecryptionState::Decrypted);
                self.publish(EventSignal::Decrypted { ok: true });
                Ok(())
            }
            Err(e) => {
                warn!(event_id = %self.event_id(), "decryption failed: {}", e);
                self.decryption.send_replace(DecryptionState::Failed(e.clone()));
                self.publish(EventSignal::Decrypted { ok: false });
                Err(e)
            }
        }
    }

    /// Wait for any in-flight attempt to finish. `Err` if the last attempt failed.
    pub async fn decryption_settled(&self) -> Result<(), DecryptionError> {
        let mut rx = self.decryption.subscribe();
        let state = rx
            .wait_for(DecryptionState::is_settled)
            .await
            .map(|state| (*state).clone())
            .map_err(|_| DecryptionError::Failed("decryption state dropped".into()))?;
        match state {
            DecryptionState::Failed(e) => Err(e),
            _ => Ok(()),
        }
    }

    pub fn decrypted_payload(&self) -> Option<DecryptedPayload> {
        self.decrypted.read().clone()
    }

    // ========================================================================
    // Signals
    // ========================================================================

    pub fn subscribe(&self) -> broadcast::Receiver<EventSignal> {
        self.signals.subscribe()
    }

    pub fn emit_relations_created(&self, relation_type: RelationType, event_type: &str) {
        self.publish(EventSignal::RelationsCreated {
            relation_type,
            event_type: event_type.to_string(),
        });
    }

    fn publish(&self, signal: EventSignal) {
        // No receivers is fine
        let _ = self.signals.send(signal);
    }
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Event")
            .field("event_id", self.event_id())
            .field("type", &self.record.event_type)
            .field("sender", self.sender())
            .field("status", &self.status())
            .field("redacted", &self.is_redacted())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
