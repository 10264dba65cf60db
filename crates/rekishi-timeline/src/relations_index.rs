//! Relation containers keyed by target.

use std::collections::HashMap;
use std::sync::Arc;

use indexmap::IndexMap;
use tracing::trace;

use rekishi_types::{EventId, RelationType};

use crate::config::EngineConfig;
use crate::crypto::Decryptor;
use crate::event::Event;
use crate::relations::{RelationOutcome, Relations};

/// Identifies one [`Relations`] container.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RelationKey {
    pub target: EventId,
    pub relation_type: RelationType,
    pub event_type: String,
}

impl RelationKey {
    pub fn new(target: EventId, relation_type: RelationType, event_type: impl Into<String>) -> Self {
        Self { target, relation_type, event_type: event_type.into() }
    }
}

/// Every relation container of a room, created on demand as relation
/// events arrive.
///
/// Containers are keyed by the clear event type, so encrypted relations are
/// held back until they are decrypted.
pub struct RelationsIndex {
    containers: HashMap<RelationKey, Relations>,
    by_target: HashMap<EventId, Vec<RelationKey>>,
    deferred: IndexMap<EventId, Arc<Event>>,
    decryptor: Option<Arc<dyn Decryptor>>,
    config: EngineConfig,
}

impl RelationsIndex {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            containers: HashMap::new(),
            by_target: HashMap::new(),
            deferred: IndexMap::new(),
            decryptor: None,
            config,
        }
    }

    /// Decryptor for relations that arrive encrypted, and for containers
    /// created from now on.
    pub fn set_decryptor(&mut self, decryptor: Arc<dyn Decryptor>) {
        self.decryptor = Some(decryptor);
    }

    pub fn get(&self, target: &EventId, relation_type: RelationType, event_type: &str) -> Option<&Relations> {
        self.containers
            .get(&RelationKey::new(target.clone(), relation_type, event_type))
    }

    pub fn get_or_create(
        &mut self,
        target: &EventId,
        relation_type: RelationType,
        event_type: &str,
    ) -> &mut Relations {
        let key = RelationKey::new(target.clone(), relation_type, event_type);
        if !self.containers.contains_key(&key) {
            self.by_target.entry(target.clone()).or_default().push(key.clone());
        }
        let config = &self.config;
        let decryptor = &self.decryptor;
        self.containers.entry(key).or_insert_with(|| {
            trace!(%target, %relation_type, event_type, "creating relations container");
            let relations = Relations::new(relation_type, event_type, config);
            match decryptor {
                Some(d) => relations.with_decryptor(d.clone()),
                None => relations,
            }
        })
    }

    /// All containers for one target.
    pub fn for_target<'a>(&'a self, target: &'a EventId) -> impl Iterator<Item = &'a Relations> + 'a {
        self.by_target
            .get(target)
            .into_iter()
            .flatten()
            .filter_map(|key| self.containers.get(key))
    }

    /// Route a relation event into its container.
    ///
    /// `target` is the related-to event when the caller already has it.
    /// Returns `None` for events that carry no relation or are redacted, and
    /// [`RelationOutcome::Deferred`] for encrypted events that could not be
    /// decrypted yet.
    pub async fn aggregate(&mut self, event: Arc<Event>, target: Option<Arc<Event>>) -> Option<RelationOutcome> {
        if event.is_redacted() {
            trace!(event_id = %event.event_id(), "not aggregating redacted event");
            return None;
        }
        let relation = event.relation()?.clone();
        if !self.decrypt_for_routing(&event).await {
            trace!(event_id = %event.event_id(), "deferring relation until decrypted");
            self.deferred.insert(event.event_id().clone(), event);
            return Some(RelationOutcome::Deferred);
        }
        self.deferred.shift_remove(event.event_id());

        let container = self.get_or_create(&relation.event_id, relation.rel_type, &event.event_type());
        if let Some(target) = target {
            container.set_target_event(target).await;
        }
        Some(container.add_event(event).await)
    }

    /// True once the clear type is known. An attempt already running
    /// elsewhere is not awaited; the event is picked up by
    /// [`Self::take_decrypted`] when it settles.
    async fn decrypt_for_routing(&self, event: &Event) -> bool {
        if event.is_being_decrypted() {
            return false;
        }
        if !event.should_attempt_decryption() {
            return true;
        }
        let Some(decryptor) = &self.decryptor else {
            return false;
        };
        event.attempt_decryption(decryptor.as_ref()).await.is_ok()
    }

    /// Deferred relations that have been decrypted since, ready for
    /// [`Self::aggregate`]. Redacted ones are dropped.
    pub fn take_decrypted(&mut self) -> Vec<Arc<Event>> {
        let mut ready = Vec::new();
        self.deferred.retain(|_, event| {
            if event.is_redacted() {
                return false;
            }
            if event.is_being_decrypted() || event.should_attempt_decryption() {
                return true;
            }
            ready.push(event.clone());
            false
        });
        ready
    }

    /// Relations waiting on decryption.
    pub fn deferred_len(&self) -> usize {
        self.deferred.len()
    }

    /// Attach `event` as target of every container waiting on its id.
    /// Returns how many containers were waiting.
    pub async fn set_target(&mut self, event: &Arc<Event>) -> usize {
        let Some(keys) = self.by_target.get(event.event_id()) else {
            return 0;
        };
        let mut attached = 0;
        for key in keys {
            if let Some(relations) = self.containers.get_mut(key) {
                relations.set_target_event(event.clone()).await;
                attached += 1;
            }
        }
        attached
    }

    /// Drain signals in every container.
    pub async fn process_signals(&mut self) -> usize {
        let mut handled = 0;
        for relations in self.containers.values_mut() {
            handled += relations.process_signals().await;
        }
        handled
    }

    /// Drop every container for `target`.
    pub fn remove_target(&mut self, target: &EventId) -> usize {
        let Some(keys) = self.by_target.remove(target) else {
            return 0;
        };
        keys.iter()
            .filter(|key| self.containers.remove(*key).is_some())
            .count()
    }

    pub fn len(&self) -> usize {
        self.containers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.containers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rekishi_types::{EventRecord, RelationInfo, event_type};

    fn reaction(id: &str, key: &str) -> Arc<Event> {
        Event::shared(
            EventRecord::new(id, event_type::REACTION, "@a:x", 1)
                .with_relation(RelationInfo::annotation(EventId::new("$t"), key)),
        )
    }

    #[tokio::test]
    async fn test_aggregate_creates_container_on_demand() {
        let mut index = RelationsIndex::new(EngineConfig::default());
        let outcome = index.aggregate(reaction("$r", "👍"), None).await;
        assert_eq!(outcome, Some(RelationOutcome::Added));

        let rel = index
            .get(&EventId::new("$t"), RelationType::Annotation, event_type::REACTION)
            .unwrap();
        assert_eq!(rel.len(), 1);
        assert!(rel.target_event().is_none());
    }

    #[tokio::test]
    async fn test_set_target_reaches_waiting_containers() {
        let mut index = RelationsIndex::new(EngineConfig::default());
        index.aggregate(reaction("$r", "👍"), None).await;

        let target = Event::shared(EventRecord::new("$t", event_type::ROOM_MESSAGE, "@a:x", 1));
        assert_eq!(index.set_target(&target).await, 1);
        assert_eq!(index.for_target(&EventId::new("$t")).count(), 1);
        assert!(index.for_target(&EventId::new("$t")).all(|r| r.target_event().is_some()));
    }

    #[tokio::test]
    async fn test_aggregate_skips_plain_and_redacted() {
        let mut index = RelationsIndex::new(EngineConfig::default());
        let plain = Event::shared(EventRecord::new("$p", event_type::ROOM_MESSAGE, "@a:x", 1));
        assert!(index.aggregate(plain, None).await.is_none());

        let redacted = reaction("$r", "👍");
        redacted.apply_redaction(EventId::new("$red"));
        assert!(index.aggregate(redacted, None).await.is_none());
        assert!(index.is_empty());
    }

    #[tokio::test]
    async fn test_remove_target() {
        let mut index = RelationsIndex::new(EngineConfig::default());
        index.aggregate(reaction("$r", "👍"), None).await;
        assert_eq!(index.remove_target(&EventId::new("$t")), 1);
        assert!(index.is_empty());
    }

    #[tokio::test]
    async fn test_target_index_follows_containers() {
        let mut index = RelationsIndex::new(EngineConfig::default());
        index.aggregate(reaction("$r", "👍"), None).await;

        let unrelated = Event::shared(EventRecord::new("$other", event_type::ROOM_MESSAGE, "@a:x", 1));
        assert_eq!(index.set_target(&unrelated).await, 0);
        assert_eq!(index.for_target(&EventId::new("$other")).count(), 0);

        index.remove_target(&EventId::new("$t"));
        let target = Event::shared(EventRecord::new("$t", event_type::ROOM_MESSAGE, "@a:x", 1));
        assert_eq!(index.set_target(&target).await, 0);
        assert_eq!(index.for_target(&EventId::new("$t")).count(), 0);
    }

    #[tokio::test]
    async fn test_encrypted_relation_waits_without_decryptor() {
        let mut index = RelationsIndex::new(EngineConfig::default());
        let enc = Event::shared(
            EventRecord::new("$enc", event_type::ROOM_ENCRYPTED, "@a:x", 1)
                .with_relation(RelationInfo::new(RelationType::Replace, EventId::new("$t"))),
        );
        assert_eq!(index.aggregate(enc, None).await, Some(RelationOutcome::Deferred));
        assert!(index.is_empty());
        assert_eq!(index.deferred_len(), 1);
        assert!(index.take_decrypted().is_empty());
        assert_eq!(index.deferred_len(), 1);
    }
}
