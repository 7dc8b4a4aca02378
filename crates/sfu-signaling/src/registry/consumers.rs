//! Consumer registry.
//!
//! Consumers enter the registry paused and only the `Paused -> Active`
//! transition is exposed, so a consumer can never be observed active without
//! having been paused first. A per-producer index drives cascade closes.

use crate::errors::SignalingError;

use common::types::{ConsumerId, MediaKind, PeerId, ProducerId, TransportId};
use std::collections::{HashMap, HashSet};

/// Lifecycle state of a consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Paused,
    Active,
    Closed,
}

impl ConsumerState {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            ConsumerState::Paused => "paused",
            ConsumerState::Active => "active",
            ConsumerState::Closed => "closed",
        }
    }
}

/// A registered inbound track.
#[derive(Debug, Clone)]
pub struct ConsumerEntry {
    pub id: ConsumerId,
    pub peer_id: PeerId,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub transport_id: TransportId,
    state: ConsumerState,
}

impl ConsumerEntry {
    /// New consumers always start paused.
    #[must_use]
    pub fn new(
        id: ConsumerId,
        peer_id: PeerId,
        producer_id: ProducerId,
        kind: MediaKind,
        transport_id: TransportId,
    ) -> Self {
        Self {
            id,
            peer_id,
            producer_id,
            kind,
            transport_id,
            state: ConsumerState::Paused,
        }
    }

    #[must_use]
    pub fn state(&self) -> ConsumerState {
        self.state
    }
}

#[derive(Debug, Default)]
pub struct ConsumerRegistry {
    by_id: HashMap<ConsumerId, ConsumerEntry>,
    by_producer: HashMap<ProducerId, HashSet<ConsumerId>>,
}

impl ConsumerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, entry: ConsumerEntry) -> Result<(), SignalingError> {
        if self.by_id.contains_key(&entry.id) {
            return Err(SignalingError::Conflict("consumer already registered".to_string()));
        }
        self.by_producer
            .entry(entry.producer_id)
            .or_default()
            .insert(entry.id);
        self.by_id.insert(entry.id, entry);
        Ok(())
    }

    #[must_use]
    pub fn get(&self, consumer_id: ConsumerId) -> Option<&ConsumerEntry> {
        self.by_id.get(&consumer_id)
    }

    /// Move a paused consumer to active. Resuming an active consumer is a no-op.
    ///
    /// Returns the previous state.
    pub fn resume(&mut self, consumer_id: ConsumerId) -> Result<ConsumerState, SignalingError> {
        let entry = self
            .by_id
            .get_mut(&consumer_id)
            .ok_or_else(|| SignalingError::NotFound("consumer".to_string()))?;
        let previous = entry.state;
        if previous == ConsumerState::Paused {
            entry.state = ConsumerState::Active;
        }
        Ok(previous)
    }

    /// Remove a consumer. The returned entry is marked closed.
    pub fn remove(&mut self, consumer_id: ConsumerId) -> Option<ConsumerEntry> {
        let mut entry = self.by_id.remove(&consumer_id)?;
        if let Some(ids) = self.by_producer.get_mut(&entry.producer_id) {
            ids.remove(&consumer_id);
            if ids.is_empty() {
                self.by_producer.remove(&entry.producer_id);
            }
        }
        entry.state = ConsumerState::Closed;
        Some(entry)
    }

    /// Remove every consumer of a producer.
    pub fn remove_for_producer(&mut self, producer_id: ProducerId) -> Vec<ConsumerEntry> {
        let ids = self.by_producer.remove(&producer_id).unwrap_or_default();
        ids.into_iter()
            .filter_map(|id| {
                let mut entry = self.by_id.remove(&id)?;
                entry.state = ConsumerState::Closed;
                Some(entry)
            })
            .collect()
    }

    #[must_use]
    pub fn for_peer(&self, peer_id: PeerId) -> Vec<&ConsumerEntry> {
        self.by_id.values().filter(|c| c.peer_id == peer_id).collect()
    }

    #[must_use]
    pub fn paused_for_peer(&self, peer_id: PeerId) -> Vec<ConsumerId> {
        self.by_id
            .values()
            .filter(|c| c.peer_id == peer_id && c.state == ConsumerState::Paused)
            .map(|c| c.id)
            .collect()
    }

    #[must_use]
    pub fn for_transport(&self, transport_id: TransportId) -> Vec<ConsumerId> {
        self.by_id
            .values()
            .filter(|c| c.transport_id == transport_id)
            .map(|c| c.id)
            .collect()
    }

    /// Whether `peer_id` already consumes `producer_id`.
    #[must_use]
    pub fn is_consuming(&self, peer_id: PeerId, producer_id: ProducerId) -> bool {
        self.by_producer.get(&producer_id).is_some_and(|ids| {
            ids.iter()
                .filter_map(|id| self.by_id.get(id))
                .any(|c| c.peer_id == peer_id)
        })
    }

    #[must_use]
    pub fn count_for_producer(&self, producer_id: ProducerId) -> usize {
        self.by_producer.get(&producer_id).map_or(0, HashSet::len)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn entry(peer: PeerId, producer: ProducerId) -> ConsumerEntry {
        ConsumerEntry::new(
            ConsumerId::new(),
            peer,
            producer,
            MediaKind::Video,
            TransportId::new(),
        )
    }

    #[test]
    fn test_consumer_starts_paused_then_resumes() {
        let mut registry = ConsumerRegistry::new();
        let consumer = entry(PeerId::new(), ProducerId::new());
        let id = consumer.id;
        assert_eq!(consumer.state(), ConsumerState::Paused);
        registry.insert(consumer).unwrap();

        assert_eq!(registry.resume(id).unwrap(), ConsumerState::Paused);
        assert_eq!(registry.get(id).unwrap().state(), ConsumerState::Active);

        // Idempotent.
        assert_eq!(registry.resume(id).unwrap(), ConsumerState::Active);
        assert_eq!(registry.get(id).unwrap().state(), ConsumerState::Active);
    }

    #[test]
    fn test_resume_unknown_consumer() {
        let mut registry = ConsumerRegistry::new();
        assert!(matches!(
            registry.resume(ConsumerId::new()),
            Err(SignalingError::NotFound(_))
        ));
    }

    #[test]
    fn test_remove_for_producer_closes_all_dependents() {
        let mut registry = ConsumerRegistry::new();
        let producer = ProducerId::new();
        let other_producer = ProducerId::new();

        for _ in 0..3 {
            registry.insert(entry(PeerId::new(), producer)).unwrap();
        }
        registry.insert(entry(PeerId::new(), other_producer)).unwrap();
        assert_eq!(registry.count_for_producer(producer), 3);

        let closed = registry.remove_for_producer(producer);
        assert_eq!(closed.len(), 3);
        assert!(closed.iter().all(|c| c.state() == ConsumerState::Closed));
        assert_eq!(registry.count_for_producer(producer), 0);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_paused_for_peer_and_is_consuming() {
        let mut registry = ConsumerRegistry::new();
        let peer = PeerId::new();
        let producer = ProducerId::new();
        let first = entry(peer, producer);
        let first_id = first.id;
        registry.insert(first).unwrap();
        registry.insert(entry(peer, ProducerId::new())).unwrap();

        assert!(registry.is_consuming(peer, producer));
        assert!(!registry.is_consuming(PeerId::new(), producer));
        assert_eq!(registry.paused_for_peer(peer).len(), 2);

        registry.resume(first_id).unwrap();
        assert_eq!(registry.paused_for_peer(peer).len(), 1);
        assert_eq!(registry.for_peer(peer).len(), 2);
    }

    #[test]
    fn test_remove_single_consumer() {
        let mut registry = ConsumerRegistry::new();
        let producer = ProducerId::new();
        let consumer = entry(PeerId::new(), producer);
        let id = consumer.id;
        registry.insert(consumer).unwrap();

        let removed = registry.remove(id).unwrap();
        assert_eq!(removed.state(), ConsumerState::Closed);
        assert_eq!(registry.count_for_producer(producer), 0);
        assert!(registry.is_empty());
    }
}
