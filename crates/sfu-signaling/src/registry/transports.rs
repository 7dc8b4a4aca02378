//! Transport registry.
//!
//! One entry per engine-side WebRTC transport, keyed by id and by
//! `(peer, direction)`. A peer owns at most one transport per direction.
//!
//! # State machine
//!
//! ```text
//! new --connect accepted--> connecting --DTLS connected--> connected
//!  \______________________________\_________________________\__--> closed
//! ```
//!
//! `closed` is terminal: the entry leaves the registry, and watchers of the
//! state channel observe `Closed` before the sender is dropped.

use crate::errors::SignalingError;

use chrono::{DateTime, Utc};
use common::types::{Direction, PeerId, TransportId};
use std::collections::HashMap;
use tokio::sync::watch;

/// Connection state of a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Closed,
}

impl TransportState {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            TransportState::New => "new",
            TransportState::Connecting => "connecting",
            TransportState::Connected => "connected",
            TransportState::Closed => "closed",
        }
    }

    /// Transition table. `Connecting -> New` is the rollback taken when the
    /// engine rejects the DTLS parameters.
    #[must_use]
    pub const fn can_transition_to(&self, next: TransportState) -> bool {
        matches!(
            (self, next),
            (TransportState::New, TransportState::Connecting)
                | (TransportState::Connecting, TransportState::Connected)
                | (TransportState::Connecting, TransportState::New)
                | (
                    TransportState::New | TransportState::Connecting | TransportState::Connected,
                    TransportState::Closed
                )
        )
    }
}

/// A registered transport.
#[derive(Debug)]
pub struct TransportEntry {
    pub id: TransportId,
    pub peer_id: PeerId,
    pub direction: Direction,
    pub created_at: DateTime<Utc>,
    state: watch::Sender<TransportState>,
}

impl TransportEntry {
    #[must_use]
    pub fn new(id: TransportId, peer_id: PeerId, direction: Direction) -> Self {
        let (state, _) = watch::channel(TransportState::New);
        Self {
            id,
            peer_id,
            direction,
            created_at: Utc::now(),
            state,
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> TransportState {
        *self.state.borrow()
    }

    /// Watch state changes (used to await `connected`).
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<TransportState> {
        self.state.subscribe()
    }
}

/// Registry of live transports.
#[derive(Debug, Default)]
pub struct TransportRegistry {
    by_id: HashMap<TransportId, TransportEntry>,
    by_peer: HashMap<(PeerId, Direction), TransportId>,
}

impl TransportRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly created transport in `new` state.
    pub fn insert(&mut self, entry: TransportEntry) -> Result<(), SignalingError> {
        let key = (entry.peer_id, entry.direction);
        if self.by_peer.contains_key(&key) {
            return Err(SignalingError::Conflict(format!(
                "{} transport already exists",
                entry.direction
            )));
        }
        self.by_peer.insert(key, entry.id);
        self.by_id.insert(entry.id, entry);
        Ok(())
    }

    #[must_use]
    pub fn get(&self, transport_id: TransportId) -> Option<&TransportEntry> {
        self.by_id.get(&transport_id)
    }

    #[must_use]
    pub fn get_for_peer(&self, peer_id: PeerId, direction: Direction) -> Option<&TransportEntry> {
        self.by_peer
            .get(&(peer_id, direction))
            .and_then(|id| self.by_id.get(id))
    }

    /// The peer's transport for `direction`, which must be `connected`.
    pub fn require_connected(
        &self,
        peer_id: PeerId,
        direction: Direction,
    ) -> Result<TransportId, SignalingError> {
        match self.get_for_peer(peer_id, direction) {
            Some(entry) if entry.state() == TransportState::Connected => Ok(entry.id),
            Some(entry) => Err(SignalingError::ProtocolOrder(format!(
                "{direction} transport is {}, not connected",
                entry.state().as_str()
            ))),
            None => Err(SignalingError::ProtocolOrder(format!(
                "no {direction} transport; create and connect it first"
            ))),
        }
    }

    /// Apply a state transition, rejecting anything outside the table.
    ///
    /// Returns the previous state.
    pub fn transition(
        &mut self,
        transport_id: TransportId,
        next: TransportState,
    ) -> Result<TransportState, SignalingError> {
        if next == TransportState::Closed {
            return self
                .close(transport_id)
                .map(|(_, previous)| previous)
                .ok_or_else(|| SignalingError::NotFound("transport".to_string()));
        }

        let entry = self
            .by_id
            .get(&transport_id)
            .ok_or_else(|| SignalingError::NotFound("transport".to_string()))?;
        let current = entry.state();
        if !current.can_transition_to(next) {
            return Err(SignalingError::ProtocolOrder(format!(
                "{} transport cannot go from {} to {}",
                entry.direction,
                current.as_str(),
                next.as_str()
            )));
        }
        entry.state.send_replace(next);
        Ok(current)
    }

    /// Close and remove a transport. Returns the entry and its last state.
    pub fn close(&mut self, transport_id: TransportId) -> Option<(TransportEntry, TransportState)> {
        let entry = self.by_id.remove(&transport_id)?;
        self.by_peer.remove(&(entry.peer_id, entry.direction));
        let previous = entry.state.send_replace(TransportState::Closed);
        Some((entry, previous))
    }

    /// All transports owned by a peer.
    #[must_use]
    pub fn for_peer(&self, peer_id: PeerId) -> Vec<TransportId> {
        [Direction::Send, Direction::Recv]
            .into_iter()
            .filter_map(|direction| self.by_peer.get(&(peer_id, direction)).copied())
            .collect()
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

    fn registry_with(peer: PeerId, direction: Direction) -> (TransportRegistry, TransportId) {
        let mut registry = TransportRegistry::new();
        let id = TransportId::new();
        registry
            .insert(TransportEntry::new(id, peer, direction))
            .unwrap();
        (registry, id)
    }

    #[test]
    fn test_transition_table() {
        use TransportState::*;
        assert!(New.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Connected));
        assert!(Connected.can_transition_to(Closed));
        assert!(New.can_transition_to(Closed));

        assert!(!New.can_transition_to(Connected));
        assert!(!Connected.can_transition_to(Connecting));
        assert!(!Closed.can_transition_to(New));
        assert!(!Closed.can_transition_to(Connected));
        assert!(!Connected.can_transition_to(New));
    }

    #[test]
    fn test_one_transport_per_direction() {
        let peer = PeerId::new();
        let (mut registry, _) = registry_with(peer, Direction::Send);

        let duplicate = registry.insert(TransportEntry::new(TransportId::new(), peer, Direction::Send));
        assert!(matches!(duplicate, Err(SignalingError::Conflict(_))));

        let recv = registry.insert(TransportEntry::new(TransportId::new(), peer, Direction::Recv));
        assert!(recv.is_ok());
        assert_eq!(registry.for_peer(peer).len(), 2);
    }

    #[test]
    fn test_require_connected_walks_the_state_machine() {
        let peer = PeerId::new();
        let (mut registry, id) = registry_with(peer, Direction::Send);

        assert!(matches!(
            registry.require_connected(peer, Direction::Send),
            Err(SignalingError::ProtocolOrder(_))
        ));
        assert!(matches!(
            registry.require_connected(peer, Direction::Recv),
            Err(SignalingError::ProtocolOrder(_))
        ));

        registry.transition(id, TransportState::Connecting).unwrap();
        assert!(registry.require_connected(peer, Direction::Send).is_err());

        registry.transition(id, TransportState::Connected).unwrap();
        assert_eq!(registry.require_connected(peer, Direction::Send).unwrap(), id);
    }

    #[test]
    fn test_illegal_transition_rejected() {
        let peer = PeerId::new();
        let (mut registry, id) = registry_with(peer, Direction::Recv);

        let result = registry.transition(id, TransportState::Connected);
        assert!(matches!(result, Err(SignalingError::ProtocolOrder(_))));
        assert_eq!(registry.get(id).unwrap().state(), TransportState::New);
    }

    #[test]
    fn test_close_is_terminal() {
        let peer = PeerId::new();
        let (mut registry, id) = registry_with(peer, Direction::Send);
        let mut watcher = registry.get(id).unwrap().subscribe();

        let (entry, previous) = registry.close(id).unwrap();
        assert_eq!(entry.id, id);
        assert_eq!(previous, TransportState::New);
        assert_eq!(*watcher.borrow_and_update(), TransportState::Closed);

        assert!(registry.get_for_peer(peer, Direction::Send).is_none());
        assert!(registry.is_empty());
        assert!(matches!(
            registry.transition(id, TransportState::Connecting),
            Err(SignalingError::NotFound(_))
        ));
        assert!(registry.close(id).is_none());
    }
}
