//! Session directory.
//!
//! Maps each connected peer to the resources it owns and to its notification
//! channel. The directory answers room-wide questions ("is anyone
//! publishing?", "who joined first?") and is the source of truth for
//! whether a peer is still connected: resources created for a peer that is
//! no longer listed here are released instead of registered.

use crate::errors::SignalingError;
use crate::observability::metrics;
use crate::signaling::protocol::Notification;

use chrono::{DateTime, Utc};
use common::types::{ConsumerId, Direction, MediaKind, PeerId, ProducerId, TransportId};
use std::collections::{BTreeMap, HashMap, HashSet};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

/// A quarter of each peer's notification queue is held back for
/// lifecycle notifications.
const LIFECYCLE_RESERVE_DIVISOR: usize = 4;

/// Resources and delivery channel for one connected peer.
#[derive(Debug)]
pub struct PeerSession {
    pub peer_id: PeerId,
    /// Join order; lower joined earlier.
    pub seq: u64,
    pub joined_at: DateTime<Utc>,
    /// Set once `join-room` returned the room capabilities.
    pub capabilities_loaded: bool,
    pub transports: BTreeMap<Direction, TransportId>,
    pub producers: BTreeMap<MediaKind, ProducerId>,
    pub consumers: HashSet<ConsumerId>,
    notifier: mpsc::Sender<Notification>,
}

impl PeerSession {
    #[must_use]
    pub fn has_produced(&self) -> bool {
        !self.producers.is_empty()
    }

    #[must_use]
    pub fn is_consuming(&self) -> bool {
        !self.consumers.is_empty()
    }
}

/// Read-only view of a peer's entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSnapshot {
    pub peer_id: PeerId,
    pub capabilities_loaded: bool,
    pub transports: Vec<(Direction, TransportId)>,
    pub producers: Vec<(MediaKind, ProducerId)>,
    pub consumers: Vec<ConsumerId>,
}

#[derive(Debug, Default)]
pub struct SessionDirectory {
    peers: HashMap<PeerId, PeerSession>,
    next_seq: u64,
    overflowed: HashSet<PeerId>,
}

impl SessionDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        peer_id: PeerId,
        notifier: mpsc::Sender<Notification>,
    ) -> Result<(), SignalingError> {
        if self.peers.contains_key(&peer_id) {
            return Err(SignalingError::Conflict(format!("peer {peer_id} already connected")));
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.peers.insert(
            peer_id,
            PeerSession {
                peer_id,
                seq,
                joined_at: Utc::now(),
                capabilities_loaded: false,
                transports: BTreeMap::new(),
                producers: BTreeMap::new(),
                consumers: HashSet::new(),
                notifier,
            },
        );
        Ok(())
    }

    /// Remove a peer from the directory and from every broadcast.
    pub fn deregister(&mut self, peer_id: PeerId) -> Option<PeerSession> {
        self.peers.remove(&peer_id)
    }

    #[must_use]
    pub fn is_active(&self, peer_id: PeerId) -> bool {
        self.peers.contains_key(&peer_id)
    }

    #[must_use]
    pub fn get(&self, peer_id: PeerId) -> Option<&PeerSession> {
        self.peers.get(&peer_id)
    }

    pub fn require(&self, peer_id: PeerId) -> Result<&PeerSession, SignalingError> {
        self.peers
            .get(&peer_id)
            .ok_or_else(|| SignalingError::NotFound(format!("peer {peer_id} is not connected")))
    }

    pub fn mark_capabilities_loaded(&mut self, peer_id: PeerId) -> Result<(), SignalingError> {
        let session = self.session_mut(peer_id)?;
        session.capabilities_loaded = true;
        Ok(())
    }

    pub fn record_transport(
        &mut self,
        peer_id: PeerId,
        direction: Direction,
        transport_id: TransportId,
    ) -> Result<(), SignalingError> {
        self.session_mut(peer_id)?
            .transports
            .insert(direction, transport_id);
        Ok(())
    }

    pub fn forget_transport(&mut self, peer_id: PeerId, transport_id: TransportId) {
        if let Some(session) = self.peers.get_mut(&peer_id) {
            session.transports.retain(|_, id| *id != transport_id);
        }
    }

    pub fn record_producer(
        &mut self,
        peer_id: PeerId,
        kind: MediaKind,
        producer_id: ProducerId,
    ) -> Result<(), SignalingError> {
        self.session_mut(peer_id)?.producers.insert(kind, producer_id);
        Ok(())
    }

    pub fn forget_producer(&mut self, peer_id: PeerId, producer_id: ProducerId) {
        if let Some(session) = self.peers.get_mut(&peer_id) {
            session.producers.retain(|_, id| *id != producer_id);
        }
    }

    pub fn record_consumer(
        &mut self,
        peer_id: PeerId,
        consumer_id: ConsumerId,
    ) -> Result<(), SignalingError> {
        self.session_mut(peer_id)?.consumers.insert(consumer_id);
        Ok(())
    }

    pub fn forget_consumer(&mut self, peer_id: PeerId, consumer_id: ConsumerId) {
        if let Some(session) = self.peers.get_mut(&peer_id) {
            session.consumers.remove(&consumer_id);
        }
    }

    /// Whether any connected peer currently has a producer.
    #[must_use]
    pub fn publisher_exists(&self) -> bool {
        self.peers.values().any(PeerSession::has_produced)
    }

    /// Earliest-joined peer with at least one producer, other than `except`.
    #[must_use]
    pub fn first_publisher(&self, except: PeerId) -> Option<PeerId> {
        self.peers
            .values()
            .filter(|s| s.peer_id != except && s.has_produced())
            .min_by_key(|s| s.seq)
            .map(|s| s.peer_id)
    }

    /// Queue a notification for one peer. Returns false if it was not delivered.
    ///
    /// A notification that must be delivered but finds the queue full marks
    /// the peer as overflowed; see [`SessionDirectory::take_overflowed`].
    pub fn notify(&mut self, peer_id: PeerId, notification: Notification) -> bool {
        let delivery = match self.peers.get(&peer_id) {
            Some(session) => deliver(session, notification),
            None => return false,
        };
        self.record(peer_id, delivery)
    }

    /// Queue a notification for every peer except `except`. Returns the
    /// number of peers it was delivered to.
    pub fn broadcast(&mut self, notification: &Notification, except: Option<PeerId>) -> usize {
        let deliveries: Vec<(PeerId, Delivery)> = self
            .peers
            .values()
            .filter(|s| Some(s.peer_id) != except)
            .map(|s| (s.peer_id, deliver(s, notification.clone())))
            .collect();
        deliveries
            .into_iter()
            .filter(|(peer_id, delivery)| self.record(*peer_id, *delivery))
            .count()
    }

    /// Peers whose queue overflowed on a notification that could not be
    /// dropped. Their client view is stale and they must be disconnected.
    pub fn take_overflowed(&mut self) -> Vec<PeerId> {
        let mut overflowed: Vec<PeerId> = self.overflowed.drain().collect();
        overflowed.retain(|peer_id| self.peers.contains_key(peer_id));
        overflowed
    }

    fn record(&mut self, peer_id: PeerId, delivery: Delivery) -> bool {
        match delivery {
            Delivery::Queued => true,
            Delivery::Overflowed => {
                self.overflowed.insert(peer_id);
                false
            }
            Delivery::Dropped | Delivery::Closed => false,
        }
    }

    #[must_use]
    pub fn snapshot(&self, peer_id: PeerId) -> Option<PeerSnapshot> {
        self.peers.get(&peer_id).map(|s| {
            let mut consumers: Vec<ConsumerId> = s.consumers.iter().copied().collect();
            consumers.sort_by_key(|id| id.0);
            PeerSnapshot {
                peer_id: s.peer_id,
                capabilities_loaded: s.capabilities_loaded,
                transports: s.transports.iter().map(|(d, id)| (*d, *id)).collect(),
                producers: s.producers.iter().map(|(k, id)| (*k, *id)).collect(),
                consumers,
            }
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    fn session_mut(&mut self, peer_id: PeerId) -> Result<&mut PeerSession, SignalingError> {
        self.peers
            .get_mut(&peer_id)
            .ok_or_else(|| SignalingError::NotFound(format!("peer {peer_id} is not connected")))
    }
}

/// Outcome of queueing one notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    Queued,
    /// Best-effort notification skipped to keep room for the rest.
    Dropped,
    /// Queue full on a notification that had to be delivered.
    Overflowed,
    /// Socket writer already gone; disconnect cleanup follows.
    Closed,
}

/// Free slots kept for lifecycle notifications. Best-effort traffic is
/// dropped once the queue is down to this many.
fn lifecycle_reserve(notifier: &mpsc::Sender<Notification>) -> usize {
    (notifier.max_capacity() / LIFECYCLE_RESERVE_DIVISOR).max(1)
}

fn deliver(session: &PeerSession, notification: Notification) -> Delivery {
    let best_effort = notification.is_best_effort();
    if best_effort && session.notifier.capacity() <= lifecycle_reserve(&session.notifier) {
        metrics::record_notification_dropped();
        debug!(
            target: "sfu.gateway",
            peer_id = %session.peer_id,
            event = notification.event_name(),
            "Best-effort notification dropped, peer outbound queue nearly full"
        );
        return Delivery::Dropped;
    }

    match session.notifier.try_send(notification) {
        Ok(()) => Delivery::Queued,
        Err(TrySendError::Full(notification)) if best_effort => {
            metrics::record_notification_dropped();
            debug!(
                target: "sfu.gateway",
                peer_id = %session.peer_id,
                event = notification.event_name(),
                "Best-effort notification dropped, peer outbound queue full"
            );
            Delivery::Dropped
        }
        Err(TrySendError::Full(notification)) => {
            metrics::record_notification_dropped();
            warn!(
                target: "sfu.gateway",
                peer_id = %session.peer_id,
                event = notification.event_name(),
                "Peer outbound queue overflowed, peer will be disconnected"
            );
            Delivery::Overflowed
        }
        Err(TrySendError::Closed(_)) => Delivery::Closed,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::signaling::protocol::{ChatBroadcast, ProducerClosed};

    fn chat(text: &str) -> Notification {
        Notification::ChatMessage(ChatBroadcast::new("ana".to_string(), text.to_string()))
    }

    #[test]
    fn test_register_twice_conflicts() {
        let mut directory = SessionDirectory::new();
        let peer = PeerId::new();
        let (tx, _rx) = mpsc::channel(4);
        directory.register(peer, tx.clone()).unwrap();
        assert!(matches!(
            directory.register(peer, tx),
            Err(SignalingError::Conflict(_))
        ));
        assert_eq!(directory.len(), 1);
    }

    #[test]
    fn test_first_publisher_follows_join_order() {
        let mut directory = SessionDirectory::new();
        let (tx, _rx) = mpsc::channel(4);
        let first = PeerId::new();
        let second = PeerId::new();
        let viewer = PeerId::new();
        directory.register(first, tx.clone()).unwrap();
        directory.register(second, tx.clone()).unwrap();
        directory.register(viewer, tx).unwrap();

        assert!(!directory.publisher_exists());
        assert_eq!(directory.first_publisher(viewer), None);

        directory
            .record_producer(second, MediaKind::Video, ProducerId::new())
            .unwrap();
        assert_eq!(directory.first_publisher(viewer), Some(second));

        directory
            .record_producer(first, MediaKind::Audio, ProducerId::new())
            .unwrap();
        assert_eq!(directory.first_publisher(viewer), Some(first));
        assert_eq!(directory.first_publisher(first), Some(second));
        assert!(directory.publisher_exists());
    }

    #[test]
    fn test_broadcast_skips_sender_when_asked() {
        let mut directory = SessionDirectory::new();
        let alice = PeerId::new();
        let bob = PeerId::new();
        let (alice_tx, mut alice_rx) = mpsc::channel(4);
        let (bob_tx, mut bob_rx) = mpsc::channel(4);
        directory.register(alice, alice_tx).unwrap();
        directory.register(bob, bob_tx).unwrap();

        assert_eq!(directory.broadcast(&chat("everyone"), None), 2);
        assert_eq!(directory.broadcast(&chat("not alice"), Some(alice)), 1);

        assert_eq!(alice_rx.try_recv().unwrap(), chat("everyone"));
        assert!(alice_rx.try_recv().is_err());
        assert_eq!(bob_rx.try_recv().unwrap(), chat("everyone"));
        assert_eq!(bob_rx.try_recv().unwrap(), chat("not alice"));
    }

    fn producer_closed() -> Notification {
        Notification::ProducerClosed(ProducerClosed {
            producer_id: ProducerId::new(),
            consumer_id: ConsumerId::new(),
            kind: MediaKind::Video,
        })
    }

    #[test]
    fn test_best_effort_stops_at_lifecycle_reserve() {
        let mut directory = SessionDirectory::new();
        let peer = PeerId::new();
        let (tx, mut rx) = mpsc::channel(4);
        directory.register(peer, tx).unwrap();

        // Three of four slots; the last is held back.
        for n in 0..3 {
            assert!(directory.notify(peer, chat(&n.to_string())));
        }
        assert!(!directory.notify(peer, chat("dropped")));
        assert!(directory.notify(peer, producer_closed()));
        assert!(directory.take_overflowed().is_empty());
        assert!(!directory.notify(PeerId::new(), chat("nobody")));

        let mut received = Vec::new();
        while let Ok(notification) = rx.try_recv() {
            received.push(notification.event_name());
        }
        assert_eq!(
            received,
            vec!["chat-message", "chat-message", "chat-message", "producer-closed"]
        );
    }

    #[test]
    fn test_lifecycle_overflow_marks_peer() {
        let mut directory = SessionDirectory::new();
        let slow = PeerId::new();
        let fine = PeerId::new();
        let (slow_tx, _slow_rx) = mpsc::channel(1);
        let (fine_tx, _fine_rx) = mpsc::channel(8);
        directory.register(slow, slow_tx).unwrap();
        directory.register(fine, fine_tx).unwrap();

        assert!(directory.notify(slow, producer_closed()));
        assert!(!directory.notify(slow, producer_closed()));
        assert!(directory.notify(fine, producer_closed()));

        assert_eq!(directory.take_overflowed(), vec![slow]);
        assert!(directory.take_overflowed().is_empty());
    }

    #[test]
    fn test_overflowed_peer_already_gone_is_skipped() {
        let mut directory = SessionDirectory::new();
        let peer = PeerId::new();
        let (tx, _rx) = mpsc::channel(1);
        directory.register(peer, tx).unwrap();

        directory.notify(peer, producer_closed());
        directory.notify(peer, producer_closed());
        directory.deregister(peer);
        assert!(directory.take_overflowed().is_empty());
    }

    #[test]
    fn test_deregister_returns_owned_resources() {
        let mut directory = SessionDirectory::new();
        let peer = PeerId::new();
        let (tx, _rx) = mpsc::channel(4);
        directory.register(peer, tx).unwrap();

        let transport = TransportId::new();
        let consumer = ConsumerId::new();
        directory
            .record_transport(peer, Direction::Recv, transport)
            .unwrap();
        directory.record_consumer(peer, consumer).unwrap();
        assert!(directory.get(peer).unwrap().is_consuming());

        let session = directory.deregister(peer).unwrap();
        assert_eq!(session.transports.get(&Direction::Recv), Some(&transport));
        assert!(session.consumers.contains(&consumer));
        assert!(!directory.is_active(peer));
        assert!(matches!(
            directory.record_consumer(peer, ConsumerId::new()),
            Err(SignalingError::NotFound(_))
        ));
    }
}
