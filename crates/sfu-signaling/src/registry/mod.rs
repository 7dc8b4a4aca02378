//! Per-room resource registries.
//!
//! [`RoomState`] groups the transport, producer and consumer registries with
//! the session directory so the gateway can apply a multi-registry change
//! under one lock. The cascade helpers here only touch bookkeeping and queue
//! notifications; the engine-side objects they return in a [`Teardown`] are
//! released by the caller once the lock is dropped.
//!
//! Cascade rules:
//!
//! ```text
//! peer removed      -> its transports closed (and anything left over)
//! transport closed  -> producers and consumers on it closed
//! producer closed   -> every dependent consumer closed, owner notified
//! queue overflowed  -> peer removed as above
//! ```

pub mod capabilities;
pub mod consumers;
pub mod directory;
pub mod producers;
pub mod transports;

pub use capabilities::CapabilityRegistry;
pub use consumers::{ConsumerEntry, ConsumerRegistry, ConsumerState};
pub use directory::{PeerSession, PeerSnapshot, SessionDirectory};
pub use producers::{ProducerEntry, ProducerRegistry};
pub use transports::{TransportEntry, TransportRegistry, TransportState};

use crate::signaling::protocol::{Notification, ProducerClosed};

use common::types::{ConsumerId, PeerId, ProducerId, TransportId};
use std::collections::HashSet;

/// Engine objects to release after a cascade, plus what it notified.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Teardown {
    pub transports: Vec<TransportId>,
    pub producers: Vec<ProducerId>,
    pub consumers: Vec<ConsumerId>,
    /// `producer-closed` notifications delivered to consumer owners.
    pub producer_closed_sent: usize,
}

impl Teardown {
    pub fn merge(&mut self, other: Teardown) {
        self.transports.extend(other.transports);
        self.producers.extend(other.producers);
        self.consumers.extend(other.consumers);
        self.producer_closed_sent += other.producer_closed_sent;
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.transports.is_empty() && self.producers.is_empty() && self.consumers.is_empty()
    }
}

/// Engine closes that arrived for ids not registered yet.
///
/// A creation request registers its object only after the engine call
/// returns, so the engine may close the object first. The gateway records
/// such closes while creations are in flight and checks them before
/// registering.
#[derive(Debug, Default)]
pub struct EarlyCloses {
    producers: HashSet<ProducerId>,
    transports: HashSet<TransportId>,
}

impl EarlyCloses {
    pub fn record_producer(&mut self, producer_id: ProducerId) {
        self.producers.insert(producer_id);
    }

    pub fn record_transport(&mut self, transport_id: TransportId) {
        self.transports.insert(transport_id);
    }

    /// Whether the producer was closed before registration. Consumes the record.
    pub fn take_producer(&mut self, producer_id: ProducerId) -> bool {
        self.producers.remove(&producer_id)
    }

    /// Whether the transport was closed before registration. Consumes the record.
    pub fn take_transport(&mut self, transport_id: TransportId) -> bool {
        self.transports.remove(&transport_id)
    }

    pub fn clear(&mut self) {
        self.producers.clear();
        self.transports.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.producers.len() + self.transports.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Mutable state of the single room.
#[derive(Debug, Default)]
pub struct RoomState {
    pub transports: TransportRegistry,
    pub producers: ProducerRegistry,
    pub consumers: ConsumerRegistry,
    pub directory: SessionDirectory,
    pub early_closes: EarlyCloses,
}

impl RoomState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Close a producer and every consumer reading from it.
    ///
    /// Each dependent consumer's owner receives one `producer-closed`.
    pub fn close_producer(&mut self, producer_id: ProducerId) -> Option<Teardown> {
        let producer = self.producers.remove(producer_id)?;
        self.directory.forget_producer(producer.peer_id, producer_id);

        let mut teardown = Teardown {
            producers: vec![producer_id],
            ..Teardown::default()
        };
        for consumer in self.consumers.remove_for_producer(producer_id) {
            self.directory.forget_consumer(consumer.peer_id, consumer.id);
            let delivered = self.directory.notify(
                consumer.peer_id,
                Notification::ProducerClosed(ProducerClosed {
                    producer_id,
                    consumer_id: consumer.id,
                    kind: consumer.kind,
                }),
            );
            if delivered {
                teardown.producer_closed_sent += 1;
            }
            teardown.consumers.push(consumer.id);
        }
        Some(teardown)
    }

    /// Drop a single consumer.
    pub fn close_consumer(&mut self, consumer_id: ConsumerId) -> Option<ConsumerEntry> {
        let consumer = self.consumers.remove(consumer_id)?;
        self.directory.forget_consumer(consumer.peer_id, consumer_id);
        Some(consumer)
    }

    /// Close a transport and cascade to the producers and consumers on it.
    ///
    /// Returns the removed entry (already in `Closed`) and the teardown.
    pub fn close_transport(&mut self, transport_id: TransportId) -> Option<(TransportEntry, Teardown)> {
        let (entry, _previous) = self.transports.close(transport_id)?;
        self.directory.forget_transport(entry.peer_id, transport_id);

        let mut teardown = Teardown {
            transports: vec![transport_id],
            ..Teardown::default()
        };
        for producer_id in self.producers.for_transport(transport_id) {
            if let Some(cascade) = self.close_producer(producer_id) {
                teardown.merge(cascade);
            }
        }
        for consumer_id in self.consumers.for_transport(transport_id) {
            if self.close_consumer(consumer_id).is_some() {
                teardown.consumers.push(consumer_id);
            }
        }
        Some((entry, teardown))
    }

    /// Remove a peer and everything it owns.
    ///
    /// The peer leaves the directory first, so it is excluded from every
    /// notification the cascade produces and no new resource can be
    /// registered for it.
    pub fn remove_peer(&mut self, peer_id: PeerId) -> Option<(PeerSession, Teardown)> {
        let session = self.directory.deregister(peer_id)?;

        let mut teardown = Teardown::default();
        for transport_id in self.transports.for_peer(peer_id) {
            if let Some((_, cascade)) = self.close_transport(transport_id) {
                teardown.merge(cascade);
            }
        }

        // Anything not attached to a transport of this peer.
        let producers: Vec<ProducerId> = self.producers.for_peer(peer_id).iter().map(|p| p.id).collect();
        for producer_id in producers {
            if let Some(cascade) = self.close_producer(producer_id) {
                teardown.merge(cascade);
            }
        }
        let consumers: Vec<ConsumerId> = self.consumers.for_peer(peer_id).iter().map(|c| c.id).collect();
        for consumer_id in consumers {
            if self.close_consumer(consumer_id).is_some() {
                teardown.consumers.push(consumer_id);
            }
        }

        Some((session, teardown))
    }

    /// Remove every peer whose notification queue overflowed.
    ///
    /// Removing a peer can overflow another subscriber's queue in turn, so
    /// this repeats until no overflowed peer is left.
    pub fn evict_overflowed(&mut self) -> (Vec<PeerId>, Teardown) {
        let mut evicted = Vec::new();
        let mut teardown = Teardown::default();
        loop {
            let overflowed = self.directory.take_overflowed();
            if overflowed.is_empty() {
                break;
            }
            for peer_id in overflowed {
                if let Some((_, cascade)) = self.remove_peer(peer_id) {
                    teardown.merge(cascade);
                    evicted.push(peer_id);
                }
            }
        }
        (evicted, teardown)
    }
}
