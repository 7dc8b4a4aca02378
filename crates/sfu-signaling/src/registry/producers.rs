//! Producer registry.
//!
//! Keyed by producer id and by `(peer, kind)`: a peer has at most one audio
//! and one video producer. A second producer of an existing kind is rejected.

use crate::errors::SignalingError;

use chrono::{DateTime, Utc};
use common::types::{MediaKind, PeerId, ProducerId, TransportId};
use serde_json::Value;
use std::collections::HashMap;

/// A registered outbound track.
#[derive(Debug, Clone)]
pub struct ProducerEntry {
    pub id: ProducerId,
    pub peer_id: PeerId,
    pub kind: MediaKind,
    pub transport_id: TransportId,
    pub paused: bool,
    /// Application data supplied by the client, relayed untouched.
    pub app_data: Value,
    pub created_at: DateTime<Utc>,
}

impl ProducerEntry {
    #[must_use]
    pub fn new(
        id: ProducerId,
        peer_id: PeerId,
        kind: MediaKind,
        transport_id: TransportId,
        app_data: Value,
    ) -> Self {
        Self {
            id,
            peer_id,
            kind,
            transport_id,
            paused: false,
            app_data,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Default)]
pub struct ProducerRegistry {
    by_id: HashMap<ProducerId, ProducerEntry>,
    by_peer_kind: HashMap<(PeerId, MediaKind), ProducerId>,
}

impl ProducerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, entry: ProducerEntry) -> Result<(), SignalingError> {
        let key = (entry.peer_id, entry.kind);
        if self.by_peer_kind.contains_key(&key) {
            return Err(SignalingError::Conflict(format!(
                "{} producer already exists",
                entry.kind
            )));
        }
        self.by_peer_kind.insert(key, entry.id);
        self.by_id.insert(entry.id, entry);
        Ok(())
    }

    #[must_use]
    pub fn get(&self, producer_id: ProducerId) -> Option<&ProducerEntry> {
        self.by_id.get(&producer_id)
    }

    #[must_use]
    pub fn contains(&self, producer_id: ProducerId) -> bool {
        self.by_id.contains_key(&producer_id)
    }

    #[must_use]
    pub fn has_kind(&self, peer_id: PeerId, kind: MediaKind) -> bool {
        self.by_peer_kind.contains_key(&(peer_id, kind))
    }

    #[must_use]
    pub fn get_by_kind(&self, peer_id: PeerId, kind: MediaKind) -> Option<&ProducerEntry> {
        self.by_peer_kind
            .get(&(peer_id, kind))
            .and_then(|id| self.by_id.get(id))
    }

    pub fn remove(&mut self, producer_id: ProducerId) -> Option<ProducerEntry> {
        let entry = self.by_id.remove(&producer_id)?;
        self.by_peer_kind.remove(&(entry.peer_id, entry.kind));
        Some(entry)
    }

    /// A peer's producers, video first.
    #[must_use]
    pub fn for_peer(&self, peer_id: PeerId) -> Vec<&ProducerEntry> {
        MediaKind::ALL
            .into_iter()
            .filter_map(|kind| self.get_by_kind(peer_id, kind))
            .collect()
    }

    #[must_use]
    pub fn for_transport(&self, transport_id: TransportId) -> Vec<ProducerId> {
        self.by_id
            .values()
            .filter(|p| p.transport_id == transport_id)
            .map(|p| p.id)
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
