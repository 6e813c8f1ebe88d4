//! Peer session registry
//!
//! Authoritative map of remote peer id to its [`PeerEntry`]. At most one entry per id
//! and never an entry for the local user.

use std::collections::{BTreeMap, HashSet};

use super::peer::PeerEntry;
use crate::protocol::PeerId;

/// Result of diffing a membership snapshot against the held entries
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcilePlan {
    /// New members, in snapshot order
    pub create: Vec<PeerId>,
    /// Held entries no longer present, sorted
    pub remove: Vec<PeerId>,
}

impl ReconcilePlan {
    pub fn is_empty(&self) -> bool {
        self.create.is_empty() && self.remove.is_empty()
    }
}

pub struct PeerRegistry<T> {
    entries: BTreeMap<PeerId, PeerEntry<T>>,
    next_generation: u64,
}

impl<T> PeerRegistry<T> {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            next_generation: 1,
        }
    }

    /// Generation for the next entry instance
    pub fn next_generation(&mut self) -> u64 {
        let generation = self.next_generation;
        self.next_generation += 1;
        generation
    }

    /// Insert an entry. An entry for an id already held is handed back.
    pub fn insert(&mut self, entry: PeerEntry<T>) -> Option<PeerEntry<T>> {
        if self.entries.contains_key(&entry.peer_id()) {
            return Some(entry);
        }
        self.entries.insert(entry.peer_id(), entry);
        None
    }

    pub fn remove(&mut self, peer_id: PeerId) -> Option<PeerEntry<T>> {
        self.entries.remove(&peer_id)
    }

    /// Remove every entry, in id order
    pub fn drain(&mut self) -> Vec<PeerEntry<T>> {
        std::mem::take(&mut self.entries).into_values().collect()
    }

    pub fn get(&self, peer_id: PeerId) -> Option<&PeerEntry<T>> {
        self.entries.get(&peer_id)
    }

    pub fn get_mut(&mut self, peer_id: PeerId) -> Option<&mut PeerEntry<T>> {
        self.entries.get_mut(&peer_id)
    }

    pub fn contains(&self, peer_id: PeerId) -> bool {
        self.entries.contains_key(&peer_id)
    }

    /// Held ids, sorted
    pub fn ids(&self) -> Vec<PeerId> {
        self.entries.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Diff a membership snapshot against the held entries.
    ///
    /// Duplicates count once, the local user is skipped.
    pub fn plan(&self, snapshot: &[PeerId], self_id: PeerId) -> ReconcilePlan {
        let mut seen = HashSet::new();
        let mut create = Vec::new();

        for &peer_id in snapshot {
            if !seen.insert(peer_id) || peer_id == self_id {
                continue;
            }
            if !self.entries.contains_key(&peer_id) {
                create.push(peer_id);
            }
        }

        let remove = self
            .entries
            .keys()
            .filter(|id| !seen.contains(id))
            .copied()
            .collect();

        ReconcilePlan { create, remove }
    }
}

impl<T> Default for PeerRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}
