//! Per-connection session state

use std::collections::BTreeSet;

use tracing::debug;

use crate::network::{MeshError, Role};
use crate::protocol::PeerId;

/// Session of one authenticated control-channel lifetime
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    self_id: PeerId,
    in_call: bool,
    /// True until the first membership reconciliation of a call completes
    initial_offerer: bool,
    /// Peers we owe an offer to whose offering entry could not be created
    lost_offers: BTreeSet<PeerId>,
}

impl Session {
    /// Session created by a successful authentication
    pub fn authenticated(self_id: PeerId) -> Self {
        Self {
            self_id,
            in_call: false,
            initial_offerer: true,
            lost_offers: BTreeSet::new(),
        }
    }

    pub fn self_id(&self) -> PeerId {
        self.self_id
    }

    pub fn in_call(&self) -> bool {
        self.in_call
    }

    pub fn initial_offerer(&self) -> bool {
        self.initial_offerer
    }

    pub fn start_call(&mut self) -> Result<(), MeshError> {
        if self.in_call {
            return Err(MeshError::AlreadyInCall);
        }
        self.in_call = true;
        debug!("User {} joined the call", self.self_id);
        Ok(())
    }

    /// Leave the call. Returns false if there was no call.
    pub fn end_call(&mut self) -> bool {
        let was_in_call = self.in_call;
        self.in_call = false;
        self.initial_offerer = true;
        self.lost_offers.clear();
        was_in_call
    }

    /// Role for `peer_id` when the next reconciliation creates it
    pub fn role_for(&self, peer_id: PeerId) -> Role {
        if self.initial_offerer || self.lost_offers.contains(&peer_id) {
            Role::Offerer
        } else {
            Role::Answerer
        }
    }

    /// Remember that the offering entry for `peer_id` is gone, so the next
    /// reconciliation offers again instead of waiting for an offer that never comes
    pub fn offer_lost(&mut self, peer_id: PeerId) {
        if self.in_call {
            self.lost_offers.insert(peer_id);
        }
    }

    pub fn offer_restored(&mut self, peer_id: PeerId) {
        self.lost_offers.remove(&peer_id);
    }

    /// Forget owed offers to peers that are no longer members
    pub fn retain_lost_offers(&mut self, members: &[PeerId]) {
        self.lost_offers.retain(|id| members.contains(id));
    }

    pub fn lost_offers(&self) -> impl Iterator<Item = PeerId> + '_ {
        self.lost_offers.iter().copied()
    }

    /// Members joining after the first snapshot of a call offer to us
    pub fn finish_reconciliation(&mut self) {
        self.initial_offerer = false;
    }
}
