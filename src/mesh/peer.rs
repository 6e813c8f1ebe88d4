//! Per-peer negotiation state machine
//!
//! A [`PeerEntry`] drives the offer/answer/candidate exchange with one remote peer
//! and tracks its connectivity. Recovery from connectivity failures is guarded by an
//! epoch counter: a recovery timer captures the epoch when it is scheduled and is
//! stale once the epoch has moved on.

use std::time::Duration;

use tracing::debug;

use crate::network::{ConnectivityState, PeerTransport, Role, TransportError};
use crate::protocol::{IceCandidate, PeerId, SessionDescription};

/// Grace period before a failed offerer connection is recreated
pub const RECONNECT_TIMEOUT: Duration = Duration::from_millis(4000);

/// A scheduled recovery that has not fired yet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingRecovery {
    pub epoch: u64,
    pub trigger: ConnectivityState,
}

/// What the owner should do after a connectivity change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryDecision {
    None,
    /// Schedule a recovery check carrying this epoch
    Schedule { epoch: u64 },
    /// Same failure reported again while a recovery is pending
    AlreadyPending,
    /// Answerers wait for the offering side to recreate the connection
    LeftToPeer,
}

/// Negotiation state for one remote peer
pub struct PeerEntry<T> {
    peer_id: PeerId,
    role: Role,
    generation: u64,
    state: ConnectivityState,
    epoch: u64,
    pending_recovery: Option<PendingRecovery>,
    stats_verified: bool,
    remote_description_set: bool,
    remote_stream: Option<String>,
    transport: T,
}

impl<T> PeerEntry<T> {
    pub fn new(peer_id: PeerId, role: Role, generation: u64, transport: T) -> Self {
        Self {
            peer_id,
            role,
            generation,
            state: ConnectivityState::New,
            epoch: 0,
            pending_recovery: None,
            stats_verified: false,
            remote_description_set: false,
            remote_stream: None,
            transport,
        }
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn state(&self) -> ConnectivityState {
        self.state
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn pending_recovery(&self) -> Option<PendingRecovery> {
        self.pending_recovery
    }

    pub fn stats_verified(&self) -> bool {
        self.stats_verified
    }

    pub fn remote_description_set(&self) -> bool {
        self.remote_description_set
    }

    pub fn remote_stream(&self) -> Option<&str> {
        self.remote_stream.as_deref()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Apply a connectivity change reported by the transport
    pub fn observe_state(&mut self, state: ConnectivityState) -> RecoveryDecision {
        if let Some(pending) = self.pending_recovery {
            if pending.trigger == state {
                return RecoveryDecision::AlreadyPending;
            }
        }

        self.state = state;
        if state != ConnectivityState::Connected {
            self.stats_verified = false;
        }

        // Any other change invalidates a scheduled recovery
        if self.pending_recovery.take().is_some() {
            self.epoch += 1;
        }

        if !state.is_failure() {
            return RecoveryDecision::None;
        }

        match self.role {
            Role::Answerer => RecoveryDecision::LeftToPeer,
            Role::Offerer => {
                self.epoch += 1;
                self.pending_recovery = Some(PendingRecovery {
                    epoch: self.epoch,
                    trigger: state,
                });
                RecoveryDecision::Schedule { epoch: self.epoch }
            }
        }
    }

    /// Consume the pending recovery if the timer for `epoch` is still current.
    ///
    /// Returns the failure state that triggered it.
    pub fn take_due_recovery(&mut self, epoch: u64) -> Option<ConnectivityState> {
        let pending = self.pending_recovery?;
        if pending.epoch != epoch || self.epoch != epoch || self.state != pending.trigger {
            return None;
        }
        self.pending_recovery = None;
        Some(pending.trigger)
    }

    /// Record a remote track's stream. Returns false for a stream other than the first.
    pub fn accept_remote_stream(&mut self, stream_id: &str) -> bool {
        match &self.remote_stream {
            Some(first) => first == stream_id,
            None => {
                self.remote_stream = Some(stream_id.to_string());
                true
            }
        }
    }

    pub fn mark_stats_verified(&mut self) {
        if self.state == ConnectivityState::Connected {
            self.stats_verified = true;
        }
    }
}

impl<T: PeerTransport> PeerEntry<T> {
    /// Offerer path: create the offer and apply it locally. The caller sends it.
    pub async fn start_offer(&mut self) -> Result<SessionDescription, TransportError> {
        if self.role != Role::Offerer {
            return Err(TransportError::Negotiation(format!(
                "peer {} is not the offering side",
                self.peer_id
            )));
        }

        let offer = self.transport.create_offer().await?;
        self.transport.set_local_description(offer.clone()).await?;
        debug!("Peer {}: offer created", self.peer_id);
        Ok(offer)
    }

    /// Answerer path: apply the remote offer and produce the answer to send back
    pub async fn accept_offer(
        &mut self,
        offer: SessionDescription,
    ) -> Result<SessionDescription, TransportError> {
        if self.role != Role::Answerer {
            return Err(TransportError::Negotiation(format!(
                "offer received from peer {} while offering",
                self.peer_id
            )));
        }

        self.transport.set_remote_description(offer).await?;
        self.remote_description_set = true;

        let answer = self.transport.create_answer().await?;
        self.transport.set_local_description(answer.clone()).await?;
        debug!("Peer {}: answer created", self.peer_id);
        Ok(answer)
    }

    pub async fn accept_answer(&mut self, answer: SessionDescription) -> Result<(), TransportError> {
        if self.role != Role::Offerer {
            return Err(TransportError::Negotiation(format!(
                "answer received from peer {} while answering",
                self.peer_id
            )));
        }

        self.transport.set_remote_description(answer).await?;
        self.remote_description_set = true;
        Ok(())
    }

    pub async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        if !self.remote_description_set {
            return Err(TransportError::CandidateBeforeDescription);
        }
        self.transport.add_remote_candidate(candidate).await
    }

    /// Release the transport; later events of this entry are stale
    pub async fn close(&mut self) -> Result<(), TransportError> {
        self.state = ConnectivityState::Closed;
        if self.pending_recovery.take().is_some() {
            self.epoch += 1;
        }
        self.transport.close().await
    }
}
