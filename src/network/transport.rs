//! Transport capability
//!
//! The orchestrator never talks to a media engine directly. It negotiates through
//! [`PeerTransport`] and learns about connectivity through [`TransportEvent`]s that
//! the transport pushes into a [`TransportEventSink`].

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use super::error::TransportError;
use crate::protocol::{IceCandidate, PeerId, SessionDescription};

/// Which side of a pair sends the offer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Offerer,
    Answerer,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Offerer => f.write_str("offerer"),
            Role::Answerer => f.write_str("answerer"),
        }
    }
}

/// Connectivity state of one peer transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectivityState {
    #[default]
    New,
    Checking,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectivityState {
    /// States that trigger recovery on the offering side
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            ConnectivityState::Disconnected | ConnectivityState::Failed
        )
    }
}

impl fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectivityState::New => "new",
            ConnectivityState::Checking => "checking",
            ConnectivityState::Connected => "connected",
            ConnectivityState::Disconnected => "disconnected",
            ConnectivityState::Failed => "failed",
            ConnectivityState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Candidate gathering progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatheringState {
    New,
    Gathering,
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
    Unknown,
}

/// Remote media announced by a transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub track_id: String,
    pub stream_id: String,
    pub kind: MediaKind,
}

/// One end of the selected candidate pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateSummary {
    pub address: String,
    pub port: u16,
    pub candidate_type: String,
}

impl fmt::Display for CandidateSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} ({})", self.address, self.port, self.candidate_type)
    }
}

/// The nominated, succeeded candidate pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedCandidatePair {
    pub local: CandidateSummary,
    pub remote: CandidateSummary,
}

impl fmt::Display for SelectedCandidatePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "local {} <-> remote {}", self.local, self.remote)
    }
}

/// Notifications pushed by a transport
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A gathered local candidate; `None` marks the end of gathering
    LocalCandidate(Option<IceCandidate>),
    ConnectivityChanged(ConnectivityState),
    GatheringChanged(GatheringState),
    RemoteTrack(RemoteTrack),
}

/// Where a transport delivers its events.
///
/// Events may be emitted from any thread; the sink forwards them to the owner's queue.
#[derive(Clone)]
pub struct TransportEventSink {
    peer_id: PeerId,
    emit: Arc<dyn Fn(TransportEvent) + Send + Sync>,
}

impl TransportEventSink {
    pub fn new<F>(peer_id: PeerId, emit: F) -> Self
    where
        F: Fn(TransportEvent) + Send + Sync + 'static,
    {
        Self {
            peer_id,
            emit: Arc::new(emit),
        }
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn emit(&self, event: TransportEvent) {
        (self.emit)(event)
    }
}

impl fmt::Debug for TransportEventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportEventSink")
            .field("peer_id", &self.peer_id)
            .finish_non_exhaustive()
    }
}

/// Negotiation surface of one peer connection
#[async_trait]
pub trait PeerTransport: Send + Sync + 'static {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;

    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;

    async fn set_local_description(&self, desc: SessionDescription)
        -> Result<(), TransportError>;

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError>;

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;

    /// Statistics query for the nominated, succeeded candidate pair
    async fn selected_candidate_pair(
        &self,
    ) -> Result<Option<SelectedCandidatePair>, TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

/// Creates peer transports
#[async_trait]
pub trait TransportFactory: Send + Sync + 'static {
    type Transport: PeerTransport;

    /// Create a transport for `peer_id`.
    ///
    /// Offerers must be created with inbound audio and video so the first offer
    /// asks for both.
    async fn create(
        &self,
        peer_id: PeerId,
        role: Role,
        events: TransportEventSink,
    ) -> Result<Self::Transport, TransportError>;
}
