//! Network error types

use thiserror::Error;

use crate::protocol::PeerId;

/// Errors that can occur in the signaling channel and the mesh orchestrator
#[derive(Error, Debug)]
pub enum MeshError {
    #[error("Already connected")]
    AlreadyConnected,

    #[error("Not connected")]
    NotConnected,

    #[error("Not authenticated")]
    NotAuthenticated,

    #[error("Already in call")]
    AlreadyInCall,

    #[error("Signaling error: {0}")]
    SignalingError(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Peer {0} already registered")]
    DuplicatePeer(PeerId),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Orchestrator stopped")]
    Stopped,
}

/// Errors reported by a transport capability
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    #[error("Invalid session description: {0}")]
    InvalidDescription(String),

    #[error("Candidate received before remote description")]
    CandidateBeforeDescription,

    #[error("Invalid candidate: {0}")]
    InvalidCandidate(String),

    #[error("Media engine error: {0}")]
    Engine(String),
}
