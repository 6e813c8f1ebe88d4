//! Relay wire protocol
//!
//! Defines the JSON messages exchanged with the signaling relay and the
//! negotiation payloads carried inside peer events.

mod message;
mod negotiation;

pub use message::{
    PeerEvent, PeerEventKind, PeerId, PeerLogData, ServerMessage, ServerMessageType,
    SignalMessage,
};
pub use negotiation::{IceCandidate, SdpType, SessionDescription};
