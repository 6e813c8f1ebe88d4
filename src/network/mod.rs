//! Network module for the mesh client
//!
//! Handles the relay control channel, its heartbeat, and the per-peer transport capability.

mod error;
mod heartbeat;
mod signaling;
mod transport;
mod webrtc_transport;

pub use error::{MeshError, TransportError};
pub use heartbeat::{HeartbeatMonitor, Liveness, PING_INTERVAL, PONG_TIMEOUT};
pub use signaling::{ChannelEvent, ChannelState, CloseInfo, SignalingChannel};
pub use transport::{
    CandidateSummary, ConnectivityState, GatheringState, MediaKind, PeerTransport, RemoteTrack,
    Role, SelectedCandidatePair, TransportEvent, TransportEventSink, TransportFactory,
};
pub use webrtc_transport::{WebRtcTransport, WebRtcTransportFactory};
