//! meshcall - Full-mesh call signaling client
//!
//! This library connects to a signaling relay, turns the relay's membership
//! snapshots into one peer-to-peer transport per participant, and keeps those
//! transports alive.

pub mod config;
pub mod mesh;
pub mod network;
pub mod protocol;

pub use config::{IceServerConfig, MeshConfig};
pub use mesh::{MeshClient, MeshEvent, MeshHandle, MeshSnapshot};
pub use network::{MeshError, TransportError, WebRtcTransportFactory};
pub use protocol::PeerId;
