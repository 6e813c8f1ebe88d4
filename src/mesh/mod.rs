//! Full-mesh call orchestration
//!
//! Reconciles the relay's membership snapshots into one negotiated transport per
//! remote participant and keeps those transports alive.

mod orchestrator;
mod peer;
mod registry;
mod session;

pub use orchestrator::{MeshClient, MeshEvent, MeshHandle, MeshSnapshot, PeerSnapshot};
pub use peer::{PeerEntry, PendingRecovery, RecoveryDecision, RECONNECT_TIMEOUT};
pub use registry::{PeerRegistry, ReconcilePlan};
pub use session::Session;
