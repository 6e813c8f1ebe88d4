//! Signal message definitions for the relay control channel
//!
//! Every text frame on the control channel is one JSON object of one of two shapes:
//! - server-control: `{"type": "PING", "data": ...}`
//! - peer-event: `{"from": 1, "to": 2, "event": "offer", "data": ...}`
//!
//! A frame is a peer-event iff it carries an `event` field.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Identifier the relay assigns to an authenticated user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(pub u64);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for PeerId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Server-control message types, named as the relay names them on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerMessageType {
    /// Client -> relay, carries the credential
    #[serde(rename = "USER_AUTHENTICATION")]
    Auth,
    #[serde(rename = "USER_AUTHENTICATED")]
    Authenticated,
    #[serde(rename = "JOIN_ROOM")]
    JoinRoom,
    #[serde(rename = "LEAVE_ROOM")]
    LeaveRoom,
    /// Relay -> client, carries the membership snapshot
    #[serde(rename = "ROOM_MEMBERS")]
    Members,
    #[serde(rename = "PING")]
    Ping,
    #[serde(rename = "PONG")]
    Pong,
    #[serde(rename = "SERVER_CLOSING")]
    Closing,
    #[serde(rename = "PEER_LOG")]
    PeerLog,
    /// Any type this client does not know about
    #[serde(other)]
    Unknown,
}

/// A server-control message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerMessage {
    #[serde(rename = "type")]
    pub kind: ServerMessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ServerMessage {
    pub fn new(kind: ServerMessageType) -> Self {
        Self { kind, data: None }
    }

    pub fn with_data(kind: ServerMessageType, data: Value) -> Self {
        Self {
            kind,
            data: Some(data),
        }
    }

    pub fn auth(credential: &str) -> Self {
        Self::with_data(ServerMessageType::Auth, Value::String(credential.to_string()))
    }

    pub fn ping() -> Self {
        Self::new(ServerMessageType::Ping)
    }

    pub fn join_room() -> Self {
        Self::new(ServerMessageType::JoinRoom)
    }

    pub fn leave_room() -> Self {
        Self::new(ServerMessageType::LeaveRoom)
    }

    pub fn members(peers: &[PeerId]) -> Self {
        Self::with_data(
            ServerMessageType::Members,
            Value::Array(peers.iter().map(|p| Value::from(p.0)).collect()),
        )
    }

    pub fn peer_log(log: &PeerLogData) -> Self {
        // PeerLogData only holds strings and numbers
        let data = serde_json::to_value(log).unwrap_or(Value::Null);
        Self::with_data(ServerMessageType::PeerLog, data)
    }

    /// Decode the membership snapshot carried by a `ROOM_MEMBERS` message.
    ///
    /// A missing payload is an empty room.
    pub fn member_ids(&self) -> Result<Vec<PeerId>, serde_json::Error> {
        match &self.data {
            Some(data) => serde_json::from_value(data.clone()),
            None => Ok(Vec::new()),
        }
    }
}

/// Peer negotiation event kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerEventKind {
    Offer,
    Answer,
    Candidate,
    #[serde(other)]
    Unknown,
}

impl fmt::Display for PeerEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PeerEventKind::Offer => "offer",
            PeerEventKind::Answer => "answer",
            PeerEventKind::Candidate => "candidate",
            PeerEventKind::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// A peer-event envelope, forwarded by the relay from `from` to `to`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerEvent {
    pub from: PeerId,
    pub to: PeerId,
    pub event: PeerEventKind,
    #[serde(default)]
    pub data: Value,
}

/// Payload of a `PEER_LOG` message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerLogData {
    #[serde(rename = "peerId")]
    pub peer_id: PeerId,
    pub message: String,
    #[serde(default)]
    pub objects: Vec<String>,
}

/// Any message on the control channel
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SignalMessage {
    Server(ServerMessage),
    Peer(PeerEvent),
}

impl SignalMessage {
    /// Parse a raw text frame
    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        let value: Value = serde_json::from_str(raw)?;
        if value.get("event").is_some() {
            serde_json::from_value(value).map(SignalMessage::Peer)
        } else {
            serde_json::from_value(value).map(SignalMessage::Server)
        }
    }

    /// Serialize into a text frame
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl From<ServerMessage> for SignalMessage {
    fn from(msg: ServerMessage) -> Self {
        SignalMessage::Server(msg)
    }
}

impl From<PeerEvent> for SignalMessage {
    fn from(event: PeerEvent) -> Self {
        SignalMessage::Peer(event)
    }
}
