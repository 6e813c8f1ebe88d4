//! Signaling channel to the relay
//!
//! Owns the duplex WebSocket connection. The socket itself lives in a spawned task;
//! everything it observes is handed to the owner as [`ChannelEvent`]s tagged with the
//! channel lifetime, so events of a closed connection can be told apart from the
//! current one.
//!
//! ```text
//! [*] --> Disconnected
//! Disconnected --> Connecting: connect()
//! Connecting --> AwaitingAuth: socket open, AUTH sent
//! AwaitingAuth --> Authenticated: USER_AUTHENTICATED
//! Connecting/AwaitingAuth/Authenticated --> Disconnected: close / error / timeout
//! ```

use std::fmt;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use super::error::MeshError;
use crate::protocol::{ServerMessage, SignalMessage};

/// Signaling channel state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelState {
    #[default]
    Disconnected,
    Connecting,
    AwaitingAuth,
    Authenticated,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChannelState::Disconnected => "OFF",
            ChannelState::Connecting => "CONNECTING",
            ChannelState::AwaitingAuth => "AUTHENTICATING",
            ChannelState::Authenticated => "ON",
        };
        f.write_str(name)
    }
}

/// How the connection ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    /// A close handshake took place
    pub clean: bool,
    pub code: Option<u16>,
    pub reason: String,
}

impl CloseInfo {
    /// Closed by this side
    pub fn local(reason: impl Into<String>) -> Self {
        Self {
            clean: true,
            code: None,
            reason: reason.into(),
        }
    }

    /// Connection dropped without a close handshake
    pub fn died(reason: impl Into<String>) -> Self {
        Self {
            clean: false,
            code: None,
            reason: reason.into(),
        }
    }

    fn from_frame(frame: Option<CloseFrame<'_>>) -> Self {
        match frame {
            Some(frame) => Self {
                clean: true,
                code: Some(u16::from(frame.code)),
                reason: frame.reason.to_string(),
            },
            None => Self {
                clean: true,
                code: None,
                reason: String::new(),
            },
        }
    }
}

impl fmt::Display for CloseInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.clean { "closed cleanly" } else { "died" };
        match self.code {
            Some(code) => write!(f, "Connection {}, code={}, reason={}", kind, code, self.reason),
            None => write!(f, "Connection {}, reason={}", kind, self.reason),
        }
    }
}

/// What the connection task observed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Opened,
    Message(String),
    Error(String),
    Closed(CloseInfo),
}

/// Client side of the control channel
pub struct SignalingChannel {
    state: ChannelState,
    lifetime: u64,
    /// Lifetime of the connection that has not been torn down yet
    active: Option<u64>,
    credential: Option<String>,
    outbound: Option<mpsc::UnboundedSender<String>>,
    task: Option<JoinHandle<()>>,
}

impl SignalingChannel {
    pub fn new() -> Self {
        Self {
            state: ChannelState::Disconnected,
            lifetime: 0,
            active: None,
            credential: None,
            outbound: None,
            task: None,
        }
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// True if `lifetime` is the connection currently owned by this channel
    pub fn is_current(&self, lifetime: u64) -> bool {
        self.active == Some(lifetime)
    }

    /// True once the socket is open and messages can be sent
    pub fn is_open(&self) -> bool {
        self.outbound.is_some()
            && matches!(
                self.state,
                ChannelState::AwaitingAuth | ChannelState::Authenticated
            )
    }

    /// Open a connection to the relay.
    ///
    /// `on_event` receives everything the connection observes and returns false
    /// once nobody listens anymore. Returns the new channel lifetime.
    pub fn connect<F>(
        &mut self,
        endpoint: &str,
        credential: &str,
        on_event: F,
    ) -> Result<u64, MeshError>
    where
        F: Fn(u64, ChannelEvent) -> bool + Send + Sync + 'static,
    {
        let (lifetime, outbound) = self.begin(credential)?;

        info!("Connecting to relay {} (lifetime {})", endpoint, lifetime);
        let endpoint = endpoint.to_string();
        self.task = Some(tokio::spawn(run_connection(
            endpoint, lifetime, outbound, on_event,
        )));

        Ok(lifetime)
    }

    fn begin(
        &mut self,
        credential: &str,
    ) -> Result<(u64, mpsc::UnboundedReceiver<String>), MeshError> {
        if self.state != ChannelState::Disconnected {
            return Err(MeshError::AlreadyConnected);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        self.lifetime += 1;
        self.active = Some(self.lifetime);
        self.credential = Some(credential.to_string());
        self.outbound = Some(tx);
        self.state = ChannelState::Connecting;

        Ok((self.lifetime, rx))
    }

    /// Socket is open: authenticate
    pub fn on_opened(&mut self) -> Result<(), MeshError> {
        if self.state != ChannelState::Connecting {
            return Err(MeshError::SignalingError(format!(
                "Unexpected open in state {:?}",
                self.state
            )));
        }

        self.state = ChannelState::AwaitingAuth;
        let credential = self.credential.take().unwrap_or_default();
        self.send(&ServerMessage::auth(&credential).into())
    }

    pub fn on_authenticated(&mut self) {
        if self.state == ChannelState::AwaitingAuth {
            self.state = ChannelState::Authenticated;
        }
    }

    /// Serialize and transmit; no queuing or retry when the channel is not open
    pub fn send(&self, msg: &SignalMessage) -> Result<(), MeshError> {
        if !self.is_open() {
            return Err(MeshError::NotConnected);
        }
        let outbound = self.outbound.as_ref().ok_or(MeshError::NotConnected)?;

        let json = msg.to_json()?;
        outbound
            .send(json)
            .map_err(|_| MeshError::SignalingError("Connection task has ended".to_string()))
    }

    /// Tear the connection down.
    ///
    /// Returns false when there was nothing to tear down, which makes a second
    /// close notification a no-op.
    pub fn close(&mut self) -> bool {
        if self.active.is_none() && self.outbound.is_none() {
            return false;
        }

        // Dropping the sender makes the connection task send a close frame and exit
        self.outbound = None;
        self.active = None;
        self.credential = None;
        self.task = None;
        self.state = ChannelState::Disconnected;
        debug!("Signaling channel lifetime {} torn down", self.lifetime);
        true
    }

    /// Wire the channel to an in-memory outbound queue instead of a socket
    #[cfg(test)]
    pub(crate) fn attach(&mut self, credential: &str) -> (u64, mpsc::UnboundedReceiver<String>) {
        self.begin(credential)
            .expect("channel must be disconnected before attaching")
    }
}

impl Default for SignalingChannel {
    fn default() -> Self {
        Self::new()
    }
}

/// Connection task: pumps outbound frames to the socket and inbound frames to the owner
async fn run_connection<F>(
    endpoint: String,
    lifetime: u64,
    mut outbound: mpsc::UnboundedReceiver<String>,
    on_event: F,
) where
    F: Fn(u64, ChannelEvent) -> bool + Send + Sync + 'static,
{
    let ws_stream = match connect_async(endpoint.as_str()).await {
        Ok((stream, _)) => stream,
        Err(e) => {
            warn!("Connect to {} failed: {}", endpoint, e);
            on_event(lifetime, ChannelEvent::Error(format!("Connect failed: {}", e)));
            on_event(
                lifetime,
                ChannelEvent::Closed(CloseInfo::died("connect failed")),
            );
            return;
        }
    };

    debug!("Connected to relay: {}", endpoint);
    if !on_event(lifetime, ChannelEvent::Opened) {
        return;
    }

    let (mut write, mut read) = ws_stream.split();

    let info = loop {
        tokio::select! {
            outgoing = outbound.recv() => match outgoing {
                Some(json) => {
                    if let Err(e) = write.send(Message::Text(json)).await {
                        on_event(lifetime, ChannelEvent::Error(format!("Send failed: {}", e)));
                        break CloseInfo::died("send failed");
                    }
                }
                None => {
                    let _ = write.close().await;
                    break CloseInfo::local("closed by client");
                }
            },

            incoming = read.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    if !on_event(lifetime, ChannelEvent::Message(text)) {
                        break CloseInfo::local("owner gone");
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    break CloseInfo::from_frame(frame);
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    on_event(lifetime, ChannelEvent::Error(format!("Receive failed: {}", e)));
                    break CloseInfo::died(e.to_string());
                }
                None => {
                    break CloseInfo::died("stream ended");
                }
            }
        }
    };

    debug!("Relay connection lifetime {} ended: {}", lifetime, info);
    on_event(lifetime, ChannelEvent::Closed(info));
}
