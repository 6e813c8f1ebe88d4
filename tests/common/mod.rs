//! Shared fixtures for integration tests: an in-process relay and a loopback transport

#![allow(dead_code)]

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{accept_async, tungstenite::Message};

use meshcall::mesh::{MeshClient, MeshEvent, MeshHandle, MeshSnapshot};
use meshcall::network::{
    CandidateSummary, ConnectivityState, PeerTransport, Role, SelectedCandidatePair,
    TransportError, TransportEvent, TransportEventSink, TransportFactory,
};
use meshcall::protocol::{IceCandidate, PeerId, ServerMessage, SessionDescription};
use meshcall::MeshConfig;

// ============================================================================
// Test relay
// ============================================================================

#[derive(Default)]
struct RelayState {
    clients: HashMap<u64, mpsc::UnboundedSender<Message>>,
    room: BTreeSet<u64>,
    mute_pongs: bool,
}

impl RelayState {
    fn send_to(&self, user: u64, value: &Value) {
        if let Some(tx) = self.clients.get(&user) {
            let _ = tx.send(Message::Text(value.to_string()));
        }
    }

    fn broadcast_members(&self) {
        let members: Vec<PeerId> = self.room.iter().copied().map(PeerId).collect();
        let msg = serde_json::to_value(ServerMessage::members(&members))
            .expect("Failed to encode membership");
        for user in &self.room {
            self.send_to(*user, &msg);
        }
    }
}

/// Minimal relay: authenticates by numeric credential, keeps one room and
/// forwards peer events between authenticated users
pub struct TestRelay {
    port: u16,
    state: Arc<Mutex<RelayState>>,
    handle: JoinHandle<()>,
}

impl TestRelay {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind test relay");
        let port = listener
            .local_addr()
            .expect("Failed to get local address")
            .port();
        let state = Arc::new(Mutex::new(RelayState::default()));

        let accept_state = state.clone();
        let handle = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(handle_connection(stream, accept_state.clone()));
            }
        });

        Self {
            port,
            state,
            handle,
        }
    }

    pub fn url(&self) -> String {
        format!("ws://127.0.0.1:{}", self.port)
    }

    /// Stop answering PING
    pub fn mute_pongs(&self) {
        self.state.lock().unwrap().mute_pongs = true;
    }

    /// Push a raw text frame to an authenticated user
    pub fn send_raw(&self, user: u64, text: &str) {
        let state = self.state.lock().unwrap();
        if let Some(tx) = state.clients.get(&user) {
            let _ = tx.send(Message::Text(text.to_string()));
        }
    }

    pub fn room(&self) -> Vec<u64> {
        self.state.lock().unwrap().room.iter().copied().collect()
    }
}

impl Drop for TestRelay {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn handle_connection(stream: TcpStream, state: Arc<Mutex<RelayState>>) {
    let Ok(ws) = accept_async(stream).await else {
        return;
    };
    let (mut write, mut read) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if write.send(msg).await.is_err() {
                break;
            }
        }
    });

    let mut user: Option<u64> = None;
    while let Some(Ok(msg)) = read.next().await {
        let text = match msg {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        let Ok(value) = serde_json::from_str::<Value>(&text) else {
            continue;
        };

        let mut state = state.lock().unwrap();

        if value.get("event").is_some() {
            // Only forward events whose sender is who it claims to be
            let from = value["from"].as_u64();
            if from.is_some() && from == user {
                if let Some(to) = value["to"].as_u64() {
                    state.send_to(to, &value);
                }
            }
            continue;
        }

        match (value["type"].as_str(), user) {
            (Some("USER_AUTHENTICATION"), None) => {
                let Some(id) = value["data"].as_str().and_then(|c| c.parse::<u64>().ok()) else {
                    break;
                };
                user = Some(id);
                state.clients.insert(id, tx.clone());
                state.send_to(id, &json!({"type": "USER_AUTHENTICATED"}));
            }
            (Some("JOIN_ROOM"), Some(id)) => {
                state.room.insert(id);
                state.broadcast_members();
            }
            (Some("LEAVE_ROOM"), Some(id)) => {
                if state.room.remove(&id) {
                    state.broadcast_members();
                }
            }
            (Some("PING"), Some(id)) => {
                if !state.mute_pongs {
                    state.send_to(id, &json!({"type": "PONG"}));
                }
            }
            _ => {}
        }
    }

    if let Some(id) = user {
        let mut state = state.lock().unwrap();
        state.clients.remove(&id);
        if state.room.remove(&id) {
            state.broadcast_members();
        }
    }
    writer.abort();
}

// ============================================================================
// Loopback transport
// ============================================================================

/// Transport whose every step succeeds; applying a remote description connects
pub struct LoopbackFactory;

pub struct LoopbackTransport {
    peer_id: PeerId,
    sink: TransportEventSink,
}

#[async_trait]
impl TransportFactory for LoopbackFactory {
    type Transport = LoopbackTransport;

    async fn create(
        &self,
        peer_id: PeerId,
        _role: Role,
        events: TransportEventSink,
    ) -> Result<LoopbackTransport, TransportError> {
        Ok(LoopbackTransport {
            peer_id,
            sink: events,
        })
    }
}

#[async_trait]
impl PeerTransport for LoopbackTransport {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        Ok(SessionDescription::offer(format!("v=0 offer {}", self.peer_id)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        Ok(SessionDescription::answer(format!("v=0 answer {}", self.peer_id)))
    }

    async fn set_local_description(
        &self,
        _desc: SessionDescription,
    ) -> Result<(), TransportError> {
        self.sink.emit(TransportEvent::LocalCandidate(Some(IceCandidate {
            candidate: "candidate:1 1 udp 2122260223 127.0.0.1 50000 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        })));
        self.sink.emit(TransportEvent::LocalCandidate(None));
        Ok(())
    }

    async fn set_remote_description(
        &self,
        _desc: SessionDescription,
    ) -> Result<(), TransportError> {
        self.sink
            .emit(TransportEvent::ConnectivityChanged(ConnectivityState::Checking));
        self.sink
            .emit(TransportEvent::ConnectivityChanged(ConnectivityState::Connected));
        Ok(())
    }

    async fn add_remote_candidate(&self, _candidate: IceCandidate) -> Result<(), TransportError> {
        Ok(())
    }

    async fn selected_candidate_pair(
        &self,
    ) -> Result<Option<SelectedCandidatePair>, TransportError> {
        let host = CandidateSummary {
            address: "127.0.0.1".to_string(),
            port: 50000,
            candidate_type: "host".to_string(),
        };
        Ok(Some(SelectedCandidatePair {
            local: host.clone(),
            remote: host,
        }))
    }

    async fn close(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

// ============================================================================
// Client helpers
// ============================================================================

pub struct TestClient {
    pub user: u64,
    pub handle: MeshHandle,
    pub events: mpsc::UnboundedReceiver<MeshEvent>,
    task: JoinHandle<()>,
}

impl TestClient {
    pub fn config(relay_url: &str, user: u64) -> MeshConfig {
        MeshConfig {
            server_url: relay_url.to_string(),
            user_id: PeerId(user),
            credential: user.to_string(),
            ..Default::default()
        }
    }

    pub fn spawn(config: MeshConfig) -> Self {
        let user = config.user_id.0;
        let (client, handle, events) = MeshClient::new(config, LoopbackFactory);
        let task = tokio::spawn(client.run());
        Self {
            user,
            handle,
            events,
            task,
        }
    }

    /// Connect and wait until the relay accepted the credential
    pub async fn connected(relay: &TestRelay, user: u64) -> Self {
        let mut client = Self::spawn(Self::config(&relay.url(), user));
        client.handle.connect().await.expect("Failed to connect");
        assert!(
            client
                .wait_for(|e| *e
                    == MeshEvent::ChannelStateChanged(
                        meshcall::network::ChannelState::Authenticated
                    ))
                .await
                .is_some(),
            "User {} should authenticate",
            user
        );
        client
    }

    /// Wait for the first event matching `predicate`
    pub async fn wait_for(&mut self, predicate: impl Fn(&MeshEvent) -> bool) -> Option<MeshEvent> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            match tokio::time::timeout_at(deadline, self.events.recv()).await {
                Ok(Some(event)) if predicate(&event) => return Some(event),
                Ok(Some(_)) => continue,
                Ok(None) | Err(_) => return None,
            }
        }
    }

    /// Collect every event arriving within `window`
    pub async fn drain_for(&mut self, window: Duration) -> Vec<MeshEvent> {
        let deadline = tokio::time::Instant::now() + window;
        let mut events = Vec::new();
        while let Ok(Some(event)) = tokio::time::timeout_at(deadline, self.events.recv()).await {
            events.push(event);
        }
        events
    }

    pub async fn snapshot(&self) -> MeshSnapshot {
        self.handle.snapshot().await.expect("Client stopped")
    }

    /// Poll until `predicate` holds for the snapshot
    pub async fn wait_until(&self, predicate: impl Fn(&MeshSnapshot) -> bool) -> MeshSnapshot {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let snapshot = self.snapshot().await;
            if predicate(&snapshot) || tokio::time::Instant::now() >= deadline {
                return snapshot;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    pub async fn shutdown(self) {
        let _ = self.handle.shutdown().await;
        let _ = self.task.await;
    }
}

/// True when the snapshot holds exactly `peers`, all connected
pub fn connected_to(snapshot: &MeshSnapshot, peers: &[u64]) -> bool {
    let ids: Vec<u64> = snapshot.peers.iter().map(|p| p.peer_id.0).collect();
    ids == peers
        && snapshot
            .peers
            .iter()
            .all(|p| p.state == ConnectivityState::Connected)
}
