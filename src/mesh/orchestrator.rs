//! Mesh orchestrator
//!
//! One task owns the signaling channel, the heartbeat, the session and the peer
//! registry. Every input arrives as an [`Event`] on a single queue and is handled to
//! completion before the next one, including the negotiation steps it awaits:
//!
//! ```text
//! relay ──► SignalingChannel ──┐
//! ticker ──► HeartbeatMonitor ─┤
//! transports ──► sinks ────────┼──► Event queue ──► MeshClient ──► MeshEvent
//! timers ──────────────────────┤
//! MeshHandle ──► commands ─────┘
//! ```
//!
//! Events carry the identity of their source (channel lifetime, entry generation,
//! recovery epoch) and are dropped when that source has been replaced.

use std::fmt;
use std::ops::ControlFlow;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use super::peer::{PeerEntry, RecoveryDecision};
use super::registry::PeerRegistry;
use super::session::Session;
use crate::config::MeshConfig;
use crate::network::{
    ChannelEvent, ChannelState, CloseInfo, ConnectivityState, HeartbeatMonitor, Liveness,
    MeshError, PeerTransport, RemoteTrack, Role, SignalingChannel, TransportError,
    TransportEvent, TransportEventSink, TransportFactory,
};
use crate::protocol::{
    IceCandidate, PeerEvent, PeerEventKind, PeerId, PeerLogData, ServerMessage,
    ServerMessageType, SessionDescription, SignalMessage,
};

/// Requests sent by a [`MeshHandle`]
pub(crate) enum Command {
    Connect(oneshot::Sender<Result<(), MeshError>>),
    Disconnect(oneshot::Sender<bool>),
    Call(oneshot::Sender<Result<(), MeshError>>),
    Hangup(oneshot::Sender<bool>),
    Snapshot(oneshot::Sender<MeshSnapshot>),
    Shutdown(oneshot::Sender<()>),
}

/// Orchestrator input
pub(crate) enum Event {
    Command(Command),
    Channel {
        lifetime: u64,
        event: ChannelEvent,
    },
    HeartbeatTick {
        lifetime: u64,
    },
    Transport {
        peer_id: PeerId,
        generation: u64,
        event: TransportEvent,
    },
    RecoveryDue {
        peer_id: PeerId,
        generation: u64,
        epoch: u64,
    },
    StatsRetry {
        peer_id: PeerId,
        generation: u64,
        retries_left: u32,
    },
}

/// Notifications for the presentation layer
#[derive(Debug, Clone, PartialEq)]
pub enum MeshEvent {
    ChannelStateChanged(ChannelState),
    ChannelError(String),
    ChannelClosed(CloseInfo),
    /// The relay announced it is shutting down
    RelayClosing,
    PeerAdded {
        peer_id: PeerId,
        role: Role,
    },
    PeerRemoved {
        peer_id: PeerId,
    },
    PeerConnectivityChanged {
        peer_id: PeerId,
        state: ConnectivityState,
    },
    RemoteTrackAvailable {
        peer_id: PeerId,
        track: RemoteTrack,
    },
    MembershipReconciled {
        peers: Vec<PeerId>,
    },
    PeerRecoveryFailed {
        peer_id: PeerId,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerSnapshot {
    pub peer_id: PeerId,
    pub role: Role,
    pub state: ConnectivityState,
    pub stats_verified: bool,
    pub generation: u64,
}

/// Point-in-time view of the orchestrator state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeshSnapshot {
    pub channel: ChannelState,
    pub self_id: Option<PeerId>,
    pub in_call: bool,
    pub initial_offerer: bool,
    pub peers: Vec<PeerSnapshot>,
}

impl fmt::Display for MeshSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Relay: {}", self.channel)?;
        if let Some(id) = self.self_id {
            write!(f, ", user {}", id)?;
        }
        write!(f, ", in call: {}", self.in_call)?;
        for peer in &self.peers {
            write!(
                f,
                "\n  peer {} ({}): {}{}",
                peer.peer_id,
                peer.role,
                peer.state,
                if peer.stats_verified { " [verified]" } else { "" }
            )?;
        }
        Ok(())
    }
}

/// Cloneable handle for driving a running [`MeshClient`]
#[derive(Clone)]
pub struct MeshHandle {
    tx: mpsc::UnboundedSender<Event>,
}

impl MeshHandle {
    async fn request<R>(
        &self,
        make: impl FnOnce(oneshot::Sender<R>) -> Command,
    ) -> Result<R, MeshError> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(Event::Command(make(reply)))
            .map_err(|_| MeshError::Stopped)?;
        response.await.map_err(|_| MeshError::Stopped)
    }

    /// Open the relay connection
    pub async fn connect(&self) -> Result<(), MeshError> {
        self.request(Command::Connect).await?
    }

    /// Close the relay connection. Returns false if it was not open.
    pub async fn disconnect(&self) -> Result<bool, MeshError> {
        self.request(Command::Disconnect).await
    }

    /// Join the call
    pub async fn call(&self) -> Result<(), MeshError> {
        self.request(Command::Call).await?
    }

    /// Leave the call. Returns false if there was no call.
    pub async fn hangup(&self) -> Result<bool, MeshError> {
        self.request(Command::Hangup).await
    }

    pub async fn snapshot(&self) -> Result<MeshSnapshot, MeshError> {
        self.request(Command::Snapshot).await
    }

    /// Hang up, disconnect and stop the orchestrator
    pub async fn shutdown(&self) -> Result<(), MeshError> {
        self.request(Command::Shutdown).await
    }
}

/// The mesh orchestrator
pub struct MeshClient<F: TransportFactory> {
    config: MeshConfig,
    factory: F,
    channel: SignalingChannel,
    heartbeat: HeartbeatMonitor,
    session: Option<Session>,
    registry: PeerRegistry<F::Transport>,
    events_tx: mpsc::UnboundedSender<Event>,
    events_rx: mpsc::UnboundedReceiver<Event>,
    output: mpsc::UnboundedSender<MeshEvent>,
}

impl<F: TransportFactory> MeshClient<F> {
    pub fn new(
        config: MeshConfig,
        factory: F,
    ) -> (Self, MeshHandle, mpsc::UnboundedReceiver<MeshEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (output, output_rx) = mpsc::unbounded_channel();
        let heartbeat = HeartbeatMonitor::new(config.ping_interval(), config.pong_timeout());

        let handle = MeshHandle {
            tx: events_tx.clone(),
        };
        let client = Self {
            config,
            factory,
            channel: SignalingChannel::new(),
            heartbeat,
            session: None,
            registry: PeerRegistry::new(),
            events_tx,
            events_rx,
            output,
        };

        (client, handle, output_rx)
    }

    /// Run until shut down through a [`MeshHandle`]
    pub async fn run(mut self) {
        info!("Mesh client started for user {}", self.config.user_id);
        while let Some(event) = self.events_rx.recv().await {
            if self.handle_event(event).await.is_break() {
                break;
            }
        }
        info!("Mesh client stopped");
    }

    async fn handle_event(&mut self, event: Event) -> ControlFlow<()> {
        match event {
            Event::Command(command) => return self.on_command(command).await,
            Event::Channel { lifetime, event } => self.on_channel_event(lifetime, event).await,
            Event::HeartbeatTick { lifetime } => self.on_heartbeat_tick(lifetime).await,
            Event::Transport {
                peer_id,
                generation,
                event,
            } => self.on_transport_event(peer_id, generation, event).await,
            Event::RecoveryDue {
                peer_id,
                generation,
                epoch,
            } => self.on_recovery_due(peer_id, generation, epoch).await,
            Event::StatsRetry {
                peer_id,
                generation,
                retries_left,
            } => self.verify_stats(peer_id, generation, retries_left).await,
        }
        ControlFlow::Continue(())
    }

    async fn on_command(&mut self, command: Command) -> ControlFlow<()> {
        match command {
            Command::Connect(reply) => {
                let _ = reply.send(self.connect());
            }
            Command::Disconnect(reply) => {
                let closed = self
                    .close_channel(CloseInfo::local("disconnect requested"))
                    .await;
                let _ = reply.send(closed);
            }
            Command::Call(reply) => {
                let _ = reply.send(self.call());
            }
            Command::Hangup(reply) => {
                let hung_up = self.hangup().await;
                let _ = reply.send(hung_up);
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            Command::Shutdown(reply) => {
                self.hangup().await;
                self.close_channel(CloseInfo::local("shutdown")).await;
                let _ = reply.send(());
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    fn emit(&self, event: MeshEvent) {
        let _ = self.output.send(event);
    }

    fn send(&self, msg: impl Into<SignalMessage>) {
        let msg = msg.into();
        if let Err(e) = self.channel.send(&msg) {
            warn!("Failed to send {:?}: {}", msg, e);
        }
    }

    // ========================================================================
    // Control channel
    // ========================================================================

    fn connect(&mut self) -> Result<(), MeshError> {
        let tx = self.events_tx.clone();
        self.channel.connect(
            &self.config.server_url,
            &self.config.credential,
            move |lifetime, event| tx.send(Event::Channel { lifetime, event }).is_ok(),
        )?;
        self.emit(MeshEvent::ChannelStateChanged(self.channel.state()));
        Ok(())
    }

    async fn on_channel_event(&mut self, lifetime: u64, event: ChannelEvent) {
        if !self.channel.is_current(lifetime) {
            debug!("Ignoring event of closed channel lifetime {}", lifetime);
            return;
        }

        match event {
            ChannelEvent::Opened => match self.channel.on_opened() {
                Ok(()) => {
                    info!("Relay connection open, authenticating");
                    self.emit(MeshEvent::ChannelStateChanged(self.channel.state()));
                }
                Err(e) => warn!("Failed to authenticate: {}", e),
            },
            ChannelEvent::Message(raw) => self.on_message(lifetime, &raw).await,
            ChannelEvent::Error(error) => {
                warn!("Relay connection error: {}", error);
                self.emit(MeshEvent::ChannelError(error));
            }
            ChannelEvent::Closed(info) => {
                self.close_channel(info).await;
            }
        }
    }

    async fn on_message(&mut self, lifetime: u64, raw: &str) {
        let msg = match SignalMessage::parse(raw) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("Dropping malformed relay message: {} ({})", e, raw);
                return;
            }
        };

        match msg {
            SignalMessage::Server(msg) => self.on_server_message(lifetime, msg).await,
            SignalMessage::Peer(event) => self.on_peer_event(event).await,
        }
    }

    async fn on_server_message(&mut self, lifetime: u64, msg: ServerMessage) {
        match msg.kind {
            ServerMessageType::Authenticated => self.on_authenticated(lifetime, msg.data),
            ServerMessageType::Members => match msg.member_ids() {
                Ok(snapshot) => self.reconcile(&snapshot).await,
                Err(e) => warn!("Dropping invalid membership snapshot: {}", e),
            },
            ServerMessageType::Pong => self.heartbeat.on_probe_ack(Instant::now()),
            ServerMessageType::Closing => {
                info!("Relay is shutting down");
                self.emit(MeshEvent::RelayClosing);
            }
            other => debug!("Ignoring server message {:?}", other),
        }
    }

    fn on_authenticated(&mut self, lifetime: u64, data: Option<Value>) {
        self.channel.on_authenticated();

        let self_id = data
            .as_ref()
            .and_then(Value::as_u64)
            .map(PeerId)
            .unwrap_or(self.config.user_id);
        if self.session.is_none() {
            self.session = Some(Session::authenticated(self_id));
        }
        info!("Authenticated with relay as user {}", self_id);
        self.emit(MeshEvent::ChannelStateChanged(self.channel.state()));

        if !self.heartbeat.is_running_for(lifetime) {
            let tx = self.events_tx.clone();
            self.heartbeat.start(lifetime, Instant::now(), move || {
                tx.send(Event::HeartbeatTick { lifetime }).is_ok()
            });
            self.send(ServerMessage::ping());
        }
    }

    async fn on_heartbeat_tick(&mut self, lifetime: u64) {
        if !self.heartbeat.is_running_for(lifetime) {
            return;
        }

        if self.channel.is_open() {
            self.send(ServerMessage::ping());
        }

        if self.heartbeat.check(Instant::now()) == Liveness::Expired {
            warn!(
                "No PONG from relay for more than {:?}, closing connection",
                self.config.pong_timeout()
            );
            self.close_channel(CloseInfo::died("heartbeat timeout")).await;
        }
    }

    /// Full teardown of the control channel. Returns false if it was already closed.
    async fn close_channel(&mut self, info: CloseInfo) -> bool {
        if !self.channel.close() {
            return false;
        }

        self.heartbeat.stop();
        if self.session.as_mut().map(Session::end_call).unwrap_or(false) {
            info!("Call ended by relay disconnect");
        }
        self.hangup_peers().await;
        self.session = None;

        info!("{}", info);
        self.emit(MeshEvent::ChannelStateChanged(ChannelState::Disconnected));
        self.emit(MeshEvent::ChannelClosed(info));
        true
    }

    // ========================================================================
    // Call lifecycle
    // ========================================================================

    fn call(&mut self) -> Result<(), MeshError> {
        let session = self.session.as_mut().ok_or(MeshError::NotAuthenticated)?;
        session.start_call()?;

        if let Err(e) = self.channel.send(&ServerMessage::join_room().into()) {
            session.end_call();
            return Err(e);
        }
        info!("Joining call as user {}", session.self_id());
        Ok(())
    }

    async fn hangup(&mut self) -> bool {
        let was_in_call = self.session.as_mut().map(Session::end_call).unwrap_or(false);
        self.hangup_peers().await;

        if self.channel.is_open() {
            self.send(ServerMessage::leave_room());
        }
        if was_in_call {
            info!("Left the call");
        }
        was_in_call
    }

    async fn hangup_peers(&mut self) {
        for entry in self.registry.drain() {
            self.teardown(entry).await;
        }
    }

    async fn teardown(&self, mut entry: PeerEntry<F::Transport>) {
        let peer_id = entry.peer_id();
        if let Err(e) = entry.close().await {
            debug!("Peer {}: error while closing transport: {}", peer_id, e);
        }
        self.emit(MeshEvent::PeerRemoved { peer_id });
    }

    fn snapshot(&self) -> MeshSnapshot {
        let peers = self
            .registry
            .ids()
            .into_iter()
            .filter_map(|id| self.registry.get(id))
            .map(|entry| PeerSnapshot {
                peer_id: entry.peer_id(),
                role: entry.role(),
                state: entry.state(),
                stats_verified: entry.stats_verified(),
                generation: entry.generation(),
            })
            .collect();

        MeshSnapshot {
            channel: self.channel.state(),
            self_id: self.session.as_ref().map(Session::self_id),
            in_call: self.session.as_ref().is_some_and(Session::in_call),
            initial_offerer: self
                .session
                .as_ref()
                .map_or(true, Session::initial_offerer),
            peers,
        }
    }

    // ========================================================================
    // Membership
    // ========================================================================

    async fn reconcile(&mut self, snapshot: &[PeerId]) {
        let Some(session) = &self.session else {
            debug!("Ignoring membership snapshot before authentication");
            return;
        };
        if !session.in_call() {
            debug!("Ignoring membership snapshot outside of a call");
            return;
        }

        let plan = self.registry.plan(snapshot, session.self_id());
        let create: Vec<(PeerId, Role)> = plan
            .create
            .iter()
            .map(|&peer_id| (peer_id, session.role_for(peer_id)))
            .collect();
        debug!(
            "Reconciling membership {:?}: create {:?}, remove {:?}",
            snapshot, create, plan.remove
        );

        for (peer_id, role) in create {
            if let Err(e) = self.create_peer(peer_id, role).await {
                warn!("Failed to set up peer {}: {}", peer_id, e);
            }
        }

        for peer_id in plan.remove {
            if let Some(entry) = self.registry.remove(peer_id) {
                info!("Peer {} left the call", peer_id);
                self.teardown(entry).await;
            }
        }

        if let Some(session) = self.session.as_mut() {
            session.retain_lost_offers(snapshot);
            session.finish_reconciliation();
        }
        self.emit(MeshEvent::MembershipReconciled {
            peers: self.registry.ids(),
        });
    }

    /// Create and register an entry. An offering entry that cannot be created is
    /// remembered so the next reconciliation offers again.
    async fn create_peer(&mut self, peer_id: PeerId, role: Role) -> Result<(), MeshError> {
        let result = self.build_peer(peer_id, role).await;
        if role == Role::Offerer {
            if let Some(session) = self.session.as_mut() {
                match &result {
                    Ok(()) => session.offer_restored(peer_id),
                    Err(_) => session.offer_lost(peer_id),
                }
            }
        }
        result
    }

    async fn build_peer(&mut self, peer_id: PeerId, role: Role) -> Result<(), MeshError> {
        let generation = self.registry.next_generation();
        let tx = self.events_tx.clone();
        let sink = TransportEventSink::new(peer_id, move |event| {
            let _ = tx.send(Event::Transport {
                peer_id,
                generation,
                event,
            });
        });

        let transport = self.factory.create(peer_id, role, sink).await?;
        if let Some(mut rejected) = self
            .registry
            .insert(PeerEntry::new(peer_id, role, generation, transport))
        {
            let _ = rejected.close().await;
            return Err(MeshError::DuplicatePeer(peer_id));
        }

        info!("Peer {} added as {}", peer_id, role);
        self.emit(MeshEvent::PeerAdded { peer_id, role });

        if role == Role::Offerer {
            self.start_offer(peer_id).await;
        }
        Ok(())
    }

    /// Destroy the entry for `peer_id` and create a fresh one under the same id
    async fn recreate_peer(&mut self, peer_id: PeerId, role: Role) -> Result<(), MeshError> {
        if let Some(entry) = self.registry.remove(peer_id) {
            self.teardown(entry).await;
        }
        self.create_peer(peer_id, role).await
    }

    // ========================================================================
    // Negotiation
    // ========================================================================

    async fn start_offer(&mut self, peer_id: PeerId) {
        let Some(entry) = self.registry.get_mut(peer_id) else {
            return;
        };

        match entry.start_offer().await {
            Ok(offer) => self.send_peer_event(peer_id, PeerEventKind::Offer, &offer),
            Err(e) => self.peer_log(peer_id, format!("Failed to create offer: {}", e)),
        }
    }

    fn send_peer_event(&self, to: PeerId, kind: PeerEventKind, data: &impl Serialize) {
        let Some(session) = &self.session else {
            return;
        };

        let data = match serde_json::to_value(data) {
            Ok(data) => data,
            Err(e) => {
                warn!("Failed to encode {} for peer {}: {}", kind, to, e);
                return;
            }
        };

        let event = PeerEvent {
            from: session.self_id(),
            to,
            event: kind,
            data,
        };
        if let Err(e) = self.channel.send(&event.into()) {
            warn!("Failed to send {} to peer {}: {}", kind, to, e);
        }
    }

    async fn on_peer_event(&mut self, event: PeerEvent) {
        let PeerEvent {
            from, event, data, ..
        } = event;

        if self.registry.is_empty() {
            debug!("Dropping {} from peer {}: no peer sessions", event, from);
            return;
        }
        if !self.registry.contains(from) {
            warn!("Dropping {} from unknown peer {}", event, from);
            return;
        }

        match event {
            PeerEventKind::Offer => self.handle_offer(from, data).await,
            PeerEventKind::Answer => self.handle_answer(from, data).await,
            PeerEventKind::Candidate => self.handle_candidate(from, data).await,
            PeerEventKind::Unknown => debug!("Ignoring unknown event from peer {}", from),
        }
    }

    async fn handle_offer(&mut self, peer_id: PeerId, data: Value) {
        let offer: SessionDescription = match serde_json::from_value(data) {
            Ok(offer) => offer,
            Err(e) => {
                warn!("Peer {}: invalid offer: {}", peer_id, e);
                return;
            }
        };

        let renegotiating = self
            .registry
            .get(peer_id)
            .is_some_and(|entry| entry.role() == Role::Answerer && entry.remote_description_set());
        if renegotiating {
            self.peer_log(peer_id, "New offer received, rebuilding connection");
            if let Err(e) = self.recreate_peer(peer_id, Role::Answerer).await {
                warn!("Peer {}: failed to rebuild connection: {}", peer_id, e);
                return;
            }
        }

        let Some(entry) = self.registry.get_mut(peer_id) else {
            return;
        };
        match entry.accept_offer(offer).await {
            Ok(answer) => self.send_peer_event(peer_id, PeerEventKind::Answer, &answer),
            Err(e) => self.peer_log(peer_id, format!("Failed to answer offer: {}", e)),
        }
    }

    async fn handle_answer(&mut self, peer_id: PeerId, data: Value) {
        let answer: SessionDescription = match serde_json::from_value(data) {
            Ok(answer) => answer,
            Err(e) => {
                warn!("Peer {}: invalid answer: {}", peer_id, e);
                return;
            }
        };

        let Some(entry) = self.registry.get_mut(peer_id) else {
            return;
        };
        if let Err(e) = entry.accept_answer(answer).await {
            self.peer_log(peer_id, format!("Failed to apply answer: {}", e));
        }
    }

    async fn handle_candidate(&mut self, peer_id: PeerId, data: Value) {
        let candidate: IceCandidate = match serde_json::from_value(data) {
            Ok(candidate) => candidate,
            Err(e) => {
                warn!("Peer {}: invalid candidate: {}", peer_id, e);
                return;
            }
        };

        let Some(entry) = self.registry.get(peer_id) else {
            return;
        };
        match entry.add_remote_candidate(candidate).await {
            Ok(()) => trace!("Peer {}: remote candidate added", peer_id),
            Err(TransportError::CandidateBeforeDescription) => {
                warn!("Peer {}: candidate arrived before remote description", peer_id);
                self.peer_log(peer_id, "Dropped candidate received before the remote description");
            }
            Err(e) => self.peer_log(peer_id, format!("Failed to add candidate: {}", e)),
        }
    }

    // ========================================================================
    // Transport events
    // ========================================================================

    async fn on_transport_event(&mut self, peer_id: PeerId, generation: u64, event: TransportEvent) {
        let current = self
            .registry
            .get(peer_id)
            .is_some_and(|entry| entry.generation() == generation);
        if !current {
            trace!("Ignoring event from replaced connection to peer {}", peer_id);
            return;
        }

        match event {
            TransportEvent::LocalCandidate(Some(candidate)) => {
                self.send_peer_event(peer_id, PeerEventKind::Candidate, &candidate)
            }
            TransportEvent::LocalCandidate(None) => {
                debug!("Peer {}: candidate gathering complete", peer_id)
            }
            TransportEvent::GatheringChanged(state) => {
                trace!("Peer {}: gathering {:?}", peer_id, state)
            }
            TransportEvent::ConnectivityChanged(state) => {
                self.on_connectivity_changed(peer_id, state).await
            }
            TransportEvent::RemoteTrack(track) => self.on_remote_track(peer_id, track),
        }
    }

    fn on_remote_track(&mut self, peer_id: PeerId, track: RemoteTrack) {
        let Some(entry) = self.registry.get_mut(peer_id) else {
            return;
        };

        if entry.accept_remote_stream(&track.stream_id) {
            debug!(
                "Peer {}: {:?} track {} on stream {}",
                peer_id, track.kind, track.track_id, track.stream_id
            );
            self.emit(MeshEvent::RemoteTrackAvailable { peer_id, track });
        } else {
            debug!(
                "Peer {}: ignoring track {} of additional stream {}",
                peer_id, track.track_id, track.stream_id
            );
        }
    }

    async fn on_connectivity_changed(&mut self, peer_id: PeerId, state: ConnectivityState) {
        let Some(entry) = self.registry.get_mut(peer_id) else {
            return;
        };
        let generation = entry.generation();
        let decision = entry.observe_state(state);

        if decision == RecoveryDecision::AlreadyPending {
            debug!("Peer {}: still {}, recovery already pending", peer_id, state);
            return;
        }

        info!("Peer {} connectivity: {}", peer_id, state);
        self.emit(MeshEvent::PeerConnectivityChanged { peer_id, state });

        match decision {
            RecoveryDecision::Schedule { epoch } => {
                let delay = self.config.reconnect_timeout();
                self.peer_log(
                    peer_id,
                    format!("Connection {}, recreating in {:?} unless it recovers", state, delay),
                );
                let tx = self.events_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(Event::RecoveryDue {
                        peer_id,
                        generation,
                        epoch,
                    });
                });
            }
            RecoveryDecision::LeftToPeer => {
                self.peer_log(
                    peer_id,
                    format!("Connection {}, waiting for the peer to reconnect", state),
                );
            }
            RecoveryDecision::None | RecoveryDecision::AlreadyPending => {}
        }

        if state == ConnectivityState::Connected {
            self.verify_stats(peer_id, generation, self.config.stats_retries)
                .await;
        }
    }

    async fn on_recovery_due(&mut self, peer_id: PeerId, generation: u64, epoch: u64) {
        let Some(entry) = self.registry.get_mut(peer_id) else {
            return;
        };
        if entry.generation() != generation {
            debug!("Peer {}: recovery for a replaced connection dropped", peer_id);
            return;
        }
        let Some(trigger) = entry.take_due_recovery(epoch) else {
            debug!("Peer {}: connection recovered, nothing to do", peer_id);
            return;
        };

        self.peer_log(
            peer_id,
            format!(
                "Connection still {} after {:?}, recreating",
                trigger,
                self.config.reconnect_timeout()
            ),
        );
        if let Err(e) = self.recreate_peer(peer_id, Role::Offerer).await {
            warn!("Peer {}: recreation failed: {}", peer_id, e);
            self.emit(MeshEvent::PeerRecoveryFailed {
                peer_id,
                reason: e.to_string(),
            });
        }
    }

    /// Log the selected candidate pair once connectivity is established
    async fn verify_stats(&mut self, peer_id: PeerId, generation: u64, retries_left: u32) {
        let Some(entry) = self.registry.get(peer_id) else {
            return;
        };
        if entry.generation() != generation || entry.state() != ConnectivityState::Connected {
            return;
        }

        match entry.transport().selected_candidate_pair().await {
            Ok(Some(pair)) => {
                self.peer_log(peer_id, format!("Selected candidate pair: {}", pair));
                if let Some(entry) = self.registry.get_mut(peer_id) {
                    entry.mark_stats_verified();
                }
            }
            Ok(None) if retries_left > 0 => {
                let delay = self.config.stats_retry_delay();
                debug!(
                    "Peer {}: no selected candidate pair yet, retrying in {:?}",
                    peer_id, delay
                );
                let tx = self.events_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(Event::StatsRetry {
                        peer_id,
                        generation,
                        retries_left: retries_left - 1,
                    });
                });
            }
            Ok(None) => self.peer_log(peer_id, "No selected candidate pair found"),
            Err(e) => warn!("Peer {}: stats query failed: {}", peer_id, e),
        }
    }

    /// Log a peer diagnostic, optionally forwarding it to the relay
    fn peer_log(&self, peer_id: PeerId, message: impl fmt::Display) {
        info!("Peer {}: {}", peer_id, message);

        if self.config.forward_peer_logs && self.channel.is_open() {
            let log = PeerLogData {
                peer_id,
                message: format!("{}, Peer: {} - {}", Utc::now().to_rfc3339(), peer_id, message),
                objects: Vec::new(),
            };
            self.send(ServerMessage::peer_log(&log));
        }
    }
}
