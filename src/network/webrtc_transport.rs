//! WebRTC-backed peer transport
//!
//! Adapts `webrtc::RTCPeerConnection` to [`PeerTransport`]. Engine callbacks are
//! translated into [`TransportEvent`]s and pushed into the sink; nothing here
//! touches orchestrator state.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, trace};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice::candidate::CandidatePairState;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::stats::StatsReportType;

use super::error::TransportError;
use super::transport::{
    CandidateSummary, ConnectivityState, GatheringState, MediaKind, PeerTransport, RemoteTrack,
    Role, SelectedCandidatePair, TransportEvent, TransportEventSink, TransportFactory,
};
use crate::config::IceServerConfig;
use crate::protocol::{IceCandidate, PeerId, SdpType, SessionDescription};

fn engine_error(e: webrtc::Error) -> TransportError {
    TransportError::Engine(e.to_string())
}

/// Builds one `RTCPeerConnection` per peer from a shared API instance
pub struct WebRtcTransportFactory {
    api: API,
    ice_servers: Vec<RTCIceServer>,
}

impl WebRtcTransportFactory {
    pub fn new(ice_servers: &[IceServerConfig]) -> Result<Self, TransportError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(engine_error)?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(engine_error)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = ice_servers
            .iter()
            .map(|server| RTCIceServer {
                urls: server.normalized_urls(),
                username: server.username.clone().unwrap_or_default(),
                credential: server.credential.clone().unwrap_or_default(),
                ..Default::default()
            })
            .collect();

        Ok(Self { api, ice_servers })
    }
}

#[async_trait]
impl TransportFactory for WebRtcTransportFactory {
    type Transport = WebRtcTransport;

    async fn create(
        &self,
        peer_id: PeerId,
        role: Role,
        events: TransportEventSink,
    ) -> Result<WebRtcTransport, TransportError> {
        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };

        let pc = Arc::new(
            self.api
                .new_peer_connection(config)
                .await
                .map_err(engine_error)?,
        );

        if role == Role::Offerer {
            for kind in [RTPCodecType::Audio, RTPCodecType::Video] {
                pc.add_transceiver_from_kind(
                    kind,
                    Some(RTCRtpTransceiverInit {
                        direction: RTCRtpTransceiverDirection::Recvonly,
                        send_encodings: vec![],
                    }),
                )
                .await
                .map_err(engine_error)?;
            }
        }

        install_callbacks(&pc, events);
        debug!("Created {} transport for peer {}", role, peer_id);

        Ok(WebRtcTransport { pc })
    }
}

fn install_callbacks(pc: &RTCPeerConnection, events: TransportEventSink) {
    let sink = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        match candidate {
            Some(candidate) => match candidate.to_json() {
                Ok(init) => sink.emit(TransportEvent::LocalCandidate(Some(IceCandidate {
                    candidate: init.candidate,
                    sdp_mid: init.sdp_mid,
                    sdp_mline_index: init.sdp_mline_index,
                    username_fragment: init.username_fragment,
                }))),
                Err(e) => debug!("Dropping unserializable local candidate: {}", e),
            },
            None => sink.emit(TransportEvent::LocalCandidate(None)),
        }
        Box::pin(async {})
    }));

    let sink = events.clone();
    pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
        trace!("Peer {} ICE connection state {:?}", sink.peer_id(), state);
        if let Some(state) = connectivity_state(state) {
            sink.emit(TransportEvent::ConnectivityChanged(state));
        }
        Box::pin(async {})
    }));

    let sink = events.clone();
    pc.on_ice_gathering_state_change(Box::new(move |state: RTCIceGathererState| {
        let state = match state {
            RTCIceGathererState::Gathering => Some(GatheringState::Gathering),
            RTCIceGathererState::Complete => Some(GatheringState::Complete),
            RTCIceGathererState::New => Some(GatheringState::New),
            _ => None,
        };
        if let Some(state) = state {
            sink.emit(TransportEvent::GatheringChanged(state));
        }
        Box::pin(async {})
    }));

    let sink = events;
    pc.on_track(Box::new(move |track, _receiver, _transceiver| {
        let kind = match track.kind() {
            RTPCodecType::Audio => MediaKind::Audio,
            RTPCodecType::Video => MediaKind::Video,
            _ => MediaKind::Unknown,
        };
        sink.emit(TransportEvent::RemoteTrack(RemoteTrack {
            track_id: track.id(),
            stream_id: track.stream_id(),
            kind,
        }));
        Box::pin(async {})
    }));
}

fn connectivity_state(state: RTCIceConnectionState) -> Option<ConnectivityState> {
    match state {
        RTCIceConnectionState::New => Some(ConnectivityState::New),
        RTCIceConnectionState::Checking => Some(ConnectivityState::Checking),
        RTCIceConnectionState::Connected | RTCIceConnectionState::Completed => {
            Some(ConnectivityState::Connected)
        }
        RTCIceConnectionState::Disconnected => Some(ConnectivityState::Disconnected),
        RTCIceConnectionState::Failed => Some(ConnectivityState::Failed),
        RTCIceConnectionState::Closed => Some(ConnectivityState::Closed),
        _ => None,
    }
}

/// One peer connection
pub struct WebRtcTransport {
    pc: Arc<RTCPeerConnection>,
}

impl WebRtcTransport {
    fn to_engine(desc: SessionDescription) -> Result<RTCSessionDescription, TransportError> {
        let converted = match desc.sdp_type {
            SdpType::Offer => RTCSessionDescription::offer(desc.sdp),
            SdpType::Answer => RTCSessionDescription::answer(desc.sdp),
            SdpType::Pranswer => RTCSessionDescription::pranswer(desc.sdp),
            SdpType::Rollback => {
                return Err(TransportError::InvalidDescription(
                    "rollback is not supported".to_string(),
                ))
            }
        };
        converted.map_err(|e| TransportError::InvalidDescription(e.to_string()))
    }

    fn from_engine(desc: RTCSessionDescription) -> Result<SessionDescription, TransportError> {
        let sdp_type = match desc.sdp_type {
            RTCSdpType::Offer => SdpType::Offer,
            RTCSdpType::Answer => SdpType::Answer,
            RTCSdpType::Pranswer => SdpType::Pranswer,
            RTCSdpType::Rollback => SdpType::Rollback,
            other => {
                return Err(TransportError::InvalidDescription(format!(
                    "unexpected description type {:?}",
                    other
                )))
            }
        };
        Ok(SessionDescription {
            sdp_type,
            sdp: desc.sdp,
        })
    }
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| TransportError::Negotiation(e.to_string()))?;
        Self::from_engine(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| TransportError::Negotiation(e.to_string()))?;
        Self::from_engine(answer)
    }

    async fn set_local_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        let desc = Self::to_engine(desc)?;
        self.pc
            .set_local_description(desc)
            .await
            .map_err(|e| TransportError::Negotiation(e.to_string()))
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        let desc = Self::to_engine(desc)?;
        self.pc
            .set_remote_description(desc)
            .await
            .map_err(|e| TransportError::Negotiation(e.to_string()))
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| TransportError::InvalidCandidate(e.to_string()))
    }

    async fn selected_candidate_pair(
        &self,
    ) -> Result<Option<SelectedCandidatePair>, TransportError> {
        let stats = self.pc.get_stats().await;

        let selected = stats.reports.values().find_map(|report| match report {
            StatsReportType::CandidatePair(pair)
                if pair.nominated && matches!(pair.state, CandidatePairState::Succeeded) =>
            {
                Some((
                    pair.local_candidate_id.clone(),
                    pair.remote_candidate_id.clone(),
                ))
            }
            _ => None,
        });

        let Some((local_id, remote_id)) = selected else {
            return Ok(None);
        };

        let mut local = None;
        let mut remote = None;
        for report in stats.reports.values() {
            match report {
                StatsReportType::LocalCandidate(c) if c.id == local_id => {
                    local = Some(CandidateSummary {
                        address: c.ip.clone(),
                        port: c.port,
                        candidate_type: c.candidate_type.to_string(),
                    });
                }
                StatsReportType::RemoteCandidate(c) if c.id == remote_id => {
                    remote = Some(CandidateSummary {
                        address: c.ip.clone(),
                        port: c.port,
                        candidate_type: c.candidate_type.to_string(),
                    });
                }
                _ => {}
            }
        }

        Ok(local
            .zip(remote)
            .map(|(local, remote)| SelectedCandidatePair { local, remote }))
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.pc.close().await.map_err(engine_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connectivity_mapping() {
        assert_eq!(
            connectivity_state(RTCIceConnectionState::Completed),
            Some(ConnectivityState::Connected)
        );
        assert_eq!(
            connectivity_state(RTCIceConnectionState::Disconnected),
            Some(ConnectivityState::Disconnected)
        );
        assert_eq!(connectivity_state(RTCIceConnectionState::Unspecified), None);
    }

    #[test]
    fn test_rollback_is_rejected() {
        let rollback = SessionDescription {
            sdp_type: SdpType::Rollback,
            sdp: String::new(),
        };
        assert!(matches!(
            WebRtcTransport::to_engine(rollback),
            Err(TransportError::InvalidDescription(_))
        ));
    }
}
