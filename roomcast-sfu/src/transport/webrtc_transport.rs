//! [`MediaTransport`] backed by webrtc-rs peer connections

use super::{
    ConnectionState, InboundTrack, MediaTransport, NegotiationState, TransportEvent,
    TransportSession,
};
use crate::error::TransportError;
use crate::message::{IceCandidate, SdpKind, SessionDescription};
use crate::track::TrackKind;
use crate::types::TrackId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice::udp_network::{EphemeralUDP, UDPNetwork};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtp::packet::Packet;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCRtpTransceiver, RTCRtpTransceiverInit};
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// RTCP read buffer for outbound senders
const RTCP_BUFFER_SIZE: usize = 1500;

/// ICE and UDP settings of the webrtc-rs transport
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebRtcTransportConfig {
    /// STUN server URLs handed to ICE
    pub stun_servers: Vec<String>,
    /// First UDP port of the media range (0 = any)
    pub udp_port_min: u16,
    /// Last UDP port of the media range (0 = any)
    pub udp_port_max: u16,
}

impl Default for WebRtcTransportConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            udp_port_min: 0,
            udp_port_max: 0,
        }
    }
}

/// Session factory built on a shared webrtc-rs API object
pub struct WebRtcTransport {
    api: API,
    ice_servers: Vec<RTCIceServer>,
}

impl WebRtcTransport {
    pub fn new(config: &WebRtcTransportConfig) -> Result<Self, TransportError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let mut setting_engine = SettingEngine::default();
        if config.udp_port_min > 0 && config.udp_port_max > 0 {
            let ephemeral = EphemeralUDP::new(config.udp_port_min, config.udp_port_max)
                .map_err(|e| webrtc::Error::new(format!("invalid UDP port range: {e}")))?;
            setting_engine.set_udp_network(UDPNetwork::Ephemeral(ephemeral));
            info!(
                udp_port_min = config.udp_port_min,
                udp_port_max = config.udp_port_max,
                "WebRTC UDP port range configured"
            );
        }

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .with_setting_engine(setting_engine)
            .build();

        let ice_servers = if config.stun_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: config.stun_servers.clone(),
                ..Default::default()
            }]
        };

        Ok(Self { api, ice_servers })
    }
}

#[async_trait]
impl MediaTransport for WebRtcTransport {
    async fn create_session(
        &self,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn TransportSession>, TransportError> {
        let configuration = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };
        let pc = Arc::new(self.api.new_peer_connection(configuration).await?);

        for kind in [RTPCodecType::Audio, RTPCodecType::Video] {
            let init = RTCRtpTransceiverInit {
                direction: RTCRtpTransceiverDirection::Recvonly,
                send_encodings: Vec::new(),
            };
            if let Err(e) = pc.add_transceiver_from_kind(kind, Some(init)).await {
                let _ = pc.close().await;
                return Err(e.into());
            }
        }

        register_callbacks(&pc, events);

        Ok(Arc::new(WebRtcSession { pc }))
    }
}

/// Route peer connection callbacks into the session's event channel
fn register_callbacks(pc: &Arc<RTCPeerConnection>, events: mpsc::UnboundedSender<TransportEvent>) {
    let tx = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let tx = tx.clone();
        Box::pin(async move {
            let Some(candidate) = candidate else {
                return;
            };
            match candidate.to_json() {
                Ok(init) => {
                    let _ = tx.send(TransportEvent::IceCandidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                        username_fragment: init.username_fragment,
                    }));
                }
                Err(e) => warn!(error = %e, "Failed to serialize local ICE candidate"),
            }
        })
    }));

    let tx = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let tx = tx.clone();
        Box::pin(async move {
            let state = match state {
                RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => {
                    ConnectionState::New
                }
                RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
                RTCPeerConnectionState::Connected => ConnectionState::Connected,
                RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
                RTCPeerConnectionState::Failed => ConnectionState::Failed,
                RTCPeerConnectionState::Closed => ConnectionState::Closed,
            };
            let _ = tx.send(TransportEvent::ConnectionStateChanged(state));
        })
    }));

    let tx = events;
    pc.on_track(Box::new(
        move |track: Arc<TrackRemote>,
              _receiver: Arc<RTCRtpReceiver>,
              _transceiver: Arc<RTCRtpTransceiver>| {
            let tx = tx.clone();
            Box::pin(async move {
                debug!(
                    track_id = %track.id(),
                    ssrc = track.ssrc(),
                    codec = %track.codec().capability.mime_type,
                    "Remote track started"
                );
                let _ = tx.send(TransportEvent::TrackStarted(Arc::new(WebRtcInboundTrack {
                    track,
                })));
            })
        },
    ));
}

fn to_rtc_description(desc: SessionDescription) -> Result<RTCSessionDescription, TransportError> {
    match desc.kind {
        SdpKind::Offer => Ok(RTCSessionDescription::offer(desc.sdp)?),
        SdpKind::Answer => Ok(RTCSessionDescription::answer(desc.sdp)?),
        other => Err(TransportError::InvalidDescription(format!(
            "unsupported description type {other:?}"
        ))),
    }
}

fn from_rtc_description(desc: RTCSessionDescription) -> Result<SessionDescription, TransportError> {
    match desc.sdp_type {
        RTCSdpType::Offer => Ok(SessionDescription::offer(desc.sdp)),
        RTCSdpType::Answer => Ok(SessionDescription::answer(desc.sdp)),
        other => Err(TransportError::InvalidDescription(format!(
            "unexpected local description type {other}"
        ))),
    }
}

struct WebRtcSession {
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl TransportSession for WebRtcSession {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        from_rtc_description(self.pc.create_offer(None).await?)
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        from_rtc_description(self.pc.create_answer(None).await?)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        self.pc
            .set_local_description(to_rtc_description(desc)?)
            .await?;
        Ok(())
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        self.pc
            .set_remote_description(to_rtc_description(desc)?)
            .await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await?;
        Ok(())
    }

    fn negotiation_state(&self) -> NegotiationState {
        match self.pc.signaling_state() {
            RTCSignalingState::Unspecified => NegotiationState::New,
            RTCSignalingState::Stable => NegotiationState::Stable,
            RTCSignalingState::HaveLocalOffer | RTCSignalingState::HaveLocalPranswer => {
                NegotiationState::Negotiating
            }
            RTCSignalingState::HaveRemoteOffer | RTCSignalingState::HaveRemotePranswer => {
                NegotiationState::RemoteOfferPending
            }
            RTCSignalingState::Closed => NegotiationState::Closed,
        }
    }

    async fn add_track(&self, track: Arc<TrackLocalStaticRTP>) -> Result<(), TransportError> {
        let sender = self
            .pc
            .add_track(track as Arc<dyn TrackLocal + Send + Sync>)
            .await?;

        // Interceptors only run while the sender's RTCP is being drained
        tokio::spawn(async move {
            let mut buf = vec![0u8; RTCP_BUFFER_SIZE];
            while sender.read(&mut buf).await.is_ok() {}
        });

        Ok(())
    }

    async fn remove_track(&self, track_id: &TrackId) -> Result<(), TransportError> {
        for sender in self.pc.get_senders().await {
            let Some(track) = sender.track().await else {
                continue;
            };
            if track.id() == track_id.as_str() {
                self.pc.remove_track(&sender).await?;
                return Ok(());
            }
        }
        Err(TransportError::TrackNotFound(track_id.to_string()))
    }

    async fn outbound_tracks(&self) -> Vec<Arc<dyn TrackLocal + Send + Sync>> {
        let mut tracks = Vec::new();
        for sender in self.pc.get_senders().await {
            if let Some(track) = sender.track().await {
                tracks.push(track);
            }
        }
        tracks
    }

    async fn send_picture_loss(&self, media_ssrc: u32) -> Result<(), TransportError> {
        self.pc
            .write_rtcp(&[Box::new(PictureLossIndication {
                sender_ssrc: 0,
                media_ssrc,
            })])
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.pc.close().await?;
        Ok(())
    }
}

struct WebRtcInboundTrack {
    track: Arc<TrackRemote>,
}

#[async_trait]
impl InboundTrack for WebRtcInboundTrack {
    fn id(&self) -> TrackId {
        TrackId::from(self.track.id())
    }

    fn stream_id(&self) -> String {
        self.track.stream_id()
    }

    fn kind(&self) -> TrackKind {
        TrackKind::from(self.track.kind())
    }

    fn ssrc(&self) -> u32 {
        self.track.ssrc()
    }

    fn codec(&self) -> RTCRtpCodecCapability {
        self.track.codec().capability
    }

    async fn read(&self, buf: &mut [u8]) -> Result<Packet, TransportError> {
        let (packet, _attributes) = self.track.read(buf).await?;
        Ok(packet)
    }
}
