//! Media transport abstraction
//!
//! The SFU never touches ICE, DTLS or SRTP directly. A [`MediaTransport`]
//! produces one [`TransportSession`] per participant; the session accepts
//! commands (descriptions, candidates, outbound tracks, RTCP) and reports what
//! happens on the wire as [`TransportEvent`]s on a channel handed over at
//! creation time.

mod webrtc_transport;

pub use self::webrtc_transport::{WebRtcTransport, WebRtcTransportConfig};

use crate::error::TransportError;
use crate::message::{IceCandidate, SessionDescription};
use crate::track::TrackKind;
use crate::types::TrackId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use webrtc::rtp::packet::Packet;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;

/// Negotiation state of a session, mirroring its signaling state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NegotiationState {
    /// Nothing negotiated yet
    New,
    /// A local offer is waiting for the remote answer
    Negotiating,
    /// A remote offer was applied and the local answer is not set yet
    RemoteOfferPending,
    /// Offer/answer exchange complete
    Stable,
    /// Session closed
    Closed,
}

impl NegotiationState {
    /// Whether the server may start a new offer from this state.
    ///
    /// `New` counts as stable: nothing is in flight yet.
    #[must_use]
    pub const fn can_offer(self) -> bool {
        matches!(self, Self::New | Self::Stable | Self::RemoteOfferPending)
    }
}

/// Connection state reported by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Events emitted by a session
pub enum TransportEvent {
    /// A local ICE candidate was gathered and must be sent to the client
    IceCandidate(IceCandidate),
    /// The underlying connection changed state
    ConnectionStateChanged(ConnectionState),
    /// The client started sending a new media track
    TrackStarted(Arc<dyn InboundTrack>),
}

impl std::fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::IceCandidate(c) => f.debug_tuple("IceCandidate").field(c).finish(),
            Self::ConnectionStateChanged(s) => {
                f.debug_tuple("ConnectionStateChanged").field(s).finish()
            }
            Self::TrackStarted(t) => f.debug_tuple("TrackStarted").field(&t.id()).finish(),
        }
    }
}

/// A media track received from a participant
#[async_trait]
pub trait InboundTrack: Send + Sync {
    fn id(&self) -> TrackId;

    fn stream_id(&self) -> String;

    fn kind(&self) -> TrackKind;

    /// Synchronization source, the target of RTCP feedback
    fn ssrc(&self) -> u32;

    fn codec(&self) -> RTCRtpCodecCapability;

    /// Read the next RTP packet using `buf` as scratch space.
    ///
    /// Blocks until a packet arrives; returns an error once the track ends.
    async fn read(&self, buf: &mut [u8]) -> Result<Packet, TransportError>;
}

/// One participant's negotiated connection
#[async_trait]
pub trait TransportSession: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;

    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError>;

    async fn set_remote_description(&self, desc: SessionDescription)
        -> Result<(), TransportError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;

    fn negotiation_state(&self) -> NegotiationState;

    /// Start sending `track` to the client (takes effect at the next offer)
    async fn add_track(&self, track: Arc<TrackLocalStaticRTP>) -> Result<(), TransportError>;

    /// Stop sending the track with the given id
    async fn remove_track(&self, track_id: &TrackId) -> Result<(), TransportError>;

    /// Tracks currently sent to the client
    async fn outbound_tracks(&self) -> Vec<Arc<dyn TrackLocal + Send + Sync>>;

    /// Ask the sender of `media_ssrc` for a fresh key frame
    async fn send_picture_loss(&self, media_ssrc: u32) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

/// Factory of transport sessions
#[async_trait]
pub trait MediaTransport: Send + Sync {
    /// Create a session with one audio and one video receive transceiver.
    ///
    /// Session events are delivered on `events` until the session closes.
    async fn create_session(
        &self,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn TransportSession>, TransportError>;
}
