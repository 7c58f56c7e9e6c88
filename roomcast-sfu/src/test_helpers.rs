//! In-memory transport doubles and fixtures shared by unit and integration tests

use crate::connection::Connection;
use crate::error::{SignalError, TransportError};
use crate::message::{
    ChannelSignalSink, IceCandidate, SdpKind, SessionDescription, SignalMessage, SignalSink,
};
use crate::track::{forwarding_track, PublishedTrack, TrackKind};
use crate::transport::{
    InboundTrack, MediaTransport, NegotiationState, TransportEvent, TransportSession,
};
use crate::types::{ConnectionId, ParticipantId, RoomId, TrackId};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp::header::Header;
use webrtc::rtp::packet::Packet;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;

#[must_use]
pub fn opus_codec() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: MIME_TYPE_OPUS.to_owned(),
        clock_rate: 48000,
        channels: 2,
        sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
        rtcp_feedback: vec![],
    }
}

#[must_use]
pub fn vp8_codec() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: MIME_TYPE_VP8.to_owned(),
        clock_rate: 90000,
        channels: 0,
        sdp_fmtp_line: String::new(),
        rtcp_feedback: vec![],
    }
}

/// RTP packet with the given sequence number, timestamp and payload
#[must_use]
pub fn rtp_packet(sequence_number: u16, timestamp: u32, payload: &[u8]) -> Packet {
    Packet {
        header: Header {
            version: 2,
            payload_type: 111,
            sequence_number,
            timestamp,
            ssrc: 1,
            ..Default::default()
        },
        payload: Bytes::copy_from_slice(payload),
    }
}

#[derive(Default)]
struct FakeState {
    negotiation: Option<NegotiationState>,
    outbound: Vec<Arc<TrackLocalStaticRTP>>,
    remote: Vec<SessionDescription>,
    offers_created: usize,
    close_calls: usize,
    picture_loss: Vec<u32>,
    fail_offers: bool,
    fail_candidates: bool,
    fail_picture_loss: bool,
}

/// Session that follows the offer/answer state machine without any network
#[derive(Default)]
pub struct FakeSession {
    state: Mutex<FakeState>,
}

impl FakeSession {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_offers(&self, fail: bool) {
        self.state.lock().fail_offers = fail;
    }

    pub fn fail_candidates(&self, fail: bool) {
        self.state.lock().fail_candidates = fail;
    }

    pub fn fail_picture_loss(&self, fail: bool) {
        self.state.lock().fail_picture_loss = fail;
    }

    pub fn close_calls(&self) -> usize {
        self.state.lock().close_calls
    }

    pub fn offers_created(&self) -> usize {
        self.state.lock().offers_created
    }

    pub fn remote_descriptions(&self) -> Vec<SessionDescription> {
        self.state.lock().remote.clone()
    }

    /// Ids of the tracks currently sent, sorted
    pub fn outbound_ids(&self) -> Vec<TrackId> {
        let mut ids: Vec<TrackId> = self
            .state
            .lock()
            .outbound
            .iter()
            .map(|t| TrackId::from(t.id()))
            .collect();
        ids.sort();
        ids
    }

    pub fn is_sending(&self, track: &Arc<TrackLocalStaticRTP>) -> bool {
        self.state
            .lock()
            .outbound
            .iter()
            .any(|t| Arc::ptr_eq(t, track))
    }

    /// Media SSRCs that received a picture loss indication, in order
    pub fn picture_loss_requests(&self) -> Vec<u32> {
        self.state.lock().picture_loss.clone()
    }
}

#[async_trait]
impl TransportSession for FakeSession {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let mut state = self.state.lock();
        if state.fail_offers {
            return Err(TransportError::InvalidDescription("offer rejected".into()));
        }
        state.offers_created += 1;
        Ok(SessionDescription::offer(format!(
            "offer-{}",
            state.offers_created
        )))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        Ok(SessionDescription::answer("answer"))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        state.negotiation = Some(match desc.kind {
            SdpKind::Offer => NegotiationState::Negotiating,
            _ => NegotiationState::Stable,
        });
        Ok(())
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        state.negotiation = Some(match desc.kind {
            SdpKind::Offer => NegotiationState::RemoteOfferPending,
            _ => NegotiationState::Stable,
        });
        state.remote.push(desc);
        Ok(())
    }

    async fn add_ice_candidate(&self, _candidate: IceCandidate) -> Result<(), TransportError> {
        if self.state.lock().fail_candidates {
            return Err(TransportError::InvalidDescription("bad candidate".into()));
        }
        Ok(())
    }

    fn negotiation_state(&self) -> NegotiationState {
        self.state.lock().negotiation.unwrap_or(NegotiationState::New)
    }

    async fn add_track(&self, track: Arc<TrackLocalStaticRTP>) -> Result<(), TransportError> {
        self.state.lock().outbound.push(track);
        Ok(())
    }

    async fn remove_track(&self, track_id: &TrackId) -> Result<(), TransportError> {
        self.state
            .lock()
            .outbound
            .retain(|t| t.id() != track_id.as_str());
        Ok(())
    }

    async fn outbound_tracks(&self) -> Vec<Arc<dyn TrackLocal + Send + Sync>> {
        self.state
            .lock()
            .outbound
            .iter()
            .map(|t| Arc::clone(t) as Arc<dyn TrackLocal + Send + Sync>)
            .collect()
    }

    async fn send_picture_loss(&self, media_ssrc: u32) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if state.fail_picture_loss {
            return Err(TransportError::Closed);
        }
        state.picture_loss.push(media_ssrc);
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        state.close_calls += 1;
        state.negotiation = Some(NegotiationState::Closed);
        Ok(())
    }
}

/// Transport handing out [`FakeSession`]s and keeping their event channels
#[derive(Default)]
pub struct FakeTransport {
    sessions: Mutex<Vec<(Arc<FakeSession>, mpsc::UnboundedSender<TransportEvent>)>>,
    fail: Mutex<bool>,
}

impl FakeTransport {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make every following `create_session` call fail
    pub fn fail_sessions(&self, fail: bool) {
        *self.fail.lock() = fail;
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn session(&self, index: usize) -> Option<Arc<FakeSession>> {
        self.sessions.lock().get(index).map(|(s, _)| Arc::clone(s))
    }

    /// Deliver `event` as if the transport of session `index` emitted it
    pub fn emit(&self, index: usize, event: TransportEvent) -> bool {
        self.sessions
            .lock()
            .get(index)
            .is_some_and(|(_, events)| events.send(event).is_ok())
    }
}

#[async_trait]
impl MediaTransport for FakeTransport {
    async fn create_session(
        &self,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn TransportSession>, TransportError> {
        if *self.fail.lock() {
            return Err(TransportError::Closed);
        }
        let session = FakeSession::new();
        self.sessions.lock().push((Arc::clone(&session), events));
        Ok(session)
    }
}

/// Inbound track fed from a channel; reads end once the sender is dropped
pub struct FakeInboundTrack {
    id: TrackId,
    kind: TrackKind,
    ssrc: u32,
    packets: tokio::sync::Mutex<mpsc::UnboundedReceiver<Packet>>,
}

impl FakeInboundTrack {
    #[must_use]
    pub fn new(
        id: impl Into<TrackId>,
        kind: TrackKind,
        ssrc: u32,
    ) -> (Arc<Self>, mpsc::UnboundedSender<Packet>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let track = Arc::new(Self {
            id: id.into(),
            kind,
            ssrc,
            packets: tokio::sync::Mutex::new(rx),
        });
        (track, tx)
    }
}

#[async_trait]
impl InboundTrack for FakeInboundTrack {
    fn id(&self) -> TrackId {
        self.id.clone()
    }

    fn stream_id(&self) -> String {
        format!("stream-{}", self.id)
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn ssrc(&self) -> u32 {
        self.ssrc
    }

    fn codec(&self) -> RTCRtpCodecCapability {
        match self.kind {
            TrackKind::Audio => opus_codec(),
            TrackKind::Video => vp8_codec(),
        }
    }

    async fn read(&self, _buf: &mut [u8]) -> Result<Packet, TransportError> {
        self.packets
            .lock()
            .await
            .recv()
            .await
            .ok_or(TransportError::EndOfStream)
    }
}

/// Sink that accepts and drops every message
#[derive(Debug, Default)]
pub struct NullSignalSink;

impl SignalSink for NullSignalSink {
    fn send(&self, _message: SignalMessage) -> Result<(), SignalError> {
        Ok(())
    }
}

/// Connection over a [`FakeSession`] whose messages are discarded
#[must_use]
pub fn test_connection(room: &str, participant: &str) -> (Arc<Connection>, Arc<FakeSession>) {
    let session = FakeSession::new();
    let connection = Connection::new(
        RoomId::from(room),
        ParticipantId::from(participant),
        session.clone(),
        Arc::new(NullSignalSink),
        CancellationToken::new(),
    );
    (Arc::new(connection), session)
}

/// Connection over a [`FakeSession`] whose messages can be read back
#[must_use]
pub fn test_connection_with_signal(
    room: &str,
    participant: &str,
) -> (
    Arc<Connection>,
    Arc<FakeSession>,
    mpsc::Receiver<SignalMessage>,
) {
    let session = FakeSession::new();
    let (sink, rx) = ChannelSignalSink::channel();
    let connection = Connection::new(
        RoomId::from(room),
        ParticipantId::from(participant),
        session.clone(),
        Arc::new(sink),
        CancellationToken::new(),
    );
    (Arc::new(connection), session, rx)
}

/// Published track with a fresh forwarding track and cancellation token
#[must_use]
pub fn test_published_track(
    id: &str,
    owner: ConnectionId,
    kind: TrackKind,
) -> Arc<PublishedTrack> {
    let id = TrackId::from(id);
    let codec = match kind {
        TrackKind::Audio => opus_codec(),
        TrackKind::Video => vp8_codec(),
    };
    let forward = forwarding_track(codec, &id, "test-stream");
    Arc::new(PublishedTrack::new(
        id,
        owner,
        kind,
        0,
        forward,
        CancellationToken::new(),
    ))
}
