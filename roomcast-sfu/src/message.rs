//! Signaling messages and the channel they travel over
//!
//! On the wire every message is an envelope `{"event": ..., "data": ...}` whose
//! `data` is itself a JSON string: a session description for `offer`/`answer`
//! and a candidate init for `candidate`.

use crate::error::SignalError;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Kind of a session description
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// Serialized session description exchanged with the client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate in the browser's `RTCIceCandidateInit` shape
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex", skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

/// Signaling message exchanged with one participant
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalMessage {
    Offer(SessionDescription),
    Answer(SessionDescription),
    Candidate(IceCandidate),
}

/// Wire form of a [`SignalMessage`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub event: String,
    pub data: String,
}

impl SignalMessage {
    #[must_use]
    pub const fn event(&self) -> &'static str {
        match self {
            Self::Offer(_) => "offer",
            Self::Answer(_) => "answer",
            Self::Candidate(_) => "candidate",
        }
    }

    pub fn to_envelope(&self) -> Result<Envelope, SignalError> {
        let data = match self {
            Self::Offer(desc) | Self::Answer(desc) => serde_json::to_string(desc)?,
            Self::Candidate(candidate) => serde_json::to_string(candidate)?,
        };
        Ok(Envelope {
            event: self.event().to_string(),
            data,
        })
    }

    pub fn from_envelope(envelope: &Envelope) -> Result<Self, SignalError> {
        match envelope.event.as_str() {
            "offer" => Ok(Self::Offer(serde_json::from_str(&envelope.data)?)),
            "answer" => Ok(Self::Answer(serde_json::from_str(&envelope.data)?)),
            "candidate" => Ok(Self::Candidate(serde_json::from_str(&envelope.data)?)),
            other => Err(SignalError::UnknownEvent(other.to_string())),
        }
    }

    /// Encode as a JSON text frame
    pub fn to_json(&self) -> Result<String, SignalError> {
        Ok(serde_json::to_string(&self.to_envelope()?)?)
    }

    /// Decode a JSON text frame
    pub fn from_json(text: &str) -> Result<Self, SignalError> {
        let envelope: Envelope = serde_json::from_str(text)?;
        Self::from_envelope(&envelope)
    }
}

/// Outbound half of a participant's signaling channel.
///
/// The SFU only holds a back-reference; the channel's lifetime belongs to the
/// connection handler that created it.
#[cfg_attr(test, mockall::automock)]
pub trait SignalSink: Send + Sync {
    fn send(&self, message: SignalMessage) -> Result<(), SignalError>;
}

/// Capacity of the outbound signaling queue per participant
pub const SIGNAL_CHANNEL_CAPACITY: usize = 64;

/// [`SignalSink`] backed by a bounded mpsc channel
#[derive(Debug, Clone)]
pub struct ChannelSignalSink {
    sender: mpsc::Sender<SignalMessage>,
}

impl ChannelSignalSink {
    #[must_use]
    pub fn channel() -> (Self, mpsc::Receiver<SignalMessage>) {
        let (sender, receiver) = mpsc::channel(SIGNAL_CHANNEL_CAPACITY);
        (Self { sender }, receiver)
    }
}

impl SignalSink for ChannelSignalSink {
    fn send(&self, message: SignalMessage) -> Result<(), SignalError> {
        self.sender.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SignalError::ChannelFull,
            mpsc::error::TrySendError::Closed(_) => SignalError::ChannelClosed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offer_envelope() {
        let msg = SignalMessage::Offer(SessionDescription::offer("v=0"));
        let envelope = msg.to_envelope().unwrap();
        assert_eq!(envelope.event, "offer");
        assert_eq!(envelope.data, r#"{"type":"offer","sdp":"v=0"}"#);
        assert_eq!(SignalMessage::from_envelope(&envelope).unwrap(), msg);
    }

    #[test]
    fn test_browser_candidate() {
        let text = r#"{"event":"candidate","data":"{\"candidate\":\"candidate:1 1 udp 1 10.0.0.1 5000 typ host\",\"sdpMid\":\"0\",\"sdpMLineIndex\":0}"}"#;
        let SignalMessage::Candidate(candidate) = SignalMessage::from_json(text).unwrap() else {
            panic!("expected candidate");
        };
        assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
        assert_eq!(candidate.sdp_mline_index, Some(0));
        assert!(candidate.username_fragment.is_none());
    }

    #[test]
    fn test_unknown_event() {
        let text = r#"{"event":"bye","data":""}"#;
        assert!(matches!(
            SignalMessage::from_json(text),
            Err(SignalError::UnknownEvent(event)) if event == "bye"
        ));
    }

    #[test]
    fn test_malformed_payload() {
        let text = r#"{"event":"answer","data":"not json"}"#;
        assert!(matches!(SignalMessage::from_json(text), Err(SignalError::Payload(_))));
    }

    #[tokio::test]
    async fn test_channel_sink() {
        let (sink, mut rx) = ChannelSignalSink::channel();
        sink.send(SignalMessage::Answer(SessionDescription::answer("v=0")))
            .unwrap();
        assert_eq!(rx.recv().await.unwrap().event(), "answer");

        drop(rx);
        assert!(matches!(
            sink.send(SignalMessage::Answer(SessionDescription::answer("v=0"))),
            Err(SignalError::ChannelClosed)
        ));
    }
}
