//! Roomcast SFU (Selective Forwarding Unit)
//!
//! Participants of a room each hold one WebRTC connection to the server. The
//! SFU receives every participant's audio and video and forwards each track to
//! all other participants of the same room, renegotiating connections as
//! tracks come and go. Audio is captured while the room is alive and mixed
//! into one time-aligned file when the room closes.
//!
//! ## Architecture
//!
//! - **`SfuManager`**: entry point; joins, leaves, signaling dispatch, shutdown
//! - **`RoomRegistry`**: room id to live room, created on first join
//! - **`SfuRoom`**: connections and the track table of one room
//! - **`Connection`**: one participant's transport session and signaling sink
//! - **`TrackRouter`**: per-track packet pumps onto forwarding tracks
//! - **`Recorder`** / **`Mixer`**: Ogg/Opus segment capture and offline mixing
//! - **`MediaTransport`**: session factory; `WebRtcTransport` uses webrtc-rs
//!
//! ## Usage
//!
//! ```rust,ignore
//! use roomcast_sfu::{
//!     ChannelSignalSink, LogRecordingObserver, SfuConfig, SfuManager, WebRtcTransport,
//! };
//!
//! let transport = Arc::new(WebRtcTransport::new(&WebRtcTransportConfig::default())?);
//! let manager = SfuManager::new(SfuConfig::default(), transport, Arc::new(LogRecordingObserver));
//!
//! let (sink, outbound) = ChannelSignalSink::channel();
//! let connection = manager.join("room-1".into(), ParticipantId::generate(), Arc::new(sink)).await?;
//! manager.handle_message(&connection, SignalMessage::from_json(text)?).await?;
//! ```

mod config;
mod connection;
mod error;
mod keyframe;
mod manager;
mod message;
pub mod recording;
mod registry;
mod room;
mod router;
mod signaling;
mod track;
pub mod transport;
mod types;

pub mod test_helpers;

pub use config::{RecordingConfig, SfuConfig};
pub use connection::Connection;
pub use error::{CaptureError, MixError, Result, SfuError, SignalError, TransportError};
pub use keyframe::request_keyframes;
pub use manager::{ManagerStats, SfuManager};
pub use message::{
    ChannelSignalSink, Envelope, IceCandidate, SdpKind, SessionDescription, SignalMessage,
    SignalSink, SIGNAL_CHANNEL_CAPACITY,
};
pub use recording::{LogRecordingObserver, Mixer, Recorder, RecordingObserver, RoomTimeline};
pub use registry::RoomRegistry;
pub use room::{PublishOutcome, RoomStats, SfuRoom};
pub use router::{PumpExit, TrackRouter};
pub use signaling::{NegotiationOutcome, RenegotiationCause};
pub use track::{BufferPool, PublishedTrack, TrackKind, TrackStats};
pub use transport::{
    ConnectionState, MediaTransport, NegotiationState, TransportEvent, TransportSession,
    WebRtcTransport, WebRtcTransportConfig,
};
pub use types::{ConnectionId, ParticipantId, RoomId, TrackId};
