use thiserror::Error;

use crate::types::RoomId;

/// Errors raised by a media transport session
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("WebRTC error: {0}")]
    WebRtc(#[from] webrtc::Error),

    #[error("Invalid session description: {0}")]
    InvalidDescription(String),

    #[error("Track not found: {0}")]
    TrackNotFound(String),

    #[error("End of stream")]
    EndOfStream,

    #[error("Session closed")]
    Closed,
}

/// Errors raised while encoding or decoding signaling messages
#[derive(Error, Debug)]
pub enum SignalError {
    #[error("Unknown signaling event: {0}")]
    UnknownEvent(String),

    #[error("Malformed signaling payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("Signaling channel closed")]
    ChannelClosed,

    #[error("Signaling channel full")]
    ChannelFull,
}

#[derive(Error, Debug)]
pub enum SfuError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Signaling error: {0}")]
    Signal(#[from] SignalError),

    #[error("Invalid room id")]
    InvalidRoomId,

    #[error("Maximum number of rooms reached")]
    RoomLimit,

    #[error("Room {0} is full")]
    RoomFull(RoomId),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("SFU is shutting down")]
    ShuttingDown,
}

/// Errors raised while writing recording segments
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Ogg writer error: {0}")]
    Media(#[from] webrtc::media::Error),
}

/// Errors raised while mixing a room's recording
#[derive(Error, Debug)]
pub enum MixError {
    #[error("Audio tool not available: {0}")]
    ToolMissing(String),

    #[error("Audio tool failed ({step}): {stderr}")]
    ToolFailed { step: &'static str, stderr: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("No recorded segments")]
    NoSegments,

    #[error("Recording timeline already consumed")]
    TimelineTaken,
}

pub type Result<T> = std::result::Result<T, SfuError>;
