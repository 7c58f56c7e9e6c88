//! Published tracks and the buffers their packet pumps read into
//!
//! A [`PublishedTrack`] is the room-table entry for one inbound track: who
//! owns it, what kind it is, and the outbound forwarding track every other
//! participant subscribes to.

use crate::types::{ConnectionId, TrackId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;

/// Media track kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl From<RTPCodecType> for TrackKind {
    fn from(codec_type: RTPCodecType) -> Self {
        match codec_type {
            RTPCodecType::Audio => Self::Audio,
            _ => Self::Video,
        }
    }
}

impl From<&str> for TrackKind {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "audio" => Self::Audio,
            _ => Self::Video,
        }
    }
}

/// RTP MTU used for pooled read buffers
pub const RTP_BUFFER_SIZE: usize = 1500;

/// Pool of reusable packet buffers shared by all packet pumps
#[derive(Default)]
pub struct BufferPool {
    buffers: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a buffer of [`RTP_BUFFER_SIZE`] bytes, allocating only when the pool is empty
    pub fn acquire(&self) -> Vec<u8> {
        self.buffers
            .lock()
            .pop()
            .unwrap_or_else(|| vec![0u8; RTP_BUFFER_SIZE])
    }

    pub fn release(&self, mut buf: Vec<u8>) {
        buf.resize(RTP_BUFFER_SIZE, 0);
        self.buffers.lock().push(buf);
    }

    /// Number of idle buffers
    pub fn idle(&self) -> usize {
        self.buffers.lock().len()
    }
}

/// Forwarding counters of a published track
#[derive(Debug, Default)]
pub struct TrackCounters {
    packets_forwarded: AtomicU64,
    bytes_forwarded: AtomicU64,
}

impl TrackCounters {
    pub fn record(&self, bytes: usize) {
        self.packets_forwarded.fetch_add(1, Ordering::Relaxed);
        self.bytes_forwarded.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn packets(&self) -> u64 {
        self.packets_forwarded.load(Ordering::Relaxed)
    }

    pub fn bytes(&self) -> u64 {
        self.bytes_forwarded.load(Ordering::Relaxed)
    }
}

/// Room-table entry for one inbound track
pub struct PublishedTrack {
    pub id: TrackId,

    /// Connection that publishes the track
    pub owner: ConnectionId,

    pub kind: TrackKind,

    /// Synchronization source of the inbound stream
    pub ssrc: u32,

    /// Outbound track every other participant receives
    pub forward: Arc<TrackLocalStaticRTP>,

    /// Cancelled when this publication is replaced or its owner closes
    pub cancel: CancellationToken,

    recording: AtomicBool,

    counters: TrackCounters,
}

impl PublishedTrack {
    pub fn new(
        id: TrackId,
        owner: ConnectionId,
        kind: TrackKind,
        ssrc: u32,
        forward: Arc<TrackLocalStaticRTP>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            owner,
            kind,
            ssrc,
            forward,
            cancel,
            recording: AtomicBool::new(false),
            counters: TrackCounters::default(),
        }
    }

    /// Whether audio capture runs for this track
    pub fn is_recording(&self) -> bool {
        self.recording.load(Ordering::Relaxed)
    }

    pub fn set_recording(&self, active: bool) {
        self.recording.store(active, Ordering::Relaxed);
    }

    pub fn counters(&self) -> &TrackCounters {
        &self.counters
    }

    #[must_use]
    pub fn is_video(&self) -> bool {
        self.kind == TrackKind::Video
    }

    #[must_use]
    pub fn is_audio(&self) -> bool {
        self.kind == TrackKind::Audio
    }
}

/// Outbound track mirroring an inbound track's codec and identifiers
#[must_use]
pub fn forwarding_track(
    codec: RTCRtpCodecCapability,
    id: &TrackId,
    stream_id: impl Into<String>,
) -> Arc<TrackLocalStaticRTP> {
    Arc::new(TrackLocalStaticRTP::new(
        codec,
        id.as_str().to_string(),
        stream_id.into(),
    ))
}

/// Track statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackStats {
    pub track_id: String,
    pub kind: TrackKind,
    pub packets_forwarded: u64,
    pub bytes_forwarded: u64,
    pub recording: bool,
}

impl From<&PublishedTrack> for TrackStats {
    fn from(track: &PublishedTrack) -> Self {
        Self {
            track_id: track.id.to_string(),
            kind: track.kind,
            packets_forwarded: track.counters.packets(),
            bytes_forwarded: track.counters.bytes(),
            recording: track.is_recording(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_track_kind() {
        assert_eq!(TrackKind::from("Audio"), TrackKind::Audio);
        assert_eq!(TrackKind::from("video"), TrackKind::Video);
        assert_eq!(TrackKind::from(RTPCodecType::Audio), TrackKind::Audio);
        assert_eq!(TrackKind::from(RTPCodecType::Video), TrackKind::Video);
    }

    #[test]
    fn test_buffer_pool_reuse() {
        let pool = BufferPool::new();
        let mut buf = pool.acquire();
        assert_eq!(buf.len(), RTP_BUFFER_SIZE);
        buf.truncate(10);

        pool.release(buf);
        assert_eq!(pool.idle(), 1);

        let buf = pool.acquire();
        assert_eq!(buf.len(), RTP_BUFFER_SIZE);
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn test_counters() {
        let counters = TrackCounters::default();
        counters.record(100);
        counters.record(50);
        assert_eq!(counters.packets(), 2);
        assert_eq!(counters.bytes(), 150);
    }
}
