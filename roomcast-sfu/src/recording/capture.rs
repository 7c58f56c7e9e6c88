//! Per-track audio capture into rotating Ogg/Opus segments

use super::gap::{GapFiller, OPUS_CLOCK_RATE};
use super::SegmentRecord;
use crate::config::RecordingConfig;
use crate::error::CaptureError;
use crate::room::SfuRoom;
use crate::types::{file_safe, ParticipantId, TrackId};
use chrono::{DateTime, Utc};
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};
use tracing::{debug, warn};
use webrtc::media::io::ogg_writer::OggWriter;
use webrtc::media::io::sample_builder::SampleBuilder;
use webrtc::media::io::Writer;
use webrtc::media::Sample;
use webrtc::rtp::codecs::opus::OpusPacket;
use webrtc::rtp::header::Header;
use webrtc::rtp::packet::Packet;

/// Packets the sample builder may hold back while waiting for reordering
const MAX_LATE_PACKETS: u16 = 50;

const OGG_CHANNELS: u8 = 2;

struct OpenSegment {
    writer: OggWriter<BufWriter<File>>,
    capture: u32,
    index: u32,
    path: PathBuf,
    started_at: DateTime<Utc>,
    opened: Instant,
}

impl OpenSegment {
    fn create(
        path: PathBuf,
        capture: u32,
        index: u32,
        opened: Instant,
    ) -> Result<Self, CaptureError> {
        let file = File::create(&path)?;
        let writer = OggWriter::new(BufWriter::new(file), OPUS_CLOCK_RATE, OGG_CHANNELS)?;
        Ok(Self {
            writer,
            capture,
            index,
            path,
            started_at: Utc::now(),
            opened,
        })
    }

    fn write(&mut self, sample: Sample) -> Result<(), CaptureError> {
        let packet = Packet {
            header: Header {
                version: 2,
                timestamp: sample.packet_timestamp,
                ..Default::default()
            },
            payload: sample.data,
        };
        self.writer.write_rtp(&packet)?;
        Ok(())
    }

    fn finish(mut self) -> Result<SegmentRecord, CaptureError> {
        self.writer.close()?;
        Ok(SegmentRecord {
            capture: self.capture,
            index: self.index,
            path: self.path,
            started_at: self.started_at,
            ended_at: Utc::now(),
        })
    }
}

/// Capture state of one audio track
pub(crate) struct TrackCapture {
    dir: PathBuf,
    prefix: String,
    capture: u32,
    segment_duration: Duration,
    gap: GapFiller,
    /// RTP timestamp of the first packet; later timestamps are counted from it
    base: Option<u32>,
    builder: SampleBuilder<OpusPacket>,
    current: Option<OpenSegment>,
    last_index: u32,
}

impl TrackCapture {
    pub fn new(
        dir: &Path,
        participant: &ParticipantId,
        track_id: &TrackId,
        capture: u32,
        segment_duration: Duration,
    ) -> Self {
        Self {
            dir: dir.to_path_buf(),
            prefix: format!(
                "{}-{}-{capture:03}",
                file_safe(participant.as_str()),
                file_safe(track_id.as_str())
            ),
            capture,
            segment_duration,
            gap: GapFiller::new(),
            base: None,
            builder: SampleBuilder::new(MAX_LATE_PACKETS, OpusPacket, OPUS_CLOCK_RATE),
            current: None,
            last_index: 0,
        }
    }

    fn segment_path(&self, index: u32) -> PathBuf {
        self.dir.join(format!("{}-{index:04}.ogg", self.prefix))
    }

    /// Feed one RTP packet received at `now`.
    ///
    /// Returns the segments closed by rotation.
    pub fn push(&mut self, packet: Packet, now: Instant) -> Result<Vec<SegmentRecord>, CaptureError> {
        let mut closed = Vec::new();
        for mut packet in self.gap.push(packet) {
            let timestamp = packet.header.timestamp;
            let base = *self.base.get_or_insert(timestamp);
            let offset = timestamp.wrapping_sub(base);
            // Older than the first packet
            if offset >= u32::MAX / 2 {
                continue;
            }
            packet.header.timestamp = offset;
            self.builder.push(packet);
        }

        while let Some(sample) = self.builder.pop() {
            let expired = self
                .current
                .as_ref()
                .is_some_and(|s| now.duration_since(s.opened) >= self.segment_duration);
            if expired {
                if let Some(segment) = self.current.take() {
                    closed.push(segment.finish()?);
                }
            }
            if self.current.is_none() {
                self.last_index += 1;
                let path = self.segment_path(self.last_index);
                self.current = Some(OpenSegment::create(
                    path,
                    self.capture,
                    self.last_index,
                    now,
                )?);
            }
            if let Some(segment) = self.current.as_mut() {
                segment.write(sample)?;
            }
        }
        Ok(closed)
    }

    /// Finalize the open segment, if any
    pub fn finish(&mut self) -> Result<Option<SegmentRecord>, CaptureError> {
        self.current.take().map(OpenSegment::finish).transpose()
    }
}

/// Capture task of one audio track; runs until the packet channel closes
pub(crate) async fn run_capture(
    room: Arc<SfuRoom>,
    participant: ParticipantId,
    track_id: TrackId,
    capture_id: u32,
    config: RecordingConfig,
    mut packets: mpsc::Receiver<Packet>,
) {
    let dir = config.recordings_dir.join(file_safe(room.id.as_str()));
    if let Err(e) = tokio::fs::create_dir_all(&dir).await {
        warn!(
            room_id = %room.id,
            dir = %dir.display(),
            error = %e,
            "Failed to create recording directory"
        );
        return;
    }

    let mut capture = TrackCapture::new(
        &dir,
        &participant,
        &track_id,
        capture_id,
        config.segment_duration(),
    );
    debug!(
        room_id = %room.id,
        participant = %participant,
        track_id = %track_id,
        capture = capture_id,
        "Audio capture started"
    );

    while let Some(packet) = packets.recv().await {
        match capture.push(packet, Instant::now()) {
            Ok(closed) => {
                for segment in closed {
                    room.record_segment(&participant, segment);
                }
            }
            Err(e) => {
                warn!(
                    room_id = %room.id,
                    track_id = %track_id,
                    error = %e,
                    "Audio capture failed"
                );
                break;
            }
        }
    }

    match capture.finish() {
        Ok(Some(segment)) => room.record_segment(&participant, segment),
        Ok(None) => {}
        Err(e) => warn!(
            room_id = %room.id,
            track_id = %track_id,
            error = %e,
            "Failed to finalize recording segment"
        ),
    }
    debug!(
        room_id = %room.id,
        track_id = %track_id,
        silence_frames = capture.gap.inserted(),
        "Audio capture stopped"
    );
}
