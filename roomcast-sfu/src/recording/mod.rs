//! Audio recording
//!
//! Every inbound audio track of a room is captured into fixed-length Ogg/Opus
//! segments while the room is alive. The room timeline remembers when each
//! participant joined and which segments they produced; when the room closes
//! the [`Mixer`] turns the segments into one time-aligned file.

mod capture;
mod gap;
mod mixer;

pub use self::gap::GapFiller;
pub use self::mixer::{concat_args, mix_args, participant_offsets, Mixer};

use crate::config::RecordingConfig;
use crate::error::MixError;
use crate::room::SfuRoom;
use crate::types::{ParticipantId, RoomId, TrackId};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use webrtc::rtp::packet::Packet;

/// Packets queued per capture before the router starts dropping them
pub const CAPTURE_CHANNEL_CAPACITY: usize = 256;

/// A closed recording segment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentRecord {
    /// Room-wide number of the capture that wrote the segment
    pub capture: u32,
    /// Position of the segment within its track, starting at 1
    pub index: u32,
    pub path: PathBuf,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ParticipantTimeline {
    /// First time the participant joined the room
    pub joined_at: DateTime<Utc>,
    /// Last time the participant left the room
    pub left_at: Option<DateTime<Utc>>,
    pub segments: Vec<SegmentRecord>,
}

/// Recording metadata of one room
pub struct RoomTimeline {
    pub started_at: DateTime<Utc>,
    pub participants: HashMap<ParticipantId, ParticipantTimeline>,
    pub(crate) captures: Vec<JoinHandle<()>>,
}

impl RoomTimeline {
    #[must_use]
    pub fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            participants: HashMap::new(),
            captures: Vec::new(),
        }
    }

    /// Record a join; a participant keeps their earliest join time
    pub fn record_join(&mut self, participant: &ParticipantId, at: DateTime<Utc>) {
        self.participants
            .entry(participant.clone())
            .and_modify(|p| {
                if at < p.joined_at {
                    p.joined_at = at;
                }
            })
            .or_insert_with(|| ParticipantTimeline {
                joined_at: at,
                left_at: None,
                segments: Vec::new(),
            });
    }

    pub fn record_leave(&mut self, participant: &ParticipantId, at: DateTime<Utc>) {
        if let Some(p) = self.participants.get_mut(participant) {
            p.left_at = Some(at);
        }
    }

    pub fn record_segment(&mut self, participant: &ParticipantId, segment: SegmentRecord) {
        match self.participants.get_mut(participant) {
            Some(p) => p.segments.push(segment),
            None => warn!(
                participant = %participant,
                path = %segment.path.display(),
                "Segment recorded for unknown participant"
            ),
        }
    }

    pub fn participant(&self, participant: &ParticipantId) -> Option<&ParticipantTimeline> {
        self.participants.get(participant)
    }
}

/// Receives the location of every finished room recording
pub trait RecordingObserver: Send + Sync {
    fn recording_ready(&self, room_id: &RoomId, path: &Path);
}

/// Observer that only logs
#[derive(Debug, Default)]
pub struct LogRecordingObserver;

impl RecordingObserver for LogRecordingObserver {
    fn recording_ready(&self, room_id: &RoomId, path: &Path) {
        info!(room_id = %room_id, path = %path.display(), "Room recording ready");
    }
}

/// Starts audio captures and finishes room recordings
pub struct Recorder {
    config: RecordingConfig,
    mixer: Mixer,
    observer: Arc<dyn RecordingObserver>,
}

impl Recorder {
    pub fn new(config: RecordingConfig, observer: Arc<dyn RecordingObserver>) -> Self {
        let mixer = Mixer::new(config.clone());
        Self {
            config,
            mixer,
            observer,
        }
    }

    pub fn config(&self) -> &RecordingConfig {
        &self.config
    }

    /// Spawn the capture of one audio track and return its packet channel.
    ///
    /// The capture ends when every sender is dropped.
    pub(crate) fn start_capture(
        &self,
        room: &Arc<SfuRoom>,
        participant: ParticipantId,
        track_id: TrackId,
    ) -> mpsc::Sender<Packet> {
        let (tx, rx) = mpsc::channel(CAPTURE_CHANNEL_CAPACITY);
        let handle = tokio::spawn(capture::run_capture(
            Arc::clone(room),
            participant,
            track_id,
            room.next_capture_id(),
            self.config.clone(),
            rx,
        ));
        room.register_capture(handle);
        tx
    }

    /// Wait for the room's captures, mix their segments and notify the observer
    pub async fn finish_room(&self, room: Arc<SfuRoom>) -> Result<PathBuf, MixError> {
        for handle in room.take_captures() {
            if let Err(e) = handle.await {
                warn!(room_id = %room.id, error = %e, "Capture task failed");
            }
        }
        let timeline = room.take_timeline().ok_or(MixError::TimelineTaken)?;

        let path = self.mixer.mix(&room.id, &timeline).await?;
        self.observer.recording_ready(&room.id, &path);
        Ok(path)
    }
}
