//! Offline, time-aligned mixing of a room's recorded segments
//!
//! The segments of each capture are first concatenated into one WAV stream
//! at the canonical sample rate, then all streams are delayed by their start
//! offset and summed without normalization.

use super::{RoomTimeline, SegmentRecord};
use crate::config::RecordingConfig;
use crate::error::MixError;
use crate::types::{file_safe, ParticipantId, RoomId};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Segments and start offset of one captured track
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantTrack {
    pub participant: ParticipantId,
    /// Room-wide capture number
    pub capture: u32,
    /// Milliseconds between room start and the first segment of the capture
    pub offset_ms: u64,
    /// Segment files in playback order
    pub segments: Vec<PathBuf>,
}

/// Collect one stream per capture, ordered by offset.
///
/// A participant's earliest capture starts at their first join; their other
/// captures are shifted by how much later their first segment started.
#[must_use]
pub fn participant_offsets(timeline: &RoomTimeline) -> Vec<ParticipantTrack> {
    let mut tracks = Vec::new();
    for (id, p) in &timeline.participants {
        let Some(first_start) = p.segments.iter().map(|s| s.started_at).min() else {
            continue;
        };
        let join_ms = (p.joined_at - timeline.started_at).num_milliseconds();

        let mut captures: BTreeMap<u32, Vec<&SegmentRecord>> = BTreeMap::new();
        for segment in &p.segments {
            captures.entry(segment.capture).or_default().push(segment);
        }
        for (capture, mut segments) in captures {
            segments.sort_by(|a, b| {
                a.started_at
                    .cmp(&b.started_at)
                    .then(a.index.cmp(&b.index))
            });
            let shift_ms = (segments[0].started_at - first_start).num_milliseconds();
            tracks.push(ParticipantTrack {
                participant: id.clone(),
                capture,
                offset_ms: (join_ms + shift_ms).max(0).unsigned_abs(),
                segments: segments.into_iter().map(|s| s.path.clone()).collect(),
            });
        }
    }
    tracks.sort_by(|a, b| {
        a.offset_ms
            .cmp(&b.offset_ms)
            .then_with(|| a.participant.cmp(&b.participant))
            .then(a.capture.cmp(&b.capture))
    });
    tracks
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Arguments that concatenate `inputs` into one re-encoded file
#[must_use]
pub fn concat_args(inputs: &[PathBuf], output: &Path, sample_rate: u32, channels: u16) -> Vec<String> {
    let mut args = vec!["-y".to_string(), "-hide_banner".to_string()];
    for input in inputs {
        args.push("-i".to_string());
        args.push(path_arg(input));
    }
    let streams: String = (0..inputs.len()).map(|i| format!("[{i}:a]")).collect();
    args.extend([
        "-filter_complex".to_string(),
        format!("{streams}concat=n={}:v=0:a=1[out]", inputs.len()),
        "-map".to_string(),
        "[out]".to_string(),
        "-ar".to_string(),
        sample_rate.to_string(),
        "-ac".to_string(),
        channels.to_string(),
        path_arg(output),
    ]);
    args
}

/// Arguments that delay each input by its offset and sum them
#[must_use]
pub fn mix_args(inputs: &[(PathBuf, u64)], output: &Path, channels: u16) -> Vec<String> {
    let mut args = vec!["-y".to_string(), "-hide_banner".to_string()];
    for (input, _) in inputs {
        args.push("-i".to_string());
        args.push(path_arg(input));
    }

    let mut filter = String::new();
    let mut labels = String::new();
    for (i, (_, offset_ms)) in inputs.iter().enumerate() {
        let delays = vec![offset_ms.to_string(); usize::from(channels.max(1))].join("|");
        filter.push_str(&format!("[{i}:a]adelay={delays}[a{i}];"));
        labels.push_str(&format!("[a{i}]"));
    }
    filter.push_str(&format!(
        "{labels}amix=inputs={}:duration=longest:normalize=0[out]",
        inputs.len()
    ));

    args.extend([
        "-filter_complex".to_string(),
        filter,
        "-map".to_string(),
        "[out]".to_string(),
        path_arg(output),
    ]);
    args
}

pub struct Mixer {
    config: RecordingConfig,
}

impl Mixer {
    pub fn new(config: RecordingConfig) -> Self {
        Self { config }
    }

    /// Verify that the audio tool can be started
    pub async fn check_tool(&self) -> Result<(), MixError> {
        let output = Command::new(&self.config.ffmpeg_path)
            .arg("-version")
            .output()
            .await
            .map_err(|e| MixError::ToolMissing(format!("{}: {e}", self.config.ffmpeg_path)))?;
        if !output.status.success() {
            return Err(MixError::ToolMissing(format!(
                "{} -version exited with {}",
                self.config.ffmpeg_path, output.status
            )));
        }
        Ok(())
    }

    async fn run(&self, step: &'static str, args: Vec<String>) -> Result<(), MixError> {
        debug!(step, args = ?args, "Running audio tool");
        let output = Command::new(&self.config.ffmpeg_path)
            .args(&args)
            .kill_on_drop(true)
            .output()
            .await?;
        if !output.status.success() {
            return Err(MixError::ToolFailed {
                step,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }

    /// Mix the room's recording into `<output_dir>/<room_id>.<format>`.
    ///
    /// Segment files are kept when anything fails.
    pub async fn mix(&self, room_id: &RoomId, timeline: &RoomTimeline) -> Result<PathBuf, MixError> {
        let tracks = participant_offsets(timeline);
        if tracks.is_empty() {
            return Err(MixError::NoSegments);
        }
        self.check_tool().await?;

        let room_name = file_safe(room_id.as_str());
        let work_dir = self.config.recordings_dir.join(format!(".{room_name}-mix"));
        tokio::fs::create_dir_all(&work_dir).await?;
        tokio::fs::create_dir_all(&self.config.output_dir).await?;
        let output = self
            .config
            .output_dir
            .join(format!("{room_name}.{}", self.config.format));

        let result = self.mix_into(&tracks, &work_dir, &output).await;
        if let Err(e) = tokio::fs::remove_dir_all(&work_dir).await {
            warn!(dir = %work_dir.display(), error = %e, "Failed to remove mix working directory");
        }
        result?;

        if !self.config.keep_segments {
            self.remove_segments(&tracks).await;
        }
        info!(
            room_id = %room_id,
            streams = tracks.len(),
            output = %output.display(),
            "Mixed room recording"
        );
        Ok(output)
    }

    async fn mix_into(
        &self,
        tracks: &[ParticipantTrack],
        work_dir: &Path,
        output: &Path,
    ) -> Result<(), MixError> {
        let mut streams = Vec::with_capacity(tracks.len());
        for (i, track) in tracks.iter().enumerate() {
            let wav = work_dir.join(format!(
                "{i:03}-{}-{:03}.wav",
                file_safe(track.participant.as_str()),
                track.capture
            ));
            self.run(
                "concat",
                concat_args(&track.segments, &wav, self.config.sample_rate, self.config.channels),
            )
            .await?;
            streams.push((wav, track.offset_ms));
        }
        self.run("mix", mix_args(&streams, output, self.config.channels))
            .await
    }

    async fn remove_segments(&self, tracks: &[ParticipantTrack]) {
        for path in tracks.iter().flat_map(|t| &t.segments) {
            if let Err(e) = tokio::fs::remove_file(path).await {
                warn!(path = %path.display(), error = %e, "Failed to remove segment");
            }
        }
        // Room directories are removed once the last segment is gone
        for dir in tracks
            .iter()
            .flat_map(|t| &t.segments)
            .filter_map(|p| p.parent())
        {
            let _ = tokio::fs::remove_dir(dir).await;
        }
    }
}
