//! SFU Configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// SFU configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SfuConfig {
    /// Maximum number of concurrent rooms (0 = unlimited)
    pub max_rooms: usize,
    /// Maximum connections per room (0 = unlimited)
    pub max_connections_per_room: usize,
    /// Minimum interval between two offers sent to the same connection
    pub renegotiation_debounce_ms: u64,
    /// Delay of the single retry pass scheduled after an offer is sent
    pub renegotiation_retry_ms: u64,
    /// Interval of the self-healing resync pass (0 = disabled)
    pub resync_interval_secs: u64,
    /// Interval between picture-loss indications sent to video publishers
    pub keyframe_interval_ms: u64,
    /// Audio recording and mixing
    pub recording: RecordingConfig,
}

impl Default for SfuConfig {
    fn default() -> Self {
        Self {
            max_rooms: 0,
            max_connections_per_room: 0,
            renegotiation_debounce_ms: 1000,
            renegotiation_retry_ms: 3000,
            resync_interval_secs: 10,
            keyframe_interval_ms: 3000,
            recording: RecordingConfig::default(),
        }
    }
}

impl SfuConfig {
    #[must_use]
    pub const fn renegotiation_debounce(&self) -> Duration {
        Duration::from_millis(self.renegotiation_debounce_ms)
    }

    #[must_use]
    pub const fn renegotiation_retry(&self) -> Duration {
        Duration::from_millis(self.renegotiation_retry_ms)
    }

    #[must_use]
    pub const fn resync_interval(&self) -> Option<Duration> {
        if self.resync_interval_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.resync_interval_secs))
        }
    }

    #[must_use]
    pub const fn keyframe_interval(&self) -> Duration {
        Duration::from_millis(self.keyframe_interval_ms)
    }

    /// Check the configuration for values the SFU cannot run with
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.keyframe_interval_ms == 0 {
            errors.push("sfu.keyframe_interval_ms must be greater than 0".to_string());
        }
        if self.renegotiation_retry_ms <= self.renegotiation_debounce_ms {
            errors.push(
                "sfu.renegotiation_retry_ms must be greater than sfu.renegotiation_debounce_ms"
                    .to_string(),
            );
        }
        if self.recording.enabled {
            if self.recording.segment_duration_secs == 0 {
                errors.push("sfu.recording.segment_duration_secs must be greater than 0".to_string());
            }
            if self.recording.channels == 0 || self.recording.channels > 2 {
                errors.push("sfu.recording.channels must be 1 or 2".to_string());
            }
            if self.recording.format.is_empty() {
                errors.push("sfu.recording.format must not be empty".to_string());
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Audio capture and mixing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    /// Capture audio tracks and mix them when a room closes
    pub enabled: bool,
    /// Directory holding per-room segment files
    pub recordings_dir: PathBuf,
    /// Directory receiving the final mixed file of each room
    pub output_dir: PathBuf,
    /// Wall-clock length of one recording segment
    pub segment_duration_secs: u64,
    /// External audio tool used for concatenation and mixing
    pub ffmpeg_path: String,
    /// Canonical sample rate of the mixed output
    pub sample_rate: u32,
    /// Canonical channel count of the mixed output
    pub channels: u16,
    /// Container extension of the mixed output ("ogg", "wav", "mp3", ...)
    pub format: String,
    /// Keep segment files after a successful mix
    pub keep_segments: bool,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            recordings_dir: PathBuf::from("./data/recordings"),
            output_dir: PathBuf::from("./data/mixed"),
            segment_duration_secs: 60,
            ffmpeg_path: "ffmpeg".to_string(),
            sample_rate: 48_000,
            channels: 2,
            format: "ogg".to_string(),
            keep_segments: false,
        }
    }
}

impl RecordingConfig {
    #[must_use]
    pub const fn segment_duration(&self) -> Duration {
        Duration::from_secs(self.segment_duration_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = SfuConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.renegotiation_debounce(), Duration::from_secs(1));
        assert_eq!(config.resync_interval(), Some(Duration::from_secs(10)));
    }

    #[test]
    fn test_retry_must_outlast_debounce() {
        let config = SfuConfig {
            renegotiation_debounce_ms: 3000,
            renegotiation_retry_ms: 3000,
            ..SfuConfig::default()
        };
        let errors = config.validate().unwrap_err();
        assert!(errors[0].contains("renegotiation_retry_ms"));
    }

    #[test]
    fn test_resync_disabled() {
        let config = SfuConfig {
            resync_interval_secs: 0,
            ..SfuConfig::default()
        };
        assert_eq!(config.resync_interval(), None);
    }

    #[test]
    fn test_invalid_recording_config() {
        let mut config = SfuConfig::default();
        config.recording.channels = 6;
        config.recording.segment_duration_secs = 0;

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 2);
    }
}
