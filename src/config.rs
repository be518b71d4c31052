//! Recorder configuration surface and construction-time validation.

use std::path::PathBuf;

use tracing::warn;

use crate::utils::error::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    H264,
    H265,
    Vp9,
    Av1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderVendor {
    Auto,
    Nvidia,
    Amd,
    Intel,
    Software,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Preset {
    Ultrafast,
    Veryfast,
    Faster,
    Fast,
    Medium,
    Slow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncoderChoice {
    pub codec: Codec,
    pub vendor: EncoderVendor,
}

#[derive(Debug, Clone)]
pub struct AudioConfig {
    pub record_audio: bool,
    pub record_desktop_audio: bool,
    pub record_microphone: bool,
    pub desktop_volume: f32,
    pub microphone_volume: f32,
    /// `None` selects the default endpoint.
    pub desktop_device_id: Option<String>,
    pub microphone_device_id: Option<String>,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            record_audio: true,
            record_desktop_audio: true,
            record_microphone: false,
            desktop_volume: 1.0,
            microphone_volume: 1.0,
            desktop_device_id: None,
            microphone_device_id: None,
        }
    }
}

/// The full, validated configuration a [`crate::recorder::Recorder`] is
/// constructed from. Every field here is bounds-checked by [`validate`]
/// before the recorder accepts it.
#[derive(Debug, Clone)]
pub struct RecorderConfig {
    pub buffer_seconds: u32,
    pub fps: u32,
    pub bitrate_bps: u32,
    pub crf: u8,
    pub preset: Preset,
    pub use_hardware_encoding: bool,
    pub encoder: EncoderChoice,
    pub save_path: PathBuf,
    pub monitor_index: usize,
    pub audio: AudioConfig,
    /// Nominal duration of one encoded segment, in seconds. Not exposed as
    /// a validated field in the original surface, but pinned here so every
    /// component derives the same segment count instead of recomputing it.
    pub segment_duration_seconds: u32,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            buffer_seconds: 30,
            fps: 60,
            bitrate_bps: 8_000_000,
            crf: 23,
            preset: Preset::Fast,
            use_hardware_encoding: true,
            encoder: EncoderChoice {
                codec: Codec::H264,
                vendor: EncoderVendor::Auto,
            },
            save_path: PathBuf::from("."),
            monitor_index: 0,
            audio: AudioConfig::default(),
            segment_duration_seconds: 10,
        }
    }
}

impl RecorderConfig {
    /// Number of segments the encoder's own numbering needs to cover the
    /// buffer plus the §4.4 safety margin so a snapshot never races the
    /// segment currently being written.
    pub fn max_segments_to_keep(&self) -> usize {
        self.segments_to_keep() + 2
    }

    /// Number of tail segments a snapshot selects: `ceil(buffer_seconds /
    /// segment_duration_seconds)`.
    pub fn segments_to_keep(&self) -> usize {
        ((self.buffer_seconds + self.segment_duration_seconds - 1) / self.segment_duration_seconds)
            as usize
    }

    /// Validate all bounds from the configuration surface. Monitor index is
    /// clamped with a warning rather than rejected; everything else with no
    /// sane fallback is a fatal [`ConfigError`].
    pub fn validate(mut self, available_monitors: usize) -> Result<Self, ConfigError> {
        if !(15..=144).contains(&self.fps) {
            return Err(ConfigError::FpsOutOfRange(self.fps));
        }
        if !(5..=300).contains(&self.buffer_seconds) {
            return Err(ConfigError::BufferSecondsOutOfRange(self.buffer_seconds));
        }
        if !(500_000..=50_000_000).contains(&self.bitrate_bps) {
            return Err(ConfigError::BitrateOutOfRange(self.bitrate_bps));
        }
        if self.crf > 51 {
            return Err(ConfigError::CrfOutOfRange(self.crf));
        }
        if !(0.0..=2.0).contains(&self.audio.desktop_volume) {
            return Err(ConfigError::VolumeOutOfRange(self.audio.desktop_volume));
        }
        if !(0.0..=2.0).contains(&self.audio.microphone_volume) {
            return Err(ConfigError::VolumeOutOfRange(self.audio.microphone_volume));
        }
        if !self.save_path.is_dir() {
            return Err(ConfigError::SavePathNotDirectory(self.save_path));
        }

        if available_monitors == 0 {
            // Nothing sane to fall back to; let capture report it at start().
        } else if self.monitor_index >= available_monitors {
            warn!(
                "monitor_index {} out of range ({} available); falling back to primary",
                self.monitor_index, available_monitors
            );
            self.monitor_index = 0;
        }

        Ok(self)
    }

    pub fn frame_size(&self, width: u32, height: u32) -> usize {
        (width as usize) * (height as usize) * 4
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn config_with_save_path(dir: &std::path::Path) -> RecorderConfig {
        RecorderConfig {
            save_path: dir.to_path_buf(),
            ..Default::default()
        }
    }

    #[test]
    fn default_config_validates() {
        let dir = tempdir().unwrap();
        let config = config_with_save_path(dir.path());
        assert!(config.validate(1).is_ok());
    }

    #[test]
    fn fps_out_of_range_is_fatal() {
        let dir = tempdir().unwrap();
        let config = RecorderConfig {
            fps: 200,
            ..config_with_save_path(dir.path())
        };
        assert!(matches!(
            config.validate(1),
            Err(ConfigError::FpsOutOfRange(200))
        ));
    }

    #[test]
    fn out_of_range_monitor_index_falls_back_to_primary() {
        let dir = tempdir().unwrap();
        let config = RecorderConfig {
            monitor_index: 5,
            ..config_with_save_path(dir.path())
        };
        let validated = config.validate(1).unwrap();
        assert_eq!(validated.monitor_index, 0);
    }

    #[test]
    fn segments_to_keep_rounds_up() {
        let config = RecorderConfig {
            buffer_seconds: 25,
            segment_duration_seconds: 10,
            ..Default::default()
        };
        assert_eq!(config.segments_to_keep(), 3);
        assert_eq!(config.max_segments_to_keep(), 5);
    }

    #[test]
    fn save_path_must_be_a_directory() {
        let dir = tempdir().unwrap();
        let not_a_dir = dir.path().join("missing");
        let config = RecorderConfig {
            save_path: not_a_dir,
            ..Default::default()
        };
        assert!(config.validate(1).is_err());
    }
}
