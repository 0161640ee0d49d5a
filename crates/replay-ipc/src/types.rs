//! Common types used across recorder messages.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Persisted recorder configuration.
///
/// Every field has a default so that files written by older versions, or
/// edited by hand, still load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    /// Capture frame rate.
    pub frame_rate: u32,

    /// Encoder name as understood by the pipeline (e.g. "libx264", "h264_nvenc").
    pub video_codec: String,

    /// Video bitrate in kbps.
    pub video_bitrate_kbps: u32,

    /// Length of the replay window in seconds.
    pub window_seconds: u32,

    /// Where replays are written. `None` means the platform video folder.
    pub output_dir: Option<PathBuf>,

    /// Hotkey that triggers a save, registered by the host.
    pub hotkey: String,

    /// Start recording when the host launches.
    pub auto_start: bool,

    /// Resume recording on launch if the last session ended while recording.
    pub resume_recording: bool,

    /// Primary audio device (microphone) captured by the pipeline itself.
    pub mic_device: Option<String>,

    /// Secondary audio device (system audio) delivered through the relay.
    pub system_audio_device: Option<String>,

    /// Where the rolling buffer lives.
    pub buffer_mode: BufferMode,

    /// Retention slack beyond the window, in seconds.
    pub safety_margin_seconds: u32,

    /// Hard cap on buffered bytes in memory mode.
    pub hard_byte_cap: u64,

    /// Segment length in disk mode, in seconds.
    pub segment_seconds: u32,

    /// Extra segments selected beyond the window in disk mode.
    pub extra_segments: u32,

    /// Minimum buffered bytes before a replay can be saved.
    pub min_buffer_bytes: u64,

    /// Minimum size of a valid replay file.
    pub min_artifact_bytes: u64,

    /// Program used for capture and remuxing.
    pub pipeline_program: String,

    /// Capture source override (`None` picks the platform default).
    pub video_input: Option<String>,

    /// Written by the recorder: whether the last session ended while recording.
    pub was_recording: bool,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            frame_rate: 60,
            video_codec: "libx264".to_string(),
            video_bitrate_kbps: 8000,
            window_seconds: 30,
            output_dir: None,
            hotkey: "Alt+F10".to_string(),
            auto_start: false,
            resume_recording: true,
            mic_device: None,
            system_audio_device: None,
            buffer_mode: BufferMode::Memory,
            safety_margin_seconds: 5,
            hard_byte_cap: 512 * 1024 * 1024,
            segment_seconds: 2,
            extra_segments: 1,
            min_buffer_bytes: 64 * 1024,
            min_artifact_bytes: 16 * 1024,
            pipeline_program: "ffmpeg".to_string(),
            video_input: None,
            was_recording: false,
        }
    }
}

impl RecorderConfig {
    /// Returns true if the audio device selection differs from `other`.
    pub fn audio_devices_differ(&self, other: &RecorderConfig) -> bool {
        self.mic_device != other.mic_device
            || self.system_audio_device != other.system_audio_device
    }
}

/// Storage backend for the rolling buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum BufferMode {
    /// Pipeline output streamed into memory chunks.
    #[default]
    Memory,

    /// Pipeline writes fixed-length segment files to a directory.
    Disk,
}

/// Snapshot of buffer occupancy for status displays.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BufferStatus {
    /// Number of chunks or segment files held.
    pub entries: usize,

    /// Total bytes held.
    pub bytes: u64,

    /// Time covered by the held entries, in seconds.
    pub span_seconds: f64,
}

/// An audio device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioDevice {
    /// Unique identifier for this device.
    pub id: String,

    /// Display name for the UI.
    pub name: String,

    /// Type of audio device.
    pub device_type: AudioDeviceType,

    /// Whether this is the default device.
    pub is_default: bool,
}

/// Type of audio device.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AudioDeviceType {
    /// Input device (microphone).
    Input,

    /// Output device (for loopback capture).
    Output,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_fills_defaults() {
        let json = r#"{ "window_seconds": 45, "mic_device": "Headset" }"#;
        let config: RecorderConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.window_seconds, 45);
        assert_eq!(config.mic_device.as_deref(), Some("Headset"));
        assert_eq!(config.frame_rate, 60);
        assert_eq!(config.buffer_mode, BufferMode::Memory);
    }

    #[test]
    fn test_audio_devices_differ() {
        let a = RecorderConfig::default();
        let mut b = a.clone();
        b.video_bitrate_kbps = 12000;
        assert!(!a.audio_devices_differ(&b));

        b.system_audio_device = Some("Speakers".to_string());
        assert!(a.audio_devices_differ(&b));
    }
}
