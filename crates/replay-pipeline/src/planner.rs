//! Argument planning for the capture pipeline.
//!
//! [`plan`] is a pure function of the configuration, the detected audio
//! devices, the platform capture backend and the output sink. It never
//! touches the system, so every branch is unit-testable.

use std::path::PathBuf;

use replay_ipc::{AudioDevice, AudioDeviceType, RecorderConfig};

use crate::codec::CodecFamily;
use crate::{SIDE_CHANNEL_CHANNELS, SIDE_CHANNEL_SAMPLE_RATE};

/// File name prefix of disk segments.
pub const SEGMENT_PREFIX: &str = "segment_";

/// Shortest segment interval. Segment names resolve to the second, so two
/// segments must never open within the same second.
pub const MIN_SEGMENT_SECONDS: u32 = 2;

/// Highest accepted video bitrate.
pub const MAX_VIDEO_BITRATE_KBPS: u32 = 500_000;

const VIDEO_THREAD_QUEUE: &str = "1024";
const AUDIO_THREAD_QUEUE: &str = "4096";
const AUDIO_CODEC: &str = "aac";
const AUDIO_BITRATE: &str = "192k";

/// Platform screen and microphone capture backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureBackend {
    /// Windows: gdigrab for video, dshow for the microphone.
    Gdigrab,
    /// Linux: x11grab for video, PulseAudio for the microphone.
    X11grab,
    /// macOS: avfoundation for both.
    Avfoundation,
}

impl CaptureBackend {
    /// Backend for the platform this binary was built for.
    pub fn current() -> Self {
        if cfg!(target_os = "windows") {
            Self::Gdigrab
        } else if cfg!(target_os = "macos") {
            Self::Avfoundation
        } else {
            Self::X11grab
        }
    }

    fn video_format(self) -> &'static str {
        match self {
            Self::Gdigrab => "gdigrab",
            Self::X11grab => "x11grab",
            Self::Avfoundation => "avfoundation",
        }
    }

    fn default_video_input(self) -> &'static str {
        match self {
            Self::Gdigrab => "desktop",
            Self::X11grab => ":0.0",
            Self::Avfoundation => "1:none",
        }
    }

    fn mic_format(self) -> &'static str {
        match self {
            Self::Gdigrab => "dshow",
            Self::X11grab => "pulse",
            Self::Avfoundation => "avfoundation",
        }
    }

    fn mic_input(self, device: &AudioDevice) -> String {
        match self {
            Self::Gdigrab => format!("audio={}", device.name),
            Self::X11grab => device.id.clone(),
            Self::Avfoundation => format!(":{}", device.name),
        }
    }
}

/// Where the pipeline writes its encoded output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputSink {
    /// One continuous MPEG-TS byte stream on stdout.
    Stream,

    /// One MPEG-TS file per interval, named by wall-clock time.
    Segments {
        /// Directory the segments are written to.
        dir: PathBuf,

        /// Segment length in seconds.
        segment_seconds: u32,
    },
}

/// Which audio sources made it into the invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioPlan {
    /// Video only.
    None,
    /// Microphone only, mapped directly.
    Mic,
    /// Relayed system audio only, mapped directly.
    System,
    /// Both sources merged into one track.
    Mixed,
}

impl AudioPlan {
    /// Whether the invocation reads relayed samples from stdin.
    pub fn uses_side_channel(self) -> bool {
        matches!(self, Self::System | Self::Mixed)
    }

    /// Whether any audio track is produced.
    pub fn has_audio(self) -> bool {
        !matches!(self, Self::None)
    }
}

/// A fully planned pipeline invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    /// Program to execute.
    pub program: String,

    /// Ordered arguments.
    pub args: Vec<String>,

    /// Audio sources included.
    pub audio: AudioPlan,

    /// Output sink.
    pub sink: OutputSink,
}

/// Build the pipeline invocation for `config`.
///
/// Audio selectors that do not resolve against `devices` are left out rather
/// than failing the whole plan.
pub fn plan(
    config: &RecorderConfig,
    devices: &[AudioDevice],
    backend: CaptureBackend,
    sink: OutputSink,
) -> Invocation {
    let system = config
        .system_audio_device
        .as_deref()
        .and_then(|selector| resolve_device(selector, AudioDeviceType::Output, devices));
    let mic = config
        .mic_device
        .as_deref()
        .and_then(|selector| resolve_device(selector, AudioDeviceType::Input, devices));

    let audio = match (system.is_some(), mic.is_some()) {
        (true, true) => AudioPlan::Mixed,
        (true, false) => AudioPlan::System,
        (false, true) => AudioPlan::Mic,
        (false, false) => AudioPlan::None,
    };

    let mut args = Args::default();
    args.push_all(&["-hide_banner", "-loglevel", "info", "-nostdin", "-y"]);

    // Input 0: video
    let framerate = config.frame_rate.to_string();
    let video_input = config
        .video_input
        .clone()
        .unwrap_or_else(|| backend.default_video_input().to_string());
    args.push_all(&["-thread_queue_size", VIDEO_THREAD_QUEUE]);
    args.push_all(&["-f", backend.video_format(), "-framerate", &framerate]);
    if backend == CaptureBackend::Avfoundation {
        args.push_all(&["-capture_cursor", "1"]);
    }
    args.push_all(&["-i", &video_input]);

    // Input 1: relayed system audio on stdin
    if system.is_some() {
        let rate = SIDE_CHANNEL_SAMPLE_RATE.to_string();
        let channels = SIDE_CHANNEL_CHANNELS.to_string();
        args.push_all(&["-thread_queue_size", AUDIO_THREAD_QUEUE]);
        args.push_all(&["-f", "f32le", "-ar", &rate, "-ac", &channels, "-i", "pipe:0"]);
    }

    // Input 1 or 2: microphone
    if let Some(device) = mic {
        let input = backend.mic_input(device);
        args.push_all(&["-thread_queue_size", AUDIO_THREAD_QUEUE]);
        args.push_all(&["-f", backend.mic_format(), "-i", &input]);
    }

    match audio {
        AudioPlan::Mixed => {
            args.push_all(&[
                "-filter_complex",
                "[1:a][2:a]amix=inputs=2:duration=longest:dropout_transition=0[aout]",
                "-map",
                "0:v",
                "-map",
                "[aout]",
            ]);
        }
        AudioPlan::System | AudioPlan::Mic => {
            args.push_all(&["-map", "0:v", "-map", "1:a"]);
        }
        AudioPlan::None => {
            args.push_all(&["-map", "0:v"]);
        }
    }

    // Video encoding
    let family = CodecFamily::from_codec_name(&config.video_codec);
    let bitrate = u64::from(config.video_bitrate_kbps);
    args.push_all(&["-c:v", &config.video_codec]);
    args.push_all(family.preset_args());
    args.push_all(&[
        "-b:v",
        &format!("{bitrate}k"),
        "-maxrate",
        &format!("{}k", bitrate * 3 / 2),
        "-bufsize",
        &format!("{}k", bitrate * 2),
        "-pix_fmt",
        "yuv420p",
        // One keyframe per second bounds the trim tolerance.
        "-g",
        &framerate,
        "-keyint_min",
        &framerate,
    ]);

    if audio.has_audio() {
        args.push_all(&["-c:a", AUDIO_CODEC, "-b:a", AUDIO_BITRATE, "-ar", "48000", "-ac", "2"]);
    }

    match &sink {
        OutputSink::Stream => {
            args.push_all(&["-f", "mpegts", "-flush_packets", "1", "pipe:1"]);
        }
        OutputSink::Segments {
            dir,
            segment_seconds,
        } => {
            let pattern = dir.join(format!("{SEGMENT_PREFIX}%Y%m%d_%H%M%S.ts"));
            args.push_all(&[
                "-f",
                "segment",
                "-segment_time",
                &(*segment_seconds).max(MIN_SEGMENT_SECONDS).to_string(),
                "-segment_format",
                "mpegts",
                "-reset_timestamps",
                "1",
                "-strftime",
                "1",
            ]);
            args.push(pattern.to_string_lossy().into_owned());
        }
    }

    Invocation {
        program: config.pipeline_program.clone(),
        args: args.0,
        audio,
        sink,
    }
}

/// Resolve a device selector. `"default"` picks the default device of the type.
fn resolve_device<'a>(
    selector: &str,
    device_type: AudioDeviceType,
    devices: &'a [AudioDevice],
) -> Option<&'a AudioDevice> {
    let mut candidates = devices.iter().filter(|d| d.device_type == device_type);
    if selector.eq_ignore_ascii_case("default") {
        return candidates.find(|d| d.is_default);
    }
    candidates.find(|d| d.id == selector || d.name == selector)
}

#[derive(Default)]
struct Args(Vec<String>);

impl Args {
    fn push(&mut self, arg: String) {
        self.0.push(arg);
    }

    fn push_all(&mut self, args: &[&str]) {
        self.0.extend(args.iter().map(|a| a.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(id: &str, device_type: AudioDeviceType, is_default: bool) -> AudioDevice {
        AudioDevice {
            id: id.to_string(),
            name: format!("{id} name"),
            device_type,
            is_default,
        }
    }

    fn devices() -> Vec<AudioDevice> {
        vec![
            device("mic-1", AudioDeviceType::Input, true),
            device("mic-2", AudioDeviceType::Input, false),
            device("speakers", AudioDeviceType::Output, true),
        ]
    }

    fn position(args: &[String], value: &str) -> Option<usize> {
        args.iter().position(|a| a == value)
    }

    #[test]
    fn test_video_only_omits_audio_mapping() {
        let config = RecorderConfig::default();
        let inv = plan(&config, &devices(), CaptureBackend::X11grab, OutputSink::Stream);

        assert_eq!(inv.audio, AudioPlan::None);
        assert_eq!(inv.program, "ffmpeg");
        assert!(position(&inv.args, "pipe:0").is_none());
        assert!(position(&inv.args, "-c:a").is_none());
        assert!(position(&inv.args, "-filter_complex").is_none());
        assert_eq!(inv.args.iter().filter(|a| *a == "-map").count(), 1);
        assert_eq!(inv.args.last().map(String::as_str), Some("pipe:1"));
    }

    #[test]
    fn test_single_mic_is_mapped_directly() {
        let config = RecorderConfig {
            mic_device: Some("mic-2".to_string()),
            ..Default::default()
        };
        let inv = plan(&config, &devices(), CaptureBackend::X11grab, OutputSink::Stream);

        assert_eq!(inv.audio, AudioPlan::Mic);
        let i = position(&inv.args, "pulse").unwrap();
        assert_eq!(inv.args[i + 2], "mic-2");
        assert!(position(&inv.args, "1:a").is_some());
        assert!(!inv.audio.uses_side_channel());
    }

    #[test]
    fn test_system_audio_reads_stdin() {
        let config = RecorderConfig {
            system_audio_device: Some("default".to_string()),
            ..Default::default()
        };
        let inv = plan(&config, &devices(), CaptureBackend::Gdigrab, OutputSink::Stream);

        assert_eq!(inv.audio, AudioPlan::System);
        assert!(inv.audio.uses_side_channel());
        let i = position(&inv.args, "f32le").unwrap();
        assert_eq!(&inv.args[i + 1..i + 7], ["-ar", "48000", "-ac", "2", "-i", "pipe:0"]);
    }

    #[test]
    fn test_two_sources_are_mixed() {
        let config = RecorderConfig {
            mic_device: Some("default".to_string()),
            system_audio_device: Some("speakers".to_string()),
            ..Default::default()
        };
        let inv = plan(&config, &devices(), CaptureBackend::Gdigrab, OutputSink::Stream);

        assert_eq!(inv.audio, AudioPlan::Mixed);
        let i = position(&inv.args, "-filter_complex").unwrap();
        assert!(inv.args[i + 1].contains("amix=inputs=2"));
        assert!(position(&inv.args, "[aout]").is_some());
        assert!(position(&inv.args, "audio=mic-1 name").is_some());
        // stdin input comes before the microphone so indices match the filter
        assert!(position(&inv.args, "pipe:0").unwrap() < position(&inv.args, "dshow").unwrap());
    }

    #[test]
    fn test_unknown_device_is_skipped() {
        let config = RecorderConfig {
            mic_device: Some("unplugged".to_string()),
            ..Default::default()
        };
        let inv = plan(&config, &devices(), CaptureBackend::X11grab, OutputSink::Stream);
        assert_eq!(inv.audio, AudioPlan::None);
    }

    #[test]
    fn test_hardware_codec_gets_hardware_preset() {
        let config = RecorderConfig {
            video_codec: "h264_nvenc".to_string(),
            ..Default::default()
        };
        let inv = plan(&config, &[], CaptureBackend::Gdigrab, OutputSink::Stream);
        let i = position(&inv.args, "-preset").unwrap();
        assert_eq!(inv.args[i + 1], "p1");

        let inv = plan(&RecorderConfig::default(), &[], CaptureBackend::Gdigrab, OutputSink::Stream);
        let i = position(&inv.args, "-preset").unwrap();
        assert_eq!(inv.args[i + 1], "ultrafast");
    }

    #[test]
    fn test_segment_sink() {
        let sink = OutputSink::Segments {
            dir: PathBuf::from("/tmp/buffer"),
            segment_seconds: 2,
        };
        let inv = plan(&RecorderConfig::default(), &[], CaptureBackend::X11grab, sink.clone());

        assert_eq!(inv.sink, sink);
        let i = position(&inv.args, "-segment_time").unwrap();
        assert_eq!(inv.args[i + 1], "2");
        let last = inv.args.last().unwrap();
        assert!(last.starts_with("/tmp/buffer"));
        assert!(last.ends_with("segment_%Y%m%d_%H%M%S.ts"));
    }

    #[test]
    fn test_segment_interval_has_floor() {
        let sink = OutputSink::Segments {
            dir: PathBuf::from("/tmp/buffer"),
            segment_seconds: 1,
        };
        let inv = plan(&RecorderConfig::default(), &[], CaptureBackend::X11grab, sink);
        let i = position(&inv.args, "-segment_time").unwrap();
        assert_eq!(inv.args[i + 1], MIN_SEGMENT_SECONDS.to_string());
    }

    #[test]
    fn test_rate_control_does_not_overflow() {
        let config = RecorderConfig {
            video_bitrate_kbps: u32::MAX,
            ..Default::default()
        };
        let inv = plan(&config, &[], CaptureBackend::X11grab, OutputSink::Stream);
        let i = position(&inv.args, "-maxrate").unwrap();
        assert_eq!(inv.args[i + 1], format!("{}k", u64::from(u32::MAX) * 3 / 2));
        let i = position(&inv.args, "-bufsize").unwrap();
        assert_eq!(inv.args[i + 1], format!("{}k", u64::from(u32::MAX) * 2));
    }

    #[test]
    fn test_plan_is_deterministic() {
        let config = RecorderConfig {
            mic_device: Some("default".to_string()),
            ..Default::default()
        };
        let a = plan(&config, &devices(), CaptureBackend::Avfoundation, OutputSink::Stream);
        let b = plan(&config, &devices(), CaptureBackend::Avfoundation, OutputSink::Stream);
        assert_eq!(a, b);
    }
}
