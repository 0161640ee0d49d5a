//! Video codec family detection and speed presets.

/// Encoder family, derived from the ffmpeg encoder name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecFamily {
    /// NVIDIA NVENC.
    Nvenc,
    /// Intel Quick Sync.
    Qsv,
    /// AMD AMF.
    Amf,
    /// Apple VideoToolbox.
    VideoToolbox,
    /// VA-API.
    Vaapi,
    /// CPU encoders such as libx264.
    Software,
}

impl CodecFamily {
    /// Classify an ffmpeg encoder name.
    pub fn from_codec_name(name: &str) -> Self {
        let name = name.to_ascii_lowercase();
        if name.ends_with("_nvenc") {
            Self::Nvenc
        } else if name.ends_with("_qsv") {
            Self::Qsv
        } else if name.ends_with("_amf") {
            Self::Amf
        } else if name.ends_with("_videotoolbox") {
            Self::VideoToolbox
        } else if name.ends_with("_vaapi") {
            Self::Vaapi
        } else {
            Self::Software
        }
    }

    /// Whether the family encodes on dedicated hardware.
    pub fn is_hardware_accelerated(self) -> bool {
        !matches!(self, Self::Software)
    }

    /// Arguments selecting the fastest preset of the family.
    pub fn preset_args(self) -> &'static [&'static str] {
        match self {
            Self::Nvenc => &["-preset", "p1", "-tune", "ull"],
            Self::Qsv => &["-preset", "veryfast"],
            Self::Amf => &["-quality", "speed"],
            Self::VideoToolbox => &["-realtime", "1"],
            Self::Vaapi => &[],
            Self::Software => &["-preset", "ultrafast", "-tune", "zerolatency"],
        }
    }

    /// Get family name for diagnostics.
    pub fn name(self) -> &'static str {
        match self {
            Self::Nvenc => "nvenc",
            Self::Qsv => "qsv",
            Self::Amf => "amf",
            Self::VideoToolbox => "videotoolbox",
            Self::Vaapi => "vaapi",
            Self::Software => "software",
        }
    }
}
