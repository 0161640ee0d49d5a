//! Persisted recorder configuration.
//!
//! The record lives at `<config dir>/instant-replay/config.json`. It is read
//! once when the store opens and rewritten after every accepted change.

use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use replay_ipc::RecorderConfig;
use replay_pipeline::{MAX_VIDEO_BITRATE_KBPS, MIN_SEGMENT_SECONDS};

use crate::error::ConfigError;
use crate::APP_DIR_NAME;

const CONFIG_FILE_NAME: &str = "config.json";

/// Directory replays go to when none is configured.
pub fn default_output_dir() -> PathBuf {
    dirs::video_dir()
        .or_else(dirs::home_dir)
        .map(|dir| dir.join("InstantReplay"))
        .unwrap_or_else(|| std::env::temp_dir().join("InstantReplay"))
}

/// Per-user location of the config file.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR_NAME)
        .join(CONFIG_FILE_NAME)
}

/// Check a configuration before it is accepted.
pub fn validate(config: &RecorderConfig) -> Result<(), ConfigError> {
    if !(1..=240).contains(&config.frame_rate) {
        return Err(ConfigError::invalid("frame_rate", "must be between 1 and 240"));
    }
    if !(5..=600).contains(&config.window_seconds) {
        return Err(ConfigError::invalid(
            "window_seconds",
            "must be between 5 and 600",
        ));
    }
    if config.segment_seconds < MIN_SEGMENT_SECONDS {
        return Err(ConfigError::invalid("segment_seconds", "must be at least 2"));
    }
    if !(1..=MAX_VIDEO_BITRATE_KBPS).contains(&config.video_bitrate_kbps) {
        return Err(ConfigError::invalid(
            "video_bitrate_kbps",
            "must be between 1 and 500000",
        ));
    }
    if config.video_codec.trim().is_empty() {
        return Err(ConfigError::invalid("video_codec", "must not be empty"));
    }
    if config.hotkey.trim().is_empty() {
        return Err(ConfigError::invalid("hotkey", "must not be empty"));
    }
    if config.pipeline_program.trim().is_empty() {
        return Err(ConfigError::invalid("pipeline_program", "must not be empty"));
    }
    Ok(())
}

/// Configuration with its backing file.
#[derive(Debug)]
pub struct ConfigStore {
    path: Option<PathBuf>,
    config: RwLock<RecorderConfig>,
}

impl ConfigStore {
    /// Open the per-user config file.
    pub fn open_default() -> Self {
        Self::open(default_config_path())
    }

    /// Open `path`. A missing or unreadable file yields defaults.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let config = match load(&path) {
            Ok(Some(config)) => {
                info!(path = %path.display(), "Loaded config");
                config
            }
            Ok(None) => {
                info!(path = %path.display(), "No config file, using defaults");
                RecorderConfig::default()
            }
            Err(e) => {
                warn!("{}; using defaults", e);
                RecorderConfig::default()
            }
        };

        Self {
            path: Some(path),
            config: RwLock::new(config),
        }
    }

    /// A store that never touches the filesystem.
    pub fn in_memory(config: RecorderConfig) -> Self {
        Self {
            path: None,
            config: RwLock::new(config),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Current configuration.
    pub fn get(&self) -> RecorderConfig {
        self.config.read().clone()
    }

    /// Validate, persist, and apply `config`. Returns the previous value.
    ///
    /// On error neither the in-memory value nor the file changes.
    pub fn update(&self, config: RecorderConfig) -> Result<RecorderConfig, ConfigError> {
        validate(&config)?;

        let mut current = self.config.write();
        if let Some(path) = &self.path {
            save(path, &config)?;
        }
        Ok(std::mem::replace(&mut *current, config))
    }

    /// Record whether recording was active, for resume on next launch.
    pub fn set_was_recording(&self, was_recording: bool) {
        let mut current = self.config.write();
        if current.was_recording == was_recording {
            return;
        }
        current.was_recording = was_recording;
        if let Some(path) = &self.path {
            if let Err(e) = save(path, &current) {
                warn!("Failed to persist recording flag: {}", e);
            }
        }
    }

    /// Whether recording should begin at launch.
    pub fn should_start_on_launch(&self) -> bool {
        let config = self.config.read();
        config.auto_start || (config.resume_recording && config.was_recording)
    }

    /// Effective output directory.
    pub fn output_dir(&self) -> PathBuf {
        self.config
            .read()
            .output_dir
            .clone()
            .unwrap_or_else(default_output_dir)
    }
}

fn load(path: &Path) -> Result<Option<RecorderConfig>, ConfigError> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    serde_json::from_str(&content)
        .map(Some)
        .map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
}

fn save(path: &Path, config: &RecorderConfig) -> Result<(), ConfigError> {
    let io_err = |source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_err)?;
    }
    let content = serde_json::to_string_pretty(config)?;

    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, content).map_err(io_err)?;
    fs::rename(&tmp, path).map_err(io_err)?;

    debug!(path = %path.display(), "Saved config");
    Ok(())
}
