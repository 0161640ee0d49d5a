//! Recorder controller for the instant replay buffer.
//!
//! This crate ties the pipeline supervisor, rolling buffer, audio relay and
//! extractor together behind one [`Recorder`], which owns all mutable state
//! and publishes state changes and notifications to the host.

mod config;
mod error;
mod events;
mod orchestrator;
mod session;

pub use config::{default_config_path, default_output_dir, validate, ConfigStore};
pub use error::{ConfigError, EngineError};
pub use orchestrator::{Recorder, RecorderOptions, RESTART_SETTLE};
pub use session::ScratchPaths;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Directory name used under the per-user config and cache directories.
pub const APP_DIR_NAME: &str = "instant-replay";

/// Create a recorder backed by the per-user config file.
pub fn create_recorder() -> EngineResult<Recorder> {
    Recorder::new(ConfigStore::open_default())
}
