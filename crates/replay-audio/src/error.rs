//! Error types for the audio module.

use thiserror::Error;

/// Errors that can occur during audio operations.
#[derive(Debug, Error)]
pub enum AudioError {
    /// Audio device not found.
    #[error("Audio device not found: {0}")]
    DeviceNotFound(String),
}
