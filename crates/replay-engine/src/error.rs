//! Error types for the engine.

use std::path::PathBuf;
use thiserror::Error;

use replay_buffer::BufferError;
use replay_pipeline::PipelineError;

/// Errors from loading, validating or saving the configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A field failed validation. Nothing was changed.
    #[error("Invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    /// Reading or writing the file failed.
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid JSON for the config record.
    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Serialization failed.
    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Errors that can occur while starting a recording session.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Configuration error.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The encoder could not be started.
    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    /// The buffer could not be prepared.
    #[error("Buffer error: {0}")]
    Buffer(#[from] BufferError),

    /// A worker thread could not be started.
    #[error("Failed to start thread: {0}")]
    Thread(#[source] std::io::Error),
}
