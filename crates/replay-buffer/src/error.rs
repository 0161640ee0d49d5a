//! Error types for the buffer module.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while managing buffered output.
#[derive(Debug, Error)]
pub enum BufferError {
    /// Filesystem operation on a buffer path failed.
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Writing a snapshot out failed.
    #[error("Failed to write snapshot: {0}")]
    Write(#[from] std::io::Error),

    /// A buffer worker thread could not be started.
    #[error("Failed to start buffer thread: {0}")]
    Spawn(#[source] std::io::Error),
}

impl BufferError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
