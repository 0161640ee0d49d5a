//! Error types for the extraction module.

use std::path::PathBuf;
use thiserror::Error;

use replay_ipc::ReplayFailure;

/// Reasons an extraction produced no artifact.
#[derive(Debug, Error)]
pub enum ExtractError {
    /// No pipeline is running.
    #[error("Not recording")]
    NotRecording,

    /// The buffer holds too little data to extract from.
    #[error("Insufficient buffer: {bytes} bytes buffered, {required} required")]
    InsufficientBuffer { bytes: u64, required: u64 },

    /// A remux step failed to run or exited nonzero.
    #[error("{step} failed (exit code {code:?}): {detail}")]
    ProcessFailed {
        step: &'static str,
        code: Option<i32>,
        detail: String,
    },

    /// The artifact is smaller than the sanity threshold.
    #[error("Output {path} is too small: {bytes} bytes, {required} required")]
    CorruptOutput {
        path: PathBuf,
        bytes: u64,
        required: u64,
    },

    /// Filesystem operation failed.
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ExtractError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Category reported to the user.
    pub fn failure(&self) -> ReplayFailure {
        match self {
            Self::NotRecording => ReplayFailure::NotRecording,
            Self::InsufficientBuffer { .. } => ReplayFailure::InsufficientBuffer,
            Self::ProcessFailed { .. } => ReplayFailure::PipelineFailed,
            Self::CorruptOutput { .. } => ReplayFailure::CorruptOutput,
            Self::Io { .. } => ReplayFailure::Internal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_categories_are_distinct() {
        let errors = [
            ExtractError::NotRecording,
            ExtractError::InsufficientBuffer { bytes: 0, required: 1 },
            ExtractError::ProcessFailed {
                step: "trim",
                code: Some(1),
                detail: String::new(),
            },
            ExtractError::CorruptOutput {
                path: PathBuf::from("out.mp4"),
                bytes: 0,
                required: 1,
            },
        ];

        let failures: Vec<_> = errors.iter().map(ExtractError::failure).collect();
        for (i, a) in failures.iter().enumerate() {
            for b in &failures[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }
}
