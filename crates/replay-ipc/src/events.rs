//! Events sent from the recorder to the host.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::state::PipelineState;
use crate::types::AudioDevice;

/// Events that the recorder can send to the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RecorderEvent {
    /// Pipeline state has changed.
    StateChanged {
        /// Previous state.
        previous: Box<PipelineState>,

        /// Current state.
        current: Box<PipelineState>,
    },

    /// The recording flag flipped.
    RecordingChanged(bool),

    /// User-visible notification.
    Notification(Notification),

    /// List of known audio devices.
    AudioDevices(Vec<AudioDevice>),

    /// Recorder is ready to accept commands.
    Ready,

    /// Recorder has shut down.
    Shutdown,
}

/// Notification surfaced to the user after an extraction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Notification {
    /// A replay was written.
    ReplaySaved {
        /// Path of the saved file.
        path: PathBuf,

        /// Folder to open for the "show in folder" action.
        folder: PathBuf,
    },

    /// A replay could not be produced.
    ReplayFailed {
        /// Failure category.
        reason: ReplayFailure,

        /// Human readable detail.
        message: String,
    },
}

impl Notification {
    /// Title line for a desktop notification.
    pub fn title(&self) -> &'static str {
        match self {
            Self::ReplaySaved { .. } => "Replay saved",
            Self::ReplayFailed { reason, .. } => reason.title(),
        }
    }

    /// Returns true for the success notification.
    pub fn is_saved(&self) -> bool {
        matches!(self, Self::ReplaySaved { .. })
    }
}

/// Why an extraction produced no file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplayFailure {
    /// The pipeline is not running.
    NotRecording,

    /// Not enough buffered data yet.
    InsufficientBuffer,

    /// The remux process exited unsuccessfully.
    PipelineFailed,

    /// The output file was missing or undersized.
    CorruptOutput,

    /// Filesystem or other internal failure.
    Internal,
}

impl ReplayFailure {
    /// Returns the notification title for this failure.
    pub fn title(self) -> &'static str {
        match self {
            Self::NotRecording => "Replay unavailable: not recording",
            Self::InsufficientBuffer => "Replay unavailable: buffer still filling",
            Self::PipelineFailed => "Replay failed: encoder error",
            Self::CorruptOutput => "Replay failed: output was corrupt",
            Self::Internal => "Replay failed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_titles_are_distinct() {
        let all = [
            ReplayFailure::NotRecording,
            ReplayFailure::InsufficientBuffer,
            ReplayFailure::PipelineFailed,
            ReplayFailure::CorruptOutput,
            ReplayFailure::Internal,
        ];
        for (i, a) in all.iter().enumerate() {
            for b in &all[i + 1..] {
                assert_ne!(a.title(), b.title());
            }
        }
    }

    #[test]
    fn test_saved_notification_carries_folder() {
        let n = Notification::ReplaySaved {
            path: PathBuf::from("/videos/Replay_1.mp4"),
            folder: PathBuf::from("/videos"),
        };
        assert!(n.is_saved());
        assert_eq!(n.title(), "Replay saved");
    }
}
