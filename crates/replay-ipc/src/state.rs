//! Pipeline state machine types.

use serde::{Deserialize, Serialize};

/// The current state of the capture pipeline.
///
/// Transitions follow `Idle → Starting → Active → Stopping → Idle`; a failed
/// start goes straight from `Starting` back to `Idle`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PipelineState {
    /// No pipeline process exists.
    #[default]
    Idle,

    /// The pipeline is being spawned.
    Starting,

    /// The pipeline is running and feeding the buffer.
    Active {
        /// Operating system process id.
        pid: u32,

        /// Wall-clock start time in Unix milliseconds.
        started_at_ms: i64,

        /// Whether the secondary audio channel is fed through the relay.
        audio_enabled: bool,
    },

    /// The pipeline has been asked to exit.
    Stopping {
        /// Reason for stopping.
        reason: StopReason,
    },
}

impl PipelineState {
    /// Returns true if no pipeline exists.
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    /// Returns true while the pipeline is being spawned.
    pub fn is_starting(&self) -> bool {
        matches!(self, Self::Starting)
    }

    /// Returns true if the pipeline is recording.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active { .. })
    }

    /// Returns true while the pipeline is shutting down.
    pub fn is_stopping(&self) -> bool {
        matches!(self, Self::Stopping { .. })
    }

    /// Whether the secondary audio channel is live.
    pub fn audio_enabled(&self) -> bool {
        matches!(
            self,
            Self::Active {
                audio_enabled: true,
                ..
            }
        )
    }

    /// Returns a simple string representation of the state.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Starting => "Starting",
            Self::Active { .. } => "Active",
            Self::Stopping { .. } => "Stopping",
        }
    }
}

/// Reason for stopping the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    /// User requested stop.
    UserRequested,

    /// Audio device configuration changed; a restart follows.
    ConfigChanged,

    /// The process exited on its own.
    PipelineExited { code: Option<i32> },

    /// The host is shutting down.
    Shutdown,
}

impl StopReason {
    /// Returns a display message for this reason.
    pub fn message(&self) -> String {
        match self {
            Self::UserRequested => "Recording stopped by user".to_string(),
            Self::ConfigChanged => "Restarting after configuration change".to_string(),
            Self::PipelineExited { code: Some(code) } => {
                format!("Encoder exited with status {code}")
            }
            Self::PipelineExited { code: None } => "Encoder was terminated".to_string(),
            Self::Shutdown => "Recorder shutting down".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_active_is_recording() {
        assert!(!PipelineState::Idle.is_active());
        assert!(!PipelineState::Starting.is_active());
        assert!(!PipelineState::Stopping {
            reason: StopReason::UserRequested
        }
        .is_active());

        let active = PipelineState::Active {
            pid: 42,
            started_at_ms: 0,
            audio_enabled: true,
        };
        assert!(active.is_active());
        assert!(active.audio_enabled());
        assert_eq!(active.name(), "Active");
    }

    #[test]
    fn test_exit_reason_message() {
        let reason = StopReason::PipelineExited { code: Some(1) };
        assert_eq!(reason.message(), "Encoder exited with status 1");
    }
}
