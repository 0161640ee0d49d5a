//! Encoder process planning and supervision.
//!
//! The [`planner`] turns a configuration into an ffmpeg invocation without
//! touching the system; the [`process`] module spawns that invocation, keeps
//! every output channel drained, and tears it down gracefully or by force.

mod codec;
mod error;
mod monitor;
mod planner;
mod process;

pub use codec::CodecFamily;
pub use error::PipelineError;
pub use monitor::ProgressLine;
pub use planner::{
    plan, AudioPlan, CaptureBackend, Invocation, OutputSink, MAX_VIDEO_BITRATE_KBPS,
    MIN_SEGMENT_SECONDS, SEGMENT_PREFIX,
};
pub use process::{
    InputClosed, OutputRoute, PipelineExit, PipelineInput, PipelineProcess, PipelineSupervisor,
};

use std::time::Duration;

/// Result type for pipeline operations.
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Sample rate of the secondary audio channel fed through stdin.
pub const SIDE_CHANNEL_SAMPLE_RATE: u32 = 48000;

/// Channel count of the secondary audio channel.
pub const SIDE_CHANNEL_CHANNELS: u16 = 2;

/// Bytes per interleaved f32 frame on the secondary audio channel.
pub const SIDE_CHANNEL_FRAME_BYTES: usize = SIDE_CHANNEL_CHANNELS as usize * 4;

/// Silence written to the secondary audio channel right after spawn.
pub const SILENCE_PRIME: Duration = Duration::from_millis(200);

/// How long a stopping pipeline may take before it is killed.
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(3);

/// Read size for the stdout drain.
pub const STDOUT_READ_SIZE: usize = 64 * 1024;

/// Capacity of the stdin write queue, in sample batches.
pub const INPUT_QUEUE_CAPACITY: usize = 64;

/// Number of stderr lines kept for crash reports.
pub const STDERR_TAIL_LINES: usize = 8;
