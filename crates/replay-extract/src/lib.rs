//! Replay extraction.
//!
//! Turns a snapshot of the rolling buffer into a standalone MP4 holding the
//! trailing window. Extraction is single-flight: the [`ExtractionLock`] is
//! taken before any work starts and released by its guard on every path.

mod error;
mod extractor;
mod lock;
mod remux;
mod scratch;

pub use error::ExtractError;
pub use extractor::{output_file_name, ExtractRequest, ExtractSource, ReplayExtractor};
pub use lock::{ExtractionGuard, ExtractionLock};
pub use remux::{FfmpegRemuxer, Remuxer};

/// Result type for extraction operations.
pub type ExtractResult<T> = Result<T, ExtractError>;

/// Extension of the final artifact.
pub const ARTIFACT_EXTENSION: &str = "mp4";

/// Prefix of the final artifact's file name.
pub const ARTIFACT_PREFIX: &str = "Replay_";
