//! Rolling buffers holding the most recent encoder output.
//!
//! Two variants share one [`RetentionPolicy`]: an in-memory chunk queue fed
//! from the encoder's stdout, and a directory of fixed-length segment files
//! written by the encoder itself and pruned by a periodic sweeper.

mod disk;
mod error;
mod memory;
mod retention;

pub use disk::{SegmentFile, SegmentStore, Sweeper};
pub use error::BufferError;
pub use memory::{BufferIngest, Chunk, MemoryBuffer, SharedBuffer, Snapshot};
pub use retention::RetentionPolicy;

use std::time::Duration;

/// Result type for buffer operations.
pub type BufferResult<T> = Result<T, BufferError>;

/// Chunks kept regardless of age or size once any exist.
pub const MIN_RETAINED_CHUNKS: usize = 2;

/// Interval between disk sweeps.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Extension of segment files written by the encoder.
pub const SEGMENT_EXTENSION: &str = "ts";
