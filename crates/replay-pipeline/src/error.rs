//! Error types for the pipeline module.

use thiserror::Error;

/// Errors that can occur while planning or supervising the pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The process could not be spawned.
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The process was spawned without a piped stdio handle.
    #[error("Pipeline {0} was not captured")]
    MissingStdio(&'static str),

    /// The supervising runtime could not be created.
    #[error("Supervisor runtime error: {0}")]
    Runtime(#[source] std::io::Error),

    /// The supervisor has already been shut down.
    #[error("Supervisor is shut down")]
    ShutDown,
}
