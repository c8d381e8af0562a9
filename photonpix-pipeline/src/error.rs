//! Error types for photonpix-pipeline.

use thiserror::Error;

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Errors reported by [`Pipeline`](crate::Pipeline).
#[derive(Error, Debug)]
pub enum PipelineError {
    /// The pipeline has already been stopped.
    #[error("pipeline is not running")]
    NotRunning,

    /// The operation needs a stopped pipeline.
    #[error("pipeline is running, stop it first")]
    Running,

    /// Worker index out of range.
    #[error("worker index {index} out of range for {n_workers} workers")]
    WorkerIndex {
        /// Requested index.
        index: usize,
        /// Number of workers.
        n_workers: usize,
    },

    /// A worker thread panicked; its detector state was lost.
    #[error("worker {index} panicked")]
    WorkerPanicked {
        /// Index of the dead worker.
        index: usize,
    },

    /// The collector thread panicked.
    #[error("collector thread panicked")]
    CollectorPanicked,

    /// The frame number is reserved.
    #[error("frame number {0} is reserved")]
    InvalidFrameNumber(u64),

    /// A thread could not be spawned.
    #[error("failed to spawn thread: {0}")]
    Spawn(#[from] std::io::Error),

    /// Error from the core types.
    #[error(transparent)]
    Core(#[from] photonpix_core::Error),
}
