//! I/O error types.

use thiserror::Error;

/// Result type for I/O operations.
pub type Result<T> = std::result::Result<T, Error>;

/// I/O error types.
#[derive(Error, Debug)]
pub enum Error {
    /// File I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid file format.
    #[error("invalid file format: {0}")]
    InvalidFormat(String),

    /// Core library error.
    #[error("core error: {0}")]
    CoreError(#[from] photonpix_core::Error),

    /// Pipeline error.
    #[error("pipeline error: {0}")]
    PipelineError(#[from] photonpix_pipeline::PipelineError),

    /// A sink thread panicked.
    #[error("sink thread panicked")]
    SinkPanicked,
}
