//! Error types for photonpix-core.

use thiserror::Error;

/// Result type alias for photonpix operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for photonpix operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// Frame shape does not match the pedestal/detector shape.
    #[error("frame shape {actual:?} does not match expected shape {expected:?}")]
    ShapeMismatch {
        expected: (usize, usize),
        actual: (usize, usize),
    },

    /// Configuration error.
    #[error("configuration error: {0}")]
    InvalidConfig(String),

    /// A raw record has the wrong number of bytes or values.
    #[error("record size mismatch: expected {expected}, got {actual}")]
    RecordSize { expected: usize, actual: usize },

    /// Two cluster containers with different geometries were combined.
    #[error("cluster geometry mismatch: {left:?} vs {right:?}")]
    GeometryMismatch {
        left: (usize, usize),
        right: (usize, usize),
    },
}
