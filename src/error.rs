//! Error types for nested-tape.

use thiserror::Error;

/// Errors reported by the parallel map and its containers.
///
/// Misuse the tape itself cannot recover from (no active tape, a stale handle,
/// sessions closed out of order) panics instead.
#[derive(Debug, Error)]
pub enum Error {
    /// A grain size of zero cannot partition anything.
    #[error("grain size must be at least 1")]
    ZeroGrainSize,

    /// An index touched a different number of tracked variables than index 0.
    #[error("index {index} touched {found} tracked variables, expected {expected} as at index 0")]
    WidthMismatch {
        index: usize,
        expected: usize,
        found: usize,
    },

    /// A buffer length does not match the expected element count.
    #[error("length mismatch: expected {expected} elements, got {found}")]
    LengthMismatch { expected: usize, found: usize },

    /// A block result or matrix has the wrong `(rows, cols)` shape.
    #[error("shape mismatch: expected {}x{}, got {}x{}", expected.0, expected.1, found.0, found.1)]
    ShapeMismatch {
        expected: (usize, usize),
        found: (usize, usize),
    },

    /// `NESTED_TAPE_NUM_THREADS` is not a positive integer.
    #[error("invalid thread count {0:?}: expected a positive integer")]
    InvalidThreadCount(String),

    #[error("failed to build thread pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

pub type Result<T> = std::result::Result<T, Error>;
