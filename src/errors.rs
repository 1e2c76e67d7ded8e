//! Errors raised while building or querying the estimator.

use thiserror::Error;

/// Enum for errors in this crate
#[derive(Error, Debug)]
pub enum MBarError {
    /// Error returned when a builder's build() was called improperly
    #[error("Could not build: {0}")]
    BuilderError(String),

    /// Error returned when an array is the wrong length
    #[error("Array of length {0} is incorrect; length should be {1}")]
    ArrayLengthMismatch(usize, usize),

    /// Error returned when a 2D array has the wrong shape
    #[error("Array of shape {0:?} is incorrect; shape should be {1:?}")]
    ArrayShapeMismatch((usize, usize), (usize, usize)),

    /// Error returned when an index does not refer to an existing state, bin or observable
    #[error("Index {index} is out of bounds for {what} of length {len}")]
    IndexOutOfBounds {
        #[allow(missing_docs)]
        what: &'static str,
        #[allow(missing_docs)]
        index: usize,
        #[allow(missing_docs)]
        len: usize,
    },

    /// Error returned when a PMF bin has no samples, so its free energy would be infinite
    #[error("Bin {0} has no samples; all bins must be occupied for free energies to be finite")]
    EmptyBin(usize),

    /// Error returned when a parameter is outside its domain
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Error returned when a matrix decomposition or linear solve fails
    #[error("Linear algebra failure: {0}")]
    LinearAlgebra(String),

    /// Error returned when an analytical observable name is not recognised
    #[error("Unknown observable '{0}'")]
    UnknownObservable(String),

    /// Error returned when the MBAR equations were not solved within the iteration limit
    #[error("MBAR did not converge after {iterations} iterations (relative change {relative_change:e})")]
    NotConverged {
        #[allow(missing_docs)]
        iterations: usize,
        #[allow(missing_docs)]
        relative_change: f64,
    },

    /// Error returned when weights do not satisfy the MBAR normalization conditions
    #[error("Weight matrix is not normalized: {0}")]
    NotNormalized(String),
}

impl From<String> for MBarError {
    fn from(s: String) -> Self {
        Self::BuilderError(s)
    }
}

/// Result type for the mbar-rs crate
pub type Result<T> = std::result::Result<T, MBarError>;
