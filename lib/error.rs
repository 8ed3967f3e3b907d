//! Crate-wide error type.

use thiserror::Error;

/// All fatal failure modes of setup construction and optimization.
///
/// Recoverable numeric conditions (non-Hermitian generators, near-degenerate
/// eigenvalues, gradient-check mismatches) are handled internally and never
/// surface here.
#[derive(Debug, Error)]
pub enum GrapeError {
    /// Hamiltonians, boundary states, or controls have inconsistent shapes.
    #[error("dimension mismatch: {0}")]
    DimensionMismatch(String),

    /// Response kernel or IQ pairing cannot be applied to the control array.
    #[error("malformed response configuration: {0}")]
    MalformedResponse(String),

    /// Taylor-order calibration exceeded the maximum allowed order without
    /// meeting the requested tolerance.
    #[error("taylor order calibration exceeded maximum order {0}")]
    CalibrationDiverged(usize),

    /// Array reshape failure.
    #[error("shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),

    /// Underlying LAPACK/BLAS failure.
    #[error("linear algebra error: {0}")]
    Linalg(#[from] ndarray_linalg::error::LinalgError),

    /// Worker pool construction failure.
    #[error("thread pool error: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    /// Options file could not be parsed.
    #[error("config error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("npz write error: {0}")]
    Npz(#[from] ndarray_npy::WriteNpzError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, GrapeError>;
