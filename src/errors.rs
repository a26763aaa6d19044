use thiserror::Error;

/// A result type for GP/TP regression and hyperparameter fitting
pub type Result<T> = std::result::Result<T, GpFitError>;

/// An error when building, fitting or evaluating a process model
#[derive(Error, Debug)]
pub enum GpFitError {
    /// When a required hyperparameter name is absent or out of domain
    #[error("Invalid hyperparameter: {0}")]
    InvalidHyperparameter(String),
    /// When a boundary specifies low > high
    #[error("Invalid bounds for '{name}': low {low} > high {high}")]
    InvalidBounds {
        /// Hyperparameter name the bounds belong to
        name: String,
        /// Lower bound (log space)
        low: f64,
        /// Upper bound (log space)
        high: f64,
    },
    /// When the regularized covariance cannot be factorized
    #[error("Covariance matrix is not positive definite: {0}")]
    NotPositiveDefinite(String),
    /// When feature/target shapes disagree
    #[error("Dimension mismatch for {what}: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// What is mismatched
        what: String,
        /// Expected dimension
        expected: usize,
        /// Actual dimension
        actual: usize,
    },
    /// When error due to a bad configuration value
    #[error("InvalidValue error: {0}")]
    InvalidValueError(String),
    /// When linear algebra computation fails
    #[error(transparent)]
    LinalgError(#[from] linfa_linalg::LinalgError),
}
