use thiserror::Error;

/// Per-event failures of the estimator.
///
/// None of these are fatal: the event that raised one is dropped and the
/// stored belief stays as it was.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EstimatorError {
    #[error("State covariance is not positive semidefinite")]
    StateDegenerate,

    #[error("Innovation covariance is singular")]
    ObservationDegenerate,

    #[error("Belief store lock not acquired within {0} ms")]
    Timeout(u64),

    #[error("Non-finite value in {0}")]
    NumericNonFinite(&'static str),

    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),
}

impl EstimatorError {
    /// Short stable label, used for per-kind drop counters.
    pub fn kind(&self) -> &'static str {
        match self {
            EstimatorError::StateDegenerate => "state_degenerate",
            EstimatorError::ObservationDegenerate => "observation_degenerate",
            EstimatorError::Timeout(_) => "timeout",
            EstimatorError::NumericNonFinite(_) => "numeric_non_finite",
            EstimatorError::DimensionMismatch(_) => "dimension_mismatch",
        }
    }
}

/// Result type for estimator operations
pub type EstimatorResult<T> = Result<T, EstimatorError>;
