//! Estimation errors.
//!
//! All fallible operations of the crate return [`EstimateError`].
//! Construction and registry errors are programming or configuration errors and are fatal.
//! Sensitivity failures are recoverable: the previous arrival weight is kept.

use std::fmt;

use crate::solver::SolveStatus;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, EstimateError>;

#[derive(Debug, Clone, PartialEq)]
pub enum EstimateError {
    // ---- Window construction ----
    /// The process model does not provide what the estimator was asked to use.
    ModelConstructionError { reason: String },

    // ---- Registry ----
    /// A key was registered twice in the same build pass.
    DuplicateKey { key: String },
    /// A key was never registered.
    UnknownKey { key: String },

    // ---- Solvers ----
    /// The NLP did not reach an optimal point, even after the relaxed retry.
    SolverFailure { status: SolveStatus, retried: bool },
    /// The reduced Hessian could not be computed.
    SensitivitySolverFailure { reason: String },

    // ---- Weights ----
    /// A covariance matrix could not be inverted into a weight.
    SingularCovariance { what: &'static str },
    /// A zero variance was supplied for a channel that must have finite variance.
    ZeroVarianceConfig { channel: String },

    // ---- Usage ----
    /// The requested estimator phase change is not allowed.
    InvalidPhaseTransition { from: &'static str, to: &'static str },
    /// A vector or matrix argument has the wrong size.
    DimensionMismatch {
        what: &'static str,
        expected: usize,
        found: usize,
    },
    /// Stage index outside of the horizon.
    StageOutOfRange { stage: usize, stages: usize },

    // ---- Ambient ----
    /// Configuration could not be read or parsed.
    Config { reason: String },
    /// Journal file could not be opened or written.
    Journal { reason: String },
}

impl EstimateError {
    /// Whether estimation may continue after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, EstimateError::SensitivitySolverFailure { .. })
    }
}

impl fmt::Display for EstimateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EstimateError::ModelConstructionError { reason } => {
                write!(f, "model construction failed: {}", reason)
            }
            EstimateError::DuplicateKey { key } => write!(f, "duplicate key {}", key),
            EstimateError::UnknownKey { key } => write!(f, "unknown key {}", key),
            EstimateError::SolverFailure { status, retried } => {
                if *retried {
                    write!(f, "solver failed with {:?} after retry", status)
                } else {
                    write!(f, "solver failed with {:?}", status)
                }
            }
            EstimateError::SensitivitySolverFailure { reason } => {
                write!(f, "reduced hessian computation failed: {}", reason)
            }
            EstimateError::SingularCovariance { what } => write!(f, "{} covariance is singular", what),
            EstimateError::ZeroVarianceConfig { channel } => {
                write!(f, "zero variance configured for channel {}", channel)
            }
            EstimateError::InvalidPhaseTransition { from, to } => {
                write!(f, "invalid phase transition {} -> {}", from, to)
            }
            EstimateError::DimensionMismatch { what, expected, found } => {
                write!(f, "{}: expected dimension {}, found {}", what, expected, found)
            }
            EstimateError::StageOutOfRange { stage, stages } => {
                write!(f, "stage {} outside of horizon with {} stages", stage, stages)
            }
            EstimateError::Config { reason } => write!(f, "configuration error: {}", reason),
            EstimateError::Journal { reason } => write!(f, "journal error: {}", reason),
        }
    }
}

impl std::error::Error for EstimateError {}

impl From<toml::de::Error> for EstimateError {
    fn from(err: toml::de::Error) -> Self {
        EstimateError::Config {
            reason: err.to_string(),
        }
    }
}

/// Checks a vector argument has the expected size.
pub(crate) fn check_len(what: &'static str, expected: usize, found: usize) -> Result<()> {
    if expected == found {
        Ok(())
    } else {
        Err(EstimateError::DimensionMismatch { what, expected, found })
    }
}
