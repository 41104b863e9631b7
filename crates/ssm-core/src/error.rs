//! Error types for state-space estimation

use std::fmt;

use thiserror::Error;

/// Stage of the estimation pipeline in which a numerical failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Forward Kalman recursion (innovation covariance inversion).
    Filter,
    /// Backward RTS recursion (predicted covariance inversion).
    Smoother,
    /// EM maximisation step (normal equations, covariance re-estimation).
    MStep,
    /// Drawing noise from a covariance matrix.
    Simulation,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Filter => "filter",
            Stage::Smoother => "smoother",
            Stage::MStep => "M-step",
            Stage::Simulation => "simulation",
        };
        f.write_str(s)
    }
}

/// Diagnostic payload of a numerical failure.
///
/// `t` is the time index of the recursion (0 is the initial state). For M-step
/// failures `t` is 0 and `detail` names the matrix being updated.
#[derive(Debug, Clone, PartialEq)]
pub struct NumericalFailure {
    /// Pipeline stage.
    pub stage: Stage,
    /// Time step at which the failure was detected.
    pub t: usize,
    /// EM iteration, when the failure happened inside an EM run.
    pub iteration: Option<usize>,
    /// Condition number of the offending matrix (`inf` when it is singular/indefinite).
    pub condition_number: f64,
    /// Human-readable context.
    pub detail: String,
}

impl NumericalFailure {
    /// Create a failure without EM iteration context.
    pub fn new(stage: Stage, t: usize, condition_number: f64, detail: impl Into<String>) -> Self {
        Self { stage, t, iteration: None, condition_number, detail: detail.into() }
    }
}

impl fmt::Display for NumericalFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed at t={}", self.stage, self.t)?;
        if let Some(it) = self.iteration {
            write!(f, " (EM iteration {it})")?;
        }
        write!(f, ": {} (condition number {:e})", self.detail, self.condition_number)
    }
}

/// State-space error type
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Inconsistent or malformed model specification
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Invalid call arguments (observation series, options)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Singular or ill-conditioned matrix inside a recursion
    #[error("Numerical error: {0}")]
    Numerical(NumericalFailure),
}

impl Error {
    /// Attach an EM iteration index to a numerical failure; other variants pass through.
    pub fn at_iteration(self, iteration: usize) -> Self {
        match self {
            Error::Numerical(mut nf) => {
                nf.iteration = Some(iteration);
                Error::Numerical(nf)
            }
            other => other,
        }
    }

    /// The numerical failure payload, if this is a numerical error.
    pub fn numerical(&self) -> Option<&NumericalFailure> {
        match self {
            Error::Numerical(nf) => Some(nf),
            _ => None,
        }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
