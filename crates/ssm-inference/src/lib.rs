//! # ssm-inference
//!
//! Estimation for linear-Gaussian state-space models:
//!
//! - `x_t = B x_{t-1} + w_t`, `w_t ~ N(0, Q)`
//! - `y_t = Z_t x_t + v_t`, `v_t ~ N(0, R)`
//! - `x_0 ~ N(x0, V0)`
//!
//! This crate provides:
//! - Model specification with fixed, free, shared and linear matrix entries
//! - Kalman filter with missing observations (Joseph-form update)
//! - Rauch-Tung-Striebel smoother with lag-one covariances
//! - Constrained EM estimation
//! - Diagnostics, forecasting, simulation and common model builders
//!
//! Time index 0 is the initial state; per-step outputs have length `T + 1`.

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Residuals, information criteria, standard errors and factor rotation.
pub mod diagnostics;
/// Expectation-maximization driver.
pub mod em;
/// h-step-ahead forecasts.
pub mod forecast;
/// Kalman filter and log-likelihood.
pub mod kalman;
/// Dense linear algebra helpers.
pub mod linalg;
/// Builders for common model structures.
pub mod models;
mod moments;
mod mstep;
/// Parallel EM runs over candidate specifications.
pub mod multistart;
/// Simulation from a specification.
pub mod simulate;
/// RTS smoother.
pub mod smoother;
/// Model declarations and compiled specifications.
pub mod spec;

pub use diagnostics::{Diagnostics, DiagnosticsConfig, ParameterEstimate, assemble, assemble_em};
pub use em::{EmConfig, EmResult, EmStatus, TracePoint, fit_em};
pub use forecast::{Forecast, ForecastIntervals, forecast};
pub use kalman::{FilterOutput, NumericalOptions, kalman_filter, log_likelihood};
pub use multistart::{Candidate, CandidateFit, best_by_aicc, fit_candidates};
pub use simulate::{Simulation, simulate};
pub use smoother::{SmootherOutput, rts_smoother};
pub use spec::{
    Entry, MatrixDecl, MatrixKind, ModelDeclaration, ModelSpec, ObservationMatrixDecl, Parameter,
};

pub use ssm_core::{Error, Observations, Result};
