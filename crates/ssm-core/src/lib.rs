//! # ssm-core
//!
//! Shared building blocks for the state-space estimation crates:
//! the error taxonomy, the validated observation series type and the
//! parameter/likelihood traits.

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Error taxonomy (`Configuration`, `Numerical`, `Validation`).
pub mod error;
/// Parameter and log-likelihood traits.
pub mod traits;
/// Observation series.
pub mod types;

pub use error::{Error, NumericalFailure, Result, Stage};
pub use traits::{LogLikelihood, Parameterized};
pub use types::Observations;
