//! Core traits for state-space estimation
//!
//! Inference utilities that only need "a log-likelihood over a named parameter
//! vector" (observed-information standard errors, profile scans) are written
//! against these traits instead of a concrete model type.

use crate::Result;

/// A model with a flat vector of free parameters.
pub trait Parameterized {
    /// Number of free parameters
    fn n_parameters(&self) -> usize;

    /// Parameter names, in vector order
    fn parameter_names(&self) -> Vec<String>;

    /// Current parameter values, in vector order
    fn parameter_values(&self) -> Vec<f64>;
}

/// Log-likelihood of fixed data as a function of the free parameters.
pub trait LogLikelihood: Parameterized {
    /// Evaluate `log L(params)`.
    fn log_likelihood(&self, params: &[f64]) -> Result<f64>;

    /// Magnitude used to size finite-difference steps around `at`.
    ///
    /// Defaults to `max(1, |p|)`. Models with positive parameters near zero
    /// (variances) should return `|p|` for those so a step never crosses zero.
    fn step_scales(&self, at: &[f64]) -> Vec<f64> {
        at.iter().map(|v| v.abs().max(1.0)).collect()
    }
}
