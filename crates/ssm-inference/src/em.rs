//! EM parameter estimation for constrained linear-Gaussian state-space models.
//!
//! Each iteration runs the filter and smoother under the current parameters
//! (E-step), records the log-likelihood, checks the stopping rules and then applies
//! the constrained M-step. The run stops on
//! - convergence: `|ll_i - ll_{i-1}| / (1 + |ll_{i-1}|) <= tol`,
//! - the iteration cap,
//! - divergence: `ll_i < ll_{i-1} - decrease_tol * (1 + |ll_{i-1}|)`. EM never
//!   decreases the likelihood in exact arithmetic, so this is reported rather than
//!   tolerated, and the previous (better) parameters are returned.

use std::path::Path;

use serde::{Deserialize, Serialize};
use ssm_core::{Error, Observations, Result};

use crate::kalman::{FilterOutput, NumericalOptions, check_inputs, kalman_filter};
use crate::moments::sufficient_stats;
use crate::mstep::m_step;
use crate::smoother::{SmootherOutput, rts_smoother};
use crate::spec::ModelSpec;

/// EM configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmConfig {
    /// Maximum number of M-steps.
    pub max_iter: usize,
    /// Relative tolerance on the log-likelihood improvement.
    pub tol: f64,
    /// Relative log-likelihood decrease treated as divergence.
    pub decrease_tol: f64,
    /// Floor for free variance parameters of Q and R.
    pub min_variance: f64,
    /// Inversion tolerances for filter, smoother and M-step.
    pub numerical: NumericalOptions,
}

impl Default for EmConfig {
    fn default() -> Self {
        Self {
            max_iter: 500,
            tol: 1e-8,
            decrease_tol: 1e-8,
            min_variance: 1e-8,
            numerical: NumericalOptions::default(),
        }
    }
}

impl EmConfig {
    /// Read a JSON configuration; absent fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn validate(&self) -> Result<()> {
        if self.max_iter == 0 {
            return Err(Error::Validation("max_iter must be > 0".to_string()));
        }
        if !self.tol.is_finite() || self.tol <= 0.0 {
            return Err(Error::Validation("tol must be finite and > 0".to_string()));
        }
        if !self.decrease_tol.is_finite() || self.decrease_tol < 0.0 {
            return Err(Error::Validation("decrease_tol must be finite and >= 0".to_string()));
        }
        if !self.min_variance.is_finite() || self.min_variance < 0.0 {
            return Err(Error::Validation("min_variance must be finite and >= 0".to_string()));
        }
        if !(self.numerical.max_condition > 1.0) {
            return Err(Error::Validation("max_condition must be > 1".to_string()));
        }
        Ok(())
    }
}

/// How an EM run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmStatus {
    /// Relative improvement fell below `tol`.
    Converged,
    /// `max_iter` M-steps were applied without meeting `tol`.
    HitIterationCap,
    /// The log-likelihood decreased beyond `decrease_tol`.
    Diverged,
}

impl EmStatus {
    /// `true` unless the run converged.
    pub fn is_warning(self) -> bool {
        self != EmStatus::Converged
    }
}

/// One entry of the convergence trace.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TracePoint {
    /// Number of M-steps applied before this evaluation.
    pub iteration: usize,
    /// Log-likelihood at that point.
    pub log_likelihood: f64,
}

/// EM result.
#[derive(Debug, Clone)]
pub struct EmResult {
    /// Final specification (the best one seen when the run diverged).
    pub spec: ModelSpec,
    /// Filter output under `spec`.
    pub filtered: FilterOutput,
    /// Smoother output under `spec`.
    pub smoothed: SmootherOutput,
    /// Log-likelihood per evaluation, iteration 0 being the initial parameters.
    pub trace: Vec<TracePoint>,
    /// Stopping reason.
    pub status: EmStatus,
    /// Number of M-steps applied.
    pub n_iter: usize,
}

impl EmResult {
    /// Log-likelihood of the returned specification.
    pub fn log_likelihood(&self) -> f64 {
        self.filtered.log_likelihood
    }

    /// Whether the run met the tolerance.
    pub fn converged(&self) -> bool {
        self.status == EmStatus::Converged
    }
}

struct EStep {
    spec: ModelSpec,
    filtered: FilterOutput,
    smoothed: SmootherOutput,
}

fn e_step(spec: ModelSpec, ys: &Observations, opts: &NumericalOptions, iter: usize) -> Result<EStep> {
    let filtered = kalman_filter(&spec, ys, opts).map_err(|e| e.at_iteration(iter))?;
    let smoothed = rts_smoother(&spec, &filtered, opts).map_err(|e| e.at_iteration(iter))?;
    Ok(EStep { spec, filtered, smoothed })
}

/// Fit the free parameters of `initial` by EM.
///
/// Configuration and validation errors are returned before any recursion runs.
/// Numerical failures abort the run and carry the iteration at which they happened.
pub fn fit_em(initial: &ModelSpec, ys: &Observations, cfg: &EmConfig) -> Result<EmResult> {
    cfg.validate()?;
    check_inputs(initial, ys)?;
    if ys.n_observed() == 0 {
        return Err(Error::Validation("cannot fit: every observation is missing".to_string()));
    }
    let opts = cfg.numerical;

    let mut trace = Vec::with_capacity(cfg.max_iter + 1);
    let mut prev: Option<EStep> = None;
    let mut cur = e_step(initial.clone(), ys, &opts, 0)?;
    let mut iter = 0usize;

    loop {
        let ll = cur.filtered.log_likelihood;
        trace.push(TracePoint { iteration: iter, log_likelihood: ll });
        log::debug!("EM iteration {iter}: log-likelihood {ll:.8}");

        if let Some(p) = prev.take() {
            let prev_ll = p.filtered.log_likelihood;
            let denom = 1.0 + prev_ll.abs();
            if ll < prev_ll - cfg.decrease_tol * denom {
                log::warn!(
                    "EM diverged at iteration {iter}: log-likelihood fell from {prev_ll:.8} to {ll:.8}; \
                     returning iteration {} estimates",
                    iter - 1
                );
                return Ok(EmResult {
                    spec: p.spec,
                    filtered: p.filtered,
                    smoothed: p.smoothed,
                    trace,
                    status: EmStatus::Diverged,
                    n_iter: iter - 1,
                });
            }
            if (ll - prev_ll).abs() / denom <= cfg.tol {
                log::debug!("EM converged after {iter} iterations");
                return Ok(finish(cur, trace, EmStatus::Converged, iter));
            }
        }

        if iter == cfg.max_iter {
            log::warn!("EM hit the iteration cap ({}) without converging (tol {:e})", cfg.max_iter, cfg.tol);
            return Ok(finish(cur, trace, EmStatus::HitIterationCap, iter));
        }

        let stats = sufficient_stats(&cur.spec, ys, &cur.smoothed);
        let mut next = cur.spec.clone();
        m_step(&mut next, &stats, cfg.min_variance, &opts).map_err(|e| e.at_iteration(iter + 1))?;
        iter += 1;
        prev = Some(cur);
        cur = e_step(next, ys, &opts, iter)?;
    }
}

fn finish(step: EStep, trace: Vec<TracePoint>, status: EmStatus, n_iter: usize) -> EmResult {
    EmResult { spec: step.spec, filtered: step.filtered, smoothed: step.smoothed, trace, status, n_iter }
}
