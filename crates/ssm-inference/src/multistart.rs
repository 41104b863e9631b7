//! Independent EM runs over several candidate specifications.
//!
//! Runs share nothing mutable and execute in parallel with Rayon; the caller
//! compares the outcomes (for example by AICc).

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};
use rayon::prelude::*;
use ssm_core::{Error, Observations, Result};

use crate::diagnostics::information_criteria;
use crate::em::{EmConfig, EmResult, EmStatus, fit_em};
use crate::spec::ModelSpec;

/// A labelled candidate specification.
#[derive(Debug, Clone)]
pub struct Candidate {
    /// Caller-chosen label.
    pub label: String,
    /// Specification holding the starting values.
    pub spec: ModelSpec,
}

impl Candidate {
    /// New candidate.
    pub fn new(label: impl Into<String>, spec: ModelSpec) -> Self {
        Self { label: label.into(), spec }
    }
}

/// Outcome of one candidate run.
#[derive(Debug)]
pub struct CandidateFit {
    /// Candidate label.
    pub label: String,
    /// EM result or the error that aborted the run.
    pub result: Result<EmResult>,
}

impl CandidateFit {
    /// AICc of a successful run.
    pub fn aicc(&self, n_observations: usize) -> Option<f64> {
        let res = self.result.as_ref().ok()?;
        Some(information_criteria(res.log_likelihood(), res.spec.n_parameters(), n_observations).1)
    }
}

/// Fit every candidate in parallel. The output order matches the input.
pub fn fit_candidates(candidates: &[Candidate], ys: &Observations, cfg: &EmConfig) -> Vec<CandidateFit> {
    candidates
        .par_iter()
        .map(|c| {
            let result = fit_em(&c.spec, ys, cfg);
            if let Err(e) = &result {
                log::warn!("candidate '{}' failed: {e}", c.label);
            }
            CandidateFit { label: c.label.clone(), result }
        })
        .collect()
}

/// The successful, non-diverged fit with the smallest AICc.
pub fn best_by_aicc<'a>(fits: &'a [CandidateFit], ys: &Observations) -> Option<&'a CandidateFit> {
    let n = ys.n_observed();
    fits.iter()
        .filter(|f| f.result.as_ref().is_ok_and(|r| r.status != EmStatus::Diverged))
        .filter_map(|f| f.aicc(n).map(|a| (f, a)))
        .filter(|(_, a)| a.is_finite())
        .min_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(f, _)| f)
}

/// `n` copies of `spec` with jittered starting values.
///
/// Each free value `p` becomes `p + scale * max(1, |p|) * N(0, 1)`; draws that make
/// a covariance indefinite are redrawn (at most 100 times per start).
pub fn jittered_starts(spec: &ModelSpec, n: usize, scale: f64, seed: u64) -> Result<Vec<ModelSpec>> {
    if !scale.is_finite() || scale < 0.0 {
        return Err(Error::Validation("scale must be finite and >= 0".to_string()));
    }
    let normal = Normal::new(0.0, 1.0).map_err(|e| Error::Validation(format!("normal: {e}")))?;
    let mut rng = StdRng::seed_from_u64(seed);
    let base = spec.parameter_values();
    let mut out = Vec::with_capacity(n);
    for i in 0..n {
        let mut accepted = None;
        for _ in 0..100 {
            let values: Vec<f64> = base
                .iter()
                .map(|&p| p + scale * p.abs().max(1.0) * normal.sample(&mut rng))
                .collect();
            let mut s = spec.clone();
            if s.set_parameter_values(&values).is_ok() {
                accepted = Some(s);
                break;
            }
        }
        match accepted {
            Some(s) => out.push(s),
            None => {
                return Err(Error::Validation(format!(
                    "could not draw a valid start {i} with scale {scale}"
                )));
            }
        }
    }
    Ok(out)
}
