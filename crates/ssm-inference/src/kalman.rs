//! Forward Kalman recursion with missing observations.
//!
//! Index convention for every per-time output: index 0 is the initial state
//! (`x_{0|0} = x0`, `V_{0|0} = V0`), index `t` in `1..=T` holds step `t`.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use ssm_core::{Error, NumericalFailure, Observations, Result, Stage};

use crate::linalg::{LN_2PI, checked_cholesky, select, select_entries, select_rows, symmetrize};
use crate::spec::ModelSpec;

/// Tolerances for the matrix inversions inside the recursions.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NumericalOptions {
    /// Largest accepted spectral condition number of an inverted covariance.
    pub max_condition: f64,
}

impl Default for NumericalOptions {
    fn default() -> Self {
        Self { max_condition: 1e12 }
    }
}

/// Kalman filter output.
#[derive(Debug, Clone)]
pub struct FilterOutput {
    /// Total log-likelihood over observed entries.
    pub log_likelihood: f64,
    /// `x_{t|t-1}` (index 0 holds `x0`).
    pub predicted_means: Vec<DVector<f64>>,
    /// `V_{t|t-1}` (index 0 holds `V0`).
    pub predicted_covs: Vec<DMatrix<f64>>,
    /// `x_{t|t}`.
    pub filtered_means: Vec<DVector<f64>>,
    /// `V_{t|t}`.
    pub filtered_covs: Vec<DMatrix<f64>>,
    /// Kalman gain `K_t` over the observed rows (`m x |obs_t|`, empty when nothing is observed).
    pub gains: Vec<DMatrix<f64>>,
    /// Observed row indices per step.
    pub observed: Vec<Vec<usize>>,
    /// Innovations `e_t` over observed rows.
    pub innovations: Vec<DVector<f64>>,
    /// Innovation covariances `S_t` over observed rows.
    pub innovation_covs: Vec<DMatrix<f64>>,
}

impl FilterOutput {
    /// Number of observation steps `T`.
    pub fn n_steps(&self) -> usize {
        self.filtered_means.len() - 1
    }
}

/// Check that the observations fit the specification.
pub(crate) fn check_inputs(spec: &ModelSpec, ys: &Observations) -> Result<()> {
    if ys.n_series() != spec.n_obs() {
        return Err(Error::Validation(format!(
            "observations have {} series, model expects {}",
            ys.n_series(),
            spec.n_obs()
        )));
    }
    if let Some(n) = spec.z_periods() {
        if n != ys.len() {
            return Err(Error::Configuration(format!(
                "time-varying Z declares {n} steps but the series has {}",
                ys.len()
            )));
        }
    }
    Ok(())
}

/// Run the Kalman filter over `y_1..y_T`.
///
/// A step with every entry missing skips the correction and adds nothing to the
/// log-likelihood. Partially missing steps use only the observed rows of `Z_t`, `R`
/// and `y_t`. Fails with `Error::Numerical` (stage `Filter`) when an innovation
/// covariance is not SPD within `opts.max_condition`.
pub fn kalman_filter(
    spec: &ModelSpec,
    ys: &Observations,
    opts: &NumericalOptions,
) -> Result<FilterOutput> {
    check_inputs(spec, ys)?;
    let n = spec.n_state();
    let t_max = ys.len();
    let b = spec.b();
    let bt = b.transpose();

    let mut out = FilterOutput {
        log_likelihood: 0.0,
        predicted_means: Vec::with_capacity(t_max + 1),
        predicted_covs: Vec::with_capacity(t_max + 1),
        filtered_means: Vec::with_capacity(t_max + 1),
        filtered_covs: Vec::with_capacity(t_max + 1),
        gains: Vec::with_capacity(t_max + 1),
        observed: Vec::with_capacity(t_max + 1),
        innovations: Vec::with_capacity(t_max + 1),
        innovation_covs: Vec::with_capacity(t_max + 1),
    };

    out.predicted_means.push(spec.x0().clone());
    out.predicted_covs.push(spec.v0().clone());
    out.filtered_means.push(spec.x0().clone());
    out.filtered_covs.push(spec.v0().clone());
    out.gains.push(DMatrix::zeros(n, 0));
    out.observed.push(Vec::new());
    out.innovations.push(DVector::zeros(0));
    out.innovation_covs.push(DMatrix::zeros(0, 0));

    let identity = DMatrix::<f64>::identity(n, n);

    for t in 1..=t_max {
        let x_prev = &out.filtered_means[t - 1];
        let v_prev = &out.filtered_covs[t - 1];
        let x_pred = b * x_prev;
        let v_pred = symmetrize(&(b * v_prev * &bt + spec.q()));

        let obs = ys.observed_indices(t);
        if obs.is_empty() {
            out.filtered_means.push(x_pred.clone());
            out.filtered_covs.push(v_pred.clone());
            out.predicted_means.push(x_pred);
            out.predicted_covs.push(v_pred);
            out.gains.push(DMatrix::zeros(n, 0));
            out.observed.push(obs);
            out.innovations.push(DVector::zeros(0));
            out.innovation_covs.push(DMatrix::zeros(0, 0));
            continue;
        }

        let y_obs = select_entries(ys.at(t), &obs);
        let z_obs = select_rows(spec.z(t), &obs);
        let r_obs = select(spec.r(), &obs, &obs);

        let e = y_obs - &z_obs * &x_pred;
        let s = symmetrize(&(&z_obs * &v_pred * z_obs.transpose() + &r_obs));
        let chol = checked_cholesky(&s, opts.max_condition).map_err(|c| {
            Error::Numerical(NumericalFailure::new(
                Stage::Filter,
                t,
                c.condition_number,
                format!("innovation covariance S_t not invertible (min eigenvalue {:e})", c.min_eigenvalue),
            ))
        })?;

        let s_inv_e = chol.solve_vec(&e);
        let quad = e.dot(&s_inv_e);
        out.log_likelihood += -0.5 * ((obs.len() as f64) * LN_2PI + chol.log_det() + quad);

        // K = V_pred Z' S^{-1}
        let k = chol.solve_right(&(&v_pred * z_obs.transpose()));
        let x_filt = &x_pred + &k * &e;

        // Joseph form: (I - K Z) V (I - K Z)' + K R K'
        let i_kz = &identity - &k * &z_obs;
        let v_filt = symmetrize(&(&i_kz * &v_pred * i_kz.transpose() + &k * &r_obs * k.transpose()));

        out.predicted_means.push(x_pred);
        out.predicted_covs.push(v_pred);
        out.filtered_means.push(x_filt);
        out.filtered_covs.push(v_filt);
        out.gains.push(k);
        out.observed.push(obs);
        out.innovations.push(e);
        out.innovation_covs.push(s);
    }

    Ok(out)
}

/// Log-likelihood only.
pub fn log_likelihood(spec: &ModelSpec, ys: &Observations, opts: &NumericalOptions) -> Result<f64> {
    Ok(kalman_filter(spec, ys, opts)?.log_likelihood)
}
