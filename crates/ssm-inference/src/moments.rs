//! E-step sufficient statistics.

use nalgebra::{DMatrix, DVector};
use ssm_core::Observations;

use crate::linalg::{pinv_symmetric, select, select_entries, select_rows};
use crate::smoother::SmootherOutput;
use crate::spec::ModelSpec;

/// Conditional observation moments at one step given all data.
#[derive(Debug, Clone)]
pub(crate) struct ObsMoments {
    /// `E[y_t]` (observed entries are the data).
    pub ey: DVector<f64>,
    /// `E[y_t x_t']`.
    pub eyx: DMatrix<f64>,
    /// `E[y_t y_t']`.
    pub eyy: DMatrix<f64>,
}

/// Smoothed second moments summed the way the M-step consumes them.
#[derive(Debug, Clone)]
pub(crate) struct SufficientStats {
    /// `sum_{t=1..T} E[x_{t-1} x_{t-1}']`.
    pub s00: DMatrix<f64>,
    /// `sum_{t=1..T} E[x_t x_t']`.
    pub s11: DMatrix<f64>,
    /// `sum_{t=1..T} E[x_t x_{t-1}']`.
    pub s10: DMatrix<f64>,
    /// `E[x_t x_t']` for `t = 0..=T`.
    pub p: Vec<DMatrix<f64>>,
    /// Observation moments for `t = 1..=T` (stored at `t - 1`).
    pub obs: Vec<ObsMoments>,
    /// `x_{0|T}`.
    pub x0_smoothed: DVector<f64>,
}

impl SufficientStats {
    pub fn n_steps(&self) -> usize {
        self.obs.len()
    }
}

fn observation_moments(
    y: &DVector<f64>,
    observed: &[usize],
    z: &DMatrix<f64>,
    r: &DMatrix<f64>,
    x: &DVector<f64>,
    v: &DMatrix<f64>,
) -> ObsMoments {
    let k = y.len();
    let m = x.len();
    if observed.len() == k {
        return ObsMoments { ey: y.clone(), eyx: y * x.transpose(), eyy: y * y.transpose() };
    }

    let missing: Vec<usize> = (0..k).filter(|i| !observed.contains(i)).collect();
    let mut ey = DVector::<f64>::zeros(k);
    let mut delta = DMatrix::<f64>::zeros(k, m);
    let mut gamma = DMatrix::<f64>::zeros(k, k);

    if observed.is_empty() {
        ey = z * x;
        delta = z * v;
        gamma = z * v * z.transpose() + r;
    } else {
        // y_m | x, y_o ~ N(G x + A y_o, R_mm - A R_om), A = R_mo R_oo^+, G = Z_m - A Z_o.
        let y_o = select_entries(y, observed);
        let z_o = select_rows(z, observed);
        let z_m = select_rows(z, &missing);
        let r_oo = select(r, observed, observed);
        let r_mo = select(r, &missing, observed);
        let r_mm = select(r, &missing, &missing);
        let a = &r_mo * pinv_symmetric(&r_oo);
        let g = z_m - &a * z_o;
        let y_m = &g * x + &a * &y_o;
        let g_v = &g * v;
        let cov_mm = &g_v * g.transpose() + r_mm - &a * r_mo.transpose();

        for (ii, &i) in observed.iter().enumerate() {
            ey[i] = y_o[ii];
        }
        for (ii, &i) in missing.iter().enumerate() {
            ey[i] = y_m[ii];
            for j in 0..m {
                delta[(i, j)] = g_v[(ii, j)];
            }
            for (jj, &j) in missing.iter().enumerate() {
                gamma[(i, j)] = cov_mm[(ii, jj)];
            }
        }
    }

    let eyx = &ey * x.transpose() + delta;
    let eyy = &ey * ey.transpose() + gamma;
    ObsMoments { ey, eyx, eyy }
}

/// Collect the sufficient statistics of one E-step.
pub(crate) fn sufficient_stats(spec: &ModelSpec, ys: &Observations, sm: &SmootherOutput) -> SufficientStats {
    let t_max = sm.n_steps();
    let n = spec.n_state();

    let p: Vec<DMatrix<f64>> = sm
        .smoothed_means
        .iter()
        .zip(&sm.smoothed_covs)
        .map(|(x, v)| v + x * x.transpose())
        .collect();

    let mut s00 = DMatrix::<f64>::zeros(n, n);
    let mut s11 = DMatrix::<f64>::zeros(n, n);
    let mut s10 = DMatrix::<f64>::zeros(n, n);
    for t in 1..=t_max {
        s00 += &p[t - 1];
        s11 += &p[t];
        s10 += &sm.lag_one_covs[t] + &sm.smoothed_means[t] * sm.smoothed_means[t - 1].transpose();
    }

    let obs = (1..=t_max)
        .map(|t| {
            observation_moments(
                ys.at(t),
                &ys.observed_indices(t),
                spec.z(t),
                spec.r(),
                &sm.smoothed_means[t],
                &sm.smoothed_covs[t],
            )
        })
        .collect();

    SufficientStats { s00, s11, s10, p, obs, x0_smoothed: sm.smoothed_means[0].clone() }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(a: f64, b: f64, tol: f64) {
        let d = (a - b).abs();
        assert!(d <= tol, "a={} b={} |diff|={}", a, b, d);
    }

    #[test]
    fn test_fully_missing_uses_model_prediction() {
        let y = DVector::from_row_slice(&[f64::NAN]);
        let z = DMatrix::from_row_slice(1, 1, &[2.0]);
        let r = DMatrix::from_row_slice(1, 1, &[0.5]);
        let x = DVector::from_row_slice(&[1.5]);
        let v = DMatrix::from_row_slice(1, 1, &[0.25]);
        let mo = observation_moments(&y, &[], &z, &r, &x, &v);
        assert_close(mo.ey[0], 3.0, 1e-15);
        // E[y x] = 2 E[x^2] = 2 (0.25 + 2.25)
        assert_close(mo.eyx[(0, 0)], 5.0, 1e-15);
        // E[y^2] = 4 E[x^2] + r
        assert_close(mo.eyy[(0, 0)], 4.0 * 2.5 + 0.5, 1e-15);
    }

    #[test]
    fn test_partial_missing_with_correlated_noise() {
        let y = DVector::from_row_slice(&[1.0, f64::NAN]);
        let z = DMatrix::from_row_slice(2, 1, &[1.0, 1.0]);
        let r = DMatrix::from_row_slice(2, 2, &[1.0, 0.5, 0.5, 1.0]);
        let x = DVector::from_row_slice(&[0.4]);
        let v = DMatrix::from_row_slice(1, 1, &[0.1]);
        let mo = observation_moments(&y, &[0], &z, &r, &x, &v);

        // A = 0.5, G = 1 - 0.5 = 0.5
        assert_close(mo.ey[0], 1.0, 1e-15);
        assert_close(mo.ey[1], 0.5 * 0.4 + 0.5 * 1.0, 1e-15);
        assert_close(mo.eyx[(0, 0)], 0.4, 1e-15);
        assert_close(mo.eyx[(1, 0)], 0.7 * 0.4 + 0.5 * 0.1, 1e-15);
        // Var(y_m) = G V G + R_mm - A R_om = 0.025 + 1 - 0.25
        assert_close(mo.eyy[(1, 1)], 0.7 * 0.7 + 0.775, 1e-14);
        assert_close(mo.eyy[(0, 1)], 0.7, 1e-15);
        assert_close(mo.eyy[(0, 0)], 1.0, 1e-15);
    }
}
