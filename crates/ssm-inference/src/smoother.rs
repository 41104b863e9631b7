//! Rauch–Tung–Striebel smoother with lag-one covariances.

use nalgebra::{DMatrix, DVector};
use ssm_core::{Error, NumericalFailure, Result, Stage};

use crate::kalman::{FilterOutput, NumericalOptions};
use crate::linalg::{checked_cholesky, select_rows, symmetrize};
use crate::spec::ModelSpec;

/// Smoothed states for `t = 0..=T`.
#[derive(Debug, Clone)]
pub struct SmootherOutput {
    /// Log-likelihood of the filter pass this output was computed from.
    pub log_likelihood: f64,
    /// `x_{t|T}`.
    pub smoothed_means: Vec<DVector<f64>>,
    /// `V_{t|T}`.
    pub smoothed_covs: Vec<DMatrix<f64>>,
    /// `V_{t,t-1|T}` (index 0 is unused and zero).
    pub lag_one_covs: Vec<DMatrix<f64>>,
    /// Smoother gains `J_t` for `t = 0..T-1`.
    pub gains: Vec<DMatrix<f64>>,
}

impl SmootherOutput {
    /// Number of observation steps `T`.
    pub fn n_steps(&self) -> usize {
        self.smoothed_means.len() - 1
    }
}

/// Backward pass over a completed filter output.
///
/// `J_t = V_{t|t} B' V_{t+1|t}^{-1}` fails with `Error::Numerical` (stage `Smoother`)
/// when `V_{t+1|t}` is not SPD within `opts.max_condition`.
pub fn rts_smoother(
    spec: &ModelSpec,
    fr: &FilterOutput,
    opts: &NumericalOptions,
) -> Result<SmootherOutput> {
    let t_max = fr.n_steps();
    if t_max == 0 {
        return Err(Error::Validation("filter output must contain at least one step".to_string()));
    }
    let n = spec.n_state();
    let b = spec.b();
    let bt = b.transpose();

    let mut means = fr.filtered_means.clone();
    let mut covs = fr.filtered_covs.clone();
    let mut gains: Vec<DMatrix<f64>> = vec![DMatrix::zeros(n, n); t_max];

    for t in (0..t_max).rev() {
        let v_filt = &fr.filtered_covs[t];
        let v_pred_next = &fr.predicted_covs[t + 1];
        let chol = checked_cholesky(v_pred_next, opts.max_condition).map_err(|c| {
            Error::Numerical(NumericalFailure::new(
                Stage::Smoother,
                t + 1,
                c.condition_number,
                format!("predicted covariance V_{{t|t-1}} not invertible (min eigenvalue {:e})", c.min_eigenvalue),
            ))
        })?;
        let j = chol.solve_right(&(v_filt * &bt));

        let dx = &means[t + 1] - &fr.predicted_means[t + 1];
        means[t] = &fr.filtered_means[t] + &j * dx;

        let dv = &covs[t + 1] - v_pred_next;
        covs[t] = symmetrize(&(v_filt + &j * dv * j.transpose()));
        gains[t] = j;
    }

    // Lag-one covariances, seeded at T with the last Kalman gain.
    let mut lag = vec![DMatrix::<f64>::zeros(n, n); t_max + 1];
    let identity = DMatrix::<f64>::identity(n, n);
    let obs_last = &fr.observed[t_max];
    let i_kz = if obs_last.is_empty() {
        identity.clone()
    } else {
        &identity - &fr.gains[t_max] * select_rows(spec.z(t_max), obs_last)
    };
    lag[t_max] = i_kz * b * &fr.filtered_covs[t_max - 1];
    for t in (2..=t_max).rev() {
        let v_filt = &fr.filtered_covs[t - 1];
        let jt2 = gains[t - 2].transpose();
        lag[t - 1] = v_filt * &jt2 + &gains[t - 1] * (&lag[t] - b * v_filt) * &jt2;
    }

    Ok(SmootherOutput {
        log_likelihood: fr.log_likelihood,
        smoothed_means: means,
        smoothed_covs: covs,
        lag_one_covs: lag,
        gains,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kalman::kalman_filter;
    use crate::linalg::min_eigenvalue;
    use crate::spec::{MatrixDecl, ModelDeclaration, ObservationMatrixDecl};
    use ssm_core::Observations;

    fn assert_close(a: f64, b: f64, tol: f64) {
        let d = (a - b).abs();
        assert!(d <= tol, "a={} b={} |diff|={}", a, b, d);
    }

    fn two_state_spec() -> ModelSpec {
        ModelDeclaration {
            z: ObservationMatrixDecl::Static(MatrixDecl::fixed(&DMatrix::from_row_slice(
                2,
                2,
                &[1.0, 0.0, 0.5, 1.0],
            ))),
            r: MatrixDecl::fixed(&DMatrix::from_row_slice(2, 2, &[0.3, 0.05, 0.05, 0.2])),
            b: MatrixDecl::fixed(&DMatrix::from_row_slice(2, 2, &[0.9, 0.1, 0.0, 0.7])),
            q: MatrixDecl::fixed_diagonal(&[0.2, 0.1]),
            x0: MatrixDecl::fixed_column(&[0.0, 0.0]),
            v0: MatrixDecl::identity(2),
        }
        .build()
        .unwrap()
    }

    fn series() -> Observations {
        let rows = [
            [0.3, 0.1],
            [0.5, f64::NAN],
            [f64::NAN, f64::NAN],
            [0.2, 0.4],
            [-0.1, 0.0],
            [0.4, 0.3],
        ];
        Observations::new(rows.iter().map(|r| DVector::from_row_slice(r)).collect()).unwrap()
    }

    #[test]
    fn test_boundary_identity_and_loewner_order() {
        let spec = two_state_spec();
        let ys = series();
        let opts = NumericalOptions::default();
        let fr = kalman_filter(&spec, &ys, &opts).unwrap();
        let sr = rts_smoother(&spec, &fr, &opts).unwrap();

        let t_max = ys.len();
        assert_eq!(sr.n_steps(), t_max);
        assert_eq!(sr.smoothed_means[t_max], fr.filtered_means[t_max]);
        assert_eq!(sr.smoothed_covs[t_max], fr.filtered_covs[t_max]);

        for t in 0..=t_max {
            let diff = &fr.filtered_covs[t] - &sr.smoothed_covs[t];
            assert!(min_eigenvalue(&diff) >= -1e-10, "t={t}");
            assert!(min_eigenvalue(&sr.smoothed_covs[t]) >= -1e-10, "t={t}");
        }
    }

    #[test]
    fn test_lag_one_matches_gain_identity() {
        // V_{t,t-1|T} = V_{t|T} J_{t-1}'
        let spec = two_state_spec();
        let ys = series();
        let opts = NumericalOptions::default();
        let fr = kalman_filter(&spec, &ys, &opts).unwrap();
        let sr = rts_smoother(&spec, &fr, &opts).unwrap();
        for t in 1..=ys.len() {
            let alt = &sr.smoothed_covs[t] * sr.gains[t - 1].transpose();
            for (a, b) in sr.lag_one_covs[t].iter().zip(alt.iter()) {
                assert_close(*a, *b, 1e-10);
            }
        }
    }

    #[test]
    fn test_scalar_smoother_matches_hand_recursion() {
        let decl = ModelDeclaration {
            z: ObservationMatrixDecl::Static(MatrixDecl::identity(1)),
            r: MatrixDecl::fixed_diagonal(&[0.2]),
            b: MatrixDecl::identity(1),
            q: MatrixDecl::fixed_diagonal(&[0.1]),
            x0: MatrixDecl::fixed_column(&[0.0]),
            v0: MatrixDecl::identity(1),
        };
        let spec = decl.build().unwrap();
        let ys = Observations::univariate(&[0.9, 1.2, 0.8, 1.1]).unwrap();
        let opts = NumericalOptions::default();
        let fr = kalman_filter(&spec, &ys, &opts).unwrap();
        let sr = rts_smoother(&spec, &fr, &opts).unwrap();

        let mut xs = fr.filtered_means.iter().map(|v| v[0]).collect::<Vec<_>>();
        let mut vs = fr.filtered_covs.iter().map(|v| v[(0, 0)]).collect::<Vec<_>>();
        for t in (0..4).rev() {
            let j = fr.filtered_covs[t][(0, 0)] / fr.predicted_covs[t + 1][(0, 0)];
            xs[t] += j * (xs[t + 1] - fr.predicted_means[t + 1][0]);
            vs[t] += j * j * (vs[t + 1] - fr.predicted_covs[t + 1][(0, 0)]);
        }
        for t in 0..=4 {
            assert_close(sr.smoothed_means[t][0], xs[t], 1e-12);
            assert_close(sr.smoothed_covs[t][(0, 0)], vs[t], 1e-12);
        }
    }
}
