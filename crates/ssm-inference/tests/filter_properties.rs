//! Filter and smoother properties that hold for any valid model.
//!
//! - log-likelihood equals the joint Gaussian density of the observed entries
//! - filtered and smoothed covariances are PSD, with `V_{t|T} <= V_{t|t}`
//! - `x_{T|T}` from the smoother equals the filter's last state
//! - an all-missing step leaves the prediction untouched

use approx::assert_relative_eq;
use nalgebra::{DMatrix, DVector};
use ssm_core::{Error, Observations, Stage};
use ssm_inference::kalman::{NumericalOptions, kalman_filter, log_likelihood};
use ssm_inference::linalg::min_eigenvalue;
use ssm_inference::smoother::rts_smoother;
use ssm_inference::spec::{Entry, MatrixDecl, ModelDeclaration, ModelSpec, ObservationMatrixDecl};

fn local_level(q: f64, r: f64, x0: f64, v0: f64) -> ModelSpec {
    ModelDeclaration {
        z: ObservationMatrixDecl::Static(MatrixDecl::identity(1)),
        r: MatrixDecl::fixed_diagonal(&[r]),
        b: MatrixDecl::identity(1),
        q: MatrixDecl::fixed_diagonal(&[q]),
        x0: MatrixDecl::fixed_column(&[x0]),
        v0: MatrixDecl::fixed_diagonal(&[v0]),
    }
    .build()
    .unwrap()
}

/// Two series loading on one AR(1) state plus a random walk, correlated R.
fn two_by_two() -> ModelSpec {
    ModelDeclaration {
        z: ObservationMatrixDecl::Static(MatrixDecl::fixed(&DMatrix::from_row_slice(
            2,
            2,
            &[1.0, 0.0, 0.5, 1.0],
        ))),
        r: MatrixDecl::fixed(&DMatrix::from_row_slice(2, 2, &[0.3, 0.1, 0.1, 0.4])),
        b: MatrixDecl::fixed(&DMatrix::from_row_slice(2, 2, &[0.7, 0.0, 0.0, 1.0])),
        q: MatrixDecl::fixed_diagonal(&[0.5, 0.05]),
        x0: MatrixDecl::fixed_column(&[0.0, 1.0]),
        v0: MatrixDecl::fixed_diagonal(&[2.0, 1.0]),
    }
    .build()
    .unwrap()
}

fn two_series_with_gaps() -> Observations {
    let n = 40;
    let ys = (0..n)
        .map(|t| {
            let a = (t as f64 * 0.3).sin() + 0.1 * t as f64;
            let b = (t as f64 * 0.2).cos() + 1.0;
            match t % 7 {
                2 => DVector::from_row_slice(&[f64::NAN, b]),
                4 => DVector::from_row_slice(&[a, f64::NAN]),
                6 => DVector::from_row_slice(&[f64::NAN, f64::NAN]),
                _ => DVector::from_row_slice(&[a, b]),
            }
        })
        .collect();
    Observations::new(ys).unwrap()
}

/// Brute-force log density of the observed entries of a local-level series.
///
/// `x_t = x_0 + w_1 + .. + w_t`, so `Cov(y_s, y_t) = V0 + min(s, t) q + r [s = t]`.
fn joint_gaussian_ll(ys: &[f64], q: f64, r: f64, x0: f64, v0: f64) -> f64 {
    let idx: Vec<usize> = (0..ys.len()).filter(|&i| !ys[i].is_nan()).collect();
    let n = idx.len();
    let cov = DMatrix::from_fn(n, n, |a, b| {
        let (s, t) = (idx[a] + 1, idx[b] + 1);
        v0 + s.min(t) as f64 * q + if a == b { r } else { 0.0 }
    });
    let resid = DVector::from_iterator(n, idx.iter().map(|&i| ys[i] - x0));
    let chol = cov.cholesky().unwrap();
    let log_det = 2.0 * chol.l().diagonal().iter().map(|d| d.ln()).sum::<f64>();
    let quad = resid.dot(&chol.solve(&resid));
    -0.5 * (n as f64 * (2.0 * std::f64::consts::PI).ln() + log_det + quad)
}

#[test]
fn test_log_likelihood_matches_joint_gaussian() {
    let raw = [1.1, 0.7, f64::NAN, 1.9, 2.4, f64::NAN, f64::NAN, 2.0, 2.6, 3.1];
    let (q, r, x0, v0) = (0.3, 0.5, 0.2, 2.0);
    let spec = local_level(q, r, x0, v0);
    let ys = Observations::univariate(&raw).unwrap();

    let ll = log_likelihood(&spec, &ys, &NumericalOptions::default()).unwrap();
    assert_relative_eq!(ll, joint_gaussian_ll(&raw, q, r, x0, v0), max_relative = 1e-10);
}

#[test]
fn test_covariances_psd_and_smoothing_reduces_uncertainty() {
    let spec = two_by_two();
    let ys = two_series_with_gaps();
    let opts = NumericalOptions::default();
    let fr = kalman_filter(&spec, &ys, &opts).unwrap();
    let sm = rts_smoother(&spec, &fr, &opts).unwrap();

    for t in 0..=ys.len() {
        assert!(min_eigenvalue(&fr.filtered_covs[t]) > -1e-10, "filtered V not PSD at t={t}");
        assert!(min_eigenvalue(&fr.predicted_covs[t]) > -1e-10, "predicted V not PSD at t={t}");
        assert!(min_eigenvalue(&sm.smoothed_covs[t]) > -1e-10, "smoothed V not PSD at t={t}");
        let gap = &fr.filtered_covs[t] - &sm.smoothed_covs[t];
        assert!(min_eigenvalue(&gap) > -1e-9, "V_t|T exceeds V_t|t at t={t}");
        // Symmetric to rounding.
        let v = &fr.filtered_covs[t];
        assert_relative_eq!(v[(0, 1)], v[(1, 0)], epsilon = 1e-14);
    }
}

#[test]
fn test_smoother_boundary_equals_filter() {
    let spec = two_by_two();
    let ys = two_series_with_gaps();
    let opts = NumericalOptions::default();
    let fr = kalman_filter(&spec, &ys, &opts).unwrap();
    let sm = rts_smoother(&spec, &fr, &opts).unwrap();
    let t = ys.len();

    assert_eq!(sm.n_steps(), t);
    assert_eq!(sm.lag_one_covs.len(), t + 1);
    for i in 0..2 {
        assert_relative_eq!(sm.smoothed_means[t][i], fr.filtered_means[t][i], epsilon = 1e-14);
        for j in 0..2 {
            assert_relative_eq!(sm.smoothed_covs[t][(i, j)], fr.filtered_covs[t][(i, j)], epsilon = 1e-14);
        }
    }
    assert_eq!(sm.log_likelihood, fr.log_likelihood);
}

#[test]
fn test_all_missing_step_is_pure_prediction() {
    let spec = two_by_two();
    let ys = two_series_with_gaps();
    let fr = kalman_filter(&spec, &ys, &NumericalOptions::default()).unwrap();

    // t % 7 == 6 is fully missing (0-based), i.e. steps 7, 14, ...
    for t in (7..=ys.len()).step_by(7) {
        assert!(fr.observed[t].is_empty());
        assert_eq!(fr.filtered_means[t], fr.predicted_means[t]);
        assert_eq!(fr.filtered_covs[t], fr.predicted_covs[t]);
    }
    // Partially observed steps use only the observed rows.
    assert_eq!(fr.observed[3], vec![1]);
    assert_eq!(fr.observed[5], vec![0]);
    assert_eq!(fr.innovations[3].len(), 1);
}

#[test]
fn test_dropping_a_series_matches_univariate_filter() {
    // With diagonal Z, R, B, Q and V0 a missing second series must not change
    // the first series' likelihood contribution.
    let decoupled = ModelDeclaration {
        z: ObservationMatrixDecl::Static(MatrixDecl::identity(2)),
        r: MatrixDecl::fixed_diagonal(&[0.5, 0.2]),
        b: MatrixDecl::identity(2),
        q: MatrixDecl::fixed_diagonal(&[0.3, 0.1]),
        x0: MatrixDecl::fixed_column(&[0.2, 0.0]),
        v0: MatrixDecl::fixed_diagonal(&[2.0, 1.0]),
    }
    .build()
    .unwrap();
    let first = [1.1, 0.7, 1.3, 1.9, 2.4];
    let ys = Observations::new(first.iter().map(|&a| DVector::from_row_slice(&[a, f64::NAN])).collect())
        .unwrap();
    let opts = NumericalOptions::default();
    let ll2 = log_likelihood(&decoupled, &ys, &opts).unwrap();
    let ll1 = log_likelihood(&local_level(0.3, 0.5, 0.2, 2.0), &Observations::univariate(&first).unwrap(), &opts)
        .unwrap();
    assert_relative_eq!(ll2, ll1, max_relative = 1e-12);
}

#[test]
fn test_singular_innovation_covariance_reports_step() {
    // Z = 0 and R = 0 leave nothing to invert at the first observed step.
    let spec = ModelDeclaration {
        z: ObservationMatrixDecl::Static(MatrixDecl::from_rows(vec![vec![Entry::fixed(0.0)]])),
        r: MatrixDecl::fixed_diagonal(&[0.0]),
        b: MatrixDecl::identity(1),
        q: MatrixDecl::fixed_diagonal(&[1.0]),
        x0: MatrixDecl::fixed_column(&[0.0]),
        v0: MatrixDecl::fixed_diagonal(&[1.0]),
    }
    .build()
    .unwrap();
    let ys = Observations::univariate(&[f64::NAN, 1.0, 2.0]).unwrap();
    let err = kalman_filter(&spec, &ys, &NumericalOptions::default()).unwrap_err();
    let failure = err.numerical().unwrap();
    assert_eq!(failure.stage, Stage::Filter);
    assert_eq!(failure.t, 2);
}

#[test]
fn test_input_mismatch_errors() {
    let spec = two_by_two();
    let ys = Observations::univariate(&[1.0, 2.0]).unwrap();
    assert!(matches!(
        kalman_filter(&spec, &ys, &NumericalOptions::default()),
        Err(Error::Validation(_))
    ));

    let mut decl = two_by_two().to_declaration();
    decl.z = ObservationMatrixDecl::TimeVarying(vec![MatrixDecl::identity(2); 3]);
    let tv = decl.build().unwrap();
    assert!(matches!(
        kalman_filter(&tv, &two_series_with_gaps(), &NumericalOptions::default()),
        Err(Error::Configuration(_))
    ));
}
