//! h-step-ahead forecasts from the last filtered state.
//!
//! Only models with a static `Z` can be forecast: a time-varying `Z` has no
//! declared value beyond the sample.

use nalgebra::{DMatrix, DVector};
use serde::Serialize;
use ssm_core::{Error, Result};
use statrs::distribution::{ContinuousCDF, Normal};

use crate::kalman::FilterOutput;
use crate::linalg::symmetrize;
use crate::spec::ModelSpec;

/// Forecast output for steps `T+1..=T+h`.
#[derive(Debug, Clone)]
pub struct Forecast {
    /// Predicted state means.
    pub state_means: Vec<DVector<f64>>,
    /// Predicted state covariances.
    pub state_covs: Vec<DMatrix<f64>>,
    /// Predicted observation means.
    pub obs_means: Vec<DVector<f64>>,
    /// Predicted observation covariances.
    pub obs_covs: Vec<DMatrix<f64>>,
}

/// Marginal normal prediction intervals for each observed series.
#[derive(Debug, Clone, Serialize)]
pub struct ForecastIntervals {
    /// Two-sided level (0.05 means a 95% interval).
    pub alpha: f64,
    /// Standard normal quantile `1 - alpha/2`.
    pub z: f64,
    /// Lower bounds per step (h x k).
    pub lower: Vec<Vec<f64>>,
    /// Upper bounds per step (h x k).
    pub upper: Vec<Vec<f64>>,
}

/// Forecast `steps` ahead starting from `(x_last, v_last)`.
pub fn forecast_from(
    spec: &ModelSpec,
    x_last: &DVector<f64>,
    v_last: &DMatrix<f64>,
    steps: usize,
) -> Result<Forecast> {
    if steps == 0 {
        return Err(Error::Validation("steps must be > 0".to_string()));
    }
    if spec.z_periods().is_some() {
        return Err(Error::Configuration("cannot forecast a model with time-varying Z".to_string()));
    }
    let n = spec.n_state();
    if x_last.len() != n || v_last.nrows() != n || v_last.ncols() != n {
        return Err(Error::Validation("last state has wrong shape".to_string()));
    }

    let b = spec.b();
    let z = spec.z(1);
    let mut x = x_last.clone();
    let mut v = v_last.clone();
    let mut out = Forecast {
        state_means: Vec::with_capacity(steps),
        state_covs: Vec::with_capacity(steps),
        obs_means: Vec::with_capacity(steps),
        obs_covs: Vec::with_capacity(steps),
    };
    for _ in 0..steps {
        x = b * &x;
        v = symmetrize(&(b * &v * b.transpose() + spec.q()));
        out.obs_means.push(z * &x);
        out.obs_covs.push(symmetrize(&(z * &v * z.transpose() + spec.r())));
        out.state_means.push(x.clone());
        out.state_covs.push(v.clone());
    }
    Ok(out)
}

/// Forecast from the last filtered state of `fr`.
pub fn forecast(spec: &ModelSpec, fr: &FilterOutput, steps: usize) -> Result<Forecast> {
    let t = fr.n_steps();
    forecast_from(spec, &fr.filtered_means[t], &fr.filtered_covs[t], steps)
}

impl Forecast {
    /// Marginal normal prediction intervals for the observation forecasts.
    pub fn intervals(&self, alpha: f64) -> Result<ForecastIntervals> {
        if !(alpha.is_finite() && alpha > 0.0 && alpha < 1.0) {
            return Err(Error::Validation("alpha must be in (0, 1)".to_string()));
        }
        let normal = Normal::new(0.0, 1.0)
            .map_err(|e| Error::Validation(format!("failed to construct normal distribution: {e}")))?;
        let z = normal.inverse_cdf(1.0 - 0.5 * alpha);

        let mut lower = Vec::with_capacity(self.obs_means.len());
        let mut upper = Vec::with_capacity(self.obs_means.len());
        for (m, s) in self.obs_means.iter().zip(&self.obs_covs) {
            let sd: Vec<f64> = (0..m.len()).map(|i| s[(i, i)].max(0.0).sqrt()).collect();
            lower.push(m.iter().zip(&sd).map(|(mu, sd)| mu - z * sd).collect());
            upper.push(m.iter().zip(&sd).map(|(mu, sd)| mu + z * sd).collect());
        }
        Ok(ForecastIntervals { alpha, z, lower, upper })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kalman::{NumericalOptions, kalman_filter};
    use crate::spec::{MatrixDecl, ModelDeclaration, ObservationMatrixDecl};
    use ssm_core::Observations;

    fn local_level() -> ModelSpec {
        ModelDeclaration {
            z: ObservationMatrixDecl::Static(MatrixDecl::identity(1)),
            r: MatrixDecl::fixed_diagonal(&[0.2]),
            b: MatrixDecl::identity(1),
            q: MatrixDecl::fixed_diagonal(&[0.1]),
            x0: MatrixDecl::fixed_column(&[0.0]),
            v0: MatrixDecl::fixed_diagonal(&[1.0]),
        }
        .build()
        .unwrap()
    }

    #[test]
    fn test_random_walk_forecast_variance_grows_linearly() {
        let spec = local_level();
        let fc = forecast_from(
            &spec,
            &DVector::from_row_slice(&[0.3]),
            &DMatrix::from_row_slice(1, 1, &[0.4]),
            3,
        )
        .unwrap();
        for h in 0..3 {
            assert!((fc.state_means[h][0] - 0.3).abs() < 1e-15);
            assert!((fc.state_covs[h][(0, 0)] - (0.4 + 0.1 * (h + 1) as f64)).abs() < 1e-12);
            assert!((fc.obs_covs[h][(0, 0)] - fc.state_covs[h][(0, 0)] - 0.2).abs() < 1e-12);
        }
    }

    #[test]
    fn test_intervals_are_symmetric_and_ordered() {
        let spec = local_level();
        let ys = Observations::univariate(&[0.9, 1.2, 0.8]).unwrap();
        let fr = kalman_filter(&spec, &ys, &NumericalOptions::default()).unwrap();
        let fc = forecast(&spec, &fr, 2).unwrap();
        let iv = fc.intervals(0.05).unwrap();
        assert!((iv.z - 1.959964).abs() < 1e-5);
        for h in 0..2 {
            let mid = 0.5 * (iv.lower[h][0] + iv.upper[h][0]);
            assert!((mid - fc.obs_means[h][0]).abs() < 1e-12);
            assert!(iv.lower[h][0] < iv.upper[h][0]);
        }
        assert!(fc.intervals(1.5).is_err());
    }

    #[test]
    fn test_zero_steps_rejected() {
        let spec = local_level();
        let x = DVector::from_row_slice(&[0.0]);
        let v = DMatrix::from_row_slice(1, 1, &[1.0]);
        assert!(matches!(forecast_from(&spec, &x, &v, 0), Err(Error::Validation(_))));
    }
}
