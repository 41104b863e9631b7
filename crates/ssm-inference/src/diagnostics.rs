//! Read-only projections of a fitted model for reporting.
//!
//! Parameter standard errors come from the observed information matrix: the
//! negative Hessian of the filter log-likelihood over the free-parameter vector,
//! estimated by central finite differences. When it cannot be inverted the
//! standard errors are omitted (with a warning) rather than approximated.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use ssm_core::{Error, LogLikelihood, Observations, Parameterized, Result};

use crate::em::EmResult;
use crate::kalman::{FilterOutput, NumericalOptions, kalman_filter};
use crate::smoother::SmootherOutput;
use crate::spec::{MatrixKind, ModelSpec};

/// Diagnostics options.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiagnosticsConfig {
    /// Compute parameter standard errors.
    pub std_errors: bool,
    /// Relative finite-difference step (scaled by `|p|` for variances, `max(1, |p|)` otherwise).
    pub hessian_step: f64,
    /// Inversion tolerances for the filter runs.
    pub numerical: NumericalOptions,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self { std_errors: true, hessian_step: 1e-4, numerical: NumericalOptions::default() }
    }
}

/// A free parameter with its estimate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParameterEstimate {
    /// Declared name.
    pub name: String,
    /// Owning matrix.
    pub matrix: MatrixKind,
    /// Point estimate.
    pub value: f64,
    /// Standard error, when the information matrix could be inverted.
    pub std_error: Option<f64>,
}

/// Per-time outputs and fit summary. Rows are time steps `1..=T`; `NaN` marks missing.
#[derive(Debug, Clone, Serialize)]
pub struct Diagnostics {
    /// Final log-likelihood.
    pub log_likelihood: f64,
    /// Number of free parameters.
    pub n_parameters: usize,
    /// Number of non-missing scalar observations.
    pub n_observations: usize,
    /// Akaike information criterion.
    pub aic: f64,
    /// Small-sample corrected AIC.
    pub aicc: f64,
    /// Smoothed states `x_{t|T}` (T x m).
    pub states: Vec<Vec<f64>>,
    /// `sqrt(diag(V_{t|T}))` (T x m).
    pub state_std_errors: Vec<Vec<f64>>,
    /// `Z_t x_{t|T}` (T x k).
    pub fitted: Vec<Vec<f64>>,
    /// `y_t - Z_t x_{t|T}` (T x k).
    pub residuals: Vec<Vec<f64>>,
    /// Innovations scaled by their marginal standard deviation (T x k).
    pub standardized_innovations: Vec<Vec<f64>>,
    /// Parameter table.
    pub parameters: Vec<ParameterEstimate>,
}

/// `AIC = 2k - 2 ll`, `AICc = AIC + 2k(k+1)/(n-k-1)` (`inf` when `n <= k + 1`).
pub fn information_criteria(log_likelihood: f64, n_parameters: usize, n_observations: usize) -> (f64, f64) {
    let k = n_parameters as f64;
    let n = n_observations as f64;
    let aic = 2.0 * k - 2.0 * log_likelihood;
    let aicc = if n > k + 1.0 { aic + 2.0 * k * (k + 1.0) / (n - k - 1.0) } else { f64::INFINITY };
    (aic, aicc)
}

/// Smallest step scale for a variance parameter.
const MIN_VARIANCE_SCALE: f64 = 1e-12;

/// Filter log-likelihood of a specification over its free-parameter vector.
pub struct SpecLikelihood<'a> {
    spec: &'a ModelSpec,
    ys: &'a Observations,
    opts: NumericalOptions,
}

impl<'a> SpecLikelihood<'a> {
    /// Wrap a specification and its data.
    pub fn new(spec: &'a ModelSpec, ys: &'a Observations, opts: NumericalOptions) -> Self {
        Self { spec, ys, opts }
    }
}

impl Parameterized for SpecLikelihood<'_> {
    fn n_parameters(&self) -> usize {
        self.spec.n_parameters()
    }

    fn parameter_names(&self) -> Vec<String> {
        self.spec.parameters().iter().map(|p| p.name.clone()).collect()
    }

    fn parameter_values(&self) -> Vec<f64> {
        self.spec.parameter_values()
    }
}

impl LogLikelihood for SpecLikelihood<'_> {
    fn log_likelihood(&self, params: &[f64]) -> Result<f64> {
        let mut spec = self.spec.clone();
        spec.set_parameter_values(params)?;
        Ok(kalman_filter(&spec, self.ys, &self.opts)?.log_likelihood)
    }

    fn step_scales(&self, at: &[f64]) -> Vec<f64> {
        at.iter()
            .zip(self.spec.variance_mask())
            .map(|(v, is_var)| if is_var { v.abs().max(MIN_VARIANCE_SCALE) } else { v.abs().max(1.0) })
            .collect()
    }
}

/// Central finite-difference Hessian of `log L` at `at`.
///
/// Step for parameter `i` is `step * model.step_scales(at)[i]`.
pub fn numerical_hessian(model: &dyn LogLikelihood, at: &[f64], step: f64) -> Result<DMatrix<f64>> {
    let n = at.len();
    if n != model.n_parameters() {
        return Err(Error::Validation(format!(
            "expected {} parameters, got {}",
            model.n_parameters(),
            n
        )));
    }
    if !(step > 0.0 && step < 1.0) {
        return Err(Error::Validation(format!("hessian step must be in (0, 1), got {step}")));
    }
    let h: Vec<f64> = model.step_scales(at).into_iter().map(|s| step * s).collect();
    let eval = |shifts: &[(usize, f64)]| -> Result<f64> {
        let mut p = at.to_vec();
        for &(i, d) in shifts {
            p[i] += d;
        }
        model.log_likelihood(&p)
    };

    let center = model.log_likelihood(at)?;
    let mut hess = DMatrix::<f64>::zeros(n, n);
    for i in 0..n {
        let plus = eval(&[(i, h[i])])?;
        let minus = eval(&[(i, -h[i])])?;
        hess[(i, i)] = (plus - 2.0 * center + minus) / (h[i] * h[i]);
        for j in 0..i {
            let pp = eval(&[(i, h[i]), (j, h[j])])?;
            let pm = eval(&[(i, h[i]), (j, -h[j])])?;
            let mp = eval(&[(i, -h[i]), (j, h[j])])?;
            let mm = eval(&[(i, -h[i]), (j, -h[j])])?;
            let v = (pp - pm - mp + mm) / (4.0 * h[i] * h[j]);
            hess[(i, j)] = v;
            hess[(j, i)] = v;
        }
    }
    Ok(hess)
}

/// Standard errors from the inverse observed information `-H^{-1}`.
///
/// Returns `None` (after a warning) when the Hessian cannot be evaluated, is not
/// negative definite, or yields non-positive variances.
pub fn observed_information_std_errors(model: &dyn LogLikelihood, at: &[f64], step: f64) -> Option<Vec<f64>> {
    if at.is_empty() {
        return Some(Vec::new());
    }
    let hess = match numerical_hessian(model, at, step) {
        Ok(h) => h,
        Err(e) => {
            log::warn!("Hessian evaluation failed, omitting standard errors: {e}");
            return None;
        }
    };
    let info = -hess;
    let Some(chol) = info.clone().cholesky() else {
        log::warn!("Observed information is not positive definite, omitting standard errors");
        return None;
    };
    let cov = chol.inverse();
    let mut out = Vec::with_capacity(at.len());
    let names = model.parameter_names();
    for i in 0..at.len() {
        let v = cov[(i, i)];
        if !(v.is_finite() && v > 0.0) {
            log::warn!("Invalid variance for parameter '{}', omitting standard errors", names[i]);
            return None;
        }
        out.push(v.sqrt());
    }
    Some(out)
}

fn rows(vs: &[DVector<f64>]) -> Vec<Vec<f64>> {
    vs.iter().map(|v| v.iter().copied().collect()).collect()
}

/// Build the diagnostics for `spec` from its filter and smoother outputs.
pub fn assemble(
    spec: &ModelSpec,
    ys: &Observations,
    filtered: &FilterOutput,
    smoothed: &SmootherOutput,
    cfg: &DiagnosticsConfig,
) -> Result<Diagnostics> {
    let t_max = ys.len();
    if filtered.n_steps() != t_max || smoothed.n_steps() != t_max {
        return Err(Error::Validation(format!(
            "outputs cover {} / {} steps, series has {}",
            filtered.n_steps(),
            smoothed.n_steps(),
            t_max
        )));
    }
    let k = spec.n_obs();

    let states = rows(&smoothed.smoothed_means[1..]);
    let state_std_errors = smoothed.smoothed_covs[1..]
        .iter()
        .map(|v| (0..v.nrows()).map(|i| v[(i, i)].max(0.0).sqrt()).collect())
        .collect();

    let fitted_vecs: Vec<DVector<f64>> =
        (1..=t_max).map(|t| spec.z(t) * &smoothed.smoothed_means[t]).collect();
    let residuals = (1..=t_max)
        .map(|t| {
            let y = ys.at(t);
            (0..k).map(|i| if y[i].is_nan() { f64::NAN } else { y[i] - fitted_vecs[t - 1][i] }).collect()
        })
        .collect();

    let standardized_innovations = (1..=t_max)
        .map(|t| {
            let mut row = vec![f64::NAN; k];
            let s = &filtered.innovation_covs[t];
            for (ii, &i) in filtered.observed[t].iter().enumerate() {
                row[i] = filtered.innovations[t][ii] / s[(ii, ii)].sqrt();
            }
            row
        })
        .collect();

    let std_errors = if cfg.std_errors {
        let lik = SpecLikelihood::new(spec, ys, cfg.numerical);
        observed_information_std_errors(&lik, &spec.parameter_values(), cfg.hessian_step)
    } else {
        None
    };
    let parameters = spec
        .parameters()
        .iter()
        .enumerate()
        .map(|(i, p)| ParameterEstimate {
            name: p.name.clone(),
            matrix: p.matrix,
            value: p.value,
            std_error: std_errors.as_ref().map(|se| se[i]),
        })
        .collect();

    let n_observations = ys.n_observed();
    let (aic, aicc) = information_criteria(filtered.log_likelihood, spec.n_parameters(), n_observations);

    Ok(Diagnostics {
        log_likelihood: filtered.log_likelihood,
        n_parameters: spec.n_parameters(),
        n_observations,
        aic,
        aicc,
        states,
        state_std_errors,
        fitted: rows(&fitted_vecs),
        residuals,
        standardized_innovations,
        parameters,
    })
}

/// Diagnostics for the model returned by an EM run.
pub fn assemble_em(result: &EmResult, ys: &Observations, cfg: &DiagnosticsConfig) -> Result<Diagnostics> {
    assemble(&result.spec, ys, &result.filtered, &result.smoothed, cfg)
}

/// Varimax rotation of a loadings matrix.
#[derive(Debug, Clone)]
pub struct Varimax {
    /// Rotated loadings `Z H`.
    pub loadings: DMatrix<f64>,
    /// Orthogonal rotation `H`.
    pub rotation: DMatrix<f64>,
}

impl Varimax {
    /// Factors consistent with the rotated loadings: `H' x_t`.
    pub fn rotate_states(&self, states: &[DVector<f64>]) -> Vec<DVector<f64>> {
        let ht = self.rotation.transpose();
        states.iter().map(|x| &ht * x).collect()
    }
}

/// Kaiser varimax (raw, `gamma = 1`) via the SVD iteration.
pub fn varimax(loadings: &DMatrix<f64>, max_iter: usize, tol: f64) -> Result<Varimax> {
    let (p, m) = loadings.shape();
    if p == 0 || m == 0 {
        return Err(Error::Validation("loadings must be non-empty".to_string()));
    }
    let mut rotation = DMatrix::<f64>::identity(m, m);
    if m == 1 {
        return Ok(Varimax { loadings: loadings.clone(), rotation });
    }
    let mut d = 0.0f64;
    for _ in 0..max_iter {
        let lam = loadings * &rotation;
        let col_ss: Vec<f64> = (0..m).map(|j| lam.column(j).iter().map(|v| v * v).sum()).collect();
        let target = DMatrix::from_fn(p, m, |i, j| lam[(i, j)].powi(3) - lam[(i, j)] * col_ss[j] / p as f64);
        let svd = (loadings.transpose() * target).svd(true, true);
        let (Some(u), Some(v_t)) = (svd.u, svd.v_t) else {
            return Err(Error::Validation("varimax SVD failed".to_string()));
        };
        rotation = u * v_t;
        let d_old = d;
        d = svd.singular_values.sum();
        if d_old != 0.0 && d < d_old * (1.0 + tol) {
            break;
        }
    }
    Ok(Varimax { loadings: loadings * &rotation, rotation })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::em::{EmConfig, fit_em};
    use crate::smoother::rts_smoother;
    use crate::spec::{Entry, MatrixDecl, ModelDeclaration, ObservationMatrixDecl};

    fn assert_close(a: f64, b: f64, tol: f64) {
        let d = (a - b).abs();
        assert!(d <= tol, "a={} b={} |diff|={}", a, b, d);
    }

    struct Gaussian {
        sigma: f64,
    }

    impl Parameterized for Gaussian {
        fn n_parameters(&self) -> usize {
            1
        }
        fn parameter_names(&self) -> Vec<String> {
            vec!["mu".to_string()]
        }
        fn parameter_values(&self) -> Vec<f64> {
            vec![0.0]
        }
    }

    impl LogLikelihood for Gaussian {
        fn log_likelihood(&self, params: &[f64]) -> Result<f64> {
            Ok(-0.5 * params[0] * params[0] / (self.sigma * self.sigma))
        }
    }

    #[test]
    fn test_std_error_of_quadratic_loglik() {
        let g = Gaussian { sigma: 0.3 };
        let se = observed_information_std_errors(&g, &[0.1], 1e-4).unwrap();
        assert_close(se[0], 0.3, 1e-6);
    }

    fn small_noise_decl(r0: f64) -> ModelDeclaration {
        ModelDeclaration {
            z: ObservationMatrixDecl::Static(MatrixDecl::identity(1)),
            r: MatrixDecl::from_rows(vec![vec![Entry::free_init("r", r0)]]),
            b: MatrixDecl::from_rows(vec![vec![Entry::free_init("b", 1.0)]]),
            q: MatrixDecl::fixed_diagonal(&[1e-4]),
            x0: MatrixDecl::fixed_column(&[0.0]),
            v0: MatrixDecl::fixed_diagonal(&[1.0]),
        }
    }

    #[test]
    fn test_step_scales_relative_for_variances() {
        let spec = small_noise_decl(5e-4).build().unwrap();
        let ys = Observations::univariate(&[0.1, 0.2]).unwrap();
        let lik = SpecLikelihood::new(&spec, &ys, NumericalOptions::default());
        assert_eq!(spec.variance_mask(), vec![true, false]);
        assert_eq!(lik.step_scales(&[5e-4, 0.02]), vec![5e-4, 1.0]);
        assert!(numerical_hessian(&lik, &[5e-4, 0.02], 2.0).is_err());
    }

    #[test]
    fn test_std_errors_for_small_fitted_variance() {
        let mut truth = small_noise_decl(1e-3).build().unwrap();
        truth.set_parameter("b", 1.0).unwrap();
        let ys = crate::simulate::simulate(&truth, 200, 11).unwrap().observations().unwrap();

        let init = small_noise_decl(1e-2).build().unwrap();
        let res = fit_em(&init, &ys, &EmConfig { max_iter: 500, tol: 1e-10, ..EmConfig::default() }).unwrap();
        let r_hat = res.spec.parameter("r").unwrap();
        assert!(r_hat < 5e-3, "r_hat={r_hat}");

        let d = assemble_em(&res, &ys, &DiagnosticsConfig::default()).unwrap();
        let r = d.parameters.iter().find(|p| p.name == "r").unwrap();
        let se = r.std_error.expect("standard error for a small variance");
        assert!(se > 0.0 && se < 0.5 * r_hat, "r_hat={r_hat} se={se}");
    }

    #[test]
    fn test_information_criteria() {
        let (aic, aicc) = information_criteria(-10.0, 2, 20);
        assert_close(aic, 24.0, 1e-12);
        assert_close(aicc, 24.0 + 12.0 / 17.0, 1e-12);
        assert!(information_criteria(-10.0, 3, 4).1.is_infinite());
    }

    #[test]
    fn test_assemble_shapes_missing_and_std_errors() {
        let decl = ModelDeclaration {
            z: ObservationMatrixDecl::Static(MatrixDecl::identity(1)),
            r: MatrixDecl::from_rows(vec![vec![Entry::free_init("r", 0.3)]]),
            b: MatrixDecl::identity(1),
            q: MatrixDecl::from_rows(vec![vec![Entry::free_init("q", 0.1)]]),
            x0: MatrixDecl::fixed_column(&[0.0]),
            v0: MatrixDecl::fixed_diagonal(&[1.0]),
        };
        let spec = decl.build().unwrap();
        let y: Vec<f64> = (0..60)
            .map(|t| if t == 7 { f64::NAN } else { (t as f64 * 0.3).sin() + 0.2 * (t as f64 * 1.7).cos() })
            .collect();
        let ys = Observations::univariate(&y).unwrap();
        let res = fit_em(&spec, &ys, &EmConfig { max_iter: 200, ..EmConfig::default() }).unwrap();
        let d = assemble_em(&res, &ys, &DiagnosticsConfig::default()).unwrap();

        assert_eq!(d.states.len(), 60);
        assert_eq!(d.n_observations, 59);
        assert!(d.residuals[7][0].is_nan());
        assert!(d.standardized_innovations[7][0].is_nan());
        assert!(d.fitted[7][0].is_finite());
        assert_close(d.residuals[3][0], y[3] - d.fitted[3][0], 1e-15);
        assert!(d.state_std_errors.iter().all(|r| r[0] > 0.0));
        assert_eq!(d.parameters.len(), 2);
        for p in &d.parameters {
            let se = p.std_error.unwrap();
            assert!(se.is_finite() && se > 0.0, "{}: {se}", p.name);
        }
        assert_close(d.log_likelihood, res.log_likelihood(), 1e-12);
    }

    #[test]
    fn test_assemble_rejects_mismatched_outputs() {
        let decl = ModelDeclaration {
            z: ObservationMatrixDecl::Static(MatrixDecl::identity(1)),
            r: MatrixDecl::fixed_diagonal(&[0.3]),
            b: MatrixDecl::identity(1),
            q: MatrixDecl::fixed_diagonal(&[0.1]),
            x0: MatrixDecl::fixed_column(&[0.0]),
            v0: MatrixDecl::fixed_diagonal(&[1.0]),
        };
        let spec = decl.build().unwrap();
        let opts = NumericalOptions::default();
        let short = Observations::univariate(&[0.1, 0.2]).unwrap();
        let long = Observations::univariate(&[0.1, 0.2, 0.3]).unwrap();
        let fr = kalman_filter(&spec, &short, &opts).unwrap();
        let sr = rts_smoother(&spec, &fr, &opts).unwrap();
        assert!(assemble(&spec, &long, &fr, &sr, &DiagnosticsConfig::default()).is_err());
    }

    #[test]
    fn test_varimax_preserves_fit_and_is_orthogonal() {
        let z = DMatrix::from_row_slice(4, 2, &[0.9, 0.0, 0.7, 0.3, 0.2, 0.8, 0.5, 0.5]);
        let vm = varimax(&z, 100, 1e-10).unwrap();
        let hth = vm.rotation.transpose() * &vm.rotation;
        for i in 0..2 {
            for j in 0..2 {
                assert_close(hth[(i, j)], if i == j { 1.0 } else { 0.0 }, 1e-10);
            }
        }
        let x = vec![DVector::from_row_slice(&[1.0, -0.5])];
        let xr = vm.rotate_states(&x);
        let a = &z * &x[0];
        let b = &vm.loadings * &xr[0];
        for i in 0..4 {
            assert_close(a[i], b[i], 1e-10);
        }
    }
}
