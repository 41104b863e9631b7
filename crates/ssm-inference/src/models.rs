//! Declarations for common model structures.
//!
//! Builders return a [`ModelDeclaration`] rather than a compiled spec so that
//! callers can adjust individual entries before building. Unless stated otherwise
//! the initial mean is free (`x0_1`, ...) with init 0 and `V0 = v0 * I`.

use nalgebra::DMatrix;
use ssm_core::{Error, Result};

use crate::spec::{Entry, MatrixDecl, ModelDeclaration, ObservationMatrixDecl};

fn free_x0(m: usize) -> MatrixDecl {
    MatrixDecl::from_fn(m, 1, |i, _| Entry::free_init(format!("x0_{}", i + 1), 0.0))
}

fn check_v0(v0: f64) -> Result<()> {
    if !v0.is_finite() || v0 <= 0.0 {
        return Err(Error::Validation("v0 must be finite and > 0".to_string()));
    }
    Ok(())
}

fn scalar_free(name: &str) -> MatrixDecl {
    MatrixDecl::from_rows(vec![vec![Entry::free(name)]])
}

/// Random walk plus noise: `x_t = x_{t-1} + w`, `y_t = x_t + v`. Free: `q`, `r`, `x0_1`.
pub fn local_level(v0: f64) -> Result<ModelDeclaration> {
    check_v0(v0)?;
    Ok(ModelDeclaration {
        z: ObservationMatrixDecl::Static(MatrixDecl::identity(1)),
        r: scalar_free("r"),
        b: MatrixDecl::identity(1),
        q: scalar_free("q"),
        x0: free_x0(1),
        v0: MatrixDecl::fixed_diagonal(&[v0]),
    })
}

/// Level + slope. Free: `q_level`, `q_slope`, `r`, `x0_1`, `x0_2`.
pub fn local_linear_trend(v0: f64) -> Result<ModelDeclaration> {
    check_v0(v0)?;
    Ok(ModelDeclaration {
        z: ObservationMatrixDecl::Static(MatrixDecl::fixed(&DMatrix::from_row_slice(1, 2, &[1.0, 0.0]))),
        r: scalar_free("r"),
        b: MatrixDecl::fixed(&DMatrix::from_row_slice(2, 2, &[1.0, 1.0, 0.0, 1.0])),
        q: MatrixDecl::from_rows(vec![
            vec![Entry::free("q_level"), Entry::fixed(0.0)],
            vec![Entry::fixed(0.0), Entry::free("q_slope")],
        ]),
        x0: free_x0(2),
        v0: MatrixDecl::fixed_diagonal(&[v0, v0]),
    })
}

/// Latent AR(1) observed with noise. Free: `b`, `q`, `r`, `x0_1`.
pub fn ar1(v0: f64) -> Result<ModelDeclaration> {
    check_v0(v0)?;
    Ok(ModelDeclaration {
        b: scalar_free("b"),
        ..local_level(v0)?
    })
}

/// Latent AR(p) in companion form.
///
/// `b_1..b_p` are free on the first row of `B`, the rows below shift the lags
/// (fixed identity), and only the first state has process noise.
pub fn ar_companion(p: usize, v0: f64) -> Result<ModelDeclaration> {
    if p == 0 {
        return Err(Error::Validation("AR order must be > 0".to_string()));
    }
    check_v0(v0)?;
    let b = MatrixDecl::from_fn(p, p, |i, j| {
        if i == 0 {
            Entry::free(format!("b_{}", j + 1))
        } else {
            Entry::fixed(if j + 1 == i { 1.0 } else { 0.0 })
        }
    });
    let q = MatrixDecl::from_fn(p, p, |i, j| {
        if (i, j) == (0, 0) { Entry::free("q") } else { Entry::fixed(0.0) }
    });
    let z = MatrixDecl::from_fn(1, p, |_, j| Entry::fixed(if j == 0 { 1.0 } else { 0.0 }));
    Ok(ModelDeclaration {
        z: ObservationMatrixDecl::Static(z),
        r: scalar_free("r"),
        b,
        q,
        x0: free_x0(p),
        v0: MatrixDecl::fixed_diagonal(&vec![v0; p]),
    })
}

/// Dynamic factor model with `n_factors` random-walk factors.
///
/// Loadings `z_i_j` are free on and below the diagonal (zero above, which fixes
/// the rotation), `B = Q = I`, `R` diagonal with free `r_i`, `x0 = 0` fixed.
/// Use [`crate::diagnostics::varimax`] on the fitted loadings for interpretation.
pub fn dynamic_factor(n_series: usize, n_factors: usize, v0: f64) -> Result<ModelDeclaration> {
    if n_factors == 0 || n_series == 0 {
        return Err(Error::Validation("n_series and n_factors must be > 0".to_string()));
    }
    if n_factors > n_series {
        return Err(Error::Validation(format!(
            "n_factors ({n_factors}) must not exceed n_series ({n_series})"
        )));
    }
    check_v0(v0)?;
    let z = MatrixDecl::from_fn(n_series, n_factors, |i, j| {
        if j <= i { Entry::free(format!("z_{}_{}", i + 1, j + 1)) } else { Entry::fixed(0.0) }
    });
    Ok(ModelDeclaration {
        z: ObservationMatrixDecl::Static(z),
        r: MatrixDecl::diagonal_unequal("r", n_series, None),
        b: MatrixDecl::identity(n_factors),
        q: MatrixDecl::identity(n_factors),
        x0: MatrixDecl::zero(n_factors, 1),
        v0: MatrixDecl::fixed_diagonal(&vec![v0; n_factors]),
    })
}

/// Regression with random-walk coefficients: `y_t = c_t' beta_t + v`,
/// `beta_t = beta_{t-1} + w`.
///
/// `covariates[t]` is the row `c_{t+1}`; include a constant column for an intercept.
/// Free: `q_1..q_p`, `r`, `x0_1..x0_p`.
pub fn tvp_regression(covariates: &[Vec<f64>], v0: f64) -> Result<ModelDeclaration> {
    let p = covariates.first().map_or(0, |c| c.len());
    if p == 0 {
        return Err(Error::Validation("covariates must be non-empty".to_string()));
    }
    if covariates.iter().any(|c| c.len() != p) {
        return Err(Error::Validation("covariate rows must have equal length".to_string()));
    }
    if covariates.iter().flatten().any(|v| !v.is_finite()) {
        return Err(Error::Validation("covariates must be finite".to_string()));
    }
    check_v0(v0)?;
    let zs = covariates
        .iter()
        .map(|c| MatrixDecl::from_fn(1, p, |_, j| Entry::fixed(c[j])))
        .collect();
    Ok(ModelDeclaration {
        z: ObservationMatrixDecl::TimeVarying(zs),
        r: scalar_free("r"),
        b: MatrixDecl::identity(p),
        q: MatrixDecl::diagonal_unequal("q", p, None),
        x0: free_x0(p),
        v0: MatrixDecl::fixed_diagonal(&vec![v0; p]),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builders_compile() {
        let ll = local_level(10.0).unwrap().build().unwrap();
        assert_eq!(ll.n_parameters(), 3);
        let llt = local_linear_trend(10.0).unwrap().build().unwrap();
        assert_eq!(llt.n_state(), 2);
        assert_eq!(llt.n_parameters(), 5);
        let a = ar1(1.0).unwrap().build().unwrap();
        assert!(a.parameter("b").is_some());
    }

    #[test]
    fn test_companion_structure() {
        let spec = ar_companion(3, 1.0).unwrap().build().unwrap();
        let b = spec.b();
        assert_eq!(b[(1, 0)], 1.0);
        assert_eq!(b[(2, 1)], 1.0);
        assert_eq!(b[(1, 1)], 0.0);
        assert_eq!(spec.q()[(1, 1)], 0.0);
        assert_eq!(spec.z(1)[(0, 0)], 1.0);
        // b_1..b_3, q, r, x0_1..x0_3
        assert_eq!(spec.n_parameters(), 8);
        assert!(ar_companion(0, 1.0).is_err());
    }

    #[test]
    fn test_dynamic_factor_loadings_lower_triangular() {
        let spec = dynamic_factor(4, 2, 5.0).unwrap().build().unwrap();
        assert_eq!(spec.z(1)[(0, 1)], 0.0);
        assert!(spec.parameter("z_2_2").is_some());
        assert!(spec.parameter("z_1_2").is_none());
        // 7 loadings + 4 variances
        assert_eq!(spec.n_parameters(), 11);
        assert!(dynamic_factor(2, 3, 5.0).is_err());
    }

    #[test]
    fn test_tvp_regression_z_follows_covariates() {
        let cov = vec![vec![1.0, 0.5], vec![1.0, -0.2], vec![1.0, 0.9]];
        let spec = tvp_regression(&cov, 10.0).unwrap().build().unwrap();
        assert_eq!(spec.z_periods(), Some(3));
        assert_eq!(spec.z(2)[(0, 1)], -0.2);
        assert!(tvp_regression(&[vec![1.0], vec![1.0, 2.0]], 1.0).is_err());
    }
}
