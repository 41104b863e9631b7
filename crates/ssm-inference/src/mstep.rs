//! Constrained M-step updates.
//!
//! Each matrix is `vec(M) = f + D p`. Mean-type matrices (B, Z, x0) solve the
//! generalized normal equations
//! `p = [D' (S ⊗ W) D]^{-1} D' [vec(W C) - (S ⊗ W) f]`
//! with `W` the pseudo-inverse of the matching noise covariance. Covariance
//! matrices (Q, R) project the unconstrained estimate onto the declared structure,
//! `p = (D' D)^{-1} D' (vec(S) - f)`, which pools shared entries and leaves fixed
//! ones alone.
//!
//! Updates run in the order B, Q, Z, R, x0; each conditions on the ones before it.

use nalgebra::{DMatrix, DVector};
use ssm_core::{Error, NumericalFailure, Result, Stage};

use crate::kalman::NumericalOptions;
use crate::linalg::{checked_cholesky, is_psd, min_eigenvalue, pinv_symmetric, symmetrize, vec};
use crate::moments::SufficientStats;
use crate::spec::{MatrixKind, ModelSpec};

const PSD_TOL: f64 = 1e-10;

fn mstep_error(kind: MatrixKind, condition_number: f64, detail: impl Into<String>) -> Error {
    Error::Numerical(NumericalFailure::new(
        Stage::MStep,
        0,
        condition_number,
        format!("{kind}: {}", detail.into()),
    ))
}

fn solve_normal(
    kind: MatrixKind,
    lhs: &DMatrix<f64>,
    rhs: &DVector<f64>,
    opts: &NumericalOptions,
) -> Result<DVector<f64>> {
    let chol = checked_cholesky(lhs, opts.max_condition)
        .map_err(|c| mstep_error(kind, c.condition_number, "normal equations are singular"))?;
    let p = chol.solve_vec(rhs);
    if p.iter().any(|v| !v.is_finite()) {
        return Err(mstep_error(kind, chol.condition_number, "non-finite update"));
    }
    Ok(p)
}

fn update_b(spec: &mut ModelSpec, st: &SufficientStats, opts: &NumericalOptions) -> Result<()> {
    let block = spec.block(MatrixKind::B);
    if block.n_local() == 0 {
        return Ok(());
    }
    let form = block.form(1);
    let w = pinv_symmetric(spec.q());
    let kron = st.s00.kronecker(&w);
    let d = &form.design;
    let lhs = d.transpose() * &kron * d;
    let rhs = d.transpose() * (vec(&(&w * &st.s10)) - &kron * &form.fixed);
    let p = solve_normal(MatrixKind::B, &lhs, &rhs, opts)?;
    spec.set_block_values(MatrixKind::B, &p);
    Ok(())
}

fn update_z(spec: &mut ModelSpec, st: &SufficientStats, opts: &NumericalOptions) -> Result<()> {
    let block = spec.block(MatrixKind::Z);
    let n_local = block.n_local();
    if n_local == 0 {
        return Ok(());
    }
    let w = pinv_symmetric(spec.r());
    let mut lhs = DMatrix::<f64>::zeros(n_local, n_local);
    let mut rhs = DVector::<f64>::zeros(n_local);

    if block.forms.len() == 1 {
        let form = &block.forms[0];
        let t_max = st.n_steps();
        let (n, k) = (spec.n_state(), spec.n_obs());
        let p_sum = st.p[1..=t_max].iter().fold(DMatrix::<f64>::zeros(n, n), |acc, p| acc + p);
        let eyx_sum = st.obs.iter().fold(DMatrix::<f64>::zeros(k, n), |acc, o| acc + &o.eyx);
        let kron = p_sum.kronecker(&w);
        let d = &form.design;
        lhs += d.transpose() * &kron * d;
        rhs += d.transpose() * (vec(&(&w * eyx_sum)) - &kron * &form.fixed);
    } else {
        for (i, form) in block.forms.iter().enumerate() {
            let t = i + 1;
            let kron = st.p[t].kronecker(&w);
            let d = &form.design;
            lhs += d.transpose() * &kron * d;
            rhs += d.transpose() * (vec(&(&w * &st.obs[i].eyx)) - &kron * &form.fixed);
        }
    }

    let p = solve_normal(MatrixKind::Z, &lhs, &rhs, opts)?;
    spec.set_block_values(MatrixKind::Z, &p);
    Ok(())
}

/// Project an unconstrained covariance estimate onto the declared structure.
fn update_covariance(
    spec: &mut ModelSpec,
    kind: MatrixKind,
    unconstrained: &DMatrix<f64>,
    min_variance: f64,
    opts: &NumericalOptions,
) -> Result<()> {
    let block = spec.block(kind);
    if block.n_local() == 0 {
        return Ok(());
    }
    let form = &block.forms[0];
    let d = &form.design;
    let s = symmetrize(unconstrained);
    let lhs = d.transpose() * d;
    let rhs = d.transpose() * (vec(&s) - &form.fixed);
    let mut p = solve_normal(kind, &lhs, &rhs, opts)?;

    let on_diagonal = block.diagonal_locals();
    let names: Vec<String> = block.global.iter().map(|&g| spec.parameters()[g].name.clone()).collect();
    for (l, diag) in on_diagonal.iter().enumerate() {
        if *diag && p[l] < min_variance {
            log::warn!(
                "{kind}: variance '{}' = {:e} floored at {:e}",
                names[l],
                p[l],
                min_variance
            );
            p[l] = min_variance;
        }
    }

    let previous = spec.block_values(kind);
    spec.set_block_values(kind, &p);
    let updated = match kind {
        MatrixKind::Q => spec.q(),
        _ => spec.r(),
    };
    if !is_psd(updated, PSD_TOL) {
        let lo = min_eigenvalue(updated);
        spec.set_block_values(kind, &previous);
        return Err(mstep_error(
            kind,
            f64::INFINITY,
            format!("re-estimated covariance is not positive semi-definite (min eigenvalue {lo:e})"),
        ));
    }
    Ok(())
}

fn update_q(spec: &mut ModelSpec, st: &SufficientStats, min_variance: f64, opts: &NumericalOptions) -> Result<()> {
    if spec.block(MatrixKind::Q).n_local() == 0 {
        return Ok(());
    }
    let b = spec.b().clone();
    let t = st.n_steps() as f64;
    let b_s10t = &b * st.s10.transpose();
    let s = (&st.s11 - &b_s10t - b_s10t.transpose() + &b * &st.s00 * b.transpose()) / t;
    update_covariance(spec, MatrixKind::Q, &s, min_variance, opts)
}

fn update_r(spec: &mut ModelSpec, st: &SufficientStats, min_variance: f64, opts: &NumericalOptions) -> Result<()> {
    if spec.block(MatrixKind::R).n_local() == 0 {
        return Ok(());
    }
    let k = spec.n_obs();
    let mut s = DMatrix::<f64>::zeros(k, k);
    for (i, o) in st.obs.iter().enumerate() {
        let t = i + 1;
        let z = spec.z(t);
        let z_eyxt = z * o.eyx.transpose();
        s += &o.eyy - &z_eyxt - z_eyxt.transpose() + z * &st.p[t] * z.transpose();
    }
    s /= st.n_steps() as f64;
    update_covariance(spec, MatrixKind::R, &s, min_variance, opts)
}

fn update_x0(spec: &mut ModelSpec, st: &SufficientStats, opts: &NumericalOptions) -> Result<()> {
    let block = spec.block(MatrixKind::X0);
    if block.n_local() == 0 {
        return Ok(());
    }
    let form = block.form(1);
    let w = pinv_symmetric(spec.v0());
    let d = &form.design;
    let lhs = d.transpose() * &w * d;
    let rhs = d.transpose() * &w * (&st.x0_smoothed - &form.fixed);
    let p = solve_normal(MatrixKind::X0, &lhs, &rhs, opts)?;
    spec.set_block_values(MatrixKind::X0, &p);
    Ok(())
}

/// Run one full constrained M-step in place.
pub(crate) fn m_step(
    spec: &mut ModelSpec,
    st: &SufficientStats,
    min_variance: f64,
    opts: &NumericalOptions,
) -> Result<()> {
    update_b(spec, st, opts)?;
    update_q(spec, st, min_variance, opts)?;
    update_z(spec, st, opts)?;
    update_r(spec, st, min_variance, opts)?;
    update_x0(spec, st, opts)?;
    Ok(())
}
