//! Dense linear-algebra helpers shared by the filter, smoother and EM.
//!
//! Everything here works on `nalgebra::DMatrix<f64>` / `DVector<f64>`. The
//! symmetric helpers assume (and do not check) that their input is symmetric up
//! to rounding; callers symmetrize first.

use nalgebra::{Cholesky, DMatrix, DVector, Dyn};

/// `ln(2*pi)`.
pub const LN_2PI: f64 = 1.837_877_066_409_345_3;

/// Relative eigenvalue cutoff used by the pseudo-inverse and PSD square root.
const EIGEN_EPS: f64 = 1e-12;

/// `(P + P^T) / 2`.
#[inline]
pub fn symmetrize(p: &DMatrix<f64>) -> DMatrix<f64> {
    0.5 * (p + p.transpose())
}

/// Smallest and largest eigenvalue of a symmetric matrix.
pub fn eigen_range(a: &DMatrix<f64>) -> (f64, f64) {
    if a.is_empty() {
        return (0.0, 0.0);
    }
    let ev = symmetrize(a).symmetric_eigenvalues();
    let lo = ev.iter().copied().fold(f64::INFINITY, f64::min);
    let hi = ev.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    (lo, hi)
}

/// Smallest eigenvalue of a symmetric matrix.
pub fn min_eigenvalue(a: &DMatrix<f64>) -> f64 {
    eigen_range(a).0
}

/// Spectral condition number `lambda_max / lambda_min` of a symmetric matrix.
///
/// Returns `inf` when the matrix is singular, indefinite or non-finite.
pub fn condition_number(a: &DMatrix<f64>) -> f64 {
    if a.iter().any(|v| !v.is_finite()) {
        return f64::INFINITY;
    }
    let (lo, hi) = eigen_range(a);
    if lo <= 0.0 || !lo.is_finite() { f64::INFINITY } else { hi / lo }
}

/// `true` when every eigenvalue is `>= -tol * max(1, |lambda_max|)`.
pub fn is_psd(a: &DMatrix<f64>, tol: f64) -> bool {
    if a.iter().any(|v| !v.is_finite()) {
        return false;
    }
    let (lo, hi) = eigen_range(a);
    lo >= -tol * hi.abs().max(1.0)
}

/// Conditioning report for a matrix that failed the SPD check.
#[derive(Debug, Clone, Copy)]
pub struct Conditioning {
    /// Spectral condition number (`inf` if singular or indefinite).
    pub condition_number: f64,
    /// Smallest eigenvalue.
    pub min_eigenvalue: f64,
}

/// Cholesky factor of a well-conditioned SPD matrix.
pub struct SpdFactor {
    chol: Cholesky<f64, Dyn>,
    /// Spectral condition number of the factored matrix.
    pub condition_number: f64,
}

impl SpdFactor {
    /// Solve `A X = B`.
    pub fn solve(&self, b: &DMatrix<f64>) -> DMatrix<f64> {
        self.chol.solve(b)
    }

    /// Solve `A x = b`.
    pub fn solve_vec(&self, b: &DVector<f64>) -> DVector<f64> {
        self.chol.solve(b)
    }

    /// `X A^{-1}` for a right-hand side given as rows (`X` is `r x n`).
    pub fn solve_right(&self, x: &DMatrix<f64>) -> DMatrix<f64> {
        self.chol.solve(&x.transpose()).transpose()
    }

    /// `log |A|` from the Cholesky diagonal.
    pub fn log_det(&self) -> f64 {
        let l = self.chol.l_dirty();
        (0..l.nrows()).map(|i| 2.0 * l[(i, i)].ln()).sum()
    }

    /// Explicit inverse.
    pub fn inverse(&self) -> DMatrix<f64> {
        self.chol.inverse()
    }
}

/// Factor a symmetric matrix, rejecting it when its smallest eigenvalue is not
/// positive or its condition number exceeds `max_condition`.
pub fn checked_cholesky(
    a: &DMatrix<f64>,
    max_condition: f64,
) -> std::result::Result<SpdFactor, Conditioning> {
    let a = symmetrize(a);
    let (lo, hi) = if a.iter().all(|v| v.is_finite()) {
        eigen_range(&a)
    } else {
        (f64::NAN, f64::NAN)
    };
    let condition_number = if lo > 0.0 && lo.is_finite() { hi / lo } else { f64::INFINITY };
    if !(condition_number <= max_condition) {
        return Err(Conditioning { condition_number, min_eigenvalue: lo });
    }
    match a.cholesky() {
        Some(chol) => Ok(SpdFactor { chol, condition_number }),
        None => Err(Conditioning { condition_number: f64::INFINITY, min_eigenvalue: lo }),
    }
}

/// Moore–Penrose pseudo-inverse of a symmetric PSD matrix.
///
/// Eigenvalues below `EIGEN_EPS * lambda_max` are treated as zero, so fixed-zero
/// variance rows/columns map to zero rows/columns of the result.
pub fn pinv_symmetric(a: &DMatrix<f64>) -> DMatrix<f64> {
    let n = a.nrows();
    if n == 0 {
        return DMatrix::zeros(0, 0);
    }
    let eig = symmetrize(a).symmetric_eigen();
    let lmax = eig.eigenvalues.iter().fold(0.0f64, |m, v| m.max(v.abs()));
    if lmax == 0.0 {
        return DMatrix::zeros(n, n);
    }
    let cutoff = EIGEN_EPS * lmax;
    let mut out = DMatrix::<f64>::zeros(n, n);
    for (k, &lam) in eig.eigenvalues.iter().enumerate() {
        if lam > cutoff {
            let v = eig.eigenvectors.column(k);
            out += (v * v.transpose()) / lam;
        }
    }
    symmetrize(&out)
}

/// A matrix `L` with `L L^T = a` for symmetric PSD `a` (eigen-based, tolerates singular `a`).
///
/// Returns `None` when `a` has a clearly negative eigenvalue.
pub fn psd_sqrt(a: &DMatrix<f64>) -> Option<DMatrix<f64>> {
    let n = a.nrows();
    if n == 0 || a.ncols() != n {
        return None;
    }
    if let Some(chol) = symmetrize(a).cholesky() {
        return Some(chol.l());
    }
    let eig = symmetrize(a).symmetric_eigen();
    let lmax = eig.eigenvalues.iter().fold(0.0f64, |m, v| m.max(v.abs()));
    let mut l = eig.eigenvectors.clone();
    for (k, &lam) in eig.eigenvalues.iter().enumerate() {
        if lam < -1e-9 * lmax.max(1.0) {
            return None;
        }
        let s = lam.max(0.0).sqrt();
        for i in 0..n {
            l[(i, k)] *= s;
        }
    }
    Some(l)
}

/// Sub-matrix with the given rows and columns.
pub fn select(a: &DMatrix<f64>, rows: &[usize], cols: &[usize]) -> DMatrix<f64> {
    DMatrix::from_fn(rows.len(), cols.len(), |i, j| a[(rows[i], cols[j])])
}

/// Sub-matrix with the given rows (all columns).
pub fn select_rows(a: &DMatrix<f64>, rows: &[usize]) -> DMatrix<f64> {
    DMatrix::from_fn(rows.len(), a.ncols(), |i, j| a[(rows[i], j)])
}

/// Sub-vector with the given entries.
pub fn select_entries(v: &DVector<f64>, idx: &[usize]) -> DVector<f64> {
    DVector::from_fn(idx.len(), |i, _| v[idx[i]])
}

/// Column-major `vec(A)`.
pub fn vec(a: &DMatrix<f64>) -> DVector<f64> {
    DVector::from_column_slice(a.as_slice())
}

/// Inverse of [`vec`].
pub fn unvec(v: &DVector<f64>, nrows: usize, ncols: usize) -> DMatrix<f64> {
    DMatrix::from_column_slice(nrows, ncols, v.as_slice())
}
