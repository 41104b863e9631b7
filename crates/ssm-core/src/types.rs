//! Common data types for state-space estimation

use nalgebra::{DMatrix, DVector};

use crate::{Error, Result};

/// Observation series `y_1..y_T`, each of dimension `k`.
///
/// Missing entries are `NaN`. Infinite values are rejected at construction.
/// The series is immutable once built.
#[derive(Debug, Clone)]
pub struct Observations {
    ys: Vec<DVector<f64>>,
    n_series: usize,
}

impl Observations {
    /// Build from one vector per time step.
    pub fn new(ys: Vec<DVector<f64>>) -> Result<Self> {
        if ys.is_empty() {
            return Err(Error::Validation("observation series must be non-empty".to_string()));
        }
        let k = ys[0].len();
        if k == 0 {
            return Err(Error::Validation("observations must have at least one series".to_string()));
        }
        for (i, y) in ys.iter().enumerate() {
            if y.len() != k {
                return Err(Error::Validation(format!(
                    "y[{}] has wrong length: expected {}, got {}",
                    i + 1,
                    k,
                    y.len()
                )));
            }
            // Missing observations are represented as NaN. Reject infinities.
            if y.iter().any(|v| v.is_infinite()) {
                return Err(Error::Validation(format!(
                    "y[{}] must be finite or NaN (NaN means missing)",
                    i + 1
                )));
            }
        }
        Ok(Self { ys, n_series: k })
    }

    /// Build from a `k x T` matrix (one column per time step).
    pub fn from_matrix(y: &DMatrix<f64>) -> Result<Self> {
        Self::new(y.column_iter().map(|c| c.into_owned()).collect())
    }

    /// Build a univariate series.
    pub fn univariate(y: &[f64]) -> Result<Self> {
        Self::new(y.iter().map(|&v| DVector::from_row_slice(&[v])).collect())
    }

    /// Build from per-time-step rows where `None` marks a missing value.
    pub fn from_optional_rows(rows: &[Vec<Option<f64>>]) -> Result<Self> {
        Self::new(
            rows.iter()
                .map(|r| DVector::from_iterator(r.len(), r.iter().map(|v| v.unwrap_or(f64::NAN))))
                .collect(),
        )
    }

    /// Number of time steps `T`.
    pub fn len(&self) -> usize {
        self.ys.len()
    }

    /// Always false: an empty series cannot be constructed.
    pub fn is_empty(&self) -> bool {
        self.ys.is_empty()
    }

    /// Number of observed series `k`.
    pub fn n_series(&self) -> usize {
        self.n_series
    }

    /// Observation at time `t` (1-based, `1..=T`).
    pub fn at(&self, t: usize) -> &DVector<f64> {
        &self.ys[t - 1]
    }

    /// Iterate over `y_1..y_T`.
    pub fn iter(&self) -> impl Iterator<Item = &DVector<f64>> {
        self.ys.iter()
    }

    /// Indices of non-missing entries at time `t` (1-based).
    pub fn observed_indices(&self, t: usize) -> Vec<usize> {
        self.at(t).iter().enumerate().filter(|(_, v)| !v.is_nan()).map(|(i, _)| i).collect()
    }

    /// Total number of non-missing scalar observations.
    pub fn n_observed(&self) -> usize {
        self.ys.iter().map(|y| y.iter().filter(|v| !v.is_nan()).count()).sum()
    }

    /// The series as a `k x T` matrix (NaN kept).
    pub fn to_matrix(&self) -> DMatrix<f64> {
        DMatrix::from_columns(&self.ys)
    }
}
