//! Model specification: declared structure + current parameter values.
//!
//! Model:
//! `x_t = B x_{t-1} + w_t`, `w_t ~ N(0, Q)`
//! `y_t = Z_t x_t + v_t`,   `v_t ~ N(0, R)`
//! `x_0 ~ N(x0, V0)`
//!
//! Every matrix is declared entry by entry ([`Entry`]) and compiled to the affine
//! form `vec(M) = f + D p` (column-major `vec`), where `p` are the free parameters
//! owned by that matrix. The EM M-step works directly on `(f, D)`; fixed entries
//! live in `f` and are therefore never touched by an update.

use std::collections::HashMap;
use std::fmt;

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use ssm_core::{Error, Parameterized, Result};

use crate::linalg::is_psd;

const DEFAULT_INIT: f64 = 0.1;
const PSD_TOL: f64 = 1e-10;

/// One named term of a [`Entry::Linear`] entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearTerm {
    /// Parameter name.
    pub name: String,
    /// Coefficient.
    pub coef: f64,
}

/// Declaration of a single matrix entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Entry {
    /// Constant, never estimated.
    Fixed(f64),
    /// Free parameter with an optional initial value.
    Free {
        /// Parameter name.
        name: String,
        /// Initial value.
        #[serde(default)]
        init: Option<f64>,
    },
    /// Reference to a parameter declared `Free` elsewhere in the same matrix.
    Shared(String),
    /// `offset + sum(coef_i * p_i)`, e.g. `1 - a` to make a row sum to one.
    Linear {
        /// Constant part.
        #[serde(default)]
        offset: f64,
        /// Parameter terms.
        terms: Vec<LinearTerm>,
    },
}

impl Entry {
    /// Fixed entry.
    pub fn fixed(value: f64) -> Self {
        Entry::Fixed(value)
    }

    /// Free entry without an initial value.
    pub fn free(name: impl Into<String>) -> Self {
        Entry::Free { name: name.into(), init: None }
    }

    /// Free entry with an initial value.
    pub fn free_init(name: impl Into<String>, init: f64) -> Self {
        Entry::Free { name: name.into(), init: Some(init) }
    }

    /// Shared reference.
    pub fn shared(name: impl Into<String>) -> Self {
        Entry::Shared(name.into())
    }

    /// Affine combination of parameters.
    pub fn linear(offset: f64, terms: &[(&str, f64)]) -> Self {
        Entry::Linear {
            offset,
            terms: terms
                .iter()
                .map(|(n, c)| LinearTerm { name: (*n).to_string(), coef: *c })
                .collect(),
        }
    }
}

/// Entry-by-entry declaration of one matrix (row-major nested rows).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MatrixDecl {
    rows: Vec<Vec<Entry>>,
}

impl MatrixDecl {
    /// Declaration from nested rows.
    pub fn from_rows(rows: Vec<Vec<Entry>>) -> Self {
        Self { rows }
    }

    /// All-fixed declaration.
    pub fn fixed(m: &DMatrix<f64>) -> Self {
        Self::from_fn(m.nrows(), m.ncols(), |i, j| Entry::Fixed(m[(i, j)]))
    }

    /// Fixed column vector (for `x0`).
    pub fn fixed_column(v: &[f64]) -> Self {
        Self::from_fn(v.len(), 1, |i, _| Entry::Fixed(v[i]))
    }

    /// All-zero matrix.
    pub fn zero(nrows: usize, ncols: usize) -> Self {
        Self::from_fn(nrows, ncols, |_, _| Entry::Fixed(0.0))
    }

    /// Identity matrix.
    pub fn identity(n: usize) -> Self {
        Self::from_fn(n, n, |i, j| Entry::Fixed(if i == j { 1.0 } else { 0.0 }))
    }

    /// Fixed diagonal matrix.
    pub fn fixed_diagonal(diag: &[f64]) -> Self {
        let n = diag.len();
        Self::from_fn(n, n, |i, j| Entry::Fixed(if i == j { diag[i] } else { 0.0 }))
    }

    /// Diagonal with one free parameter per entry (`{prefix}_{i}`, 1-based).
    pub fn diagonal_unequal(prefix: &str, n: usize, init: Option<f64>) -> Self {
        Self::from_fn(n, n, |i, j| {
            if i == j {
                Entry::Free { name: format!("{prefix}_{}", i + 1), init }
            } else {
                Entry::Fixed(0.0)
            }
        })
    }

    /// Diagonal with a single shared parameter.
    pub fn diagonal_equal(name: &str, n: usize, init: Option<f64>) -> Self {
        Self::from_fn(n, n, |i, j| match (i == j, i) {
            (true, 0) => Entry::Free { name: name.to_string(), init },
            (true, _) => Entry::Shared(name.to_string()),
            _ => Entry::Fixed(0.0),
        })
    }

    /// Every entry a distinct free parameter (`{prefix}_{i}_{j}`, 1-based).
    pub fn unconstrained(prefix: &str, nrows: usize, ncols: usize, init: Option<f64>) -> Self {
        Self::from_fn(nrows, ncols, |i, j| Entry::Free {
            name: format!("{prefix}_{}_{}", i + 1, j + 1),
            init,
        })
    }

    /// Full symmetric covariance: lower triangle free, upper triangle shared.
    pub fn unconstrained_symmetric(prefix: &str, n: usize, diag_init: Option<f64>) -> Self {
        Self::from_fn(n, n, |i, j| {
            let (a, b) = if i >= j { (i, j) } else { (j, i) };
            let name = format!("{prefix}_{}_{}", a + 1, b + 1);
            if i == j {
                Entry::Free { name, init: diag_init }
            } else if i > j {
                Entry::Free { name, init: Some(0.0) }
            } else {
                Entry::Shared(name)
            }
        })
    }

    /// One shared variance on the diagonal and one shared covariance off it.
    pub fn equal_var_cov(var_name: &str, cov_name: &str, n: usize, var_init: Option<f64>) -> Self {
        Self::from_fn(n, n, |i, j| {
            if i == j {
                if i == 0 {
                    Entry::Free { name: var_name.to_string(), init: var_init }
                } else {
                    Entry::Shared(var_name.to_string())
                }
            } else if (i, j) == (1, 0) {
                Entry::Free { name: cov_name.to_string(), init: Some(0.0) }
            } else {
                Entry::Shared(cov_name.to_string())
            }
        })
    }

    /// Declaration built entry by entry.
    pub fn from_fn(nrows: usize, ncols: usize, mut f: impl FnMut(usize, usize) -> Entry) -> Self {
        let rows = (0..nrows).map(|i| (0..ncols).map(|j| f(i, j)).collect()).collect();
        Self { rows }
    }

    /// Number of rows.
    pub fn nrows(&self) -> usize {
        self.rows.len()
    }

    /// Number of columns (of the first row).
    pub fn ncols(&self) -> usize {
        self.rows.first().map_or(0, |r| r.len())
    }

    /// Entry at `(i, j)`.
    pub fn get(&self, i: usize, j: usize) -> &Entry {
        &self.rows[i][j]
    }

    /// Replace the entry at `(i, j)`.
    pub fn set(&mut self, i: usize, j: usize, entry: Entry) {
        self.rows[i][j] = entry;
    }

    fn entries(&self) -> impl Iterator<Item = (usize, usize, &Entry)> {
        self.rows
            .iter()
            .enumerate()
            .flat_map(|(i, r)| r.iter().enumerate().map(move |(j, e)| (i, j, e)))
    }
}

/// Observation matrix declaration: one matrix for all t, or one per time step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObservationMatrixDecl {
    /// Same `Z` for every t.
    Static(MatrixDecl),
    /// `Z_1..Z_T`; free names are shared across time steps.
    TimeVarying(Vec<MatrixDecl>),
}

/// Full declared structure of a model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDeclaration {
    /// Observation matrix `Z` (k x m).
    pub z: ObservationMatrixDecl,
    /// Observation noise covariance `R` (k x k).
    pub r: MatrixDecl,
    /// State transition `B` (m x m).
    pub b: MatrixDecl,
    /// Process noise covariance `Q` (m x m).
    pub q: MatrixDecl,
    /// Initial state mean `x0` (m x 1).
    pub x0: MatrixDecl,
    /// Initial state covariance `V0` (m x m), fixed.
    pub v0: MatrixDecl,
}

impl ModelDeclaration {
    /// Parse a JSON declaration.
    pub fn from_json_str(s: &str) -> Result<Self> {
        Ok(serde_json::from_str(s)?)
    }

    /// Compile and validate.
    pub fn build(&self) -> Result<ModelSpec> {
        ModelSpec::new(self)
    }
}

/// Which system matrix a parameter belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MatrixKind {
    /// Observation matrix.
    Z,
    /// Observation noise covariance.
    R,
    /// State transition.
    B,
    /// Process noise covariance.
    Q,
    /// Initial state mean.
    X0,
    /// Initial state covariance.
    V0,
}

impl MatrixKind {
    /// True for covariance matrices (R, Q, V0).
    pub fn is_covariance(self) -> bool {
        matches!(self, MatrixKind::R | MatrixKind::Q | MatrixKind::V0)
    }
}

impl fmt::Display for MatrixKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MatrixKind::Z => "Z",
            MatrixKind::R => "R",
            MatrixKind::B => "B",
            MatrixKind::Q => "Q",
            MatrixKind::X0 => "x0",
            MatrixKind::V0 => "V0",
        };
        f.write_str(s)
    }
}

/// A free parameter and its current value.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Parameter {
    /// Declared name.
    pub name: String,
    /// Owning matrix.
    pub matrix: MatrixKind,
    /// Current value.
    pub value: f64,
}

/// Compiled `vec(M) = fixed + design * p_local`.
#[derive(Debug, Clone)]
pub(crate) struct Affine {
    pub nrows: usize,
    pub ncols: usize,
    pub fixed: DVector<f64>,
    pub design: DMatrix<f64>,
}

impl Affine {
    fn eval(&self, p: &DVector<f64>) -> DMatrix<f64> {
        let v = if self.design.ncols() == 0 { self.fixed.clone() } else { &self.fixed + &self.design * p };
        DMatrix::from_column_slice(self.nrows, self.ncols, v.as_slice())
    }

    #[inline]
    fn pos(&self, i: usize, j: usize) -> usize {
        i + j * self.nrows
    }

    /// Entry `(i, j)` is a constant.
    pub fn is_fixed_at(&self, i: usize, j: usize) -> bool {
        let p = self.pos(i, j);
        self.design.row(p).iter().all(|&d| d == 0.0)
    }

    /// Row `i` contains at least one free entry.
    pub fn row_has_free(&self, i: usize) -> bool {
        (0..self.ncols).any(|j| !self.is_fixed_at(i, j))
    }
}

/// Free parameters of one matrix, with one affine form per time step (Z) or one in total.
#[derive(Debug, Clone)]
pub(crate) struct ParamBlock {
    pub kind: MatrixKind,
    /// Local parameter index -> global index in `ModelSpec::params`.
    pub global: Vec<usize>,
    pub forms: Vec<Affine>,
}

impl ParamBlock {
    pub fn n_local(&self) -> usize {
        self.global.len()
    }

    pub fn form(&self, t: usize) -> &Affine {
        if self.forms.len() == 1 { &self.forms[0] } else { &self.forms[t - 1] }
    }

    /// Local parameters that appear on the diagonal (variances) in any form.
    pub fn diagonal_locals(&self) -> Vec<bool> {
        let n = self.forms.first().map_or(0, |f| f.design.ncols());
        let mut out = vec![false; n];
        for f in &self.forms {
            for i in 0..f.nrows.min(f.ncols) {
                let p = f.pos(i, i);
                for (l, flag) in out.iter_mut().enumerate() {
                    if f.design[(p, l)] != 0.0 {
                        *flag = true;
                    }
                }
            }
        }
        out
    }
}

/// Validated model specification with current parameter values.
///
/// Created once from a [`ModelDeclaration`]; afterwards only parameter values
/// change (through [`ModelSpec::set_parameter`] / [`ModelSpec::set_parameter_values`]
/// or the EM M-step), and every matrix position referencing a changed parameter
/// is re-derived.
#[derive(Debug, Clone)]
pub struct ModelSpec {
    decl: ModelDeclaration,
    params: Vec<Parameter>,
    blocks: [ParamBlock; 6],
    z_cur: Vec<DMatrix<f64>>,
    r_cur: DMatrix<f64>,
    b_cur: DMatrix<f64>,
    q_cur: DMatrix<f64>,
    x0_cur: DVector<f64>,
    v0_cur: DMatrix<f64>,
}

const KINDS: [MatrixKind; 6] =
    [MatrixKind::Z, MatrixKind::R, MatrixKind::B, MatrixKind::Q, MatrixKind::X0, MatrixKind::V0];

fn kind_index(kind: MatrixKind) -> usize {
    match kind {
        MatrixKind::Z => 0,
        MatrixKind::R => 1,
        MatrixKind::B => 2,
        MatrixKind::Q => 3,
        MatrixKind::X0 => 4,
        MatrixKind::V0 => 5,
    }
}

fn cfg_err(msg: impl Into<String>) -> Error {
    Error::Configuration(msg.into())
}

fn check_rectangular(kind: MatrixKind, d: &MatrixDecl) -> Result<(usize, usize)> {
    let nrows = d.nrows();
    let ncols = d.ncols();
    if nrows == 0 || ncols == 0 {
        return Err(cfg_err(format!("{kind} must be non-empty")));
    }
    for (i, r) in d.rows.iter().enumerate() {
        if r.len() != ncols {
            return Err(cfg_err(format!(
                "{kind} must be rectangular: row {i} has len {}, expected {}",
                r.len(),
                ncols
            )));
        }
    }
    Ok((nrows, ncols))
}

struct NameTable {
    names: Vec<String>,
    inits: Vec<Option<f64>>,
    index: HashMap<String, usize>,
    referenced: Vec<String>,
}

fn collect_names(kind: MatrixKind, decls: &[&MatrixDecl]) -> Result<NameTable> {
    let mut t = NameTable { names: Vec::new(), inits: Vec::new(), index: HashMap::new(), referenced: Vec::new() };
    for d in decls {
        for (i, j, e) in d.entries() {
            match e {
                Entry::Fixed(v) => {
                    if !v.is_finite() {
                        return Err(cfg_err(format!("{kind}[{i},{j}]: fixed value must be finite")));
                    }
                }
                Entry::Free { name, init } => {
                    if let Some(v) = init {
                        if !v.is_finite() {
                            return Err(cfg_err(format!("{kind}: initial value of '{name}' must be finite")));
                        }
                    }
                    match t.index.get(name) {
                        Some(&k) => match (t.inits[k], *init) {
                            (Some(a), Some(b)) if a != b => {
                                return Err(cfg_err(format!(
                                    "{kind}: parameter '{name}' declared with conflicting initial values {a} and {b}"
                                )));
                            }
                            (None, Some(b)) => t.inits[k] = Some(b),
                            _ => {}
                        },
                        None => {
                            t.index.insert(name.clone(), t.names.len());
                            t.names.push(name.clone());
                            t.inits.push(*init);
                        }
                    }
                }
                Entry::Shared(name) => t.referenced.push(name.clone()),
                Entry::Linear { offset, terms } => {
                    if !offset.is_finite() || terms.iter().any(|term| !term.coef.is_finite()) {
                        return Err(cfg_err(format!("{kind}[{i},{j}]: linear entry must be finite")));
                    }
                    t.referenced.extend(terms.iter().map(|term| term.name.clone()));
                }
            }
        }
    }
    for name in &t.referenced {
        if !t.index.contains_key(name) {
            return Err(cfg_err(format!(
                "{kind}: parameter '{name}' is referenced but never declared free in {kind}"
            )));
        }
    }
    Ok(t)
}

fn compile(d: &MatrixDecl, names: &NameTable) -> Affine {
    let nrows = d.nrows();
    let ncols = d.ncols();
    let len = nrows * ncols;
    let mut fixed = DVector::<f64>::zeros(len);
    let mut design = DMatrix::<f64>::zeros(len, names.names.len());
    for (i, j, e) in d.entries() {
        let p = i + j * nrows;
        match e {
            Entry::Fixed(v) => fixed[p] = *v,
            Entry::Free { name, .. } | Entry::Shared(name) => design[(p, names.index[name])] = 1.0,
            Entry::Linear { offset, terms } => {
                fixed[p] = *offset;
                for term in terms {
                    design[(p, names.index[&term.name])] += term.coef;
                }
            }
        }
    }
    Affine { nrows, ncols, fixed, design }
}

fn check_symmetric(kind: MatrixKind, a: &Affine) -> Result<()> {
    for i in 0..a.nrows {
        for j in 0..i {
            let (p, q) = (a.pos(i, j), a.pos(j, i));
            if a.fixed[p] != a.fixed[q] || a.design.row(p) != a.design.row(q) {
                return Err(cfg_err(format!(
                    "{kind} must be declared symmetric: entries ({i},{j}) and ({j},{i}) differ"
                )));
            }
        }
    }
    Ok(())
}

impl ModelSpec {
    /// Compile and validate a declaration.
    pub fn new(decl: &ModelDeclaration) -> Result<Self> {
        let z_decls: Vec<&MatrixDecl> = match &decl.z {
            ObservationMatrixDecl::Static(d) => vec![d],
            ObservationMatrixDecl::TimeVarying(ds) => {
                if ds.is_empty() {
                    return Err(cfg_err("time-varying Z must have at least one time step"));
                }
                ds.iter().collect()
            }
        };
        let singles: [(MatrixKind, &MatrixDecl); 5] = [
            (MatrixKind::R, &decl.r),
            (MatrixKind::B, &decl.b),
            (MatrixKind::Q, &decl.q),
            (MatrixKind::X0, &decl.x0),
            (MatrixKind::V0, &decl.v0),
        ];

        // Dimensions.
        let (m, m2) = check_rectangular(MatrixKind::B, &decl.b)?;
        if m != m2 {
            return Err(cfg_err("B must be square (n_state x n_state)"));
        }
        let (k, zm) = check_rectangular(MatrixKind::Z, z_decls[0])?;
        for (t, d) in z_decls.iter().enumerate() {
            let shape = check_rectangular(MatrixKind::Z, d)?;
            if shape != (k, zm) {
                return Err(cfg_err(format!(
                    "Z_{} has shape {:?}, expected {:?}",
                    t + 1,
                    shape,
                    (k, zm)
                )));
            }
        }
        if zm != m {
            return Err(cfg_err(format!("Z must be n_obs x n_state: has {zm} columns, B has {m} rows")));
        }
        let expected = [(k, k), (m, m), (m, m), (m, 1), (m, m)];
        for ((kind, d), exp) in singles.iter().zip(expected) {
            let shape = check_rectangular(*kind, d)?;
            if shape != exp {
                return Err(cfg_err(format!("{kind} has shape {shape:?}, expected {exp:?}")));
            }
        }

        // Names and compiled affine forms.
        let mut params: Vec<Parameter> = Vec::new();
        let mut owner: HashMap<String, MatrixKind> = HashMap::new();
        let mut blocks: Vec<ParamBlock> = Vec::with_capacity(6);
        for kind in KINDS {
            let decls: Vec<&MatrixDecl> = match kind {
                MatrixKind::Z => z_decls.clone(),
                _ => vec![singles[kind_index(kind) - 1].1],
            };
            let names = collect_names(kind, &decls)?;
            let forms: Vec<Affine> = decls.iter().map(|d| compile(d, &names)).collect();
            let mut block = ParamBlock { kind, global: Vec::with_capacity(names.names.len()), forms };
            let diag = block.diagonal_locals();
            for (l, name) in names.names.iter().enumerate() {
                if let Some(other) = owner.get(name) {
                    return Err(cfg_err(format!(
                        "parameter '{name}' is used in both {other} and {kind}; names must belong to one matrix"
                    )));
                }
                owner.insert(name.clone(), kind);
                let default = if kind.is_covariance() && !diag[l] { 0.0 } else { DEFAULT_INIT };
                block.global.push(params.len());
                params.push(Parameter {
                    name: name.clone(),
                    matrix: kind,
                    value: names.inits[l].unwrap_or(default),
                });
            }
            blocks.push(block);
        }
        let blocks: [ParamBlock; 6] = blocks
            .try_into()
            .map_err(|_| cfg_err("internal: expected six parameter blocks"))?;

        for kind in [MatrixKind::R, MatrixKind::Q, MatrixKind::V0] {
            check_symmetric(kind, &blocks[kind_index(kind)].forms[0])?;
        }
        if blocks[kind_index(MatrixKind::V0)].n_local() > 0 {
            return Err(cfg_err("V0 must be fully fixed (it is not estimated)"));
        }

        let mut spec = Self {
            decl: decl.clone(),
            params,
            blocks,
            z_cur: Vec::new(),
            r_cur: DMatrix::zeros(k, k),
            b_cur: DMatrix::zeros(m, m),
            q_cur: DMatrix::zeros(m, m),
            x0_cur: DVector::zeros(m),
            v0_cur: DMatrix::zeros(m, m),
        };
        for kind in KINDS {
            spec.refresh(kind);
        }
        spec.check_structure()?;
        spec.check_covariances()?;
        Ok(spec)
    }

    /// Free entries on rows whose noise is fixed at zero can never be identified.
    fn check_structure(&self) -> Result<()> {
        let pairs = [(MatrixKind::B, MatrixKind::Q), (MatrixKind::Z, MatrixKind::R), (MatrixKind::X0, MatrixKind::V0)];
        for (mean_kind, cov_kind) in pairs {
            let cov = &self.blocks[kind_index(cov_kind)].forms[0];
            let cov_cur = self.cov_matrix(cov_kind);
            for i in 0..cov.nrows {
                let deterministic = cov.is_fixed_at(i, i) && cov_cur[(i, i)] == 0.0;
                if !deterministic {
                    continue;
                }
                let mean = &self.blocks[kind_index(mean_kind)];
                if mean.forms.iter().any(|f| f.row_has_free(i)) {
                    return Err(cfg_err(format!(
                        "{mean_kind} has free entries in row {i}, but {cov_kind}[{i},{i}] is fixed at zero"
                    )));
                }
            }
        }
        Ok(())
    }

    fn cov_matrix(&self, kind: MatrixKind) -> &DMatrix<f64> {
        match kind {
            MatrixKind::R => &self.r_cur,
            MatrixKind::Q => &self.q_cur,
            _ => &self.v0_cur,
        }
    }

    fn check_covariances(&self) -> Result<()> {
        for kind in [MatrixKind::R, MatrixKind::Q, MatrixKind::V0] {
            if !is_psd(self.cov_matrix(kind), PSD_TOL) {
                return Err(cfg_err(format!("{kind} must be positive semi-definite")));
            }
        }
        Ok(())
    }

    fn refresh(&mut self, kind: MatrixKind) {
        let block = &self.blocks[kind_index(kind)];
        let p = DVector::from_iterator(block.n_local(), block.global.iter().map(|&g| self.params[g].value));
        match kind {
            MatrixKind::Z => self.z_cur = block.forms.iter().map(|f| f.eval(&p)).collect(),
            MatrixKind::R => self.r_cur = block.forms[0].eval(&p),
            MatrixKind::B => self.b_cur = block.forms[0].eval(&p),
            MatrixKind::Q => self.q_cur = block.forms[0].eval(&p),
            MatrixKind::X0 => self.x0_cur = block.forms[0].eval(&p).column(0).into_owned(),
            MatrixKind::V0 => self.v0_cur = block.forms[0].eval(&p),
        }
    }

    /// Number of latent state dimensions `m`.
    pub fn n_state(&self) -> usize {
        self.b_cur.nrows()
    }

    /// Number of observed series `k`.
    pub fn n_obs(&self) -> usize {
        self.r_cur.nrows()
    }

    /// Number of declared time steps of a time-varying `Z` (`None` when static).
    pub fn z_periods(&self) -> Option<usize> {
        match self.z_cur.len() {
            1 if matches!(self.decl.z, ObservationMatrixDecl::Static(_)) => None,
            n => Some(n),
        }
    }

    /// `Z_t` for time `t` (1-based). Static models return the same matrix for every t.
    pub fn z(&self, t: usize) -> &DMatrix<f64> {
        if self.z_cur.len() == 1 { &self.z_cur[0] } else { &self.z_cur[t.max(1) - 1] }
    }

    /// Observation noise covariance `R`.
    pub fn r(&self) -> &DMatrix<f64> {
        &self.r_cur
    }

    /// State transition `B`.
    pub fn b(&self) -> &DMatrix<f64> {
        &self.b_cur
    }

    /// Process noise covariance `Q`.
    pub fn q(&self) -> &DMatrix<f64> {
        &self.q_cur
    }

    /// Initial state mean `x0`.
    pub fn x0(&self) -> &DVector<f64> {
        &self.x0_cur
    }

    /// Initial state covariance `V0`.
    pub fn v0(&self) -> &DMatrix<f64> {
        &self.v0_cur
    }

    /// All free parameters with their current values.
    pub fn parameters(&self) -> &[Parameter] {
        &self.params
    }

    /// Number of free parameters.
    pub fn n_parameters(&self) -> usize {
        self.params.len()
    }

    /// Current values in parameter order.
    pub fn parameter_values(&self) -> Vec<f64> {
        self.params.iter().map(|p| p.value).collect()
    }

    /// `true` for parameters that sit on the diagonal of R or Q.
    pub fn variance_mask(&self) -> Vec<bool> {
        let mut out = vec![false; self.params.len()];
        for block in self.blocks.iter().filter(|b| b.kind.is_covariance()) {
            for (l, on_diag) in block.diagonal_locals().into_iter().enumerate() {
                if on_diag {
                    out[block.global[l]] = true;
                }
            }
        }
        out
    }

    /// Current value of a named parameter.
    pub fn parameter(&self, name: &str) -> Option<f64> {
        self.params.iter().find(|p| p.name == name).map(|p| p.value)
    }

    /// Set one parameter and re-derive its matrix.
    pub fn set_parameter(&mut self, name: &str, value: f64) -> Result<()> {
        let idx = self
            .params
            .iter()
            .position(|p| p.name == name)
            .ok_or_else(|| cfg_err(format!("unknown parameter '{name}'")))?;
        let mut values = self.parameter_values();
        values[idx] = value;
        self.set_parameter_values(&values)
    }

    /// Replace all free parameter values and re-derive every matrix.
    ///
    /// On error the specification is left unchanged.
    pub fn set_parameter_values(&mut self, values: &[f64]) -> Result<()> {
        if values.len() != self.params.len() {
            return Err(cfg_err(format!(
                "expected {} parameter values, got {}",
                self.params.len(),
                values.len()
            )));
        }
        if let Some(i) = values.iter().position(|v| !v.is_finite()) {
            return Err(cfg_err(format!("parameter '{}' must be finite", self.params[i].name)));
        }
        let mut next = self.clone();
        for (p, &v) in next.params.iter_mut().zip(values) {
            p.value = v;
        }
        for kind in KINDS {
            next.refresh(kind);
        }
        next.check_covariances()?;
        *self = next;
        Ok(())
    }

    pub(crate) fn block(&self, kind: MatrixKind) -> &ParamBlock {
        &self.blocks[kind_index(kind)]
    }

    /// Local parameter vector of one matrix.
    pub(crate) fn block_values(&self, kind: MatrixKind) -> DVector<f64> {
        let block = self.block(kind);
        DVector::from_iterator(block.n_local(), block.global.iter().map(|&g| self.params[g].value))
    }

    /// Write back the local parameters of one matrix (M-step). No PSD check: the caller
    /// validates the re-estimated covariance itself.
    pub(crate) fn set_block_values(&mut self, kind: MatrixKind, local: &DVector<f64>) {
        let globals = self.block(kind).global.clone();
        for (l, g) in globals.into_iter().enumerate() {
            self.params[g].value = local[l];
        }
        self.refresh(kind);
    }

    /// The original declaration with every free entry's initial value replaced by the
    /// current estimate, suitable for serializing a fitted model.
    pub fn to_declaration(&self) -> ModelDeclaration {
        let values: HashMap<&str, f64> = self.params.iter().map(|p| (p.name.as_str(), p.value)).collect();
        let update = |d: &MatrixDecl| {
            let mut out = d.clone();
            for row in out.rows.iter_mut() {
                for e in row.iter_mut() {
                    if let Entry::Free { name, init } = e {
                        *init = values.get(name.as_str()).copied();
                    }
                }
            }
            out
        };
        ModelDeclaration {
            z: match &self.decl.z {
                ObservationMatrixDecl::Static(d) => ObservationMatrixDecl::Static(update(d)),
                ObservationMatrixDecl::TimeVarying(ds) => {
                    ObservationMatrixDecl::TimeVarying(ds.iter().map(update).collect())
                }
            },
            r: update(&self.decl.r),
            b: update(&self.decl.b),
            q: update(&self.decl.q),
            x0: update(&self.decl.x0),
            v0: update(&self.decl.v0),
        }
    }
}

impl Parameterized for ModelSpec {
    fn n_parameters(&self) -> usize {
        ModelSpec::n_parameters(self)
    }

    fn parameter_names(&self) -> Vec<String> {
        self.parameters().iter().map(|p| p.name.clone()).collect()
    }

    fn parameter_values(&self) -> Vec<f64> {
        ModelSpec::parameter_values(self)
    }
}
