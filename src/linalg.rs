//! Sparse helpers and the linear-solver seam.
//!
//! The adjoint core never factors matrices itself beyond what is needed to
//! stand in for the external solver: a symmetric `sprs-ldl` path (same as
//! the forward solve) and a dense LU for non-symmetric transposed tangents.

use crate::types::{AdjointError, BoundaryNodeSet, Result};
use ndarray::{Array1, Array2, ArrayView1};
use sprs::{CsMat, CsMatView, FillInReduction, SymmetryCheck, TriMat};
use sprs_ldl::{Ldl, LdlNumeric};
use std::fmt::Debug;

// ─────────────────────────────────────────────────────────────
//  Sparse traversal
// ─────────────────────────────────────────────────────────────

/// Visit every stored entry as `(row, col, value)`, whatever the storage.
pub fn for_each_entry<F>(mat: &CsMat<f64>, mut f: F)
where
    F: FnMut(usize, usize, f64),
{
    let csc = mat.is_csc();
    for (outer, lane) in mat.outer_iterator().enumerate() {
        for (inner, &val) in lane.iter() {
            if csc {
                f(inner, outer, val);
            } else {
                f(outer, inner, val);
            }
        }
    }
}

/// y = A x
pub fn spmv(a: &CsMat<f64>, x: ArrayView1<f64>) -> Array1<f64> {
    let mut y = Array1::zeros(a.rows());
    for_each_entry(a, |r, c, v| y[r] += v * x[c]);
    y
}

/// y = Aᵀ x, without forming the transpose.
pub fn spmv_transpose(a: &CsMat<f64>, x: ArrayView1<f64>) -> Array1<f64> {
    let mut y = Array1::zeros(a.cols());
    for_each_entry(a, |r, c, v| y[c] += v * x[r]);
    y
}

/// Explicit transpose in CSC storage.
pub fn transpose(a: &CsMat<f64>) -> CsMat<f64> {
    a.transpose_view().to_csc()
}

pub fn to_dense(a: &CsMat<f64>) -> Array2<f64> {
    let mut d = Array2::zeros((a.rows(), a.cols()));
    for_each_entry(a, |r, c, v| d[[r, c]] += v);
    d
}

/// Sparse identity.
pub fn identity(n: usize) -> CsMat<f64> {
    CsMat::eye(n).to_csc()
}

/// Restrict `a` to the free rows and columns of `boundary`.
pub fn restrict_to_free(a: &CsMat<f64>, boundary: &BoundaryNodeSet) -> CsMat<f64> {
    let map = boundary.full_to_reduced();
    let n = map.iter().flatten().count();
    let mut tri = TriMat::new((n, n));
    for_each_entry(a, |r, c, v| {
        if let (Some(rr), Some(cc)) = (map[r], map[c]) {
            tri.add_triplet(rr, cc, v);
        }
    });
    tri.to_csc()
}

/// Symmetric elimination of Dirichlet DOFs: rows *and* columns in
/// `boundary` become identity.  Valid as a solve operator whenever the
/// right-hand side is zero on the boundary.
pub fn eliminate_symmetric(a: &CsMat<f64>, boundary: &BoundaryNodeSet) -> CsMat<f64> {
    let mut tri = TriMat::with_capacity((a.rows(), a.cols()), a.nnz());
    for_each_entry(a, |r, c, v| {
        if !boundary.contains(r) && !boundary.contains(c) {
            tri.add_triplet(r, c, v);
        }
    });
    for &b in boundary.indices() {
        tri.add_triplet(b, b, 1.0);
    }
    tri.to_csc()
}

/// Entry-wise symmetry check, relative to the largest magnitude in `a`.
///
/// Each stored entry is compared with its mirror, so an entry whose mirror
/// is not stored counts against zero.
pub fn is_symmetric(a: &CsMat<f64>, rel_tol: f64) -> bool {
    if a.rows() != a.cols() {
        return false;
    }
    let tol = rel_tol * a.data().iter().fold(0.0_f64, |m, v| m.max(v.abs())).max(1.0);
    let mut symmetric = true;
    for_each_entry(a, |r, c, v| {
        if symmetric && r != c {
            let mirror = a.get(c, r).copied().unwrap_or(0.0);
            symmetric = (v - mirror).abs() <= tol;
        }
    });
    symmetric
}

// ─────────────────────────────────────────────────────────────
//  Linear solver seam
// ─────────────────────────────────────────────────────────────

/// A factor-once / solve-many linear solver.
///
/// Implementations stand in for the external sparse-solver component.
/// Factorisation failure and singular pivots are hard errors.
pub trait LinearSolver: Debug + Send + Sync {
    /// Factor `a`, replacing any previous factorisation.
    fn factorize(&mut self, a: CsMatView<f64>) -> Result<()>;

    /// Solve `A x = rhs` against the current factorisation.
    fn solve(&self, rhs: &[f64]) -> Result<Vec<f64>>;

    /// Backend name, as accepted by [`create_solver`].
    fn name(&self) -> &'static str;
}

/// Build a backend from its configuration name.
///
/// Accepts `"ldl"`, `"cholesky"` and `"dense_lu"` plus the Eigen-style
/// aliases found in older configuration files.
pub fn create_solver(name: &str) -> Result<Box<dyn LinearSolver>> {
    match name.to_ascii_lowercase().as_str() {
        "ldl" | "eigen::simplicialldlt" => Ok(Box::new(LdlSolver::new(FactorisationStrategy::LDL))),
        "cholesky" | "eigen::simplicialllt" => {
            Ok(Box::new(LdlSolver::new(FactorisationStrategy::Cholesky)))
        }
        "dense_lu" | "lu" | "eigen::sparselu" | "eigen::partialpivlu" => {
            Ok(Box::new(DenseLuSolver::default()))
        }
        other => Err(AdjointError::Config(format!("unknown linear solver '{other}'"))),
    }
}

// ─────────────────────────────────────────────────────────────
//  Symmetric factorisation (sprs-ldl)
// ─────────────────────────────────────────────────────────────

/// Cholesky when the matrix is known SPD; LDL for symmetric indefinite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FactorisationStrategy {
    /// AMD-style fill reduction, D > 0 validated.
    Cholesky,
    /// No sign constraint on D.
    LDL,
}

/// Holds a numeric LDLᵀ factorisation.
///
/// Only symmetric input is accepted: `sprs-ldl` reads one triangle, so a
/// non-symmetric matrix would silently solve the wrong system.
pub struct LdlSolver {
    strategy: FactorisationStrategy,
    numeric: Option<LdlNumeric<f64, usize>>,
}

impl Debug for LdlSolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.strategy, self.numeric.is_some()) {
            (FactorisationStrategy::Cholesky, true) => write!(f, "LdlSolver::Cholesky(...)"),
            (FactorisationStrategy::LDL, true) => write!(f, "LdlSolver::Ldl(...)"),
            (_, false) => write!(f, "LdlSolver(unfactorized)"),
        }
    }
}

impl LdlSolver {
    pub fn new(strategy: FactorisationStrategy) -> Self {
        Self {
            strategy,
            numeric: None,
        }
    }

    pub fn strategy(&self) -> FactorisationStrategy {
        self.strategy
    }
}

impl LinearSolver for LdlSolver {
    fn factorize(&mut self, a: CsMatView<f64>) -> Result<()> {
        let owned = a.to_csc();
        if !is_symmetric(&owned, 1e-12) {
            return Err(AdjointError::Config(format!(
                "{} backend requires a symmetric matrix",
                self.name()
            )));
        }
        let ldl = Ldl::new()
            .fill_in_reduction(FillInReduction::ReverseCuthillMcKee)
            .check_symmetry(SymmetryCheck::DontCheckSymmetry)
            .numeric(owned.view())?;
        if self.strategy == FactorisationStrategy::Cholesky {
            for (i, &di) in ldl.d().iter().enumerate() {
                if di <= 0.0 {
                    return Err(AdjointError::Linalg(sprs::errors::LinalgError::SingularMatrix(
                        sprs::errors::SingularMatrixInfo {
                            index: i,
                            reason: "D <= 0 in Cholesky factorization (not SPD)",
                        },
                    )));
                }
            }
        }
        self.numeric = Some(ldl);
        Ok(())
    }

    fn solve(&self, rhs: &[f64]) -> Result<Vec<f64>> {
        let ldl = self.numeric.as_ref().ok_or(AdjointError::MissingFactorization)?;
        let x = ldl.solve(rhs);
        if x.iter().any(|v| !v.is_finite()) {
            return Err(AdjointError::Singular { index: 0 });
        }
        Ok(x)
    }

    fn name(&self) -> &'static str {
        match self.strategy {
            FactorisationStrategy::Cholesky => "cholesky",
            FactorisationStrategy::LDL => "ldl",
        }
    }
}

// ─────────────────────────────────────────────────────────────
//  Dense LU (non-symmetric fallback)
// ─────────────────────────────────────────────────────────────

/// Gaussian elimination with partial pivoting on a dense copy.
///
/// Adequate for the moderate reduced systems of the adjoint tests and for
/// transposed tangents that lose symmetry (friction, convection).
#[derive(Debug, Default)]
pub struct DenseLuSolver {
    lu: Option<Array2<f64>>,
    perm: Vec<usize>,
}

impl LinearSolver for DenseLuSolver {
    fn factorize(&mut self, a: CsMatView<f64>) -> Result<()> {
        let a = a.to_csc();
        if a.rows() != a.cols() {
            return Err(AdjointError::Shape(format!(
                "cannot factor a {}x{} matrix",
                a.rows(),
                a.cols()
            )));
        }
        let n = a.rows();
        let mut m = to_dense(&a);
        let mut perm: Vec<usize> = (0..n).collect();
        let scale = m.iter().fold(0.0_f64, |acc, v| acc.max(v.abs()));
        let tol = f64::EPSILON * scale * (n.max(1) as f64);

        for col in 0..n {
            let mut max_row = col;
            let mut max_val = m[[col, col]].abs();
            for row in (col + 1)..n {
                let v = m[[row, col]].abs();
                if v > max_val {
                    max_val = v;
                    max_row = row;
                }
            }
            if max_val <= tol || !max_val.is_finite() {
                self.lu = None;
                return Err(AdjointError::Singular { index: col });
            }
            if max_row != col {
                for j in 0..n {
                    m.swap([col, j], [max_row, j]);
                }
                perm.swap(col, max_row);
            }
            let pivot = m[[col, col]];
            for row in (col + 1)..n {
                let factor = m[[row, col]] / pivot;
                m[[row, col]] = factor;
                if factor != 0.0 {
                    for j in (col + 1)..n {
                        m[[row, j]] -= factor * m[[col, j]];
                    }
                }
            }
        }

        self.lu = Some(m);
        self.perm = perm;
        Ok(())
    }

    fn solve(&self, rhs: &[f64]) -> Result<Vec<f64>> {
        let m = self.lu.as_ref().ok_or(AdjointError::MissingFactorization)?;
        let n = m.nrows();
        if rhs.len() != n {
            return Err(AdjointError::Shape(format!(
                "rhs has {} entries, factorisation is {n}x{n}",
                rhs.len()
            )));
        }
        let mut x: Vec<f64> = self.perm.iter().map(|&p| rhs[p]).collect();

        // forward substitution (unit lower)
        for i in 0..n {
            for j in 0..i {
                x[i] -= m[[i, j]] * x[j];
            }
        }
        // back substitution
        for i in (0..n).rev() {
            for j in (i + 1)..n {
                x[i] -= m[[i, j]] * x[j];
            }
            x[i] /= m[[i, i]];
        }
        Ok(x)
    }

    fn name(&self) -> &'static str {
        "dense_lu"
    }
}
