use std::collections::BTreeSet;
use std::path::PathBuf;
use thiserror::Error;

// ─────────────────────────────────────────────────────────────
//  Error type
// ─────────────────────────────────────────────────────────────

/// Unified error type for all fallible operations in the crate.
///
/// Every public function returns `Result<T, AdjointError>`.  None of these
/// are recovered inside the crate: a failed adjoint solve is a failed
/// gradient, and the caller decides whether to skip the design iteration.
#[derive(Debug, Error)]
pub enum AdjointError {
    /// Invalid or unsupported setup (unknown solver, bad BDF order,
    /// unsupported shape derivative, size mismatch against the mesh).
    #[error("configuration error: {0}")]
    Config(String),

    /// Inputs disagree with each other (reference vs. current mesh,
    /// forward-step input vs. cache dimension).
    #[error("data consistency error: {0}")]
    DataConsistency(String),

    /// Sparse factorisation failure (singular / not-SPD matrix, etc.).
    #[error("linear algebra error: {0}")]
    Linalg(#[from] sprs::errors::LinalgError),

    /// Zero pivot encountered by a dense factorisation.
    #[error("singular matrix: zero pivot in column {index}")]
    Singular { index: usize },

    /// The constant-coefficient fast path was requested but no matching
    /// prefactorisation is held by the forward cache.
    #[error("prefactorization not available (forward cache was cleared or never factorized)")]
    MissingFactorization,

    /// Backward pass requested before any forward step was recorded.
    #[error("forward cache is empty (run the forward solve first)")]
    EmptyForwardCache,

    /// Shape mismatch in input data.
    #[error("shape error: {0}")]
    Shape(String),

    /// A lazily-built cache was queried before its first build.
    #[error("not initialized: {0}")]
    NotInitialized(&'static str),

    /// Referenced file is missing or is not a regular file.
    #[error("missing external data: {}", .0.display())]
    MissingData(PathBuf),

    #[error("parse error in {path}: line {line}: {msg}")]
    Parse { path: String, line: usize, msg: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, AdjointError>;

// ─────────────────────────────────────────────────────────────
//  Constants
// ─────────────────────────────────────────────────────────────

/// Highest BDF order with tabulated coefficients.
pub const MAX_BDF_ORDER: usize = 6;

/// Default number of samples per parametric direction for spline targets.
pub const DEFAULT_SPLINE_SAMPLES: usize = 100;

// ─────────────────────────────────────────────────────────────
//  Simulation handle
// ─────────────────────────────────────────────────────────────

/// Index of a simulation inside the slice handed to the objective layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SimulationId(pub usize);

// ─────────────────────────────────────────────────────────────
//  Dirichlet DOFs
// ─────────────────────────────────────────────────────────────

/// Degree-of-freedom indices with prescribed (Dirichlet) values.
///
/// Stored sorted and deduplicated together with a dense membership mask so
/// both "iterate over B" and "is row r in B" are cheap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundaryNodeSet {
    ndof: usize,
    indices: Vec<usize>,
    mask: Vec<bool>,
}

impl BoundaryNodeSet {
    pub fn new(ndof: usize, indices: impl IntoIterator<Item = usize>) -> Result<Self> {
        let sorted: BTreeSet<usize> = indices.into_iter().collect();
        let mut mask = vec![false; ndof];
        for &i in &sorted {
            if i >= ndof {
                return Err(AdjointError::Shape(format!(
                    "boundary dof {i} out of range for {ndof} dofs"
                )));
            }
            mask[i] = true;
        }
        Ok(Self {
            ndof,
            indices: sorted.into_iter().collect(),
            mask,
        })
    }

    /// No Dirichlet conditions.
    pub fn empty(ndof: usize) -> Self {
        Self {
            ndof,
            indices: Vec::new(),
            mask: vec![false; ndof],
        }
    }

    /// Fix every component of the given nodes (`dim` DOFs per node).
    pub fn from_nodes(ndof: usize, dim: usize, nodes: &[usize]) -> Result<Self> {
        Self::new(
            ndof,
            nodes.iter().flat_map(|&n| (0..dim).map(move |d| n * dim + d)),
        )
    }

    #[inline]
    pub fn contains(&self, dof: usize) -> bool {
        self.mask.get(dof).copied().unwrap_or(false)
    }

    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    pub fn mask(&self) -> &[bool] {
        &self.mask
    }

    pub fn ndof(&self) -> usize {
        self.ndof
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Free DOFs in increasing order.
    pub fn free_dofs(&self) -> Vec<usize> {
        (0..self.ndof).filter(|&i| !self.mask[i]).collect()
    }

    /// Full-index → reduced-index map (`None` for Dirichlet DOFs).
    pub fn full_to_reduced(&self) -> Vec<Option<usize>> {
        let mut next = 0;
        self.mask
            .iter()
            .map(|&fixed| {
                if fixed {
                    None
                } else {
                    next += 1;
                    Some(next - 1)
                }
            })
            .collect()
    }
}

// ─────────────────────────────────────────────────────────────
//  Contact / friction snapshots
// ─────────────────────────────────────────────────────────────

/// Which primitives a contact pair joins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContactKind {
    /// `primitives` are two surface vertices.
    VertexVertex,
    /// `primitives` are a surface vertex and an edge index.
    VertexEdge,
}

/// An active contact pair between two surface primitives.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContactPair {
    pub kind: ContactKind,
    pub primitives: [usize; 2],
    pub distance: f64,
}

/// A lagged friction pair: the normal force magnitude and the tangent basis
/// are frozen at the step they were captured.
#[derive(Debug, Clone, PartialEq)]
pub struct FrictionPair {
    pub primitives: [usize; 2],
    pub normal_force: f64,
    pub tangent_basis: Vec<f64>,
}

/// Contact and friction constraint sets active at one forward step.
///
/// Only meaningful for the step it was captured at; geometry updates after
/// the forward solve would yield a different set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConstraintSnapshot {
    pub contact: Vec<ContactPair>,
    pub friction: Vec<FrictionPair>,
}

impl ConstraintSnapshot {
    pub fn is_empty(&self) -> bool {
        self.contact.is_empty() && self.friction.is_empty()
    }
}
