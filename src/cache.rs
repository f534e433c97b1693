//! Per-step forward cache.
//!
//! The forward collaborator pushes one [`StepInput`] per completed step.
//! Records are append-only: record `k−1` is *closed* when record `k`
//! arrives, because only then is the coupling "step k−1 → step k" known.
//! The adjoint solvers borrow the cache immutably, so nothing can be
//! appended once a backward pass has started.

use crate::bc::{replace_rows_with_identity, zero_rows};
use crate::linalg::{create_solver, eliminate_symmetric, transpose, LinearSolver};
use crate::types::{AdjointError, BoundaryNodeSet, ConstraintSnapshot, Result};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use sprs::CsMat;
use std::sync::Arc;
use tracing::{debug, trace};

// ─────────────────────────────────────────────────────────────
//  Inbound step data
// ─────────────────────────────────────────────────────────────

/// What the forward solve hands over after finishing a step.
#[derive(Debug, Clone)]
pub struct StepInput {
    /// ∂R_k/∂u_k at the converged state.
    pub tangent: CsMat<f64>,
    /// ∂R_k/∂u_{k−1}; `None` means no coupling (always `None` at step 0).
    pub tangent_prev: Option<CsMat<f64>>,
    pub state: Array1<f64>,
    /// Displacement gradient (or any per-step auxiliary matrix).
    pub aux_grad: Array2<f64>,
    pub constraints: ConstraintSnapshot,
}

impl StepInput {
    /// A step with no previous-state coupling and no active constraints.
    pub fn new(tangent: CsMat<f64>, state: Array1<f64>) -> Self {
        Self {
            tangent,
            tangent_prev: None,
            state,
            aux_grad: Array2::zeros((0, 0)),
            constraints: ConstraintSnapshot::default(),
        }
    }

    pub fn with_tangent_prev(mut self, tangent_prev: CsMat<f64>) -> Self {
        self.tangent_prev = Some(tangent_prev);
        self
    }

    pub fn with_aux_grad(mut self, aux_grad: Array2<f64>) -> Self {
        self.aux_grad = aux_grad;
        self
    }

    pub fn with_constraints(mut self, constraints: ConstraintSnapshot) -> Self {
        self.constraints = constraints;
        self
    }
}

// ─────────────────────────────────────────────────────────────
//  Stored record
// ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ForwardStepRecord {
    tangent: CsMat<f64>,
    tangent_prev: Option<CsMat<f64>>,
    next_coupling: Option<CsMat<f64>>,
    state: Array1<f64>,
    aux_grad: Array2<f64>,
    constraints: ConstraintSnapshot,
    closed: bool,
}

impl ForwardStepRecord {
    /// Tangent with Dirichlet rows already replaced by identity rows.
    pub fn tangent(&self) -> &CsMat<f64> {
        &self.tangent
    }

    /// Raw ∂R_k/∂u_{k−1} as pushed.
    pub fn tangent_prev(&self) -> Option<&CsMat<f64>> {
        self.tangent_prev.as_ref()
    }

    /// ∂R_{k+1}/∂u_k with Dirichlet rows zeroed, set when the record closes.
    pub fn next_coupling(&self) -> Option<&CsMat<f64>> {
        self.next_coupling.as_ref()
    }

    pub fn state(&self) -> ArrayView1<'_, f64> {
        self.state.view()
    }

    pub fn aux_grad(&self) -> ArrayView2<'_, f64> {
        self.aux_grad.view()
    }

    pub fn constraints(&self) -> &ConstraintSnapshot {
        &self.constraints
    }

    /// `true` once the following step exists.
    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

// ─────────────────────────────────────────────────────────────
//  Cache
// ─────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct ForwardCache {
    boundary: Arc<BoundaryNodeSet>,
    records: Vec<ForwardStepRecord>,
    prefactorized: Option<Box<dyn LinearSolver>>,
}

impl ForwardCache {
    pub fn new(boundary: Arc<BoundaryNodeSet>) -> Self {
        Self {
            boundary,
            records: Vec::new(),
            prefactorized: None,
        }
    }

    pub fn boundary(&self) -> &BoundaryNodeSet {
        &self.boundary
    }

    pub fn ndof(&self) -> usize {
        self.boundary.ndof()
    }

    /// Drop every record and the prefactorisation.  Called at step 0 of
    /// each forward solve.
    pub fn clear(&mut self) {
        if !self.records.is_empty() {
            debug!(steps = self.records.len(), "clearing forward cache");
        }
        self.records.clear();
        self.prefactorized = None;
    }

    /// Append step `len()` and close the previous record.
    ///
    /// Returns the index of the new record.
    pub fn push(&mut self, input: StepInput) -> Result<usize> {
        let n = self.ndof();
        let step = self.records.len();

        if input.tangent.shape() != (n, n) {
            return Err(AdjointError::DataConsistency(format!(
                "step {step}: tangent is {}x{}, expected {n}x{n}",
                input.tangent.rows(),
                input.tangent.cols()
            )));
        }
        if input.state.len() != n {
            return Err(AdjointError::DataConsistency(format!(
                "step {step}: state has {} entries, expected {n}",
                input.state.len()
            )));
        }
        if let Some(prev) = &input.tangent_prev {
            if step == 0 {
                return Err(AdjointError::DataConsistency(
                    "step 0 cannot depend on a previous step".into(),
                ));
            }
            if prev.shape() != (n, n) {
                return Err(AdjointError::DataConsistency(format!(
                    "step {step}: previous-state tangent is {}x{}, expected {n}x{n}",
                    prev.rows(),
                    prev.cols()
                )));
            }
        }

        trace!(step, nnz = input.tangent.nnz(), "caching forward step");
        self.records.push(ForwardStepRecord {
            tangent: replace_rows_with_identity(&input.tangent, &self.boundary),
            tangent_prev: input.tangent_prev,
            next_coupling: None,
            state: input.state,
            aux_grad: input.aux_grad,
            constraints: input.constraints,
            closed: false,
        });

        if step > 0 {
            self.finalize(step - 1)?;
        }
        Ok(step)
    }

    /// Close record `step` using the previous-state tangent of `step + 1`.
    ///
    /// Idempotent.  Fails if `step + 1` has not been pushed yet.
    pub fn finalize(&mut self, step: usize) -> Result<()> {
        let coupling = match self.records.get(step + 1) {
            Some(next) => next.tangent_prev.as_ref().map(|m| zero_rows(m, &self.boundary)),
            None => {
                return Err(AdjointError::DataConsistency(format!(
                    "cannot finalize step {step}: step {} not cached",
                    step + 1
                )))
            }
        };
        let rec = &mut self.records[step];
        rec.next_coupling = coupling;
        rec.closed = true;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, step: usize) -> Option<&ForwardStepRecord> {
        self.records.get(step)
    }

    pub fn records(&self) -> &[ForwardStepRecord] {
        &self.records
    }

    /// Record `step`, or an error naming the missing step.
    pub fn record(&self, step: usize) -> Result<&ForwardStepRecord> {
        if self.records.is_empty() {
            return Err(AdjointError::EmptyForwardCache);
        }
        self.records.get(step).ok_or_else(|| {
            AdjointError::DataConsistency(format!(
                "step {step} requested, forward cache holds {} steps",
                self.records.len()
            ))
        })
    }

    /// State at `step`.
    pub fn u(&self, step: usize) -> Result<ArrayView1<'_, f64>> {
        Ok(self.record(step)?.state())
    }

    pub fn disp_grad(&self, step: usize) -> Result<ArrayView2<'_, f64>> {
        Ok(self.record(step)?.aux_grad())
    }

    pub fn constraints(&self, step: usize) -> Result<&ConstraintSnapshot> {
        Ok(self.record(step)?.constraints())
    }

    // ── prefactorisation ────────────────────────────────────────

    /// Hand over a factorisation of the step-0 operator built by the
    /// forward solve (Dirichlet rows and columns eliminated).
    pub fn set_prefactorized(&mut self, solver: Box<dyn LinearSolver>) {
        debug!(backend = solver.name(), "prefactorization handed over");
        self.prefactorized = Some(solver);
    }

    /// Factor the transposed step-0 tangent with Dirichlet rows and
    /// columns eliminated, using backend `name`.
    pub fn prefactorize(&mut self, name: &str) -> Result<()> {
        let rec = self.records.first().ok_or(AdjointError::EmptyForwardCache)?;
        let op = eliminate_symmetric(&transpose(rec.tangent()), &self.boundary);
        let mut solver = create_solver(name)?;
        solver.factorize(op.view())?;
        debug!(backend = solver.name(), ndof = op.rows(), "prefactorized step 0");
        self.prefactorized = Some(solver);
        Ok(())
    }

    pub fn prefactorized(&self) -> Option<&dyn LinearSolver> {
        self.prefactorized.as_deref()
    }
}
