//! Total design gradient of a set of objectives.
//!
//! For each objective:
//!   1. Explicit `∂J/∂x` with the state held fixed
//!   2. Adjoint solve against `∂J/∂u` on the objective's simulation
//!   3. Each variable driving that simulation contracts the adjoint with
//!      its residual sensitivity and pulls the result back through its
//!      parametrization
//!
//! Objectives with a zero state derivative skip step 2.

use crate::objectives::{AdjointForm, FormContext};
use crate::types::{AdjointError, Result};
use ndarray::{Array1, ArrayView1};
use tracing::{debug, trace};

// ─────────────────────────────────────────────────────────────
//  Single objective
// ─────────────────────────────────────────────────────────────

/// Weighted `dJ/dx` of one objective.
pub fn form_gradient(form: &dyn AdjointForm, x: ArrayView1<f64>, ctx: &FormContext) -> Result<Array1<f64>> {
    let mut grad = form.partial_gradient(x, ctx)?;
    if grad.len() != x.len() {
        return Err(AdjointError::Shape(format!(
            "{} partial gradient has {} entries for {} variables",
            form.name(),
            grad.len(),
            x.len()
        )));
    }

    let sim = ctx.simulation(form.simulation())?;
    let rhs = form.adjoint_rhs(x, ctx)?;
    if rhs.iter().all(|&v| v == 0.0) {
        trace!(form = form.name(), "no state dependence, skipping adjoint");
        return Ok(grad);
    }

    let adjoint = sim.solve_adjoint(rhs.view())?;
    for v in ctx.variables_for(sim.id()) {
        let sensitivity = sim.sensitivity(v.kind()).ok_or_else(|| {
            AdjointError::Config(format!(
                "simulation {} has no residual sensitivity for {:?} parameters",
                sim.id().0,
                v.kind()
            ))
        })?;
        let term = sensitivity.adjoint_term(sim, &adjoint)?;
        grad += &v.apply_parametrization_jacobian(term.view(), x)?;
    }
    Ok(grad)
}

// ─────────────────────────────────────────────────────────────
//  Objective sums
// ─────────────────────────────────────────────────────────────

/// Refresh every objective for `x`, then return `Σ J` and `Σ dJ/dx`.
pub fn value_and_gradient(
    forms: &mut [Box<dyn AdjointForm>],
    x: ArrayView1<f64>,
    ctx: &FormContext,
) -> Result<(f64, Array1<f64>)> {
    for form in forms.iter_mut() {
        form.solution_changed(x, ctx)?;
    }

    let mut value = 0.0;
    let mut grad = Array1::zeros(x.len());
    for form in forms.iter() {
        let j = form.value(x, ctx)?;
        debug!(form = form.name(), value = j, "objective term");
        value += j;
        grad += &form_gradient(form.as_ref(), x, ctx)?;
    }
    Ok((value, grad))
}

/// `true` only if every objective accepts the step `x0 → x1`.
pub fn is_step_collision_free(
    forms: &[Box<dyn AdjointForm>],
    x0: ArrayView1<f64>,
    x1: ArrayView1<f64>,
    ctx: &FormContext,
) -> Result<bool> {
    for form in forms {
        if !form.is_step_collision_free(x0, x1, ctx)? {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Smallest admissible step fraction over all objectives.
pub fn max_step_size(
    forms: &[Box<dyn AdjointForm>],
    x0: ArrayView1<f64>,
    x1: ArrayView1<f64>,
    ctx: &FormContext,
) -> Result<f64> {
    let mut alpha = 1.0_f64;
    for form in forms {
        alpha = alpha.min(form.max_step_size(x0, x1, ctx)?);
    }
    Ok(alpha)
}
