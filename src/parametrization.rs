//! Design-variable → simulation chain rule.
//!
//! A [`VariableToSimulation`] says which slice of simulation parameters a
//! design vector `x` drives, through which [`Parametrization`].  Gradients
//! come back through `apply_jacobian` (a Jᵀ-vector product), so no Jacobian
//! is ever formed.
//!
//! The state-mediated part of a gradient is produced per simulation by a
//! [`ResidualSensitivity`], which contracts the adjoint against ∂R/∂θ.

use crate::adjoint::AdjointSolution;
use crate::bdf;
use crate::simulation::Simulation;
use crate::types::{AdjointError, Result, SimulationId};
use ndarray::{concatenate, s, Array1, ArrayView1, Axis};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterType {
    Shape,
    Material,
    InitialCondition,
    DirichletBoundary,
    NodalLoad,
}

// ─────────────────────────────────────────────────────────────
//  Parametrizations
// ─────────────────────────────────────────────────────────────

pub trait Parametrization: Debug + Send + Sync {
    /// Output length for an input of length `input_size`.
    fn size(&self, input_size: usize) -> usize;

    fn eval(&self, x: ArrayView1<f64>) -> Result<Array1<f64>>;

    /// `Jᵀ grad`, where `grad` lives in output space and `J = ∂eval/∂x`.
    fn apply_jacobian(&self, grad: ArrayView1<f64>, x: ArrayView1<f64>) -> Result<Array1<f64>>;
}

fn check_len(what: &str, got: usize, expected: usize) -> Result<()> {
    if got != expected {
        return Err(AdjointError::Shape(format!("{what}: length {got}, expected {expected}")));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Identity;

impl Parametrization for Identity {
    fn size(&self, input_size: usize) -> usize {
        input_size
    }

    fn eval(&self, x: ArrayView1<f64>) -> Result<Array1<f64>> {
        Ok(x.to_owned())
    }

    fn apply_jacobian(&self, grad: ArrayView1<f64>, x: ArrayView1<f64>) -> Result<Array1<f64>> {
        check_len("identity gradient", grad.len(), x.len())?;
        Ok(grad.to_owned())
    }
}

/// `x[start..end]`.
#[derive(Debug, Clone, Copy)]
pub struct Slice {
    pub start: usize,
    pub end: usize,
}

impl Slice {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    fn check(&self, n: usize) -> Result<()> {
        if self.start > self.end || self.end > n {
            return Err(AdjointError::Shape(format!(
                "slice {}..{} out of range for {n} variables",
                self.start, self.end
            )));
        }
        Ok(())
    }
}

impl Parametrization for Slice {
    fn size(&self, _input_size: usize) -> usize {
        self.end.saturating_sub(self.start)
    }

    fn eval(&self, x: ArrayView1<f64>) -> Result<Array1<f64>> {
        self.check(x.len())?;
        Ok(x.slice(s![self.start..self.end]).to_owned())
    }

    fn apply_jacobian(&self, grad: ArrayView1<f64>, x: ArrayView1<f64>) -> Result<Array1<f64>> {
        self.check(x.len())?;
        check_len("slice gradient", grad.len(), self.end - self.start)?;
        let mut out = Array1::zeros(x.len());
        out.slice_mut(s![self.start..self.end]).assign(&grad);
        Ok(out)
    }
}

/// Entry-wise `scale · x + offset`.
#[derive(Debug, Clone, Copy)]
pub struct Affine {
    pub scale: f64,
    pub offset: f64,
}

impl Parametrization for Affine {
    fn size(&self, input_size: usize) -> usize {
        input_size
    }

    fn eval(&self, x: ArrayView1<f64>) -> Result<Array1<f64>> {
        Ok(x.mapv(|v| self.scale * v + self.offset))
    }

    fn apply_jacobian(&self, grad: ArrayView1<f64>, x: ArrayView1<f64>) -> Result<Array1<f64>> {
        check_len("affine gradient", grad.len(), x.len())?;
        Ok(grad.mapv(|g| self.scale * g))
    }
}

/// Entry-wise `exp(x)`; keeps material parameters positive.
#[derive(Debug, Clone, Copy, Default)]
pub struct Exponential;

impl Parametrization for Exponential {
    fn size(&self, input_size: usize) -> usize {
        input_size
    }

    fn eval(&self, x: ArrayView1<f64>) -> Result<Array1<f64>> {
        Ok(x.mapv(f64::exp))
    }

    fn apply_jacobian(&self, grad: ArrayView1<f64>, x: ArrayView1<f64>) -> Result<Array1<f64>> {
        check_len("exponential gradient", grad.len(), x.len())?;
        Ok(&grad * &x.mapv(f64::exp))
    }
}

/// Applies its parts in order: `p_n(… p_1(x))`.
#[derive(Debug, Default)]
pub struct Composite {
    parts: Vec<Box<dyn Parametrization>>,
}

impl Composite {
    pub fn new(parts: Vec<Box<dyn Parametrization>>) -> Self {
        Self { parts }
    }

    /// Input of every part, plus the final output.
    fn forward(&self, x: ArrayView1<f64>) -> Result<Vec<Array1<f64>>> {
        let mut values = Vec::with_capacity(self.parts.len() + 1);
        values.push(x.to_owned());
        for part in &self.parts {
            let next = part.eval(values[values.len() - 1].view())?;
            values.push(next);
        }
        Ok(values)
    }
}

impl Parametrization for Composite {
    fn size(&self, input_size: usize) -> usize {
        self.parts.iter().fold(input_size, |n, p| p.size(n))
    }

    fn eval(&self, x: ArrayView1<f64>) -> Result<Array1<f64>> {
        let mut values = self.forward(x)?;
        Ok(values.pop().unwrap_or_else(|| x.to_owned()))
    }

    fn apply_jacobian(&self, grad: ArrayView1<f64>, x: ArrayView1<f64>) -> Result<Array1<f64>> {
        let values = self.forward(x)?;
        let mut g = grad.to_owned();
        for (part, input) in self.parts.iter().zip(values.iter()).rev() {
            g = part.apply_jacobian(g.view(), input.view())?;
        }
        Ok(g)
    }
}

// ─────────────────────────────────────────────────────────────
//  Variable → simulation map
// ─────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct VariableToSimulation {
    kind: ParameterType,
    simulations: Vec<SimulationId>,
    parametrization: Box<dyn Parametrization>,
    output_indexing: Option<Vec<usize>>,
}

impl VariableToSimulation {
    pub fn new(kind: ParameterType, simulations: Vec<SimulationId>, parametrization: Box<dyn Parametrization>) -> Self {
        Self {
            kind,
            simulations,
            parametrization,
            output_indexing: None,
        }
    }

    /// Parametrization output `i` lands at simulation parameter `idx[i]`.
    pub fn with_output_indexing(mut self, idx: Vec<usize>) -> Self {
        self.output_indexing = Some(idx);
        self
    }

    pub fn kind(&self) -> ParameterType {
        self.kind
    }

    pub fn simulations(&self) -> &[SimulationId] {
        &self.simulations
    }

    pub fn targets(&self, sim: SimulationId) -> bool {
        self.simulations.contains(&sim)
    }

    pub fn output_indexing(&self) -> Option<&[usize]> {
        self.output_indexing.as_deref()
    }

    pub fn eval(&self, x: ArrayView1<f64>) -> Result<Array1<f64>> {
        self.parametrization.eval(x)
    }

    /// Write the parametrized values of `x` into a simulation parameter
    /// vector.
    pub fn update(&self, x: ArrayView1<f64>, target: &mut Array1<f64>) -> Result<()> {
        let values = self.eval(x)?;
        match &self.output_indexing {
            Some(idx) => {
                check_len("output indexing", idx.len(), values.len())?;
                for (&i, &v) in idx.iter().zip(values.iter()) {
                    let slot = target.get_mut(i).ok_or_else(|| {
                        AdjointError::Shape(format!("output index {i} out of range"))
                    })?;
                    *slot = v;
                }
            }
            None => {
                check_len("simulation parameters", target.len(), values.len())?;
                target.assign(&values);
            }
        }
        Ok(())
    }

    /// Pull a simulation-space gradient back to design space.
    pub fn apply_parametrization_jacobian(&self, term: ArrayView1<f64>, x: ArrayView1<f64>) -> Result<Array1<f64>> {
        let gathered = match &self.output_indexing {
            Some(idx) => idx
                .iter()
                .map(|&i| {
                    term.get(i)
                        .copied()
                        .ok_or_else(|| AdjointError::Shape(format!("output index {i} out of range")))
                })
                .collect::<Result<Array1<f64>>>()?,
            None => term.to_owned(),
        };
        check_len(
            "parametrization output",
            gathered.len(),
            self.parametrization.size(x.len()),
        )?;
        self.parametrization.apply_jacobian(gathered.view(), x)
    }
}

// ─────────────────────────────────────────────────────────────
//  Residual sensitivities
// ─────────────────────────────────────────────────────────────

/// Contracts an adjoint solution against `∂R/∂θ` for one parameter type,
/// returning the state-mediated `dJ/dθ` in simulation parameter space.
pub trait ResidualSensitivity: Debug + Send + Sync {
    fn kind(&self) -> ParameterType;

    fn adjoint_term(&self, sim: &Simulation, adjoint: &AdjointSolution) -> Result<Array1<f64>>;
}

/// External nodal load, constant in time.
///
/// Static: `K u = f`, so `dJ/df = p`.  Transient: the load enters step `i`
/// scaled by `(β_i dt)²`, giving `dJ/df = −Σ_{i≥1} β_i dt · p[i]`.
#[derive(Debug, Clone, Copy, Default)]
pub struct NodalLoadSensitivity;

impl ResidualSensitivity for NodalLoadSensitivity {
    fn kind(&self) -> ParameterType {
        ParameterType::NodalLoad
    }

    fn adjoint_term(&self, sim: &Simulation, adjoint: &AdjointSolution) -> Result<Array1<f64>> {
        match (adjoint, sim.time()) {
            (AdjointSolution::Static(y), _) => {
                if y.ncols() != 1 {
                    return Err(AdjointError::Shape(format!(
                        "nodal load sensitivity expects one adjoint column, got {}",
                        y.ncols()
                    )));
                }
                Ok(y.column(0).to_owned())
            }
            (AdjointSolution::Transient(series), Some(time)) => {
                let mut term = Array1::zeros(sim.ndof());
                for i in 1..=series.time_steps() {
                    let beta_dt = bdf::beta(bdf::order_at(time.bdf_order, i)) * time.dt;
                    term.scaled_add(-beta_dt, &series.p_at(i));
                }
                Ok(term)
            }
            (AdjointSolution::Transient(_), None) => Err(AdjointError::Config(
                "transient adjoint on a simulation without time integration".into(),
            )),
        }
    }
}

/// Initial displacement and velocity, stacked `[u_0; v_0]`.
#[derive(Debug, Clone, Copy, Default)]
pub struct InitialConditionSensitivity;

impl ResidualSensitivity for InitialConditionSensitivity {
    fn kind(&self) -> ParameterType {
        ParameterType::InitialCondition
    }

    fn adjoint_term(&self, _sim: &Simulation, adjoint: &AdjointSolution) -> Result<Array1<f64>> {
        let series = adjoint.as_transient().ok_or_else(|| {
            AdjointError::Config("initial condition derivative requires a transient simulation".into())
        })?;
        let du0 = series.initial_nu().mapv(|v| -v);
        let dv0 = series.p_at(0).mapv(|v| -v);
        concatenate(Axis(0), &[du0.view(), dv0.view()]).map_err(|e| AdjointError::Shape(e.to_string()))
    }
}
