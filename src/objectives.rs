//! Objective functionals and the capability trait the driver loops over.
//!
//! Every functional reports a value, the derivative of that value with
//! respect to the forward state (the adjoint right-hand side, one column
//! per time step), and the derivative with respect to the design vector
//! with the state held fixed.  Weighted versions are provided methods.
//!
//! Concrete kernels live as closures built per evaluation; see
//! [`crate::quadrature`] for how they are integrated.

use crate::mesh::Region;
use crate::parametrization::{ParameterType, VariableToSimulation};
use crate::quadrature::{integrate_adjoint_rhs, integrate_value, IntegrableFunctional};
use crate::simulation::Simulation;
use crate::types::{AdjointError, Result, SimulationId};
use ndarray::{Array1, Array2, ArrayView1};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, trace};

// ─────────────────────────────────────────────────────────────
//  Evaluation context
// ─────────────────────────────────────────────────────────────

/// Read-only view of everything a functional may look at.
#[derive(Debug, Clone, Copy)]
pub struct FormContext<'a> {
    pub simulations: &'a [Simulation],
    pub variables: &'a [VariableToSimulation],
}

impl<'a> FormContext<'a> {
    pub fn new(simulations: &'a [Simulation], variables: &'a [VariableToSimulation]) -> Self {
        Self {
            simulations,
            variables,
        }
    }

    pub fn simulation(&self, id: SimulationId) -> Result<&'a Simulation> {
        self.simulations
            .iter()
            .find(|s| s.id() == id)
            .ok_or_else(|| AdjointError::Config(format!("unknown simulation {}", id.0)))
    }

    /// Variables that drive simulation `id`.
    pub fn variables_for(&self, id: SimulationId) -> impl Iterator<Item = &'a VariableToSimulation> + 'a {
        self.variables.iter().filter(move |v| v.targets(id))
    }
}

/// Fail if a shape variable drives `sim` and the functional has no shape
/// derivative.
pub(crate) fn reject_shape_derivative(ctx: &FormContext, sim: SimulationId, form: &str) -> Result<()> {
    if ctx.variables_for(sim).any(|v| v.kind() == ParameterType::Shape) {
        return Err(AdjointError::Config(format!("shape derivative of {form} is not supported")));
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────
//  Capability trait
// ─────────────────────────────────────────────────────────────

pub trait AdjointForm: Send + Sync {
    fn name(&self) -> &str;

    fn weight(&self) -> f64;

    /// Simulation whose state the functional depends on.
    fn simulation(&self) -> SimulationId;

    /// Refresh lazily cached data for a new design / forward solution.
    /// Must not run concurrently with the evaluation methods.
    fn solution_changed(&mut self, _x: ArrayView1<f64>, _ctx: &FormContext) -> Result<()> {
        Ok(())
    }

    fn value_unweighted(&self, x: ArrayView1<f64>, ctx: &FormContext) -> Result<f64>;

    /// `∂J/∂u`, `ndof × columns` (one column per time step, zero outside
    /// the active window).
    fn adjoint_rhs_unweighted(&self, x: ArrayView1<f64>, ctx: &FormContext) -> Result<Array2<f64>>;

    /// `∂J/∂x` with the state held fixed.
    fn partial_gradient_unweighted(&self, x: ArrayView1<f64>, ctx: &FormContext) -> Result<Array1<f64>>;

    /// Line-search hook; only barrier-type functionals restrict steps.
    fn is_step_collision_free(&self, _x0: ArrayView1<f64>, _x1: ArrayView1<f64>, _ctx: &FormContext) -> Result<bool> {
        Ok(true)
    }

    fn max_step_size(&self, _x0: ArrayView1<f64>, _x1: ArrayView1<f64>, _ctx: &FormContext) -> Result<f64> {
        Ok(1.0)
    }

    fn value(&self, x: ArrayView1<f64>, ctx: &FormContext) -> Result<f64> {
        Ok(self.weight() * self.value_unweighted(x, ctx)?)
    }

    fn adjoint_rhs(&self, x: ArrayView1<f64>, ctx: &FormContext) -> Result<Array2<f64>> {
        Ok(self.adjoint_rhs_unweighted(x, ctx)? * self.weight())
    }

    fn partial_gradient(&self, x: ArrayView1<f64>, ctx: &FormContext) -> Result<Array1<f64>> {
        Ok(self.partial_gradient_unweighted(x, ctx)? * self.weight())
    }
}

// ─────────────────────────────────────────────────────────────
//  Step windows
// ─────────────────────────────────────────────────────────────

/// Which forward steps a per-step functional sums over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepWindow {
    #[default]
    All,
    Final,
    Step(usize),
}

impl StepWindow {
    pub fn steps(&self, sim: &Simulation) -> Result<Vec<usize>> {
        let cols = sim.n_adjoint_columns();
        match *self {
            StepWindow::All => Ok((0..cols).collect()),
            StepWindow::Final => Ok(vec![cols - 1]),
            StepWindow::Step(k) if k < cols => Ok(vec![k]),
            StepWindow::Step(k) => Err(AdjointError::Config(format!(
                "step {k} outside of the {cols} simulated steps"
            ))),
        }
    }
}

/// Σ over the window of `∫ j` with a per-step kernel.
pub(crate) fn windowed_value<'a, F>(sim: &'a Simulation, region: &Region, window: StepWindow, mut kernel: F) -> Result<f64>
where
    F: FnMut(usize) -> Result<IntegrableFunctional<'a>>,
{
    let mut total = 0.0;
    for step in window.steps(sim)? {
        let f = kernel(step)?;
        total += integrate_value(sim.mesh(), region, &f, sim.cache().u(step)?, step);
    }
    Ok(total)
}

/// Per-step `∂/∂u` of [`windowed_value`], zero columns outside the window.
pub(crate) fn windowed_rhs<'a, F>(sim: &'a Simulation, region: &Region, window: StepWindow, mut kernel: F) -> Result<Array2<f64>>
where
    F: FnMut(usize) -> Result<IntegrableFunctional<'a>>,
{
    let mut rhs = Array2::zeros((sim.ndof(), sim.n_adjoint_columns()));
    for step in window.steps(sim)? {
        let f = kernel(step)?;
        let col = integrate_adjoint_rhs(sim.mesh(), region, &f, sim.cache().u(step)?, step);
        rhs.column_mut(step).assign(&col);
    }
    Ok(rhs)
}

// ─────────────────────────────────────────────────────────────
//  Target matching
// ─────────────────────────────────────────────────────────────

pub type TargetValueFn = Arc<dyn Fn([f64; 3]) -> f64 + Send + Sync>;
pub type TargetGradFn = Arc<dyn Fn([f64; 3]) -> [f64; 3] + Send + Sync>;

pub enum TargetReference {
    /// Another simulation; `element_map` sends current elements to
    /// reference elements (unlisted elements map to the same index).
    Simulation {
        sim: SimulationId,
        element_map: BTreeMap<usize, usize>,
    },
    /// Explicit kernel of the deformed position.
    Function { value: TargetValueFn, grad: TargetGradFn },
    /// Constant target displacement on the active components.
    Displacement { target: Vec<f64>, active: Vec<bool> },
}

impl std::fmt::Debug for TargetReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TargetReference::Simulation { sim, element_map } => f
                .debug_struct("Simulation")
                .field("sim", sim)
                .field("mapped_elements", &element_map.len())
                .finish(),
            TargetReference::Function { .. } => write!(f, "Function(..)"),
            TargetReference::Displacement { target, active } => f
                .debug_struct("Displacement")
                .field("target", target)
                .field("active", active)
                .finish(),
        }
    }
}

/// Element counts found when matching a reference simulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReferenceMismatch {
    pub current: usize,
    pub reference: usize,
}

/// Squared distance between the simulated point and a reference.
///
/// Only the state derivative is provided.  The quadrature weights and
/// points move with the rest geometry, and that dependence is not
/// differentiated, so gradient queries fail with `Config` whenever a
/// shape variable drives the simulation.
#[derive(Debug)]
pub struct TargetForm {
    sim: SimulationId,
    weight: f64,
    region: Region,
    window: StepWindow,
    reference: TargetReference,
    mismatch: Option<ReferenceMismatch>,
}

impl TargetForm {
    /// Match against a constant displacement.  `active` defaults to all
    /// components; both must have one entry per mesh dimension.
    pub fn constant_displacement(sim: &Simulation, target: Vec<f64>, active: Option<Vec<bool>>) -> Result<Self> {
        let dim = sim.dim();
        if target.len() != dim {
            return Err(AdjointError::Config(format!(
                "target displacement has {} components, mesh dimension is {dim}",
                target.len()
            )));
        }
        let active = active.unwrap_or_else(|| vec![true; dim]);
        if active.len() != dim {
            return Err(AdjointError::Config(format!(
                "active dimension mask has {} entries, mesh dimension is {dim}",
                active.len()
            )));
        }
        Ok(Self::with_reference(sim.id(), TargetReference::Displacement { target, active }))
    }

    /// `value` and `grad` are evaluated at the deformed position.
    pub fn reference_function(sim: &Simulation, value: TargetValueFn, grad: TargetGradFn) -> Self {
        Self::with_reference(sim.id(), TargetReference::Function { value, grad })
    }

    /// Match against another simulation, pairing elements body by body in
    /// element order.  `body_ids` restricts the bodies considered (empty =
    /// all).
    pub fn reference_simulation(sim: &Simulation, reference: &Simulation, body_ids: &BTreeSet<i32>) -> Result<Self> {
        let group = |s: &Simulation| {
            let mut by_body: BTreeMap<i32, Vec<usize>> = BTreeMap::new();
            let mut count = 0;
            for e in 0..s.mesh().n_elements() {
                if let Some(q) = s.mesh().element(e) {
                    if body_ids.is_empty() || body_ids.contains(&q.body_id) {
                        by_body.entry(q.body_id).or_default().push(e);
                        count += 1;
                    }
                }
            }
            (by_body, count)
        };
        let (current, count) = group(sim);
        let (reference_groups, ref_count) = group(reference);

        let mismatch = if count != ref_count {
            error!(current = count, reference = ref_count, "element counts of target and reference differ");
            Some(ReferenceMismatch {
                current: count,
                reference: ref_count,
            })
        } else {
            trace!(count, "found matching elements");
            None
        };

        let mut element_map = BTreeMap::new();
        for (body, elements) in &current {
            let refs = reference_groups.get(body).map(Vec::as_slice).unwrap_or(&[]);
            for (i, &e) in elements.iter().enumerate() {
                let e_ref = refs.get(i).copied().ok_or_else(|| {
                    AdjointError::DataConsistency(format!(
                        "element {e} of body {body} has no counterpart in the reference"
                    ))
                })?;
                element_map.insert(e, e_ref);
            }
        }

        let mut form = Self::with_reference(
            sim.id(),
            TargetReference::Simulation {
                sim: reference.id(),
                element_map,
            },
        );
        form.mismatch = mismatch;
        Ok(form)
    }

    fn with_reference(sim: SimulationId, reference: TargetReference) -> Self {
        Self {
            sim,
            weight: 1.0,
            region: Region::all_volume(),
            window: StepWindow::All,
            reference,
            mismatch: None,
        }
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_region(mut self, region: Region) -> Self {
        self.region = region;
        self
    }

    pub fn with_window(mut self, window: StepWindow) -> Self {
        self.window = window;
        self
    }

    /// Element counts when the reference did not match one-to-one.
    pub fn reference_mismatch(&self) -> Option<ReferenceMismatch> {
        self.mismatch
    }

    /// Reference element for every element of the region, validated.
    fn resolve_reference(&self, sim: &Simulation, reference: &Simulation, element_map: &BTreeMap<usize, usize>) -> Result<HashMap<usize, usize>> {
        let mut resolved = HashMap::new();
        for q in sim.mesh().elements_in(&self.region) {
            let e_ref = element_map.get(&q.element).copied().unwrap_or(q.element);
            let ref_q = reference.mesh().element(e_ref).ok_or_else(|| {
                AdjointError::DataConsistency(format!("reference has no element {e_ref}"))
            })?;
            if ref_q.n_points() != q.n_points() {
                return Err(AdjointError::DataConsistency(format!(
                    "element {} has {} quadrature points, reference element {e_ref} has {}",
                    q.element,
                    q.n_points(),
                    ref_q.n_points()
                )));
            }
            resolved.insert(q.element, e_ref);
        }
        Ok(resolved)
    }

    /// Kernel for one step.
    fn kernel<'a>(&'a self, step: usize, ctx: &FormContext<'a>, sim: &'a Simulation) -> Result<IntegrableFunctional<'a>> {
        match &self.reference {
            TargetReference::Displacement { target, active } => {
                let err = move |u: &[f64; 3], dim: usize| {
                    let mut e = [0.0; 3];
                    for d in 0..dim {
                        if active[d] {
                            e[d] = u[d] - target[d];
                        }
                    }
                    e
                };
                Ok(IntegrableFunctional::new(
                    move |c| err(&c.u, c.dim).iter().map(|v| v * v).sum(),
                    move |c| err(&c.u, c.dim).map(|v| 2.0 * v),
                ))
            }
            TargetReference::Function { value, grad } => {
                let (value, grad) = (Arc::clone(value), Arc::clone(grad));
                Ok(IntegrableFunctional::new(
                    move |c| value(c.position()),
                    move |c| grad(c.position()),
                ))
            }
            TargetReference::Simulation {
                sim: ref_id,
                element_map,
            } => {
                let reference = ctx.simulation(*ref_id)?;
                let ref_step = if reference.is_time_dependent() { step } else { 0 };
                let ref_u = reference.cache().u(ref_step)?;
                let map = self.resolve_reference(sim, reference, element_map)?;
                let ref_mesh = reference.mesh();
                let dim = sim.dim();
                let ref_position = move |c: &crate::quadrature::PointContext| {
                    let mut x = [0.0; 3];
                    let e_ref = map.get(&c.element).copied().unwrap_or(c.element);
                    if let Some(q) = ref_mesh.element(e_ref) {
                        let rest = q.interpolate(c.qp, ref_mesh.rest_positions());
                        let u = q.interpolate_dofs(c.qp, ref_u, dim);
                        for d in 0..dim {
                            x[d] = rest[d] + u[d];
                        }
                    }
                    x
                };
                let ref_position = Arc::new(ref_position);
                let ref_position_grad = Arc::clone(&ref_position);
                Ok(IntegrableFunctional::new(
                    move |c| {
                        let x = c.position();
                        let r = ref_position(c);
                        (0..c.dim).map(|d| (x[d] - r[d]).powi(2)).sum()
                    },
                    move |c| {
                        let x = c.position();
                        let r = ref_position_grad(c);
                        let mut g = [0.0; 3];
                        for d in 0..c.dim {
                            g[d] = 2.0 * (x[d] - r[d]);
                        }
                        g
                    },
                ))
            }
        }
    }
}

impl AdjointForm for TargetForm {
    fn name(&self) -> &str {
        "target"
    }

    fn weight(&self) -> f64 {
        self.weight
    }

    fn simulation(&self) -> SimulationId {
        self.sim
    }

    fn value_unweighted(&self, _x: ArrayView1<f64>, ctx: &FormContext) -> Result<f64> {
        let sim = ctx.simulation(self.sim)?;
        windowed_value(sim, &self.region, self.window, |step| self.kernel(step, ctx, sim))
    }

    fn adjoint_rhs_unweighted(&self, _x: ArrayView1<f64>, ctx: &FormContext) -> Result<Array2<f64>> {
        let sim = ctx.simulation(self.sim)?;
        windowed_rhs(sim, &self.region, self.window, |step| self.kernel(step, ctx, sim))
    }

    fn partial_gradient_unweighted(&self, x: ArrayView1<f64>, ctx: &FormContext) -> Result<Array1<f64>> {
        reject_shape_derivative(ctx, self.sim, self.name())?;
        Ok(Array1::zeros(x.len()))
    }
}

// ─────────────────────────────────────────────────────────────
//  Node-position target
// ─────────────────────────────────────────────────────────────

/// Squared distance of tracked nodes to literal target coordinates.
/// Shape variables are rejected: the rest-position derivative is not
/// provided.
#[derive(Debug, Clone)]
pub struct NodeTargetForm {
    sim: SimulationId,
    weight: f64,
    window: StepWindow,
    dim: usize,
    nodes: Vec<usize>,
    targets: Array2<f64>,
}

impl NodeTargetForm {
    pub fn new(sim: &Simulation, nodes: Vec<usize>, targets: Array2<f64>) -> Result<Self> {
        let dim = sim.dim();
        if targets.dim() != (nodes.len(), dim) {
            return Err(AdjointError::Config(format!(
                "{} target nodes but a {:?} target table (dimension {dim})",
                nodes.len(),
                targets.dim()
            )));
        }
        if let Some(&bad) = nodes.iter().find(|&&n| n >= sim.mesh().n_nodes()) {
            return Err(AdjointError::DataConsistency(format!("target node {bad} is not in the mesh")));
        }
        Ok(Self {
            sim: sim.id(),
            weight: 1.0,
            window: StepWindow::All,
            dim,
            nodes,
            targets,
        })
    }

    /// Read a whitespace table with rows `node x y [z]`.  Node ids are
    /// input-file ids and go through the mesh's input node map.
    pub fn from_file(sim: &Simulation, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let is_file = fs::metadata(path).map(|m| m.is_file()).unwrap_or(false);
        if !is_file {
            return Err(AdjointError::MissingData(path.to_path_buf()));
        }
        let text = fs::read_to_string(path)?;
        let dim = sim.dim();
        let shown = path.display().to_string();

        let mut nodes = Vec::new();
        let mut coords = Vec::new();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let fields = line
                .split_whitespace()
                .map(|t| t.parse::<f64>())
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| AdjointError::Parse {
                    path: shown.clone(),
                    line: lineno + 1,
                    msg: e.to_string(),
                })?;
            if fields.len() != dim + 1 {
                return Err(AdjointError::Parse {
                    path: shown.clone(),
                    line: lineno + 1,
                    msg: format!("expected {} columns, found {}", dim + 1, fields.len()),
                });
            }
            let id = fields[0];
            if id < 0.0 || id.fract() != 0.0 {
                return Err(AdjointError::Parse {
                    path: shown.clone(),
                    line: lineno + 1,
                    msg: format!("node id {id} is not a non-negative integer"),
                });
            }
            let node = sim.mesh().input_node(id as usize).ok_or_else(|| {
                AdjointError::DataConsistency(format!("input node {id} has no mesh node"))
            })?;
            nodes.push(node);
            coords.extend_from_slice(&fields[1..]);
        }
        debug!(path = %shown, nodes = nodes.len(), "loaded node targets");
        let targets = Array2::from_shape_vec((nodes.len(), dim), coords)
            .map_err(|e| AdjointError::Shape(e.to_string()))?;
        Self::new(sim, nodes, targets)
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_window(mut self, window: StepWindow) -> Self {
        self.window = window;
        self
    }

    fn offsets<'s>(&'s self, sim: &'s Simulation, u: ArrayView1<'s, f64>) -> impl Iterator<Item = (usize, Vec<f64>)> + 's {
        let rest = sim.mesh().rest_positions();
        let dim = self.dim;
        self.nodes.iter().enumerate().map(move |(i, &v)| {
            let diff = (0..dim)
                .map(|d| rest[[v, d]] + u[v * dim + d] - self.targets[[i, d]])
                .collect();
            (v, diff)
        })
    }
}

impl AdjointForm for NodeTargetForm {
    fn name(&self) -> &str {
        "node target"
    }

    fn weight(&self) -> f64 {
        self.weight
    }

    fn simulation(&self) -> SimulationId {
        self.sim
    }

    fn value_unweighted(&self, _x: ArrayView1<f64>, ctx: &FormContext) -> Result<f64> {
        let sim = ctx.simulation(self.sim)?;
        let mut total = 0.0;
        for step in self.window.steps(sim)? {
            let u = sim.cache().u(step)?;
            total += self
                .offsets(sim, u)
                .map(|(_, diff)| diff.iter().map(|v| v * v).sum::<f64>())
                .sum::<f64>();
        }
        Ok(total)
    }

    fn adjoint_rhs_unweighted(&self, _x: ArrayView1<f64>, ctx: &FormContext) -> Result<Array2<f64>> {
        let sim = ctx.simulation(self.sim)?;
        let mut rhs = Array2::zeros((sim.ndof(), sim.n_adjoint_columns()));
        for step in self.window.steps(sim)? {
            let u = sim.cache().u(step)?;
            for (v, diff) in self.offsets(sim, u) {
                for (d, e) in diff.iter().enumerate() {
                    rhs[[v * self.dim + d, step]] += 2.0 * e;
                }
            }
        }
        Ok(rhs)
    }

    fn partial_gradient_unweighted(&self, x: ArrayView1<f64>, ctx: &FormContext) -> Result<Array1<f64>> {
        reject_shape_derivative(ctx, self.sim, self.name())?;
        Ok(Array1::zeros(x.len()))
    }
}

// ─────────────────────────────────────────────────────────────
//  Weighted solution
// ─────────────────────────────────────────────────────────────

/// `Σ c · u` over the window.
#[derive(Debug, Clone)]
pub struct WeightedSolutionForm {
    sim: SimulationId,
    weight: f64,
    window: StepWindow,
    coeffs: Array1<f64>,
}

impl WeightedSolutionForm {
    pub fn new(sim: &Simulation, coeffs: Array1<f64>) -> Result<Self> {
        if coeffs.len() != sim.ndof() {
            return Err(AdjointError::Config(format!(
                "{} coefficients for {} dofs",
                coeffs.len(),
                sim.ndof()
            )));
        }
        Ok(Self {
            sim: sim.id(),
            weight: 1.0,
            window: StepWindow::Step(0),
            coeffs,
        })
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_window(mut self, window: StepWindow) -> Self {
        self.window = window;
        self
    }
}

impl AdjointForm for WeightedSolutionForm {
    fn name(&self) -> &str {
        "weighted solution"
    }

    fn weight(&self) -> f64 {
        self.weight
    }

    fn simulation(&self) -> SimulationId {
        self.sim
    }

    fn value_unweighted(&self, _x: ArrayView1<f64>, ctx: &FormContext) -> Result<f64> {
        let sim = ctx.simulation(self.sim)?;
        let mut total = 0.0;
        for step in self.window.steps(sim)? {
            total += self.coeffs.dot(&sim.cache().u(step)?);
        }
        Ok(total)
    }

    fn adjoint_rhs_unweighted(&self, _x: ArrayView1<f64>, ctx: &FormContext) -> Result<Array2<f64>> {
        let sim = ctx.simulation(self.sim)?;
        let mut rhs = Array2::zeros((sim.ndof(), sim.n_adjoint_columns()));
        for step in self.window.steps(sim)? {
            rhs.column_mut(step).assign(&self.coeffs);
        }
        Ok(rhs)
    }

    fn partial_gradient_unweighted(&self, x: ArrayView1<f64>, _ctx: &FormContext) -> Result<Array1<f64>> {
        Ok(Array1::zeros(x.len()))
    }
}
