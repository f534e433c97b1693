//! Lazily rebuilt state inside objectives: the spline distance grid and the
//! collision constraint set are rebuilt only when their key changes.

use adjoint_fem::barrier::{CollisionBarrierForm, VertexBarrier};
use adjoint_fem::cache::StepInput;
use adjoint_fem::config::SimulationSettings;
use adjoint_fem::mesh::{ElementQuadrature, MeshGeometry};
use adjoint_fem::parametrization::{Identity, ParameterType, VariableToSimulation};
use adjoint_fem::sdf::{SdfTargetForm, SplineTarget};
use adjoint_fem::types::BoundaryNodeSet;
use adjoint_fem::{AdjointError, AdjointForm, FormContext, Simulation, SimulationId};
use approx::assert_relative_eq;
use ndarray::{array, Array1, Array2};
use sprs::CsMat;
use std::sync::Arc;

// ─────────────────────────────────────────────────────────────
//  Helpers
// ─────────────────────────────────────────────────────────────

/// Unit right triangle with facet quadrature on the hypotenuse (nodes 1, 2)
/// and all three vertices on the collision surface.
fn triangle() -> MeshGeometry {
    let volume = ElementQuadrature::new(
        0,
        1,
        vec![0, 1, 2],
        array![[0.0, 0.0], [1.0, 0.0], [0.0, 1.0]],
        Array2::eye(3),
        array![1.0, 1.0, 1.0],
    )
    .unwrap();
    let facet = ElementQuadrature::new(0, 1, vec![1, 2], array![[0.0], [1.0]], Array2::eye(2), array![1.0, 1.0])
        .unwrap()
        .on_boundary(7);
    MeshGeometry::new(array![[0.0, 0.0], [1.0, 0.0], [0.0, 1.0]], vec![volume])
        .unwrap()
        .with_surface_quadrature(vec![facet])
        .unwrap()
        .with_collision_surface(vec![0, 1, 2], vec![[0, 1]])
        .unwrap()
}

/// Static simulation at rest.
fn resting_sim() -> Simulation {
    let boundary = Arc::new(BoundaryNodeSet::from_nodes(6, 2, &[0]).unwrap());
    let settings = SimulationSettings {
        time: None,
        solver: Default::default(),
    };
    let mut sim = Simulation::new(SimulationId(0), Arc::new(triangle()), boundary, settings).unwrap();
    sim.cache_mut().push(StepInput::new(CsMat::eye(6), Array1::zeros(6))).unwrap();
    sim
}

/// The line `y = 2` for `x ∈ [-1, 3]`.
fn line_y2() -> SplineTarget {
    SplineTarget::curve(array![[-1.0, 2.0], [0.0, 2.0], [1.0, 2.0], [3.0, 2.0]]).unwrap()
}

// ─────────────────────────────────────────────────────────────
//  Spline distance
// ─────────────────────────────────────────────────────────────

#[test]
fn spline_target_resamples_once_for_the_same_surface() {
    let sim = resting_sim();
    let sims = std::slice::from_ref(&sim);
    let ctx = FormContext::new(sims, &[]);
    let x = Array1::<f64>::zeros(0);
    let mut form = SdfTargetForm::new(&sim, line_y2(), 0.1).unwrap();

    form.solution_changed(x.view(), &ctx).unwrap();
    let cached = form.grid().map(|g| g.len()).unwrap();
    assert!(cached > 0);
    form.solution_changed(x.view(), &ctx).unwrap();
    assert_eq!(form.sample_rebuilds(), 1);
    assert_eq!(form.grid().map(|g| g.len()), Some(cached));

    // node 1 sits 2 below the line, node 2 sits 1 below
    assert_relative_eq!(form.value(x.view(), &ctx).unwrap(), 5.0, epsilon = 1e-9);
    let rhs = form.adjoint_rhs(x.view(), &ctx).unwrap();
    assert_relative_eq!(rhs[[3, 0]], -4.0, epsilon = 1e-9);
    assert_relative_eq!(rhs[[5, 0]], -2.0, epsilon = 1e-9);
    assert_relative_eq!(rhs[[2, 0]], 0.0, epsilon = 1e-9);
    assert_eq!(rhs[[0, 0]], 0.0);
}

#[test]
fn spline_target_queried_before_refresh() {
    let sim = resting_sim();
    let sims = std::slice::from_ref(&sim);
    let ctx = FormContext::new(sims, &[]);
    let form = SdfTargetForm::new(&sim, line_y2(), 0.1).unwrap();
    let err = form.value(Array1::<f64>::zeros(0).view(), &ctx).unwrap_err();
    assert!(matches!(err, AdjointError::NotInitialized(_)));
}

#[test]
fn spline_target_rejects_bad_setup() {
    let sim = resting_sim();
    assert!(matches!(
        SdfTargetForm::new(&sim, line_y2(), 0.0).unwrap_err(),
        AdjointError::Config(_)
    ));
    let patch = SplineTarget::patch(Array2::zeros((16, 3)), 4, 4).unwrap();
    assert!(matches!(
        SdfTargetForm::new(&sim, patch, 0.1).unwrap_err(),
        AdjointError::Config(_)
    ));
}

// ─────────────────────────────────────────────────────────────
//  Collision barrier
// ─────────────────────────────────────────────────────────────

#[test]
fn barrier_rebuilds_only_when_the_surface_moves() {
    let sim = resting_sim();
    let sims = std::slice::from_ref(&sim);
    // x drives the y coordinate of node 2
    let vars = vec![
        VariableToSimulation::new(ParameterType::Shape, vec![SimulationId(0)], Box::new(Identity))
            .with_output_indexing(vec![5]),
    ];
    let ctx = FormContext::new(sims, &vars);
    let backend = VertexBarrier::new(1.2).unwrap();
    let mut form = CollisionBarrierForm::new(&sim, Box::new(backend)).unwrap();

    let rest = array![1.0];
    form.solution_changed(rest.view(), &ctx).unwrap();
    form.solution_changed(rest.view(), &ctx).unwrap();
    assert_eq!(form.constraint_rebuilds(), 1);
    // only the pair (0, 2) is within reach; (0, 1) shares an edge
    assert!(form.value(rest.view(), &ctx).unwrap() > 0.0);

    let moved = array![0.9];
    form.solution_changed(moved.view(), &ctx).unwrap();
    assert_eq!(form.constraint_rebuilds(), 2);

    // moving node 2 away lowers the barrier
    let g = form.partial_gradient(moved.view(), &ctx).unwrap();
    assert!(g[0] < 0.0);
    assert!(form.adjoint_rhs(moved.view(), &ctx).unwrap().iter().all(|&v| v == 0.0));
}

#[test]
fn barrier_needs_a_collision_surface() {
    let boundary = Arc::new(BoundaryNodeSet::from_nodes(6, 2, &[0]).unwrap());
    let mesh = MeshGeometry::new(array![[0.0, 0.0], [1.0, 0.0], [0.0, 1.0]], vec![]).unwrap();
    let settings = SimulationSettings {
        time: None,
        solver: Default::default(),
    };
    let sim = Simulation::new(SimulationId(0), Arc::new(mesh), boundary, settings).unwrap();
    let err = CollisionBarrierForm::new(&sim, Box::new(VertexBarrier::new(0.5).unwrap())).unwrap_err();
    assert!(matches!(err, AdjointError::Config(_)));
}
