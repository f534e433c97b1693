//! Integration tests: objectives and static adjoint solves on a pinned
//! triangle.
//!
//! The problem is a single linear triangle on an elastic foundation with
//! node 0 fixed.  Quadrature sits at the nodes with unit weights, so an
//! integrated `|u|²` has the adjoint right-hand side `2u` exactly.

use adjoint_fem::bc::{full_to_reduced, reduced_to_full};
use adjoint_fem::cache::StepInput;
use adjoint_fem::config::{AdjointSettings, SimulationSettings};
use adjoint_fem::gradients::form_gradient;
use adjoint_fem::linalg::{restrict_to_free, spmv, DenseLuSolver, LinearSolver};
use adjoint_fem::mesh::{ElementQuadrature, MeshGeometry, Region};
use adjoint_fem::objectives::{NodeTargetForm, TargetForm, WeightedSolutionForm};
use adjoint_fem::parametrization::{Identity, NodalLoadSensitivity, ParameterType, VariableToSimulation};
use adjoint_fem::types::BoundaryNodeSet;
use adjoint_fem::{AdjointError, AdjointForm, AdjointSolution, FormContext, Simulation, SimulationId};
use approx::assert_relative_eq;
use ndarray::{array, Array1, Array2};
use sprs::{CsMat, TriMat};
use std::collections::BTreeSet;
use std::sync::Arc;

// ─────────────────────────────────────────────────────────────
//  Helpers
// ─────────────────────────────────────────────────────────────

fn sparse(dense: &Array2<f64>) -> CsMat<f64> {
    let mut tri = TriMat::new(dense.dim());
    for ((i, j), &v) in dense.indexed_iter() {
        if v != 0.0 {
            tri.add_triplet(i, j, v);
        }
    }
    tri.to_csc()
}

/// Spring triangle (graph Laplacian ⊗ I₂) on a unit foundation.
fn stiffness() -> CsMat<f64> {
    let lap = array![[2.0, -1.0, -1.0], [-1.0, 2.0, -1.0], [-1.0, -1.0, 2.0]];
    let mut k = Array2::<f64>::eye(6);
    for a in 0..3 {
        for b in 0..3 {
            for d in 0..2 {
                k[[2 * a + d, 2 * b + d]] += 10.0 * lap[[a, b]];
            }
        }
    }
    sparse(&k)
}

fn load() -> Array1<f64> {
    array![0.0, 0.0, 1.0, -0.5, 0.3, 0.8]
}

fn triangle_mesh(body: i32) -> MeshGeometry {
    let q = ElementQuadrature::new(
        0,
        body,
        vec![0, 1, 2],
        array![[0.0, 0.0], [1.0, 0.0], [0.0, 1.0]],
        Array2::eye(3),
        array![1.0, 1.0, 1.0],
    )
    .unwrap();
    MeshGeometry::new(array![[0.0, 0.0], [1.0, 0.0], [0.0, 1.0]], vec![q]).unwrap()
}

/// Dense solve on the free DOFs, Dirichlet entries zero.
fn solve_free(a: &CsMat<f64>, rhs: &Array1<f64>, boundary: &BoundaryNodeSet) -> Array1<f64> {
    let reduced = restrict_to_free(a, boundary);
    let mut lu = DenseLuSolver::default();
    lu.factorize(reduced.view()).unwrap();
    let r = full_to_reduced(rhs.view(), boundary);
    let x = lu.solve(&r.to_vec()).unwrap();
    reduced_to_full(&x, boundary)
}

fn make_static_sim(id: usize, mesh: MeshGeometry, solver: AdjointSettings) -> (Simulation, Array1<f64>) {
    let boundary = Arc::new(BoundaryNodeSet::from_nodes(6, 2, &[0]).unwrap());
    let settings = SimulationSettings { time: None, solver };
    let mut sim = Simulation::new(SimulationId(id), Arc::new(mesh), Arc::clone(&boundary), settings)
        .unwrap()
        .with_sensitivity(Arc::new(NodalLoadSensitivity));
    let k = stiffness();
    let u = solve_free(&k, &load(), &boundary);
    sim.cache_mut().push(StepInput::new(k, u.clone())).unwrap();
    (sim, u)
}

fn no_design() -> Array1<f64> {
    Array1::zeros(0)
}

// ─────────────────────────────────────────────────────────────
//  Target forms
// ─────────────────────────────────────────────────────────────

#[test]
fn zero_displacement_target_has_rhs_twice_u() {
    let (sim, u) = make_static_sim(0, triangle_mesh(1), AdjointSettings::default());
    let sims = std::slice::from_ref(&sim);
    let ctx = FormContext::new(sims, &[]);
    let form = TargetForm::constant_displacement(&sim, vec![0.0, 0.0], None).unwrap();
    let x = no_design();

    assert_relative_eq!(form.value(x.view(), &ctx).unwrap(), u.dot(&u), epsilon = 1e-12);
    let rhs = form.adjoint_rhs(x.view(), &ctx).unwrap();
    assert_eq!(rhs.dim(), (6, 1));
    for i in 0..6 {
        assert_relative_eq!(rhs[[i, 0]], 2.0 * u[i], epsilon = 1e-12);
    }
}

#[test]
fn masked_displacement_target_ignores_inactive_components() {
    let (sim, u) = make_static_sim(0, triangle_mesh(1), AdjointSettings::default());
    let sims = std::slice::from_ref(&sim);
    let ctx = FormContext::new(sims, &[]);
    let form = TargetForm::constant_displacement(&sim, vec![0.1, 0.0], Some(vec![true, false]))
        .unwrap()
        .with_weight(3.0);
    let x = no_design();

    let expected: f64 = (0..3).map(|a| (u[2 * a] - 0.1).powi(2)).sum();
    assert_relative_eq!(form.value(x.view(), &ctx).unwrap(), 3.0 * expected, epsilon = 1e-12);
    let rhs = form.adjoint_rhs(x.view(), &ctx).unwrap();
    for a in 0..3 {
        assert_relative_eq!(rhs[[2 * a, 0]], 6.0 * (u[2 * a] - 0.1), epsilon = 1e-12);
        assert_eq!(rhs[[2 * a + 1, 0]], 0.0);
    }
}

#[test]
fn displacement_target_must_match_mesh_dimension() {
    let (sim, _) = make_static_sim(0, triangle_mesh(1), AdjointSettings::default());
    let err = TargetForm::constant_displacement(&sim, vec![0.0, 0.0, 0.0], None).unwrap_err();
    assert!(matches!(err, AdjointError::Config(_)));
}

#[test]
fn identical_reference_gives_zero_value_and_rhs() {
    let (sim, _) = make_static_sim(0, triangle_mesh(1), AdjointSettings::default());
    let (reference, _) = make_static_sim(1, triangle_mesh(1), AdjointSettings::default());
    let form = TargetForm::reference_simulation(&sim, &reference, &BTreeSet::new()).unwrap();
    assert!(form.reference_mismatch().is_none());

    let sims = vec![sim, reference];
    let ctx = FormContext::new(&sims, &[]);
    let x = no_design();
    assert_eq!(form.value(x.view(), &ctx).unwrap(), 0.0);
    assert!(form.adjoint_rhs(x.view(), &ctx).unwrap().iter().all(|&v| v == 0.0));
}

#[test]
fn reference_without_matching_body_is_rejected() {
    let (sim, _) = make_static_sim(0, triangle_mesh(1), AdjointSettings::default());
    let (reference, _) = make_static_sim(1, triangle_mesh(2), AdjointSettings::default());
    let err = TargetForm::reference_simulation(&sim, &reference, &BTreeSet::new()).unwrap_err();
    assert!(matches!(err, AdjointError::DataConsistency(_)));
}

#[test]
fn function_reference_uses_deformed_position() {
    let (sim, u) = make_static_sim(0, triangle_mesh(1), AdjointSettings::default());
    let sims = std::slice::from_ref(&sim);
    let ctx = FormContext::new(sims, &[]);
    let form = TargetForm::reference_function(
        &sim,
        Arc::new(|p: [f64; 3]| p[0] + 2.0 * p[1]),
        Arc::new(|_: [f64; 3]| [1.0, 2.0, 0.0]),
    )
    .with_region(Region::bodies([1]));
    let x = no_design();

    let rest = [[0.0, 0.0], [1.0, 0.0], [0.0, 1.0]];
    let expected: f64 = (0..3)
        .map(|a| (rest[a][0] + u[2 * a]) + 2.0 * (rest[a][1] + u[2 * a + 1]))
        .sum();
    assert_relative_eq!(form.value(x.view(), &ctx).unwrap(), expected, epsilon = 1e-12);
    let rhs = form.adjoint_rhs(x.view(), &ctx).unwrap();
    assert_eq!(rhs.column(0).to_vec(), vec![1.0, 2.0, 1.0, 2.0, 1.0, 2.0]);
}

#[test]
fn shape_variable_is_not_differentiable_through_targets() {
    let (sim, _) = make_static_sim(0, triangle_mesh(1), AdjointSettings::default());
    let sims = std::slice::from_ref(&sim);
    let vars = vec![VariableToSimulation::new(ParameterType::Shape, vec![SimulationId(0)], Box::new(Identity))];
    let ctx = FormContext::new(sims, &vars);
    let form = TargetForm::constant_displacement(&sim, vec![0.0, 0.0], None).unwrap();
    let x = Array1::zeros(6);
    let err = form.partial_gradient(x.view(), &ctx).unwrap_err();
    assert!(matches!(&err, AdjointError::Config(msg) if msg.contains("shape derivative")));
    // the state part is still available
    assert!(form.adjoint_rhs(x.view(), &ctx).is_ok());
}

// ─────────────────────────────────────────────────────────────
//  Node targets
// ─────────────────────────────────────────────────────────────

#[test]
fn node_targets_from_file() {
    let mesh = triangle_mesh(1).with_input_node_map(vec![2, 1, 0]);
    let (sim, u) = make_static_sim(0, mesh, AdjointSettings::default());
    let path = std::env::temp_dir().join(format!("adjoint_fem_nodes_{}.txt", std::process::id()));
    std::fs::write(&path, "# node x y\n0 0.5 0.5\n\n1 1.0 -0.2\n").unwrap();

    let form = NodeTargetForm::from_file(&sim, &path).unwrap();
    std::fs::remove_file(&path).unwrap();

    let sims = std::slice::from_ref(&sim);
    let ctx = FormContext::new(sims, &[]);
    let x = no_design();
    // input node 0 is mesh node 2 at (0, 1), input node 1 is mesh node 1 at (1, 0)
    let e2 = [0.0 + u[4] - 0.5, 1.0 + u[5] - 0.5];
    let e1 = [1.0 + u[2] - 1.0, 0.0 + u[3] + 0.2];
    let expected = e2[0] * e2[0] + e2[1] * e2[1] + e1[0] * e1[0] + e1[1] * e1[1];
    assert_relative_eq!(form.value(x.view(), &ctx).unwrap(), expected, epsilon = 1e-12);

    let rhs = form.adjoint_rhs(x.view(), &ctx).unwrap();
    assert_eq!(rhs[[0, 0]], 0.0);
    assert_eq!(rhs[[1, 0]], 0.0);
    assert_relative_eq!(rhs[[2, 0]], 2.0 * e1[0], epsilon = 1e-12);
    assert_relative_eq!(rhs[[3, 0]], 2.0 * e1[1], epsilon = 1e-12);
    assert_relative_eq!(rhs[[4, 0]], 2.0 * e2[0], epsilon = 1e-12);
    assert_relative_eq!(rhs[[5, 0]], 2.0 * e2[1], epsilon = 1e-12);
}

#[test]
fn node_target_file_errors() {
    let (sim, _) = make_static_sim(0, triangle_mesh(1), AdjointSettings::default());
    let missing = std::env::temp_dir().join("adjoint_fem_no_such_targets.txt");
    assert!(matches!(
        NodeTargetForm::from_file(&sim, &missing),
        Err(AdjointError::MissingData(_))
    ));
    // a directory is not a regular file
    assert!(matches!(
        NodeTargetForm::from_file(&sim, std::env::temp_dir()),
        Err(AdjointError::MissingData(_))
    ));

    let path = std::env::temp_dir().join(format!("adjoint_fem_bad_{}.txt", std::process::id()));
    std::fs::write(&path, "0 0.5\n").unwrap();
    let result = NodeTargetForm::from_file(&sim, &path);
    std::fs::remove_file(&path).unwrap();
    assert!(matches!(result, Err(AdjointError::Parse { line: 1, .. })));
}

// ─────────────────────────────────────────────────────────────
//  Static adjoint backends
// ─────────────────────────────────────────────────────────────

fn check_adjoint(p: &Array2<f64>, rhs: &Array2<f64>) {
    let k = stiffness();
    assert_eq!(p[[0, 0]], 0.0);
    assert_eq!(p[[1, 0]], 0.0);
    let kp = spmv(&k, p.column(0));
    for i in 2..6 {
        assert_relative_eq!(kp[i], rhs[[i, 0]], epsilon = 1e-10);
    }
}

#[test]
fn static_backends_agree() {
    let mut solutions = Vec::new();
    for backend in ["dense_lu", "ldl", "cholesky"] {
        let settings = AdjointSettings {
            adjoint_solver: backend.into(),
            ..AdjointSettings::default()
        };
        let (sim, u) = make_static_sim(0, triangle_mesh(1), settings);
        let rhs = (&u * 2.0).insert_axis(ndarray::Axis(1));
        let AdjointSolution::Static(p) = sim.solve_adjoint(rhs.view()).unwrap() else {
            panic!("static simulation produced a transient adjoint");
        };
        check_adjoint(&p, &rhs);
        solutions.push(p);
    }

    let (mut sim, u) = make_static_sim(0, triangle_mesh(1), AdjointSettings::default());
    sim.prefactorize().unwrap();
    let rhs = (&u * 2.0).insert_axis(ndarray::Axis(1));
    let p = sim.solve_adjoint(rhs.view()).unwrap().p().to_owned();
    check_adjoint(&p, &rhs);

    for other in &solutions {
        for i in 0..6 {
            assert_relative_eq!(other[[i, 0]], p[[i, 0]], epsilon = 1e-10);
        }
    }
}

#[test]
fn prefactorization_follows_settings() {
    let settings = AdjointSettings {
        prefactorized_solver: "dense_lu".into(),
        ..AdjointSettings::default()
    };
    let (mut sim, _) = make_static_sim(0, triangle_mesh(1), settings);
    sim.prefactorize().unwrap();
    assert_eq!(sim.cache().prefactorized().map(|s| s.name()), Some("dense_lu"));

    let settings = AdjointSettings {
        prefactorized_solver: "umfpack".into(),
        ..AdjointSettings::default()
    };
    let (mut sim, _) = make_static_sim(0, triangle_mesh(1), settings);
    assert!(matches!(sim.prefactorize(), Err(AdjointError::Config(_))));
    assert!(sim.cache().prefactorized().is_none());
}

#[test]
fn stored_adjoint_lifecycle() {
    let (mut sim, u) = make_static_sim(0, triangle_mesh(1), AdjointSettings::default());
    assert!(matches!(sim.adjoint_mat(), Err(AdjointError::NotInitialized(_))));
    let rhs = u.clone().insert_axis(ndarray::Axis(1));
    sim.solve_adjoint_cached(rhs.view()).unwrap();
    assert_eq!(sim.adjoint_mat().unwrap().p().dim(), (6, 1));

    // new forward data invalidates the stored adjoint
    sim.cache_mut().clear();
    assert!(sim.adjoint_mat().is_err());
    assert!(matches!(sim.solve_adjoint(rhs.view()), Err(AdjointError::EmptyForwardCache)));
}

#[test]
fn unknown_backend_is_a_config_error() {
    let settings = AdjointSettings {
        adjoint_solver: "umfpack".into(),
        ..AdjointSettings::default()
    };
    let (sim, u) = make_static_sim(0, triangle_mesh(1), settings);
    let rhs = u.insert_axis(ndarray::Axis(1));
    assert!(matches!(sim.solve_adjoint(rhs.view()), Err(AdjointError::Config(_))));
}

// ─────────────────────────────────────────────────────────────
//  Driver
// ─────────────────────────────────────────────────────────────

#[test]
fn zero_rhs_skips_adjoint_and_missing_sensitivity_errors() {
    let (sim, _) = make_static_sim(0, triangle_mesh(1), AdjointSettings::default());
    let sims = std::slice::from_ref(&sim);
    let vars = vec![VariableToSimulation::new(
        ParameterType::Material,
        vec![SimulationId(0)],
        Box::new(Identity),
    )];
    let ctx = FormContext::new(sims, &vars);
    let x = Array1::zeros(6);

    let inert = WeightedSolutionForm::new(&sim, Array1::zeros(6)).unwrap();
    let g = form_gradient(&inert, x.view(), &ctx).unwrap();
    assert!(g.iter().all(|&v| v == 0.0));

    let live = WeightedSolutionForm::new(&sim, Array1::ones(6)).unwrap();
    let err = form_gradient(&live, x.view(), &ctx).unwrap_err();
    assert!(matches!(err, AdjointError::Config(_)));
}

#[test]
fn weighted_solution_value_and_rhs() {
    let (sim, u) = make_static_sim(0, triangle_mesh(1), AdjointSettings::default());
    let sims = std::slice::from_ref(&sim);
    let ctx = FormContext::new(sims, &[]);
    let c = array![0.0, 0.0, 1.0, 2.0, -1.0, 0.5];
    let form = WeightedSolutionForm::new(&sim, c.clone()).unwrap().with_weight(0.5);
    let x = no_design();
    assert_relative_eq!(form.value(x.view(), &ctx).unwrap(), 0.5 * c.dot(&u), epsilon = 1e-12);
    let rhs = form.adjoint_rhs(x.view(), &ctx).unwrap();
    assert_eq!(rhs.column(0).to_vec(), (&c * 0.5).to_vec());
    assert!(matches!(
        WeightedSolutionForm::new(&sim, Array1::zeros(4)),
        Err(AdjointError::Config(_))
    ));
}
