//! Static and transient adjoint solves.
//!
//! Static:  Kᵀ y = R on the free DOFs, Dirichlet rows of `y` zero.
//!
//! Transient: backward BDF recursion over the cached steps.  Two dual
//! series are carried, `p` (the adjoint state handed to callers) and `nu`
//! (the dual of the implicit coupling).  Both have `time_steps + 2`
//! columns so that `i + 1` and `i + 2` stay in range at the last step.
//!
//! For a linear forward pass of the form
//!
//! ```text
//! (M + (β dt)² K) x_i = M x̃_i + (β dt)² (f_i − G_i x_{i−1})
//! ```
//!
//! with `G_i` the previous-state tangent handed over with step `i`,
//! the duals give `dJ/dx_0 = −nu[0]`, `dJ/dv_0 = −p[0]` and
//! `dJ/df_i = −β_i dt · p[i]` on the free DOFs.

use crate::bc::{full_to_reduced, reduced_to_full, replace_rows_with_identity, zero_boundary_rows};
use crate::bdf;
use crate::cache::ForwardCache;
use crate::config::{AdjointSettings, TimeIntegration};
use crate::linalg::{create_solver, restrict_to_free, spmv_transpose, transpose, LinearSolver};
use crate::types::{AdjointError, BoundaryNodeSet, Result};
use ndarray::{s, Array1, Array2, ArrayView1, ArrayView2, Axis};
use sprs::CsMat;
use tracing::{debug, trace, warn};

// ─────────────────────────────────────────────────────────────
//  Result types
// ─────────────────────────────────────────────────────────────

/// Dual series of a transient solve.
#[derive(Debug, Clone, PartialEq)]
pub struct AdjointSeries {
    p: Array2<f64>,
    nu: Array2<f64>,
    time_steps: usize,
}

impl AdjointSeries {
    /// `p`, one column per time step (sentinels excluded).
    pub fn p(&self) -> ArrayView2<'_, f64> {
        self.p.slice(s![.., ..=self.time_steps])
    }

    pub fn p_at(&self, step: usize) -> ArrayView1<'_, f64> {
        self.p.column(step)
    }

    /// Dual of the initial displacement (`nu[0]`).
    pub fn initial_nu(&self) -> ArrayView1<'_, f64> {
        self.nu.column(0)
    }

    pub fn time_steps(&self) -> usize {
        self.time_steps
    }

    pub(crate) fn nu(&self) -> ArrayView2<'_, f64> {
        self.nu.view()
    }
}

/// What [`crate::simulation::Simulation::solve_adjoint`] hands back.
#[derive(Debug, Clone, PartialEq)]
pub enum AdjointSolution {
    /// One column per right-hand side.
    Static(Array2<f64>),
    Transient(AdjointSeries),
}

impl AdjointSolution {
    /// Adjoint state: static columns, or `p` per time step.
    pub fn p(&self) -> ArrayView2<'_, f64> {
        match self {
            AdjointSolution::Static(y) => y.view(),
            AdjointSolution::Transient(series) => series.p(),
        }
    }

    pub fn as_transient(&self) -> Option<&AdjointSeries> {
        match self {
            AdjointSolution::Transient(series) => Some(series),
            AdjointSolution::Static(_) => None,
        }
    }
}

// ─────────────────────────────────────────────────────────────
//  Reduced solves
// ─────────────────────────────────────────────────────────────

/// Factor `a` restricted to the free DOFs.  `None` when every DOF is fixed.
fn factor_free(a: &CsMat<f64>, boundary: &BoundaryNodeSet, backend: &str) -> Result<Option<Box<dyn LinearSolver>>> {
    if boundary.len() == boundary.ndof() {
        return Ok(None);
    }
    let reduced = restrict_to_free(a, boundary);
    let mut solver = create_solver(backend)?;
    solver.factorize(reduced.view())?;
    Ok(Some(solver))
}

/// Solve on the free DOFs and scatter back, Dirichlet entries zero.
fn solve_free(
    solver: Option<&dyn LinearSolver>,
    rhs: ArrayView1<f64>,
    boundary: &BoundaryNodeSet,
) -> Result<Array1<f64>> {
    match solver {
        Some(solver) => {
            let r = full_to_reduced(rhs, boundary);
            let x = solver.solve(&r.to_vec())?;
            Ok(reduced_to_full(&x, boundary))
        }
        None => Ok(Array1::zeros(boundary.ndof())),
    }
}

fn check_rows(rhs: ArrayView2<f64>, ndof: usize) -> Result<()> {
    if rhs.nrows() != ndof {
        return Err(AdjointError::Shape(format!(
            "adjoint rhs has {} rows, system has {ndof} dofs",
            rhs.nrows()
        )));
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────
//  Static
// ─────────────────────────────────────────────────────────────

/// Static adjoint; uses the cached prefactorisation when one is held.
pub fn solve_static_adjoint(cache: &ForwardCache, rhs: ArrayView2<f64>, settings: &AdjointSettings) -> Result<Array2<f64>> {
    if cache.is_empty() {
        return Err(AdjointError::EmptyForwardCache);
    }
    if cache.prefactorized().is_some() {
        solve_static_prefactorized(cache, rhs)
    } else {
        solve_static_general(cache, rhs, settings)
    }
}

/// Constant-coefficient fast path.
///
/// The held factorisation is of the step-0 operator with Dirichlet rows
/// and columns set to identity, so the symmetric tangent case is exact.
pub fn solve_static_prefactorized(cache: &ForwardCache, rhs: ArrayView2<f64>) -> Result<Array2<f64>> {
    if cache.is_empty() {
        return Err(AdjointError::EmptyForwardCache);
    }
    let solver = cache.prefactorized().ok_or(AdjointError::MissingFactorization)?;
    let boundary = cache.boundary();
    check_rows(rhs, cache.ndof())?;
    debug!(backend = solver.name(), cols = rhs.ncols(), "static adjoint, prefactorized path");

    let mut b = rhs.to_owned();
    zero_boundary_rows(&mut b, boundary);

    let mut y = Array2::zeros(b.raw_dim());
    for (col, mut out) in b.axis_iter(Axis(1)).zip(y.axis_iter_mut(Axis(1))) {
        let x = solver.solve(&col.to_vec())?;
        out.assign(&Array1::from(x));
    }
    zero_boundary_rows(&mut y, boundary);
    Ok(y)
}

/// Fresh factorisation of Kᵀ restricted to the free DOFs.
pub fn solve_static_general(cache: &ForwardCache, rhs: ArrayView2<f64>, settings: &AdjointSettings) -> Result<Array2<f64>> {
    let rec = cache.record(0)?;
    let boundary = cache.boundary();
    check_rows(rhs, cache.ndof())?;
    debug!(backend = %settings.adjoint_solver, cols = rhs.ncols(), "static adjoint, general path");

    let mut b = rhs.to_owned();
    zero_boundary_rows(&mut b, boundary);

    let solver = factor_free(&transpose(rec.tangent()), boundary, &settings.adjoint_solver)?;
    let mut y = Array2::zeros(b.raw_dim());
    for (col, mut out) in b.axis_iter(Axis(1)).zip(y.axis_iter_mut(Axis(1))) {
        out.assign(&solve_free(solver.as_deref(), col, boundary)?);
    }
    zero_boundary_rows(&mut y, boundary);
    Ok(y)
}

// ─────────────────────────────────────────────────────────────
//  Transient
// ─────────────────────────────────────────────────────────────

/// Backward BDF recursion.
///
/// `rhs` has one column per time step (`time_steps + 1`).  With
/// `time_steps == 0` this is exactly the static solve.
pub fn solve_transient_adjoint(
    cache: &ForwardCache,
    mass: &CsMat<f64>,
    time: &TimeIntegration,
    rhs: ArrayView2<f64>,
    settings: &AdjointSettings,
) -> Result<AdjointSeries> {
    time.validate()?;
    if cache.is_empty() {
        return Err(AdjointError::EmptyForwardCache);
    }
    let n = cache.ndof();
    let steps = time.time_steps;
    let bdf_order = time.bdf_order;
    let dt = time.dt;
    check_rows(rhs, n)?;
    if rhs.ncols() != steps + 1 {
        return Err(AdjointError::Shape(format!(
            "adjoint rhs has {} columns, expected {} (time_steps + 1)",
            rhs.ncols(),
            steps + 1
        )));
    }
    if cache.len() != steps + 1 {
        return Err(AdjointError::DataConsistency(format!(
            "forward cache holds {} steps, time integration has {}",
            cache.len(),
            steps + 1
        )));
    }
    if mass.shape() != (n, n) {
        return Err(AdjointError::Shape(format!(
            "mass is {}x{}, expected {n}x{n}",
            mass.rows(),
            mass.cols()
        )));
    }

    let cols = steps + 2;
    let mut p = Array2::zeros((n, cols));
    let mut nu = Array2::zeros((n, cols));

    if steps == 0 {
        let y = solve_static_adjoint(cache, rhs, settings)?;
        p.column_mut(0).assign(&y.column(0));
        return Ok(AdjointSeries { p, nu, time_steps: 0 });
    }

    let boundary = cache.boundary();
    if bdf_order > 2 && !boundary.is_empty() {
        warn!(bdf_order, "boundary correction of the adjoint recursion is exact only up to BDF2");
    }
    debug!(steps, bdf_order, dt, backend = %settings.adjoint_solver, "transient adjoint");

    let reduced_mass = replace_rows_with_identity(mass, boundary);

    for i in (0..=steps).rev() {
        let rec = cache.record(i)?;
        let order = bdf::order_at(bdf_order, i);

        let mut sum_alpha_p = Array1::<f64>::zeros(n);
        let mut sum_alpha_nu = Array1::<f64>::zeros(n);
        let num = bdf_order.min(steps - i);
        for j in 0..num {
            let o = (bdf_order - 1).min(i + j);
            let a = bdf::alphas(o + 1)[j];
            sum_alpha_p.scaled_add(-a, &p.column(i + j + 1));
            sum_alpha_nu.scaled_add(-a, &nu.column(i + j + 1));
        }

        // the coupling lives in the residual of step i + 1 and carries its β dt
        let coupling_t_p = match rec.next_coupling() {
            Some(c) => {
                let next_beta_dt = bdf::beta(bdf::order_at(bdf_order, i + 1)) * dt;
                spmv_transpose(c, p.column(i + 1)) * (-next_beta_dt)
            }
            None => Array1::zeros(n),
        };

        if i > 0 {
            let beta_dt = bdf::beta(order) * dt;
            let tangent = rec.tangent();
            let mut r = -spmv_transpose(&reduced_mass, sum_alpha_nu.view());
            let k_minus_m_t = spmv_transpose(tangent, sum_alpha_p.view())
                - spmv_transpose(&reduced_mass, sum_alpha_p.view());
            r.scaled_add(1.0 / beta_dt, &k_minus_m_t);
            r += &coupling_t_p;
            r -= &rhs.column(i);

            // BDF2 stencil at Dirichlet rows
            for &b in boundary.indices() {
                r[b] += -2.0 / beta_dt * p[[b, i + 1]];
                if i + 2 < cols {
                    r[b] += 1.0 / beta_dt * p[[b, i + 2]];
                }
            }

            let kt = transpose(tangent);
            let solver = factor_free(&kt, boundary, &settings.adjoint_solver)?;
            let mut nu_i = solve_free(solver.as_deref(), r.view(), boundary)?;

            let residual = &r - &spmv_transpose(tangent, nu_i.view());
            for &b in boundary.indices() {
                nu_i[b] = residual[b];
            }

            let mut p_i = nu_i.clone() * beta_dt;
            p_i -= &sum_alpha_p;
            nu.column_mut(i).assign(&nu_i);
            p.column_mut(i).assign(&p_i);
            trace!(step = i, order, beta_dt, "adjoint step");
        } else {
            let p0 = -spmv_transpose(&reduced_mass, sum_alpha_p.view());
            let mut nu0 = -spmv_transpose(&reduced_mass, sum_alpha_nu.view());
            nu0 -= &rhs.column(0);
            nu0 += &coupling_t_p;
            p.column_mut(0).assign(&p0);
            nu.column_mut(0).assign(&nu0);
            trace!(step = 0, "adjoint initial step");
        }
    }

    Ok(AdjointSeries {
        p,
        nu,
        time_steps: steps,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::StepInput;
    use crate::linalg::identity;
    use approx::assert_relative_eq;
    use sprs::TriMat;
    use std::sync::Arc;

    fn scalar(v: f64) -> CsMat<f64> {
        let mut tri = TriMat::new((1, 1));
        tri.add_triplet(0, 0, v);
        tri.to_csc()
    }

    fn tridiag(n: usize, d: f64, off: f64, skew: f64) -> CsMat<f64> {
        let mut tri = TriMat::new((n, n));
        for i in 0..n {
            tri.add_triplet(i, i, d);
            if i + 1 < n {
                tri.add_triplet(i, i + 1, off + skew);
                tri.add_triplet(i + 1, i, off - skew);
            }
        }
        tri.to_csc()
    }

    fn transient_cache(n: usize, fixed: &[usize], steps: usize) -> ForwardCache {
        let b = Arc::new(BoundaryNodeSet::new(n, fixed.iter().copied()).unwrap());
        let mut c = ForwardCache::new(b);
        for k in 0..=steps {
            let tangent = tridiag(n, 3.0 + k as f64 * 0.1, -1.0, 0.2);
            let mut input = StepInput::new(tangent, Array1::zeros(n));
            if k > 0 {
                input = input.with_tangent_prev(tridiag(n, 0.05, 0.01, 0.0));
            }
            c.push(input).unwrap();
        }
        c
    }

    /// `transient_cache` tangents are skewed, so the symmetric default is out.
    fn lu() -> AdjointSettings {
        AdjointSettings {
            adjoint_solver: "dense_lu".into(),
            ..AdjointSettings::default()
        }
    }

    fn rhs(n: usize, cols: usize) -> Array2<f64> {
        Array2::from_shape_fn((n, cols), |(i, j)| ((i * 7 + j * 3) % 5) as f64 - 2.0)
    }

    #[test]
    fn one_dof_backward_euler_by_hand() {
        let (m, k, dt, r0, r1) = (2.0, 5.0, 0.1, 0.3, 0.7);
        let mut c = ForwardCache::new(Arc::new(BoundaryNodeSet::empty(1)));
        c.push(StepInput::new(scalar(k), Array1::zeros(1))).unwrap();
        c.push(StepInput::new(scalar(k), Array1::zeros(1))).unwrap();
        let time = TimeIntegration::new(dt, 1, 1).unwrap();
        let r = Array2::from_shape_vec((1, 2), vec![r0, r1]).unwrap();

        let s = solve_transient_adjoint(&c, &scalar(m), &time, r.view(), &AdjointSettings::default()).unwrap();
        assert_relative_eq!(s.nu()[[0, 1]], -r1 / k, epsilon = 1e-14);
        assert_relative_eq!(s.p()[[0, 1]], -dt * r1 / k, epsilon = 1e-14);
        assert_relative_eq!(s.p()[[0, 0]], -m * dt * r1 / k, epsilon = 1e-14);
        assert_relative_eq!(s.initial_nu()[0], -r0 - m * r1 / k, epsilon = 1e-14);
        assert_eq!(s.p().ncols(), 2);
    }

    #[test]
    fn previous_step_coupling_by_hand() {
        // (m + dt² k) x1 = m (x0 + dt v0) + dt² (f − g x0)
        let (m, k, g, dt, r0, r1) = (2.0, 5.0, 0.8, 0.1, 0.3, 0.7);
        let t = m + dt * dt * k;
        let mut c = ForwardCache::new(Arc::new(BoundaryNodeSet::empty(1)));
        c.push(StepInput::new(scalar(k), Array1::zeros(1))).unwrap();
        c.push(StepInput::new(scalar(t), Array1::zeros(1)).with_tangent_prev(scalar(g)))
            .unwrap();
        let time = TimeIntegration::new(dt, 1, 1).unwrap();
        let r = Array2::from_shape_vec((1, 2), vec![r0, r1]).unwrap();

        let s = solve_transient_adjoint(&c, &scalar(m), &time, r.view(), &AdjointSettings::default()).unwrap();
        // the last step has nothing after it to couple to
        assert_relative_eq!(s.nu()[[0, 1]], -r1 / t, epsilon = 1e-14);
        assert_relative_eq!(s.p()[[0, 0]], -m * dt * r1 / t, epsilon = 1e-14);
        // dJ/dx0 = r0 + r1 (m − dt² g) / t
        let dj_dx0 = r0 + r1 * (m - dt * dt * g) / t;
        assert_relative_eq!(-s.initial_nu()[0], dj_dx0, epsilon = 1e-14);
    }

    #[test]
    fn coupling_uses_the_order_of_the_coupled_step() {
        // BDF2 warm-up: step 1 runs at order 1, step 2 at order 2, so the
        // coupling of step 2 into step 1 carries β₂ dt
        let dt = 0.1;
        let (m, t, g) = (1.5, 2.0, 0.6);
        let mut c = ForwardCache::new(Arc::new(BoundaryNodeSet::empty(1)));
        c.push(StepInput::new(scalar(t), Array1::zeros(1))).unwrap();
        c.push(StepInput::new(scalar(t), Array1::zeros(1))).unwrap();
        c.push(StepInput::new(scalar(t), Array1::zeros(1)).with_tangent_prev(scalar(g)))
            .unwrap();
        let time = TimeIntegration::new(dt, 2, 2).unwrap();
        let r = Array2::from_shape_vec((1, 3), vec![0.0, 0.0, 1.0]).unwrap();
        let s = solve_transient_adjoint(&c, &scalar(m), &time, r.view(), &AdjointSettings::default()).unwrap();

        let b2 = bdf::beta(2) * dt;
        let (b1, a2) = (bdf::beta(1) * dt, bdf::alphas(2));
        let nu2 = -1.0 / t;
        let p2 = b2 * nu2;
        // step 1: sum_alpha uses the order-2 weights of step 2
        let (sp, snu) = (-a2[0] * p2, -a2[0] * nu2);
        let r1 = -m * snu + (t - m) / b1 * sp - b2 * g * p2;
        let nu1 = r1 / t;
        assert_relative_eq!(s.nu()[[0, 2]], nu2, epsilon = 1e-14);
        assert_relative_eq!(s.nu()[[0, 1]], nu1, epsilon = 1e-14);
        assert_relative_eq!(s.p()[[0, 1]], b1 * nu1 - sp, epsilon = 1e-14);
    }

    #[test]
    fn zero_steps_is_static() {
        let c = transient_cache(5, &[0, 4], 0);
        let settings = lu();
        let r = rhs(5, 1);
        let time = TimeIntegration::new(0.1, 0, 2).unwrap();
        let s = solve_transient_adjoint(&c, &identity(5), &time, r.view(), &settings).unwrap();
        let y = solve_static_adjoint(&c, r.view(), &settings).unwrap();
        assert_eq!(s.p().column(0), y.column(0));
    }

    #[test]
    fn recursion_is_deterministic() {
        let c = transient_cache(6, &[0], 5);
        let time = TimeIntegration::new(0.05, 5, 2).unwrap();
        let r = rhs(6, 6);
        let mass = tridiag(6, 2.0, 0.3, 0.0);
        let settings = lu();
        let a = solve_transient_adjoint(&c, &mass, &time, r.view(), &settings).unwrap();
        let b = solve_transient_adjoint(&c, &mass, &time, r.view(), &settings).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn recursion_is_linear_in_rhs() {
        let c = transient_cache(4, &[3], 4);
        let time = TimeIntegration::new(0.1, 4, 3).unwrap();
        let mass = identity(4);
        let settings = lu();
        let r1 = rhs(4, 5);
        let r2 = Array2::from_shape_fn((4, 5), |(i, j)| (i as f64 - j as f64) * 0.25);
        let sum = &r1 + &r2;
        let a = solve_transient_adjoint(&c, &mass, &time, r1.view(), &settings).unwrap();
        let b = solve_transient_adjoint(&c, &mass, &time, r2.view(), &settings).unwrap();
        let ab = solve_transient_adjoint(&c, &mass, &time, sum.view(), &settings).unwrap();
        for ((x, y), z) in a.p().iter().zip(b.p().iter()).zip(ab.p().iter()) {
            assert_relative_eq!(x + y, *z, epsilon = 1e-10);
        }
    }

    #[test]
    fn rejects_mismatched_inputs() {
        let c = transient_cache(3, &[], 2);
        let time = TimeIntegration::new(0.1, 3, 1).unwrap();
        let settings = lu();
        let err = solve_transient_adjoint(&c, &identity(3), &time, rhs(3, 3).view(), &settings).unwrap_err();
        assert!(matches!(err, AdjointError::Shape(_)));
        let err = solve_transient_adjoint(&c, &identity(3), &time, rhs(3, 4).view(), &settings).unwrap_err();
        assert!(matches!(err, AdjointError::DataConsistency(_)));

        let empty = ForwardCache::new(Arc::new(BoundaryNodeSet::empty(3)));
        let err = solve_static_adjoint(&empty, rhs(3, 1).view(), &settings).unwrap_err();
        assert!(matches!(err, AdjointError::EmptyForwardCache));
        let err = solve_static_prefactorized(&c, rhs(3, 1).view()).unwrap_err();
        assert!(matches!(err, AdjointError::MissingFactorization));
    }

    #[test]
    fn static_paths_agree_with_zero_boundary_rows() {
        let n = 6;
        let b = Arc::new(BoundaryNodeSet::new(n, [0, 5]).unwrap());
        let mut c = ForwardCache::new(b);
        c.push(StepInput::new(tridiag(n, 4.0, -1.0, 0.0), Array1::zeros(n))).unwrap();
        let r = rhs(n, 2);
        let settings = AdjointSettings::default();
        let general = solve_static_general(&c, r.view(), &settings).unwrap();
        c.prefactorize("ldl").unwrap();
        let fast = solve_static_adjoint(&c, r.view(), &settings).unwrap();
        for i in 0..n {
            for j in 0..2 {
                assert_relative_eq!(general[[i, j]], fast[[i, j]], epsilon = 1e-12);
            }
        }
        for j in 0..2 {
            assert_eq!(general[[0, j]], 0.0);
            assert_eq!(fast[[5, j]], 0.0);
        }
    }
}
