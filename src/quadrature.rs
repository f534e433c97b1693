//! Quadrature-point kernels and their parallel integration.
//!
//! A functional is described by a local value kernel `j` and its gradient
//! with respect to the displacement at the point, `∂j/∂u`.  Integration
//! runs over elements on the rayon pool; each worker accumulates into its
//! own buffer and the buffers are summed at the end.

use crate::mesh::{ElementQuadrature, MeshGeometry, Region};
use crate::types::Result;
use ndarray::{Array1, ArrayView1};
use rayon::prelude::*;

/// Everything a kernel may look at for one quadrature point.
#[derive(Debug, Clone, Copy)]
pub struct PointContext {
    pub step: usize,
    pub element: usize,
    pub body_id: i32,
    pub qp: usize,
    pub local: [f64; 3],
    /// Rest position of the point.
    pub rest: [f64; 3],
    /// Displacement of the point at `step`.
    pub u: [f64; 3],
    pub dim: usize,
}

impl PointContext {
    /// Current (deformed) position.
    pub fn position(&self) -> [f64; 3] {
        let mut x = self.rest;
        for d in 0..self.dim {
            x[d] += self.u[d];
        }
        x
    }
}

type ValueKernel<'a> = dyn Fn(&PointContext) -> f64 + Send + Sync + 'a;
type GradKernel<'a> = dyn Fn(&PointContext) -> [f64; 3] + Send + Sync + 'a;

pub struct IntegrableFunctional<'a> {
    j: Box<ValueKernel<'a>>,
    dj_du: Box<GradKernel<'a>>,
}

impl<'a> IntegrableFunctional<'a> {
    pub fn new<J, G>(j: J, dj_du: G) -> Self
    where
        J: Fn(&PointContext) -> f64 + Send + Sync + 'a,
        G: Fn(&PointContext) -> [f64; 3] + Send + Sync + 'a,
    {
        Self {
            j: Box::new(j),
            dj_du: Box::new(dj_du),
        }
    }

    pub fn eval(&self, ctx: &PointContext) -> f64 {
        (self.j)(ctx)
    }

    pub fn grad_u(&self, ctx: &PointContext) -> [f64; 3] {
        (self.dj_du)(ctx)
    }
}

fn for_each_point<F>(mesh: &MeshGeometry, q: &ElementQuadrature, u: ArrayView1<f64>, step: usize, mut f: F)
where
    F: FnMut(&PointContext, f64),
{
    let dim = mesh.dim();
    let rest = mesh.rest_positions();
    for qp in 0..q.n_points() {
        let mut local = [0.0; 3];
        for (d, l) in local.iter_mut().enumerate().take(q.local_points.ncols().min(3)) {
            *l = q.local_points[[qp, d]];
        }
        let ctx = PointContext {
            step,
            element: q.element,
            body_id: q.body_id,
            qp,
            local,
            rest: q.interpolate(qp, rest),
            u: q.interpolate_dofs(qp, u, dim),
            dim,
        };
        f(&ctx, q.weights[qp]);
    }
}

/// ∫ j over `region` for the displacement `u` of step `step`.
pub fn integrate_value(
    mesh: &MeshGeometry,
    region: &Region,
    functional: &IntegrableFunctional,
    u: ArrayView1<f64>,
    step: usize,
) -> f64 {
    mesh.elements_in(region)
        .par_iter()
        .fold(
            || 0.0,
            |mut acc, q| {
                for_each_point(mesh, q, u, step, |ctx, w| acc += w * functional.eval(ctx));
                acc
            },
        )
        .sum()
}

/// ∂/∂u of [`integrate_value`], as a node-major DOF vector.
pub fn integrate_adjoint_rhs(
    mesh: &MeshGeometry,
    region: &Region,
    functional: &IntegrableFunctional,
    u: ArrayView1<f64>,
    step: usize,
) -> Array1<f64> {
    let ndof = mesh.ndof();
    let dim = mesh.dim();
    mesh.elements_in(region)
        .par_iter()
        .fold(
            || Array1::zeros(ndof),
            |mut rhs, q| {
                for_each_point(mesh, q, u, step, |ctx, w| {
                    let g = functional.grad_u(ctx);
                    for (a, &node) in q.nodes.iter().enumerate() {
                        let n = w * q.shape[[ctx.qp, a]];
                        for d in 0..dim {
                            rhs[node * dim + d] += n * g[d];
                        }
                    }
                });
                rhs
            },
        )
        .reduce_with(|mut a, b| {
            a += &b;
            a
        })
        .unwrap_or_else(|| Array1::zeros(ndof))
}

/// Fallible accumulation over the points of `region`.
///
/// `kernel` adds the weighted contribution of one point into a per-worker
/// accumulator; the first error stops the sweep.
pub fn try_accumulate<T, Z, K, C>(
    mesh: &MeshGeometry,
    region: &Region,
    u: ArrayView1<f64>,
    step: usize,
    zero: Z,
    kernel: K,
    combine: C,
) -> Result<T>
where
    T: Send,
    Z: Fn() -> T + Send + Sync,
    K: Fn(&mut T, &ElementQuadrature, &PointContext, f64) -> Result<()> + Send + Sync,
    C: Fn(T, T) -> T + Send + Sync,
{
    mesh.elements_in(region)
        .par_iter()
        .try_fold(&zero, |mut acc, q| {
            let mut status = Ok(());
            for_each_point(mesh, q, u, step, |ctx, w| {
                if status.is_ok() {
                    status = kernel(&mut acc, q, ctx, w);
                }
            });
            status.map(|()| acc)
        })
        .try_reduce(&zero, |a, b| Ok(combine(a, b)))
}
