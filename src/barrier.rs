//! Collision barrier on the shape of the tracked surface.
//!
//! The potential is the smoothly clamped log barrier
//! `b(d) = −(d − d̂)² ln(d / d̂)` for `0 < d < d̂`, summed over the active
//! constraint set.  Constraints are vertex pairs of the collision surface
//! that do not share an edge and vertices close to the inside of an edge,
//! both found with a uniform hash grid.
//!
//! The functional only depends on geometry: the adjoint right-hand side is
//! zero and all sensitivity flows through shape variables.

use crate::memo::EqualityGated;
use crate::objectives::{AdjointForm, FormContext};
use crate::parametrization::ParameterType;
use crate::simulation::Simulation;
use crate::types::{AdjointError, ContactKind, ContactPair, Result, SimulationId};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use tracing::{debug, trace};

// ─────────────────────────────────────────────────────────────
//  Scalar barrier
// ─────────────────────────────────────────────────────────────

pub fn barrier(d: f64, dhat: f64) -> f64 {
    if d <= 0.0 {
        return f64::INFINITY;
    }
    if d >= dhat {
        return 0.0;
    }
    -(d - dhat).powi(2) * (d / dhat).ln()
}

pub fn barrier_grad(d: f64, dhat: f64) -> f64 {
    if d <= 0.0 || d >= dhat {
        return 0.0;
    }
    -2.0 * (d - dhat) * (d / dhat).ln() - (d - dhat).powi(2) / d
}

// ─────────────────────────────────────────────────────────────
//  Backend trait
// ─────────────────────────────────────────────────────────────

/// Geometry backend: surfaces are `n_vertices × dim`, edges index rows.
pub trait BarrierPotential: Debug + Send + Sync {
    fn build_constraints(&self, surface: ArrayView2<f64>, edges: &[[usize; 2]]) -> Vec<ContactPair>;

    fn potential(&self, surface: ArrayView2<f64>, edges: &[[usize; 2]], constraints: &[ContactPair]) -> f64;

    /// Gradient per surface vertex, same shape as `surface`.
    fn gradient(&self, surface: ArrayView2<f64>, edges: &[[usize; 2]], constraints: &[ContactPair]) -> Array2<f64>;

    fn is_step_collision_free(&self, v0: ArrayView2<f64>, v1: ArrayView2<f64>, edges: &[[usize; 2]]) -> bool;

    /// Largest fraction of the step `v0 → v1` that stays collision free.
    fn max_step_size(&self, v0: ArrayView2<f64>, v1: ArrayView2<f64>, edges: &[[usize; 2]]) -> f64;
}

/// Point-point and point-edge barrier with linear-trajectory CCD.
#[derive(Debug, Clone, Copy)]
pub struct VertexBarrier {
    pub dhat: f64,
    /// Separation that counts as contact for CCD.
    pub min_separation: f64,
}

/// Fraction of the time of impact returned by the step-size query.
const CCD_CONSERVATIVE_FACTOR: f64 = 0.8;

/// Cap on conservative-advancement steps for one point-edge pair.
const CCD_MAX_ITERATIONS: usize = 10_000;

type Aabb = ([f64; 3], [f64; 3]);

fn overlaps(a: &Aabb, b: &Aabb, dim: usize) -> bool {
    (0..dim).all(|d| a.0[d] <= b.1[d] && b.0[d] <= a.1[d])
}

/// Uniform hash grid over vertex boxes.
struct HashGrid {
    dim: usize,
    cell: f64,
    cells: HashMap<[i64; 3], Vec<usize>>,
}

impl HashGrid {
    fn new(boxes: &[Aabb], dim: usize, pad: f64) -> Self {
        let cell = boxes
            .iter()
            .map(|(lo, hi)| (0..dim).map(|d| hi[d] - lo[d]).fold(0.0, f64::max))
            .fold(pad, f64::max)
            .max(f64::MIN_POSITIVE);
        let mut grid = Self {
            dim,
            cell,
            cells: HashMap::new(),
        };
        for (i, b) in boxes.iter().enumerate() {
            for key in grid.keys(b) {
                grid.cells.entry(key).or_default().push(i);
            }
        }
        grid
    }

    fn keys(&self, (lo, hi): &Aabb) -> Vec<[i64; 3]> {
        let mut a = [0i64; 3];
        let mut b = [0i64; 3];
        for d in 0..self.dim {
            a[d] = (lo[d] / self.cell).floor() as i64;
            b[d] = (hi[d] / self.cell).floor() as i64;
        }
        let mut keys = Vec::new();
        for x in a[0]..=b[0] {
            for y in a[1]..=b[1] {
                for z in a[2]..=b[2] {
                    keys.push([x, y, z]);
                }
            }
        }
        keys
    }

    /// Vertices sharing a cell with `b`, sorted and deduplicated.
    fn query(&self, b: &Aabb) -> Vec<usize> {
        let mut hits: Vec<usize> = self
            .keys(b)
            .iter()
            .filter_map(|k| self.cells.get(k))
            .flatten()
            .copied()
            .collect();
        hits.sort_unstable();
        hits.dedup();
        hits
    }
}

/// Broad-phase output: vertex pairs `[i, j]` and point-edge pairs
/// `[vertex, edge index]`.
#[derive(Debug, Default)]
struct Candidates {
    vertex_pairs: Vec<[usize; 2]>,
    point_edges: Vec<[usize; 2]>,
}

/// Distance from `p` to segment `a b` and the clamped segment parameter of
/// the closest point.
fn point_edge_distance(p: ArrayView1<f64>, a: ArrayView1<f64>, b: ArrayView1<f64>) -> (f64, f64) {
    let e = &b - &a;
    let r = &p - &a;
    let len2 = e.dot(&e);
    let s = if len2 > 0.0 { (r.dot(&e) / len2).clamp(0.0, 1.0) } else { 0.0 };
    let gap = &r - &(&e * s);
    (gap.dot(&gap).sqrt(), s)
}

fn lerp_row(v0: ArrayView2<f64>, v1: ArrayView2<f64>, i: usize, t: f64) -> Array1<f64> {
    &v0.row(i) + &((&v1.row(i) - &v0.row(i)) * t)
}

fn displacement(v0: ArrayView2<f64>, v1: ArrayView2<f64>, i: usize) -> f64 {
    let d = &v1.row(i) - &v0.row(i);
    d.dot(&d).sqrt()
}

impl VertexBarrier {
    pub fn new(dhat: f64) -> Result<Self> {
        if dhat.is_nan() || dhat <= 0.0 {
            return Err(AdjointError::Config(format!("barrier dhat must be positive, got {dhat}")));
        }
        Ok(Self {
            dhat,
            min_separation: 1e-6 * dhat,
        })
    }

    pub fn with_min_separation(mut self, s: f64) -> Self {
        self.min_separation = s;
        self
    }

    /// Candidate pairs whose swept boxes (grown by `pad`) overlap.  Vertex
    /// pairs joined by an edge and a vertex against its own edge are skipped.
    fn candidates(&self, v0: ArrayView2<f64>, v1: ArrayView2<f64>, edges: &[[usize; 2]], pad: f64) -> Candidates {
        let dim = v0.ncols();
        let boxes: Vec<Aabb> = (0..v0.nrows())
            .map(|i| {
                let mut lo = [0.0; 3];
                let mut hi = [0.0; 3];
                for d in 0..dim {
                    lo[d] = v0[[i, d]].min(v1[[i, d]]) - pad;
                    hi[d] = v0[[i, d]].max(v1[[i, d]]) + pad;
                }
                (lo, hi)
            })
            .collect();
        let grid = HashGrid::new(&boxes, dim, pad);

        let adjacent: HashSet<(usize, usize)> = edges.iter().map(|&[a, b]| (a.min(b), a.max(b))).collect();
        let mut seen = HashSet::new();
        let mut out = Candidates::default();
        for members in grid.cells.values() {
            for (k, &i) in members.iter().enumerate() {
                for &j in &members[k + 1..] {
                    let key = (i.min(j), i.max(j));
                    if adjacent.contains(&key) || !seen.insert(key) {
                        continue;
                    }
                    if overlaps(&boxes[i], &boxes[j], dim) {
                        out.vertex_pairs.push([key.0, key.1]);
                    }
                }
            }
        }

        for (e, &[a, b]) in edges.iter().enumerate() {
            let (lo_a, hi_a) = boxes[a];
            let (lo_b, hi_b) = boxes[b];
            let mut edge_box = (lo_a, hi_a);
            for d in 0..dim {
                edge_box.0[d] = lo_a[d].min(lo_b[d]);
                edge_box.1[d] = hi_a[d].max(hi_b[d]);
            }
            for p in grid.query(&edge_box) {
                if p != a && p != b && overlaps(&boxes[p], &edge_box, dim) {
                    out.point_edges.push([p, e]);
                }
            }
        }

        out.vertex_pairs.sort_unstable();
        out.point_edges.sort_unstable();
        out
    }

    /// First time in `[0, 1]` at which the pair comes within
    /// `min_separation`, if any.
    fn time_of_impact(&self, v0: ArrayView2<f64>, v1: ArrayView2<f64>, [i, j]: [usize; 2]) -> Option<f64> {
        let dim = v0.ncols();
        let r0: Vec<f64> = (0..dim).map(|d| v0[[j, d]] - v0[[i, d]]).collect();
        let dr: Vec<f64> = (0..dim).map(|d| (v1[[j, d]] - v1[[i, d]]) - r0[d]).collect();
        let a: f64 = dr.iter().map(|v| v * v).sum();
        let b: f64 = 2.0 * r0.iter().zip(&dr).map(|(r, v)| r * v).sum::<f64>();
        let c: f64 = r0.iter().map(|v| v * v).sum::<f64>() - self.min_separation.powi(2);
        if c <= 0.0 {
            return Some(0.0);
        }
        if a == 0.0 {
            return None;
        }
        let disc = b * b - 4.0 * a * c;
        if disc < 0.0 {
            return None;
        }
        let t = (-b - disc.sqrt()) / (2.0 * a);
        (0.0..=1.0).contains(&t).then_some(t)
    }

    /// Point-edge time of impact by conservative advancement.  The gap can
    /// close no faster than the point speed plus the faster edge end, so
    /// each advance by `gap / bound` stays on the safe side of contact.
    fn point_edge_time_of_impact(
        &self,
        v0: ArrayView2<f64>,
        v1: ArrayView2<f64>,
        edges: &[[usize; 2]],
        [p, e]: [usize; 2],
    ) -> Option<f64> {
        let [a, b] = edges[e];
        let bound = displacement(v0, v1, p) + displacement(v0, v1, a).max(displacement(v0, v1, b));
        let tol = (1e-3 * self.min_separation).max(1e-12);
        let mut t = 0.0;
        for _ in 0..CCD_MAX_ITERATIONS {
            let (d, _) = point_edge_distance(
                lerp_row(v0, v1, p, t).view(),
                lerp_row(v0, v1, a, t).view(),
                lerp_row(v0, v1, b, t).view(),
            );
            let gap = d - self.min_separation;
            if gap <= tol {
                return Some(t);
            }
            if bound == 0.0 {
                return None;
            }
            t += gap / bound;
            if t > 1.0 {
                return None;
            }
        }
        Some(t)
    }

    fn impacts<'a>(
        &'a self,
        v0: ArrayView2<'a, f64>,
        v1: ArrayView2<'a, f64>,
        edges: &'a [[usize; 2]],
    ) -> impl Iterator<Item = f64> + 'a {
        let c = self.candidates(v0, v1, edges, self.min_separation);
        let vv = c.vertex_pairs.into_iter().filter_map(move |pair| self.time_of_impact(v0, v1, pair));
        let pe = c
            .point_edges
            .into_iter()
            .filter_map(move |pair| self.point_edge_time_of_impact(v0, v1, edges, pair));
        vv.chain(pe)
    }
}

fn vertex_distance(surface: ArrayView2<f64>, i: usize, j: usize) -> f64 {
    (0..surface.ncols())
        .map(|d| (surface[[i, d]] - surface[[j, d]]).powi(2))
        .sum::<f64>()
        .sqrt()
}

fn constraint_distance(surface: ArrayView2<f64>, edges: &[[usize; 2]], c: &ContactPair) -> f64 {
    let [i, j] = c.primitives;
    match c.kind {
        ContactKind::VertexVertex => vertex_distance(surface, i, j),
        ContactKind::VertexEdge => {
            let [a, b] = edges[j];
            point_edge_distance(surface.row(i), surface.row(a), surface.row(b)).0
        }
    }
}

impl BarrierPotential for VertexBarrier {
    /// Vertex pairs within `dhat`, plus vertex-edge pairs within `dhat`
    /// whose closest point lies strictly inside the edge.  Closest points at
    /// an edge end are covered by the vertex pair.
    fn build_constraints(&self, surface: ArrayView2<f64>, edges: &[[usize; 2]]) -> Vec<ContactPair> {
        let c = self.candidates(surface, surface, edges, 0.5 * self.dhat);
        let vertex = c.vertex_pairs.into_iter().filter_map(|[i, j]| {
            let distance = vertex_distance(surface, i, j);
            (distance < self.dhat).then_some(ContactPair {
                kind: ContactKind::VertexVertex,
                primitives: [i, j],
                distance,
            })
        });
        let edge = c.point_edges.into_iter().filter_map(|[p, e]| {
            let [a, b] = edges[e];
            let (distance, s) = point_edge_distance(surface.row(p), surface.row(a), surface.row(b));
            (distance < self.dhat && s > 0.0 && s < 1.0).then_some(ContactPair {
                kind: ContactKind::VertexEdge,
                primitives: [p, e],
                distance,
            })
        });
        vertex.chain(edge).collect()
    }

    fn potential(&self, surface: ArrayView2<f64>, edges: &[[usize; 2]], constraints: &[ContactPair]) -> f64 {
        constraints
            .iter()
            .map(|c| barrier(constraint_distance(surface, edges, c), self.dhat))
            .sum()
    }

    fn gradient(&self, surface: ArrayView2<f64>, edges: &[[usize; 2]], constraints: &[ContactPair]) -> Array2<f64> {
        let mut g = Array2::zeros(surface.dim());
        for c in constraints {
            let [i, j] = c.primitives;
            match c.kind {
                ContactKind::VertexVertex => {
                    let d = vertex_distance(surface, i, j);
                    let db = barrier_grad(d, self.dhat);
                    if db == 0.0 {
                        continue;
                    }
                    for k in 0..surface.ncols() {
                        let n = (surface[[i, k]] - surface[[j, k]]) / d;
                        g[[i, k]] += db * n;
                        g[[j, k]] -= db * n;
                    }
                }
                ContactKind::VertexEdge => {
                    let [a, b] = edges[j];
                    let (d, s) = point_edge_distance(surface.row(i), surface.row(a), surface.row(b));
                    let db = barrier_grad(d, self.dhat);
                    if db == 0.0 {
                        continue;
                    }
                    for k in 0..surface.ncols() {
                        let closest = (1.0 - s) * surface[[a, k]] + s * surface[[b, k]];
                        let n = (surface[[i, k]] - closest) / d;
                        g[[i, k]] += db * n;
                        g[[a, k]] -= db * (1.0 - s) * n;
                        g[[b, k]] -= db * s * n;
                    }
                }
            }
        }
        g
    }

    fn is_step_collision_free(&self, v0: ArrayView2<f64>, v1: ArrayView2<f64>, edges: &[[usize; 2]]) -> bool {
        self.impacts(v0.view(), v1.view(), edges).next().is_none()
    }

    fn max_step_size(&self, v0: ArrayView2<f64>, v1: ArrayView2<f64>, edges: &[[usize; 2]]) -> f64 {
        self.impacts(v0.view(), v1.view(), edges)
            .map(|t| CCD_CONSERVATIVE_FACTOR * t)
            .fold(1.0, f64::min)
    }
}

// ─────────────────────────────────────────────────────────────
//  Objective
// ─────────────────────────────────────────────────────────────

/// Barrier energy of the shape-updated collision surface.
#[derive(Debug)]
pub struct CollisionBarrierForm {
    sim: SimulationId,
    weight: f64,
    backend: Box<dyn BarrierPotential>,
    constraints: EqualityGated<Array2<f64>, Vec<ContactPair>>,
}

impl CollisionBarrierForm {
    pub fn new(sim: &Simulation, backend: Box<dyn BarrierPotential>) -> Result<Self> {
        if sim.mesh().collision_vertices().is_empty() {
            return Err(AdjointError::Config("collision barrier needs a collision surface".into()));
        }
        Ok(Self {
            sim: sim.id(),
            weight: 1.0,
            backend,
            constraints: EqualityGated::new(),
        })
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    /// Number of constraint-set builds so far.
    pub fn constraint_rebuilds(&self) -> usize {
        self.constraints.rebuilds()
    }

    /// Rest node positions (flattened) with shape variables applied.
    fn updated_nodes(&self, x: ArrayView1<f64>, ctx: &FormContext) -> Result<Array1<f64>> {
        let sim = ctx.simulation(self.sim)?;
        let mut nodes = Array1::from_iter(sim.mesh().rest_positions().iter().copied());
        for v in ctx.variables_for(self.sim).filter(|v| v.kind() == ParameterType::Shape) {
            v.update(x, &mut nodes)?;
        }
        Ok(nodes)
    }

    fn displaced_surface(&self, x: ArrayView1<f64>, ctx: &FormContext) -> Result<Array2<f64>> {
        let sim = ctx.simulation(self.sim)?;
        let nodes = self.updated_nodes(x, ctx)?;
        let dim = sim.dim();
        let verts = sim.mesh().collision_vertices();
        let mut surface = Array2::zeros((verts.len(), dim));
        for (row, &node) in verts.iter().enumerate() {
            for d in 0..dim {
                surface[[row, d]] = nodes[node * dim + d];
            }
        }
        Ok(surface)
    }

    fn constraint_set(&self) -> Result<&[ContactPair]> {
        self.constraints
            .get()
            .map(Vec::as_slice)
            .ok_or(AdjointError::NotInitialized("collision constraint set"))
    }
}

impl AdjointForm for CollisionBarrierForm {
    fn name(&self) -> &str {
        "collision barrier"
    }

    fn weight(&self) -> f64 {
        self.weight
    }

    fn simulation(&self) -> SimulationId {
        self.sim
    }

    fn solution_changed(&mut self, x: ArrayView1<f64>, ctx: &FormContext) -> Result<()> {
        let surface = self.displaced_surface(x, ctx)?;
        let edges = ctx.simulation(self.sim)?.mesh().collision_edges();
        let backend = &self.backend;
        if self
            .constraints
            .refresh(&surface, |s| Ok(backend.build_constraints(s.view(), edges)))?
        {
            debug!(
                active = self.constraints.get().map_or(0, Vec::len),
                "rebuilt collision constraint set"
            );
        }
        Ok(())
    }

    fn value_unweighted(&self, x: ArrayView1<f64>, ctx: &FormContext) -> Result<f64> {
        let surface = self.displaced_surface(x, ctx)?;
        let edges = ctx.simulation(self.sim)?.mesh().collision_edges();
        Ok(self.backend.potential(surface.view(), edges, self.constraint_set()?))
    }

    fn adjoint_rhs_unweighted(&self, _x: ArrayView1<f64>, ctx: &FormContext) -> Result<Array2<f64>> {
        let sim = ctx.simulation(self.sim)?;
        Ok(Array2::zeros((sim.ndof(), sim.n_adjoint_columns())))
    }

    fn partial_gradient_unweighted(&self, x: ArrayView1<f64>, ctx: &FormContext) -> Result<Array1<f64>> {
        let sim = ctx.simulation(self.sim)?;
        let surface = self.displaced_surface(x, ctx)?;
        let edges = sim.mesh().collision_edges();
        let g_surface = self.backend.gradient(surface.view(), edges, self.constraint_set()?);

        let dim = sim.dim();
        let mut g_nodes = Array1::zeros(sim.mesh().n_nodes() * dim);
        for (row, &node) in sim.mesh().collision_vertices().iter().enumerate() {
            for d in 0..dim {
                g_nodes[node * dim + d] += g_surface[[row, d]];
            }
        }

        let mut grad = Array1::zeros(x.len());
        for v in ctx.variables_for(self.sim).filter(|v| v.kind() == ParameterType::Shape) {
            grad += &v.apply_parametrization_jacobian(g_nodes.view(), x)?;
        }
        Ok(grad)
    }

    fn is_step_collision_free(&self, x0: ArrayView1<f64>, x1: ArrayView1<f64>, ctx: &FormContext) -> Result<bool> {
        let v0 = self.displaced_surface(x0, ctx)?;
        let v1 = self.displaced_surface(x1, ctx)?;
        if v0 == v1 {
            return Ok(true);
        }
        let edges = ctx.simulation(self.sim)?.mesh().collision_edges();
        let free = self.backend.is_step_collision_free(v0.view(), v1.view(), edges);
        trace!(free, "collision check");
        Ok(free)
    }

    fn max_step_size(&self, x0: ArrayView1<f64>, x1: ArrayView1<f64>, ctx: &FormContext) -> Result<f64> {
        let v0 = self.displaced_surface(x0, ctx)?;
        let v1 = self.displaced_surface(x1, ctx)?;
        let edges = ctx.simulation(self.sim)?.mesh().collision_edges();
        Ok(self.backend.max_step_size(v0.view(), v1.view(), edges))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    #[test]
    fn barrier_vanishes_at_dhat_and_matches_derivative() {
        let dhat = 0.1;
        assert_eq!(barrier(dhat, dhat), 0.0);
        assert_eq!(barrier(0.2, dhat), 0.0);
        assert!(barrier(0.01, dhat) > barrier(0.05, dhat));
        let h = 1e-7;
        for d in [0.01, 0.04, 0.09] {
            let fd = (barrier(d + h, dhat) - barrier(d - h, dhat)) / (2.0 * h);
            assert_relative_eq!(barrier_grad(d, dhat), fd, epsilon = 1e-6);
        }
    }

    #[test]
    fn adjacent_vertices_are_not_constrained() {
        let b = VertexBarrier::new(0.5).unwrap();
        let surface = array![[0.0, 0.0], [0.1, 0.0], [0.0, 0.2], [5.0, 5.0]];
        let set = b.build_constraints(surface.view(), &[[0, 1]]);
        // vertex 2 projects onto the end of edge (0, 1), so the vertex pair covers it
        assert!(set.iter().all(|c| c.kind == ContactKind::VertexVertex));
        let pairs: Vec<[usize; 2]> = set.iter().map(|c| c.primitives).collect();
        assert_eq!(pairs, vec![[0, 2], [1, 2]]);
    }

    #[test]
    fn vertex_over_an_edge_is_constrained() {
        let b = VertexBarrier::new(0.5).unwrap();
        let surface = array![[-1.0, 0.0], [1.0, 0.0], [0.2, 0.3]];
        let edges = [[0, 1]];
        let set = b.build_constraints(surface.view(), &edges);
        assert_eq!(set.len(), 1);
        assert_eq!(set[0].kind, ContactKind::VertexEdge);
        assert_eq!(set[0].primitives, [2, 0]);
        assert_relative_eq!(set[0].distance, 0.3, epsilon = 1e-12);

        let g = b.gradient(surface.view(), &edges, &set);
        let h = 1e-7;
        for i in 0..3 {
            for d in 0..2 {
                let mut sp = surface.clone();
                let mut sm = surface.clone();
                sp[[i, d]] += h;
                sm[[i, d]] -= h;
                let fd = (b.potential(sp.view(), &edges, &set) - b.potential(sm.view(), &edges, &set)) / (2.0 * h);
                assert_relative_eq!(g[[i, d]], fd, epsilon = 1e-5);
            }
        }
        // the barrier pushes the vertex up and the edge down
        assert!(g[[2, 1]] < 0.0);
        assert!(g[[0, 1]] > 0.0 && g[[1, 1]] > 0.0);
    }

    #[test]
    fn gradient_matches_finite_difference() {
        let b = VertexBarrier::new(0.5).unwrap();
        let surface = array![[0.0, 0.0], [0.3, 0.1], [0.1, 0.35]];
        let set = b.build_constraints(surface.view(), &[]);
        assert_eq!(set.len(), 3);
        let g = b.gradient(surface.view(), &[], &set);
        let h = 1e-7;
        for i in 0..3 {
            for d in 0..2 {
                let mut sp = surface.clone();
                let mut sm = surface.clone();
                sp[[i, d]] += h;
                sm[[i, d]] -= h;
                let fd = (b.potential(sp.view(), &[], &set) - b.potential(sm.view(), &[], &set)) / (2.0 * h);
                assert_relative_eq!(g[[i, d]], fd, epsilon = 1e-5);
            }
        }
    }

    #[test]
    fn crossing_step_is_cut_back() {
        let b = VertexBarrier::new(0.1).unwrap().with_min_separation(0.01);
        let v0 = array![[0.0, 0.0], [1.0, 0.0]];
        let v1 = array![[0.0, 0.0], [-1.0, 0.0]];
        assert!(!b.is_step_collision_free(v0.view(), v1.view(), &[]));
        let alpha = b.max_step_size(v0.view(), v1.view(), &[]);
        // impact at |1 − 2t| = 0.01
        assert_relative_eq!(alpha, 0.8 * 0.495, epsilon = 1e-12);

        let parallel = array![[0.0, 1.0], [1.0, 1.0]];
        assert!(b.is_step_collision_free(v0.view(), parallel.view(), &[]));
        assert_eq!(b.max_step_size(v0.view(), parallel.view(), &[]), 1.0);
    }

    #[test]
    fn vertex_passing_through_an_edge_is_caught() {
        let b = VertexBarrier::new(0.1).unwrap();
        let edges = [[0, 1]];
        let v0 = array![[-1.0, 0.0], [1.0, 0.0], [0.0, 1.0]];
        let v1 = array![[-1.0, 0.0], [1.0, 0.0], [0.0, -1.0]];
        assert!(!b.is_step_collision_free(v0.view(), v1.view(), &edges));
        let alpha = b.max_step_size(v0.view(), v1.view(), &edges);
        assert!(alpha < 0.5);
        assert_relative_eq!(alpha, 0.8 * 0.5, epsilon = 1e-6);
    }

    #[test]
    fn vertex_passing_beside_an_edge_is_free() {
        let b = VertexBarrier::new(0.1).unwrap();
        let edges = [[0, 1]];
        // crosses the line y = 0 at x = 1.2, past the end of the edge
        let v0 = array![[-1.0, 0.0], [1.0, 0.0], [1.5, 1.0]];
        let v1 = array![[-1.0, 0.0], [1.0, 0.0], [0.9, -1.0]];
        assert!(b.is_step_collision_free(v0.view(), v1.view(), &edges));
        assert_eq!(b.max_step_size(v0.view(), v1.view(), &edges), 1.0);
    }
}
