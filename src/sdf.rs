//! Distance-to-spline target.
//!
//! The target curve (2D) or patch (3D) is a clamped cubic B-spline.  It is
//! sampled densely once per control-point set, and the unsigned distance to
//! the sampled polyline / triangle fan is tabulated on a lazily filled
//! regular grid.  Queries interpolate the grid with tensor Catmull-Rom
//! splines, so the value and its spatial gradient are smooth.
//!
//! When the control points come from the design vector, each grid node also
//! stores `∂d/∂C`, giving the explicit part of the design gradient.

use crate::memo::EqualityGated;
use crate::mesh::Region;
use crate::objectives::{reject_shape_derivative, AdjointForm, FormContext, StepWindow};
use crate::parametrization::Parametrization;
use crate::quadrature::try_accumulate;
use crate::simulation::Simulation;
use crate::types::{AdjointError, Result, SimulationId, DEFAULT_SPLINE_SAMPLES};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use std::collections::HashMap;
use tracing::{debug, trace};

// ─────────────────────────────────────────────────────────────
//  B-spline basis
// ─────────────────────────────────────────────────────────────

/// Open uniform knot vector with `degree + 1` repeated end knots.
pub fn clamped_uniform_knots(n_ctrl: usize, degree: usize) -> Result<Vec<f64>> {
    if n_ctrl < degree + 1 {
        return Err(AdjointError::Config(format!(
            "{n_ctrl} control points cannot carry a degree {degree} spline"
        )));
    }
    let interior = n_ctrl - degree - 1;
    let mut knots = vec![0.0; degree + 1];
    knots.extend((1..=interior).map(|i| i as f64 / (interior + 1) as f64));
    knots.extend(std::iter::repeat(1.0).take(degree + 1));
    Ok(knots)
}

/// The knot vector for `n_ctrl` control points and its degree.  User
/// knots must be clamped and non-decreasing, and fix the degree as
/// `len − n_ctrl − 1`.  Without them the curve is a clamped uniform spline
/// of degree `min(n_ctrl − 1, 3)`.
pub fn knots_or_uniform(knots: Option<&[f64]>, n_ctrl: usize) -> Result<(Vec<f64>, usize)> {
    let Some(knots) = knots else {
        let degree = n_ctrl.saturating_sub(1).min(3);
        return Ok((clamped_uniform_knots(n_ctrl, degree)?, degree));
    };
    if knots.len() < n_ctrl + 2 {
        return Err(AdjointError::Config(format!(
            "{} knots are too few for {n_ctrl} control points",
            knots.len()
        )));
    }
    let degree = knots.len() - n_ctrl - 1;
    let (first, last) = (knots[0], knots[knots.len() - 1]);
    if knots.iter().any(|k| !k.is_finite()) || knots.windows(2).any(|k| k[1] < k[0]) || last <= first {
        return Err(AdjointError::Config("knot vector must be non-decreasing and non-degenerate".into()));
    }
    let clamped = knots[..=degree].iter().all(|&k| k == first) && knots[n_ctrl..].iter().all(|&k| k == last);
    if !clamped {
        return Err(AdjointError::Config(format!(
            "knot vector must repeat its end knots {} times",
            degree + 1
        )));
    }
    Ok((knots.to_vec(), degree))
}

/// Basis values at `n` parameters spread evenly over the knot range.
fn sample_basis(knots: &[f64], degree: usize, n: usize) -> Vec<Vec<f64>> {
    let (first, last) = (knots[0], knots[knots.len() - 1]);
    (0..n)
        .map(|k| {
            let t = if k + 1 == n { last } else { first + (last - first) * k as f64 / (n - 1) as f64 };
            bspline_basis(knots, degree, t)
        })
        .collect()
}

/// All basis functions `N_{i,degree}(t)` by the Cox-de Boor recursion.
///
/// The last non-empty span is closed on the right so `t = 1` evaluates to
/// the final control point.
pub fn bspline_basis(knots: &[f64], degree: usize, t: f64) -> Vec<f64> {
    let last = knots[knots.len() - 1];
    let mut n: Vec<f64> = knots
        .windows(2)
        .map(|k| {
            let inside = k[0] <= t && t < k[1];
            let closing = t == last && k[0] < k[1] && k[1] == last;
            if inside || closing {
                1.0
            } else {
                0.0
            }
        })
        .collect();

    for p in 1..=degree {
        n = (0..n.len() - 1)
            .map(|i| {
                let mut v = 0.0;
                let left = knots[i + p] - knots[i];
                if left > 0.0 {
                    v += (t - knots[i]) / left * n[i];
                }
                let right = knots[i + p + 1] - knots[i + 1];
                if right > 0.0 {
                    v += (knots[i + p + 1] - t) / right * n[i + 1];
                }
                v
            })
            .collect();
    }
    n
}

// ─────────────────────────────────────────────────────────────
//  Spline targets and their samples
// ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum SplineTarget {
    /// Planar curve, control points `n × 2`.  `knots: None` means clamped
    /// uniform.
    Curve { control: Array2<f64>, knots: Option<Vec<f64>> },
    /// Tensor patch, control points `(nu · nv) × 3`, row `iv * nu + iu`.
    Patch {
        control: Array2<f64>,
        nu: usize,
        nv: usize,
        knots: Option<(Vec<f64>, Vec<f64>)>,
    },
}

impl SplineTarget {
    pub fn curve(control: Array2<f64>) -> Result<Self> {
        if control.ncols() != 2 || control.nrows() < 2 {
            return Err(AdjointError::Config(format!(
                "curve target needs at least two 2D control points, got {:?}",
                control.dim()
            )));
        }
        Ok(SplineTarget::Curve { control, knots: None })
    }

    pub fn patch(control: Array2<f64>, nu: usize, nv: usize) -> Result<Self> {
        if control.ncols() != 3 || control.nrows() != nu * nv || nu < 2 || nv < 2 {
            return Err(AdjointError::Config(format!(
                "patch target needs a {nu}x{nv} grid of 3D control points, got {:?}",
                control.dim()
            )));
        }
        Ok(SplineTarget::Patch {
            control,
            nu,
            nv,
            knots: None,
        })
    }

    /// Curve with an explicit clamped knot vector.
    pub fn with_knots(self, knots: Vec<f64>) -> Result<Self> {
        match self {
            SplineTarget::Curve { control, .. } => {
                knots_or_uniform(Some(&knots), control.nrows())?;
                Ok(SplineTarget::Curve {
                    control,
                    knots: Some(knots),
                })
            }
            SplineTarget::Patch { .. } => Err(AdjointError::Config(
                "patch targets take one knot vector per direction".into(),
            )),
        }
    }

    /// Patch with explicit clamped knot vectors along `u` and `v`.
    pub fn with_patch_knots(self, ku: Vec<f64>, kv: Vec<f64>) -> Result<Self> {
        match self {
            SplineTarget::Patch { control, nu, nv, .. } => {
                knots_or_uniform(Some(&ku), nu)?;
                knots_or_uniform(Some(&kv), nv)?;
                Ok(SplineTarget::Patch {
                    control,
                    nu,
                    nv,
                    knots: Some((ku, kv)),
                })
            }
            SplineTarget::Curve { .. } => Err(AdjointError::Config("curve targets take a single knot vector".into())),
        }
    }

    pub fn dim(&self) -> usize {
        match self {
            SplineTarget::Curve { .. } => 2,
            SplineTarget::Patch { .. } => 3,
        }
    }

    pub fn control(&self) -> ArrayView2<'_, f64> {
        match self {
            SplineTarget::Curve { control, .. } | SplineTarget::Patch { control, .. } => control.view(),
        }
    }

    /// Same layout and knots, new control points.
    pub fn with_control(&self, control: Array2<f64>) -> Result<Self> {
        match self {
            SplineTarget::Curve { knots: None, .. } => Self::curve(control),
            SplineTarget::Curve { knots: Some(k), .. } => Self::curve(control)?.with_knots(k.clone()),
            SplineTarget::Patch { nu, nv, knots: None, .. } => Self::patch(control, *nu, *nv),
            SplineTarget::Patch {
                nu,
                nv,
                knots: Some((ku, kv)),
                ..
            } => Self::patch(control, *nu, *nv)?.with_patch_knots(ku.clone(), kv.clone()),
        }
    }

    /// Sample `n` points per parametric direction, evenly in parameter.
    pub fn sample(&self, n: usize) -> Result<SampledTarget> {
        if n < 2 {
            return Err(AdjointError::Config("spline sampling needs at least two samples".into()));
        }
        let (weights, patch_width) = match self {
            SplineTarget::Curve { control, knots } => {
                let n_ctrl = control.nrows();
                let (knots, degree) = knots_or_uniform(knots.as_deref(), n_ctrl)?;
                let mut w = Array2::zeros((n, n_ctrl));
                for (k, basis) in sample_basis(&knots, degree, n).into_iter().enumerate() {
                    for (c, b) in basis.into_iter().enumerate() {
                        w[[k, c]] = b;
                    }
                }
                (w, None)
            }
            SplineTarget::Patch { nu, nv, knots, .. } => {
                let (user_u, user_v) = match knots {
                    Some((ku, kv)) => (Some(ku.as_slice()), Some(kv.as_slice())),
                    None => (None, None),
                };
                let (ku, du) = knots_or_uniform(user_u, *nu)?;
                let (kv, dv) = knots_or_uniform(user_v, *nv)?;
                let (bu, bv) = (sample_basis(&ku, du, n), sample_basis(&kv, dv, n));
                let mut w = Array2::zeros((n * n, nu * nv));
                for i in 0..n {
                    for j in 0..n {
                        for (iv, a) in bv[i].iter().enumerate() {
                            for (iu, b) in bu[j].iter().enumerate() {
                                w[[i * n + j, iv * nu + iu]] = a * b;
                            }
                        }
                    }
                }
                (w, Some(n))
            }
        };
        let points = weights.dot(&self.control());
        Ok(SampledTarget {
            points,
            weights,
            patch_width,
        })
    }
}

/// Closest point on the sampled target and how it depends on the samples.
#[derive(Debug, Clone)]
pub struct Projection {
    pub distance: f64,
    pub point: [f64; 3],
    /// `(sample, coefficient)` pairs with `point = Σ coef · sample`.
    pub stencil: Vec<(usize, f64)>,
}

#[derive(Debug, Clone)]
pub struct SampledTarget {
    points: Array2<f64>,
    /// Basis value of each control point at each sample.
    weights: Array2<f64>,
    /// Samples per direction for patches.
    patch_width: Option<usize>,
}

impl SampledTarget {
    pub fn points(&self) -> ArrayView2<'_, f64> {
        self.points.view()
    }

    pub fn dim(&self) -> usize {
        self.points.ncols()
    }

    fn sample(&self, k: usize) -> [f64; 3] {
        let mut s = [0.0; 3];
        for (d, v) in s.iter_mut().enumerate().take(self.dim()) {
            *v = self.points[[k, d]];
        }
        s
    }

    pub fn compute_distance(&self, p: [f64; 3]) -> f64 {
        self.project(p).distance
    }

    /// Closest point over all segments (curve) or sample triangles (patch).
    pub fn project(&self, p: [f64; 3]) -> Projection {
        let mut best = Projection {
            distance: f64::INFINITY,
            point: [0.0; 3],
            stencil: Vec::new(),
        };
        match self.patch_width {
            None => {
                for k in 0..self.points.nrows().saturating_sub(1) {
                    let (a, b) = (self.sample(k), self.sample(k + 1));
                    let ab = sub(b, a);
                    let len2 = dot(ab, ab);
                    let t = if len2 > 0.0 {
                        (dot(sub(p, a), ab) / len2).clamp(0.0, 1.0)
                    } else {
                        0.0
                    };
                    let q = axpy(a, t, ab);
                    let d = norm(sub(p, q));
                    if d < best.distance {
                        best = Projection {
                            distance: d,
                            point: q,
                            stencil: vec![(k, 1.0 - t), (k + 1, t)],
                        };
                    }
                }
            }
            Some(n) => {
                for i in 0..n - 1 {
                    for j in 0..n - 1 {
                        let loc = i * n + j;
                        let a = self.sample(loc);
                        let eu = sub(self.sample(loc + 1), a);
                        let ev = sub(self.sample(loc + n), a);
                        let r = sub(p, a);
                        let (uu, uv, vv) = (dot(eu, eu), dot(eu, ev), dot(ev, ev));
                        let det = uu * vv - uv * uv;
                        let (u, v) = if det.abs() > f64::EPSILON * uu * vv {
                            let (ru, rv) = (dot(r, eu), dot(r, ev));
                            (((vv * ru - uv * rv) / det), ((uu * rv - uv * ru) / det))
                        } else {
                            (0.0, 0.0)
                        };
                        let (u, v) = (u.clamp(0.0, 1.0), v.clamp(0.0, 1.0));
                        let q = axpy(axpy(a, u, eu), v, ev);
                        let d = norm(sub(p, q));
                        if d < best.distance {
                            best = Projection {
                                distance: d,
                                point: q,
                                stencil: vec![(loc, 1.0 - u - v), (loc + 1, u), (loc + n, v)],
                            };
                        }
                    }
                }
            }
        }
        best
    }

    /// `∂d/∂C`, flattened `n_ctrl × dim`, with the projection parameters
    /// held fixed.
    pub fn distance_control_gradient(&self, p: [f64; 3], proj: &Projection) -> Vec<f64> {
        let dim = self.dim();
        let n_ctrl = self.weights.ncols();
        let mut g = vec![0.0; n_ctrl * dim];
        if proj.distance <= 0.0 {
            return g;
        }
        let normal = sub(p, proj.point);
        for &(s, coef) in &proj.stencil {
            for c in 0..n_ctrl {
                let w = coef * self.weights[[s, c]];
                if w == 0.0 {
                    continue;
                }
                for d in 0..dim {
                    g[c * dim + d] -= w * normal[d] / proj.distance;
                }
            }
        }
        g
    }
}

fn sub(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

fn dot(a: [f64; 3], b: [f64; 3]) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

fn axpy(a: [f64; 3], t: f64, b: [f64; 3]) -> [f64; 3] {
    [a[0] + t * b[0], a[1] + t * b[1], a[2] + t * b[2]]
}

fn norm(a: [f64; 3]) -> f64 {
    dot(a, a).sqrt()
}

// ─────────────────────────────────────────────────────────────
//  Lazy grid
// ─────────────────────────────────────────────────────────────

/// Catmull-Rom weights for offsets −1..=2 and their derivatives.
fn catmull_rom(t: f64) -> ([f64; 4], [f64; 4]) {
    let (t2, t3) = (t * t, t * t * t);
    (
        [
            0.5 * (-t3 + 2.0 * t2 - t),
            0.5 * (3.0 * t3 - 5.0 * t2 + 2.0),
            0.5 * (-3.0 * t3 + 4.0 * t2 + t),
            0.5 * (t3 - t2),
        ],
        [
            0.5 * (-3.0 * t2 + 4.0 * t - 1.0),
            0.5 * (9.0 * t2 - 10.0 * t),
            0.5 * (-9.0 * t2 + 8.0 * t + 1.0),
            0.5 * (3.0 * t2 - 2.0 * t),
        ],
    )
}

/// Sparse regular grid of vector samples (channel 0 is the distance).
#[derive(Debug, Clone)]
pub struct LazyDistanceGrid {
    delta: f64,
    dim: usize,
    channels: usize,
    nodes: HashMap<[i64; 3], Vec<f64>>,
}

impl LazyDistanceGrid {
    pub fn new(delta: f64, dim: usize, channels: usize) -> Result<Self> {
        if delta.is_nan() || delta <= 0.0 || !(2..=3).contains(&dim) || channels == 0 {
            return Err(AdjointError::Config(format!(
                "invalid distance grid (delta {delta}, dim {dim}, channels {channels})"
            )));
        }
        Ok(Self {
            delta,
            dim,
            channels,
            nodes: HashMap::new(),
        })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn base(&self, p: [f64; 3]) -> ([i64; 3], [f64; 3]) {
        let mut base = [0i64; 3];
        let mut t = [0.0; 3];
        for d in 0..self.dim {
            let s = p[d] / self.delta;
            base[d] = s.floor() as i64;
            t[d] = s - base[d] as f64;
        }
        (base, t)
    }

    fn stencil(&self, base: [i64; 3]) -> impl Iterator<Item = ([i64; 3], [usize; 3])> {
        let dim = self.dim;
        let extent = if dim == 3 { 4 } else { 1 };
        (0..4).flat_map(move |a| {
            (0..4).flat_map(move |b| {
                (0..extent).map(move |c| {
                    let off = [a, b, c];
                    let mut key = [0i64; 3];
                    for d in 0..dim {
                        key[d] = base[d] + off[d] as i64 - 1;
                    }
                    (key, off)
                })
            })
        })
    }

    /// Fill any missing stencil node around `p` with `sample(node position)`.
    pub fn cache_point<F>(&mut self, p: [f64; 3], sample: F) -> usize
    where
        F: Fn([f64; 3]) -> Vec<f64>,
    {
        let (base, _) = self.base(p);
        let keys: Vec<[i64; 3]> = self.stencil(base).map(|(k, _)| k).collect();
        let mut added = 0;
        for key in keys {
            if self.nodes.contains_key(&key) {
                continue;
            }
            let mut x = [0.0; 3];
            for d in 0..self.dim {
                x[d] = key[d] as f64 * self.delta;
            }
            self.nodes.insert(key, sample(x));
            added += 1;
        }
        added
    }

    /// Interpolated channels at `p` and the spatial gradient of channel 0.
    pub fn evaluate(&self, p: [f64; 3]) -> Result<(Vec<f64>, [f64; 3])> {
        let (base, t) = self.base(p);
        let w: Vec<([f64; 4], [f64; 4])> = (0..self.dim).map(|d| catmull_rom(t[d])).collect();
        let mut values = vec![0.0; self.channels];
        let mut grad = [0.0; 3];
        for (key, off) in self.stencil(base) {
            let node = self
                .nodes
                .get(&key)
                .ok_or(AdjointError::NotInitialized("distance grid node"))?;
            let mut weight = 1.0;
            for d in 0..self.dim {
                weight *= w[d].0[off[d]];
            }
            for (v, n) in values.iter_mut().zip(node) {
                *v += weight * n;
            }
            for g in 0..self.dim {
                let mut dw = 1.0 / self.delta;
                for d in 0..self.dim {
                    dw *= if d == g { w[d].1[off[d]] } else { w[d].0[off[d]] };
                }
                grad[g] += dw * node[0];
            }
        }
        Ok((values, grad))
    }
}

// ─────────────────────────────────────────────────────────────
//  Objective
// ─────────────────────────────────────────────────────────────

/// `∫ d(x)²` over a surface region, `d` the distance to a spline target.
/// Shape variables on the simulation are rejected.
#[derive(Debug)]
pub struct SdfTargetForm {
    sim: SimulationId,
    weight: f64,
    region: Region,
    window: StepWindow,
    delta: f64,
    samples_per_dir: usize,
    target: SplineTarget,
    /// Design vector → flattened control points.
    control_map: Option<Box<dyn Parametrization>>,
    samples: EqualityGated<Array2<f64>, SampledTarget>,
    grid: EqualityGated<Array2<f64>, LazyDistanceGrid>,
}

impl SdfTargetForm {
    pub fn new(sim: &Simulation, target: SplineTarget, delta: f64) -> Result<Self> {
        if target.dim() != sim.dim() {
            return Err(AdjointError::Config(format!(
                "{}D spline target on a {}D mesh",
                target.dim(),
                sim.dim()
            )));
        }
        if delta.is_nan() || delta <= 0.0 {
            return Err(AdjointError::Config(format!("grid spacing must be positive, got {delta}")));
        }
        Ok(Self {
            sim: sim.id(),
            weight: 1.0,
            region: Region::surfaces([]),
            window: StepWindow::All,
            delta,
            samples_per_dir: DEFAULT_SPLINE_SAMPLES,
            target,
            control_map: None,
            samples: EqualityGated::new(),
            grid: EqualityGated::new(),
        })
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

    pub fn with_samples(mut self, n: usize) -> Self {
        self.samples_per_dir = n;
        self
    }

    /// Let the design vector drive the control points.
    pub fn with_control_parametrization(mut self, map: Box<dyn Parametrization>) -> Self {
        self.control_map = Some(map);
        self
    }

    /// How many times the target has been resampled.
    pub fn sample_rebuilds(&self) -> usize {
        self.samples.rebuilds()
    }

    pub fn grid(&self) -> Option<&LazyDistanceGrid> {
        self.grid.get()
    }

    fn control_for(&self, x: ArrayView1<f64>) -> Result<Array2<f64>> {
        let current = self.target.control();
        match &self.control_map {
            None => Ok(current.to_owned()),
            Some(map) => {
                let flat = map.eval(x)?;
                Array2::from_shape_vec(current.dim(), flat.to_vec()).map_err(|e| AdjointError::Shape(e.to_string()))
            }
        }
    }

    fn grid_ready(&self) -> Result<&LazyDistanceGrid> {
        self.grid.get().ok_or(AdjointError::NotInitialized("distance grid"))
    }

    /// Points of the region at every step of the window.
    fn query_points(&self, sim: &Simulation) -> Result<Vec<[f64; 3]>> {
        let mut points = Vec::new();
        for step in self.window.steps(sim)? {
            let pts = try_accumulate(
                sim.mesh(),
                &self.region,
                sim.cache().u(step)?,
                step,
                Vec::new,
                |acc: &mut Vec<[f64; 3]>, _, c, _| {
                    acc.push(c.position());
                    Ok(())
                },
                |mut a, mut b| {
                    a.append(&mut b);
                    a
                },
            )?;
            points.extend(pts);
        }
        Ok(points)
    }
}

impl AdjointForm for SdfTargetForm {
    fn name(&self) -> &str {
        "spline distance"
    }

    fn weight(&self) -> f64 {
        self.weight
    }

    fn simulation(&self) -> SimulationId {
        self.sim
    }

    fn solution_changed(&mut self, x: ArrayView1<f64>, ctx: &FormContext) -> Result<()> {
        let sim = ctx.simulation(self.sim)?;
        let control = self.control_for(x)?;
        let (target, n) = (&self.target, self.samples_per_dir);
        if self
            .samples
            .refresh(&control, |c| target.with_control(c.clone())?.sample(n))?
        {
            debug!(samples = n, "resampled spline target");
        }

        let channels = if self.control_map.is_some() { 1 + control.len() } else { 1 };
        let (delta, dim) = (self.delta, sim.dim());
        self.grid
            .refresh(&control, |_| LazyDistanceGrid::new(delta, dim, channels))?;

        let points = self.query_points(sim)?;
        let (Some(samples), Some(grid)) = (self.samples.get(), self.grid.get_mut()) else {
            return Err(AdjointError::NotInitialized("spline samples"));
        };
        let with_control = channels > 1;
        let mut added = 0;
        for p in points {
            added += grid.cache_point(p, |node| {
                let proj = samples.project(node);
                let mut out = vec![proj.distance];
                if with_control {
                    out.extend(samples.distance_control_gradient(node, &proj));
                }
                out
            });
        }
        trace!(added, total = grid.len(), "cached distance grid nodes");
        Ok(())
    }

    fn value_unweighted(&self, _x: ArrayView1<f64>, ctx: &FormContext) -> Result<f64> {
        let sim = ctx.simulation(self.sim)?;
        let grid = self.grid_ready()?;
        let mut total = 0.0;
        for step in self.window.steps(sim)? {
            total += try_accumulate(
                sim.mesh(),
                &self.region,
                sim.cache().u(step)?,
                step,
                || 0.0,
                |acc, _, c, w| {
                    let (v, _) = grid.evaluate(c.position())?;
                    *acc += w * v[0] * v[0];
                    Ok(())
                },
                |a, b| a + b,
            )?;
        }
        Ok(total)
    }

    fn adjoint_rhs_unweighted(&self, _x: ArrayView1<f64>, ctx: &FormContext) -> Result<Array2<f64>> {
        let sim = ctx.simulation(self.sim)?;
        let grid = self.grid_ready()?;
        let (ndof, dim) = (sim.ndof(), sim.dim());
        let mut rhs = Array2::zeros((ndof, sim.n_adjoint_columns()));
        for step in self.window.steps(sim)? {
            let col = try_accumulate(
                sim.mesh(),
                &self.region,
                sim.cache().u(step)?,
                step,
                || Array1::zeros(ndof),
                |acc: &mut Array1<f64>, q, c, w| {
                    let (v, g) = grid.evaluate(c.position())?;
                    for (a, &node) in q.nodes.iter().enumerate() {
                        let n = w * q.shape[[c.qp, a]];
                        for d in 0..dim {
                            acc[node * dim + d] += n * 2.0 * v[0] * g[d];
                        }
                    }
                    Ok(())
                },
                |mut a, b| {
                    a += &b;
                    a
                },
            )?;
            rhs.column_mut(step).assign(&col);
        }
        Ok(rhs)
    }

    fn partial_gradient_unweighted(&self, x: ArrayView1<f64>, ctx: &FormContext) -> Result<Array1<f64>> {
        reject_shape_derivative(ctx, self.sim, self.name())?;
        let Some(map) = &self.control_map else {
            return Ok(Array1::zeros(x.len()));
        };
        let sim = ctx.simulation(self.sim)?;
        let grid = self.grid_ready()?;
        let n = self.target.control().len();
        let mut grad_c = Array1::zeros(n);
        for step in self.window.steps(sim)? {
            grad_c += &try_accumulate(
                sim.mesh(),
                &self.region,
                sim.cache().u(step)?,
                step,
                || Array1::zeros(n),
                |acc: &mut Array1<f64>, _, c, w| {
                    let (v, _) = grid.evaluate(c.position())?;
                    for k in 0..n {
                        acc[k] += w * 2.0 * v[0] * v[k + 1];
                    }
                    Ok(())
                },
                |mut a, b| {
                    a += &b;
                    a
                },
            )?;
        }
        map.apply_jacobian(grad_c.view(), x)
    }
}
