//! Geometry view consumed by the objective layer.
//!
//! The mesh itself belongs to the forward collaborator.  What the adjoint
//! forms need is the per-element quadrature (shape values and weights
//! already multiplied by |det J|), the rest positions, and the tracked
//! collision surface.  DOFs are node-major: `dof = node * dim + d`.

use crate::types::{AdjointError, Result};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use std::collections::BTreeSet;

/// Quadrature of one volume element or one boundary facet.
#[derive(Debug, Clone)]
pub struct ElementQuadrature {
    pub element: usize,
    pub body_id: i32,
    /// Set for surface facets only.
    pub boundary_id: Option<i32>,
    pub nodes: Vec<usize>,
    /// Reference coordinates, one row per quadrature point.
    pub local_points: Array2<f64>,
    /// Shape values, `nq × nodes.len()`.
    pub shape: Array2<f64>,
    pub weights: Array1<f64>,
}

impl ElementQuadrature {
    pub fn new(
        element: usize,
        body_id: i32,
        nodes: Vec<usize>,
        local_points: Array2<f64>,
        shape: Array2<f64>,
        weights: Array1<f64>,
    ) -> Result<Self> {
        let nq = weights.len();
        if shape.dim() != (nq, nodes.len()) || local_points.nrows() != nq {
            return Err(AdjointError::Shape(format!(
                "element {element}: {nq} weights, shape {:?}, {} local points, {} nodes",
                shape.dim(),
                local_points.nrows(),
                nodes.len()
            )));
        }
        Ok(Self {
            element,
            body_id,
            boundary_id: None,
            nodes,
            local_points,
            shape,
            weights,
        })
    }

    pub fn on_boundary(mut self, boundary_id: i32) -> Self {
        self.boundary_id = Some(boundary_id);
        self
    }

    pub fn n_points(&self) -> usize {
        self.weights.len()
    }

    /// Interpolate a nodal field (`n_nodes × dim`) at quadrature point `qp`.
    pub fn interpolate(&self, qp: usize, field: ArrayView2<f64>) -> [f64; 3] {
        let mut out = [0.0; 3];
        for (a, &node) in self.nodes.iter().enumerate() {
            let n = self.shape[[qp, a]];
            for (d, o) in out.iter_mut().enumerate().take(field.ncols()) {
                *o += n * field[[node, d]];
            }
        }
        out
    }

    /// Interpolate a node-major DOF vector with `dim` components per node.
    pub fn interpolate_dofs(&self, qp: usize, dofs: ArrayView1<f64>, dim: usize) -> [f64; 3] {
        let mut out = [0.0; 3];
        for (a, &node) in self.nodes.iter().enumerate() {
            let n = self.shape[[qp, a]];
            for (d, o) in out.iter_mut().enumerate().take(dim) {
                *o += n * dofs[node * dim + d];
            }
        }
        out
    }
}

/// Which part of the mesh a functional integrates over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Region {
    /// Volume elements whose body id is listed (empty = all).
    Volume(BTreeSet<i32>),
    /// Boundary facets whose boundary id is listed (empty = all).
    Surface(BTreeSet<i32>),
}

impl Region {
    pub fn all_volume() -> Self {
        Region::Volume(BTreeSet::new())
    }

    pub fn bodies(ids: impl IntoIterator<Item = i32>) -> Self {
        Region::Volume(ids.into_iter().collect())
    }

    pub fn surfaces(ids: impl IntoIterator<Item = i32>) -> Self {
        Region::Surface(ids.into_iter().collect())
    }
}

#[derive(Debug, Clone)]
pub struct MeshGeometry {
    dim: usize,
    rest_positions: Array2<f64>,
    volume_quadrature: Vec<ElementQuadrature>,
    surface_quadrature: Vec<ElementQuadrature>,
    collision_vertices: Vec<usize>,
    collision_edges: Vec<[usize; 2]>,
    input_node_to_node: Option<Vec<usize>>,
}

impl MeshGeometry {
    /// `rest_positions` is `n_nodes × dim`; volume quadrature is indexed by
    /// element id.
    pub fn new(rest_positions: Array2<f64>, volume_quadrature: Vec<ElementQuadrature>) -> Result<Self> {
        let dim = rest_positions.ncols();
        if !(2..=3).contains(&dim) {
            return Err(AdjointError::Config(format!("mesh dimension must be 2 or 3, got {dim}")));
        }
        let n_nodes = rest_positions.nrows();
        for (i, q) in volume_quadrature.iter().enumerate() {
            if q.element != i {
                return Err(AdjointError::DataConsistency(format!(
                    "volume quadrature slot {i} holds element {}",
                    q.element
                )));
            }
            if let Some(&bad) = q.nodes.iter().find(|&&n| n >= n_nodes) {
                return Err(AdjointError::DataConsistency(format!(
                    "element {i} references node {bad}, mesh has {n_nodes}"
                )));
            }
        }
        Ok(Self {
            dim,
            rest_positions,
            volume_quadrature,
            surface_quadrature: Vec::new(),
            collision_vertices: Vec::new(),
            collision_edges: Vec::new(),
            input_node_to_node: None,
        })
    }

    pub fn with_surface_quadrature(mut self, facets: Vec<ElementQuadrature>) -> Result<Self> {
        let n_nodes = self.n_nodes();
        for q in &facets {
            if let Some(&bad) = q.nodes.iter().find(|&&n| n >= n_nodes) {
                return Err(AdjointError::DataConsistency(format!(
                    "facet {} references node {bad}, mesh has {n_nodes}",
                    q.element
                )));
            }
        }
        self.surface_quadrature = facets;
        Ok(self)
    }

    /// Tracked collision surface: vertex node ids and edges between them
    /// (indices into `vertices`).
    pub fn with_collision_surface(mut self, vertices: Vec<usize>, edges: Vec<[usize; 2]>) -> Result<Self> {
        let n_nodes = self.n_nodes();
        if let Some(&bad) = vertices.iter().find(|&&n| n >= n_nodes) {
            return Err(AdjointError::DataConsistency(format!(
                "collision vertex {bad} is not a mesh node, mesh has {n_nodes}"
            )));
        }
        if let Some(e) = edges.iter().find(|e| e[0] >= vertices.len() || e[1] >= vertices.len()) {
            return Err(AdjointError::DataConsistency(format!(
                "collision edge {e:?} indexes past {} surface vertices",
                vertices.len()
            )));
        }
        self.collision_vertices = vertices;
        self.collision_edges = edges;
        Ok(self)
    }

    /// Map from node ids used in input files to internal node ids.
    pub fn with_input_node_map(mut self, map: Vec<usize>) -> Self {
        self.input_node_to_node = Some(map);
        self
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn n_nodes(&self) -> usize {
        self.rest_positions.nrows()
    }

    pub fn ndof(&self) -> usize {
        self.n_nodes() * self.dim
    }

    pub fn n_elements(&self) -> usize {
        self.volume_quadrature.len()
    }

    pub fn rest_positions(&self) -> ArrayView2<'_, f64> {
        self.rest_positions.view()
    }

    pub fn element(&self, id: usize) -> Option<&ElementQuadrature> {
        self.volume_quadrature.get(id)
    }

    pub fn collision_vertices(&self) -> &[usize] {
        &self.collision_vertices
    }

    pub fn collision_edges(&self) -> &[[usize; 2]] {
        &self.collision_edges
    }

    /// Internal node id for an input-file node id.
    pub fn input_node(&self, id: usize) -> Option<usize> {
        match &self.input_node_to_node {
            Some(map) => map.get(id).copied(),
            None => (id < self.n_nodes()).then_some(id),
        }
    }

    /// Quadrature entries belonging to `region`.
    pub fn elements_in(&self, region: &Region) -> Vec<&ElementQuadrature> {
        match region {
            Region::Volume(ids) => self
                .volume_quadrature
                .iter()
                .filter(|q| ids.is_empty() || ids.contains(&q.body_id))
                .collect(),
            Region::Surface(ids) => self
                .surface_quadrature
                .iter()
                .filter(|q| match q.boundary_id {
                    Some(b) => ids.is_empty() || ids.contains(&b),
                    None => false,
                })
                .collect(),
        }
    }
}
