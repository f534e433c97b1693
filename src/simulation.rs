//! One simulation instance as seen by the adjoint layer.
//!
//! Owns the forward cache (filled by the forward collaborator) and the
//! last adjoint solution.  Geometry and the boundary set are shared with
//! the forward solve.

use crate::adjoint::{solve_static_adjoint, solve_transient_adjoint, AdjointSolution};
use crate::cache::ForwardCache;
use crate::config::{AdjointSettings, SimulationSettings, TimeIntegration};
use crate::mesh::MeshGeometry;
use crate::parametrization::{ParameterType, ResidualSensitivity};
use crate::types::{AdjointError, BoundaryNodeSet, Result, SimulationId};
use ndarray::ArrayView2;
use sprs::CsMat;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug)]
pub struct Simulation {
    id: SimulationId,
    mesh: Arc<MeshGeometry>,
    time: Option<TimeIntegration>,
    mass: Option<CsMat<f64>>,
    settings: AdjointSettings,
    cache: ForwardCache,
    sensitivities: Vec<Arc<dyn ResidualSensitivity>>,
    adjoint: Option<AdjointSolution>,
}

impl Simulation {
    pub fn new(
        id: SimulationId,
        mesh: Arc<MeshGeometry>,
        boundary: Arc<BoundaryNodeSet>,
        settings: SimulationSettings,
    ) -> Result<Self> {
        if boundary.ndof() != mesh.ndof() {
            return Err(AdjointError::Config(format!(
                "boundary set sized for {} dofs, mesh has {}",
                boundary.ndof(),
                mesh.ndof()
            )));
        }
        if let Some(time) = &settings.time {
            time.validate()?;
        }
        Ok(Self {
            id,
            mesh,
            time: settings.time,
            mass: None,
            settings: settings.solver,
            cache: ForwardCache::new(boundary),
            sensitivities: Vec::new(),
            adjoint: None,
        })
    }

    /// Mass matrix of the transient problem.
    pub fn with_mass(mut self, mass: CsMat<f64>) -> Result<Self> {
        let n = self.ndof();
        if mass.shape() != (n, n) {
            return Err(AdjointError::Shape(format!(
                "mass is {}x{}, expected {n}x{n}",
                mass.rows(),
                mass.cols()
            )));
        }
        self.mass = Some(mass);
        Ok(self)
    }

    pub fn with_sensitivity(mut self, s: Arc<dyn ResidualSensitivity>) -> Self {
        self.sensitivities.push(s);
        self
    }

    pub fn id(&self) -> SimulationId {
        self.id
    }

    pub fn mesh(&self) -> &MeshGeometry {
        &self.mesh
    }

    pub fn boundary(&self) -> &BoundaryNodeSet {
        self.cache.boundary()
    }

    pub fn ndof(&self) -> usize {
        self.mesh.ndof()
    }

    pub fn dim(&self) -> usize {
        self.mesh.dim()
    }

    pub fn time(&self) -> Option<&TimeIntegration> {
        self.time.as_ref()
    }

    pub fn is_time_dependent(&self) -> bool {
        self.time.is_some()
    }

    /// Number of columns an adjoint right-hand side must have for a
    /// single objective.
    pub fn n_adjoint_columns(&self) -> usize {
        self.time.map_or(1, |t| t.time_steps + 1)
    }

    pub fn settings(&self) -> &AdjointSettings {
        &self.settings
    }

    pub fn cache(&self) -> &ForwardCache {
        &self.cache
    }

    /// Mutable access for the forward collaborator.  Invalidates the
    /// stored adjoint.
    pub fn cache_mut(&mut self) -> &mut ForwardCache {
        self.adjoint = None;
        &mut self.cache
    }

    /// Factor step 0 with the configured prefactorized backend so static
    /// adjoints take the fast path.
    pub fn prefactorize(&mut self) -> Result<()> {
        self.adjoint = None;
        self.cache.prefactorize(&self.settings.prefactorized_solver)
    }

    pub fn sensitivity(&self, kind: ParameterType) -> Option<&dyn ResidualSensitivity> {
        self.sensitivities
            .iter()
            .find(|s| s.kind() == kind)
            .map(|s| s.as_ref())
    }

    /// Static or transient adjoint, by whether time integration is set.
    pub fn solve_adjoint(&self, rhs: ArrayView2<f64>) -> Result<AdjointSolution> {
        match &self.time {
            Some(time) => {
                let mass = self.mass.as_ref().ok_or_else(|| {
                    AdjointError::Config("transient adjoint requires a mass matrix".into())
                })?;
                debug!(sim = self.id.0, "solving transient adjoint");
                solve_transient_adjoint(&self.cache, mass, time, rhs, &self.settings)
                    .map(AdjointSolution::Transient)
            }
            None => {
                debug!(sim = self.id.0, "solving static adjoint");
                solve_static_adjoint(&self.cache, rhs, &self.settings).map(AdjointSolution::Static)
            }
        }
    }

    /// Solve and keep the result for [`Self::adjoint_mat`].
    pub fn solve_adjoint_cached(&mut self, rhs: ArrayView2<f64>) -> Result<()> {
        self.adjoint = None;
        self.adjoint = Some(self.solve_adjoint(rhs)?);
        Ok(())
    }

    pub fn adjoint_mat(&self) -> Result<&AdjointSolution> {
        self.adjoint
            .as_ref()
            .ok_or(AdjointError::NotInitialized("adjoint solution"))
    }
}
