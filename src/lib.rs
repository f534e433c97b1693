//! **adjoint_fem**: discrete adjoint sensitivities for static and
//! BDF-integrated finite-element simulations.
//!
//! The forward solver lives elsewhere; it records one step per solve in the
//! simulation's [`cache::ForwardCache`].  This crate turns that record into
//! design gradients:
//!
//! 1. **Objectives** (`objectives`, `sdf`, `barrier`): value, `∂J/∂u` per
//!    step, and explicit `∂J/∂x`.
//! 2. **Adjoint** (`adjoint`): static solve on the free DOFs, or the
//!    backward BDF recursion over the stored steps.
//! 3. **Parametrizations** (`parametrization`): design vector to
//!    simulation parameters, and the transpose Jacobian back.
//! 4. **Driver** (`gradients`): sums partial and adjoint terms across
//!    objectives and simulations.

pub mod types;
pub mod config;
pub mod bdf;
pub mod linalg;
pub mod bc;
pub mod cache;
pub mod memo;
pub mod mesh;
pub mod quadrature;
pub mod adjoint;
pub mod simulation;
pub mod parametrization;
pub mod objectives;
pub mod sdf;
pub mod barrier;
pub mod gradients;

pub use adjoint::{AdjointSeries, AdjointSolution};
pub use objectives::{AdjointForm, FormContext, StepWindow};
pub use simulation::Simulation;
pub use types::{AdjointError, Result, SimulationId};
