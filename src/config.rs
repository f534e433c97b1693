//! Solver and time-integration settings.
//!
//! These are consumed, not owned: the BDF schedule comes from the forward
//! time integrator and the solver names are handed to
//! [`crate::linalg::create_solver`] unmodified.

use crate::types::{AdjointError, Result, MAX_BDF_ORDER};
use serde::{Deserialize, Serialize};

// ─────────────────────────────────────────────────────────────
//  Linear solver selection
// ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdjointSettings {
    /// Backend for the general static path and every transient step.
    pub adjoint_solver: String,
    /// Backend used when the cache is asked to prefactorize step 0.
    pub prefactorized_solver: String,
}

impl Default for AdjointSettings {
    fn default() -> Self {
        Self {
            adjoint_solver: "ldl".into(),
            prefactorized_solver: "ldl".into(),
        }
    }
}

// ─────────────────────────────────────────────────────────────
//  BDF time integration
// ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeIntegration {
    pub dt: f64,
    pub time_steps: usize,
    pub bdf_order: usize,
}

impl Default for TimeIntegration {
    fn default() -> Self {
        Self {
            dt: 1.0,
            time_steps: 0,
            bdf_order: 1,
        }
    }
}

impl TimeIntegration {
    pub fn new(dt: f64, time_steps: usize, bdf_order: usize) -> Result<Self> {
        let t = Self {
            dt,
            time_steps,
            bdf_order,
        };
        t.validate()?;
        Ok(t)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.dt > 0.0) || !self.dt.is_finite() {
            return Err(AdjointError::Config(format!(
                "time step must be positive and finite, got {}",
                self.dt
            )));
        }
        if self.bdf_order == 0 || self.bdf_order > MAX_BDF_ORDER {
            return Err(AdjointError::Config(format!(
                "BDF order must be in 1..={MAX_BDF_ORDER}, got {}",
                self.bdf_order
            )));
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────
//  Top-level document
// ─────────────────────────────────────────────────────────────

/// Settings for one simulation, as read from a JSON document:
///
/// ```json
/// { "time": { "dt": 0.01, "time_steps": 50, "bdf_order": 2 },
///   "solver": { "adjoint_solver": "dense_lu" } }
/// ```
///
/// A missing `time` block means a static problem.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SimulationSettings {
    #[serde(default)]
    pub time: Option<TimeIntegration>,
    #[serde(default)]
    pub solver: AdjointSettings,
}

impl SimulationSettings {
    pub fn from_json_str(text: &str) -> Result<Self> {
        let settings: Self = serde_json::from_str(text)?;
        if let Some(time) = &settings.time {
            time.validate()?;
        }
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_transient_document() {
        let s = SimulationSettings::from_json_str(
            r#"{ "time": { "dt": 0.5, "time_steps": 4, "bdf_order": 2 },
                 "solver": { "adjoint_solver": "ldl" } }"#,
        )
        .unwrap();
        let time = s.time.unwrap();
        assert_eq!(time.time_steps, 4);
        assert_eq!(time.bdf_order, 2);
        assert_eq!(s.solver.adjoint_solver, "ldl");
        assert_eq!(s.solver.prefactorized_solver, "ldl");
    }

    #[test]
    fn static_when_time_block_missing() {
        let s = SimulationSettings::from_json_str("{}").unwrap();
        assert!(s.time.is_none());
        assert_eq!(s.solver, AdjointSettings::default());
        assert_eq!(s.solver.adjoint_solver, "ldl");
    }

    #[test]
    fn rejects_bdf_order_out_of_range() {
        let err = SimulationSettings::from_json_str(r#"{ "time": { "dt": 0.1, "bdf_order": 7 } }"#)
            .unwrap_err();
        assert!(matches!(err, AdjointError::Config(_)));
        assert!(TimeIntegration::new(0.0, 3, 1).is_err());
    }
}
