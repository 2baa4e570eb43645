//! Controller strategies
//!
//! A controller turns the tracking errors and resource measurements of one
//! control interval into share deltas. Categories are decided in stages, in
//! the order given by `Controller::categories`; later stages see the shares
//! already decided by earlier ones (cascade).
//!
//! Available strategies:
//! - `FuzzyRuleController`: two-stage fuzzy rules (CPU, then memory)
//! - `LqStateFeedbackController`: LQ regulator on an identified ARX model
//! - `LinearizedMpcController`: finite-horizon MPC on an identified ARX model

mod fuzzy;
pub mod inference;
mod lq;
mod mpc;
pub mod optimizer;
mod plant;

pub use fuzzy::FuzzyRuleController;
pub use lq::{dlqr, LqConfig, LqStateFeedbackController};
pub use mpc::{LinearizedMpcController, MpcConfig};
pub use optimizer::{
    CompassSearchOptimizer, Optimizer, OptimizerError, OptimizerSolution, OptimizerStatus,
};
pub use plant::IdentifiedChannel;

use crate::models::{Channel, EntityId, PerformanceMetric, ResourceCategory, ResourceMeasurement};
use crate::realization::RealizationError;
use crate::sysid::SysIdError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Errors a controller can report for an interval
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ControllerError {
    /// The identified model has not seen enough samples yet
    #[error("identified model not ready")]
    ModelNotReady,

    #[error("identification failed: {0}")]
    Identification(#[from] SysIdError),

    #[error("realization failed: {0}")]
    Realization(#[from] RealizationError),

    /// No rule fired for the given inputs
    #[error("rule coverage collapsed for {entity}/{category}")]
    RuleCoverage {
        entity: EntityId,
        category: ResourceCategory,
    },

    #[error("missing input: {0}")]
    MissingInput(String),

    #[error("infeasible: {0}")]
    Infeasible(String),

    #[error("invalid controller configuration: {0}")]
    Configuration(String),
}

/// Admissible delta range for one channel.
///
/// The lower bound keeps the share at or above the slack-scaled utilization,
/// the upper bound keeps it at or below a full share.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DeltaBounds {
    pub lower: f64,
    pub upper: f64,
}

impl DeltaBounds {
    pub fn for_measurement(measurement: &ResourceMeasurement, slack: f64) -> Self {
        let old = measurement.old_share;
        let lower = (measurement.utilization * slack).min(1.0) - old;
        let upper = (1.0 - old).max(0.0);
        // utilization above the full share would invert the range
        Self {
            lower: lower.min(upper),
            upper,
        }
    }

    pub fn clamp(&self, delta: f64) -> f64 {
        delta.clamp(self.lower, self.upper)
    }
}

/// Everything a controller sees for one stage of an interval
#[derive(Debug, Clone, Copy)]
pub struct StageInput<'a> {
    pub category: ResourceCategory,
    /// Normalized tracking error per metric, negative when the target is violated
    pub errors: &'a BTreeMap<PerformanceMetric, f64>,
    /// Errors of the previous applied or failed interval
    pub previous_errors: Option<&'a BTreeMap<PerformanceMetric, f64>>,
    pub measurements: &'a BTreeMap<Channel, ResourceMeasurement>,
    pub bounds: &'a BTreeMap<Channel, DeltaBounds>,
    /// Shares decided by earlier stages of this interval
    pub decided: &'a BTreeMap<Channel, f64>,
}

impl<'a> StageInput<'a> {
    /// Error of the first configured metric
    pub fn primary_error(&self) -> Result<f64, ControllerError> {
        self.errors
            .values()
            .next()
            .copied()
            .ok_or_else(|| ControllerError::MissingInput("tracking error".to_string()))
    }

    /// Channels of this stage's category
    pub fn channels(&self) -> impl Iterator<Item = (&'a EntityId, &'a ResourceMeasurement)> {
        let category = self.category;
        let measurements: &'a BTreeMap<Channel, ResourceMeasurement> = self.measurements;
        measurements
            .iter()
            .filter(move |((_, c), _)| *c == category)
            .map(|((entity, _), m)| (entity, m))
    }

    pub fn measurement(
        &self,
        entity: &str,
        category: ResourceCategory,
    ) -> Option<&'a ResourceMeasurement> {
        self.measurements.get(&(entity.to_string(), category))
    }

    pub fn bounds_for(&self, entity: &str) -> Option<DeltaBounds> {
        self.bounds.get(&(entity.to_string(), self.category)).copied()
    }

    /// Share of `category` after earlier stages, falling back to the measured share
    pub fn current_share(&self, entity: &str, category: ResourceCategory) -> Option<f64> {
        let key = (entity.to_string(), category);
        self.decided
            .get(&key)
            .copied()
            .or_else(|| self.measurements.get(&key).map(|m| m.old_share))
    }
}

/// A control strategy producing share deltas
pub trait Controller: Send {
    fn name(&self) -> &'static str;

    /// Categories decided by this controller, in stage order
    fn categories(&self) -> Vec<ResourceCategory>;

    /// Propose a share delta per entity for `input.category`
    fn propose(
        &mut self,
        input: &StageInput<'_>,
    ) -> Result<BTreeMap<EntityId, f64>, ControllerError>;

    /// Forget any internal history
    fn reset(&mut self) {}
}

/// Controller selection, deserializable from configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ControllerKind {
    Fuzzy,
    Lq(LqConfig),
    Mpc(MpcConfig),
}

impl Default for ControllerKind {
    fn default() -> Self {
        ControllerKind::Fuzzy
    }
}

impl ControllerKind {
    pub fn build(&self) -> Result<Box<dyn Controller>, ControllerError> {
        Ok(match self {
            ControllerKind::Fuzzy => Box::new(
                FuzzyRuleController::fc2q()
                    .map_err(|e| ControllerError::Configuration(e.to_string()))?,
            ),
            ControllerKind::Lq(config) => Box::new(LqStateFeedbackController::new(config.clone())?),
            ControllerKind::Mpc(config) => Box::new(LinearizedMpcController::new(
                config.clone(),
                Box::new(CompassSearchOptimizer::default()),
            )?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delta_bounds() {
        let m = ResourceMeasurement::new(0.5, 0.2);
        let b = DeltaBounds::for_measurement(&m, 1.1);
        assert!((b.lower - (0.22 - 0.5)).abs() < 1e-12);
        assert!((b.upper - 0.5).abs() < 1e-12);
        assert_eq!(b.clamp(2.0), b.upper);
        assert_eq!(b.clamp(-2.0), b.lower);
    }

    #[test]
    fn test_delta_bounds_saturated_utilization() {
        // utilization above the full share: both bounds meet at the full share
        let m = ResourceMeasurement::new(0.6, 0.95);
        let b = DeltaBounds::for_measurement(&m, 1.1);
        assert!((b.lower - 0.4).abs() < 1e-12);
        assert!((b.upper - 0.4).abs() < 1e-12);
    }

    #[test]
    fn test_stage_input_lookups() {
        let mut errors = BTreeMap::new();
        errors.insert(PerformanceMetric::ResponseTime, -0.2);
        let mut measurements = BTreeMap::new();
        measurements.insert(
            ("vm1".to_string(), ResourceCategory::Cpu),
            ResourceMeasurement::new(0.4, 0.3),
        );
        measurements.insert(
            ("vm1".to_string(), ResourceCategory::Memory),
            ResourceMeasurement::new(0.5, 0.1),
        );
        let bounds = BTreeMap::new();
        let mut decided = BTreeMap::new();
        decided.insert(("vm1".to_string(), ResourceCategory::Cpu), 0.5);

        let input = StageInput {
            category: ResourceCategory::Memory,
            errors: &errors,
            previous_errors: None,
            measurements: &measurements,
            bounds: &bounds,
            decided: &decided,
        };
        assert_eq!(input.primary_error().unwrap(), -0.2);
        assert_eq!(input.channels().count(), 1);
        assert_eq!(input.current_share("vm1", ResourceCategory::Cpu), Some(0.5));
        assert_eq!(input.current_share("vm1", ResourceCategory::Memory), Some(0.5));
        assert!(input.bounds_for("vm1").is_none());
    }

    #[test]
    fn test_controller_kind_from_json() {
        let kind: ControllerKind = serde_json::from_str(r#"{"kind":"fuzzy"}"#).unwrap();
        let controller = kind.build().unwrap();
        assert_eq!(controller.name(), "fuzzy");
        assert_eq!(
            controller.categories(),
            vec![ResourceCategory::Cpu, ResourceCategory::Memory]
        );
    }
}
