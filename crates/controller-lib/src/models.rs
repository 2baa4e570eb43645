//! Core data models for the tier controller

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a managed entity (a virtual machine hosting one tier)
pub type EntityId = String;

/// A single timestamped measurement produced by a sensor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    /// Unix timestamp in seconds
    pub timestamp: i64,
    pub value: f64,
    /// Free-form label (request class, VM name, ...)
    pub label: String,
}

impl Observation {
    pub fn new(value: f64) -> Self {
        Self {
            timestamp: chrono::Utc::now().timestamp(),
            value,
            label: String::new(),
        }
    }

    pub fn labelled(value: f64, label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ..Self::new(value)
        }
    }
}

/// Whether larger or smaller values of a metric are desirable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    SmallerIsBetter,
    LargerIsBetter,
}

/// Application-level performance metric tracked against a target
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PerformanceMetric {
    ResponseTime,
    Throughput,
}

impl PerformanceMetric {
    pub fn direction(&self) -> Direction {
        match self {
            PerformanceMetric::ResponseTime => Direction::SmallerIsBetter,
            PerformanceMetric::Throughput => Direction::LargerIsBetter,
        }
    }

    /// Normalized tracking error of `measured` against `target`.
    ///
    /// - `SmallerIsBetter`: `(target - measured) / target`
    /// - `LargerIsBetter`: `(measured - target) / target`
    ///
    /// For both directions a negative error means the target is violated and
    /// resource should be added, a positive error means headroom. Controllers
    /// read this sign convention, not `e > 0` as "add resource". Returns `None`
    /// when the target is zero or either input is not finite.
    pub fn tracking_error(&self, target: f64, measured: f64) -> Option<f64> {
        if !target.is_finite() || !measured.is_finite() || target == 0.0 {
            return None;
        }
        let err = match self.direction() {
            Direction::SmallerIsBetter => (target - measured) / target,
            Direction::LargerIsBetter => (measured - target) / target,
        };
        Some(err)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PerformanceMetric::ResponseTime => "response_time",
            PerformanceMetric::Throughput => "throughput",
        }
    }
}

impl fmt::Display for PerformanceMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of resource whose share is controlled
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceCategory {
    Cpu,
    Memory,
}

impl ResourceCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceCategory::Cpu => "cpu",
            ResourceCategory::Memory => "memory",
        }
    }
}

impl fmt::Display for ResourceCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A controlled channel: one resource category of one entity
pub type Channel = (EntityId, ResourceCategory);

/// Per-interval view of one channel, derived before the controller runs
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceMeasurement {
    /// Share in effect during the interval that just ended
    pub old_share: f64,
    /// Smoothed utilization forecast for the current interval
    pub utilization: f64,
    /// `old_share - utilization`
    pub residual: f64,
}

impl ResourceMeasurement {
    pub fn new(old_share: f64, utilization: f64) -> Self {
        Self {
            old_share,
            utilization,
            residual: old_share - utilization,
        }
    }

    /// Residual as a fraction of the current share, or `None` when the share is zero
    pub fn relative_residual(&self) -> Option<f64> {
        if self.old_share > 0.0 {
            Some(self.residual / self.old_share)
        } else {
            None
        }
    }
}

/// Result of the actuation-safety stage for one channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActuationDecision {
    pub entity: EntityId,
    pub category: ResourceCategory,
    pub old_share: f64,
    /// Delta as returned by the controller
    pub proposed_delta: f64,
    /// Delta after clamping to the channel bounds
    pub clamped_delta: f64,
    /// Share after clamping and rounding to the tolerance grid
    pub new_share: f64,
    /// Whether the new share passed the hysteresis check and is written
    pub applied: bool,
}

impl ActuationDecision {
    /// The share in effect once the decision is carried out
    pub fn effective_share(&self) -> f64 {
        if self.applied {
            self.new_share
        } else {
            self.old_share
        }
    }
}

/// Why a control interval was skipped
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum SkipReason {
    WarmupPending,
    DataUnavailable(String),
    ModelNotReady,
    ModelDivergence(String),
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::WarmupPending => "warmup_pending",
            SkipReason::DataUnavailable(_) => "data_unavailable",
            SkipReason::ModelNotReady => "model_not_ready",
            SkipReason::ModelDivergence(_) => "model_divergence",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::WarmupPending => write!(f, "warm-up pending"),
            SkipReason::DataUnavailable(what) => write!(f, "data unavailable: {}", what),
            SkipReason::ModelNotReady => write!(f, "identified model not ready"),
            SkipReason::ModelDivergence(detail) => write!(f, "model divergence: {}", detail),
        }
    }
}

/// Outcome of one control invocation; exactly one per interval
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ControlOutcome {
    Skipped {
        reason: SkipReason,
    },
    Failed {
        reason: String,
        /// Decisions written by the fallback policy, empty when disabled
        fallback: Vec<ActuationDecision>,
    },
    Applied {
        decisions: Vec<ActuationDecision>,
    },
}

impl ControlOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            ControlOutcome::Skipped { .. } => "skipped",
            ControlOutcome::Failed { .. } => "failed",
            ControlOutcome::Applied { .. } => "applied",
        }
    }

    pub fn decisions(&self) -> &[ActuationDecision] {
        match self {
            ControlOutcome::Skipped { .. } => &[],
            ControlOutcome::Failed { fallback, .. } => fallback,
            ControlOutcome::Applied { decisions } => decisions,
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, ControlOutcome::Applied { .. })
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, ControlOutcome::Skipped { .. })
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, ControlOutcome::Failed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_time_error_sign() {
        let m = PerformanceMetric::ResponseTime;
        // measured above target: violation, negative error
        let e = m.tracking_error(1.0, 1.5).unwrap();
        assert!((e + 0.5).abs() < 1e-12);
        // measured below target: headroom
        assert!(m.tracking_error(1.0, 0.5).unwrap() > 0.0);
    }

    #[test]
    fn test_throughput_error_sign() {
        let m = PerformanceMetric::Throughput;
        assert!(m.tracking_error(100.0, 80.0).unwrap() < 0.0);
        assert!(m.tracking_error(100.0, 120.0).unwrap() > 0.0);
    }

    #[test]
    fn test_tracking_error_rejects_degenerate_inputs() {
        let m = PerformanceMetric::ResponseTime;
        assert!(m.tracking_error(0.0, 1.0).is_none());
        assert!(m.tracking_error(1.0, f64::NAN).is_none());
    }

    #[test]
    fn test_measurement_residual() {
        let m = ResourceMeasurement::new(0.5, 0.2);
        assert!((m.residual - 0.3).abs() < 1e-12);
        assert!((m.relative_residual().unwrap() - 0.6).abs() < 1e-12);
        assert!(ResourceMeasurement::new(0.0, 0.1).relative_residual().is_none());
    }

    #[test]
    fn test_outcome_serialization() {
        let outcome = ControlOutcome::Skipped {
            reason: SkipReason::WarmupPending,
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["outcome"], "skipped");
        assert_eq!(outcome.label(), "skipped");
        assert!(outcome.decisions().is_empty());
    }
}
