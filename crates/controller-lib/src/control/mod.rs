//! Control-loop runtime
//!
//! One `ControlManager` drives one application:
//! - `sample()` drains the sensors into estimators (performance) and smoothers (utilization)
//! - `control()` runs one interval: tracking errors, measurements, the controller stages,
//!   the actuation-safety stage and an all-or-nothing write of the new shares
//! - `reset()` starts a fresh run
//!
//! `ControlLoopRunner` puts a manager on a pair of tokio timers.

mod manager;
mod runner;
mod state;


pub use manager::{actuation_decision, ControlManager, ControlManagerBuilder};
pub use runner::{ControlLoopRunner, ControlLoopRunnerBuilder, RunnerConfig};
pub use state::ControlState;

use crate::estimation::{EstimatorKind, SmootherKind};
use crate::models::{ControlOutcome, EntityId, PerformanceMetric, ResourceCategory, ResourceMeasurement};
use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Lifecycle phase of a manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Reset,
    Sampling,
    Controlling,
    Skipped,
    Applying,
    Applied,
    Failed,
}

/// Runtime configuration of a manager
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Number of initial control invocations that are always skipped
    #[serde(default = "default_warmup_threshold")]
    pub warmup_threshold: u64,
    #[serde(default)]
    pub share_min: f64,
    #[serde(default = "default_share_max")]
    pub share_max: f64,
    /// Rounding grid and hysteresis band for share updates
    #[serde(default = "default_share_tolerance")]
    pub share_tolerance: f64,
    /// Headroom factor applied to utilization when bounding shares from below
    #[serde(default = "default_utilization_slack")]
    pub utilization_slack: f64,
    /// Freeze shares at the slack-scaled utilization after this many
    /// consecutive infeasible intervals
    #[serde(default)]
    pub fallback_after_failures: Option<u32>,
    #[serde(default = "default_sampling_secs")]
    pub sampling_secs: u64,
    #[serde(default = "default_control_secs")]
    pub control_secs: u64,
    /// Forget the performance estimates after every control invocation
    #[serde(default)]
    pub reset_estimators_each_interval: bool,
    #[serde(default)]
    pub estimator: EstimatorKind,
    #[serde(default)]
    pub smoother: SmootherKind,
    /// CSV interval log, one row per control invocation
    #[serde(default)]
    pub interval_log: Option<PathBuf>,
}

fn default_warmup_threshold() -> u64 {
    5
}

fn default_share_max() -> f64 {
    1.0
}

fn default_share_tolerance() -> f64 {
    0.01
}

fn default_utilization_slack() -> f64 {
    1.1
}

fn default_sampling_secs() -> u64 {
    1
}

fn default_control_secs() -> u64 {
    5
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            warmup_threshold: default_warmup_threshold(),
            share_min: 0.0,
            share_max: default_share_max(),
            share_tolerance: default_share_tolerance(),
            utilization_slack: default_utilization_slack(),
            fallback_after_failures: None,
            sampling_secs: default_sampling_secs(),
            control_secs: default_control_secs(),
            reset_estimators_each_interval: false,
            estimator: EstimatorKind::default(),
            smoother: SmootherKind::default(),
            interval_log: None,
        }
    }
}

impl ManagerConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(
            0.0 <= self.share_min && self.share_min <= self.share_max && self.share_max <= 1.0,
            "share bounds must satisfy 0 <= share_min <= share_max <= 1, got [{}, {}]",
            self.share_min,
            self.share_max
        );
        ensure!(
            self.share_tolerance.is_finite() && self.share_tolerance >= 0.0,
            "share_tolerance must be a non-negative number"
        );
        ensure!(
            self.utilization_slack.is_finite() && self.utilization_slack > 0.0,
            "utilization_slack must be positive"
        );
        ensure!(
            self.sampling_secs > 0 && self.control_secs > 0,
            "sampling and control periods must be positive"
        );
        Ok(())
    }
}

/// Measurement of one channel as reported for an interval
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelMeasurement {
    pub entity: EntityId,
    pub category: ResourceCategory,
    #[serde(flatten)]
    pub measurement: ResourceMeasurement,
}

/// Everything observable about one control invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntervalReport {
    pub app: String,
    /// 1-based control invocation number
    pub interval: u64,
    pub timestamp: i64,
    pub outcome: ControlOutcome,
    /// Counters after this interval
    pub state: ControlState,
    /// Estimated performance per metric
    pub measured: BTreeMap<PerformanceMetric, f64>,
    /// Normalized tracking error per metric
    pub errors: BTreeMap<PerformanceMetric, f64>,
    pub measurements: Vec<ChannelMeasurement>,
    pub elapsed_micros: u64,
}

impl IntervalReport {
    pub fn measurement(&self, entity: &str, category: ResourceCategory) -> Option<&ResourceMeasurement> {
        self.measurements
            .iter()
            .find(|m| m.entity == entity && m.category == category)
            .map(|m| &m.measurement)
    }
}
