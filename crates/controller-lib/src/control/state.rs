use crate::models::{ControlOutcome, SkipReason};
use serde::{Deserialize, Serialize};

/// Control counters of one run
///
/// Every invocation increments `control_count` and exactly one of
/// `skip_count`, `fail_count` and `applied_count`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlState {
    pub control_count: u64,
    pub skip_count: u64,
    pub fail_count: u64,
    pub applied_count: u64,
    /// Identification divergences reported by the controller
    pub sysid_fail_count: u64,
    pub warmup_threshold: u64,
}

impl ControlState {
    pub fn new(warmup_threshold: u64) -> Self {
        Self {
            warmup_threshold,
            ..Self::default()
        }
    }

    /// Start a control invocation, returning its 1-based number
    pub fn begin_interval(&mut self) -> u64 {
        self.control_count += 1;
        self.control_count
    }

    pub fn in_warmup(&self) -> bool {
        self.control_count <= self.warmup_threshold
    }

    pub fn record(&mut self, outcome: &ControlOutcome) {
        match outcome {
            ControlOutcome::Skipped { reason } => {
                self.skip_count += 1;
                if matches!(reason, SkipReason::ModelDivergence(_)) {
                    self.sysid_fail_count += 1;
                }
            }
            ControlOutcome::Failed { .. } => self.fail_count += 1,
            ControlOutcome::Applied { .. } => self.applied_count += 1,
        }
    }

    pub fn is_consistent(&self) -> bool {
        self.skip_count + self.fail_count + self.applied_count == self.control_count
    }
}
