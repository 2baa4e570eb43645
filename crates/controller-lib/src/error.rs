//! Error taxonomy of the control loop
//!
//! Every error here is recovered inside a control interval; callers of the
//! runtime only ever see them through interval reports, counters and logs.

use crate::models::{EntityId, ResourceCategory, SkipReason};
use thiserror::Error;

/// Interval-level failure classes
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ControlError {
    /// An estimator or smoother has no data for the interval
    #[error("data unavailable: {0}")]
    DataUnavailable(String),

    /// Control is still inside the warm-up window
    #[error("warm-up pending")]
    WarmupPending,

    /// Identified model produced non-finite parameters or the updater failed
    #[error("model divergence: {0}")]
    ModelDivergence(String),

    /// Controller produced no usable proposal
    #[error("controller infeasible: {0}")]
    ControllerInfeasible(String),

    /// Actuator refused a share update
    #[error("actuation rejected: {0}")]
    ActuationRejected(String),
}

impl ControlError {
    /// Skip reason for the error classes that skip rather than fail an interval
    pub fn skip_reason(&self) -> Option<SkipReason> {
        match self {
            ControlError::DataUnavailable(what) => Some(SkipReason::DataUnavailable(what.clone())),
            ControlError::WarmupPending => Some(SkipReason::WarmupPending),
            ControlError::ModelDivergence(detail) => {
                Some(SkipReason::ModelDivergence(detail.clone()))
            }
            ControlError::ControllerInfeasible(_) | ControlError::ActuationRejected(_) => None,
        }
    }
}

/// Errors raised by a share actuator
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ActuatorError {
    #[error("unknown channel {entity}/{category}")]
    UnknownChannel {
        entity: EntityId,
        category: ResourceCategory,
    },

    #[error("share {value} rejected for {entity}/{category}: {reason}")]
    Rejected {
        entity: EntityId,
        category: ResourceCategory,
        value: f64,
        reason: String,
    },
}

impl From<ActuatorError> for ControlError {
    fn from(e: ActuatorError) -> Self {
        match e {
            ActuatorError::UnknownChannel { .. } => ControlError::DataUnavailable(e.to_string()),
            ActuatorError::Rejected { .. } => ControlError::ActuationRejected(e.to_string()),
        }
    }
}
