//! Controller library for adaptive resource-share control of multi-tier applications
//!
//! This crate provides the core functionality for:
//! - Performance estimation and utilization smoothing
//! - Online ARX identification and state-space realization
//! - Fuzzy, LQ and MPC controller strategies
//! - The per-application control-loop runtime
//! - Health checks and observability

pub mod actuator;
pub mod control;
pub mod controllers;
pub mod error;
pub mod estimation;
pub mod health;
pub mod interval_log;
pub mod models;
pub mod observability;
pub mod realization;
pub mod sensors;
pub mod sim;
pub mod sysid;

pub use actuator::{InMemoryActuator, ShareActuator};
pub use control::{
    ControlLoopRunner, ControlLoopRunnerBuilder, ControlManager, ControlManagerBuilder,
    ControlState, IntervalReport, ManagerConfig, Phase,
};
pub use controllers::{Controller, ControllerError, ControllerKind};
pub use error::{ActuatorError, ControlError};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, LoopHealth, ReadinessResponse,
};
pub use models::*;
pub use observability::{ControlMetrics, StructuredLogger};
pub use sensors::{BufferedSensor, Sensor, SensorFeed};
