//! Health of the controller process and of each control loop
//!
//! - Shared components (`control_loop`, `identification`, `actuator`) carry the
//!   worst recent condition observed by any loop.
//! - Every application gets a `LoopHealth` entry summarizing its last interval.
//! - A loop whose intervals keep failing turns `control_loop` unhealthy, which
//!   also withdraws readiness.

use crate::models::{ControlOutcome, SkipReason};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Consecutive failed intervals after which a loop counts as unhealthy
pub const UNHEALTHY_AFTER_FAILURES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Healthy,
    /// Still operational
    Degraded,
    Unhealthy,
}

impl ComponentStatus {
    pub fn is_operational(&self) -> bool {
        !matches!(self, ComponentStatus::Unhealthy)
    }

    fn worst(self, other: Self) -> Self {
        use ComponentStatus::*;
        match (self, other) {
            (Unhealthy, _) | (_, Unhealthy) => Unhealthy,
            (Degraded, _) | (_, Degraded) => Degraded,
            _ => Healthy,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub last_check_timestamp: i64,
}

impl ComponentHealth {
    fn with_status(status: ComponentStatus, message: Option<String>) -> Self {
        Self {
            status,
            message,
            last_check_timestamp: chrono::Utc::now().timestamp(),
        }
    }

    pub fn healthy() -> Self {
        Self::with_status(ComponentStatus::Healthy, None)
    }

    pub fn degraded(message: impl Into<String>) -> Self {
        Self::with_status(ComponentStatus::Degraded, Some(message.into()))
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self::with_status(ComponentStatus::Unhealthy, Some(message.into()))
    }
}

/// Summary of one application's control loop
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopHealth {
    /// Last completed interval number
    pub interval: u64,
    /// `applied`, `skipped` or `failed`
    pub last_outcome: String,
    pub consecutive_failures: u32,
    pub sysid_failures: u64,
    pub last_update_timestamp: i64,
}

impl LoopHealth {
    pub fn status(&self) -> ComponentStatus {
        match self.consecutive_failures {
            0 => ComponentStatus::Healthy,
            n if n >= UNHEALTHY_AFTER_FAILURES => ComponentStatus::Unhealthy,
            _ => ComponentStatus::Degraded,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: ComponentStatus,
    pub components: BTreeMap<String, ComponentHealth>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub loops: BTreeMap<String, LoopHealth>,
}

impl HealthResponse {
    /// Worst status over all components
    pub fn compute_status(components: &BTreeMap<String, ComponentHealth>) -> ComponentStatus {
        components
            .values()
            .fold(ComponentStatus::Healthy, |acc, c| acc.worst(c.status))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Component names for health tracking
pub mod components {
    pub const CONTROL_LOOP: &str = "control_loop";
    pub const IDENTIFICATION: &str = "identification";
    pub const ACTUATOR: &str = "actuator";
}

#[derive(Debug, Default)]
struct HealthState {
    components: BTreeMap<String, ComponentHealth>,
    loops: BTreeMap<String, LoopHealth>,
    ready: bool,
}

/// Shared, cloneable health registry
#[derive(Debug, Clone, Default)]
pub struct HealthRegistry {
    state: Arc<RwLock<HealthState>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a component as healthy
    pub async fn register(&self, name: &str) {
        self.update(name, ComponentHealth::healthy()).await;
    }

    pub async fn update(&self, name: &str, health: ComponentHealth) {
        self.state
            .write()
            .await
            .components
            .insert(name.to_string(), health);
    }

    pub async fn set_healthy(&self, name: &str) {
        self.update(name, ComponentHealth::healthy()).await;
    }

    pub async fn set_degraded(&self, name: &str, message: impl Into<String>) {
        self.update(name, ComponentHealth::degraded(message)).await;
    }

    pub async fn set_unhealthy(&self, name: &str, message: impl Into<String>) {
        self.update(name, ComponentHealth::unhealthy(message)).await;
    }

    pub async fn set_ready(&self, ready: bool) {
        self.state.write().await.ready = ready;
    }

    pub async fn health(&self) -> HealthResponse {
        let state = self.state.read().await;
        HealthResponse {
            status: HealthResponse::compute_status(&state.components),
            components: state.components.clone(),
            loops: state.loops.clone(),
        }
    }

    /// Per-application loop summaries
    pub async fn loops(&self) -> BTreeMap<String, LoopHealth> {
        self.state.read().await.loops.clone()
    }

    pub async fn readiness(&self) -> ReadinessResponse {
        let state = self.state.read().await;
        let reason = if !state.ready {
            Some("Control loops not started".to_string())
        } else if !HealthResponse::compute_status(&state.components).is_operational() {
            Some("Critical component unhealthy".to_string())
        } else {
            None
        };
        ReadinessResponse {
            ready: reason.is_none(),
            reason,
        }
    }

    /// Fold one interval outcome of `app` into the loop summary and the components
    pub async fn record_outcome(&self, app: &str, interval: u64, outcome: &ControlOutcome) {
        let mut state = self.state.write().await;
        let entry = state.loops.entry(app.to_string()).or_default();
        entry.interval = interval;
        entry.last_outcome = outcome.label().to_string();
        entry.last_update_timestamp = chrono::Utc::now().timestamp();
        match outcome {
            ControlOutcome::Failed { .. } => entry.consecutive_failures += 1,
            ControlOutcome::Applied { .. } => entry.consecutive_failures = 0,
            ControlOutcome::Skipped { .. } => {}
        }
        if let ControlOutcome::Skipped {
            reason: SkipReason::ModelDivergence(_),
        } = outcome
        {
            entry.sysid_failures += 1;
        }
        let failures = entry.consecutive_failures;
        let loop_status = entry.status();
        let all_loops_healthy = state
            .loops
            .values()
            .all(|l| l.status() == ComponentStatus::Healthy);

        let mut set = |name: &str, health: ComponentHealth| {
            state.components.insert(name.to_string(), health);
        };
        match outcome {
            ControlOutcome::Applied { .. } => {
                if all_loops_healthy {
                    set(components::CONTROL_LOOP, ComponentHealth::healthy());
                }
                set(components::ACTUATOR, ComponentHealth::healthy());
            }
            ControlOutcome::Skipped {
                reason: SkipReason::ModelDivergence(detail),
            } => {
                set(
                    components::IDENTIFICATION,
                    ComponentHealth::degraded(format!("{}: {}", app, detail)),
                );
            }
            ControlOutcome::Skipped { .. } => {}
            ControlOutcome::Failed { reason, .. } => {
                let message = format!("{}: {}", app, reason);
                if reason.starts_with("actuation rejected") {
                    set(components::ACTUATOR, ComponentHealth::unhealthy(message));
                } else if loop_status == ComponentStatus::Unhealthy {
                    set(
                        components::CONTROL_LOOP,
                        ComponentHealth::unhealthy(format!(
                            "{} failed {} intervals in a row",
                            app, failures
                        )),
                    );
                } else {
                    set(components::CONTROL_LOOP, ComponentHealth::degraded(message));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed(reason: &str) -> ControlOutcome {
        ControlOutcome::Failed {
            reason: reason.to_string(),
            fallback: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_empty_registry_is_healthy_but_not_ready() {
        let registry = HealthRegistry::new();
        let health = registry.health().await;
        assert_eq!(health.status, ComponentStatus::Healthy);
        assert!(health.components.is_empty());

        let readiness = registry.readiness().await;
        assert!(!readiness.ready);
        assert_eq!(readiness.reason.as_deref(), Some("Control loops not started"));
    }

    #[tokio::test]
    async fn test_divergence_degrades_identification() {
        let registry = HealthRegistry::new();
        registry.register(components::CONTROL_LOOP).await;
        registry.register(components::IDENTIFICATION).await;

        registry
            .record_outcome(
                "olio",
                7,
                &ControlOutcome::Skipped {
                    reason: SkipReason::ModelDivergence("covariance bound".to_string()),
                },
            )
            .await;

        let health = registry.health().await;
        assert_eq!(health.status, ComponentStatus::Degraded);
        assert_eq!(
            health.components[components::IDENTIFICATION].message.as_deref(),
            Some("olio: covariance bound")
        );
        assert_eq!(health.loops["olio"].sysid_failures, 1);
        assert_eq!(health.loops["olio"].last_outcome, "skipped");
    }

    #[tokio::test]
    async fn test_rejected_actuation_blocks_readiness() {
        let registry = HealthRegistry::new();
        registry.register(components::ACTUATOR).await;
        registry.set_ready(true).await;
        assert!(registry.readiness().await.ready);

        registry
            .record_outcome("olio", 1, &failed("actuation rejected: share 2 out of range"))
            .await;
        let readiness = registry.readiness().await;
        assert!(!readiness.ready);
        assert_eq!(readiness.reason.as_deref(), Some("Critical component unhealthy"));
    }

    #[tokio::test]
    async fn test_repeated_failures_escalate() {
        let registry = HealthRegistry::new();
        for k in 1..UNHEALTHY_AFTER_FAILURES as u64 {
            registry
                .record_outcome("rubis", k, &failed("controller infeasible: no solution"))
                .await;
            assert_eq!(registry.health().await.status, ComponentStatus::Degraded);
        }
        registry
            .record_outcome(
                "rubis",
                UNHEALTHY_AFTER_FAILURES as u64,
                &failed("controller infeasible: no solution"),
            )
            .await;
        let health = registry.health().await;
        assert_eq!(health.status, ComponentStatus::Unhealthy);
        assert_eq!(health.loops["rubis"].status(), ComponentStatus::Unhealthy);

        registry
            .record_outcome("rubis", 4, &ControlOutcome::Applied { decisions: Vec::new() })
            .await;
        let health = registry.health().await;
        assert_eq!(health.status, ComponentStatus::Healthy);
        assert_eq!(health.loops["rubis"].consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_loops_tracked_per_application() {
        let registry = HealthRegistry::new();
        registry
            .record_outcome("a", 3, &ControlOutcome::Applied { decisions: Vec::new() })
            .await;
        registry
            .record_outcome(
                "b",
                1,
                &ControlOutcome::Skipped {
                    reason: SkipReason::WarmupPending,
                },
            )
            .await;
        let loops = registry.loops().await;
        assert_eq!(loops.len(), 2);
        assert_eq!(loops["a"].interval, 3);
        assert_eq!(loops["b"].last_outcome, "skipped");
    }
}
