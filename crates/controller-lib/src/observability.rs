//! Observability infrastructure for the tier controller
//!
//! Provides:
//! - Prometheus metrics (interval outcomes, skip reasons, identification failures,
//!   control latency, current shares and tracking errors)
//! - Structured JSON logging with tracing

use crate::models::{ControlOutcome, PerformanceMetric, ResourceCategory};
use prometheus::{
    register_gauge_vec, register_histogram_vec, register_int_counter_vec, GaugeVec, HistogramVec,
    IntCounterVec,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Histogram buckets for control latency (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.00005, 0.0001, 0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<ControlMetricsInner> = OnceLock::new();

struct ControlMetricsInner {
    control_intervals: IntCounterVec,
    skipped_intervals: IntCounterVec,
    sysid_failures: IntCounterVec,
    control_latency_seconds: HistogramVec,
    share: GaugeVec,
    tracking_error: GaugeVec,
}

impl ControlMetricsInner {
    fn new() -> Self {
        Self {
            control_intervals: register_int_counter_vec!(
                "tier_controller_control_intervals_total",
                "Control invocations by outcome",
                &["app", "outcome"]
            )
            .expect("Failed to register control_intervals_total"),

            skipped_intervals: register_int_counter_vec!(
                "tier_controller_skipped_intervals_total",
                "Skipped control intervals by reason",
                &["app", "reason"]
            )
            .expect("Failed to register skipped_intervals_total"),

            sysid_failures: register_int_counter_vec!(
                "tier_controller_sysid_failures_total",
                "Identification divergences that reset a model",
                &["app"]
            )
            .expect("Failed to register sysid_failures_total"),

            control_latency_seconds: register_histogram_vec!(
                "tier_controller_control_latency_seconds",
                "Time spent in one control invocation",
                &["app"],
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register control_latency_seconds"),

            share: register_gauge_vec!(
                "tier_controller_share_ratio",
                "Resource share in effect per entity and category",
                &["app", "entity", "category"]
            )
            .expect("Failed to register share_ratio"),

            tracking_error: register_gauge_vec!(
                "tier_controller_tracking_error",
                "Normalized tracking error of the last interval",
                &["app", "metric"]
            )
            .expect("Failed to register tracking_error"),
        }
    }
}

/// Handle to the global controller metrics; clones share the same metrics
#[derive(Clone)]
pub struct ControlMetrics {
    _private: (),
}

impl Default for ControlMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(ControlMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &ControlMetricsInner {
        GLOBAL_METRICS.get_or_init(ControlMetricsInner::new)
    }

    /// Count one control invocation under its outcome
    pub fn record_outcome(&self, app: &str, outcome: &ControlOutcome) {
        let inner = self.inner();
        inner
            .control_intervals
            .with_label_values(&[app, outcome.label()])
            .inc();
        if let ControlOutcome::Skipped { reason } = outcome {
            inner
                .skipped_intervals
                .with_label_values(&[app, reason.as_str()])
                .inc();
        }
    }

    pub fn inc_sysid_failures(&self, app: &str) {
        self.inner().sysid_failures.with_label_values(&[app]).inc();
    }

    pub fn observe_control_latency(&self, app: &str, duration_secs: f64) {
        self.inner()
            .control_latency_seconds
            .with_label_values(&[app])
            .observe(duration_secs);
    }

    pub fn set_share(&self, app: &str, entity: &str, category: ResourceCategory, share: f64) {
        self.inner()
            .share
            .with_label_values(&[app, entity, category.as_str()])
            .set(share);
    }

    pub fn set_tracking_error(&self, app: &str, metric: PerformanceMetric, error: f64) {
        self.inner()
            .tracking_error
            .with_label_values(&[app, metric.as_str()])
            .set(error);
    }

    /// Control invocations counted so far for `app` and `outcome`
    pub fn interval_count(&self, app: &str, outcome: &str) -> u64 {
        self.inner()
            .control_intervals
            .with_label_values(&[app, outcome])
            .get()
    }
}

/// Structured logger for controller events
///
/// Every record carries an `event` field and the application name.
#[derive(Clone)]
pub struct StructuredLogger {
    app: String,
}

impl StructuredLogger {
    pub fn new(app: impl Into<String>) -> Self {
        Self { app: app.into() }
    }

    pub fn app(&self) -> &str {
        &self.app
    }

    pub fn log_interval_skipped(&self, interval: u64, reason: &str) {
        info!(
            event = "interval_skipped",
            app = %self.app,
            interval = interval,
            reason = %reason,
            "Control interval skipped"
        );
    }

    pub fn log_control_failed(&self, interval: u64, reason: &str, fallback_decisions: usize) {
        warn!(
            event = "control_failed",
            app = %self.app,
            interval = interval,
            reason = %reason,
            fallback_decisions = fallback_decisions,
            "Control interval failed"
        );
    }

    pub fn log_share_applied(
        &self,
        interval: u64,
        entity: &str,
        category: ResourceCategory,
        old_share: f64,
        new_share: f64,
    ) {
        info!(
            event = "share_applied",
            app = %self.app,
            interval = interval,
            entity = %entity,
            category = %category,
            old_share = old_share,
            new_share = new_share,
            "Resource share updated"
        );
    }

    pub fn log_model_reset(&self, interval: u64, reason: &str) {
        warn!(
            event = "model_reset",
            app = %self.app,
            interval = interval,
            reason = %reason,
            "Identified model diverged and was reset"
        );
    }

    pub fn log_startup(&self, version: &str, controller: &str) {
        info!(
            event = "controller_started",
            app = %self.app,
            version = %version,
            controller = %controller,
            "Tier controller started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "controller_shutdown",
            app = %self.app,
            reason = %reason,
            "Tier controller shutting down"
        );
    }
}
