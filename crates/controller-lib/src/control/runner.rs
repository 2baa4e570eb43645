//! Timer-driven control loop
//!
//! Samples the sensors every sampling period and runs a control interval
//! every control period, until a shutdown signal arrives. Reports go out on
//! a bounded channel; a full channel drops the report rather than stalling
//! the loop.

use super::{ControlManager, IntervalReport, ManagerConfig};
use crate::health::HealthRegistry;
use crate::observability::StructuredLogger;
use anyhow::{ensure, Result};
use rand::Rng;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Timing of a control loop
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub sampling_interval: Duration,
    pub control_interval: Duration,
    /// Upper bound of the random delay before the first control interval
    pub jitter: Duration,
    /// Capacity of the report channel
    pub buffer_size: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            sampling_interval: Duration::from_secs(1),
            control_interval: Duration::from_secs(5),
            jitter: Duration::ZERO,
            buffer_size: 100,
        }
    }
}

impl RunnerConfig {
    pub fn from_manager(config: &ManagerConfig) -> Self {
        Self {
            sampling_interval: Duration::from_secs(config.sampling_secs),
            control_interval: Duration::from_secs(config.control_secs),
            ..Self::default()
        }
    }
}

/// Runs one manager on tokio timers
pub struct ControlLoopRunner {
    manager: ControlManager,
    config: RunnerConfig,
    reports_tx: mpsc::Sender<IntervalReport>,
    health: Option<HealthRegistry>,
}

impl ControlLoopRunner {
    pub fn new(
        manager: ControlManager,
        config: RunnerConfig,
    ) -> (Self, mpsc::Receiver<IntervalReport>) {
        let (reports_tx, reports_rx) = mpsc::channel(config.buffer_size.max(1));
        let runner = Self {
            manager,
            config,
            reports_tx,
            health: None,
        };
        (runner, reports_rx)
    }

    /// Update `health` after every interval
    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    /// Run until `shutdown` fires, then hand the manager back
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) -> ControlManager {
        let logger = StructuredLogger::new(self.manager.name());
        logger.log_startup(env!("CARGO_PKG_VERSION"), self.manager.controller_name());
        info!(
            app = %self.manager.name(),
            sampling_ms = self.config.sampling_interval.as_millis() as u64,
            control_ms = self.config.control_interval.as_millis() as u64,
            "Starting control loop"
        );

        let mut sampler = interval(self.config.sampling_interval);
        sampler.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let first_control =
            Instant::now() + self.config.control_interval + rand_jitter(self.config.jitter);
        let mut controller = interval_at(first_control, self.config.control_interval);
        controller.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = sampler.tick() => {
                    self.manager.sample();
                }
                _ = controller.tick() => {
                    self.manager.sample();
                    let report = self.manager.control();
                    debug!(
                        app = %report.app,
                        interval = report.interval,
                        outcome = report.outcome.label(),
                        elapsed_us = report.elapsed_micros,
                        "Control interval complete"
                    );
                    if let Some(health) = &self.health {
                        health.record_outcome(&report.app, report.interval, &report.outcome).await;
                    }
                    match self.reports_tx.try_send(report) {
                        Ok(()) => {}
                        Err(mpsc::error::TrySendError::Full(report)) => {
                            warn!(app = %report.app, interval = report.interval, "Report channel full, dropping report");
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => {}
                    }
                }
                _ = shutdown.recv() => {
                    logger.log_shutdown("shutdown signal");
                    break;
                }
            }
        }

        self.manager
    }
}

/// Random delay in `[0, max]`, spreading the first interval of many loops
fn rand_jitter(max: Duration) -> Duration {
    let max_ms = max.as_millis() as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
}

/// Builder for a `ControlLoopRunner`
pub struct ControlLoopRunnerBuilder {
    manager: Option<ControlManager>,
    config: Option<RunnerConfig>,
    jitter: Option<Duration>,
    buffer_size: Option<usize>,
    sampling_interval: Option<Duration>,
    control_interval: Option<Duration>,
    health: Option<HealthRegistry>,
}

impl ControlLoopRunnerBuilder {
    pub fn new() -> Self {
        Self {
            manager: None,
            config: None,
            jitter: None,
            buffer_size: None,
            sampling_interval: None,
            control_interval: None,
            health: None,
        }
    }

    /// Set the manager; its configuration provides the default periods
    pub fn manager(mut self, manager: ControlManager) -> Self {
        self.manager = Some(manager);
        self
    }

    pub fn config(mut self, config: RunnerConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn sampling_interval(mut self, interval: Duration) -> Self {
        self.sampling_interval = Some(interval);
        self
    }

    pub fn control_interval(mut self, interval: Duration) -> Self {
        self.control_interval = Some(interval);
        self
    }

    pub fn jitter(mut self, jitter: Duration) -> Self {
        self.jitter = Some(jitter);
        self
    }

    pub fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = Some(size);
        self
    }

    pub fn health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    pub fn build(self) -> Result<(ControlLoopRunner, mpsc::Receiver<IntervalReport>)> {
        let manager = self
            .manager
            .ok_or_else(|| anyhow::anyhow!("Manager is required"))?;
        let mut config = self
            .config
            .unwrap_or_else(|| RunnerConfig::from_manager(manager.config()));
        if let Some(interval) = self.sampling_interval {
            config.sampling_interval = interval;
        }
        if let Some(interval) = self.control_interval {
            config.control_interval = interval;
        }
        if let Some(jitter) = self.jitter {
            config.jitter = jitter;
        }
        if let Some(size) = self.buffer_size {
            config.buffer_size = size;
        }
        ensure!(
            !config.sampling_interval.is_zero() && !config.control_interval.is_zero(),
            "Sampling and control intervals must be positive"
        );

        let (runner, rx) = ControlLoopRunner::new(manager, config);
        Ok(match self.health {
            Some(health) => (runner.with_health(health), rx),
            None => (runner, rx),
        })
    }
}

impl Default for ControlLoopRunnerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
