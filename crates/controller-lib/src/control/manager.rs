//! Per-application control manager

use super::state::ControlState;
use super::{ChannelMeasurement, IntervalReport, ManagerConfig, Phase};
use crate::actuator::ShareActuator;
use crate::controllers::{Controller, ControllerError, DeltaBounds, StageInput};
use crate::error::ControlError;
use crate::estimation::{Estimator, Smoother};
use crate::interval_log::IntervalLog;
use crate::models::{
    ActuationDecision, Channel, ControlOutcome, EntityId, PerformanceMetric, ResourceCategory,
    ResourceMeasurement, SkipReason,
};
use crate::observability::{ControlMetrics, StructuredLogger};
use crate::sensors::Sensor;
use anyhow::{bail, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Why an interval stopped before actuation
enum Interrupt {
    Skip(SkipReason),
    Fail(ControlError),
}

impl From<ControlError> for Interrupt {
    fn from(e: ControlError) -> Self {
        match e.skip_reason() {
            Some(reason) => Interrupt::Skip(reason),
            None => Interrupt::Fail(e),
        }
    }
}

impl From<ControllerError> for Interrupt {
    fn from(e: ControllerError) -> Self {
        match e {
            ControllerError::ModelNotReady => Interrupt::Skip(SkipReason::ModelNotReady),
            ControllerError::Identification(e) => ControlError::ModelDivergence(e.to_string()).into(),
            other => Interrupt::Fail(ControlError::ControllerInfeasible(other.to_string())),
        }
    }
}

/// Inputs gathered at the start of an interval
#[derive(Debug, Default)]
struct Gathered {
    measured: BTreeMap<PerformanceMetric, f64>,
    errors: BTreeMap<PerformanceMetric, f64>,
    measurements: BTreeMap<Channel, ResourceMeasurement>,
    /// First input found missing, if any
    missing: Option<String>,
}

fn round_to_grid(value: f64, step: f64) -> f64 {
    if step > 0.0 {
        (value / step).round() * step
    } else {
        value
    }
}

/// Smallest grid point at or above `value`, up to float noise
fn ceil_to_grid(value: f64, step: f64) -> f64 {
    if step > 0.0 {
        (value / step - 1e-9).ceil() * step
    } else {
        value
    }
}

/// Actuation-safety stage for one channel.
///
/// Clamps the proposed delta to `bounds` and rounds the resulting share to the
/// tolerance grid. A share rounded below the utilization floor `old + lower`
/// is lifted to the next grid point above it. The share is then clamped to
/// `[share_min, share_max]` and marked applied only when it moves by more than
/// the tolerance.
pub fn actuation_decision(
    entity: &str,
    category: ResourceCategory,
    measurement: &ResourceMeasurement,
    proposed_delta: f64,
    bounds: DeltaBounds,
    config: &ManagerConfig,
) -> ActuationDecision {
    let old_share = measurement.old_share;
    let tolerance = config.share_tolerance;
    let clamped_delta = bounds.clamp(proposed_delta);
    let floor = old_share + bounds.lower;
    let mut new_share = round_to_grid(old_share + clamped_delta, tolerance);
    if new_share < floor {
        new_share = ceil_to_grid(floor, tolerance);
    }
    let new_share = new_share.clamp(config.share_min, config.share_max);
    let applied = new_share.is_finite()
        && clamped_delta.abs() > tolerance
        && (new_share - old_share).abs() > tolerance;
    ActuationDecision {
        entity: entity.to_string(),
        category,
        old_share,
        proposed_delta,
        clamped_delta,
        new_share,
        applied,
    }
}

/// Drives the control loop of one application
pub struct ControlManager {
    name: String,
    config: ManagerConfig,
    targets: BTreeMap<PerformanceMetric, f64>,
    output_sensors: BTreeMap<PerformanceMetric, Box<dyn Sensor>>,
    utilization_sensors: BTreeMap<Channel, Box<dyn Sensor>>,
    estimators: BTreeMap<PerformanceMetric, Box<dyn Estimator>>,
    smoothers: BTreeMap<Channel, Box<dyn Smoother>>,
    actuator: Arc<dyn ShareActuator>,
    controller: Box<dyn Controller>,
    state: ControlState,
    phase: Phase,
    previous_errors: Option<BTreeMap<PerformanceMetric, f64>>,
    consecutive_infeasible: u32,
    log: Option<IntervalLog>,
    metrics: ControlMetrics,
    logger: StructuredLogger,
}

impl ControlManager {
    pub fn builder(name: impl Into<String>) -> ControlManagerBuilder {
        ControlManagerBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn state(&self) -> ControlState {
        self.state
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn controller_name(&self) -> &'static str {
        self.controller.name()
    }

    pub fn targets(&self) -> &BTreeMap<PerformanceMetric, f64> {
        &self.targets
    }

    /// Start a fresh run: new estimators and smoothers, zeroed counters, no history
    pub fn reset(&mut self) {
        self.estimators = self
            .targets
            .keys()
            .map(|metric| (*metric, self.config.estimator.build()))
            .collect();
        self.smoothers = self
            .utilization_sensors
            .keys()
            .map(|channel| (channel.clone(), self.config.smoother.build()))
            .collect();
        for sensor in self.output_sensors.values_mut() {
            sensor.reset();
        }
        for sensor in self.utilization_sensors.values_mut() {
            sensor.reset();
        }
        self.state = ControlState::new(self.config.warmup_threshold);
        self.previous_errors = None;
        self.consecutive_infeasible = 0;
        self.controller.reset();

        self.log = match &self.config.interval_log {
            Some(path) => {
                let channels: Vec<Channel> = self.utilization_sensors.keys().cloned().collect();
                let metrics: Vec<PerformanceMetric> = self.targets.keys().copied().collect();
                match IntervalLog::create(path, channels, metrics) {
                    Ok(log) => Some(log),
                    Err(e) => {
                        warn!(app = %self.name, error = %e, "Interval log disabled");
                        None
                    }
                }
            }
            None => None,
        };

        self.phase = Phase::Reset;
        info!(
            app = %self.name,
            controller = self.controller.name(),
            warmup = self.config.warmup_threshold,
            "Control manager reset"
        );
    }

    /// Drain every sensor into its estimator or smoother.
    ///
    /// Returns the number of observations consumed; non-finite values are dropped.
    pub fn sample(&mut self) -> usize {
        let mut consumed = 0;

        for (metric, sensor) in self.output_sensors.iter_mut() {
            sensor.sense();
            if !sensor.has_observations() {
                continue;
            }
            let values: Vec<f64> = sensor
                .observations()
                .into_iter()
                .map(|o| o.value)
                .filter(|v| v.is_finite())
                .collect();
            if values.is_empty() {
                continue;
            }
            consumed += values.len();
            if let Some(estimator) = self.estimators.get_mut(metric) {
                estimator.collect_all(&values);
            }
        }

        for (channel, sensor) in self.utilization_sensors.iter_mut() {
            sensor.sense();
            if !sensor.has_observations() {
                continue;
            }
            let Some(smoother) = self.smoothers.get_mut(channel) else {
                continue;
            };
            for observation in sensor.observations() {
                if observation.value.is_finite() {
                    smoother.smooth(observation.value);
                    consumed += 1;
                }
            }
        }

        self.phase = Phase::Sampling;
        if consumed > 0 {
            debug!(app = %self.name, observations = consumed, "Sampled sensors");
        }
        consumed
    }

    fn gather(&self) -> Gathered {
        let mut gathered = Gathered::default();

        for (metric, target) in &self.targets {
            let estimate = self.estimators.get(metric).and_then(|e| e.estimate());
            match estimate {
                Some(measured) => {
                    gathered.measured.insert(*metric, measured);
                    match metric.tracking_error(*target, measured) {
                        Some(err) => {
                            gathered.errors.insert(*metric, err);
                        }
                        None => {
                            gathered
                                .missing
                                .get_or_insert_with(|| format!("no tracking error for {}", metric));
                        }
                    }
                }
                None => {
                    gathered
                        .missing
                        .get_or_insert_with(|| format!("no {} observations", metric));
                }
            }
        }

        for (entity, category) in self.utilization_sensors.keys() {
            let key = (entity.clone(), *category);
            let utilization = self.smoothers.get(&key).and_then(|s| s.forecast(0));
            let share = self.actuator.share(entity, *category);
            match (utilization, share) {
                (Some(u), Ok(share)) if u.is_finite() && share.is_finite() => {
                    gathered
                        .measurements
                        .insert(key, ResourceMeasurement::new(share, u));
                }
                (None, _) => {
                    gathered
                        .missing
                        .get_or_insert_with(|| format!("no {} utilization for {}", category, entity));
                }
                (_, Err(e)) => {
                    gathered.missing.get_or_insert_with(|| e.to_string());
                }
                _ => {
                    gathered.missing.get_or_insert_with(|| {
                        format!("non-finite {} share or utilization for {}", category, entity)
                    });
                }
            }
        }

        gathered
    }

    /// Controller stages and the safety stage, in the controller's category order
    fn decide(&mut self, gathered: &Gathered) -> Result<Vec<ActuationDecision>, Interrupt> {
        if self.state.in_warmup() {
            return Err(ControlError::WarmupPending.into());
        }
        if let Some(what) = &gathered.missing {
            return Err(ControlError::DataUnavailable(what.clone()).into());
        }

        let slack = self.config.utilization_slack;
        let bounds: BTreeMap<Channel, DeltaBounds> = gathered
            .measurements
            .iter()
            .map(|(channel, m)| (channel.clone(), DeltaBounds::for_measurement(m, slack)))
            .collect();

        let mut decided: BTreeMap<Channel, f64> = BTreeMap::new();
        let mut decisions = Vec::new();
        for category in self.controller.categories() {
            let input = StageInput {
                category,
                errors: &gathered.errors,
                previous_errors: self.previous_errors.as_ref(),
                measurements: &gathered.measurements,
                bounds: &bounds,
                decided: &decided,
            };
            let proposals: BTreeMap<EntityId, f64> = self.controller.propose(&input)?;

            for ((entity, channel_category), measurement) in &gathered.measurements {
                if *channel_category != category {
                    continue;
                }
                let proposed = proposals.get(entity).copied().unwrap_or(0.0);
                if !proposed.is_finite() {
                    return Err(Interrupt::Fail(ControlError::ControllerInfeasible(format!(
                        "non-finite delta for {}/{}",
                        entity, category
                    ))));
                }
                let key = (entity.clone(), category);
                let channel_bounds = bounds
                    .get(&key)
                    .copied()
                    .unwrap_or_else(|| DeltaBounds::for_measurement(measurement, slack));
                let decision = actuation_decision(
                    entity,
                    category,
                    measurement,
                    proposed,
                    channel_bounds,
                    &self.config,
                );
                decided.insert(key, decision.effective_share());
                decisions.push(decision);
            }
        }
        Ok(decisions)
    }

    /// Write every applied decision, restoring the old shares if any write fails
    fn apply(&mut self, decisions: &[ActuationDecision]) -> Result<(), ControlError> {
        self.phase = Phase::Applying;
        let mut written: Vec<&ActuationDecision> = Vec::new();
        for decision in decisions.iter().filter(|d| d.applied) {
            if let Err(e) =
                self.actuator
                    .set_share(&decision.entity, decision.category, decision.new_share)
            {
                for done in written.iter().rev() {
                    if let Err(rollback) =
                        self.actuator.set_share(&done.entity, done.category, done.old_share)
                    {
                        warn!(
                            app = %self.name,
                            entity = %done.entity,
                            category = %done.category,
                            error = %rollback,
                            "Failed to roll back share"
                        );
                    }
                }
                return Err(ControlError::ActuationRejected(e.to_string()));
            }
            written.push(decision);
        }
        Ok(())
    }

    fn fallback_decisions(&self, gathered: &Gathered) -> Vec<ActuationDecision> {
        let slack = self.config.utilization_slack;
        gathered
            .measurements
            .iter()
            .map(|((entity, category), m)| {
                let target = (m.utilization * slack).min(1.0);
                actuation_decision(
                    entity,
                    *category,
                    m,
                    target - m.old_share,
                    DeltaBounds::for_measurement(m, slack),
                    &self.config,
                )
            })
            .collect()
    }

    fn fail(&mut self, error: ControlError, gathered: &Gathered) -> ControlOutcome {
        let infeasible = matches!(error, ControlError::ControllerInfeasible(_));
        if infeasible {
            self.consecutive_infeasible += 1;
        } else {
            self.consecutive_infeasible = 0;
        }

        let mut fallback = Vec::new();
        let threshold_reached = self
            .config
            .fallback_after_failures
            .map(|n| infeasible && self.consecutive_infeasible >= n)
            .unwrap_or(false);
        if threshold_reached && gathered.missing.is_none() {
            fallback = self.fallback_decisions(gathered);
            if let Err(e) = self.apply(&fallback) {
                warn!(app = %self.name, error = %e, "Fallback actuation failed");
                fallback.clear();
            }
        }

        ControlOutcome::Failed {
            reason: error.to_string(),
            fallback,
        }
    }

    /// Run one control interval
    pub fn control(&mut self) -> IntervalReport {
        let started = Instant::now();
        self.phase = Phase::Controlling;
        let interval = self.state.begin_interval();

        let gathered = self.gather();
        if self.config.reset_estimators_each_interval {
            for estimator in self.estimators.values_mut() {
                estimator.reset();
            }
        }

        let outcome = match self.decide(&gathered) {
            Ok(decisions) => match self.apply(&decisions) {
                Ok(()) => {
                    self.consecutive_infeasible = 0;
                    ControlOutcome::Applied { decisions }
                }
                Err(e) => self.fail(e, &gathered),
            },
            Err(Interrupt::Skip(reason)) => ControlOutcome::Skipped { reason },
            Err(Interrupt::Fail(e)) => self.fail(e, &gathered),
        };

        self.state.record(&outcome);
        self.phase = match &outcome {
            ControlOutcome::Skipped { .. } => Phase::Skipped,
            ControlOutcome::Failed { .. } => Phase::Failed,
            ControlOutcome::Applied { .. } => Phase::Applied,
        };
        if !outcome.is_skipped() {
            self.previous_errors = Some(gathered.errors.clone());
        }
        self.publish(interval, &outcome, &gathered);

        let elapsed = started.elapsed();
        self.metrics
            .observe_control_latency(&self.name, elapsed.as_secs_f64());

        let report = IntervalReport {
            app: self.name.clone(),
            interval,
            timestamp: chrono::Utc::now().timestamp(),
            outcome,
            state: self.state,
            measured: gathered.measured,
            errors: gathered.errors,
            measurements: gathered
                .measurements
                .into_iter()
                .map(|((entity, category), measurement)| ChannelMeasurement {
                    entity,
                    category,
                    measurement,
                })
                .collect(),
            elapsed_micros: elapsed.as_micros() as u64,
        };

        if let Some(log) = self.log.as_mut() {
            log.record(&report, &self.targets);
            if !log.is_enabled() {
                self.log = None;
            }
        }
        report
    }

    fn publish(&self, interval: u64, outcome: &ControlOutcome, gathered: &Gathered) {
        self.metrics.record_outcome(&self.name, outcome);
        for (metric, error) in &gathered.errors {
            self.metrics.set_tracking_error(&self.name, *metric, *error);
        }

        match outcome {
            ControlOutcome::Skipped { reason } => {
                if let SkipReason::ModelDivergence(detail) = reason {
                    self.metrics.inc_sysid_failures(&self.name);
                    self.logger.log_model_reset(interval, detail);
                }
                self.logger.log_interval_skipped(interval, reason.as_str());
            }
            ControlOutcome::Failed { reason, fallback } => {
                self.logger
                    .log_control_failed(interval, reason, fallback.iter().filter(|d| d.applied).count());
            }
            ControlOutcome::Applied { .. } => {}
        }

        for decision in outcome.decisions().iter().filter(|d| d.applied) {
            self.metrics.set_share(
                &self.name,
                &decision.entity,
                decision.category,
                decision.new_share,
            );
            self.logger.log_share_applied(
                interval,
                &decision.entity,
                decision.category,
                decision.old_share,
                decision.new_share,
            );
        }
    }
}

/// Builder for a `ControlManager`
pub struct ControlManagerBuilder {
    name: String,
    config: ManagerConfig,
    targets: BTreeMap<PerformanceMetric, f64>,
    output_sensors: BTreeMap<PerformanceMetric, Box<dyn Sensor>>,
    utilization_sensors: BTreeMap<Channel, Box<dyn Sensor>>,
    actuator: Option<Arc<dyn ShareActuator>>,
    controller: Option<Box<dyn Controller>>,
}

impl ControlManagerBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: ManagerConfig::default(),
            targets: BTreeMap::new(),
            output_sensors: BTreeMap::new(),
            utilization_sensors: BTreeMap::new(),
            actuator: None,
            controller: None,
        }
    }

    pub fn config(mut self, config: ManagerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the target value of a performance metric
    pub fn target(mut self, metric: PerformanceMetric, value: f64) -> Self {
        self.targets.insert(metric, value);
        self
    }

    /// Sensor measuring a performance metric
    pub fn output_sensor(mut self, metric: PerformanceMetric, sensor: Box<dyn Sensor>) -> Self {
        self.output_sensors.insert(metric, sensor);
        self
    }

    /// Sensor measuring the utilization of one channel
    pub fn utilization_sensor(
        mut self,
        entity: impl Into<EntityId>,
        category: ResourceCategory,
        sensor: Box<dyn Sensor>,
    ) -> Self {
        self.utilization_sensors
            .insert((entity.into(), category), sensor);
        self
    }

    pub fn actuator(mut self, actuator: Arc<dyn ShareActuator>) -> Self {
        self.actuator = Some(actuator);
        self
    }

    pub fn controller(mut self, controller: Box<dyn Controller>) -> Self {
        self.controller = Some(controller);
        self
    }

    /// Build the manager, already reset
    pub fn build(self) -> Result<ControlManager> {
        let actuator = self
            .actuator
            .ok_or_else(|| anyhow::anyhow!("Actuator is required"))?;
        let controller = self
            .controller
            .ok_or_else(|| anyhow::anyhow!("Controller is required"))?;
        self.config.validate()?;
        if self.targets.is_empty() {
            bail!("At least one performance target is required");
        }
        for (metric, target) in &self.targets {
            if !target.is_finite() || *target <= 0.0 {
                bail!("Target for {} must be a positive number, got {}", metric, target);
            }
            if !self.output_sensors.contains_key(metric) {
                bail!("No sensor configured for target metric {}", metric);
            }
        }

        let mut manager = ControlManager {
            logger: StructuredLogger::new(self.name.clone()),
            name: self.name,
            config: self.config,
            targets: self.targets,
            output_sensors: self.output_sensors,
            utilization_sensors: self.utilization_sensors,
            estimators: BTreeMap::new(),
            smoothers: BTreeMap::new(),
            actuator,
            controller,
            state: ControlState::default(),
            phase: Phase::Reset,
            previous_errors: None,
            consecutive_infeasible: 0,
            log: None,
            metrics: ControlMetrics::new(),
        };
        manager.reset();
        Ok(manager)
    }
}
