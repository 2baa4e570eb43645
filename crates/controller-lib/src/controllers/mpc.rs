//! Finite-horizon model-predictive control on an identified model
//!
//! The decision variables are the cumulative share changes after each of
//! the `control_horizon` moves, so the admissible delta range of the channel
//! becomes a plain box. Past the control horizon the share is held. The
//! objective over the prediction horizon is
//! `sum q * e(k+i)^2 + sum r * delta(k+j)^2`.

use super::optimizer::{Optimizer, OptimizerStatus};
use super::plant::{
    default_identification, excitation_step, observe_channels, IdentifiedChannel,
};
use super::{Controller, ControllerError, DeltaBounds, StageInput};
use crate::models::{EntityId, ResourceCategory};
use crate::realization::StateSpaceModel;
use crate::sysid::ArxConfig;
use nalgebra::DVector;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MpcConfig {
    #[serde(default = "default_identification")]
    pub identification: ArxConfig,
    #[serde(default = "default_category")]
    pub category: ResourceCategory,
    #[serde(default = "default_prediction_horizon")]
    pub prediction_horizon: usize,
    #[serde(default = "default_control_horizon")]
    pub control_horizon: usize,
    #[serde(default = "default_output_weight")]
    pub output_weight: f64,
    #[serde(default = "default_input_weight")]
    pub input_weight: f64,
    /// Optimizer budget per channel and interval
    #[serde(default = "default_time_limit_ms")]
    pub time_limit_ms: u64,
    #[serde(default = "super::lq::default_excitation")]
    pub excitation: f64,
}

fn default_category() -> ResourceCategory {
    ResourceCategory::Cpu
}

fn default_prediction_horizon() -> usize {
    20
}

fn default_control_horizon() -> usize {
    5
}

fn default_output_weight() -> f64 {
    1.0
}

fn default_input_weight() -> f64 {
    0.1
}

fn default_time_limit_ms() -> u64 {
    50
}

impl Default for MpcConfig {
    fn default() -> Self {
        Self {
            identification: default_identification(),
            category: default_category(),
            prediction_horizon: default_prediction_horizon(),
            control_horizon: default_control_horizon(),
            output_weight: default_output_weight(),
            input_weight: default_input_weight(),
            time_limit_ms: default_time_limit_ms(),
            excitation: super::lq::default_excitation(),
        }
    }
}

impl MpcConfig {
    fn validate(&self) -> Result<(), ControllerError> {
        if self.prediction_horizon == 0 || self.control_horizon == 0 {
            return Err(ControllerError::Configuration(
                "MPC horizons must be positive".to_string(),
            ));
        }
        if self.control_horizon > self.prediction_horizon {
            return Err(ControllerError::Configuration(format!(
                "control horizon {} exceeds prediction horizon {}",
                self.control_horizon, self.prediction_horizon
            )));
        }
        if !(self.output_weight > 0.0) || self.input_weight < 0.0 {
            return Err(ControllerError::Configuration(
                "MPC weights must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Predicted cost of the cumulative moves `z` from state `x0`
fn horizon_cost(model: &StateSpaceModel, x0: &DVector<f64>, z: &[f64], config: &MpcConfig) -> f64 {
    let mut x = x0.clone();
    let mut previous = 0.0;
    let mut cost = 0.0;
    for i in 0..config.prediction_horizon {
        let delta = match z.get(i) {
            Some(&zi) => {
                let d = zi - previous;
                previous = zi;
                d
            }
            None => 0.0,
        };
        cost += config.input_weight * delta * delta;
        let u = DVector::from_element(1, delta);
        x = &model.a * &x + &model.b * u;
        let y = (&model.c * &x)[0];
        cost += config.output_weight * y * y;
    }
    cost
}

/// MPC regulator driving the tracking error of one category to zero
pub struct LinearizedMpcController {
    config: MpcConfig,
    optimizer: Box<dyn Optimizer>,
    channels: BTreeMap<EntityId, IdentifiedChannel>,
}

impl std::fmt::Debug for LinearizedMpcController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinearizedMpcController")
            .field("config", &self.config)
            .field("channels", &self.channels.len())
            .finish()
    }
}

impl LinearizedMpcController {
    pub fn new(config: MpcConfig, optimizer: Box<dyn Optimizer>) -> Result<Self, ControllerError> {
        config.validate()?;
        IdentifiedChannel::new(&config.identification)?;
        Ok(Self {
            config,
            optimizer,
            channels: BTreeMap::new(),
        })
    }

    pub fn channel(&self, entity: &str) -> Option<&IdentifiedChannel> {
        self.channels.get(entity)
    }

    fn solve(
        &mut self,
        entity: &str,
        model: &StateSpaceModel,
        x0: &DVector<f64>,
        bounds: DeltaBounds,
    ) -> Result<f64, ControllerError> {
        let config = &self.config;
        let box_bounds = vec![(bounds.lower, bounds.upper); config.control_horizon];
        let objective = |z: &[f64]| horizon_cost(model, x0, z, config);
        let solution = self
            .optimizer
            .minimize(
                &objective,
                &box_bounds,
                Duration::from_millis(config.time_limit_ms),
            )
            .map_err(|e| ControllerError::Infeasible(e.to_string()))?;
        if solution.status != OptimizerStatus::Converged {
            warn!(entity = %entity, status = ?solution.status, "MPC optimizer stopped early");
            return Err(ControllerError::Infeasible(format!(
                "optimizer stopped with {:?}",
                solution.status
            )));
        }
        let delta = solution.x.first().copied().unwrap_or(0.0);
        debug!(entity = %entity, delta, cost = solution.value, "MPC proposal");
        Ok(delta)
    }
}

impl Controller for LinearizedMpcController {
    fn name(&self) -> &'static str {
        "mpc"
    }

    fn categories(&self) -> Vec<ResourceCategory> {
        vec![self.config.category]
    }

    fn propose(
        &mut self,
        input: &StageInput<'_>,
    ) -> Result<BTreeMap<EntityId, f64>, ControllerError> {
        if input.category != self.config.category {
            return Ok(BTreeMap::new());
        }
        let error = input.primary_error()?;

        observe_channels(
            &mut self.channels,
            &self.config.identification,
            error,
            input.channels(),
        )?;

        let mut proposals = BTreeMap::new();
        for (entity, measurement) in input.channels() {
            let state = match self.channels.get(entity) {
                Some(channel) => channel.state(),
                None => continue,
            };
            let (model, x0) = match state {
                Ok(state) => state,
                Err(ControllerError::ModelNotReady) if self.config.excitation > 0.0 => {
                    proposals.insert(entity.clone(), excitation_step(error, self.config.excitation));
                    continue;
                }
                Err(e) => return Err(e),
            };
            let bounds = input.bounds_for(entity).unwrap_or(DeltaBounds {
                lower: -measurement.old_share,
                upper: 1.0 - measurement.old_share,
            });
            let delta = self.solve(entity, &model, &x0, bounds)?;
            proposals.insert(entity.clone(), delta);
        }
        Ok(proposals)
    }

    fn reset(&mut self) {
        self.channels.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controllers::optimizer::{CompassSearchOptimizer, OptimizerError, OptimizerSolution};
    use crate::models::{PerformanceMetric, ResourceMeasurement};
    use crate::sysid::{ArxOrders, UpdateRule};
    use nalgebra::dmatrix;

    fn integrator() -> StateSpaceModel {
        StateSpaceModel {
            a: dmatrix![1.0],
            b: dmatrix![2.0],
            c: dmatrix![1.0],
            d: dmatrix![0.0],
        }
    }

    struct Stalled;

    impl Optimizer for Stalled {
        fn minimize(
            &mut self,
            _objective: &dyn Fn(&[f64]) -> f64,
            bounds: &[(f64, f64)],
            _time_limit: Duration,
        ) -> Result<OptimizerSolution, OptimizerError> {
            Ok(OptimizerSolution {
                x: vec![0.0; bounds.len()],
                value: 0.0,
                status: OptimizerStatus::TimeLimit,
            })
        }
    }

    #[test]
    fn test_config_validation() {
        let bad = MpcConfig {
            control_horizon: 30,
            ..MpcConfig::default()
        };
        assert!(matches!(
            LinearizedMpcController::new(bad, Box::new(CompassSearchOptimizer::default())),
            Err(ControllerError::Configuration(_))
        ));
        let parsed: MpcConfig = serde_json::from_str(r#"{"prediction_horizon": 10}"#).unwrap();
        assert_eq!(parsed.prediction_horizon, 10);
        assert_eq!(parsed.control_horizon, 5);
    }

    #[test]
    fn test_horizon_cost_holds_share_past_control_horizon() {
        let config = MpcConfig {
            prediction_horizon: 3,
            control_horizon: 1,
            output_weight: 1.0,
            input_weight: 0.0,
            ..MpcConfig::default()
        };
        let x0 = DVector::from_element(1, -0.4);
        // one move of 0.2 cancels the error for the whole horizon
        assert!(horizon_cost(&integrator(), &x0, &[0.2], &config) < 1e-12);
        let idle = horizon_cost(&integrator(), &x0, &[0.0], &config);
        assert!((idle - 3.0 * 0.16).abs() < 1e-12);
    }

    #[test]
    fn test_solve_respects_bounds() {
        let mut controller = LinearizedMpcController::new(
            MpcConfig::default(),
            Box::new(CompassSearchOptimizer::default()),
        )
        .unwrap();
        let x0 = DVector::from_element(1, -0.8);
        let bounds = DeltaBounds {
            lower: -0.1,
            upper: 0.1,
        };
        let delta = controller.solve("vm1", &integrator(), &x0, bounds).unwrap();
        assert!((delta - 0.1).abs() < 1e-6);

        let mut single_move = LinearizedMpcController::new(
            MpcConfig {
                control_horizon: 1,
                ..MpcConfig::default()
            },
            Box::new(CompassSearchOptimizer::default()),
        )
        .unwrap();
        let free = DeltaBounds {
            lower: -1.0,
            upper: 1.0,
        };
        let delta = single_move.solve("vm1", &integrator(), &x0, free).unwrap();
        assert!(delta > 0.3 && delta <= 0.4 + 1e-6, "delta was {}", delta);
    }

    #[test]
    fn test_unconverged_optimizer_is_infeasible() {
        let mut controller =
            LinearizedMpcController::new(MpcConfig::default(), Box::new(Stalled)).unwrap();
        let x0 = DVector::from_element(1, -0.5);
        let bounds = DeltaBounds {
            lower: -0.5,
            upper: 0.5,
        };
        assert!(matches!(
            controller.solve("vm1", &integrator(), &x0, bounds),
            Err(ControllerError::Infeasible(_))
        ));
    }

    #[test]
    fn test_regulates_identified_integrator() {
        let mut identification = ArxConfig::new(ArxOrders::siso(1, 1, 0).unwrap());
        identification.update = UpdateRule::ForgettingFactor { lambda: 1.0 };
        identification.initial_covariance = 1e6;
        let mut controller = LinearizedMpcController::new(
            MpcConfig {
                identification,
                control_horizon: 1,
                time_limit_ms: 1_000,
                ..MpcConfig::default()
            },
            Box::new(CompassSearchOptimizer::default()),
        )
        .unwrap();

        let bounds = BTreeMap::new();
        let decided = BTreeMap::new();
        let mut error: f64 = -0.5;
        let mut share = 0.3;
        let excitation = [0.04, -0.02, 0.03, 0.01, -0.03, 0.02, 0.05, -0.01, 0.02, -0.04];

        for k in 0..30 {
            let mut errors = BTreeMap::new();
            errors.insert(PerformanceMetric::ResponseTime, error);
            let mut measurements = BTreeMap::new();
            measurements.insert(
                ("vm1".to_string(), ResourceCategory::Cpu),
                ResourceMeasurement::new(share, 0.1),
            );
            let input = StageInput {
                category: ResourceCategory::Cpu,
                errors: &errors,
                previous_errors: None,
                measurements: &measurements,
                bounds: &bounds,
                decided: &decided,
            };
            let result = controller.propose(&input);
            let delta = if k < excitation.len() {
                excitation[k]
            } else {
                result.unwrap()["vm1"]
            };
            share += delta;
            error += 2.0 * delta;
        }
        assert!(error.abs() < 1e-2, "error stayed at {}", error);
        assert!(controller.channel("vm1").is_some());
    }
}
