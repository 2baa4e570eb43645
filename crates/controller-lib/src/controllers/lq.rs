//! Linear-quadratic state feedback on an identified model
//!
//! Each entity of the controlled category gets its own `IdentifiedChannel`.
//! Every interval the channel's observable realization is rebuilt, the
//! discrete algebraic Riccati equation is solved by fixed-point iteration
//! and the proposed delta is `-K x`.

use super::plant::{
    default_identification, excitation_step, observe_channels, IdentifiedChannel,
};
use super::{Controller, ControllerError, StageInput};
use crate::models::{EntityId, ResourceCategory};
use crate::realization::StateSpaceModel;
use crate::sysid::ArxConfig;
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LqConfig {
    #[serde(default = "default_identification")]
    pub identification: ArxConfig,
    #[serde(default = "default_category")]
    pub category: ResourceCategory,
    /// Weight of the squared tracking error
    #[serde(default = "default_output_weight")]
    pub output_weight: f64,
    /// Weight of the squared share delta
    #[serde(default = "default_input_weight")]
    pub input_weight: f64,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,
    /// Delta proposed toward the target while the model is not ready; 0 skips instead
    #[serde(default = "default_excitation")]
    pub excitation: f64,
}

fn default_category() -> ResourceCategory {
    ResourceCategory::Cpu
}

fn default_output_weight() -> f64 {
    1.0
}

fn default_input_weight() -> f64 {
    0.1
}

fn default_max_iterations() -> usize {
    1000
}

fn default_tolerance() -> f64 {
    1e-9
}

pub(crate) fn default_excitation() -> f64 {
    0.05
}

impl Default for LqConfig {
    fn default() -> Self {
        Self {
            identification: default_identification(),
            category: default_category(),
            output_weight: default_output_weight(),
            input_weight: default_input_weight(),
            max_iterations: default_max_iterations(),
            tolerance: default_tolerance(),
            excitation: default_excitation(),
        }
    }
}

/// Infinite-horizon LQ gain for `model` with output weight `q` and input weight `r`.
///
/// Iterates `P = Q + A'PA - A'PB (R + B'PB)^-1 B'PA` with `Q = C' q C` until
/// the largest entry change drops below `tolerance` relative to `P`.
pub fn dlqr(
    model: &StateSpaceModel,
    q: f64,
    r: f64,
    max_iterations: usize,
    tolerance: f64,
) -> Result<DMatrix<f64>, ControllerError> {
    let (a, b, c) = (&model.a, &model.b, &model.c);
    let q_state = c.transpose() * c * q;
    let r_input = DMatrix::<f64>::identity(b.ncols(), b.ncols()) * r;

    let gain = |p: &DMatrix<f64>| -> Result<DMatrix<f64>, ControllerError> {
        let s = &r_input + b.transpose() * p * b;
        let s_inv = s
            .try_inverse()
            .ok_or_else(|| ControllerError::Infeasible("singular Riccati gain".to_string()))?;
        Ok(s_inv * b.transpose() * p * a)
    };

    let mut p = q_state.clone();
    for _ in 0..max_iterations {
        let k = gain(&p)?;
        let next = &q_state + a.transpose() * &p * a - a.transpose() * &p * b * k;
        let next = (&next + next.transpose()) * 0.5;
        if next.iter().any(|v| !v.is_finite()) {
            return Err(ControllerError::Infeasible(
                "Riccati iteration diverged".to_string(),
            ));
        }
        let change = (&next - &p).amax();
        let scale = 1.0 + next.amax();
        p = next;
        if change <= tolerance * scale {
            return gain(&p);
        }
    }
    Err(ControllerError::Infeasible(format!(
        "Riccati iteration did not converge in {} steps",
        max_iterations
    )))
}

/// LQ regulator driving the tracking error of one category to zero
#[derive(Debug)]
pub struct LqStateFeedbackController {
    config: LqConfig,
    channels: BTreeMap<EntityId, IdentifiedChannel>,
}

impl LqStateFeedbackController {
    pub fn new(config: LqConfig) -> Result<Self, ControllerError> {
        if !(config.output_weight > 0.0) || !(config.input_weight > 0.0) {
            return Err(ControllerError::Configuration(
                "LQ weights must be positive".to_string(),
            ));
        }
        // surfaces invalid orders at construction
        IdentifiedChannel::new(&config.identification)?;
        Ok(Self {
            config,
            channels: BTreeMap::new(),
        })
    }

    pub fn channel(&self, entity: &str) -> Option<&IdentifiedChannel> {
        self.channels.get(entity)
    }
}

impl Controller for LqStateFeedbackController {
    fn name(&self) -> &'static str {
        "lq"
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
        for (entity, _) in input.channels() {
            let Some(channel) = self.channels.get(entity) else {
                continue;
            };
            let (model, x) = match channel.state() {
                Ok(state) => state,
                Err(ControllerError::ModelNotReady) if self.config.excitation > 0.0 => {
                    proposals.insert(entity.clone(), excitation_step(error, self.config.excitation));
                    continue;
                }
                Err(e) => return Err(e),
            };
            let k = dlqr(
                &model,
                self.config.output_weight,
                self.config.input_weight,
                self.config.max_iterations,
                self.config.tolerance,
            )?;
            let delta = -(k * x)[0];
            if !delta.is_finite() {
                return Err(ControllerError::Infeasible(format!(
                    "non-finite delta for {}",
                    entity
                )));
            }
            debug!(entity = %entity, delta, "LQ proposal");
            proposals.insert(entity.clone(), delta);
        }
        Ok(proposals)
    }

    fn reset(&mut self) {
        self.channels.clear();
    }
}
