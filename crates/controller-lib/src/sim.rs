//! Simulated multi-tier application
//!
//! Each tier runs on its own entity with a CPU and a memory demand. The
//! response time of the application is the sum over tiers of an M/M/1-like
//! delay on the CPU share, inflated when the memory share falls below the
//! memory demand. Observations are pushed into `BufferedSensor`s and shares
//! are read back from an `InMemoryActuator`, so a `ControlManager` can be
//! wired to the simulation exactly as to a real deployment.

use crate::actuator::{InMemoryActuator, ShareActuator};
use crate::control::ControlManagerBuilder;
use crate::models::{EntityId, Observation, PerformanceMetric, ResourceCategory};
use crate::sensors::{BufferedSensor, SensorFeed};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Highest CPU utilization the queueing model admits
const MAX_LOAD: f64 = 0.95;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierDemand {
    pub entity: EntityId,
    /// CPU demand as a fraction of a full share
    pub cpu_demand: f64,
    pub memory_demand: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    pub tiers: Vec<TierDemand>,
    /// Per-tier service time at zero load, in seconds
    #[serde(default = "default_base_response_time")]
    pub base_response_time: f64,
    /// Relative amplitude of the uniform measurement noise
    #[serde(default = "default_noise")]
    pub noise: f64,
    #[serde(default = "default_observations_per_step")]
    pub observations_per_step: usize,
    #[serde(default = "default_initial_share")]
    pub initial_share: f64,
    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_base_response_time() -> f64 {
    0.1
}

fn default_noise() -> f64 {
    0.05
}

fn default_observations_per_step() -> usize {
    10
}

fn default_initial_share() -> f64 {
    0.5
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            tiers: vec![
                TierDemand {
                    entity: "web".to_string(),
                    cpu_demand: 0.3,
                    memory_demand: 0.2,
                },
                TierDemand {
                    entity: "db".to_string(),
                    cpu_demand: 0.25,
                    memory_demand: 0.3,
                },
            ],
            base_response_time: default_base_response_time(),
            noise: default_noise(),
            observations_per_step: default_observations_per_step(),
            initial_share: default_initial_share(),
            seed: None,
        }
    }
}

/// Sensors produced by a simulation, ready to hand to a manager
pub struct SimulatedSensors {
    pub response_time: BufferedSensor,
    pub utilization: Vec<(EntityId, ResourceCategory, BufferedSensor)>,
}

impl SimulatedSensors {
    /// Register these sensors on a manager builder
    pub fn attach(self, mut builder: ControlManagerBuilder) -> ControlManagerBuilder {
        builder = builder.output_sensor(PerformanceMetric::ResponseTime, Box::new(self.response_time));
        for (entity, category, sensor) in self.utilization {
            builder = builder.utilization_sensor(entity, category, Box::new(sensor));
        }
        builder
    }
}

struct Tier {
    demand: TierDemand,
    cpu_feed: SensorFeed,
    memory_feed: SensorFeed,
}

pub struct SimulatedApplication {
    config: SimulationConfig,
    actuator: Arc<InMemoryActuator>,
    tiers: Vec<Tier>,
    response_feed: SensorFeed,
    rng: StdRng,
}

impl SimulatedApplication {
    /// Register every tier's channels on `actuator` at the initial share
    pub fn new(
        config: SimulationConfig,
        actuator: Arc<InMemoryActuator>,
    ) -> (Self, SimulatedSensors) {
        let response_time = BufferedSensor::new();
        let mut utilization = Vec::new();
        let mut tiers = Vec::new();
        for demand in &config.tiers {
            let cpu = BufferedSensor::new();
            let memory = BufferedSensor::new();
            actuator.register(demand.entity.clone(), ResourceCategory::Cpu, config.initial_share);
            actuator.register(demand.entity.clone(), ResourceCategory::Memory, config.initial_share);
            tiers.push(Tier {
                demand: demand.clone(),
                cpu_feed: cpu.feed(),
                memory_feed: memory.feed(),
            });
            utilization.push((demand.entity.clone(), ResourceCategory::Cpu, cpu));
            utilization.push((demand.entity.clone(), ResourceCategory::Memory, memory));
        }
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let sim = Self {
            response_feed: response_time.feed(),
            config,
            actuator,
            tiers,
            rng,
        };
        (
            sim,
            SimulatedSensors {
                response_time,
                utilization,
            },
        )
    }

    pub fn actuator(&self) -> Arc<InMemoryActuator> {
        self.actuator.clone()
    }

    fn share(&self, entity: &str, category: ResourceCategory) -> f64 {
        self.actuator.share(entity, category).unwrap_or(0.0)
    }

    /// Change the CPU demand of a tier, e.g. to model a workload surge
    pub fn set_cpu_demand(&mut self, entity: &str, demand: f64) {
        if let Some(tier) = self.tiers.iter_mut().find(|t| t.demand.entity == entity) {
            tier.demand.cpu_demand = demand.max(0.0);
        }
    }

    /// Noise-free response time under the current shares
    pub fn response_time(&self) -> f64 {
        self.tiers
            .iter()
            .map(|tier| {
                let cpu_share = self.share(&tier.demand.entity, ResourceCategory::Cpu);
                let memory_share = self.share(&tier.demand.entity, ResourceCategory::Memory);
                let load = if cpu_share > 0.0 {
                    (tier.demand.cpu_demand / cpu_share).min(MAX_LOAD)
                } else {
                    MAX_LOAD
                };
                let memory_penalty = if tier.demand.memory_demand > 0.0 {
                    1.0 + 2.0 * (tier.demand.memory_demand - memory_share).max(0.0)
                        / tier.demand.memory_demand
                } else {
                    1.0
                };
                self.config.base_response_time / (1.0 - load) * memory_penalty
            })
            .sum()
    }

    fn noisy(&mut self, value: f64) -> f64 {
        let noise = self.config.noise.abs();
        value * (1.0 + self.rng.gen_range(-noise..=noise))
    }

    /// Produce one sampling period worth of observations
    pub fn step(&mut self) {
        let response_time = self.response_time();
        for _ in 0..self.config.observations_per_step {
            let value = self.noisy(response_time);
            self.response_feed
                .push(Observation::labelled(value, "response_time"));
        }

        for i in 0..self.tiers.len() {
            let entity = self.tiers[i].demand.entity.clone();
            let cpu_used = self.tiers[i]
                .demand
                .cpu_demand
                .min(self.share(&entity, ResourceCategory::Cpu));
            let memory_used = self.tiers[i]
                .demand
                .memory_demand
                .min(self.share(&entity, ResourceCategory::Memory));
            let cpu = self.noisy(cpu_used).clamp(0.0, 1.0);
            let memory = self.noisy(memory_used).clamp(0.0, 1.0);
            self.tiers[i].cpu_feed.push(Observation::labelled(cpu, entity.clone()));
            self.tiers[i].memory_feed.push(Observation::labelled(memory, entity));
        }
    }
}
