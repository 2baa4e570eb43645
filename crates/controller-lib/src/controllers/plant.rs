//! Identified single-channel plant shared by the model-based controllers
//!
//! The plant output is the tracking error of the interval, the plant input
//! is the share change applied at the end of the interval. Each observation
//! identifies the previous interval's sample once the change that followed it
//! is known, so identification always lags control by one interval.

use super::ControllerError;
use crate::models::{EntityId, ResourceMeasurement};
use crate::realization::{observable_state, realize, Realization, StateSpaceModel};
use crate::sysid::{ArxConfig, ArxOrders, ArxStrategy, ResetHeuristics, SysIdError};
use nalgebra::DVector;
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, VecDeque};
use tracing::debug;

/// First-order identification with a covariance bound, the default for
/// model-based controllers
pub(crate) fn default_identification() -> ArxConfig {
    let mut config = ArxConfig::new(ArxOrders {
        na: 1,
        nb: 1,
        d: 0,
        ny: 1,
        nu: 1,
    });
    config.heuristics = ResetHeuristics::default().with_max_covariance(1e8);
    config
}

/// Step taken toward the target while the model is not usable yet
pub(crate) fn excitation_step(error: f64, amplitude: f64) -> f64 {
    if error < 0.0 {
        amplitude
    } else if error > 0.0 {
        -amplitude
    } else {
        0.0
    }
}

/// Feed the interval's error and each entity's share to its channel, creating
/// channels for new entities.
///
/// Every channel observes the interval even after another one failed; the
/// first failure is returned once all of them are fed.
pub(crate) fn observe_channels<'a>(
    channels: &mut BTreeMap<EntityId, IdentifiedChannel>,
    config: &ArxConfig,
    error: f64,
    measurements: impl Iterator<Item = (&'a EntityId, &'a ResourceMeasurement)>,
) -> Result<(), ControllerError> {
    let mut first_error = None;
    for (entity, measurement) in measurements {
        let channel = match channels.entry(entity.clone()) {
            Entry::Occupied(slot) => slot.into_mut(),
            Entry::Vacant(slot) => match IdentifiedChannel::new(config) {
                Ok(channel) => slot.insert(channel),
                Err(e) => {
                    first_error.get_or_insert(e);
                    continue;
                }
            },
        };
        if let Err(e) = channel.observe(error, measurement.old_share) {
            debug!(entity = %entity, error = %e, "Channel observation failed");
            first_error.get_or_insert(e);
        }
    }
    first_error.map_or(Ok(()), Err)
}

/// ARX-identified relation between a channel's share changes and the tracking error
#[derive(Debug)]
pub struct IdentifiedChannel {
    strategy: ArxStrategy,
    /// Past outputs, most recent first
    outputs: VecDeque<f64>,
    /// Past inputs, most recent first
    inputs: VecDeque<f64>,
    pending_output: Option<f64>,
    last_share: Option<f64>,
}

impl IdentifiedChannel {
    pub fn new(config: &ArxConfig) -> Result<Self, ControllerError> {
        if !config.orders.is_single_channel() {
            return Err(ControllerError::Configuration(
                "model-based controllers identify single-channel models".to_string(),
            ));
        }
        Ok(Self {
            strategy: config.build()?,
            outputs: VecDeque::new(),
            inputs: VecDeque::new(),
            pending_output: None,
            last_share: None,
        })
    }

    fn history_len(&self) -> usize {
        let o = self.strategy.orders();
        o.na.max(o.nb + o.d)
    }

    pub fn strategy(&self) -> &ArxStrategy {
        &self.strategy
    }

    /// Record the current error and the share in effect.
    ///
    /// Identifies the previous sample with the share change observed since.
    /// On identification divergence the local history is dropped as well.
    pub fn observe(&mut self, error: f64, share: f64) -> Result<(), ControllerError> {
        let previous = self.pending_output.take().zip(self.last_share);
        self.pending_output = Some(error);
        self.last_share = Some(share);

        let Some((y, previous_share)) = previous else {
            return Ok(());
        };
        let applied = share - previous_share;
        match self.strategy.estimate(&[y], &[applied]) {
            Ok(_) => {
                let cap = self.history_len();
                self.outputs.push_front(y);
                self.outputs.truncate(cap);
                self.inputs.push_front(applied);
                self.inputs.truncate(cap);
                Ok(())
            }
            Err(SysIdError::Divergence(reason)) => {
                debug!(reason = %reason, "Dropping channel history after divergence");
                self.outputs.clear();
                self.inputs.clear();
                Err(ControllerError::Identification(SysIdError::Divergence(reason)))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Observable realization and its current state, with the last state
    /// component set to the measured error
    pub fn state(&self) -> Result<(StateSpaceModel, DVector<f64>), ControllerError> {
        if !self.strategy.is_ready() {
            return Err(ControllerError::ModelNotReady);
        }
        let current = self.pending_output.ok_or(ControllerError::ModelNotReady)?;
        let snapshot = self.strategy.snapshot();
        let model = realize(&snapshot, Realization::Observable)?;
        let outputs: Vec<f64> = self.outputs.iter().copied().collect();
        let inputs: Vec<f64> = self.inputs.iter().copied().collect();
        let mut x = observable_state(&snapshot, &outputs, &inputs)?;
        let n = x.len();
        if n > 0 {
            x[n - 1] = current;
        }
        Ok((model, x))
    }

    pub fn reset(&mut self) {
        self.strategy.reset();
        self.outputs.clear();
        self.inputs.clear();
        self.pending_output = None;
        self.last_share = None;
    }
}
