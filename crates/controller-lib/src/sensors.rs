//! Sensor abstraction and a channel-fed buffered sensor
//!
//! Sensors are polled by the control loop on every sampling tick: `sense()`
//! refreshes the sensor, `observations()` drains whatever was gathered since
//! the last poll in arrival order.

use crate::models::Observation;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Source of timestamped observations
pub trait Sensor: Send {
    /// Acquire new data, if the sensor needs an explicit trigger
    fn sense(&mut self);

    fn has_observations(&self) -> bool;

    /// Drain the observations gathered so far, oldest first
    fn observations(&mut self) -> Vec<Observation>;

    /// Drop anything buffered
    fn reset(&mut self) {
        self.observations();
    }
}

/// Sensor backed by a shared queue that producers push into
#[derive(Debug, Clone, Default)]
pub struct BufferedSensor {
    queue: Arc<Mutex<VecDeque<Observation>>>,
}

/// Producer handle of a `BufferedSensor`
#[derive(Debug, Clone)]
pub struct SensorFeed {
    queue: Arc<Mutex<VecDeque<Observation>>>,
}

impl BufferedSensor {
    pub fn new() -> Self {
        Self::default()
    }

    /// A handle producers use to publish observations
    pub fn feed(&self) -> SensorFeed {
        SensorFeed {
            queue: self.queue.clone(),
        }
    }
}

impl SensorFeed {
    pub fn push(&self, observation: Observation) {
        if let Ok(mut queue) = self.queue.lock() {
            queue.push_back(observation);
        }
    }

    pub fn push_value(&self, value: f64) {
        self.push(Observation::new(value));
    }
}

impl Sensor for BufferedSensor {
    fn sense(&mut self) {}

    fn has_observations(&self) -> bool {
        self.queue.lock().map(|q| !q.is_empty()).unwrap_or(false)
    }

    fn observations(&mut self) -> Vec<Observation> {
        match self.queue.lock() {
            Ok(mut queue) => queue.drain(..).collect(),
            Err(_) => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffered_sensor_drains_in_order() {
        let mut sensor = BufferedSensor::new();
        let feed = sensor.feed();
        assert!(!sensor.has_observations());

        feed.push_value(1.0);
        feed.push(Observation::labelled(2.0, "vm1"));
        assert!(sensor.has_observations());

        let obs = sensor.observations();
        assert_eq!(obs.len(), 2);
        assert_eq!(obs[0].value, 1.0);
        assert_eq!(obs[1].label, "vm1");
        assert!(!sensor.has_observations());
        assert!(sensor.observations().is_empty());
    }

    #[test]
    fn test_reset_discards_buffer() {
        let mut sensor = BufferedSensor::new();
        sensor.feed().push_value(3.0);
        sensor.reset();
        assert!(!sensor.has_observations());
    }
}
