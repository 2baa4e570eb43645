//! Share actuation
//!
//! The actuator is the only collaborator shared between managers, so
//! implementations must be `Send + Sync`.

use crate::error::ActuatorError;
use crate::models::{Channel, EntityId, ResourceCategory};
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Reads and writes resource shares of managed entities
pub trait ShareActuator: Send + Sync {
    fn share(&self, entity: &str, category: ResourceCategory) -> Result<f64, ActuatorError>;

    fn set_share(
        &self,
        entity: &str,
        category: ResourceCategory,
        share: f64,
    ) -> Result<(), ActuatorError>;
}

/// Concurrent in-memory share table
#[derive(Debug, Default)]
pub struct InMemoryActuator {
    shares: DashMap<Channel, f64>,
    writes: AtomicU64,
}

impl InMemoryActuator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a channel with its initial share
    pub fn register(&self, entity: impl Into<EntityId>, category: ResourceCategory, share: f64) {
        self.shares.insert((entity.into(), category), share);
    }

    /// Number of successful `set_share` calls
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> BTreeMap<Channel, f64> {
        self.shares
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }
}

impl ShareActuator for InMemoryActuator {
    fn share(&self, entity: &str, category: ResourceCategory) -> Result<f64, ActuatorError> {
        self.shares
            .get(&(entity.to_string(), category))
            .map(|v| *v)
            .ok_or_else(|| ActuatorError::UnknownChannel {
                entity: entity.to_string(),
                category,
            })
    }

    fn set_share(
        &self,
        entity: &str,
        category: ResourceCategory,
        share: f64,
    ) -> Result<(), ActuatorError> {
        if !share.is_finite() || !(0.0..=1.0).contains(&share) {
            return Err(ActuatorError::Rejected {
                entity: entity.to_string(),
                category,
                value: share,
                reason: "share must be a finite fraction".to_string(),
            });
        }
        match self.shares.get_mut(&(entity.to_string(), category)) {
            Some(mut slot) => {
                debug!(entity = %entity, category = %category, share, "Share updated");
                *slot = share;
                self.writes.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            None => Err(ActuatorError::UnknownChannel {
                entity: entity.to_string(),
                category,
            }),
        }
    }
}
