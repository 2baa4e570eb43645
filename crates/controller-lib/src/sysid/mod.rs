//! Online ARX system identification
//!
//! This module provides:
//! - `ArxStrategy`, a recursive ARX estimator in MIMO or MISO decomposition
//! - The `ParameterUpdate` seam for recursive least-squares updates
//! - Forgetting-factor RLS implementations
//! - Covariance reset heuristics
//!
//! Model convention, for lags `i >= 1`:
//!
//! ```text
//! y(k) + A_1 y(k-1) + ... + A_na y(k-na) = B_1 u(k-d-1) + ... + B_nb u(k-d-nb)
//! ```
//!
//! so the regressor carries negated past outputs and the parameter matrix
//! stacks `A_i` rows first, then `B_i` rows, one column per output.

mod arx;
mod heuristics;
mod rls;

#[cfg(test)]
mod tests;

pub use arx::{ArxSnapshot, ArxStrategy, Decomposition, RegressionState};
pub use heuristics::{reciprocal_condition, ResetHeuristics};
pub use rls::{RlsForgettingFactor, RlsPark1991};

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised by the identification layer
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SysIdError {
    #[error("invalid model orders: {0}")]
    InvalidOrders(String),

    #[error("expected {expected} values for {what}, got {actual}")]
    DimensionMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("non-finite {0} sample")]
    NonFiniteInput(&'static str),

    #[error("lag {lag} out of range 1..={max}")]
    LagOutOfRange { lag: usize, max: usize },

    #[error("identification diverged: {0}")]
    Divergence(String),
}

/// ARX model orders and channel counts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArxOrders {
    /// Output (autoregressive) order
    pub na: usize,
    /// Input order
    pub nb: usize,
    /// Input delay in samples
    #[serde(default)]
    pub d: usize,
    /// Number of outputs
    #[serde(default = "one")]
    pub ny: usize,
    /// Number of inputs
    #[serde(default = "one")]
    pub nu: usize,
}

fn one() -> usize {
    1
}

impl ArxOrders {
    pub fn new(na: usize, nb: usize, d: usize, ny: usize, nu: usize) -> Result<Self, SysIdError> {
        let orders = Self { na, nb, d, ny, nu };
        orders.validate()?;
        Ok(orders)
    }

    /// Single-input single-output orders
    pub fn siso(na: usize, nb: usize, d: usize) -> Result<Self, SysIdError> {
        Self::new(na, nb, d, 1, 1)
    }

    pub fn validate(&self) -> Result<(), SysIdError> {
        if self.ny == 0 || self.nu == 0 {
            return Err(SysIdError::InvalidOrders(
                "at least one output and one input are required".to_string(),
            ));
        }
        if self.na + self.nb == 0 {
            return Err(SysIdError::InvalidOrders(
                "na and nb cannot both be zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Number of rows of the stacked parameter matrix
    pub fn parameter_rows(&self) -> usize {
        self.na * self.ny + self.nb * self.nu
    }

    /// Samples required before the estimate is considered usable
    pub fn ready_threshold(&self) -> usize {
        self.na + self.nb + self.d
    }

    pub fn is_single_channel(&self) -> bool {
        self.ny <= 1 && self.nu <= 1
    }
}

/// A recursive parameter update rule.
///
/// Given the measured output `y`, the regressor `phi` built from past data and
/// the current parameter matrix and covariance, refines both in place and
/// returns the a-priori prediction `theta^T phi`.
pub trait ParameterUpdate: Send {
    fn update(
        &mut self,
        y: &DVector<f64>,
        phi: &DVector<f64>,
        theta: &mut DMatrix<f64>,
        covariance: &mut DMatrix<f64>,
    ) -> Result<DVector<f64>, SysIdError>;

    /// Clear any internal adaptation state
    fn reset(&mut self) {}
}

/// Selection of the recursive update rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UpdateRule {
    /// Exponential forgetting with a fixed factor
    ForgettingFactor { lambda: f64 },
    /// Variable forgetting factor driven by the prediction error
    Park1991 { lambda_min: f64, sensitivity: f64 },
}

impl Default for UpdateRule {
    fn default() -> Self {
        UpdateRule::ForgettingFactor { lambda: 0.98 }
    }
}

impl UpdateRule {
    pub fn build(&self) -> Box<dyn ParameterUpdate> {
        match *self {
            UpdateRule::ForgettingFactor { lambda } => Box::new(RlsForgettingFactor::new(lambda)),
            UpdateRule::Park1991 {
                lambda_min,
                sensitivity,
            } => Box::new(RlsPark1991::new(lambda_min, sensitivity)),
        }
    }
}

/// Identification settings, deserializable from configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArxConfig {
    pub orders: ArxOrders,
    #[serde(default)]
    pub decomposition: Decomposition,
    #[serde(default)]
    pub update: UpdateRule,
    /// Diagonal of the covariance after a reset
    #[serde(default = "default_initial_covariance")]
    pub initial_covariance: f64,
    #[serde(default)]
    pub heuristics: ResetHeuristics,
}

fn default_initial_covariance() -> f64 {
    1e4
}

impl ArxConfig {
    pub fn new(orders: ArxOrders) -> Self {
        Self {
            orders,
            decomposition: Decomposition::default(),
            update: UpdateRule::default(),
            initial_covariance: default_initial_covariance(),
            heuristics: ResetHeuristics::default(),
        }
    }

    pub fn build(&self) -> Result<ArxStrategy, SysIdError> {
        let rule = self.update.clone();
        let mut strategy = ArxStrategy::new(self.orders, self.decomposition, move || rule.build())?
            .with_initial_covariance(self.initial_covariance);
        strategy.set_heuristics(self.heuristics.clone());
        Ok(strategy)
    }
}
