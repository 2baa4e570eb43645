//! Performance estimators and utilization smoothers
//!
//! This module provides:
//! - The `Estimator` trait reducing performance observations to one value per interval
//! - The `Smoother` trait producing utilization forecasts
//! - Configurable kinds so both can be selected from configuration

mod estimators;
pub mod quantile;
mod smoothers;

pub use estimators::{
    EwmaQuantileEstimator, MeanEstimator, MostRecentEstimator, P2QuantileEstimator,
    WelshEwmaQuantileEstimator,
};
pub use smoothers::{
    BrownDoubleExponentialSmoother, BrownSingleExponentialSmoother, HoltWintersSmoother,
    PassThroughSmoother,
};

use serde::{Deserialize, Serialize};

/// Reduces a stream of observations to a summary value
pub trait Estimator: Send {
    /// Collect a single observation
    fn collect(&mut self, value: f64);

    /// Collect a batch of observations, in arrival order
    fn collect_all(&mut self, values: &[f64]) {
        for &v in values {
            self.collect(v);
        }
    }

    /// Current estimate, `None` until at least one finite value was collected
    fn estimate(&self) -> Option<f64>;

    /// Number of observations that contributed to the estimate
    fn count(&self) -> usize;

    fn reset(&mut self);
}

/// Smooths a series and forecasts it a number of steps ahead
pub trait Smoother: Send {
    /// Feed a value, returning the smoothed level
    fn smooth(&mut self, value: f64) -> f64;

    /// Forecast `steps` steps ahead, `None` before any value was seen
    fn forecast(&self, steps: u32) -> Option<f64>;

    fn reset(&mut self);
}

/// Estimator selection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EstimatorKind {
    MostRecent,
    Mean,
    P2Quantile {
        probability: f64,
    },
    EwmaQuantile {
        probability: f64,
        #[serde(default = "default_ewma_weight")]
        weight: f64,
    },
    WelshQuantile {
        probability: f64,
        #[serde(default = "default_welsh_alpha")]
        alpha: f64,
        #[serde(default)]
        extended: bool,
    },
}

fn default_ewma_weight() -> f64 {
    EwmaQuantileEstimator::DEFAULT_WEIGHT
}

fn default_welsh_alpha() -> f64 {
    WelshEwmaQuantileEstimator::DEFAULT_ALPHA
}

impl Default for EstimatorKind {
    fn default() -> Self {
        EstimatorKind::Mean
    }
}

impl EstimatorKind {
    pub fn build(&self) -> Box<dyn Estimator> {
        match *self {
            EstimatorKind::MostRecent => Box::new(MostRecentEstimator::new()),
            EstimatorKind::Mean => Box::new(MeanEstimator::new()),
            EstimatorKind::P2Quantile { probability } => {
                Box::new(P2QuantileEstimator::new(probability))
            }
            EstimatorKind::EwmaQuantile {
                probability,
                weight,
            } => Box::new(EwmaQuantileEstimator::new(probability, weight)),
            EstimatorKind::WelshQuantile {
                probability,
                alpha,
                extended,
            } => Box::new(WelshEwmaQuantileEstimator::new(probability, alpha, extended)),
        }
    }
}

/// Smoother selection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SmootherKind {
    PassThrough,
    BrownSingle { alpha: f64 },
    BrownDouble { alpha: f64 },
    HoltWinters { alpha: f64, beta: f64 },
}

impl Default for SmootherKind {
    fn default() -> Self {
        SmootherKind::BrownSingle { alpha: 0.9 }
    }
}

impl SmootherKind {
    pub fn build(&self) -> Box<dyn Smoother> {
        match *self {
            SmootherKind::PassThrough => Box::new(PassThroughSmoother::new()),
            SmootherKind::BrownSingle { alpha } => {
                Box::new(BrownSingleExponentialSmoother::new(alpha))
            }
            SmootherKind::BrownDouble { alpha } => {
                Box::new(BrownDoubleExponentialSmoother::new(alpha))
            }
            SmootherKind::HoltWinters { alpha, beta } => {
                Box::new(HoltWintersSmoother::new(alpha, beta))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimator_kind_from_json() {
        let kind: EstimatorKind =
            serde_json::from_str(r#"{"kind":"ewma_quantile","probability":0.95}"#).unwrap();
        assert_eq!(
            kind,
            EstimatorKind::EwmaQuantile {
                probability: 0.95,
                weight: 0.05
            }
        );

        let mut est = kind.build();
        est.collect_all(&[1.0, 2.0]);
        assert!(est.estimate().is_some());
    }

    #[test]
    fn test_smoother_kind_defaults() {
        let mut smoother = SmootherKind::default().build();
        assert_eq!(smoother.forecast(0), None);
        smoother.smooth(0.4);
        assert_eq!(smoother.forecast(0), Some(0.4));
    }
}
