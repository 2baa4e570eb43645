//! Bound-constrained minimization
//!
//! Model-predictive control delegates its finite-horizon problem to an
//! `Optimizer`. The bundled `CompassSearchOptimizer` is a derivative-free
//! pattern search, adequate for the handful of decision variables a short
//! control horizon produces.

use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum OptimizerError {
    #[error("invalid bounds for variable {index}: [{lower}, {upper}]")]
    InvalidBounds { index: usize, lower: f64, upper: f64 },

    #[error("objective is not finite at the starting point")]
    NonFiniteObjective,
}

/// Termination status of a minimization
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimizerStatus {
    Converged,
    MaxIterations,
    TimeLimit,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OptimizerSolution {
    pub x: Vec<f64>,
    pub value: f64,
    pub status: OptimizerStatus,
}

/// Minimizes an objective over a box
pub trait Optimizer: Send {
    fn minimize(
        &mut self,
        objective: &dyn Fn(&[f64]) -> f64,
        bounds: &[(f64, f64)],
        time_limit: Duration,
    ) -> Result<OptimizerSolution, OptimizerError>;
}

/// Coordinate pattern search with step halving
#[derive(Debug, Clone)]
pub struct CompassSearchOptimizer {
    /// Stop once the step falls below this size
    pub tolerance: f64,
    pub max_iterations: usize,
}

impl Default for CompassSearchOptimizer {
    fn default() -> Self {
        Self {
            tolerance: 1e-7,
            max_iterations: 10_000,
        }
    }
}

fn validate(bounds: &[(f64, f64)]) -> Result<(), OptimizerError> {
    for (index, &(lower, upper)) in bounds.iter().enumerate() {
        if !lower.is_finite() || !upper.is_finite() || lower > upper {
            return Err(OptimizerError::InvalidBounds {
                index,
                lower,
                upper,
            });
        }
    }
    Ok(())
}

impl Optimizer for CompassSearchOptimizer {
    fn minimize(
        &mut self,
        objective: &dyn Fn(&[f64]) -> f64,
        bounds: &[(f64, f64)],
        time_limit: Duration,
    ) -> Result<OptimizerSolution, OptimizerError> {
        validate(bounds)?;
        let started = Instant::now();

        // start from the admissible point closest to the origin
        let mut x: Vec<f64> = bounds.iter().map(|&(lo, hi)| 0.0f64.clamp(lo, hi)).collect();
        let mut best = objective(&x);
        if !best.is_finite() {
            return Err(OptimizerError::NonFiniteObjective);
        }

        let widest = bounds
            .iter()
            .map(|(lo, hi)| hi - lo)
            .fold(0.0, f64::max);
        let mut step = widest / 4.0;
        let mut iterations = 0;

        while step > self.tolerance {
            if iterations >= self.max_iterations {
                return Ok(OptimizerSolution {
                    x,
                    value: best,
                    status: OptimizerStatus::MaxIterations,
                });
            }
            if started.elapsed() > time_limit {
                return Ok(OptimizerSolution {
                    x,
                    value: best,
                    status: OptimizerStatus::TimeLimit,
                });
            }
            iterations += 1;

            let mut improved = false;
            for i in 0..x.len() {
                for direction in [1.0, -1.0] {
                    let (lo, hi) = bounds[i];
                    let candidate_value = (x[i] + direction * step).clamp(lo, hi);
                    if candidate_value == x[i] {
                        continue;
                    }
                    let previous = x[i];
                    x[i] = candidate_value;
                    let value = objective(&x);
                    if value.is_finite() && value < best {
                        best = value;
                        improved = true;
                        break;
                    }
                    x[i] = previous;
                }
            }
            if !improved {
                step /= 2.0;
            }
        }

        Ok(OptimizerSolution {
            x,
            value: best,
            status: OptimizerStatus::Converged,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unconstrained_quadratic() {
        let mut opt = CompassSearchOptimizer::default();
        let f = |x: &[f64]| (x[0] - 0.3).powi(2) + 2.0 * (x[1] + 0.2).powi(2);
        let sol = opt
            .minimize(&f, &[(-1.0, 1.0), (-1.0, 1.0)], Duration::from_secs(1))
            .unwrap();
        assert_eq!(sol.status, OptimizerStatus::Converged);
        assert!((sol.x[0] - 0.3).abs() < 1e-5);
        assert!((sol.x[1] + 0.2).abs() < 1e-5);
    }

    #[test]
    fn test_active_bound() {
        let mut opt = CompassSearchOptimizer::default();
        let f = |x: &[f64]| (x[0] - 2.0).powi(2);
        let sol = opt
            .minimize(&f, &[(-0.5, 0.5)], Duration::from_secs(1))
            .unwrap();
        assert!((sol.x[0] - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_invalid_bounds() {
        let mut opt = CompassSearchOptimizer::default();
        let f = |_: &[f64]| 0.0;
        assert!(matches!(
            opt.minimize(&f, &[(1.0, -1.0)], Duration::from_secs(1)),
            Err(OptimizerError::InvalidBounds { index: 0, .. })
        ));
    }

    #[test]
    fn test_non_finite_start() {
        let mut opt = CompassSearchOptimizer::default();
        let f = |_: &[f64]| f64::NAN;
        assert_eq!(
            opt.minimize(&f, &[(0.0, 1.0)], Duration::from_secs(1)),
            Err(OptimizerError::NonFiniteObjective)
        );
    }

    #[test]
    fn test_iteration_cap() {
        let mut opt = CompassSearchOptimizer {
            tolerance: 1e-12,
            max_iterations: 3,
        };
        let f = |x: &[f64]| (x[0] - 0.123).powi(2);
        let sol = opt
            .minimize(&f, &[(-1.0, 1.0)], Duration::from_secs(1))
            .unwrap();
        assert_eq!(sol.status, OptimizerStatus::MaxIterations);
    }
}
