//! Covariance reset heuristics
//!
//! Both checks run before every update; either one firing forces a full
//! strategy reset so the update starts from the default estimate.

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

/// Optional covariance-based reset triggers
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResetHeuristics {
    /// Reset when any covariance entry exceeds this bound
    #[serde(default)]
    pub max_covariance: Option<f64>,
    /// Reset when `log10(rcond(P)) > log10(2 eps) + trusted_digits`
    #[serde(default)]
    pub trusted_digits: Option<f64>,
}

impl ResetHeuristics {
    pub fn with_max_covariance(mut self, bound: f64) -> Self {
        self.max_covariance = Some(bound);
        self
    }

    pub fn with_trusted_digits(mut self, digits: f64) -> Self {
        self.trusted_digits = Some(digits);
        self
    }

    /// Returns the reason for a reset, if one of the checks fires
    pub fn check(&self, covariance: &DMatrix<f64>) -> Option<String> {
        if let Some(bound) = self.max_covariance {
            let max = covariance.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            if max > bound {
                return Some(format!("covariance entry {:e} above bound {:e}", max, bound));
            }
        }

        if let Some(digits) = self.trusted_digits {
            let rcond = reciprocal_condition(covariance);
            let threshold = (2.0 * f64::EPSILON).log10() + digits;
            if rcond.log10() > threshold {
                return Some(format!(
                    "log10(rcond) {:.3} above threshold {:.3}",
                    rcond.log10(),
                    threshold
                ));
            }
        }

        None
    }
}

fn norm_one(m: &DMatrix<f64>) -> f64 {
    m.column_iter()
        .map(|c| c.iter().map(|v| v.abs()).sum::<f64>())
        .fold(0.0, f64::max)
}

/// Reciprocal condition number in the 1-norm, `0` for singular matrices
pub fn reciprocal_condition(m: &DMatrix<f64>) -> f64 {
    if m.is_empty() || !m.is_square() {
        return 0.0;
    }
    let Some(inverse) = m.clone().try_inverse() else {
        return 0.0;
    };
    let denom = norm_one(m) * norm_one(&inverse);
    if denom.is_finite() && denom > 0.0 {
        1.0 / denom
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_max_covariance_trigger() {
        let h = ResetHeuristics::default().with_max_covariance(1e6);
        let mut p = DMatrix::identity(2, 2);
        assert!(h.check(&p).is_none());
        p[(1, 0)] = 2e6;
        assert!(h.check(&p).is_some());
    }

    #[test]
    fn test_reciprocal_condition() {
        let p = DMatrix::from_diagonal_element(3, 3, 5.0);
        assert!((reciprocal_condition(&p) - 1.0).abs() < 1e-12);

        let p = DMatrix::from_row_slice(2, 2, &[1.0, 0.0, 0.0, 1e-4]);
        assert!((reciprocal_condition(&p) - 1e-4).abs() < 1e-12);

        let singular = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 2.0, 4.0]);
        assert_eq!(reciprocal_condition(&singular), 0.0);
    }

    #[test]
    fn test_condition_trigger_follows_threshold() {
        // identity: log10(rcond) = 0, threshold = log10(2 eps) + digits ~ -15.35 + digits
        let p = DMatrix::<f64>::identity(2, 2);
        assert!(ResetHeuristics::default()
            .with_trusted_digits(10.0)
            .check(&p)
            .is_some());
        assert!(ResetHeuristics::default()
            .with_trusted_digits(16.0)
            .check(&p)
            .is_none());
    }

    #[test]
    fn test_disabled_heuristics_never_fire() {
        let p = DMatrix::from_element(2, 2, 1e300);
        assert!(ResetHeuristics::default().check(&p).is_none());
    }
}
