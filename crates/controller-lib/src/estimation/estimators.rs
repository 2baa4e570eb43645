//! Summary estimators for performance observations
//!
//! Each estimator reduces a stream of observations to a single value per
//! control interval. Batch-oriented estimators treat every `collect_all`
//! call as one batch (one sensor poll).

use super::quantile;
use super::Estimator;

/// Returns the most recently collected value
#[derive(Debug, Clone, Default)]
pub struct MostRecentEstimator {
    last: Option<f64>,
    count: usize,
}

impl MostRecentEstimator {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Estimator for MostRecentEstimator {
    fn collect(&mut self, value: f64) {
        if !value.is_finite() {
            return;
        }
        self.last = Some(value);
        self.count += 1;
    }

    fn estimate(&self) -> Option<f64> {
        self.last
    }

    fn count(&self) -> usize {
        self.count
    }

    fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Running arithmetic mean
#[derive(Debug, Clone, Default)]
pub struct MeanEstimator {
    mean: f64,
    count: usize,
}

impl MeanEstimator {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Estimator for MeanEstimator {
    fn collect(&mut self, value: f64) {
        if !value.is_finite() {
            return;
        }
        self.count += 1;
        self.mean += (value - self.mean) / self.count as f64;
    }

    fn estimate(&self) -> Option<f64> {
        (self.count > 0).then_some(self.mean)
    }

    fn count(&self) -> usize {
        self.count
    }

    fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Streaming quantile estimator using the P² algorithm (Jain & Chlamtac, 1985).
///
/// Keeps five markers whose heights approximate the minimum, the `p/2`, `p`,
/// `(1+p)/2` quantiles and the maximum, adjusting them with a piecewise
/// parabolic interpolation. Memory use is constant.
#[derive(Debug, Clone)]
pub struct P2QuantileEstimator {
    probability: f64,
    count: usize,
    initial: Vec<f64>,
    heights: [f64; 5],
    positions: [f64; 5],
    desired: [f64; 5],
    increments: [f64; 5],
}

impl P2QuantileEstimator {
    pub fn new(probability: f64) -> Self {
        let p = probability.clamp(0.0, 1.0);
        Self {
            probability: p,
            count: 0,
            initial: Vec::with_capacity(5),
            heights: [0.0; 5],
            positions: [1.0, 2.0, 3.0, 4.0, 5.0],
            desired: [1.0, 1.0 + 2.0 * p, 1.0 + 4.0 * p, 3.0 + 2.0 * p, 5.0],
            increments: [0.0, p / 2.0, p, (1.0 + p) / 2.0, 1.0],
        }
    }

    pub fn probability(&self) -> f64 {
        self.probability
    }

    fn parabolic(&self, i: usize, s: f64) -> f64 {
        let q = &self.heights;
        let n = &self.positions;
        q[i] + s / (n[i + 1] - n[i - 1])
            * ((n[i] - n[i - 1] + s) * (q[i + 1] - q[i]) / (n[i + 1] - n[i])
                + (n[i + 1] - n[i] - s) * (q[i] - q[i - 1]) / (n[i] - n[i - 1]))
    }

    fn linear(&self, i: usize, s: f64) -> f64 {
        let j = if s > 0.0 { i + 1 } else { i - 1 };
        let q = &self.heights;
        let n = &self.positions;
        q[i] + s * (q[j] - q[i]) / (n[j] - n[i])
    }
}

impl Estimator for P2QuantileEstimator {
    fn collect(&mut self, value: f64) {
        if !value.is_finite() {
            return;
        }
        self.count += 1;

        if self.count <= 5 {
            self.initial.push(value);
            if self.count == 5 {
                let sorted = quantile::sorted(&self.initial);
                self.heights.copy_from_slice(&sorted);
            }
            return;
        }

        let k = if value < self.heights[0] {
            self.heights[0] = value;
            0
        } else if value >= self.heights[4] {
            self.heights[4] = value;
            3
        } else {
            (0..4)
                .find(|&i| self.heights[i] <= value && value < self.heights[i + 1])
                .unwrap_or(3)
        };

        for i in (k + 1)..5 {
            self.positions[i] += 1.0;
        }
        for i in 0..5 {
            self.desired[i] += self.increments[i];
        }

        for i in 1..4 {
            let d = self.desired[i] - self.positions[i];
            let room_up = self.positions[i + 1] - self.positions[i] > 1.0;
            let room_down = self.positions[i - 1] - self.positions[i] < -1.0;
            if (d >= 1.0 && room_up) || (d <= -1.0 && room_down) {
                let s = d.signum();
                let candidate = self.parabolic(i, s);
                self.heights[i] =
                    if self.heights[i - 1] < candidate && candidate < self.heights[i + 1] {
                        candidate
                    } else {
                        self.linear(i, s)
                    };
                self.positions[i] += s;
            }
        }
    }

    fn estimate(&self) -> Option<f64> {
        match self.count {
            0 => None,
            1..=4 => quantile::quantile(&self.initial, self.probability),
            _ => Some(self.heights[2]),
        }
    }

    fn count(&self) -> usize {
        self.count
    }

    fn reset(&mut self) {
        *self = Self::new(self.probability);
    }
}

/// EWMA of per-batch quantiles (Chen et al., 2000).
///
/// Each batch contributes its type-7 quantile `q`; the estimate evolves as
/// `(1 - w) * estimate + w * q`.
#[derive(Debug, Clone)]
pub struct EwmaQuantileEstimator {
    probability: f64,
    weight: f64,
    value: Option<f64>,
    count: usize,
}

impl EwmaQuantileEstimator {
    pub const DEFAULT_WEIGHT: f64 = 0.05;

    pub fn new(probability: f64, weight: f64) -> Self {
        Self {
            probability: probability.clamp(0.0, 1.0),
            weight: weight.clamp(0.0, 1.0),
            value: None,
            count: 0,
        }
    }
}

impl Estimator for EwmaQuantileEstimator {
    fn collect(&mut self, value: f64) {
        self.collect_all(&[value]);
    }

    fn collect_all(&mut self, values: &[f64]) {
        let batch: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
        let Some(q) = quantile::quantile(&batch, self.probability) else {
            return;
        };
        self.count += batch.len();
        self.value = Some(match self.value {
            None => q,
            Some(prev) => (1.0 - self.weight) * prev + self.weight * q,
        });
    }

    fn estimate(&self) -> Option<f64> {
        self.value
    }

    fn count(&self) -> usize {
        self.count
    }

    fn reset(&mut self) {
        self.value = None;
        self.count = 0;
    }
}

/// EWMA of per-batch order statistics (Welsh, 2003).
///
/// The batch quantile is the order statistic `x_(ceil(p n))`, or the
/// interpolated type-7 quantile in extended mode; the estimate evolves as
/// `alpha * estimate + (1 - alpha) * q`.
#[derive(Debug, Clone)]
pub struct WelshEwmaQuantileEstimator {
    probability: f64,
    alpha: f64,
    extended: bool,
    value: Option<f64>,
    count: usize,
}

impl WelshEwmaQuantileEstimator {
    pub const DEFAULT_ALPHA: f64 = 0.7;

    pub fn new(probability: f64, alpha: f64, extended: bool) -> Self {
        Self {
            probability: probability.clamp(0.0, 1.0),
            alpha: alpha.clamp(0.0, 1.0),
            extended,
            value: None,
            count: 0,
        }
    }
}

impl Estimator for WelshEwmaQuantileEstimator {
    fn collect(&mut self, value: f64) {
        self.collect_all(&[value]);
    }

    fn collect_all(&mut self, values: &[f64]) {
        let batch: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
        let q = if self.extended {
            quantile::quantile(&batch, self.probability)
        } else {
            quantile::order_statistic(&batch, self.probability)
        };
        let Some(q) = q else {
            return;
        };
        self.count += batch.len();
        self.value = Some(match self.value {
            None => q,
            Some(prev) => self.alpha * prev + (1.0 - self.alpha) * q,
        });
    }

    fn estimate(&self) -> Option<f64> {
        self.value
    }

    fn count(&self) -> usize {
        self.count
    }

    fn reset(&mut self) {
        self.value = None;
        self.count = 0;
    }
}
