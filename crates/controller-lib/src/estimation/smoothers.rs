//! Exponential smoothers for utilization series

use super::Smoother;

/// Forwards the last observed value unchanged
#[derive(Debug, Clone, Default)]
pub struct PassThroughSmoother {
    last: Option<f64>,
}

impl PassThroughSmoother {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Smoother for PassThroughSmoother {
    fn smooth(&mut self, value: f64) -> f64 {
        self.last = Some(value);
        value
    }

    fn forecast(&self, _steps: u32) -> Option<f64> {
        self.last
    }

    fn reset(&mut self) {
        self.last = None;
    }
}

/// Brown's single exponential smoothing (EWMA): `s = alpha * x + (1 - alpha) * s`
#[derive(Debug, Clone)]
pub struct BrownSingleExponentialSmoother {
    alpha: f64,
    level: Option<f64>,
}

impl BrownSingleExponentialSmoother {
    pub fn new(alpha: f64) -> Self {
        Self {
            alpha: alpha.clamp(0.0, 1.0),
            level: None,
        }
    }
}

impl Smoother for BrownSingleExponentialSmoother {
    fn smooth(&mut self, value: f64) -> f64 {
        let level = match self.level {
            None => value,
            Some(s) => self.alpha * value + (1.0 - self.alpha) * s,
        };
        self.level = Some(level);
        level
    }

    fn forecast(&self, _steps: u32) -> Option<f64> {
        self.level
    }

    fn reset(&mut self) {
        self.level = None;
    }
}

/// Brown's double exponential smoothing with linear trend extrapolation
#[derive(Debug, Clone)]
pub struct BrownDoubleExponentialSmoother {
    alpha: f64,
    state: Option<(f64, f64)>,
}

impl BrownDoubleExponentialSmoother {
    pub fn new(alpha: f64) -> Self {
        // alpha = 1 would make the trend coefficient infinite
        Self {
            alpha: alpha.clamp(0.0, 1.0 - f64::EPSILON),
            state: None,
        }
    }

    fn level_and_trend(&self, s1: f64, s2: f64) -> (f64, f64) {
        let level = 2.0 * s1 - s2;
        let trend = self.alpha / (1.0 - self.alpha) * (s1 - s2);
        (level, trend)
    }
}

impl Smoother for BrownDoubleExponentialSmoother {
    fn smooth(&mut self, value: f64) -> f64 {
        let (s1, s2) = match self.state {
            None => (value, value),
            Some((s1, s2)) => {
                let s1 = self.alpha * value + (1.0 - self.alpha) * s1;
                let s2 = self.alpha * s1 + (1.0 - self.alpha) * s2;
                (s1, s2)
            }
        };
        self.state = Some((s1, s2));
        self.level_and_trend(s1, s2).0
    }

    fn forecast(&self, steps: u32) -> Option<f64> {
        let (s1, s2) = self.state?;
        let (level, trend) = self.level_and_trend(s1, s2);
        Some(level + steps as f64 * trend)
    }

    fn reset(&mut self) {
        self.state = None;
    }
}

/// Holt-Winters double exponential smoothing (level and trend, no seasonality)
#[derive(Debug, Clone)]
pub struct HoltWintersSmoother {
    alpha: f64,
    beta: f64,
    state: Option<(f64, f64)>,
}

impl HoltWintersSmoother {
    pub fn new(alpha: f64, beta: f64) -> Self {
        Self {
            alpha: alpha.clamp(0.0, 1.0),
            beta: beta.clamp(0.0, 1.0),
            state: None,
        }
    }

    /// Parameterization by a single discount factor `delta`, equivalent to
    /// Brown's double smoothing with `alpha = 1 - (1 - delta)^2`.
    pub fn with_delta(delta: f64) -> Self {
        let delta = delta.clamp(f64::EPSILON, 1.0);
        let alpha = 1.0 - (1.0 - delta).powi(2);
        let beta = delta * delta / alpha;
        Self::new(alpha, beta)
    }
}

impl Smoother for HoltWintersSmoother {
    fn smooth(&mut self, value: f64) -> f64 {
        let (level, trend) = match self.state {
            None => (value, 0.0),
            Some((s, b)) => {
                let level = self.alpha * value + (1.0 - self.alpha) * (s + b);
                let trend = self.beta * (level - s) + (1.0 - self.beta) * b;
                (level, trend)
            }
        };
        self.state = Some((level, trend));
        level
    }

    fn forecast(&self, steps: u32) -> Option<f64> {
        self.state.map(|(s, b)| s + steps as f64 * b)
    }

    fn reset(&mut self) {
        self.state = None;
    }
}
