//! Recursive ARX identification strategy

use super::{ArxOrders, ParameterUpdate, ResetHeuristics, SysIdError};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use tracing::{debug, warn};

/// How a multi-output model is estimated
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decomposition {
    /// One regression over all outputs sharing a covariance
    #[default]
    Mimo,
    /// One independent regression per output; cross-output terms are zero
    Miso,
}

/// Parameter estimate, covariance and last regressor of one regression
#[derive(Debug, Clone, PartialEq)]
pub struct RegressionState {
    pub theta: DMatrix<f64>,
    pub covariance: DMatrix<f64>,
    pub regressor: DVector<f64>,
}

impl RegressionState {
    fn initial(rows: usize, cols: usize, initial_covariance: f64) -> Self {
        Self {
            theta: DMatrix::zeros(rows, cols),
            covariance: DMatrix::identity(rows, rows) * initial_covariance,
            regressor: DVector::zeros(rows),
        }
    }

    fn is_finite(&self) -> bool {
        self.theta.iter().all(|v| v.is_finite())
    }
}

/// Immutable view of the identified coefficient matrices
#[derive(Debug, Clone, PartialEq)]
pub struct ArxSnapshot {
    pub orders: ArxOrders,
    /// `A_1 .. A_na`, each `ny x ny`
    pub a: Vec<DMatrix<f64>>,
    /// `B_1 .. B_nb`, each `ny x nu`
    pub b: Vec<DMatrix<f64>>,
}

impl ArxSnapshot {
    /// Build a snapshot from explicit coefficients, checking their shapes
    pub fn from_coefficients(
        orders: ArxOrders,
        a: Vec<DMatrix<f64>>,
        b: Vec<DMatrix<f64>>,
    ) -> Result<Self, SysIdError> {
        orders.validate()?;
        if a.len() != orders.na {
            return Err(SysIdError::DimensionMismatch {
                what: "A matrices",
                expected: orders.na,
                actual: a.len(),
            });
        }
        if b.len() != orders.nb {
            return Err(SysIdError::DimensionMismatch {
                what: "B matrices",
                expected: orders.nb,
                actual: b.len(),
            });
        }
        if a.iter().any(|m| m.shape() != (orders.ny, orders.ny))
            || b.iter().any(|m| m.shape() != (orders.ny, orders.nu))
        {
            return Err(SysIdError::InvalidOrders(
                "coefficient matrix shape does not match channel counts".to_string(),
            ));
        }
        Ok(Self { orders, a, b })
    }

    /// `A_k` for `k` in `1..=na`
    pub fn a(&self, k: usize) -> Result<&DMatrix<f64>, SysIdError> {
        check_lag(k, self.orders.na)?;
        Ok(&self.a[k - 1])
    }

    /// `B_k` for `k` in `1..=nb`
    pub fn b(&self, k: usize) -> Result<&DMatrix<f64>, SysIdError> {
        check_lag(k, self.orders.nb)?;
        Ok(&self.b[k - 1])
    }
}

fn check_lag(k: usize, max: usize) -> Result<(), SysIdError> {
    if k == 0 || k > max {
        return Err(SysIdError::LagOutOfRange { lag: k, max });
    }
    Ok(())
}

type UpdaterFactory = Box<dyn Fn() -> Box<dyn ParameterUpdate> + Send>;

/// Recursive ARX estimator.
///
/// Keeps the past `na` outputs and `d + nb` inputs, rebuilds the regressor
/// from them on every sample and hands it to the configured update rule.
/// Missing history is treated as zero.
pub struct ArxStrategy {
    orders: ArxOrders,
    decomposition: Decomposition,
    heuristics: ResetHeuristics,
    initial_covariance: f64,
    factory: UpdaterFactory,
    regressions: Vec<RegressionState>,
    updaters: Vec<Box<dyn ParameterUpdate>>,
    outputs: VecDeque<DVector<f64>>,
    inputs: VecDeque<DVector<f64>>,
    count: usize,
    resets: u64,
}

impl fmt::Debug for ArxStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArxStrategy")
            .field("orders", &self.orders)
            .field("decomposition", &self.decomposition)
            .field("heuristics", &self.heuristics)
            .field("count", &self.count)
            .field("resets", &self.resets)
            .finish()
    }
}

impl ArxStrategy {
    pub const DEFAULT_INITIAL_COVARIANCE: f64 = 1e4;

    /// Create a strategy; `factory` builds one update rule per regression
    pub fn new<F>(
        orders: ArxOrders,
        decomposition: Decomposition,
        factory: F,
    ) -> Result<Self, SysIdError>
    where
        F: Fn() -> Box<dyn ParameterUpdate> + Send + 'static,
    {
        orders.validate()?;
        let mut strategy = Self {
            orders,
            decomposition,
            heuristics: ResetHeuristics::default(),
            initial_covariance: Self::DEFAULT_INITIAL_COVARIANCE,
            factory: Box::new(factory),
            regressions: Vec::new(),
            updaters: Vec::new(),
            outputs: VecDeque::with_capacity(orders.na),
            inputs: VecDeque::with_capacity(orders.d + orders.nb),
            count: 0,
            resets: 0,
        };
        strategy.init();
        Ok(strategy)
    }

    pub fn with_initial_covariance(mut self, value: f64) -> Self {
        self.initial_covariance = value;
        self.init();
        self
    }

    pub fn with_heuristics(mut self, heuristics: ResetHeuristics) -> Self {
        self.heuristics = heuristics;
        self
    }

    pub fn set_heuristics(&mut self, heuristics: ResetHeuristics) {
        self.heuristics = heuristics;
    }

    pub fn orders(&self) -> ArxOrders {
        self.orders
    }

    pub fn decomposition(&self) -> Decomposition {
        self.decomposition
    }

    /// Samples consumed since the last reset
    pub fn count(&self) -> usize {
        self.count
    }

    /// Number of resets, forced or explicit, since construction
    pub fn reset_count(&self) -> u64 {
        self.resets
    }

    pub fn is_ready(&self) -> bool {
        self.count >= self.orders.ready_threshold()
    }

    fn init(&mut self) {
        let o = self.orders;
        let (count, rows, cols) = match self.decomposition {
            Decomposition::Mimo => (1, o.parameter_rows(), o.ny),
            Decomposition::Miso => (o.ny, o.na + o.nb * o.nu, 1),
        };
        self.regressions = (0..count)
            .map(|_| RegressionState::initial(rows, cols, self.initial_covariance))
            .collect();
        self.updaters = (0..count).map(|_| (self.factory)()).collect();
        self.outputs.clear();
        self.inputs.clear();
        self.count = 0;
    }

    /// Restore the default estimate, covariance and history
    pub fn reset(&mut self) {
        self.init();
        self.resets += 1;
        debug!(resets = self.resets, "ARX identification reset");
    }

    /// Feed one output/input sample pair, returning the a-priori prediction of `y`.
    ///
    /// On an update failure or a non-finite estimate the strategy is reset and
    /// `SysIdError::Divergence` is returned.
    pub fn estimate(&mut self, y: &[f64], u: &[f64]) -> Result<Vec<f64>, SysIdError> {
        let o = self.orders;
        if y.len() != o.ny {
            return Err(SysIdError::DimensionMismatch {
                what: "output",
                expected: o.ny,
                actual: y.len(),
            });
        }
        if u.len() != o.nu {
            return Err(SysIdError::DimensionMismatch {
                what: "input",
                expected: o.nu,
                actual: u.len(),
            });
        }
        if y.iter().any(|v| !v.is_finite()) {
            return Err(SysIdError::NonFiniteInput("output"));
        }
        if u.iter().any(|v| !v.is_finite()) {
            return Err(SysIdError::NonFiniteInput("input"));
        }

        let reset_reason = self
            .regressions
            .iter()
            .find_map(|r| self.heuristics.check(&r.covariance));
        if let Some(reason) = reset_reason {
            warn!(reason = %reason, "Resetting identification before update");
            self.reset();
        }

        let y = DVector::from_column_slice(y);
        let mut prediction = Vec::with_capacity(o.ny);
        for idx in 0..self.regressions.len() {
            let phi = self.regressor(idx);
            let target = match self.decomposition {
                Decomposition::Mimo => y.clone(),
                Decomposition::Miso => DVector::from_element(1, y[idx]),
            };
            let state = &mut self.regressions[idx];
            let step = self.updaters[idx].update(
                &target,
                &phi,
                &mut state.theta,
                &mut state.covariance,
            );
            match step {
                Ok(y_hat) => prediction.extend(y_hat.iter().copied()),
                Err(e) => {
                    self.reset();
                    return Err(SysIdError::Divergence(e.to_string()));
                }
            }
            state.regressor = phi;
        }

        if !self.regressions.iter().all(RegressionState::is_finite) {
            self.reset();
            return Err(SysIdError::Divergence(
                "non-finite parameter estimate".to_string(),
            ));
        }

        self.outputs.push_front(y);
        self.outputs.truncate(o.na);
        self.inputs.push_front(DVector::from_column_slice(u));
        self.inputs.truncate(o.d + o.nb);
        self.count += 1;

        Ok(prediction)
    }

    fn past_output(&self, lag: usize, channel: usize) -> f64 {
        self.outputs.get(lag - 1).map_or(0.0, |v| v[channel])
    }

    fn past_input(&self, lag: usize, channel: usize) -> f64 {
        self.inputs
            .get(self.orders.d + lag - 1)
            .map_or(0.0, |v| v[channel])
    }

    /// Regressor for regression `idx` built from the current history
    fn regressor(&self, idx: usize) -> DVector<f64> {
        let o = self.orders;
        match self.decomposition {
            Decomposition::Mimo => {
                let mut phi = DVector::zeros(o.parameter_rows());
                for j in 0..o.ny {
                    for i in 1..=o.na {
                        phi[j * o.na + i - 1] = -self.past_output(i, j);
                    }
                }
                let offset = o.na * o.ny;
                for l in 0..o.nu {
                    for i in 1..=o.nb {
                        phi[offset + l * o.nb + i - 1] = self.past_input(i, l);
                    }
                }
                phi
            }
            Decomposition::Miso => {
                let mut phi = DVector::zeros(o.na + o.nb * o.nu);
                for i in 1..=o.na {
                    phi[i - 1] = -self.past_output(i, idx);
                }
                for l in 0..o.nu {
                    for i in 1..=o.nb {
                        phi[o.na + l * o.nb + i - 1] = self.past_input(i, l);
                    }
                }
                phi
            }
        }
    }

    /// `A_k` (`ny x ny`) for `k` in `1..=na`
    pub fn a(&self, k: usize) -> Result<DMatrix<f64>, SysIdError> {
        let o = self.orders;
        check_lag(k, o.na)?;
        let mut a = DMatrix::zeros(o.ny, o.ny);
        match self.decomposition {
            Decomposition::Mimo => {
                let theta = &self.regressions[0].theta;
                for r in 0..o.ny {
                    for j in 0..o.ny {
                        a[(r, j)] = theta[(j * o.na + k - 1, r)];
                    }
                }
            }
            Decomposition::Miso => {
                for r in 0..o.ny {
                    a[(r, r)] = self.regressions[r].theta[(k - 1, 0)];
                }
            }
        }
        Ok(a)
    }

    /// `B_k` (`ny x nu`) for `k` in `1..=nb`
    pub fn b(&self, k: usize) -> Result<DMatrix<f64>, SysIdError> {
        let o = self.orders;
        check_lag(k, o.nb)?;
        let mut b = DMatrix::zeros(o.ny, o.nu);
        match self.decomposition {
            Decomposition::Mimo => {
                let theta = &self.regressions[0].theta;
                let offset = o.na * o.ny;
                for r in 0..o.ny {
                    for l in 0..o.nu {
                        b[(r, l)] = theta[(offset + l * o.nb + k - 1, r)];
                    }
                }
            }
            Decomposition::Miso => {
                for r in 0..o.ny {
                    let theta = &self.regressions[r].theta;
                    for l in 0..o.nu {
                        b[(r, l)] = theta[(o.na + l * o.nb + k - 1, 0)];
                    }
                }
            }
        }
        Ok(b)
    }

    /// Full parameter matrix in the stacked MIMO layout
    pub fn theta(&self) -> DMatrix<f64> {
        let o = self.orders;
        match self.decomposition {
            Decomposition::Mimo => self.regressions[0].theta.clone(),
            Decomposition::Miso => {
                let mut theta = DMatrix::zeros(o.parameter_rows(), o.ny);
                let offset = o.na * o.ny;
                for (r, state) in self.regressions.iter().enumerate() {
                    for i in 0..o.na {
                        theta[(r * o.na + i, r)] = state.theta[(i, 0)];
                    }
                    for i in 0..(o.nb * o.nu) {
                        theta[(offset + i, r)] = state.theta[(o.na + i, 0)];
                    }
                }
                theta
            }
        }
    }

    /// Per-regression states: one for MIMO, `ny` for MISO
    pub fn regressions(&self) -> &[RegressionState] {
        &self.regressions
    }

    /// Replace the per-regression states, keeping history and sample count
    pub fn restore(&mut self, states: Vec<RegressionState>) -> Result<(), SysIdError> {
        if states.len() != self.regressions.len() {
            return Err(SysIdError::DimensionMismatch {
                what: "regressions",
                expected: self.regressions.len(),
                actual: states.len(),
            });
        }
        for (current, new) in self.regressions.iter().zip(&states) {
            if current.theta.shape() != new.theta.shape()
                || current.covariance.shape() != new.covariance.shape()
                || current.regressor.len() != new.regressor.len()
            {
                return Err(SysIdError::DimensionMismatch {
                    what: "regression state",
                    expected: current.theta.nrows(),
                    actual: new.theta.nrows(),
                });
            }
        }
        self.regressions = states;
        Ok(())
    }

    pub fn snapshot(&self) -> ArxSnapshot {
        let o = self.orders;
        // lags are in range by construction
        let a = (1..=o.na)
            .filter_map(|k| self.a(k).ok())
            .collect::<Vec<_>>();
        let b = (1..=o.nb)
            .filter_map(|k| self.b(k).ok())
            .collect::<Vec<_>>();
        ArxSnapshot { orders: o, a, b }
    }
}
