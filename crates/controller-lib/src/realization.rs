//! State-space realization of identified ARX models
//!
//! Realizations are rebuilt from an `ArxSnapshot` whenever needed and are
//! never mutated. Only single-channel models (`ny <= 1`, `nu <= 1`) are
//! supported; multi-output systems must be split per output first.
//!
//! For `y(k) + a_1 y(k-1) + ... = b_1 u(k-d-1) + ...` the controllable
//! canonical form has `nx = max(na, nb + d)` states:
//!
//! ```text
//!     | 0    1    0   ...  0   |        | 0 |
//! A = | ...            ...     |    B = | . |    C = [.. b_nb .. b_1  0 .. 0]
//!     | 0    0    0   ...  1   |        | 0 |                         \-d-/
//!     | -a_nx         ... -a_1 |        | 1 |
//! ```
//!
//! and the observable form is its dual `(A^T, C^T, B^T, D^T)`.

use crate::sysid::ArxSnapshot;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum RealizationError {
    #[error("realization supports single-channel models only, got ny={ny} nu={nu}")]
    MultiChannel { ny: usize, nu: usize },

    #[error("snapshot contains non-finite coefficients")]
    NonFinite,
}

/// Canonical form to realize
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Realization {
    #[default]
    Controllable,
    Observable,
}

/// Discrete-time linear model `x(k+1) = A x(k) + B u(k)`, `y(k) = C x(k) + D u(k)`
#[derive(Debug, Clone, PartialEq)]
pub struct StateSpaceModel {
    pub a: DMatrix<f64>,
    pub b: DMatrix<f64>,
    pub c: DMatrix<f64>,
    pub d: DMatrix<f64>,
}

impl StateSpaceModel {
    pub fn state_dim(&self) -> usize {
        self.a.nrows()
    }

    pub fn input_dim(&self) -> usize {
        self.b.ncols()
    }

    pub fn output_dim(&self) -> usize {
        self.c.nrows()
    }

    /// One step: returns `(x(k+1), y(k))`
    pub fn step(&self, x: &DVector<f64>, u: &DVector<f64>) -> (DVector<f64>, DVector<f64>) {
        let y = &self.c * x + &self.d * u;
        let next = &self.a * x + &self.b * u;
        (next, y)
    }

    /// Output sequence for `inputs` starting from state `x0`
    pub fn simulate(&self, x0: &DVector<f64>, inputs: &[DVector<f64>]) -> Vec<DVector<f64>> {
        let mut x = x0.clone();
        inputs
            .iter()
            .map(|u| {
                let (next, y) = self.step(&x, u);
                x = next;
                y
            })
            .collect()
    }

    /// The dual system `(A^T, C^T, B^T, D^T)`
    pub fn dual(&self) -> Self {
        Self {
            a: self.a.transpose(),
            b: self.c.transpose(),
            c: self.b.transpose(),
            d: self.d.transpose(),
        }
    }
}

/// Number of states of the canonical realizations of `snapshot`
pub fn state_dimension(snapshot: &ArxSnapshot) -> usize {
    let o = snapshot.orders;
    o.na.max(o.nb + o.d)
}

/// Scalar ARX coefficients padded to the state dimension: `(a_1..a_n, b~_1..b~_n)`
/// where `b~_m = b_(m-d)` and missing lags are zero.
fn padded_coefficients(snapshot: &ArxSnapshot) -> (Vec<f64>, Vec<f64>) {
    let o = snapshot.orders;
    let n = state_dimension(snapshot);
    let mut a = vec![0.0; n];
    let mut b = vec![0.0; n];
    for (i, m) in snapshot.a.iter().enumerate() {
        a[i] = m[(0, 0)];
    }
    for (i, m) in snapshot.b.iter().enumerate() {
        b[o.d + i] = m[(0, 0)];
    }
    (a, b)
}

fn check_single_channel(snapshot: &ArxSnapshot) -> Result<(), RealizationError> {
    let o = snapshot.orders;
    if !o.is_single_channel() {
        return Err(RealizationError::MultiChannel { ny: o.ny, nu: o.nu });
    }
    let finite = snapshot
        .a
        .iter()
        .chain(snapshot.b.iter())
        .all(|m| m.iter().all(|v| v.is_finite()));
    if !finite {
        return Err(RealizationError::NonFinite);
    }
    Ok(())
}

/// Realize `snapshot` in the requested canonical form
pub fn realize(
    snapshot: &ArxSnapshot,
    form: Realization,
) -> Result<StateSpaceModel, RealizationError> {
    check_single_channel(snapshot)?;
    let o = snapshot.orders;
    let n = state_dimension(snapshot);
    let (ny, nu) = (o.ny, o.nu);

    let mut a = DMatrix::zeros(n, n);
    let mut b = DMatrix::zeros(n, nu);
    let mut c = DMatrix::zeros(ny, n);
    let d = DMatrix::zeros(ny, nu);

    if n > 0 {
        let (coef_a, coef_b) = padded_coefficients(snapshot);
        for i in 0..n - 1 {
            a[(i, i + 1)] = 1.0;
        }
        for (i, value) in coef_a.iter().enumerate() {
            a[(n - 1, n - 1 - i)] = -value;
        }
        b[(n - 1, 0)] = 1.0;
        for (m, value) in coef_b.iter().enumerate() {
            c[(0, n - 1 - m)] = *value;
        }
    }

    let controllable = StateSpaceModel { a, b, c, d };
    Ok(match form {
        Realization::Controllable => controllable,
        Realization::Observable => controllable.dual(),
    })
}

/// State of the observable realization at time `k`, reconstructed from history.
///
/// `outputs[i]` is `y(k-1-i)` and `inputs[i]` is `u(k-1-i)`; missing entries
/// count as zero. The last state component equals the model's prediction of
/// `y(k)`.
pub fn observable_state(
    snapshot: &ArxSnapshot,
    outputs: &[f64],
    inputs: &[f64],
) -> Result<DVector<f64>, RealizationError> {
    check_single_channel(snapshot)?;
    let n = state_dimension(snapshot);
    let (coef_a, coef_b) = padded_coefficients(snapshot);
    let past = |series: &[f64], lag: usize| series.get(lag - 1).copied().unwrap_or(0.0);

    let mut x = DVector::zeros(n);
    for j in 0..n {
        let mut value = 0.0;
        for m in 1..=(j + 1) {
            let idx = n - 1 - j + m;
            value += -coef_a[idx - 1] * past(outputs, m) + coef_b[idx - 1] * past(inputs, m);
        }
        x[j] = value;
    }
    Ok(x)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sysid::ArxOrders;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn snapshot(a: &[f64], b: &[f64], d: usize) -> ArxSnapshot {
        let orders = ArxOrders::siso(a.len(), b.len(), d).unwrap();
        ArxSnapshot::from_coefficients(
            orders,
            a.iter().map(|v| DMatrix::from_element(1, 1, *v)).collect(),
            b.iter().map(|v| DMatrix::from_element(1, 1, *v)).collect(),
        )
        .unwrap()
    }

    /// Direct evaluation of the difference equation from rest
    fn arx_response(a: &[f64], b: &[f64], d: usize, u: &[f64]) -> Vec<f64> {
        let mut y = vec![0.0; u.len()];
        for k in 0..u.len() {
            let mut value = 0.0;
            for (i, ai) in a.iter().enumerate() {
                if k > i {
                    value -= ai * y[k - 1 - i];
                }
            }
            for (i, bi) in b.iter().enumerate() {
                if k > d + i {
                    value += bi * u[k - 1 - d - i];
                }
            }
            y[k] = value;
        }
        y
    }

    fn assert_reproduces(a: &[f64], b: &[f64], d: usize, form: Realization, seed: u64) {
        let model = realize(&snapshot(a, b, d), form).unwrap();
        let mut rng = StdRng::seed_from_u64(seed);
        for _ in 0..100 {
            let u: Vec<f64> = (0..60).map(|_| rng.gen_range(-1.0..1.0)).collect();
            let expected = arx_response(a, b, d, &u);
            let inputs: Vec<DVector<f64>> =
                u.iter().map(|v| DVector::from_element(1, *v)).collect();
            let x0 = DVector::zeros(model.state_dim());
            let outputs = model.simulate(&x0, &inputs);
            for (y, e) in outputs.iter().zip(&expected) {
                let err = (y[0] - e).abs();
                assert!(err <= 1e-9 * e.abs().max(1.0), "{:?}: {} vs {}", form, y[0], e);
            }
        }
    }

    #[test]
    fn test_controllable_form_reproduces_arx() {
        assert_reproduces(&[-0.9, 0.2], &[0.5, 0.3], 0, Realization::Controllable, 1);
    }

    #[test]
    fn test_observable_form_reproduces_arx() {
        assert_reproduces(&[-0.9, 0.2], &[0.5, 0.3], 0, Realization::Observable, 2);
    }

    #[test]
    fn test_forms_reproduce_delayed_and_unbalanced_models() {
        assert_reproduces(&[-1.1, 0.3, -0.05], &[0.7], 1, Realization::Controllable, 3);
        assert_reproduces(&[0.4], &[0.2, 0.1], 2, Realization::Observable, 4);
    }

    #[test]
    fn test_controllable_structure() {
        let model = realize(&snapshot(&[-0.9, 0.2], &[0.5, 0.3], 0), Realization::Controllable)
            .unwrap();
        assert_eq!(
            model.a,
            DMatrix::from_row_slice(2, 2, &[0.0, 1.0, -0.2, 0.9])
        );
        assert_eq!(model.b, DMatrix::from_row_slice(2, 1, &[0.0, 1.0]));
        assert_eq!(model.c, DMatrix::from_row_slice(1, 2, &[0.3, 0.5]));
        assert_eq!(model.d, DMatrix::zeros(1, 1));
    }

    #[test]
    fn test_observable_is_transpose_dual() {
        let snap = snapshot(&[-0.9, 0.2], &[0.5, 0.3], 0);
        let ctrl = realize(&snap, Realization::Controllable).unwrap();
        let obs = realize(&snap, Realization::Observable).unwrap();
        assert_eq!(obs.a, ctrl.a.transpose());
        assert_eq!(obs.b, ctrl.c.transpose());
        assert_eq!(obs.c, ctrl.b.transpose());
    }

    #[test]
    fn test_multi_channel_rejected() {
        let orders = ArxOrders::new(1, 1, 0, 2, 1).unwrap();
        let snap = ArxSnapshot::from_coefficients(
            orders,
            vec![DMatrix::zeros(2, 2)],
            vec![DMatrix::zeros(2, 1)],
        )
        .unwrap();
        assert_eq!(
            realize(&snap, Realization::Controllable).unwrap_err(),
            RealizationError::MultiChannel { ny: 2, nu: 1 }
        );
    }

    #[test]
    fn test_observable_state_matches_simulation() {
        let (a, b, d) = ([-0.9, 0.2, 0.01], [0.5, 0.3], 1);
        let snap = snapshot(&a, &b, d);
        let model = realize(&snap, Realization::Observable).unwrap();
        let mut rng = StdRng::seed_from_u64(17);

        let mut x = DVector::zeros(model.state_dim());
        let mut ys: Vec<f64> = Vec::new();
        let mut us: Vec<f64> = Vec::new();
        for _ in 0..40 {
            let u = rng.gen_range(-1.0..1.0);
            let (next, y) = model.step(&x, &DVector::from_element(1, u));
            ys.insert(0, y[0]);
            us.insert(0, u);
            x = next;

            let reconstructed = observable_state(&snap, &ys, &us).unwrap();
            assert!((&reconstructed - &x).abs().max() < 1e-9);
        }
    }
}
