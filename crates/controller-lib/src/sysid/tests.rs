//! Identification tests against synthetic ARX systems

use super::*;
use nalgebra::{DMatrix, DVector};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::sync::{Arc, Mutex};

/// Simulate `y(k) = -sum A_i y(k-i) + sum B_i u(k-d-i)` from zero initial conditions
fn simulate(snapshot: &ArxSnapshot, inputs: &[DVector<f64>]) -> Vec<DVector<f64>> {
    let o = snapshot.orders;
    let mut outputs: Vec<DVector<f64>> = Vec::with_capacity(inputs.len());
    for k in 0..inputs.len() {
        let mut y = DVector::zeros(o.ny);
        for i in 1..=o.na {
            if k >= i {
                y -= &snapshot.a[i - 1] * &outputs[k - i];
            }
        }
        for i in 1..=o.nb {
            if k >= o.d + i {
                y += &snapshot.b[i - 1] * &inputs[k - o.d - i];
            }
        }
        outputs.push(y);
    }
    outputs
}

fn random_inputs(rng: &mut StdRng, n: usize, nu: usize) -> Vec<DVector<f64>> {
    (0..n)
        .map(|_| DVector::from_fn(nu, |_, _| rng.gen_range(-1.0..1.0)))
        .collect()
}

fn exact_strategy(orders: ArxOrders, decomposition: Decomposition) -> ArxStrategy {
    ArxStrategy::new(orders, decomposition, || {
        Box::new(RlsForgettingFactor::new(1.0))
    })
    .unwrap()
    .with_initial_covariance(1e6)
}

fn feed(strategy: &mut ArxStrategy, inputs: &[DVector<f64>], outputs: &[DVector<f64>]) {
    for (u, y) in inputs.iter().zip(outputs) {
        strategy.estimate(y.as_slice(), u.as_slice()).unwrap();
    }
}

fn assert_close(actual: &DMatrix<f64>, expected: &DMatrix<f64>, tol: f64) {
    assert_eq!(actual.shape(), expected.shape());
    let diff = (actual - expected).abs().max();
    assert!(diff < tol, "max difference {} in\n{}\nvs\n{}", diff, actual, expected);
}

fn siso_system(d: usize) -> ArxSnapshot {
    let orders = ArxOrders::siso(2, 2, d).unwrap();
    ArxSnapshot::from_coefficients(
        orders,
        vec![
            DMatrix::from_element(1, 1, -0.9),
            DMatrix::from_element(1, 1, 0.2),
        ],
        vec![
            DMatrix::from_element(1, 1, 0.5),
            DMatrix::from_element(1, 1, 0.3),
        ],
    )
    .unwrap()
}

#[test]
fn test_siso_arx22_round_trip() {
    let system = siso_system(0);
    let mut rng = StdRng::seed_from_u64(42);
    let inputs = random_inputs(&mut rng, 400, 1);
    let outputs = simulate(&system, &inputs);

    let mut strategy = exact_strategy(system.orders, Decomposition::Mimo);
    feed(&mut strategy, &inputs, &outputs);

    for k in 1..=2 {
        assert_close(&strategy.a(k).unwrap(), system.a(k).unwrap(), 1e-4);
        assert_close(&strategy.b(k).unwrap(), system.b(k).unwrap(), 1e-4);
    }
}

#[test]
fn test_siso_round_trip_with_delay() {
    let system = siso_system(2);
    let mut rng = StdRng::seed_from_u64(3);
    let inputs = random_inputs(&mut rng, 400, 1);
    let outputs = simulate(&system, &inputs);

    let mut strategy = exact_strategy(system.orders, Decomposition::Mimo);
    feed(&mut strategy, &inputs, &outputs);

    let snapshot = strategy.snapshot();
    for k in 1..=2 {
        assert_close(&snapshot.a[k - 1], &system.a[k - 1], 1e-4);
        assert_close(&snapshot.b[k - 1], &system.b[k - 1], 1e-4);
    }
}

fn mimo_system() -> ArxSnapshot {
    let orders = ArxOrders::new(2, 2, 0, 2, 2).unwrap();
    ArxSnapshot::from_coefficients(
        orders,
        vec![
            DMatrix::from_row_slice(2, 2, &[-0.5, 0.1, 0.05, -0.4]),
            DMatrix::from_row_slice(2, 2, &[0.06, 0.0, 0.0, 0.04]),
        ],
        vec![
            DMatrix::from_row_slice(2, 2, &[1.0, 0.2, 0.0, 0.5]),
            DMatrix::from_row_slice(2, 2, &[0.3, 0.0, 0.1, 0.2]),
        ],
    )
    .unwrap()
}

#[test]
fn test_mimo_arx22_round_trip() {
    let system = mimo_system();
    let mut rng = StdRng::seed_from_u64(7);
    let inputs = random_inputs(&mut rng, 600, 2);
    let outputs = simulate(&system, &inputs);

    let mut strategy = exact_strategy(system.orders, Decomposition::Mimo);
    feed(&mut strategy, &inputs, &outputs);

    for k in 1..=2 {
        assert_close(&strategy.a(k).unwrap(), &system.a[k - 1], 1e-4);
        assert_close(&strategy.b(k).unwrap(), &system.b[k - 1], 1e-4);
    }
}

#[test]
fn test_mimo_parameter_layout() {
    let system = mimo_system();
    let mut rng = StdRng::seed_from_u64(8);
    let inputs = random_inputs(&mut rng, 600, 2);
    let outputs = simulate(&system, &inputs);

    let mut strategy = exact_strategy(system.orders, Decomposition::Mimo);
    feed(&mut strategy, &inputs, &outputs);

    // row j*na + k-1 holds lag k of output j, column r is the predicted output
    let theta = strategy.theta();
    assert_eq!(theta.shape(), (8, 2));
    assert!((theta[(2, 0)] - system.a[0][(0, 1)]).abs() < 1e-4);
    assert!((theta[(1, 1)] - system.a[1][(1, 0)]).abs() < 1e-4);
    // row na*ny + l*nb + k-1 holds lag k of input l
    assert!((theta[(4 + 2, 0)] - system.b[0][(0, 1)]).abs() < 1e-4);
    assert!((theta[(4 + 1, 1)] - system.b[1][(1, 0)]).abs() < 1e-4);
}

#[test]
fn test_miso_round_trip_and_assembly() {
    let orders = ArxOrders::new(2, 2, 0, 2, 2).unwrap();
    let system = ArxSnapshot::from_coefficients(
        orders,
        vec![
            DMatrix::from_diagonal(&DVector::from_vec(vec![-0.5, -0.3])),
            DMatrix::from_diagonal(&DVector::from_vec(vec![0.06, 0.02])),
        ],
        vec![
            DMatrix::from_row_slice(2, 2, &[1.0, 0.2, 0.4, 0.5]),
            DMatrix::from_row_slice(2, 2, &[0.3, -0.1, 0.1, 0.2]),
        ],
    )
    .unwrap();
    let mut rng = StdRng::seed_from_u64(9);
    let inputs = random_inputs(&mut rng, 500, 2);
    let outputs = simulate(&system, &inputs);

    let mut miso = exact_strategy(orders, Decomposition::Miso);
    feed(&mut miso, &inputs, &outputs);
    assert_eq!(miso.regressions().len(), 2);

    for k in 1..=2 {
        assert_close(&miso.a(k).unwrap(), &system.a[k - 1], 1e-4);
        assert_close(&miso.b(k).unwrap(), &system.b[k - 1], 1e-4);
    }

    let mut mimo = exact_strategy(orders, Decomposition::Mimo);
    feed(&mut mimo, &inputs, &outputs);
    assert_close(&miso.theta(), &mimo.theta(), 1e-4);
}

#[test]
fn test_readiness_threshold() {
    let orders = ArxOrders::siso(2, 2, 1).unwrap();
    let mut strategy = exact_strategy(orders, Decomposition::Mimo);
    for k in 0..5 {
        assert!(!strategy.is_ready(), "ready after {} samples", k);
        strategy.estimate(&[k as f64], &[1.0]).unwrap();
    }
    assert!(strategy.is_ready());
    strategy.reset();
    assert!(!strategy.is_ready());
    assert_eq!(strategy.count(), 0);
}

#[test]
fn test_lag_out_of_range() {
    let strategy = exact_strategy(ArxOrders::siso(2, 1, 0).unwrap(), Decomposition::Mimo);
    assert_eq!(
        strategy.a(0).unwrap_err(),
        SysIdError::LagOutOfRange { lag: 0, max: 2 }
    );
    assert!(strategy.a(3).is_err());
    assert!(strategy.b(2).is_err());
    assert!(strategy.b(1).is_ok());
}

#[test]
fn test_rejects_bad_samples_without_state_change() {
    let mut strategy = exact_strategy(ArxOrders::siso(1, 1, 0).unwrap(), Decomposition::Mimo);
    assert!(matches!(
        strategy.estimate(&[1.0, 2.0], &[1.0]),
        Err(SysIdError::DimensionMismatch { .. })
    ));
    assert_eq!(
        strategy.estimate(&[f64::NAN], &[1.0]),
        Err(SysIdError::NonFiniteInput("output"))
    );
    assert_eq!(strategy.count(), 0);
}

/// Records the parameter matrix it is handed before delegating to RLS
struct SpyUpdate {
    seen: Arc<Mutex<Vec<DMatrix<f64>>>>,
    inner: RlsForgettingFactor,
}

impl ParameterUpdate for SpyUpdate {
    fn update(
        &mut self,
        y: &DVector<f64>,
        phi: &DVector<f64>,
        theta: &mut DMatrix<f64>,
        covariance: &mut DMatrix<f64>,
    ) -> Result<DVector<f64>, SysIdError> {
        self.seen.lock().unwrap().push(theta.clone());
        self.inner.update(y, phi, theta, covariance)
    }
}

#[test]
fn test_covariance_bound_resets_before_update() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let spy = seen.clone();
    let orders = ArxOrders::siso(2, 2, 0).unwrap();
    let mut strategy = ArxStrategy::new(orders, Decomposition::Mimo, move || {
        Box::new(SpyUpdate {
            seen: spy.clone(),
            inner: RlsForgettingFactor::new(1.0),
        })
    })
    .unwrap()
    .with_heuristics(ResetHeuristics::default().with_max_covariance(1e8));

    let system = siso_system(0);
    let mut rng = StdRng::seed_from_u64(5);
    let inputs = random_inputs(&mut rng, 20, 1);
    let outputs = simulate(&system, &inputs);
    feed(&mut strategy, &inputs, &outputs);
    assert!(strategy.theta().iter().any(|v| *v != 0.0));

    let mut states = strategy.regressions().to_vec();
    states[0].covariance[(0, 1)] = 1e9;
    strategy.restore(states).unwrap();
    seen.lock().unwrap().clear();

    strategy.estimate(&[0.5], &[0.1]).unwrap();

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert!(seen[0].iter().all(|v| *v == 0.0));
    assert_eq!(strategy.count(), 1);
    assert_eq!(strategy.reset_count(), 1);
}

struct ExplodingUpdate;

impl ParameterUpdate for ExplodingUpdate {
    fn update(
        &mut self,
        y: &DVector<f64>,
        _phi: &DVector<f64>,
        theta: &mut DMatrix<f64>,
        _covariance: &mut DMatrix<f64>,
    ) -> Result<DVector<f64>, SysIdError> {
        theta.fill(f64::NAN);
        Ok(y.clone())
    }
}

#[test]
fn test_non_finite_estimate_resets() {
    let orders = ArxOrders::siso(1, 1, 0).unwrap();
    let mut strategy =
        ArxStrategy::new(orders, Decomposition::Mimo, || Box::new(ExplodingUpdate)).unwrap();

    let err = strategy.estimate(&[1.0], &[1.0]).unwrap_err();
    assert!(matches!(err, SysIdError::Divergence(_)));
    assert!(strategy.theta().iter().all(|v| *v == 0.0));
    assert_eq!(strategy.count(), 0);
    assert_eq!(strategy.reset_count(), 1);
}

#[test]
fn test_config_builds_strategy() {
    let config: ArxConfig = serde_json::from_str(
        r#"{
            "orders": {"na": 2, "nb": 1},
            "decomposition": "miso",
            "update": {"kind": "park1991", "lambda_min": 0.9, "sensitivity": 5.0},
            "heuristics": {"max_covariance": 1e9}
        }"#,
    )
    .unwrap();
    assert_eq!(config.orders.ny, 1);
    assert_eq!(config.initial_covariance, 1e4);

    let strategy = config.build().unwrap();
    assert_eq!(strategy.decomposition(), Decomposition::Miso);
    assert_eq!(strategy.regressions()[0].covariance[(0, 0)], 1e4);
}

#[test]
fn test_invalid_orders() {
    assert!(ArxOrders::new(0, 0, 0, 1, 1).is_err());
    assert!(ArxOrders::new(1, 1, 0, 0, 1).is_err());
}
