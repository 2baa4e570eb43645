//! Recursive least-squares update rules

use super::{ParameterUpdate, SysIdError};
use nalgebra::{DMatrix, DVector};

/// Shared RLS step with forgetting factor `lambda`.
///
/// Returns the a-priori prediction and the a-priori error.
fn rls_step(
    lambda: f64,
    y: &DVector<f64>,
    phi: &DVector<f64>,
    theta: &mut DMatrix<f64>,
    covariance: &mut DMatrix<f64>,
) -> Result<(DVector<f64>, DVector<f64>), SysIdError> {
    let n = phi.len();
    if theta.nrows() != n || covariance.nrows() != n || covariance.ncols() != n {
        return Err(SysIdError::DimensionMismatch {
            what: "regressor",
            expected: theta.nrows(),
            actual: n,
        });
    }
    if theta.ncols() != y.len() {
        return Err(SysIdError::DimensionMismatch {
            what: "output",
            expected: theta.ncols(),
            actual: y.len(),
        });
    }

    let prediction = theta.transpose() * phi;
    let error = y - &prediction;

    let p_phi = &*covariance * phi;
    let denom = lambda + phi.dot(&p_phi);
    if !denom.is_finite() || denom <= 0.0 {
        return Err(SysIdError::Divergence(format!(
            "non-positive gain denominator {}",
            denom
        )));
    }
    let gain = &p_phi / denom;

    *theta += &gain * error.transpose();
    let updated = (&*covariance - &gain * p_phi.transpose()) / lambda;
    // keep the covariance numerically symmetric
    *covariance = (&updated + updated.transpose()) * 0.5;

    Ok((prediction, error))
}

/// RLS with a constant exponential forgetting factor
#[derive(Debug, Clone)]
pub struct RlsForgettingFactor {
    lambda: f64,
}

impl RlsForgettingFactor {
    pub fn new(lambda: f64) -> Self {
        Self {
            lambda: lambda.clamp(f64::EPSILON, 1.0),
        }
    }

    pub fn lambda(&self) -> f64 {
        self.lambda
    }
}

impl Default for RlsForgettingFactor {
    fn default() -> Self {
        Self::new(0.98)
    }
}

impl ParameterUpdate for RlsForgettingFactor {
    fn update(
        &mut self,
        y: &DVector<f64>,
        phi: &DVector<f64>,
        theta: &mut DMatrix<f64>,
        covariance: &mut DMatrix<f64>,
    ) -> Result<DVector<f64>, SysIdError> {
        rls_step(self.lambda, y, phi, theta, covariance).map(|(prediction, _)| prediction)
    }
}

/// RLS with the variable forgetting factor of Park et al. (1991).
///
/// The factor used for a step is derived from the previous a-priori error:
/// `lambda = lambda_min + (1 - lambda_min) * 2^(-round(sensitivity * e^2))`,
/// so large errors forget quickly and small errors approach `lambda = 1`.
#[derive(Debug, Clone)]
pub struct RlsPark1991 {
    lambda_min: f64,
    sensitivity: f64,
    lambda: f64,
}

impl RlsPark1991 {
    pub fn new(lambda_min: f64, sensitivity: f64) -> Self {
        Self {
            lambda_min: lambda_min.clamp(f64::EPSILON, 1.0),
            sensitivity: sensitivity.max(0.0),
            lambda: 1.0,
        }
    }

    /// Forgetting factor that will be used by the next update
    pub fn lambda(&self) -> f64 {
        self.lambda
    }

    fn next_lambda(&self, squared_error: f64) -> f64 {
        let exponent = (self.sensitivity * squared_error).round();
        self.lambda_min + (1.0 - self.lambda_min) * 2f64.powf(-exponent)
    }
}

impl ParameterUpdate for RlsPark1991 {
    fn update(
        &mut self,
        y: &DVector<f64>,
        phi: &DVector<f64>,
        theta: &mut DMatrix<f64>,
        covariance: &mut DMatrix<f64>,
    ) -> Result<DVector<f64>, SysIdError> {
        let (prediction, error) = rls_step(self.lambda, y, phi, theta, covariance)?;
        self.lambda = self.next_lambda(error.norm_squared());
        Ok(prediction)
    }

    fn reset(&mut self) {
        self.lambda = 1.0;
    }
}
