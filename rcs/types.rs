use ndarray::{Array1, ArrayView1};
use serde::{Deserialize, Serialize};
use std::ops::Deref;

/// Regression coefficients in model-matrix column order.
#[repr(transparent)]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Coefficients(pub Array1<f64>);

impl Coefficients {
    pub fn new(values: Array1<f64>) -> Self {
        Self(values)
    }

    pub fn as_view(&self) -> ArrayView1<'_, f64> {
        self.0.view()
    }
}

impl Deref for Coefficients {
    type Target = Array1<f64>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// The linear predictor `eta = X * beta` on the logit scale.
#[repr(transparent)]
#[derive(Clone, Debug, PartialEq)]
pub struct LinearPredictor(pub Array1<f64>);

impl LinearPredictor {
    pub fn new(values: Array1<f64>) -> Self {
        Self(values)
    }

    /// Fitted probabilities, clamped away from 0 and 1.
    pub fn probabilities(&self) -> Array1<f64> {
        self.0.mapv(inverse_logit)
    }
}

pub(crate) const PROB_EPS: f64 = 1e-10;

pub(crate) fn inverse_logit(eta: f64) -> f64 {
    let clamped = eta.clamp(-700.0, 700.0);
    (1.0 / (1.0 + (-clamped).exp())).clamp(PROB_EPS, 1.0 - PROB_EPS)
}

pub(crate) fn logit(mu: f64) -> f64 {
    let clamped = mu.clamp(PROB_EPS, 1.0 - PROB_EPS);
    (clamped / (1.0 - clamped)).ln()
}
