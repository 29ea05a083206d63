//! # Survey-Weighted Logistic Regression
//!
//! Quasi-binomial IRLS with a logit link. Survey weights enter the working
//! weights; the coefficient covariance is the linearization sandwich
//! `A^-1 V(U) A^-1`, where `A = X'WX` and `V(U)` is the design variance of the
//! estimating-function totals.

use crate::design::{DesignError, SurveyDesign};
use crate::matrix::{min_equilibrated_eigenvalue, symmetrize, weighted_crossprod};
use crate::model::{FittedModel, ModelMatrix};
use crate::types::{Coefficients, PROB_EPS, inverse_logit, logit};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, Zip};
use ndarray_linalg::error::LinalgError;
use ndarray_linalg::{InverseC, SolveC};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Convergence controls for [`fit`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FitOptions {
    pub max_iterations: usize,
    /// Relative change `|b_new - b_old|_inf / (|b_old|_inf + 0.1)` that counts as converged.
    pub tolerance: f64,
    /// Smallest eigenvalue of the unit-diagonal information matrix accepted as non-singular.
    pub singular_tolerance: f64,
    pub max_step_halvings: usize,
}

impl Default for FitOptions {
    fn default() -> Self {
        Self {
            max_iterations: 25,
            tolerance: 1e-8,
            singular_tolerance: 1e-10,
            max_step_halvings: 10,
        }
    }
}

#[derive(Error, Debug)]
pub enum FitError {
    #[error(
        "Dimension mismatch: the design has {design} observations, the model matrix {matrix} rows and the outcome {outcome} values."
    )]
    DimensionMismatch {
        design: usize,
        matrix: usize,
        outcome: usize,
    },

    #[error("Outcome at row {row} must be 0 or 1, found {value}.")]
    InvalidOutcome { row: usize, value: f64 },

    #[error("Model matrix entry at row {row}, column '{column}' is not finite.")]
    NonFiniteInput { row: usize, column: String },

    #[error("{observations} observations cannot support {parameters} parameters.")]
    TooFewObservations {
        observations: usize,
        parameters: usize,
    },

    #[error(
        "The weighted information matrix is singular (smallest equilibrated eigenvalue {min_eigenvalue:.3e}). Some model columns are collinear or an outcome class is absent."
    )]
    SingularMatrix { min_eigenvalue: f64 },

    #[error("IRLS did not converge within {iterations} iterations (last relative change {last_change:.3e}).")]
    NonConvergence { iterations: usize, last_change: f64 },

    #[error("Survey variance could not be computed: {0}")]
    Design(#[from] DesignError),

    #[error("Linear algebra failure: {0}")]
    Linalg(#[from] LinalgError),
}

/// Fits a survey-weighted quasi-binomial logistic regression.
///
/// `design` supplies the weights and PSU structure for exactly the rows of
/// `model_matrix`; for a subpopulation pass a [`SurveyDesign::domain`].
pub fn fit(
    design: &SurveyDesign,
    model_matrix: &ModelMatrix,
    outcome: ArrayView1<f64>,
    options: &FitOptions,
) -> Result<FittedModel, FitError> {
    let x = model_matrix.matrix();
    let n = x.nrows();
    let p = x.ncols();
    if design.num_observations() != n || outcome.len() != n {
        return Err(FitError::DimensionMismatch {
            design: design.num_observations(),
            matrix: n,
            outcome: outcome.len(),
        });
    }
    if let Some((row, &value)) = outcome
        .iter()
        .enumerate()
        .find(|(_, y)| **y != 0.0 && **y != 1.0)
    {
        return Err(FitError::InvalidOutcome { row, value });
    }
    if let Some(((row, column), _)) = x.indexed_iter().find(|(_, v)| !v.is_finite()) {
        return Err(FitError::NonFiniteInput {
            row,
            column: model_matrix.layout().column_names[column].clone(),
        });
    }
    if n <= p {
        return Err(FitError::TooFewObservations {
            observations: n,
            parameters: p,
        });
    }

    let weights = design.weights();
    let mut mu: Array1<f64> = outcome.mapv(|y| (y + 0.5) / 2.0);
    let mut eta: Array1<f64> = mu.mapv(logit);
    let mut deviance = internal::binomial_deviance(outcome, mu.view(), weights);
    let mut beta: Option<Array1<f64>> = None;
    let mut last_change = f64::INFINITY;
    let mut iterations = 0;
    let mut converged = false;

    for iter in 1..=options.max_iterations {
        iterations = iter;
        let variance = mu.mapv(|m| m * (1.0 - m));
        let working_weights = &weights * &variance;
        let z = &eta + &((&outcome - &mu) / &variance);

        let information = weighted_crossprod(x, working_weights.view());
        internal::check_singular(information.view(), options.singular_tolerance)?;
        let rhs = x.t().dot(&(&working_weights * &z));
        let mut beta_new = information.solvec(&rhs)?;

        let mut eta_new = x.dot(&beta_new);
        let mut mu_new = eta_new.mapv(inverse_logit);
        let mut deviance_new = internal::binomial_deviance(outcome, mu_new.view(), weights);

        if let Some(beta_old) = &beta {
            let mut halvings = 0;
            while (!deviance_new.is_finite() || deviance_new > deviance * (1.0 + 1e-12))
                && halvings < options.max_step_halvings
            {
                halvings += 1;
                beta_new = (&beta_new + beta_old) / 2.0;
                eta_new = x.dot(&beta_new);
                mu_new = eta_new.mapv(inverse_logit);
                deviance_new = internal::binomial_deviance(outcome, mu_new.view(), weights);
            }
            if halvings > 0 {
                log::debug!("IRLS iteration {iter}: step halved {halvings} times");
            }
            if !deviance_new.is_finite() {
                return Err(FitError::NonConvergence {
                    iterations: iter,
                    last_change,
                });
            }
            let denom = beta_old.iter().fold(0.0f64, |m, b| m.max(b.abs())) + 0.1;
            last_change = Zip::from(&beta_new)
                .and(beta_old)
                .fold(0.0f64, |m, new, old| m.max((new - old).abs()))
                / denom;
        }

        log::debug!("IRLS iteration {iter}: deviance {deviance_new:.6}, relative change {last_change:.3e}");
        beta = Some(beta_new);
        eta = eta_new;
        mu = mu_new;
        deviance = deviance_new;

        if last_change < options.tolerance {
            converged = true;
            break;
        }
    }

    let beta = match beta {
        Some(beta) if converged => beta,
        _ => {
            return Err(FitError::NonConvergence {
                iterations,
                last_change,
            });
        }
    };

    let variance = mu.mapv(|m| m * (1.0 - m));
    let working_weights = &weights * &variance;
    let information = weighted_crossprod(x, working_weights.view());
    internal::check_singular(information.view(), options.singular_tolerance)?;
    let bread = information.invc()?;

    let residual_weights = &weights * &(&outcome - &mu);
    let contributions = internal::score_contributions(x, residual_weights.view());
    let meat = design.total_variance(contributions.view())?;
    let covariance = symmetrize(&bread.dot(&meat).dot(&bread));

    let mean_weight = weights.mean().unwrap_or(1.0);
    let dispersion = Zip::from(&outcome)
        .and(&mu)
        .and(&variance)
        .and(&weights)
        .fold(0.0, |acc, &y, &m, &v, &w| acc + (w / mean_weight) * (y - m).powi(2) / v)
        / (n - p) as f64;
    let model_covariance = symmetrize(&(&bread * (dispersion * mean_weight)));

    log::debug!(
        "Fit converged after {iterations} iterations: n = {n}, p = {p}, dispersion {dispersion:.4}"
    );

    Ok(FittedModel {
        coefficients: Coefficients::new(beta),
        covariance,
        model_covariance,
        dispersion,
        deviance,
        iterations,
        converged,
        num_observations: n,
        design_df: design.degrees_of_freedom(),
        layout: model_matrix.layout().clone(),
    })
}

mod internal {
    use super::*;

    /// Weighted binomial deviance `2 sum w [y ln(y/mu) + (1-y) ln((1-y)/(1-mu))]`.
    pub(super) fn binomial_deviance(
        y: ArrayView1<f64>,
        mu: ArrayView1<f64>,
        weights: ArrayView1<f64>,
    ) -> f64 {
        let total = Zip::from(y)
            .and(mu)
            .and(weights)
            .fold(0.0, |acc, &yi, &mui, &wi| {
                let m = mui.clamp(PROB_EPS, 1.0 - PROB_EPS);
                let term = if yi > 0.5 { -m.ln() } else { -(1.0 - m).ln() };
                acc + wi * term
            });
        2.0 * total
    }

    pub(super) fn check_singular(information: ArrayView2<f64>, tolerance: f64) -> Result<(), FitError> {
        let min_eigenvalue = min_equilibrated_eigenvalue(information)?;
        if min_eigenvalue.is_nan() || min_eigenvalue < tolerance {
            return Err(FitError::SingularMatrix { min_eigenvalue });
        }
        Ok(())
    }

    /// Rows `u_i = r_i x_i` of the estimating function.
    pub(super) fn score_contributions(x: ArrayView2<f64>, residual_weights: ArrayView1<f64>) -> Array2<f64> {
        let mut contributions = x.to_owned();
        for (mut row, &r) in contributions.axis_iter_mut(Axis(0)).zip(residual_weights.iter()) {
            row *= r;
        }
        contributions
    }
}
