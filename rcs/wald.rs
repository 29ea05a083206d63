//! Joint Wald tests on groups of coefficients of a [`FittedModel`].

use crate::matrix::{min_equilibrated_eigenvalue, select_square, select_vector};
use crate::model::FittedModel;
use ndarray_linalg::SolveC;
use ndarray_linalg::error::LinalgError;
use serde::{Deserialize, Serialize};
use statrs::distribution::{ChiSquared, ContinuousCDF, FisherSnedecor};
use thiserror::Error;

const SINGULAR_TOLERANCE: f64 = 1e-10;

/// Reference distribution of the Wald statistic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatistic {
    /// `W ~ chi^2(df)`.
    #[default]
    ChiSquared,
    /// `W / df ~ F(df, design_df + 1 - p)`, with `p` the number of model coefficients.
    F,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WaldTest {
    pub statistic: f64,
    pub df: usize,
    /// Present for the F form.
    pub denominator_df: Option<f64>,
    pub p_value: f64,
}

/// A p-value slot in a report.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PValue {
    Value(f64),
    /// The test does not exist for this model (nonlinearity with a one-column basis).
    NotApplicable,
    /// The test exists but could not be computed.
    #[default]
    Missing,
}

impl PValue {
    pub fn value(self) -> Option<f64> {
        match self {
            PValue::Value(p) => Some(p),
            PValue::NotApplicable | PValue::Missing => None,
        }
    }
}

#[derive(Error, Debug)]
pub enum WaldError {
    #[error("Coefficient '{0}' is not part of the fitted model.")]
    UnknownColumn(String),

    #[error("A Wald test needs at least one coefficient.")]
    EmptyTerm,

    #[error(
        "The covariance block of the tested coefficients is singular (smallest equilibrated eigenvalue {min_eigenvalue:.3e})."
    )]
    SingularCovariance { min_eigenvalue: f64 },

    #[error(
        "An F test on a model with {num_coefficients} coefficients needs at least {num_coefficients} design degrees of freedom, but the design has {design_df}."
    )]
    InsufficientDesignDf {
        num_coefficients: usize,
        design_df: usize,
    },

    #[error("Invalid reference distribution: {0}")]
    Distribution(String),

    #[error("Linear algebra failure: {0}")]
    Linalg(#[from] LinalgError),
}

/// Tests `H0: beta[names] = 0` jointly using the design-based covariance.
pub fn wald_test(
    model: &FittedModel,
    names: &[String],
    statistic: TestStatistic,
) -> Result<WaldTest, WaldError> {
    if names.is_empty() {
        return Err(WaldError::EmptyTerm);
    }
    let indices = names
        .iter()
        .map(|name| {
            model
                .layout
                .column_index(name)
                .ok_or_else(|| WaldError::UnknownColumn(name.clone()))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let theta = select_vector(model.coefficients.as_view(), &indices);
    let sigma = select_square(model.covariance.view(), &indices);
    let min_eigenvalue = min_equilibrated_eigenvalue(sigma.view())?;
    if min_eigenvalue.is_nan() || min_eigenvalue < SINGULAR_TOLERANCE {
        return Err(WaldError::SingularCovariance { min_eigenvalue });
    }
    let solved = sigma.solvec(&theta)?;
    let w = theta.dot(&solved);
    let df = indices.len();

    match statistic {
        TestStatistic::ChiSquared => {
            let dist = ChiSquared::new(df as f64)
                .map_err(|e| WaldError::Distribution(e.to_string()))?;
            Ok(WaldTest {
                statistic: w,
                df,
                denominator_df: None,
                p_value: dist.sf(w),
            })
        }
        TestStatistic::F => {
            // Residual df of the fitted model: design df + 1 - p.
            let num_coefficients = model.coefficients.len();
            let residual_df = (model.design_df + 1)
                .checked_sub(num_coefficients)
                .filter(|&d| d > 0)
                .ok_or(WaldError::InsufficientDesignDf {
                    num_coefficients,
                    design_df: model.design_df,
                })?;
            let denominator = residual_df as f64;
            let dist = FisherSnedecor::new(df as f64, denominator)
                .map_err(|e| WaldError::Distribution(e.to_string()))?;
            Ok(WaldTest {
                statistic: w,
                df,
                denominator_df: Some(denominator),
                p_value: dist.sf(w / df as f64),
            })
        }
    }
}

/// Overall association: every spline column of the exposure.
pub fn overall_test(
    model: &FittedModel,
    basis_column_names: &[String],
    statistic: TestStatistic,
) -> Result<WaldTest, WaldError> {
    wald_test(model, basis_column_names, statistic)
}

/// Departure from linearity: the spline columns after the first.
///
/// Takes the full list of basis column names, linear column included, and
/// tests every column after it. Returns `Ok(None)` when the basis has a single column, since there is no
/// nonlinear term to test.
pub fn nonlinearity_test(
    model: &FittedModel,
    basis_column_names: &[String],
    statistic: TestStatistic,
) -> Result<Option<WaldTest>, WaldError> {
    match basis_column_names.split_first() {
        Some((_, nonlinear)) if !nonlinear.is_empty() => {
            wald_test(model, nonlinear, statistic).map(Some)
        }
        _ => Ok(None),
    }
}
