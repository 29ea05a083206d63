//! # Reference-Relative Odds-Ratio Curves
//!
//! Evaluates a fitted spline model on a grid of exposure values, relative to a
//! reference exposure, with delta-method confidence bands. Covariates are held
//! fixed, so they cancel from the relative log-odds.

use crate::basis::{self, KnotSet};
use crate::model::{CovariateValue, FittedModel, ModelError};
use ndarray::{Array1, ArrayView1};
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal};
use thiserror::Error;

/// Standard error used for the confidence band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeVariant {
    /// `sqrt(d' S d)` with `d = x_row - ref_row`: the standard error of the
    /// relative log-odds itself, zero at the reference.
    #[default]
    Difference,
    /// `sqrt(x_row' S x_row)`: the standard error of the absolute log-odds at
    /// the grid point, shifted by the reference.
    GridOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CurveOptions {
    pub confidence_level: f64,
    pub se_variant: SeVariant,
}

impl Default for CurveOptions {
    fn default() -> Self {
        Self {
            confidence_level: 0.95,
            se_variant: SeVariant::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CurvePoint {
    pub x: f64,
    pub odds_ratio: f64,
    pub lower: f64,
    pub upper: f64,
    /// Standard error of the relative log-odds.
    pub se: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionCurve {
    pub points: Vec<CurvePoint>,
    pub reference: f64,
    pub confidence_level: f64,
    pub se_variant: SeVariant,
}

#[derive(Error, Debug)]
pub enum PredictError {
    #[error("Dimension mismatch in {what}: found {found}, expected {expected}.")]
    DimensionMismatch {
        what: &'static str,
        found: usize,
        expected: usize,
    },

    #[error("Confidence level must lie strictly between 0 and 1, got {0}.")]
    InvalidConfidenceLevel(f64),

    #[error("Prediction grid is empty.")]
    EmptyGrid,

    #[error("Invalid grid request: {0}")]
    InvalidGrid(String),

    #[error("Could not build a prediction row: {0}")]
    Model(#[from] ModelError),

    #[error("Invalid reference distribution: {0}")]
    Distribution(String),
}

/// Builds the odds-ratio curve of `model` over `grid` relative to `reference`.
///
/// `knots` must be the fit-time knots (or at least produce a basis of the same
/// width); `covariate_values` are given in the model's encoding order, usually
/// [`FittedModel::representative_values`].
pub fn predict_curve(
    model: &FittedModel,
    grid: &[f64],
    knots: &KnotSet,
    covariate_values: &[CovariateValue],
    reference: f64,
    options: &CurveOptions,
) -> Result<PredictionCurve, PredictError> {
    let p = model.coefficients.len();
    internal::check_dimensions(model, knots, covariate_values)?;
    if grid.is_empty() {
        return Err(PredictError::EmptyGrid);
    }
    let z = z_quantile(options.confidence_level)?;

    let layout = &model.layout;
    let reference_row = layout.design_row_with_knots(reference, knots, covariate_values)?;
    let beta = model.coefficients.as_view();
    let sigma = model.covariance.view();

    let mut points = Vec::with_capacity(grid.len());
    for &x in grid {
        let row = layout.design_row_with_knots(x, knots, covariate_values)?;
        debug_assert_eq!(row.len(), p);
        let difference = &row - &reference_row;
        let relative = difference.dot(&beta);
        let se_target = match options.se_variant {
            SeVariant::Difference => &difference,
            SeVariant::GridOnly => &row,
        };
        let se = se_target.dot(&sigma.dot(se_target)).max(0.0).sqrt();
        points.push(CurvePoint {
            x,
            odds_ratio: relative.exp(),
            lower: (relative - z * se).exp(),
            upper: (relative + z * se).exp(),
            se,
        });
    }

    Ok(PredictionCurve {
        points,
        reference,
        confidence_level: options.confidence_level,
        se_variant: options.se_variant,
    })
}

/// Two-sided standard-normal critical value for `level`.
pub fn z_quantile(level: f64) -> Result<f64, PredictError> {
    if !(level > 0.0 && level < 1.0) {
        return Err(PredictError::InvalidConfidenceLevel(level));
    }
    let normal = Normal::new(0.0, 1.0).map_err(|e| PredictError::Distribution(e.to_string()))?;
    Ok(normal.inverse_cdf((1.0 + level) / 2.0))
}

/// `n` evenly spaced exposure values between two percentiles (0 to 100) of the
/// finite observed values.
pub fn exposure_grid(
    values: ArrayView1<f64>,
    lower_percentile: f64,
    upper_percentile: f64,
    n: usize,
) -> Result<Vec<f64>, PredictError> {
    if n == 0 {
        return Err(PredictError::EmptyGrid);
    }
    if !(0.0..=100.0).contains(&lower_percentile)
        || !(0.0..=100.0).contains(&upper_percentile)
        || lower_percentile >= upper_percentile
    {
        return Err(PredictError::InvalidGrid(format!(
            "percentiles {lower_percentile} and {upper_percentile} must satisfy 0 <= lower < upper <= 100"
        )));
    }
    let bounds = basis::quantiles(values, &[lower_percentile / 100.0, upper_percentile / 100.0])
        .ok_or_else(|| PredictError::InvalidGrid("no finite exposure values".to_string()))?;
    let (lo, hi) = (bounds[0], bounds[1]);
    if n == 1 {
        return Ok(vec![lo]);
    }
    Ok(Array1::linspace(lo, hi, n).to_vec())
}

/// Median of the finite observed exposure values, the default reference point.
pub fn median_exposure(values: ArrayView1<f64>) -> Option<f64> {
    basis::quantiles(values, &[0.5]).and_then(|q| q.first().copied())
}

mod internal {
    use super::*;

    pub(super) fn check_dimensions(
        model: &FittedModel,
        knots: &KnotSet,
        covariate_values: &[CovariateValue],
    ) -> Result<(), PredictError> {
        let layout = &model.layout;
        let p = model.coefficients.len();
        let checks = [
            ("coefficient vector", p, layout.num_columns()),
            ("covariance rows", model.covariance.nrows(), p),
            ("covariance columns", model.covariance.ncols(), p),
            ("spline basis", knots.num_basis_columns(), layout.basis_columns.len()),
            ("covariate values", covariate_values.len(), layout.encodings.len()),
        ];
        for (what, found, expected) in checks {
            if found != expected {
                return Err(PredictError::DimensionMismatch {
                    what,
                    found,
                    expected,
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Covariate, CovariateValues, build_model_matrix};
    use crate::types::Coefficients;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array2, array};

    fn fitted() -> FittedModel {
        let knots = KnotSet::new(vec![0.0, 10.0, 20.0, 30.0]).unwrap();
        let exposure = array![0.0, 10.0, 20.0, 30.0, 15.0];
        let covariates = vec![Covariate {
            name: "sex".to_string(),
            values: CovariateValues::Categorical(vec![
                Some("F".to_string()),
                Some("M".to_string()),
                Some("M".to_string()),
                Some("F".to_string()),
                Some("M".to_string()),
            ]),
        }];
        let layout = build_model_matrix("x", exposure.view(), &knots, &covariates, &[0, 1, 2, 3, 4])
            .unwrap()
            .into_layout();
        let mut covariance = Array2::<f64>::eye(5) * 0.01;
        covariance[[1, 2]] = 0.002;
        covariance[[2, 1]] = 0.002;
        FittedModel {
            coefficients: Coefficients::new(array![-1.0, 0.05, 0.02, -0.01, 0.4]),
            model_covariance: covariance.clone(),
            covariance,
            dispersion: 1.0,
            deviance: 0.0,
            iterations: 4,
            converged: true,
            num_observations: 5,
            design_df: 4,
            layout,
        }
    }

    #[test]
    fn reference_point_has_unit_odds_ratio_and_zero_se() {
        let model = fitted();
        let grid = [5.0, 12.5, 25.0];
        let curve = predict_curve(
            &model,
            &grid,
            model.knots(),
            &model.representative_values(),
            12.5,
            &CurveOptions::default(),
        )
        .unwrap();
        let at_reference = curve.points[1];
        assert_abs_diff_eq!(at_reference.odds_ratio, 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(at_reference.se, 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(at_reference.lower, 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(at_reference.upper, 1.0, epsilon = 1e-12);
        for point in &curve.points {
            assert!(point.lower <= point.odds_ratio && point.odds_ratio <= point.upper);
        }
    }

    #[test]
    fn covariate_setting_cancels_from_relative_odds() {
        let model = fitted();
        let grid = [3.0, 27.0];
        let options = CurveOptions::default();
        let female = predict_curve(
            &model,
            &grid,
            model.knots(),
            &[CovariateValue::Level("F".to_string())],
            15.0,
            &options,
        )
        .unwrap();
        let male = predict_curve(
            &model,
            &grid,
            model.knots(),
            &[CovariateValue::Level("M".to_string())],
            15.0,
            &options,
        )
        .unwrap();
        for (a, b) in female.points.iter().zip(&male.points) {
            assert_abs_diff_eq!(a.odds_ratio, b.odds_ratio, epsilon = 1e-12);
            assert_abs_diff_eq!(a.se, b.se, epsilon = 1e-12);
        }
    }

    #[test]
    fn grid_only_variant_is_recorded_and_wider_at_reference() {
        let model = fitted();
        let options = CurveOptions {
            se_variant: SeVariant::GridOnly,
            ..CurveOptions::default()
        };
        let curve = predict_curve(
            &model,
            &[12.5],
            model.knots(),
            &model.representative_values(),
            12.5,
            &options,
        )
        .unwrap();
        assert_eq!(curve.se_variant, SeVariant::GridOnly);
        assert!(curve.points[0].se > 0.0);
        assert_abs_diff_eq!(curve.points[0].odds_ratio, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn dimension_mismatch_is_reported_before_evaluation() {
        let model = fitted();
        let wide_knots = KnotSet::new(vec![0.0, 5.0, 10.0, 20.0, 30.0]).unwrap();
        let err = predict_curve(
            &model,
            &[1.0],
            &wide_knots,
            &model.representative_values(),
            10.0,
            &CurveOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, PredictError::DimensionMismatch { what: "spline basis", .. }));

        let err = predict_curve(&model, &[1.0], model.knots(), &[], 10.0, &CurveOptions::default())
            .unwrap_err();
        assert!(matches!(err, PredictError::DimensionMismatch { what: "covariate values", .. }));
    }

    #[test]
    fn unknown_level_is_an_error() {
        let model = fitted();
        let err = predict_curve(
            &model,
            &[1.0],
            model.knots(),
            &[CovariateValue::Level("X".to_string())],
            10.0,
            &CurveOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, PredictError::Model(ModelError::UnknownLevel { .. })));
    }

    #[test]
    fn z_quantile_matches_tables() {
        assert_abs_diff_eq!(z_quantile(0.95).unwrap(), 1.959964, epsilon = 1e-5);
        assert_abs_diff_eq!(z_quantile(0.90).unwrap(), 1.644854, epsilon = 1e-5);
        assert!(z_quantile(1.0).is_err());
    }

    #[test]
    fn grid_spans_requested_percentiles() {
        let values: Array1<f64> = (0..=100).map(f64::from).collect();
        let grid = exposure_grid(values.view(), 5.0, 95.0, 100).unwrap();
        assert_eq!(grid.len(), 100);
        assert_abs_diff_eq!(grid[0], 5.0, epsilon = 1e-12);
        assert_abs_diff_eq!(grid[99], 95.0, epsilon = 1e-12);
        assert!(grid.windows(2).all(|w| w[1] > w[0]));
        assert_eq!(median_exposure(values.view()), Some(50.0));
    }
}
