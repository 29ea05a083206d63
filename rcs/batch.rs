//! # Batch Orchestration
//!
//! Runs every (outcome unit, exposure) pair through knot placement, model
//! building, the survey-weighted fit, the Wald tests and the prediction curve.
//! Pairs are independent and run on a `rayon` pool. A pair failure is recorded
//! as a tagged [`PairOutcome::Failed`] and never affects its siblings. Multiple
//! testing correction runs once every raw p-value is known.

use crate::basis::{self, BasisError, KnotSet};
use crate::config::{AnalysisConfig, ConfigError, ReferenceValue};
use crate::data::{AnalysisTable, AnalysisUnit, DataError};
use crate::design::{DesignError, SurveyDesign, make_design};
use crate::fdr;
use crate::irls::{self, FitError};
use crate::model::{self, FittedModel, ModelError};
use crate::predict::{self, PredictError, PredictionCurve};
use crate::wald::{self, PValue, WaldTest};
use ndarray::Array1;
use rayon::prelude::*;
use std::fmt;
use thiserror::Error;

/// Errors that stop the whole run before any pair is analyzed.
#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Data error: {0}")]
    Data(#[from] DataError),

    #[error("Invalid survey design for outcome unit '{unit}': {source}")]
    Design {
        unit: String,
        #[source]
        source: DesignError,
    },

    #[error("Failed to build the worker thread pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PairKey {
    pub outcome: String,
    pub exposure: String,
    pub label: String,
}

impl fmt::Display for PairKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ~ {}", self.outcome, self.exposure)
    }
}

/// Why a pair produced no model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    MissingData,
    DegenerateKnots,
    InsufficientObservations,
    SingularMatrix,
    NonConvergence,
    DimensionMismatch,
    Design,
    InvalidInput,
}

impl FailureKind {
    pub fn describe(self) -> &'static str {
        match self {
            Self::MissingData => "missing_data",
            Self::DegenerateKnots => "degenerate_knots",
            Self::InsufficientObservations => "insufficient_observations",
            Self::SingularMatrix => "singular_matrix",
            Self::NonConvergence => "non_convergence",
            Self::DimensionMismatch => "dimension_mismatch",
            Self::Design => "design",
            Self::InvalidInput => "invalid_input",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PairFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl PairFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<BasisError> for PairFailure {
    fn from(err: BasisError) -> Self {
        let kind = match err {
            BasisError::MissingData { .. } => FailureKind::MissingData,
            BasisError::DegenerateKnots { .. } => FailureKind::DegenerateKnots,
            _ => FailureKind::InvalidInput,
        };
        Self::new(kind, err.to_string())
    }
}

impl From<ModelError> for PairFailure {
    fn from(err: ModelError) -> Self {
        let kind = match err {
            ModelError::ColumnCountMismatch { .. }
            | ModelError::CovariateCountMismatch { .. }
            | ModelError::LengthMismatch { .. } => FailureKind::DimensionMismatch,
            ModelError::NoRows => FailureKind::InsufficientObservations,
            _ => FailureKind::InvalidInput,
        };
        Self::new(kind, err.to_string())
    }
}

impl From<DesignError> for PairFailure {
    fn from(err: DesignError) -> Self {
        Self::new(FailureKind::Design, err.to_string())
    }
}

impl From<FitError> for PairFailure {
    fn from(err: FitError) -> Self {
        let kind = match err {
            FitError::SingularMatrix { .. } | FitError::Linalg(_) => FailureKind::SingularMatrix,
            FitError::NonConvergence { .. } => FailureKind::NonConvergence,
            FitError::DimensionMismatch { .. } => FailureKind::DimensionMismatch,
            FitError::TooFewObservations { .. } => FailureKind::InsufficientObservations,
            FitError::Design(_) => FailureKind::Design,
            FitError::InvalidOutcome { .. } | FitError::NonFiniteInput { .. } => FailureKind::InvalidInput,
        };
        Self::new(kind, err.to_string())
    }
}

impl From<PredictError> for PairFailure {
    fn from(err: PredictError) -> Self {
        let kind = match err {
            PredictError::DimensionMismatch { .. } => FailureKind::DimensionMismatch,
            _ => FailureKind::InvalidInput,
        };
        Self::new(kind, err.to_string())
    }
}

/// Everything produced for a successfully fitted pair.
#[derive(Debug, Clone)]
pub struct PairFit {
    pub model: FittedModel,
    pub curve: PredictionCurve,
    pub overall: PValue,
    pub nonlinear: PValue,
    pub overall_test: Option<WaldTest>,
    pub nonlinear_test: Option<WaldTest>,
}

#[derive(Debug, Clone)]
pub enum PairOutcome {
    Fitted(Box<PairFit>),
    Failed(PairFailure),
}

/// The per-pair row of the results table.
#[derive(Debug, Clone)]
pub struct TestResult {
    pub key: PairKey,
    /// Complete cases used (or available, for failed pairs).
    pub num_observations: usize,
    pub outcome: PairOutcome,
    /// Set by the batch after all raw p-values are known.
    pub p_overall_adjusted: Option<f64>,
    pub p_nonlinear_adjusted: Option<f64>,
}

impl TestResult {
    pub fn p_overall(&self) -> PValue {
        match &self.outcome {
            PairOutcome::Fitted(fit) => fit.overall,
            PairOutcome::Failed(_) => PValue::Missing,
        }
    }

    pub fn p_nonlinear(&self) -> PValue {
        match &self.outcome {
            PairOutcome::Fitted(fit) => fit.nonlinear,
            PairOutcome::Failed(_) => PValue::Missing,
        }
    }

    pub fn fit(&self) -> Option<&PairFit> {
        match &self.outcome {
            PairOutcome::Fitted(fit) => Some(fit),
            PairOutcome::Failed(_) => None,
        }
    }

    pub fn failure(&self) -> Option<&PairFailure> {
        match &self.outcome {
            PairOutcome::Fitted(_) => None,
            PairOutcome::Failed(failure) => Some(failure),
        }
    }

    pub fn curve(&self) -> Option<&PredictionCurve> {
        self.fit().map(|fit| &fit.curve)
    }
}

#[derive(Debug, Clone)]
pub struct BatchReport {
    pub results: Vec<TestResult>,
}

impl BatchReport {
    pub fn num_fitted(&self) -> usize {
        self.results.iter().filter(|r| r.fit().is_some()).count()
    }

    pub fn num_failed(&self) -> usize {
        self.results.len() - self.num_fitted()
    }

    pub fn curves(&self) -> impl Iterator<Item = (&PairKey, &PredictionCurve)> {
        self.results
            .iter()
            .filter_map(|r| r.curve().map(|curve| (&r.key, curve)))
    }
}

/// Observer for per-pair progress. Called from worker threads.
pub trait BatchProgress: Sync {
    fn on_start(&self, total_pairs: usize) {
        let _ = total_pairs;
    }
    fn on_pair_finished(&self, key: &PairKey, failure: Option<&PairFailure>) {
        let _ = (key, failure);
    }
    fn on_finish(&self) {}
}

#[derive(Default)]
pub struct NoopProgress;

impl BatchProgress for NoopProgress {}

/// Analyzes every pair of `table` and applies multiple-testing correction.
pub fn run_batch(
    table: &AnalysisTable,
    config: &AnalysisConfig,
    progress: &dyn BatchProgress,
) -> Result<BatchReport, AnalysisError> {
    let designs = internal::unit_designs(table, config)?;
    let jobs: Vec<(usize, usize)> = table
        .units
        .iter()
        .enumerate()
        .flat_map(|(u, unit)| (0..unit.exposures.len()).map(move |e| (u, e)))
        .collect();
    log::info!(
        "Analyzing {} pairs ({} outcome units) on {} threads",
        jobs.len(),
        table.units.len(),
        if config.threads == 0 {
            rayon::current_num_threads()
        } else {
            config.threads
        }
    );
    progress.on_start(jobs.len());

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.threads)
        .build()?;
    let mut results: Vec<TestResult> = pool.install(|| {
        jobs.par_iter()
            .map(|&(u, e)| {
                let result = analyze_pair(&table.units[u], e, &designs[u], config);
                progress.on_pair_finished(&result.key, result.failure());
                result
            })
            .collect()
    });
    progress.on_finish();

    internal::apply_correction(&mut results, config.testing.correction);

    let report = BatchReport { results };
    log::info!(
        "Batch finished: {} fitted, {} failed",
        report.num_fitted(),
        report.num_failed()
    );
    Ok(report)
}

/// Runs one pair through the full pipeline. Failures are captured in the result.
pub fn analyze_pair(
    unit: &AnalysisUnit,
    exposure_index: usize,
    design: &SurveyDesign,
    config: &AnalysisConfig,
) -> TestResult {
    let exposure = &unit.exposures[exposure_index];
    let key = PairKey {
        outcome: unit.name.clone(),
        exposure: exposure.name.clone(),
        label: exposure.label.clone(),
    };
    let mask = complete_case_mask(unit, exposure_index);
    let num_observations = mask.iter().filter(|&&keep| keep).count();

    let outcome = match internal::fit_pair(unit, exposure_index, design, config, &mask) {
        Ok(fit) => {
            log::debug!("{key}: fitted on {num_observations} observations");
            PairOutcome::Fitted(Box::new(fit))
        }
        Err(failure) => {
            log::warn!("{key}: {} ({})", failure.kind, failure.message);
            PairOutcome::Failed(failure)
        }
    };
    TestResult {
        key,
        num_observations,
        outcome,
        p_overall_adjusted: None,
        p_nonlinear_adjusted: None,
    }
}

/// Rows where the outcome, the exposure and every covariate are present.
pub fn complete_case_mask(unit: &AnalysisUnit, exposure_index: usize) -> Vec<bool> {
    let exposure = &unit.exposures[exposure_index].values;
    (0..unit.num_rows())
        .map(|i| {
            unit.outcome[i].is_finite()
                && exposure[i].is_finite()
                && unit.covariates.iter().all(|c| c.values.is_present(i))
        })
        .collect()
}

/// Knots each pair would use, without fitting.
pub fn plan_knots(table: &AnalysisTable, config: &AnalysisConfig) -> Result<Vec<(PairKey, Result<KnotSet, PairFailure>)>, AnalysisError> {
    let percentiles = config.knots.resolved_percentiles()?;
    let mut plans = Vec::with_capacity(table.num_pairs());
    for unit in &table.units {
        for (e, exposure) in unit.exposures.iter().enumerate() {
            let key = PairKey {
                outcome: unit.name.clone(),
                exposure: exposure.name.clone(),
                label: exposure.label.clone(),
            };
            let knots = internal::pair_knots(unit, e, &percentiles, config.knots.min_non_missing_fraction)
                .map_err(PairFailure::from);
            plans.push((key, knots));
        }
    }
    Ok(plans)
}

mod internal {
    use super::*;

    pub(super) fn unit_designs(
        table: &AnalysisTable,
        config: &AnalysisConfig,
    ) -> Result<Vec<SurveyDesign>, AnalysisError> {
        table
            .units
            .iter()
            .map(|unit| {
                make_design(unit.weights.clone(), &unit.strata, &unit.psus, config.design.nest)
                    .map(|d| d.with_lonely_psu(config.design.lonely_psu))
                    .map_err(|source| AnalysisError::Design {
                        unit: unit.name.clone(),
                        source,
                    })
            })
            .collect()
    }

    /// Knots from the exposure series on rows with complete outcome and
    /// covariates; missing exposures count against the completeness threshold.
    pub(super) fn pair_knots(
        unit: &AnalysisUnit,
        exposure_index: usize,
        percentiles: &[f64],
        min_non_missing_fraction: f64,
    ) -> Result<KnotSet, BasisError> {
        let exposure = &unit.exposures[exposure_index].values;
        let series: Array1<f64> = (0..unit.num_rows())
            .filter(|&i| {
                unit.outcome[i].is_finite() && unit.covariates.iter().all(|c| c.values.is_present(i))
            })
            .map(|i| exposure[i])
            .collect();
        basis::compute_knots(series.view(), percentiles, min_non_missing_fraction)
    }

    pub(super) fn fit_pair(
        unit: &AnalysisUnit,
        exposure_index: usize,
        design: &SurveyDesign,
        config: &AnalysisConfig,
        mask: &[bool],
    ) -> Result<PairFit, PairFailure> {
        let exposure = &unit.exposures[exposure_index];
        let rows: Vec<usize> = mask
            .iter()
            .enumerate()
            .filter_map(|(i, &keep)| keep.then_some(i))
            .collect();
        if rows.len() < config.min_observations {
            return Err(PairFailure::new(
                FailureKind::InsufficientObservations,
                format!(
                    "{} complete observations, at least {} required",
                    rows.len(),
                    config.min_observations
                ),
            ));
        }

        let percentiles = config
            .knots
            .resolved_percentiles()
            .map_err(|e| PairFailure::new(FailureKind::InvalidInput, e.to_string()))?;
        let knots = pair_knots(unit, exposure_index, &percentiles, config.knots.min_non_missing_fraction)?;

        let model_matrix = model::build_model_matrix(
            &exposure.name,
            exposure.values.view(),
            &knots,
            &unit.covariates,
            &rows,
        )?;
        let domain = design.domain(mask)?;
        let outcome: Array1<f64> = rows.iter().map(|&r| unit.outcome[r]).collect();
        let fitted = irls::fit(&domain, &model_matrix, outcome.view(), &config.fit)?;

        let basis_names = fitted.basis_column_names().to_vec();
        let statistic = config.testing.statistic;
        let overall_test = match wald::overall_test(&fitted, &basis_names, statistic) {
            Ok(test) => Some(test),
            Err(err) => {
                log::warn!("{}: overall test unavailable: {err}", exposure.name);
                None
            }
        };
        let (nonlinear, nonlinear_test) = match wald::nonlinearity_test(&fitted, &basis_names, statistic) {
            Ok(Some(test)) => (PValue::Value(test.p_value), Some(test)),
            Ok(None) => (PValue::NotApplicable, None),
            Err(err) => {
                log::warn!("{}: nonlinearity test unavailable: {err}", exposure.name);
                (PValue::Missing, None)
            }
        };
        let overall = overall_test.map_or(PValue::Missing, |t| PValue::Value(t.p_value));

        let analysis_exposure: Array1<f64> = rows.iter().map(|&r| exposure.values[r]).collect();
        let curve_config = &config.curve;
        let grid = predict::exposure_grid(
            analysis_exposure.view(),
            curve_config.lower_percentile,
            curve_config.upper_percentile,
            curve_config.points,
        )?;
        let reference = match curve_config.reference {
            ReferenceValue::Value(v) => v,
            ReferenceValue::Named(_) => predict::median_exposure(analysis_exposure.view())
                .ok_or_else(|| PairFailure::new(FailureKind::MissingData, "no exposure values for the reference"))?,
        };
        let curve = predict::predict_curve(
            &fitted,
            &grid,
            fitted.knots(),
            &fitted.representative_values(),
            reference,
            &curve_config.options(),
        )?;

        Ok(PairFit {
            model: fitted,
            curve,
            overall,
            nonlinear,
            overall_test,
            nonlinear_test,
        })
    }

    /// Adjusts the overall and nonlinearity families separately. Missing and
    /// not-applicable p-values are left out of each family.
    pub(super) fn apply_correction(results: &mut [TestResult], correction: fdr::Correction) {
        let overall: Vec<Option<f64>> = results.iter().map(|r| r.p_overall().value()).collect();
        let nonlinear: Vec<Option<f64>> = results.iter().map(|r| r.p_nonlinear().value()).collect();
        let overall = fdr::adjust_with_missing(&overall, correction);
        let nonlinear = fdr::adjust_with_missing(&nonlinear, correction);
        for ((result, o), n) in results.iter_mut().zip(overall).zip(nonlinear) {
            result.p_overall_adjusted = o;
            result.p_nonlinear_adjusted = n;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ColumnConfig, ExposureSpec};
    use crate::data::ExposureColumn;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn config() -> AnalysisConfig {
        AnalysisConfig::new(
            ColumnConfig {
                outcome: "y".to_string(),
                unit: None,
                weight: "w".to_string(),
                strata: "h".to_string(),
                psu: "c".to_string(),
            },
            vec![ExposureSpec {
                column: "x".to_string(),
                label: None,
            }],
        )
    }

    fn unit(n: usize, seed: u64) -> AnalysisUnit {
        let mut rng = StdRng::seed_from_u64(seed);
        let x: Array1<f64> = (0..n).map(|_| rng.gen_range(0.0..10.0)).collect();
        let outcome = x.mapv(|v| {
            let p = 1.0 / (1.0 + (-(-1.0 + 0.2 * v)).exp());
            if rng.gen_range(0.0..1.0) < p { 1.0 } else { 0.0 }
        });
        AnalysisUnit {
            name: "y".to_string(),
            outcome,
            weights: (0..n).map(|_| rng.gen_range(1.0..2.0)).collect(),
            strata: (0..n).map(|i| (i % 4).to_string()).collect(),
            psus: (0..n).map(|i| (i % 12).to_string()).collect(),
            exposures: vec![
                ExposureColumn {
                    name: "x".to_string(),
                    label: "x".to_string(),
                    values: x,
                },
                ExposureColumn {
                    name: "flat".to_string(),
                    label: "flat".to_string(),
                    values: Array1::from_elem(n, 2.0),
                },
            ],
            covariates: Vec::new(),
        }
    }

    #[test]
    fn failures_are_tagged_and_isolated() {
        let table = AnalysisTable::new(vec![unit(300, 4)]);
        let report = run_batch(&table, &config(), &NoopProgress).unwrap();
        assert_eq!(report.results.len(), 2);
        assert!(report.results[0].fit().is_some());
        let failure = report.results[1].failure().unwrap();
        assert_eq!(failure.kind, FailureKind::DegenerateKnots);
        assert_eq!(report.results[1].p_overall(), PValue::Missing);
        assert_eq!(report.results[1].p_overall_adjusted, None);
        // A single test: the adjusted value equals the raw value.
        let raw = report.results[0].p_overall().value().unwrap();
        assert_eq!(report.results[0].p_overall_adjusted, Some(raw));
    }

    #[test]
    fn too_few_complete_cases_is_a_soft_failure() {
        let mut u = unit(300, 8);
        for i in 0..280 {
            u.outcome[i] = f64::NAN;
        }
        let table = AnalysisTable::new(vec![u]);
        let report = run_batch(&table, &config(), &NoopProgress).unwrap();
        let failure = report.results[0].failure().unwrap();
        assert_eq!(failure.kind, FailureKind::InsufficientObservations);
        assert_eq!(report.results[0].num_observations, 20);
    }

    #[test]
    fn under_populated_exposure_reports_missing_data() {
        let mut u = unit(300, 6);
        for i in 0..60 {
            u.exposures[0].values[i] = f64::NAN;
        }
        let table = AnalysisTable::new(vec![u]);
        let report = run_batch(&table, &config(), &NoopProgress).unwrap();
        assert_eq!(report.results[0].failure().unwrap().kind, FailureKind::MissingData);
    }

    #[test]
    fn invalid_design_is_fatal() {
        let mut u = unit(100, 1);
        u.weights[3] = 0.0;
        let table = AnalysisTable::new(vec![u]);
        assert!(matches!(
            run_batch(&table, &config(), &NoopProgress),
            Err(AnalysisError::Design { .. })
        ));
    }

    #[test]
    fn knot_plan_covers_every_pair() {
        let table = AnalysisTable::new(vec![unit(200, 2)]);
        let plans = plan_knots(&table, &config()).unwrap();
        assert_eq!(plans.len(), 2);
        assert_eq!(plans[0].1.as_ref().unwrap().len(), 4);
        assert_eq!(plans[1].1.as_ref().unwrap_err().kind, FailureKind::DegenerateKnots);
    }
}
