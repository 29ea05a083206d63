//! The TOML analysis configuration.
//!
//! ```toml
//! min_observations = 50
//!
//! [columns]
//! outcome = "depression"
//! unit = "cohort"
//! weight = "wt"
//! strata = "stratum"
//! psu = "psu"
//!
//! [[exposures]]
//! column = "quercetin"
//! label = "Quercetin (mg/day)"
//!
//! [[covariates]]
//! column = "sex"
//! kind = "categorical"
//!
//! [knots]
//! count = 4
//!
//! [curve]
//! reference = "median"
//! ```

use crate::basis::{self, BasisError};
use crate::design::LonelyPsu;
use crate::fdr::Correction;
use crate::irls::FitOptions;
use crate::model::CovariateKind;
use crate::predict::{CurveOptions, SeVariant};
use crate::wald::TestStatistic;
use ahash::AHashSet;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse TOML configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid knot configuration: {0}")]
    Knots(#[from] BasisError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AnalysisConfig {
    pub columns: ColumnConfig,
    pub exposures: Vec<ExposureSpec>,
    #[serde(default)]
    pub covariates: Vec<CovariateSpec>,
    #[serde(default)]
    pub knots: KnotConfig,
    #[serde(default)]
    pub design: DesignConfig,
    #[serde(default)]
    pub fit: FitOptions,
    #[serde(default)]
    pub curve: CurveConfig,
    #[serde(default)]
    pub testing: TestingConfig,
    /// Complete cases required before a pair is fitted.
    #[serde(default = "default_min_observations")]
    pub min_observations: usize,
    /// Worker threads; 0 uses every available core.
    #[serde(default)]
    pub threads: usize,
}

fn default_min_observations() -> usize {
    50
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ColumnConfig {
    pub outcome: String,
    /// Splits the table into outcome units. Absent means one unit named after the outcome.
    #[serde(default)]
    pub unit: Option<String>,
    pub weight: String,
    pub strata: String,
    pub psu: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExposureSpec {
    pub column: String,
    #[serde(default)]
    pub label: Option<String>,
}

impl ExposureSpec {
    pub fn display_label(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.column)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CovariateSpec {
    pub column: String,
    pub kind: CovariateKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KnotConfig {
    pub count: usize,
    /// Explicit percentiles override `count`.
    pub percentiles: Option<Vec<f64>>,
    pub min_non_missing_fraction: f64,
}

impl Default for KnotConfig {
    fn default() -> Self {
        Self {
            count: 4,
            percentiles: None,
            min_non_missing_fraction: 0.9,
        }
    }
}

impl KnotConfig {
    pub fn resolved_percentiles(&self) -> Result<Vec<f64>, ConfigError> {
        match &self.percentiles {
            Some(percentiles) => Ok(percentiles.clone()),
            None => Ok(basis::default_percentiles(self.count)?),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DesignConfig {
    pub nest: bool,
    pub lonely_psu: LonelyPsu,
}

impl Default for DesignConfig {
    fn default() -> Self {
        Self {
            nest: true,
            lonely_psu: LonelyPsu::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NamedReference {
    Median,
}

/// `reference = "median"` or `reference = 2.5`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ReferenceValue {
    Value(f64),
    Named(NamedReference),
}

impl Default for ReferenceValue {
    fn default() -> Self {
        ReferenceValue::Named(NamedReference::Median)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CurveConfig {
    pub points: usize,
    pub lower_percentile: f64,
    pub upper_percentile: f64,
    pub reference: ReferenceValue,
    pub confidence_level: f64,
    pub se_variant: SeVariant,
}

impl Default for CurveConfig {
    fn default() -> Self {
        Self {
            points: 100,
            lower_percentile: 5.0,
            upper_percentile: 95.0,
            reference: ReferenceValue::default(),
            confidence_level: 0.95,
            se_variant: SeVariant::default(),
        }
    }
}

impl CurveConfig {
    pub fn options(&self) -> CurveOptions {
        CurveOptions {
            confidence_level: self.confidence_level,
            se_variant: self.se_variant,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TestingConfig {
    pub statistic: TestStatistic,
    pub correction: Correction,
}

impl AnalysisConfig {
    /// Minimal configuration with default settings for every optional section.
    pub fn new(columns: ColumnConfig, exposures: Vec<ExposureSpec>) -> Self {
        Self {
            columns,
            exposures,
            covariates: Vec::new(),
            knots: KnotConfig::default(),
            design: DesignConfig::default(),
            fit: FitOptions::default(),
            curve: CurveConfig::default(),
            testing: TestingConfig::default(),
            min_observations: default_min_observations(),
            threads: 0,
        }
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: AnalysisConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Checks the settings that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |message: String| Err(ConfigError::Invalid(message));

        if self.exposures.is_empty() {
            return invalid("at least one exposure must be listed".to_string());
        }
        let mut seen = AHashSet::new();
        for exposure in &self.exposures {
            if !seen.insert(exposure.column.as_str()) {
                return invalid(format!("exposure '{}' is listed twice", exposure.column));
            }
        }
        for covariate in &self.covariates {
            if self.exposures.iter().any(|e| e.column == covariate.column) {
                return invalid(format!(
                    "column '{}' cannot be both an exposure and a covariate",
                    covariate.column
                ));
            }
        }

        let percentiles = self.knots.resolved_percentiles()?;
        if percentiles.len() < 3 {
            return Err(BasisError::TooFewKnots(percentiles.len()).into());
        }
        if let Some(&p) = percentiles.iter().find(|p| !(0.0..=100.0).contains(*p)) {
            return Err(BasisError::InvalidPercentile(p).into());
        }
        if percentiles.windows(2).any(|w| w[1] <= w[0]) {
            return invalid("knot percentiles must be strictly increasing".to_string());
        }
        let fraction = self.knots.min_non_missing_fraction;
        if !(fraction > 0.0 && fraction <= 1.0) {
            return invalid(format!(
                "min_non_missing_fraction must lie in (0, 1], got {fraction}"
            ));
        }

        if self.min_observations == 0 {
            return invalid("min_observations must be positive".to_string());
        }
        if self.fit.max_iterations == 0 || self.fit.tolerance.is_nan() || self.fit.tolerance <= 0.0 {
            return invalid("fit needs a positive iteration cap and tolerance".to_string());
        }

        let curve = &self.curve;
        if curve.points == 0 {
            return invalid("curve.points must be positive".to_string());
        }
        if !(curve.confidence_level > 0.0 && curve.confidence_level < 1.0) {
            return invalid(format!(
                "curve.confidence_level must lie in (0, 1), got {}",
                curve.confidence_level
            ));
        }
        if !(0.0..=100.0).contains(&curve.lower_percentile)
            || !(0.0..=100.0).contains(&curve.upper_percentile)
            || curve.lower_percentile >= curve.upper_percentile
        {
            return invalid("curve percentiles must satisfy 0 <= lower < upper <= 100".to_string());
        }
        if let ReferenceValue::Value(v) = curve.reference {
            if !v.is_finite() {
                return invalid("curve.reference must be finite".to_string());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [columns]
        outcome = "y"
        weight = "w"
        strata = "h"
        psu = "c"

        [[exposures]]
        column = "x"
    "#;

    #[test]
    fn minimal_config_fills_defaults() {
        let config = AnalysisConfig::from_toml_str(MINIMAL).unwrap();
        assert_eq!(config.min_observations, 50);
        assert_eq!(config.knots.resolved_percentiles().unwrap(), vec![5.0, 35.0, 65.0, 95.0]);
        assert_eq!(config.knots.min_non_missing_fraction, 0.9);
        assert!(config.design.nest);
        assert_eq!(config.design.lonely_psu, LonelyPsu::Adjust);
        assert_eq!(config.curve.reference, ReferenceValue::Named(NamedReference::Median));
        assert_eq!(config.curve.se_variant, SeVariant::Difference);
        assert_eq!(config.testing.statistic, TestStatistic::ChiSquared);
        assert_eq!(config.testing.correction, Correction::BenjaminiHochberg);
        assert_eq!(config.fit, FitOptions::default());
        assert_eq!(config.exposures[0].display_label(), "x");
    }

    #[test]
    fn full_config_parses() {
        let text = format!(
            "{MINIMAL}
            [[covariates]]
            column = \"sex\"
            kind = \"categorical\"

            [knots]
            percentiles = [10.0, 50.0, 90.0]

            [design]
            lonely_psu = \"certainty\"

            [curve]
            reference = 2.5
            se_variant = \"grid_only\"

            [testing]
            statistic = \"f\"
            correction = \"bonferroni\"
            "
        );
        let config = AnalysisConfig::from_toml_str(&text).unwrap();
        assert_eq!(config.covariates[0].kind, CovariateKind::Categorical);
        assert_eq!(config.knots.resolved_percentiles().unwrap(), vec![10.0, 50.0, 90.0]);
        assert_eq!(config.design.lonely_psu, LonelyPsu::Certainty);
        assert_eq!(config.curve.reference, ReferenceValue::Value(2.5));
        assert_eq!(config.curve.se_variant, SeVariant::GridOnly);
        assert_eq!(config.testing.statistic, TestStatistic::F);
        assert_eq!(config.testing.correction, Correction::Bonferroni);
    }

    #[test]
    fn rejects_invalid_settings() {
        let text = format!("{MINIMAL}\n[knots]\ncount = 9\n");
        assert!(matches!(
            AnalysisConfig::from_toml_str(&text),
            Err(ConfigError::Knots(BasisError::NoDefaultPercentiles(9)))
        ));

        let text = format!("{MINIMAL}\n[curve]\nconfidence_level = 1.5\n");
        assert!(matches!(
            AnalysisConfig::from_toml_str(&text),
            Err(ConfigError::Invalid(_))
        ));

        let text = format!("{MINIMAL}\n[[exposures]]\ncolumn = \"x\"\n");
        assert!(matches!(
            AnalysisConfig::from_toml_str(&text),
            Err(ConfigError::Invalid(_))
        ));

        let text = MINIMAL.replace("psu = \"c\"", "psu = \"c\"\nextra = 1");
        assert!(matches!(
            AnalysisConfig::from_toml_str(&text),
            Err(ConfigError::Parse(_))
        ));
    }
}
