//! # Data Loading and Validation
//!
//! Reads the tab-separated analysis table and splits it into outcome units.
//! Design columns (weight, strata, PSU) must be complete; exposure, outcome and
//! covariate cells may be empty or `NA`, which become `NaN` or `None` and are
//! handled per pair by the complete-case mask.

use crate::config::{AnalysisConfig, ColumnConfig};
use crate::model::{Covariate, CovariateKind, CovariateValues};
use ahash::AHashSet;
use ndarray::{Array1, Axis};
use polars::prelude::*;
use std::fs::File;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DataError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    Polars(#[from] PolarsError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("The required column '{0}' was not found in the input file. Please check spelling and case.")]
    ColumnNotFound(String),

    #[error(
        "Column '{column_name}' could not be converted to {expected_type}. It contains non-numeric data. (Found type: {found_type})"
    )]
    ColumnWrongType {
        column_name: String,
        expected_type: &'static str,
        found_type: String,
    },

    #[error("Design column '{column}' has a missing value at data row {row}. Weights, strata and PSUs must be complete.")]
    MissingDesignValue { column: String, row: usize },

    #[error("Weight column '{column}' has a non-positive or non-finite value {value} at data row {row}.")]
    InvalidWeight { column: String, row: usize, value: f64 },

    #[error("Outcome column '{column}' must hold 0, 1 or missing, but data row {row} is {value}.")]
    InvalidOutcome { column: String, row: usize, value: f64 },

    #[error("The input file contains no data rows.")]
    Empty,
}

/// One exposure variable restricted to an outcome unit.
#[derive(Debug, Clone, PartialEq)]
pub struct ExposureColumn {
    pub name: String,
    pub label: String,
    /// Missing entries are `NaN`.
    pub values: Array1<f64>,
}

/// The rows of the table that share one outcome-unit label, with every
/// configured column already extracted.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisUnit {
    pub name: String,
    /// 0/1 with `NaN` for missing.
    pub outcome: Array1<f64>,
    pub weights: Array1<f64>,
    pub strata: Vec<String>,
    pub psus: Vec<String>,
    pub exposures: Vec<ExposureColumn>,
    pub covariates: Vec<Covariate>,
}

impl AnalysisUnit {
    pub fn num_rows(&self) -> usize {
        self.outcome.len()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisTable {
    pub units: Vec<AnalysisUnit>,
}

impl AnalysisTable {
    pub fn new(units: Vec<AnalysisUnit>) -> Self {
        Self { units }
    }

    pub fn num_pairs(&self) -> usize {
        self.units.iter().map(|u| u.exposures.len()).sum()
    }
}

/// Reads `path` and extracts the columns named in `config`.
///
/// Units appear in order of first occurrence in the file; rows keep their file
/// order within a unit.
pub fn load_table(path: impl AsRef<Path>, config: &AnalysisConfig) -> Result<AnalysisTable, DataError> {
    let path = path.as_ref();
    log::info!("Loading analysis table from '{}'", path.display());

    let df = CsvReader::new(File::open(path)?)
        .with_options(
            CsvReadOptions::default()
                .with_has_header(true)
                .with_infer_schema_length(None)
                .with_parse_options(
                    CsvParseOptions::default()
                        .with_separator(b'\t')
                        .with_null_values(Some(NullValues::AllColumnsSingle("NA".into()))),
                ),
        )
        .finish()?;

    if df.height() == 0 {
        return Err(DataError::Empty);
    }
    internal::check_columns(&df, config)?;
    log::info!("Loaded {} rows and {} columns", df.height(), df.width());

    let columns = &config.columns;
    let outcome = internal::numeric_column(&df, &columns.outcome)?;
    if let Some((row, &value)) = outcome
        .iter()
        .enumerate()
        .find(|(_, v)| v.is_finite() && **v != 0.0 && **v != 1.0)
    {
        return Err(DataError::InvalidOutcome {
            column: columns.outcome.clone(),
            row: row + 1,
            value,
        });
    }

    let weights = internal::numeric_column(&df, &columns.weight)?;
    if let Some((row, &value)) = weights
        .iter()
        .enumerate()
        .find(|(_, w)| !(w.is_finite() && **w > 0.0))
    {
        return Err(DataError::InvalidWeight {
            column: columns.weight.clone(),
            row: row + 1,
            value,
        });
    }
    let strata = internal::complete_labels(&df, &columns.strata)?;
    let psus = internal::complete_labels(&df, &columns.psu)?;

    let exposures = config
        .exposures
        .iter()
        .map(|spec| {
            Ok(ExposureColumn {
                name: spec.column.clone(),
                label: spec.display_label().to_string(),
                values: internal::numeric_column(&df, &spec.column)?,
            })
        })
        .collect::<Result<Vec<_>, DataError>>()?;

    let covariates = config
        .covariates
        .iter()
        .map(|spec| {
            let values = match spec.kind {
                CovariateKind::Numeric => CovariateValues::Numeric(internal::numeric_column(&df, &spec.column)?),
                CovariateKind::Categorical => CovariateValues::Categorical(internal::label_column(&df, &spec.column)?),
            };
            Ok(Covariate {
                name: spec.column.clone(),
                values,
            })
        })
        .collect::<Result<Vec<_>, DataError>>()?;

    let unit_rows = internal::unit_rows(&df, columns)?;
    let units = unit_rows
        .into_iter()
        .map(|(name, rows)| AnalysisUnit {
            name,
            outcome: outcome.select(Axis(0), &rows),
            weights: weights.select(Axis(0), &rows),
            strata: rows.iter().map(|&r| strata[r].clone()).collect(),
            psus: rows.iter().map(|&r| psus[r].clone()).collect(),
            exposures: exposures
                .iter()
                .map(|e| ExposureColumn {
                    name: e.name.clone(),
                    label: e.label.clone(),
                    values: e.values.select(Axis(0), &rows),
                })
                .collect(),
            covariates: covariates
                .iter()
                .map(|c| Covariate {
                    name: c.name.clone(),
                    values: internal::select_covariate(&c.values, &rows),
                })
                .collect(),
        })
        .collect::<Vec<_>>();

    for unit in &units {
        log::info!("Outcome unit '{}': {} rows", unit.name, unit.num_rows());
    }
    Ok(AnalysisTable::new(units))
}

mod internal {
    use super::*;

    pub(super) fn check_columns(df: &DataFrame, config: &AnalysisConfig) -> Result<(), DataError> {
        let present: AHashSet<String> = df
            .get_column_names()
            .into_iter()
            .map(|s| s.to_string())
            .collect();
        let columns = &config.columns;
        let required = [&columns.outcome, &columns.weight, &columns.strata, &columns.psu]
            .into_iter()
            .chain(columns.unit.iter())
            .chain(config.exposures.iter().map(|e| &e.column))
            .chain(config.covariates.iter().map(|c| &c.column));
        for name in required {
            if !present.contains(name.as_str()) {
                return Err(DataError::ColumnNotFound(name.clone()));
            }
        }
        Ok(())
    }

    /// Numeric column with nulls as `NaN`. Cells that fail to parse as numbers
    /// are a type error rather than silently missing.
    pub(super) fn numeric_column(df: &DataFrame, name: &str) -> Result<Array1<f64>, DataError> {
        let column = df.column(name)?;
        let wrong_type = || DataError::ColumnWrongType {
            column_name: name.to_string(),
            expected_type: "f64 (numeric)",
            found_type: format!("{:?}", column.dtype()),
        };
        let casted = column.cast(&DataType::Float64).map_err(|_| wrong_type())?;
        if casted.null_count() > column.null_count() {
            return Err(wrong_type());
        }
        let values: Array1<f64> = casted
            .f64()?
            .into_iter()
            .map(|v| v.unwrap_or(f64::NAN))
            .collect();
        Ok(values)
    }

    pub(super) fn label_column(df: &DataFrame, name: &str) -> Result<Vec<Option<String>>, DataError> {
        let casted = df.column(name)?.cast(&DataType::String)?;
        let labels = casted
            .str()?
            .into_iter()
            .map(|v| v.map(str::to_string))
            .collect();
        Ok(labels)
    }

    pub(super) fn complete_labels(df: &DataFrame, name: &str) -> Result<Vec<String>, DataError> {
        label_column(df, name)?
            .into_iter()
            .enumerate()
            .map(|(row, label)| {
                label.ok_or_else(|| DataError::MissingDesignValue {
                    column: name.to_string(),
                    row: row + 1,
                })
            })
            .collect()
    }

    /// Row indices per outcome unit, in order of first appearance.
    pub(super) fn unit_rows(df: &DataFrame, columns: &ColumnConfig) -> Result<Vec<(String, Vec<usize>)>, DataError> {
        let Some(unit_column) = &columns.unit else {
            return Ok(vec![(columns.outcome.clone(), (0..df.height()).collect())]);
        };
        let labels = complete_labels(df, unit_column)?;
        let mut units: Vec<(String, Vec<usize>)> = Vec::new();
        for (row, label) in labels.into_iter().enumerate() {
            match units.iter_mut().find(|(name, _)| *name == label) {
                Some((_, rows)) => rows.push(row),
                None => units.push((label, vec![row])),
            }
        }
        Ok(units)
    }

    pub(super) fn select_covariate(values: &CovariateValues, rows: &[usize]) -> CovariateValues {
        match values {
            CovariateValues::Numeric(v) => CovariateValues::Numeric(v.select(Axis(0), rows)),
            CovariateValues::Categorical(v) => {
                CovariateValues::Categorical(rows.iter().map(|&r| v[r].clone()).collect())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CovariateSpec, ExposureSpec};
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn config(unit: Option<&str>) -> AnalysisConfig {
        let mut config = AnalysisConfig::new(
            ColumnConfig {
                outcome: "y".to_string(),
                unit: unit.map(str::to_string),
                weight: "w".to_string(),
                strata: "h".to_string(),
                psu: "c".to_string(),
            },
            vec![ExposureSpec {
                column: "x".to_string(),
                label: Some("Dose".to_string()),
            }],
        );
        config.covariates = vec![CovariateSpec {
            column: "sex".to_string(),
            kind: CovariateKind::Categorical,
        }];
        config
    }

    fn write_table(text: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(text.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn reads_missing_cells_and_splits_units() {
        let file = write_table(
            "cohort\ty\tw\th\tc\tx\tsex\n\
             b\t1\t2.5\t1\t1\t3.5\tF\n\
             a\t0\t1.0\t1\t2\tNA\tM\n\
             b\tNA\t1.5\t2\t1\t4.0\t\n\
             a\t1\t3.0\t2\t2\t7.25\tF\n",
        );
        let table = load_table(file.path(), &config(Some("cohort"))).unwrap();
        assert_eq!(table.units.len(), 2);
        assert_eq!(table.num_pairs(), 2);

        let b = &table.units[0];
        assert_eq!(b.name, "b");
        assert_eq!(b.num_rows(), 2);
        assert_eq!(b.outcome[0], 1.0);
        assert!(b.outcome[1].is_nan());
        assert_eq!(b.exposures[0].label, "Dose");
        match &b.covariates[0].values {
            CovariateValues::Categorical(levels) => {
                assert_eq!(levels, &vec![Some("F".to_string()), None]);
            }
            other => panic!("unexpected covariate values {other:?}"),
        }

        let a = &table.units[1];
        assert!(a.exposures[0].values[0].is_nan());
        assert_eq!(a.exposures[0].values[1], 7.25);
        assert_eq!(a.strata, vec!["1".to_string(), "2".to_string()]);
    }

    #[test]
    fn missing_unit_column_means_one_unit() {
        let file = write_table("y\tw\th\tc\tx\tsex\n1\t1\t1\t1\t0.5\tM\n0\t1\t1\t2\t0.7\tF\n");
        let table = load_table(file.path(), &config(None)).unwrap();
        assert_eq!(table.units.len(), 1);
        assert_eq!(table.units[0].name, "y");
    }

    #[test]
    fn design_columns_must_be_complete_and_valid() {
        let file = write_table("y\tw\th\tc\tx\tsex\n1\t0\t1\t1\t0.5\tM\n");
        assert!(matches!(
            load_table(file.path(), &config(None)),
            Err(DataError::InvalidWeight { row: 1, .. })
        ));

        let file = write_table("y\tw\th\tc\tx\tsex\n1\t1\tNA\t1\t0.5\tM\n0\t1\t2\t1\t0.5\tM\n");
        assert!(matches!(
            load_table(file.path(), &config(None)),
            Err(DataError::MissingDesignValue { row: 1, .. })
        ));

        let file = write_table("y\tw\th\tc\tsex\n1\t1\t1\t1\tM\n");
        assert!(matches!(
            load_table(file.path(), &config(None)),
            Err(DataError::ColumnNotFound(name)) if name == "x"
        ));
    }

    #[test]
    fn outcome_must_be_binary() {
        let file = write_table("y\tw\th\tc\tx\tsex\n2\t1\t1\t1\t0.5\tM\n");
        assert!(matches!(
            load_table(file.path(), &config(None)),
            Err(DataError::InvalidOutcome { row: 1, .. })
        ));
    }
}
