use crate::basis::{self, KnotSet};
use crate::types::{Coefficients, LinearPredictor};
use ahash::AHashMap;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::ops::Range;
use std::path::Path;
use thiserror::Error;

// --- Public Data Structures ---
// The layout and fitted model are serialized into the per-pair TOML artifact,
// so everything needed to rebuild a design row at prediction time lives here.

pub const INTERCEPT: &str = "(Intercept)";

/// Whether a covariate enters the model as a single numeric column or as
/// treatment-coded level indicators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CovariateKind {
    Numeric,
    Categorical,
}

/// Raw covariate observations, one entry per row of the analysis table.
#[derive(Debug, Clone, PartialEq)]
pub enum CovariateValues {
    /// Missing entries are `NaN`.
    Numeric(Array1<f64>),
    Categorical(Vec<Option<String>>),
}

impl CovariateValues {
    pub fn len(&self) -> usize {
        match self {
            CovariateValues::Numeric(values) => values.len(),
            CovariateValues::Categorical(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_present(&self, row: usize) -> bool {
        match self {
            CovariateValues::Numeric(values) => values.get(row).is_some_and(|v| v.is_finite()),
            CovariateValues::Categorical(values) => values.get(row).is_some_and(|v| v.is_some()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Covariate {
    pub name: String,
    pub values: CovariateValues,
}

/// A single covariate setting used when evaluating the model at new points.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CovariateValue {
    Numeric(f64),
    Level(String),
}

/// How one covariate maps onto model-matrix columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CovariateEncoding {
    pub name: String,
    pub columns: Range<usize>,
    pub kind: EncodingKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncodingKind {
    Numeric {
        /// Unweighted median over the analysis rows.
        representative: f64,
    },
    Categorical {
        /// All observed levels in natural sort order. The first is the reference.
        levels: Vec<String>,
        reference: String,
        /// Most frequent level; ties go to the earlier level.
        representative: String,
    },
}

impl CovariateEncoding {
    pub fn representative(&self) -> CovariateValue {
        match &self.kind {
            EncodingKind::Numeric { representative } => CovariateValue::Numeric(*representative),
            EncodingKind::Categorical { representative, .. } => {
                CovariateValue::Level(representative.clone())
            }
        }
    }

    fn encode_into(&self, value: &CovariateValue, row: &mut [f64]) -> Result<(), ModelError> {
        match (&self.kind, value) {
            (EncodingKind::Numeric { .. }, CovariateValue::Numeric(v)) => {
                if !v.is_finite() {
                    return Err(ModelError::NonFiniteValue {
                        column: self.name.clone(),
                        value: *v,
                    });
                }
                row[self.columns.start] = *v;
                Ok(())
            }
            (EncodingKind::Categorical { levels, .. }, CovariateValue::Level(level)) => {
                let position = levels.iter().position(|l| l == level).ok_or_else(|| {
                    ModelError::UnknownLevel {
                        covariate: self.name.clone(),
                        level: level.clone(),
                    }
                })?;
                // Reference level is the all-zero row.
                if position > 0 {
                    row[self.columns.start + position - 1] = 1.0;
                }
                Ok(())
            }
            _ => Err(ModelError::CovariateKindMismatch(self.name.clone())),
        }
    }
}

/// Column bookkeeping for a model matrix: the canonical order is the intercept,
/// the spline columns of the exposure, then covariate columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelLayout {
    pub exposure: String,
    pub column_names: Vec<String>,
    pub basis_columns: Range<usize>,
    pub knots: KnotSet,
    pub encodings: Vec<CovariateEncoding>,
}

impl ModelLayout {
    pub fn num_columns(&self) -> usize {
        self.column_names.len()
    }

    pub fn basis_column_names(&self) -> &[String] {
        &self.column_names[self.basis_columns.clone()]
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.column_names.iter().position(|c| c == name)
    }

    /// Covariates held at their fit-time representative values.
    pub fn representative_values(&self) -> Vec<CovariateValue> {
        self.encodings.iter().map(|e| e.representative()).collect()
    }

    /// Builds one model-matrix row for exposure value `x` with the given
    /// covariate settings (in encoding order), reusing the fit-time knots and
    /// level mapping.
    pub fn design_row(&self, x: f64, covariates: &[CovariateValue]) -> Result<Array1<f64>, ModelError> {
        self.design_row_with_knots(x, &self.knots, covariates)
    }

    /// As [`ModelLayout::design_row`], with an explicit knot set whose basis
    /// width matches the layout.
    pub fn design_row_with_knots(
        &self,
        x: f64,
        knots: &KnotSet,
        covariates: &[CovariateValue],
    ) -> Result<Array1<f64>, ModelError> {
        if knots.num_basis_columns() != self.basis_columns.len() {
            return Err(ModelError::ColumnCountMismatch {
                found: knots.num_basis_columns(),
                expected: self.basis_columns.len(),
            });
        }
        if covariates.len() != self.encodings.len() {
            return Err(ModelError::CovariateCountMismatch {
                found: covariates.len(),
                expected: self.encodings.len(),
            });
        }
        if !x.is_finite() {
            return Err(ModelError::NonFiniteValue {
                column: self.exposure.clone(),
                value: x,
            });
        }
        let mut row = vec![0.0; self.num_columns()];
        row[0] = 1.0;
        let spline = basis::basis_row(x, knots);
        for (offset, value) in spline.iter().enumerate() {
            row[self.basis_columns.start + offset] = *value;
        }
        for (encoding, value) in self.encodings.iter().zip(covariates) {
            encoding.encode_into(value, &mut row)?;
        }
        Ok(Array1::from(row))
    }
}

/// A dense model matrix with its column layout.
#[derive(Debug, Clone)]
pub struct ModelMatrix {
    matrix: Array2<f64>,
    layout: ModelLayout,
}

impl ModelMatrix {
    /// Pairs an existing matrix with a layout. The column counts must agree.
    pub fn from_parts(matrix: Array2<f64>, layout: ModelLayout) -> Result<Self, ModelError> {
        if matrix.ncols() != layout.num_columns() {
            return Err(ModelError::ColumnCountMismatch {
                found: matrix.ncols(),
                expected: layout.num_columns(),
            });
        }
        Ok(Self { matrix, layout })
    }

    pub fn matrix(&self) -> ArrayView2<'_, f64> {
        self.matrix.view()
    }

    pub fn layout(&self) -> &ModelLayout {
        &self.layout
    }

    pub fn nrows(&self) -> usize {
        self.matrix.nrows()
    }

    pub fn ncols(&self) -> usize {
        self.matrix.ncols()
    }

    pub fn into_layout(self) -> ModelLayout {
        self.layout
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModelError {
    #[error("No rows were selected for the model matrix.")]
    NoRows,

    #[error("Covariate '{name}' has {found} values, but the exposure has {expected}.")]
    LengthMismatch {
        name: String,
        found: usize,
        expected: usize,
    },

    #[error("Row {row} is out of bounds for {len} observations.")]
    RowOutOfBounds { row: usize, len: usize },

    #[error("Column '{column}' has a missing value at selected row {row}.")]
    MissingValue { column: String, row: usize },

    #[error("Column '{column}' contains a non-finite value ({value}).")]
    NonFiniteValue { column: String, value: f64 },

    #[error("Categorical covariate '{covariate}' has no level '{level}' in the fitted model.")]
    UnknownLevel { covariate: String, level: String },

    #[error("Covariate '{0}' was given a value of the wrong kind (numeric vs categorical).")]
    CovariateKindMismatch(String),

    #[error("Expected {expected} covariate values, found {found}.")]
    CovariateCountMismatch { found: usize, expected: usize },

    #[error("Matrix has {found} columns, but the layout names {expected}.")]
    ColumnCountMismatch { found: usize, expected: usize },
}

/// Builds the model matrix for the analysis rows `rows` of an outcome unit.
///
/// All selected rows must be complete: the caller computes the complete-case
/// mask. Categorical levels are collected from the selected rows only and
/// sorted naturally, so `x2` comes before `x10`.
pub fn build_model_matrix(
    exposure_name: &str,
    exposure: ArrayView1<f64>,
    knots: &KnotSet,
    covariates: &[Covariate],
    rows: &[usize],
) -> Result<ModelMatrix, ModelError> {
    if rows.is_empty() {
        return Err(ModelError::NoRows);
    }
    let total = exposure.len();
    for covariate in covariates {
        if covariate.values.len() != total {
            return Err(ModelError::LengthMismatch {
                name: covariate.name.clone(),
                found: covariate.values.len(),
                expected: total,
            });
        }
    }
    if let Some(&row) = rows.iter().find(|&&r| r >= total) {
        return Err(ModelError::RowOutOfBounds { row, len: total });
    }
    if let Some(&row) = rows.iter().find(|&&r| !exposure[r].is_finite()) {
        return Err(ModelError::MissingValue {
            column: exposure_name.to_string(),
            row,
        });
    }

    let basis_names = basis::basis_column_names(exposure_name, knots);
    let basis_columns = 1..1 + basis_names.len();
    let mut column_names = Vec::with_capacity(1 + basis_names.len() + covariates.len());
    column_names.push(INTERCEPT.to_string());
    column_names.extend(basis_names);

    let mut encodings = Vec::with_capacity(covariates.len());
    for covariate in covariates {
        let encoding = internal::encode_covariate(covariate, rows, column_names.len())?;
        match &encoding.kind {
            EncodingKind::Numeric { .. } => column_names.push(covariate.name.clone()),
            EncodingKind::Categorical { levels, .. } => column_names.extend(
                levels
                    .iter()
                    .skip(1)
                    .map(|level| format!("{}[{}]", covariate.name, level)),
            ),
        }
        encodings.push(encoding);
    }

    let p = column_names.len();
    let selected_exposure: Array1<f64> = rows.iter().map(|&r| exposure[r]).collect();
    let spline = basis::build_basis(selected_exposure.view(), knots);

    let mut matrix = Array2::<f64>::zeros((rows.len(), p));
    matrix.column_mut(0).fill(1.0);
    matrix
        .slice_mut(ndarray::s![.., basis_columns.clone()])
        .assign(&spline);

    for (covariate, encoding) in covariates.iter().zip(&encodings) {
        match (&covariate.values, &encoding.kind) {
            (CovariateValues::Numeric(values), EncodingKind::Numeric { .. }) => {
                for (i, &r) in rows.iter().enumerate() {
                    matrix[[i, encoding.columns.start]] = values[r];
                }
            }
            (CovariateValues::Categorical(values), EncodingKind::Categorical { levels, .. }) => {
                let lookup: AHashMap<&str, usize> = levels
                    .iter()
                    .enumerate()
                    .skip(1)
                    .map(|(j, level)| (level.as_str(), encoding.columns.start + j - 1))
                    .collect();
                for (i, &r) in rows.iter().enumerate() {
                    if let Some(&column) = values[r].as_deref().and_then(|l| lookup.get(l)) {
                        matrix[[i, column]] = 1.0;
                    }
                }
            }
            _ => return Err(ModelError::CovariateKindMismatch(covariate.name.clone())),
        }
    }

    let layout = ModelLayout {
        exposure: exposure_name.to_string(),
        column_names,
        basis_columns,
        knots: knots.clone(),
        encodings,
    };
    ModelMatrix::from_parts(matrix, layout)
}

/// The immutable result of a survey-weighted logistic fit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FittedModel {
    pub coefficients: Coefficients,
    /// Design-based (linearization sandwich) covariance of the coefficients.
    pub covariance: Array2<f64>,
    /// Model-based covariance, dispersion times the inverse weighted information.
    pub model_covariance: Array2<f64>,
    pub dispersion: f64,
    pub deviance: f64,
    pub iterations: usize,
    pub converged: bool,
    pub num_observations: usize,
    pub design_df: usize,
    pub layout: ModelLayout,
}

#[derive(Error, Debug)]
pub enum ModelFileError {
    #[error("Failed to read or write model file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse TOML model file: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Failed to serialize model to TOML format: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

impl FittedModel {
    pub fn column_names(&self) -> &[String] {
        &self.layout.column_names
    }

    pub fn basis_column_names(&self) -> &[String] {
        self.layout.basis_column_names()
    }

    pub fn knots(&self) -> &KnotSet {
        &self.layout.knots
    }

    pub fn representative_values(&self) -> Vec<CovariateValue> {
        self.layout.representative_values()
    }

    /// Linear predictor for rows laid out like the fitted model matrix.
    pub fn linear_predictor(&self, x: ArrayView2<f64>) -> Result<LinearPredictor, ModelError> {
        if x.ncols() != self.coefficients.len() {
            return Err(ModelError::ColumnCountMismatch {
                found: x.ncols(),
                expected: self.coefficients.len(),
            });
        }
        Ok(LinearPredictor::new(x.dot(&*self.coefficients)))
    }

    /// Writes the model as human-readable TOML.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ModelFileError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ModelFileError> {
        let toml_string = fs::read_to_string(path)?;
        let model = toml::from_str(&toml_string)?;
        Ok(model)
    }
}

mod internal {
    use super::*;

    pub(super) fn encode_covariate(
        covariate: &Covariate,
        rows: &[usize],
        first_column: usize,
    ) -> Result<CovariateEncoding, ModelError> {
        match &covariate.values {
            CovariateValues::Numeric(values) => {
                let selected: Array1<f64> = rows.iter().map(|&r| values[r]).collect();
                if let Some(i) = selected.iter().position(|v| !v.is_finite()) {
                    return Err(ModelError::MissingValue {
                        column: covariate.name.clone(),
                        row: rows[i],
                    });
                }
                let representative = basis::quantiles(selected.view(), &[0.5])
                    .and_then(|q| q.first().copied())
                    .ok_or(ModelError::NoRows)?;
                Ok(CovariateEncoding {
                    name: covariate.name.clone(),
                    columns: first_column..first_column + 1,
                    kind: EncodingKind::Numeric { representative },
                })
            }
            CovariateValues::Categorical(values) => {
                let mut counts: AHashMap<&str, usize> = AHashMap::new();
                for &r in rows {
                    let level = values[r].as_deref().ok_or_else(|| ModelError::MissingValue {
                        column: covariate.name.clone(),
                        row: r,
                    })?;
                    *counts.entry(level).or_insert(0) += 1;
                }
                let mut levels: Vec<String> = counts.keys().map(|l| l.to_string()).collect();
                levels.sort_by(|a, b| natord::compare(a, b));

                // Strictly greater keeps the earliest level on ties.
                let mut representative = levels[0].clone();
                let mut best = 0usize;
                for level in &levels {
                    let count = counts.get(level.as_str()).copied().unwrap_or(0);
                    if count > best {
                        best = count;
                        representative = level.clone();
                    }
                }

                Ok(CovariateEncoding {
                    name: covariate.name.clone(),
                    columns: first_column..first_column + levels.len() - 1,
                    kind: EncodingKind::Categorical {
                        reference: levels[0].clone(),
                        levels,
                        representative,
                    },
                })
            }
        }
    }
}
