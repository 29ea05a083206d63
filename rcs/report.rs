//! Tab-separated writers for the results and prediction tables, plus the
//! optional per-pair model artifacts.

use crate::batch::{BatchReport, TestResult};
use crate::model::ModelFileError;
use crate::wald::PValue;
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

const MISSING: &str = "NA";

const RESULT_HEADER: [&str; 10] = [
    "outcome",
    "exposure",
    "label",
    "status",
    "failure",
    "n",
    "p_overall",
    "p_nonlinear",
    "p_overall_fdr",
    "p_nonlinear_fdr",
];

const PREDICTION_HEADER: [&str; 7] = ["outcome", "exposure", "x", "yhat", "lower", "upper", "se"];

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("Failed to write delimited output: {0}")]
    Csv(#[from] csv::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to save model artifact: {0}")]
    Model(#[from] ModelFileError),
}

#[derive(Serialize)]
struct ResultRow<'a> {
    outcome: &'a str,
    exposure: &'a str,
    label: &'a str,
    status: &'static str,
    failure: String,
    n: usize,
    p_overall: String,
    p_nonlinear: String,
    p_overall_fdr: String,
    p_nonlinear_fdr: String,
}

#[derive(Serialize)]
struct PredictionRow<'a> {
    outcome: &'a str,
    exposure: &'a str,
    x: f64,
    yhat: f64,
    lower: f64,
    upper: f64,
    se: f64,
}

// Headers are written explicitly so an empty report still has them.
fn tsv_writer<W: Write>(writer: W) -> csv::Writer<W> {
    csv::WriterBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .from_writer(writer)
}

fn format_p(p: Option<f64>) -> String {
    p.map_or_else(|| MISSING.to_string(), |v| v.to_string())
}

fn status(result: &TestResult) -> &'static str {
    match (result.fit(), result.p_nonlinear()) {
        (None, _) => "failed",
        (Some(_), PValue::NotApplicable) => "fitted_linear_only",
        (Some(_), _) => "fitted",
    }
}

/// Writes one row per pair, in batch order.
pub fn write_results<W: Write>(report: &BatchReport, writer: W) -> Result<(), ReportError> {
    let mut wtr = tsv_writer(writer);
    wtr.write_record(RESULT_HEADER)?;
    for result in &report.results {
        let failure = result
            .failure()
            .map_or_else(String::new, |f| format!("{}: {}", f.kind, f.message));
        wtr.serialize(ResultRow {
            outcome: &result.key.outcome,
            exposure: &result.key.exposure,
            label: &result.key.label,
            status: status(result),
            failure,
            n: result.num_observations,
            p_overall: format_p(result.p_overall().value()),
            p_nonlinear: format_p(result.p_nonlinear().value()),
            p_overall_fdr: format_p(result.p_overall_adjusted),
            p_nonlinear_fdr: format_p(result.p_nonlinear_adjusted),
        })?;
    }
    wtr.flush()?;
    Ok(())
}

/// Writes every curve point of every fitted pair.
pub fn write_predictions<W: Write>(report: &BatchReport, writer: W) -> Result<(), ReportError> {
    let mut wtr = tsv_writer(writer);
    wtr.write_record(PREDICTION_HEADER)?;
    for (key, curve) in report.curves() {
        for point in &curve.points {
            wtr.serialize(PredictionRow {
                outcome: &key.outcome,
                exposure: &key.exposure,
                x: point.x,
                yhat: point.odds_ratio,
                lower: point.lower,
                upper: point.upper,
                se: point.se,
            })?;
        }
    }
    wtr.flush()?;
    Ok(())
}

/// Saves each fitted model as `<outcome>__<exposure>.toml` under `dir`.
pub fn save_models(report: &BatchReport, dir: &Path) -> Result<Vec<PathBuf>, ReportError> {
    fs::create_dir_all(dir)?;
    let mut written = Vec::new();
    for result in &report.results {
        if let Some(fit) = result.fit() {
            let file_name = format!(
                "{}__{}.toml",
                sanitize(&result.key.outcome),
                sanitize(&result.key.exposure)
            );
            let path = dir.join(file_name);
            fit.model.save(&path)?;
            written.push(path);
        }
    }
    Ok(written)
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
        .collect()
}
