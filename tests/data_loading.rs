use approx::assert_abs_diff_eq;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fmt::Write as _;
use std::fs;
use tempfile::TempDir;

use svyrcs::batch::{FailureKind, NoopProgress, run_batch};
use svyrcs::config::AnalysisConfig;
use svyrcs::data::load_table;
use svyrcs::model::FittedModel;
use svyrcs::predict::predict_curve;
use svyrcs::report::{save_models, write_predictions, write_results};

const CONFIG: &str = r#"
min_observations = 40
threads = 2

[columns]
outcome = "depressed"
unit = "cycle"
weight = "wtmec"
strata = "sdmvstra"
psu = "sdmvpsu"

[[exposures]]
column = "lead"
label = "Blood lead"

[[exposures]]
column = "cadmium"

[[covariates]]
column = "age"
kind = "numeric"

[[covariates]]
column = "sex"
kind = "categorical"

[curve]
points = 25
reference = 2.0

[testing]
statistic = "f"
"#;

/// Two survey cycles; cadmium is constant in the second one.
fn survey_table(rng: &mut StdRng) -> String {
    let mut text = String::from("cycle\tdepressed\twtmec\tsdmvstra\tsdmvpsu\tlead\tcadmium\tage\tsex\n");
    for cycle in ["2015", "2017"] {
        for i in 0..300 {
            let stratum = 100 + i % 10;
            let psu = 1 + (i / 10) % 2;
            let lead: f64 = rng.gen_range(0.2..6.0);
            let cadmium: f64 = if cycle == "2017" { 0.3 } else { rng.gen_range(0.1..1.5) };
            let age: f64 = rng.gen_range(20.0..80.0);
            let sex = if rng.gen_bool(0.5) { "F" } else { "M" };
            let eta = -1.0 + 0.4 * (lead - 2.0) - 0.05 * (lead - 2.0).powi(2) + 0.01 * (age - 50.0);
            let p = 1.0 / (1.0 + (-eta).exp());
            let depressed = if rng.gen_bool(p) { "1" } else { "0" };
            // A few missing exposures and outcomes.
            let lead_cell = if i % 97 == 3 { "NA".to_string() } else { format!("{lead:.4}") };
            let outcome_cell = if i % 113 == 7 { "NA" } else { depressed };
            let weight: f64 = rng.gen_range(5000.0..40000.0);
            writeln!(
                text,
                "{cycle}\t{outcome_cell}\t{weight:.1}\t{stratum}\t{psu}\t{lead_cell}\t{cadmium:.4}\t{age:.1}\t{sex}"
            )
            .unwrap();
        }
    }
    text
}

fn write_inputs(dir: &TempDir) -> (std::path::PathBuf, AnalysisConfig) {
    let mut rng = StdRng::seed_from_u64(1999);
    let data_path = dir.path().join("survey.tsv");
    fs::write(&data_path, survey_table(&mut rng)).unwrap();
    let config_path = dir.path().join("analysis.toml");
    fs::write(&config_path, CONFIG).unwrap();
    (data_path, AnalysisConfig::load(&config_path).unwrap())
}

#[test]
fn table_to_reports() {
    let dir = TempDir::new().unwrap();
    let (data_path, config) = write_inputs(&dir);

    let table = load_table(&data_path, &config).unwrap();
    assert_eq!(table.units.len(), 2);
    assert_eq!(table.units[0].name, "2015");
    assert_eq!(table.num_pairs(), 4);
    assert!(table.units[0].exposures[0].values.iter().any(|v| v.is_nan()));

    let report = run_batch(&table, &config, &NoopProgress).unwrap();
    assert_eq!(report.num_fitted(), 3);
    let failed = &report.results[3];
    assert_eq!(failed.key.exposure, "cadmium");
    assert_eq!(failed.failure().map(|f| f.kind), Some(FailureKind::DegenerateKnots));

    let lead = report.results[0].fit().unwrap();
    let test = lead.overall_test.unwrap();
    assert_eq!(test.df, 3);
    // 10 strata x 2 PSUs, 6 coefficients: 10 + 1 - 6.
    assert_eq!(test.denominator_df, Some(5.0));
    assert!(lead.model.column_names().iter().any(|c| c == "sex[M]"));
    assert_eq!(lead.curve.reference, 2.0);

    let mut results = Vec::new();
    write_results(&report, &mut results).unwrap();
    let results = String::from_utf8(results).unwrap();
    let lines: Vec<&str> = results.lines().collect();
    assert_eq!(lines.len(), 5);
    assert!(lines[0].starts_with("outcome\texposure\tlabel\tstatus"));
    assert!(lines[1].starts_with("2015\tlead\tBlood lead\tfitted\t"));
    assert!(lines[2].starts_with("2015\tcadmium\tcadmium\tfitted\t"));
    let failed_fields: Vec<&str> = lines[4].split('\t').collect();
    assert_eq!(failed_fields[3], "failed");
    assert!(failed_fields[4].starts_with("degenerate_knots"));
    assert_eq!(&failed_fields[6..], ["NA", "NA", "NA", "NA"]);

    let mut predictions = Vec::new();
    write_predictions(&report, &mut predictions).unwrap();
    let predictions = String::from_utf8(predictions).unwrap();
    assert_eq!(predictions.lines().count(), 1 + 3 * 25);
    assert_eq!(
        predictions.lines().next(),
        Some("outcome\texposure\tx\tyhat\tlower\tupper\tse")
    );
}

#[test]
fn saved_models_reproduce_their_curves() {
    let dir = TempDir::new().unwrap();
    let (data_path, config) = write_inputs(&dir);
    let table = load_table(&data_path, &config).unwrap();
    let report = run_batch(&table, &config, &NoopProgress).unwrap();

    let written = save_models(&report, &dir.path().join("models")).unwrap();
    assert_eq!(written.len(), 3);
    assert!(written[0].ends_with("2015__lead.toml"));

    let original = report.results[0].fit().unwrap();
    let loaded = FittedModel::load(&written[0]).unwrap();
    assert_eq!(loaded.column_names(), original.model.column_names());
    assert_eq!(loaded.knots(), original.model.knots());

    let grid: Vec<f64> = original.curve.points.iter().map(|p| p.x).collect();
    let options = config.curve.options();
    let curve = predict_curve(
        &loaded,
        &grid,
        loaded.knots(),
        &loaded.representative_values(),
        original.curve.reference,
        &options,
    )
    .unwrap();
    for (a, b) in curve.points.iter().zip(&original.curve.points) {
        assert_abs_diff_eq!(a.odds_ratio, b.odds_ratio, epsilon = 1e-10);
        assert_abs_diff_eq!(a.se, b.se, epsilon = 1e-10);
    }
}
