#![deny(unused_variables)]
#![deny(unused_imports)]

use clap::{Args, CommandFactory, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use itertools::Itertools;
use std::fs::File;
use std::io::{BufWriter, IsTerminal};
use std::path::PathBuf;
use std::process;

use svyrcs::batch::{BatchProgress, PairFailure, PairKey, plan_knots, run_batch};
use svyrcs::config::AnalysisConfig;
use svyrcs::data::load_table;
use svyrcs::report::{save_models, write_predictions, write_results};

#[derive(Args)]
pub struct RunArgs {
    /// Path to the tab-separated analysis table
    pub data: PathBuf,

    /// Path to the TOML analysis configuration
    #[arg(long)]
    pub config: PathBuf,

    /// Directory for results.tsv and predictions.tsv
    #[arg(long, default_value = ".")]
    pub out_dir: PathBuf,

    /// Also write one model TOML per fitted pair under <out-dir>/models
    #[arg(long)]
    pub save_models: bool,

    /// Override the worker thread count from the configuration
    #[arg(long)]
    pub threads: Option<usize>,
}

#[derive(Args)]
pub struct KnotsArgs {
    /// Path to the tab-separated analysis table
    pub data: PathBuf,

    /// Path to the TOML analysis configuration
    #[arg(long)]
    pub config: PathBuf,
}

#[derive(Parser)]
#[command(
    name = "svyrcs",
    about = "Survey-weighted restricted cubic spline dose-response analysis",
    long_about = "Fits design-weighted logistic models on restricted cubic spline bases for every \
                 outcome/exposure pair, tests overall and nonlinear association, and writes \
                 reference-relative odds-ratio curves with confidence bands."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Fit every pair and write the results and prediction tables
    #[command(about = "Run the dose-response analysis (outputs: results.tsv, predictions.tsv)")]
    Run(RunArgs),

    /// Show the knots each pair would use
    #[command(about = "Print knot placements per outcome/exposure pair")]
    Knots(KnotsArgs),
}

/// Renders batch progress on stderr when it is a terminal.
struct BarProgress {
    bar: ProgressBar,
}

impl BarProgress {
    fn new() -> Self {
        let draw_target = if std::io::stderr().is_terminal() {
            ProgressDrawTarget::stderr_with_hz(20)
        } else {
            ProgressDrawTarget::hidden()
        };
        let bar = ProgressBar::with_draw_target(Some(0), draw_target);
        if let Ok(style) = ProgressStyle::with_template(
            "> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} pairs ({eta}) {msg}",
        ) {
            bar.set_style(style.progress_chars("█▉▊▋▌▍▎▏  "));
        }
        Self { bar }
    }
}

impl BatchProgress for BarProgress {
    fn on_start(&self, total_pairs: usize) {
        self.bar.set_length(total_pairs as u64);
    }

    fn on_pair_finished(&self, key: &PairKey, failure: Option<&PairFailure>) {
        if let Some(failure) = failure {
            self.bar.set_message(format!("{key}: {}", failure.kind));
        }
        self.bar.inc(1);
    }

    fn on_finish(&self) {
        self.bar.finish_and_clear();
    }
}

fn run(args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = AnalysisConfig::load(&args.config)?;
    if let Some(threads) = args.threads {
        config.threads = threads;
    }
    println!("Loading analysis table from: {}", args.data.display());
    let table = load_table(&args.data, &config)?;
    println!(
        "Loaded {} outcome units, {} pairs to analyze",
        table.units.len(),
        table.num_pairs()
    );

    let progress = BarProgress::new();
    let report = run_batch(&table, &config, &progress)?;

    std::fs::create_dir_all(&args.out_dir)?;
    let results_path = args.out_dir.join("results.tsv");
    write_results(&report, BufWriter::new(File::create(&results_path)?))?;
    let predictions_path = args.out_dir.join("predictions.tsv");
    write_predictions(&report, BufWriter::new(File::create(&predictions_path)?))?;

    println!(
        "{} pairs fitted, {} failed",
        report.num_fitted(),
        report.num_failed()
    );
    for result in &report.results {
        if let Some(failure) = result.failure() {
            println!("  {} [{}]: {}", result.key, failure.kind, failure.message);
        }
    }
    println!("Results written to {}", results_path.display());
    println!("Curves written to {}", predictions_path.display());

    if args.save_models {
        let written = save_models(&report, &args.out_dir.join("models"))?;
        println!("Saved {} model files", written.len());
    }
    Ok(())
}

fn knots(args: KnotsArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = AnalysisConfig::load(&args.config)?;
    let table = load_table(&args.data, &config)?;
    for (key, knots) in plan_knots(&table, &config)? {
        match knots {
            Ok(knots) => println!(
                "{key}: [{}]",
                knots.as_slice().iter().map(|k| format!("{k:.4}")).join(", ")
            ),
            Err(failure) => println!("{key}: {} ({})", failure.kind, failure.message),
        }
    }
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    let Cli { command } = cli;

    let result = match command {
        Some(Commands::Run(args)) => run(args),
        Some(Commands::Knots(args)) => knots(args),
        None => {
            let _ = Cli::command().print_help();
            println!();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}
