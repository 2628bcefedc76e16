use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand, ValueEnum};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

mod aggregate;
mod config;
mod dates;
mod db;
mod dedup;
mod detect;
mod error;
mod isolation;
mod models;
mod pipeline;
mod report;
mod stream;

use config::{DateRange, DateSource, FeatureMode, LabelWeighting, PipelineConfig, StreamConfig};
use models::{Granularity, Severity};
use pipeline::PipelineOutput;
use stream::RecordStream;

#[derive(Parser)]
#[command(name = "fda-outbreak")]
#[command(about = "Outbreak signal detection over FDA food adverse-event reports", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Detect anomalous reaction counts and write a ranked report
    Detect {
        #[command(flatten)]
        run: RunArgs,
        #[arg(long, value_enum, default_value_t = OutputFormat::Json)]
        format: OutputFormat,
        /// Write to this file instead of stdout
        #[arg(long)]
        out: Option<PathBuf>,
        /// Entries listed in the markdown report
        #[arg(long, default_value_t = 25)]
        top: usize,
    },
    /// Print corpus metadata and statistics for a sample of reports
    Inspect {
        #[arg(long)]
        input: PathBuf,
        #[arg(long, default_value_t = 1000)]
        sample: u64,
    },
    /// Create or upgrade the database schema
    InitDb,
    /// Run detection and store the results for the dashboard
    Publish {
        #[command(flatten)]
        run: RunArgs,
    },
    /// List recently published runs
    History {
        #[arg(long, default_value_t = 10)]
        limit: i64,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    Json,
    Csv,
    Markdown,
}

#[derive(Args)]
struct RunArgs {
    /// Adverse-event JSON export, or `-` to read standard input
    #[arg(long)]
    input: PathBuf,
    /// TOML file with [stream], [aggregate] and [detect] sections
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long, value_enum)]
    granularity: Option<Granularity>,
    #[arg(long)]
    inclusion_threshold: Option<u64>,
    #[arg(long)]
    rolling_window: Option<usize>,
    #[arg(long)]
    seasonal_period: Option<usize>,
    #[arg(long)]
    zscore_threshold: Option<f64>,
    #[arg(long)]
    residual_threshold: Option<f64>,
    #[arg(long)]
    isolation_threshold: Option<f64>,
    /// Floor on the rolling standard deviation, in counts
    #[arg(long)]
    std_floor: Option<f64>,
    #[arg(long)]
    isolation_trees: Option<usize>,
    #[arg(long)]
    isolation_subsample: Option<usize>,
    #[arg(long, value_enum)]
    isolation_features: Option<FeatureMode>,
    #[arg(long)]
    seed: Option<u64>,
    /// Key of the report array inside a wrapper object
    #[arg(long)]
    results_key: Option<String>,
    /// Distinct report ids tracked exactly before dedup turns probabilistic
    #[arg(long)]
    dedup_capacity: Option<usize>,
    #[arg(long, value_enum)]
    date_source: Option<DateSource>,
    #[arg(long, value_enum)]
    label_weighting: Option<LabelWeighting>,
    #[arg(long, value_enum)]
    min_severity: Option<Severity>,
    /// First day of the analysis range (YYYY-MM-DD)
    #[arg(long, requires = "end")]
    start: Option<NaiveDate>,
    /// Last day of the analysis range, inclusive
    #[arg(long, requires = "start")]
    end: Option<NaiveDate>,
    #[arg(long)]
    max_records: Option<u64>,
}

impl RunArgs {
    fn load_config(&self) -> anyhow::Result<PipelineConfig> {
        let mut config = match &self.config {
            Some(path) => PipelineConfig::from_toml_file(path)
                .with_context(|| format!("failed to load {}", path.display()))?,
            None => PipelineConfig::default(),
        };

        if let Some(value) = self.granularity {
            config.aggregate.granularity = value;
        }
        if let Some(value) = self.inclusion_threshold {
            config.aggregate.inclusion_threshold = value;
        }
        if let Some(value) = self.label_weighting {
            config.aggregate.label_weighting = value;
        }
        if self.min_severity.is_some() {
            config.aggregate.min_severity = self.min_severity;
        }
        if let (Some(start), Some(end)) = (self.start, self.end) {
            config.aggregate.date_range = Some(DateRange { start, end });
        }
        if self.rolling_window.is_some() {
            config.detect.rolling_window = self.rolling_window;
        }
        if self.seasonal_period.is_some() {
            config.detect.seasonal_period = self.seasonal_period;
        }
        if let Some(value) = self.zscore_threshold {
            config.detect.zscore_threshold = value;
        }
        if let Some(value) = self.residual_threshold {
            config.detect.residual_threshold = value;
        }
        if let Some(value) = self.isolation_threshold {
            config.detect.isolation_threshold = value;
        }
        if let Some(value) = self.std_floor {
            config.detect.std_floor = value;
        }
        if let Some(value) = self.isolation_trees {
            config.detect.isolation_trees = value;
        }
        if let Some(value) = self.isolation_subsample {
            config.detect.isolation_subsample = value;
        }
        if let Some(value) = self.isolation_features {
            config.detect.isolation_features = value;
        }
        if let Some(value) = self.seed {
            config.detect.seed = value;
        }
        if let Some(value) = &self.results_key {
            config.stream.results_key = value.clone();
        }
        if let Some(value) = self.dedup_capacity {
            config.stream.dedup_capacity = value;
        }
        if let Some(value) = self.date_source {
            config.stream.date_source = value;
        }
        if self.max_records.is_some() {
            config.stream.max_records = self.max_records;
        }

        config.validate()?;
        Ok(config)
    }
}

async fn execute(run: &RunArgs) -> anyhow::Result<PipelineOutput> {
    let config = run.load_config()?;
    let cancel = CancellationToken::new();

    let interrupt = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupt received, cancelling run");
                cancel.cancel();
            }
        })
    };

    let input = run.input.clone();
    tracing::info!(input = %input.display(), "starting run");
    let result = tokio::task::spawn_blocking(move || {
        if reads_stdin(&input) {
            pipeline::run(std::io::stdin().lock(), &config, &cancel)
        } else {
            pipeline::run_file(&input, &config, &cancel)
        }
    })
    .await
    .context("pipeline task failed")?;
    interrupt.abort();

    result.with_context(|| format!("failed to analyze {}", run.input.display()))
}

fn reads_stdin(input: &Path) -> bool {
    input.as_os_str() == "-"
}

async fn connect() -> anyhow::Result<PgPool> {
    let database_url = std::env::var("DATABASE_URL")
        .context("DATABASE_URL must be set to publish or list runs")?;

    PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .context("failed to connect to Postgres")
}

fn inspect(input: &Path, sample: u64) -> anyhow::Result<()> {
    let config = StreamConfig {
        max_records: Some(sample),
        ..StreamConfig::default()
    };
    let mut records = RecordStream::open(input, config)
        .with_context(|| format!("failed to open {}", input.display()))?;

    let mut dated = 0u64;
    let mut reactions: HashMap<String, u64> = HashMap::new();
    let mut examples = Vec::new();
    for event in records.by_ref() {
        let event = event?;
        if event.date.is_some() {
            dated += 1;
        }
        if examples.len() < 3 {
            examples.push((event.report_id.clone(), event.date, event.product.clone()));
        }
        for label in event.reactions {
            *reactions.entry(label).or_insert(0) += 1;
        }
    }

    if let Some(meta) = records.metadata() {
        println!(
            "Last updated: {}",
            meta["last_updated"].as_str().unwrap_or("n/a")
        );
        match meta["results"]["total"].as_u64() {
            Some(total) => println!("Total records: {total}"),
            None => println!("Total records: n/a"),
        }
    }

    let stats = records.stats();
    println!(
        "Sampled {} raw reports: {} parsed, {} malformed, {} duplicates, {} without reactions",
        stats.raw_items,
        stats.parsed,
        stats.skipped_malformed,
        stats.skipped_duplicate,
        stats.skipped_no_reactions
    );
    if stats.parsed > 0 {
        println!(
            "Reports with a usable date: {} ({:.1}%)",
            dated,
            dated as f64 / stats.parsed as f64 * 100.0
        );
    }

    let mut top: Vec<(String, u64)> = reactions.into_iter().collect();
    top.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    println!("Most frequent reactions:");
    for (label, count) in top.iter().take(10) {
        println!("- {label}: {count}");
    }

    println!("Sample reports:");
    for (id, date, product) in examples {
        println!(
            "- {} on {} ({})",
            id,
            date.map(|d| d.to_string()).unwrap_or_else(|| "unknown date".to_string()),
            product.as_deref().unwrap_or("no product")
        );
    }

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Detect {
            run,
            format,
            out,
            top,
        } => {
            let output = execute(&run).await?;
            let rendered = match format {
                OutputFormat::Json => report::to_json(&output)?.into_bytes(),
                OutputFormat::Markdown => report::build_markdown(&output, top).into_bytes(),
                OutputFormat::Csv => {
                    let mut buffer = Vec::new();
                    report::write_csv(&output.report, &mut buffer)?;
                    buffer
                }
            };

            match out {
                Some(path) => {
                    std::fs::write(&path, rendered)
                        .with_context(|| format!("failed to write {}", path.display()))?;
                    println!(
                        "Report with {} anomalies written to {}.",
                        output.report.len(),
                        path.display()
                    );
                }
                None => std::io::stdout().lock().write_all(&rendered)?,
            }
        }
        Commands::Inspect { input, sample } => {
            inspect(&input, sample)?;
        }
        Commands::InitDb => {
            let pool = connect().await?;
            db::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::Publish { run } => {
            let pool = connect().await?;
            let output = execute(&run).await?;
            let input = run.input.display().to_string();
            let run_id = db::publish_run(&pool, &input, &output).await?;
            println!(
                "Published run {run_id} with {} anomalies across {} labels.",
                output.report.len(),
                output.summary.labels_included
            );
        }
        Commands::History { limit } => {
            let pool = connect().await?;
            let runs = db::fetch_recent_runs(&pool, limit).await?;

            if runs.is_empty() {
                println!("No published runs.");
                return Ok(());
            }

            println!("Recent runs:");
            for run in runs {
                println!(
                    "- {} {} ({}): {} reports, {} labels, {} anomalies, top {}",
                    run.created_at.format("%Y-%m-%d %H:%M"),
                    run.id,
                    run.input,
                    run.parsed,
                    run.labels_included,
                    run.anomaly_count,
                    run.top_label.as_deref().unwrap_or("none")
                );
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_args(args: &[&str]) -> RunArgs {
        let mut argv = vec!["fda-outbreak", "publish", "--input", "events.json"];
        argv.extend_from_slice(args);
        match Cli::try_parse_from(argv).unwrap().command {
            Commands::Publish { run } => run,
            _ => unreachable!(),
        }
    }

    #[test]
    fn flags_override_every_tunable() {
        let config = run_args(&[
            "--std-floor",
            "0.5",
            "--isolation-trees",
            "40",
            "--isolation-subsample",
            "64",
            "--isolation-features",
            "count",
            "--results-key",
            "events",
            "--dedup-capacity",
            "1000",
            "--granularity",
            "week",
            "--start",
            "2024-01-01",
            "--end",
            "2024-06-30",
        ])
        .load_config()
        .unwrap();

        assert_eq!(config.detect.std_floor, 0.5);
        assert_eq!(config.detect.isolation_trees, 40);
        assert_eq!(config.detect.isolation_subsample, 64);
        assert_eq!(config.detect.isolation_features, FeatureMode::Count);
        assert_eq!(config.stream.results_key, "events");
        assert_eq!(config.stream.dedup_capacity, 1000);
        assert_eq!(config.aggregate.granularity, Granularity::Week);
        assert!(config.aggregate.date_range.is_some());
    }

    #[test]
    fn invalid_override_is_rejected() {
        assert!(run_args(&["--isolation-trees", "0"]).load_config().is_err());
    }

    #[test]
    fn dash_selects_standard_input() {
        assert!(reads_stdin(Path::new("-")));
        assert!(!reads_stdin(Path::new("events.json")));
    }
}
