use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{ArgAction, Args, Parser, Subcommand};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

use inbox_etl::Error;
use inbox_etl::config::{
    ConfigSources, ExtractSource, MonitoringConfig, PipelineConfig, RunOverrides,
};
use inbox_etl::context::RunMode;
use inbox_etl::error::PipelineError;
use inbox_etl::metrics::{RunMetrics, read_metrics_file};
use inbox_etl::pipeline::{Batch, RunReport, build_orchestrator};

#[derive(Parser)]
#[command(name = "inbox-etl", version)]
#[command(about = "Email batch pipeline: extract, categorize, label, persist", long_about = None)]
struct Cli {
    /// Configuration file (YAML, rooted at `pipeline:`)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// -v for info, -vv for debug (RUST_LOG wins when set)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full pipeline
    Run(RunFlags),

    /// Run a single named stage on a batch file
    RunStage {
        /// Stage name (extract, transform, load, sync)
        stage: String,

        /// JSON batch to feed the stage (empty batch when omitted)
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Where to write the stage's output batch (stdout when omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,

        #[command(flatten)]
        flags: RunFlags,
    },

    /// Check a configuration file and report issues without running
    ValidateConfig {
        file: PathBuf,
    },

    /// Print the last exported metrics document
    ShowMetrics {
        /// Metrics file (defaults to pipeline.sync.metrics_path)
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// Write the default configuration as YAML
    GenerateConfig {
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Args, Clone, Default)]
struct RunFlags {
    /// Resolve actions without touching the mail store or the database
    #[arg(long)]
    dry_run: bool,

    /// Dry run that also prints one summary line per email
    #[arg(long)]
    preview: bool,

    /// Use the fixture inbox, keyword categorizer, and an in-memory database
    #[arg(long)]
    test: bool,

    /// Extract source (mail_store | persisted_store)
    #[arg(long)]
    source: Option<ExtractSource>,

    /// Extract query
    #[arg(short, long)]
    query: Option<String>,

    /// Maximum number of emails to extract
    #[arg(short, long)]
    limit: Option<usize>,
}

impl RunFlags {
    fn mode(&self) -> RunMode {
        RunMode {
            dry_run: self.dry_run,
            preview: self.preview,
            test: self.test,
        }
    }

    fn overrides(&self) -> RunOverrides {
        RunOverrides {
            source: self.source,
            query: self.query.clone(),
            limit: self.limit,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run(flags) => {
            let (config, _guard) = prepare(cli.config, &flags, cli.verbose)?;
            run_pipeline(config, flags.mode()).await
        }
        Commands::RunStage {
            stage,
            input,
            output,
            flags,
        } => {
            let (config, _guard) = prepare(cli.config, &flags, cli.verbose)?;
            run_single_stage(config, flags.mode(), &stage, input, output).await
        }
        Commands::ValidateConfig { file } => {
            let _guard = init_tracing(cli.verbose, None);
            validate_config(&file)
        }
        Commands::ShowMetrics { file } => {
            let _guard = init_tracing(cli.verbose, None);
            show_metrics(cli.config, file).await
        }
        Commands::GenerateConfig { output } => generate_config(output),
    }
}

/// Load config, apply flag overrides, start logging.
fn prepare(
    config_path: Option<PathBuf>,
    flags: &RunFlags,
    verbose: u8,
) -> anyhow::Result<(Arc<PipelineConfig>, Option<WorkerGuard>)> {
    let mut config = PipelineConfig::load(&ConfigSources::from_process_env(config_path))
        .context("loading configuration")?;
    config.apply_overrides(&flags.overrides());
    let guard = init_tracing(verbose, Some(&config.monitoring));
    Ok((Arc::new(config), guard))
}

fn init_tracing(verbose: u8, monitoring: Option<&MonitoringConfig>) -> Option<WorkerGuard> {
    let level = match verbose {
        0 => monitoring.map_or("warn", |m| m.log_level.as_str()),
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let console = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    match monitoring.and_then(|m| m.log_dir.as_ref()) {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "inbox-etl.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(console)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(console)
                .init();
            None
        }
    }
}

async fn run_pipeline(config: Arc<PipelineConfig>, mode: RunMode) -> anyhow::Result<ExitCode> {
    let orchestrator = build_orchestrator(config, mode).await?;
    match orchestrator.run(mode).await {
        Ok(report) => {
            print_report(&report);
            Ok(ExitCode::SUCCESS)
        }
        Err(Error::Aborted(aborted)) => {
            eprintln!("❌ {aborted}");
            if !aborted.stages_completed.is_empty() {
                eprintln!(
                    "   Completed before abort: {}",
                    aborted.stages_completed.join(", ")
                );
            }
            print_metrics_summary(&aborted.metrics);
            Ok(ExitCode::FAILURE)
        }
        Err(e) => Err(e.into()),
    }
}

async fn run_single_stage(
    config: Arc<PipelineConfig>,
    mode: RunMode,
    stage: &str,
    input: Option<PathBuf>,
    output: Option<PathBuf>,
) -> anyhow::Result<ExitCode> {
    let batch = match &input {
        Some(path) => read_batch(path)
            .await
            .with_context(|| format!("reading batch from {}", path.display()))?,
        None => Batch::Empty,
    };

    let orchestrator = build_orchestrator(config, mode).await?;
    let report = match orchestrator.run_stage(stage, batch, mode).await {
        Ok(report) => report,
        Err(Error::Aborted(aborted)) => {
            eprintln!("❌ {aborted}");
            print_metrics_summary(&aborted.metrics);
            return Ok(ExitCode::FAILURE);
        }
        Err(e) => return Err(e.into()),
    };

    let json = serde_json::to_string_pretty(&report.output).map_err(PipelineError::from)?;
    match &output {
        Some(path) => {
            tokio::fs::write(path, json)
                .await
                .map_err(PipelineError::from)
                .with_context(|| format!("writing batch to {}", path.display()))?;
            eprintln!("   Output batch: {}", path.display());
        }
        None => println!("{json}"),
    }
    print_report(&report);
    Ok(ExitCode::SUCCESS)
}

async fn read_batch(path: &Path) -> Result<Batch, PipelineError> {
    let text = tokio::fs::read_to_string(path).await?;
    Ok(serde_json::from_str(&text)?)
}

fn validate_config(file: &Path) -> anyhow::Result<ExitCode> {
    let config = PipelineConfig::load(&ConfigSources::new().with_file(file))
        .with_context(|| format!("loading {}", file.display()))?;
    let issues = config.validate();
    if issues.is_empty() {
        println!("✅ {} is valid", file.display());
        return Ok(ExitCode::SUCCESS);
    }
    for issue in &issues {
        println!("{issue}");
    }
    let errors = issues.iter().filter(|i| i.is_error()).count();
    println!(
        "{} issue(s), {errors} blocking",
        issues.len()
    );
    Ok(if errors > 0 {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

async fn show_metrics(
    config_path: Option<PathBuf>,
    file: Option<PathBuf>,
) -> anyhow::Result<ExitCode> {
    let path = match file {
        Some(path) => path,
        None => PipelineConfig::load(&ConfigSources::from_process_env(config_path))?.metrics_file(),
    };
    if path.extension().is_some_and(|ext| ext == "csv") {
        let csv = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading metrics from {}", path.display()))?;
        print!("{csv}");
        return Ok(ExitCode::SUCCESS);
    }
    let metrics = read_metrics_file(&path)
        .await
        .with_context(|| format!("reading metrics from {}", path.display()))?;
    println!("{}", metrics.to_json_pretty()?);
    Ok(ExitCode::SUCCESS)
}

fn generate_config(output: Option<PathBuf>) -> anyhow::Result<ExitCode> {
    let yaml = PipelineConfig::default().to_yaml()?;
    match output {
        Some(path) => {
            std::fs::write(&path, yaml).with_context(|| format!("writing {}", path.display()))?;
            eprintln!("Wrote default configuration to {}", path.display());
        }
        None => print!("{yaml}"),
    }
    Ok(ExitCode::SUCCESS)
}

fn print_report(report: &RunReport) {
    for line in &report.previews {
        println!("{line}");
    }
    eprintln!(
        "✅ Run {} complete: {} extracted, stages: {}",
        report.run_id,
        report.emails_extracted,
        report.stages_completed.join(" → ")
    );
    print_metrics_summary(&report.metrics);
}

fn print_metrics_summary(metrics: &RunMetrics) {
    for stage in &metrics.stages {
        eprintln!(
            "   {:<10} attempted {:>4}  succeeded {:>4}  failed {:>4}  skipped {:>4}  {}ms",
            stage.name,
            stage.attempted,
            stage.succeeded,
            stage.failed,
            stage.unattempted,
            stage.elapsed_ms
        );
    }
    if !metrics.categories.is_empty() {
        let histogram: Vec<String> = metrics
            .categories
            .iter()
            .map(|(category, count)| format!("{category}={count}"))
            .collect();
        eprintln!("   Categories: {}", histogram.join(", "));
    }
    if metrics.fallbacks > 0 {
        eprintln!("   Fallback categorizations: {}", metrics.fallbacks);
    }
    if !metrics.errors.is_empty() {
        eprintln!("   Errors ({}):", metrics.errors.len());
        for error in &metrics.errors {
            eprintln!("     - {error}");
        }
    }
}
