use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use wayfinder_client::{AdapterFactory, builtin_sources};
use wayfinder_core::adapter::ExtractOptions;
use wayfinder_core::config::{SourceConfig, load_sources};
use wayfinder_core::error_handler::{ErrorFilter, ErrorHandler, ErrorHandlerConfig, Severity};
use wayfinder_core::job::{CreateJobRequest, DuplicatePolicy, JobOptions, JobStatus, PipelineConfig};
use wayfinder_core::models::{Category, ExportFormat};
use wayfinder_core::pipeline::PipelineManager;
use wayfinder_core::quality::{QualityConfig, QualityEngine};
use wayfinder_core::traits::{NullStore, ServiceFilter, ServiceStore};
use wayfinder_db::{Database, DatabaseConfig, ServiceRepository};

#[derive(Parser)]
#[command(name = "wayfinder", version, about = "Youth service directory ingestion pipeline")]
struct Cli {
    /// TOML file with extra `[[sources]]`; entries replace built-ins of the same name
    #[arg(long, global = true, env = "WAYFINDER_SOURCES")]
    sources_file: Option<PathBuf>,

    /// Allow fetching from private/loopback addresses
    #[arg(long, global = true, default_value_t = false)]
    allow_private_urls: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the registered sources
    Sources,

    /// Validate every source and pull a small sample from each
    Validate,

    /// Run ingestion jobs
    Run(RunArgs),

    /// Export quality assessments of stored services (requires DATABASE_URL)
    Report {
        /// Output file; stdout when omitted
        #[arg(short, long)]
        output: Option<PathBuf>,

        #[arg(short, long, value_enum, default_value_t = Format::Json)]
        format: Format,

        /// Only services from these sources
        #[arg(short, long)]
        source: Vec<String>,

        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Export entries from the error log
    Errors {
        /// JSON-lines error log written by `run --error-log`
        #[arg(long, env = "WAYFINDER_ERROR_LOG")]
        log_file: PathBuf,

        #[arg(short, long)]
        output: PathBuf,

        #[arg(short, long, value_enum, default_value_t = Format::Json)]
        format: Format,

        #[arg(short, long)]
        source: Option<String>,

        #[arg(long, value_enum)]
        min_level: Option<Level>,

        /// RFC 3339 timestamp
        #[arg(long)]
        since: Option<DateTime<Utc>>,

        /// RFC 3339 timestamp
        #[arg(long)]
        until: Option<DateTime<Utc>>,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Sources to run; all registered sources when omitted
    #[arg(short, long)]
    source: Vec<String>,

    /// Maximum services per source
    #[arg(short, long, default_value_t = 1000)]
    limit: usize,

    /// Higher runs first
    #[arg(short, long, default_value_t = 5)]
    priority: u8,

    #[arg(long)]
    min_quality: Option<f64>,

    #[arg(long, default_value_t = false)]
    no_dedup: bool,

    #[arg(long, default_value_t = false)]
    no_quality_filter: bool,

    /// keep, flag or drop
    #[arg(long, default_value = "flag")]
    duplicates: DuplicatePolicy,

    /// Only these categories (e.g. legal_aid)
    #[arg(long)]
    category: Vec<Category>,

    #[arg(long)]
    region: Vec<String>,

    #[arg(long)]
    dataset: Vec<String>,

    #[arg(long, default_value_t = false)]
    youth_only: bool,

    /// Store results in PostgreSQL (requires DATABASE_URL)
    #[arg(long, default_value_t = false)]
    save: bool,

    #[arg(long, default_value_t = 3)]
    concurrency: usize,

    #[arg(long, default_value_t = 3)]
    retries: u32,

    #[arg(long, default_value_t = 5000)]
    retry_delay_ms: u64,

    /// Append error entries to this JSON-lines file
    #[arg(long, env = "WAYFINDER_ERROR_LOG")]
    error_log: Option<PathBuf>,
}

#[derive(Clone, Copy, ValueEnum)]
enum Format {
    Json,
    Csv,
}

impl From<Format> for ExportFormat {
    fn from(f: Format) -> Self {
        match f {
            Format::Json => ExportFormat::Json,
            Format::Csv => ExportFormat::Csv,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum Level {
    Low,
    Medium,
    High,
    Critical,
}

impl From<Level> for Severity {
    fn from(l: Level) -> Self {
        match l {
            Level::Low => Severity::Low,
            Level::Medium => Severity::Medium,
            Level::High => Severity::High,
            Level::Critical => Severity::Critical,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("wayfinder=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let sources = load_registry(cli.sources_file.as_deref())?;
    let mut factory = AdapterFactory::new();
    if cli.allow_private_urls {
        factory = factory.allow_private_urls();
    }

    match cli.command {
        Commands::Sources => cmd_sources(&sources),
        Commands::Validate => cmd_validate(&factory, sources).await,
        Commands::Run(args) => {
            if args.save {
                let repo = connect_db().await?;
                cmd_run(&factory, sources, args, repo).await
            } else {
                cmd_run(&factory, sources, args, NullStore).await
            }
        }
        Commands::Report {
            output,
            format,
            source,
            limit,
        } => cmd_report(output.as_deref(), format.into(), source, limit).await,
        Commands::Errors {
            log_file,
            output,
            format,
            source,
            min_level,
            since,
            until,
        } => {
            let filter = ErrorFilter {
                source,
                min_level: min_level.map(Into::into),
                since,
                until,
            };
            cmd_errors(log_file, &output, &filter, format.into())
        }
    }
}

/// Built-in sources, overridden or extended by the sources file.
fn load_registry(sources_file: Option<&Path>) -> Result<Vec<SourceConfig>> {
    let mut sources = builtin_sources();
    if let Some(path) = sources_file {
        let extra = load_sources(path).map_err(|e| anyhow::anyhow!(e))?;
        tracing::info!(path = %path.display(), count = extra.len(), "Loaded sources file");
        for source in extra {
            match sources.iter_mut().find(|s| s.name == source.name) {
                Some(existing) => *existing = source,
                None => sources.push(source),
            }
        }
    }
    Ok(sources)
}

async fn connect_db() -> Result<ServiceRepository> {
    let config = DatabaseConfig::from_env().map_err(|e| anyhow::anyhow!(e))?;
    let db = Database::connect(&config)
        .await
        .map_err(|e| anyhow::anyhow!(e))
        .context("Failed to connect to database")?;
    db.migrate().await.map_err(|e| anyhow::anyhow!(e))?;
    Ok(db.service_repo())
}

fn cmd_sources(sources: &[SourceConfig]) -> Result<()> {
    for source in sources {
        println!(
            "{:<16} {:<8} datasets={:<3} robots={:<5} {}",
            source.name,
            source.kind.as_str(),
            source.datasets_for(&[]).len(),
            source.respect_robots_txt,
            source.base_url
        );
    }
    println!("\nTotal: {} sources", sources.len());
    Ok(())
}

async fn cmd_validate(factory: &AdapterFactory, sources: Vec<SourceConfig>) -> Result<()> {
    let adapters = factory.build_all(sources).map_err(|e| anyhow::anyhow!(e))?;
    let mut builder = PipelineManager::builder(NullStore);
    for adapter in adapters {
        builder = builder.with_adapter(adapter);
    }
    let pm = builder.build().map_err(|e| anyhow::anyhow!(e))?;

    let checks = pm.check_sources().await;
    let invalid = checks.iter().filter(|c| !c.validation.is_valid).count();
    for check in &checks {
        let status = if check.validation.is_valid { "OK" } else { "FAILED" };
        println!("  [{status}] {}: {}", check.source, check.validation.message);
        match &check.sample_error {
            Some(e) => println!("         sample failed: {e}"),
            None => println!("         sample: {} services", check.sample_size),
        }
    }

    if invalid > 0 {
        bail!("{invalid} of {} sources failed validation", checks.len());
    }
    Ok(())
}

async fn cmd_run<S: ServiceStore + 'static>(
    factory: &AdapterFactory,
    sources: Vec<SourceConfig>,
    args: RunArgs,
    store: S,
) -> Result<()> {
    let selected: Vec<SourceConfig> = if args.source.is_empty() {
        sources
    } else {
        let mut picked = Vec::new();
        for name in &args.source {
            let Some(source) = sources.iter().find(|s| &s.name == name) else {
                bail!("Unknown source: {name}");
            };
            picked.push(source.clone());
        }
        picked
    };

    let errors = ErrorHandler::new(ErrorHandlerConfig {
        log_file: args.error_log.clone(),
        ..Default::default()
    })
    .map_err(|e| anyhow::anyhow!(e))?;

    let config = PipelineConfig::default()
        .with_max_concurrent_jobs(args.concurrency)
        .with_retry(args.retries, Duration::from_millis(args.retry_delay_ms));

    let mut builder = PipelineManager::builder(store)
        .with_config(config)
        .with_error_handler(errors);
    for adapter in factory.build_all(selected).map_err(|e| anyhow::anyhow!(e))? {
        builder = builder.with_adapter(adapter);
    }
    let pm = builder.build().map_err(|e| anyhow::anyhow!(e))?;

    let options = JobOptions {
        extract: ExtractOptions {
            limit: Some(args.limit),
            offset: 0,
            categories: args.category,
            regions: args.region,
            youth_only: args.youth_only,
            datasets: args.dataset,
        },
        dedup: !args.no_dedup,
        quality_filter: !args.no_quality_filter,
        save: args.save,
        min_quality_score: args.min_quality,
        duplicate_policy: args.duplicates,
    };

    for name in pm.adapter_names() {
        let request = CreateJobRequest::new(name)
            .with_priority(args.priority)
            .with_options(options.clone());
        pm.create_job(request).await.map_err(|e| anyhow::anyhow!(e))?;
    }

    tokio::select! {
        () = pm.wait_idle() => {}
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for ctrl-c")?;
            tracing::warn!("Interrupted, cancelling jobs");
            pm.shutdown().await;
        }
    }

    let jobs = pm.get_all_jobs();
    let stats = pm.get_stats();
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({ "jobs": jobs, "stats": stats }))?
    );

    let failed = jobs.iter().filter(|j| j.status == JobStatus::Failed).count();
    if failed > 0 {
        bail!("{failed} of {} jobs failed", jobs.len());
    }
    Ok(())
}

async fn cmd_report(
    output: Option<&Path>,
    format: ExportFormat,
    sources: Vec<String>,
    limit: Option<usize>,
) -> Result<()> {
    let repo = connect_db().await?;
    let filter = ServiceFilter {
        data_sources: sources,
        postcodes: Vec::new(),
        limit,
    };
    let assessments = repo
        .assessments(&filter)
        .await
        .map_err(|e| anyhow::anyhow!(e))?;

    let engine = QualityEngine::new(QualityConfig::default()).map_err(|e| anyhow::anyhow!(e))?;
    let report = engine
        .export_report(&assessments, format)
        .map_err(|e| anyhow::anyhow!(e))?;

    match output {
        Some(path) => {
            std::fs::write(path, report)
                .with_context(|| format!("Failed to write report: {}", path.display()))?;
            tracing::info!(path = %path.display(), assessments = assessments.len(), "Quality report written");
        }
        None => println!("{report}"),
    }
    Ok(())
}

fn cmd_errors(
    log_file: PathBuf,
    output: &Path,
    filter: &ErrorFilter,
    format: ExportFormat,
) -> Result<()> {
    if !log_file.exists() {
        bail!("Error log not found: {}", log_file.display());
    }
    let handler = ErrorHandler::new(ErrorHandlerConfig {
        log_file: Some(log_file),
        ..Default::default()
    })
    .map_err(|e| anyhow::anyhow!(e))?;

    let count = handler
        .export_logs(output, filter, format)
        .map_err(|e| anyhow::anyhow!(e))?;
    println!("Exported {count} error entries to {}", output.display());
    Ok(())
}
