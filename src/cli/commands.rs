//! CLI command definitions for gradeprobe.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::info;

use crate::pipeline::config::{RunConfig, ServerConfig};
use crate::pipeline::executor::StageExecutor;
use crate::pipeline::processors::{self, HeuristicScoring, ScoringService};
use crate::registry::run::{DocumentSource, RunStatus};
use crate::registry::{RunQuery, RunRegistry};
use crate::server::{start_server, ApiState};
use crate::storage::ArtifactStore;
use crate::sync::{RefreshOptions, StatusClient, StatusPoller};

/// Assessment-attack pipeline for probing automated graders.
#[derive(Parser)]
#[command(name = "gradeprobe")]
#[command(about = "Run substring-substitution attacks against assessment documents")]
#[command(version)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Serve the HTTP API.
    Serve(ServeArgs),

    /// Run the full pipeline against one document and print a summary.
    Run(RunArgs),

    /// List registered pipeline runs.
    List(ListArgs),

    /// Follow a run on a serving instance until it reaches a terminal
    /// status.
    Watch(WatchArgs),
}

/// Arguments for `gradeprobe serve`.
#[derive(Parser, Debug)]
pub struct ServeArgs {
    /// Bind address, overriding GRADEPROBE_BIND_ADDR.
    #[arg(long)]
    pub bind: Option<String>,

    /// Registry directory, overriding GRADEPROBE_DATA_PATH.
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Artifact base directory, overriding GRADEPROBE_ARTIFACT_PATH.
    #[arg(long)]
    pub artifact_dir: Option<PathBuf>,
}

/// Arguments for `gradeprobe run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Question paper file.
    pub file: PathBuf,

    /// Answer key file.
    #[arg(long)]
    pub answer_key: Option<PathBuf>,

    /// Registry directory.
    #[arg(long, default_value = "./data")]
    pub data_dir: PathBuf,

    /// Artifact base directory.
    #[arg(long, default_value = "./artifacts")]
    pub artifact_dir: PathBuf,
}

/// Arguments for `gradeprobe list`.
#[derive(Parser, Debug)]
pub struct ListArgs {
    /// Keep only runs with this status (pending, running,
    /// paused_for_mapping, completed, failed).
    #[arg(long)]
    pub status: Option<String>,

    /// Include soft-deleted runs.
    #[arg(long)]
    pub include_deleted: bool,

    /// Maximum number of runs to print.
    #[arg(long, default_value = "20")]
    pub limit: usize,

    /// Registry directory.
    #[arg(long, default_value = "./data")]
    pub data_dir: PathBuf,
}

/// Arguments for `gradeprobe watch`.
#[derive(Parser, Debug)]
pub struct WatchArgs {
    /// Run to follow.
    pub run_id: uuid::Uuid,

    /// Base URL of the serving instance.
    #[arg(long, default_value = "http://127.0.0.1:8080")]
    pub server: String,
}

/// Parses CLI arguments without executing anything.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Executes a parsed CLI invocation.
///
/// # Errors
///
/// Returns an error when the invoked command fails.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Serve(args) => serve(args).await,
        Commands::Run(args) => run_once(args).await,
        Commands::List(args) => list(args).await,
        Commands::Watch(args) => watch(args).await,
    }
}

async fn build_executor(
    data_dir: &PathBuf,
    artifact_dir: &PathBuf,
    scoring: Arc<dyn ScoringService>,
) -> anyhow::Result<(Arc<RunRegistry>, StageExecutor, ArtifactStore)> {
    let registry = Arc::new(RunRegistry::open(data_dir).await?);
    let artifacts = ArtifactStore::new(artifact_dir.clone());
    let processors = processors::builtin(scoring);
    let executor = StageExecutor::new(Arc::clone(&registry), artifacts.clone(), processors);
    Ok((registry, executor, artifacts))
}

async fn serve(args: ServeArgs) -> anyhow::Result<()> {
    let mut config = ServerConfig::from_env()?;
    if let Some(bind) = args.bind {
        config.bind_addr = bind;
    }
    if let Some(data_dir) = args.data_dir {
        config.data_path = data_dir;
    }
    if let Some(artifact_dir) = args.artifact_dir {
        config.artifact_path = artifact_dir;
    }
    config.validate()?;

    let scoring: Arc<dyn ScoringService> = Arc::new(HeuristicScoring);
    let (registry, executor, artifacts) =
        build_executor(&config.data_path, &config.artifact_path, Arc::clone(&scoring)).await?;
    let state = ApiState::new(registry, executor, artifacts, scoring);
    start_server(&config.bind_addr, state).await?;
    Ok(())
}

async fn run_once(args: RunArgs) -> anyhow::Result<()> {
    let (registry, executor, artifacts) =
        build_executor(&args.data_dir, &args.artifact_dir, Arc::new(HeuristicScoring)).await?;

    let document = DocumentSource::File {
        path: args.file,
        answer_key_path: args.answer_key,
    };
    let run_id = executor.create(document, RunConfig::default()).await?;
    info!(run_id = %run_id, "Created pipeline run");

    // First leg runs to the pause point; with no interactive mapping
    // edits the second leg carries the run to completion.
    executor.start(run_id).await?;
    let run = registry.get(run_id).await?;
    if run.status == RunStatus::PausedForMapping {
        executor.resume_from_stage(run_id, None, None).await?;
    }

    let run = registry.get(run_id).await?;
    println!("Run {}: {}", run.id, run.status);
    for record in &run.stages {
        let detail = match &record.error {
            Some(error) => format!(" ({error})"),
            None => String::new(),
        };
        println!(
            "  {:22} {:?} {}ms{}",
            record.name.to_string(),
            record.status,
            record.duration_ms,
            detail
        );
    }
    if let Some(report) = &run.structured_data.report {
        println!(
            "Questions: {} total, {} manipulated, {} mappings",
            report.total_questions, report.manipulated_questions, report.total_mappings
        );
        println!(
            "Report: {}",
            artifacts.run_root(run_id).join(&report.artifact).display()
        );
    }
    Ok(())
}

async fn watch(args: WatchArgs) -> anyhow::Result<()> {
    let config = ServerConfig::from_env()?;
    let client = StatusClient::new(&args.server);

    // The first refresh is loud and absorbs the post-write visibility
    // gap with the configured retry budget.
    let options = RefreshOptions {
        quiet: false,
        retries: config.refresh_retries,
        retry_delay: config.refresh_retry_delay,
    };
    let view = client.refresh(args.run_id, &options).await?;
    println!("{}  {}  {}", view.id, view.status, view.current_stage);
    if view.status.is_terminal() {
        return Ok(());
    }

    let poller = StatusPoller::start(client, args.run_id, config.poll_interval);
    let mut updates = poller.subscribe();
    while updates.changed().await.is_ok() {
        let view = updates.borrow().clone();
        if let Some(view) = view {
            println!("{}  {}  {}", view.id, view.status, view.current_stage);
            if view.status.is_terminal() {
                break;
            }
        }
    }
    Ok(())
}

async fn list(args: ListArgs) -> anyhow::Result<()> {
    let registry = RunRegistry::open(&args.data_dir).await?;
    let status = match args.status.as_deref() {
        Some(s) => Some(
            serde_json::from_value(serde_json::Value::String(s.to_string()))
                .map_err(|_| anyhow::anyhow!("Unknown status '{s}'"))?,
        ),
        None => None,
    };

    let page = registry
        .list(&RunQuery {
            status,
            include_deleted: args.include_deleted,
            limit: Some(args.limit),
            ..RunQuery::default()
        })
        .await;

    println!("{} run(s), {} total", page.runs.len(), page.total);
    for run in &page.runs {
        let deleted = if run.deleted { " [deleted]" } else { "" };
        println!(
            "{}  {:18} {:22} {}{}",
            run.id,
            run.status.to_string(),
            run.current_stage.to_string(),
            run.document.name(),
            deleted
        );
    }
    Ok(())
}
