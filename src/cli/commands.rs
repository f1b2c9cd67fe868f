//! CLI command definitions for bench-fleet.
//!
//! Three subcommands: `run` executes one batch in the foreground, `serve`
//! exposes the HTTP API over a batch registry, and `show` prints a stored
//! result.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, warn};

use crate::adapter::AdapterKind;
use crate::api::{self, ApiState};
use crate::batch::{BatchId, BatchSnapshot, BatchStatus, ProgressMonitor, TaskId};
use crate::config::FleetConfig;
use crate::error::{BatchError, ConfigError};
use crate::metrics::MetricsCollector;
use crate::registry::BatchRegistry;
use crate::scheduler::Scheduler;
use crate::store::{FileResultStore, ResultStore};

/// Every task passed (and the threshold, if any, was met).
pub const EXIT_SUCCESS: u8 = 0;
/// Infrastructure failures, cancellation, or pass rate below threshold.
pub const EXIT_FAILURE: u8 = 1;
/// The configuration or the batch options were rejected.
pub const EXIT_CONFIG_ERROR: u8 = 2;

/// Bounded-concurrency runner for terminal-agent evaluation batches.
#[derive(Parser)]
#[command(name = "bench-fleet")]
#[command(about = "Run terminal-agent evaluation batches with bounded concurrency")]
#[command(version)]
#[command(
    long_about = "bench-fleet launches evaluation tasks through a pluggable backend, waits for each to finish, and aggregates pass/fail into one batch result.\n\nExample usage:\n  bench-fleet run --tasks hello-world,fibonacci --concurrency 4 --threshold 0.8"
)]
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
    /// Run one batch to completion.
    Run(RunArgs),

    /// Serve the HTTP API.
    Serve(ServeArgs),

    /// Print a stored batch result.
    Show(ShowArgs),
}

#[derive(clap::Args, Debug)]
pub struct RunArgs {
    /// Comma-separated task ids.
    #[arg(short, long, value_delimiter = ',', conflicts_with = "tasks_file")]
    pub tasks: Vec<String>,

    /// File with one task id per line. Blank lines and `#` comments are skipped.
    #[arg(long)]
    pub tasks_file: Option<PathBuf>,

    /// Maximum tasks in flight at once.
    #[arg(short = 'j', long)]
    pub concurrency: Option<usize>,

    /// Per-task timeout in seconds, covering launch and probe.
    #[arg(long)]
    pub timeout_secs: Option<u64>,

    /// Execution backend (local, container, remote, vm_fleet, scripted).
    #[arg(long)]
    pub adapter: Option<AdapterKind>,

    /// Model passed to the task runner.
    #[arg(short, long)]
    pub model: Option<String>,

    /// Agent passed to the task runner.
    #[arg(long)]
    pub agent: Option<String>,

    /// Dataset passed to the task runner.
    #[arg(long)]
    pub dataset: Option<String>,

    /// Minimum pass rate (0.0 to 1.0) for a zero exit code.
    #[arg(long)]
    pub threshold: Option<f64>,

    /// Directory where the batch result is written.
    #[arg(long)]
    pub results_dir: Option<PathBuf>,

    /// YAML configuration file.
    #[arg(short, long, env = "FLEET_CONFIG")]
    pub config: Option<PathBuf>,

    /// Print the final snapshot as JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(clap::Args, Debug)]
pub struct ServeArgs {
    /// Address to bind, e.g. 0.0.0.0:8080.
    #[arg(short, long)]
    pub bind: Option<String>,

    /// YAML configuration file.
    #[arg(short, long, env = "FLEET_CONFIG")]
    pub config: Option<PathBuf>,
}

#[derive(clap::Args, Debug)]
pub struct ShowArgs {
    /// Batch identifier.
    pub batch_id: String,

    /// Directory holding stored results.
    #[arg(long, default_value = "./fleet-results")]
    pub results_dir: PathBuf,

    /// Print the snapshot as JSON.
    #[arg(long)]
    pub json: bool,
}

/// Parse CLI arguments without running any command.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<ExitCode> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
///
/// Configuration errors are reported and mapped to exit code 2; other
/// errors propagate to the caller.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<ExitCode> {
    let result = match cli.command {
        Commands::Run(args) => run_batch_command(args).await,
        Commands::Serve(args) => run_serve_command(args).await,
        Commands::Show(args) => run_show_command(args).await,
    };

    match result {
        Ok(code) => Ok(ExitCode::from(code)),
        Err(err) => match config_error(&err) {
            Some(cfg) => {
                error!(error = %cfg, "Configuration rejected");
                eprintln!("error: {cfg}");
                Ok(ExitCode::from(EXIT_CONFIG_ERROR))
            }
            None => Err(err),
        },
    }
}

/// Exit code for a finished batch.
pub fn exit_code_for(snapshot: &BatchSnapshot, threshold: Option<f64>) -> u8 {
    if snapshot.status == BatchStatus::Cancelled || snapshot.infrastructure_failures() > 0 {
        return EXIT_FAILURE;
    }
    match threshold {
        Some(min) if snapshot.pass_rate < min => EXIT_FAILURE,
        _ => EXIT_SUCCESS,
    }
}

fn config_error(err: &anyhow::Error) -> Option<&ConfigError> {
    if let Some(cfg) = err.downcast_ref::<ConfigError>() {
        return Some(cfg);
    }
    match err.downcast_ref::<BatchError>() {
        Some(BatchError::Config(cfg)) => Some(cfg),
        _ => None,
    }
}

// ============================================================================
// run
// ============================================================================

async fn run_batch_command(args: RunArgs) -> anyhow::Result<u8> {
    let mut config = FleetConfig::load(args.config.as_deref())?;
    if let Some(concurrency) = args.concurrency {
        config.scheduler.concurrency = concurrency;
    }
    if let Some(secs) = args.timeout_secs {
        config.scheduler.task_timeout_secs = secs;
    }
    if let Some(kind) = args.adapter {
        config.adapter.kind = kind;
    }
    if let Some(model) = args.model {
        config.launch.model = model;
    }
    if let Some(agent) = args.agent {
        config.launch.agent = agent;
    }
    if let Some(dataset) = args.dataset {
        config.launch.dataset = dataset;
    }
    if let Some(dir) = args.results_dir {
        config.results_dir = dir;
    }
    if let Some(threshold) = args.threshold {
        if !(0.0..=1.0).contains(&threshold) {
            return Err(ConfigError::InvalidValue {
                key: "threshold".to_string(),
                message: format!("{} is outside 0.0..=1.0", threshold),
            }
            .into());
        }
    }
    config.validate()?;

    let task_ids = match &args.tasks_file {
        Some(path) => read_tasks_file(path)?,
        None => args.tasks.iter().map(|s| TaskId::new(s.trim())).collect(),
    };
    if task_ids.is_empty() {
        return Err(ConfigError::NoTasks.into());
    }

    let store = FileResultStore::new(&config.results_dir);
    let scheduler = build_scheduler(&config, Arc::new(store.clone()))?;

    info!(
        tasks = task_ids.len(),
        concurrency = config.scheduler.concurrency,
        backend = scheduler.backend(),
        model = %config.launch.model,
        "Starting batch"
    );

    let handle = scheduler.spawn_batch(task_ids, config.batch_options())?;
    let batch_id = handle.batch_id().clone();
    let monitor = ProgressMonitor::start(Arc::clone(handle.state()), config.progress_interval());

    let cancel = handle.cancel_token();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling batch");
            cancel.cancel();
        }
    });

    let joined = handle.join().await;
    interrupt.abort();
    monitor.stop().await;
    let state = joined?;

    let snapshot = state.snapshot();
    if args.json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    } else {
        print_summary(&snapshot);
        if let Ok(path) = store.path_for(&batch_id) {
            println!("  Results:   {}", path.display());
        }
    }

    Ok(exit_code_for(&snapshot, args.threshold))
}

fn read_tasks_file(path: &Path) -> Result<Vec<TaskId>, ConfigError> {
    let raw = std::fs::read_to_string(path)?;
    Ok(raw
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(TaskId::from)
        .collect())
}

fn build_scheduler(
    config: &FleetConfig,
    store: Arc<dyn ResultStore>,
) -> Result<Scheduler, ConfigError> {
    let pair = config.adapter.build()?;
    Ok(Scheduler::from_pair(pair)
        .with_store(store)
        .with_metrics(MetricsCollector::new()))
}

fn print_summary(snapshot: &BatchSnapshot) {
    println!("\n=== Batch {} ===", snapshot.batch_id);
    println!("Status:       {}", snapshot.status);
    println!("Total tasks:  {}", snapshot.total);
    println!("Passed:       {}", snapshot.passed);
    println!("Failed:       {}", snapshot.failed);
    println!("Pass rate:    {:.1}%", snapshot.pass_rate * 100.0);
    if let Some(duration) = snapshot.duration() {
        println!("Duration:     {:.1}s", duration.as_secs_f64());
    }
    for (label, count) in snapshot.outcome_counts() {
        println!("  {label:<14}{count}");
    }

    let failures: Vec<_> = snapshot
        .tasks
        .iter()
        .filter(|(_, record)| !record.outcome.is_passed())
        .collect();
    if !failures.is_empty() {
        println!();
        for (task_id, record) in failures {
            match record.outcome.message() {
                Some(msg) => println!("  [{}] {}: {}", record.outcome.label(), task_id, msg),
                None => println!("  [{}] {}", record.outcome.label(), task_id),
            }
        }
    }
}

// ============================================================================
// serve
// ============================================================================

async fn run_serve_command(args: ServeArgs) -> anyhow::Result<u8> {
    let mut config = FleetConfig::load(args.config.as_deref())?;
    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }
    config.validate()?;

    let addr = config
        .server
        .bind
        .parse()
        .map_err(|_| ConfigError::InvalidValue {
            key: "bind".to_string(),
            message: format!("'{}' is not a socket address", config.server.bind),
        })?;

    let store = Arc::new(FileResultStore::new(&config.results_dir));
    let scheduler = build_scheduler(&config, store)?;
    info!(backend = scheduler.backend(), "Execution backend ready");

    let registry = Arc::new(BatchRegistry::new(scheduler, config.retention()));
    let sweeper = registry.spawn_sweeper(config.sweep_interval());

    let state = ApiState::new(
        Arc::clone(&registry),
        config.batch_options(),
        config.scheduler.max_concurrency,
    );
    let shutdown = async {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutting down");
        }
    };
    let served = api::serve(addr, state, shutdown).await;
    sweeper.abort();
    served?;

    Ok(EXIT_SUCCESS)
}

// ============================================================================
// show
// ============================================================================

async fn run_show_command(args: ShowArgs) -> anyhow::Result<u8> {
    let store = FileResultStore::new(&args.results_dir);
    let snapshot = store.load(&BatchId::from(args.batch_id)).await?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    } else {
        print_summary(&snapshot);
    }
    Ok(EXIT_SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{BatchState, Outcome};
    use clap::CommandFactory;

    fn finished(outcomes: &[Outcome]) -> BatchSnapshot {
        let ids: Vec<TaskId> = (0..outcomes.len())
            .map(|i| TaskId::new(format!("task-{i}")))
            .collect();
        let state = BatchState::new(BatchId::from("batch_test"), &ids);
        for (id, outcome) in ids.iter().zip(outcomes) {
            state
                .record(id, outcome.clone(), Duration::from_millis(5))
                .unwrap();
        }
        state.finalize().unwrap();
        state.snapshot()
    }

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_run_args() {
        let cli = Cli::try_parse_from([
            "bench-fleet",
            "run",
            "--tasks",
            "a,b,c",
            "-j",
            "4",
            "--adapter",
            "scripted",
            "--threshold",
            "0.5",
        ])
        .unwrap();
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.tasks, vec!["a", "b", "c"]);
        assert_eq!(args.concurrency, Some(4));
        assert_eq!(args.adapter, Some(AdapterKind::Scripted));
        assert_eq!(args.threshold, Some(0.5));
    }

    #[test]
    fn test_parse_rejects_unknown_adapter() {
        let result = Cli::try_parse_from(["bench-fleet", "run", "--tasks", "a", "--adapter", "lambda"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_exit_code_all_passed() {
        let snap = finished(&[Outcome::Passed, Outcome::Passed]);
        assert_eq!(exit_code_for(&snap, None), EXIT_SUCCESS);
        assert_eq!(exit_code_for(&snap, Some(1.0)), EXIT_SUCCESS);
    }

    #[test]
    fn test_exit_code_threshold() {
        let snap = finished(&[
            Outcome::Passed,
            Outcome::Failed {
                reason: "tests failed".into(),
            },
        ]);
        assert_eq!(exit_code_for(&snap, None), EXIT_SUCCESS);
        assert_eq!(exit_code_for(&snap, Some(0.5)), EXIT_SUCCESS);
        assert_eq!(exit_code_for(&snap, Some(0.75)), EXIT_FAILURE);
    }

    #[test]
    fn test_exit_code_infrastructure_failure() {
        let snap = finished(&[
            Outcome::Passed,
            Outcome::LaunchFailed {
                error: "no docker".into(),
            },
        ]);
        assert_eq!(exit_code_for(&snap, None), EXIT_FAILURE);
        assert_eq!(exit_code_for(&snap, Some(0.0)), EXIT_FAILURE);
    }

    #[test]
    fn test_exit_code_cancelled() {
        let ids = vec![TaskId::from("a")];
        let state = BatchState::new(BatchId::from("batch_c"), &ids);
        state.seal_cancelled();
        assert_eq!(exit_code_for(&state.snapshot(), None), EXIT_FAILURE);
    }

    #[test]
    fn test_config_error_detection() {
        let err: anyhow::Error = BatchError::Config(ConfigError::InvalidTimeout).into();
        assert!(config_error(&err).is_some());
        let err: anyhow::Error = ConfigError::NoTasks.into();
        assert!(config_error(&err).is_some());
        let err = anyhow::anyhow!("network down");
        assert!(config_error(&err).is_none());
    }

    #[test]
    fn test_read_tasks_file_skips_comments() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.txt");
        std::fs::write(&path, "hello-world\n\n# comment\n  fibonacci  \n").unwrap();
        let ids = read_tasks_file(&path).unwrap();
        assert_eq!(ids, vec![TaskId::from("hello-world"), TaskId::from("fibonacci")]);
    }
}
