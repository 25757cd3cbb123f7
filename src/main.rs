use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn};

use stratum::config::{ExecutionConfig, ExecutionStrategy};
use stratum::core::{build_graph_with, detect_conflicts, load_tasks, FileConflict, GraphBuilder, GraphValidation};
use stratum::logging::{init_logging, LogLevel};
use stratum::orchestration::{Orchestrator, RunOptions, SimulatedWorker, Worker, WorkerPool};
use stratum::Result;

/// Stratum - layered parallel task orchestration
#[derive(Parser, Debug)]
#[command(name = "stratum")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    STRATUM_LOG=<filter>   Log filter (level or directive)\n    STRATUM_DEBUG=1        Enable debug logging (alternative to --debug)")]
pub struct Cli {
    /// Log level
    #[arg(long, value_enum, global = true)]
    pub log_level: Option<LogLevel>,

    /// Enable debug logging
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    /// Config file (defaults to ~/.stratum/config.toml)
    #[arg(short = 'c', long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Print the layered execution schedule for a task file
    Plan {
        /// Task file (.json or .toml)
        tasks: PathBuf,
    },

    /// Validate a task file and report file-write conflicts
    Validate {
        /// Task file (.json or .toml)
        tasks: PathBuf,
    },

    /// Execute a task file with simulated workers
    Run {
        /// Task file (.json or .toml)
        tasks: PathBuf,

        /// Number of workers (overrides config and strategy)
        #[arg(short = 'w', long)]
        workers: Option<usize>,

        /// Apply a strategy preset before other overrides
        #[arg(long, value_enum)]
        strategy: Option<ExecutionStrategy>,

        /// Skip quality gate validation
        #[arg(long)]
        no_quality: bool,

        /// Milliseconds of simulated work per estimated minute
        #[arg(long, default_value_t = 10)]
        time_scale_ms: u64,
    },

    /// Show the effective configuration
    Config {
        /// Write the default configuration file
        #[arg(long)]
        init: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.debug {
        Some(LogLevel::Debug)
    } else {
        cli.log_level
    };
    init_logging(level);

    match cli.command {
        Command::Plan { tasks } => run_plan(cli.config.as_deref(), &tasks),
        Command::Validate { tasks } => run_validate(cli.config.as_deref(), &tasks),
        Command::Run {
            tasks,
            workers,
            strategy,
            no_quality,
            time_scale_ms,
        } => {
            let mut config = load_config(cli.config.as_deref())?;
            if let Some(strategy) = strategy {
                config = config.with_strategy(strategy);
            }
            if let Some(workers) = workers {
                config.execution.max_parallel_workers = workers;
            }
            if no_quality {
                config.quality.enabled = false;
            }
            config.validate()?;
            run_execute(config, &tasks, Duration::from_millis(time_scale_ms))
        }
        Command::Config { init } => run_config(cli.config.as_deref(), init),
    }
}

fn load_config(path: Option<&Path>) -> Result<ExecutionConfig> {
    let mut config = match path {
        Some(path) => ExecutionConfig::load_from(path)?,
        None => ExecutionConfig::load()?,
    };
    config.apply_env()?;
    Ok(config)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn run_plan(config_path: Option<&Path>, tasks_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    let tasks = load_tasks(tasks_path)?;
    let graph = build_graph_with(&GraphBuilder::from_config(&config.inference), &tasks)?;
    print_json(&graph.schedule())
}

#[derive(Serialize)]
struct ValidationReport {
    total_tasks: usize,
    total_layers: usize,
    edges: usize,
    validation: GraphValidation,
    conflicts: Vec<FileConflict>,
}

fn run_validate(config_path: Option<&Path>, tasks_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    let tasks = load_tasks(tasks_path)?;
    let graph = build_graph_with(&GraphBuilder::from_config(&config.inference), &tasks)?;

    let conflicts = detect_conflicts(&tasks);
    for conflict in &conflicts {
        warn!(path = %conflict.path, tasks = conflict.tasks.len(), "File written by multiple tasks");
    }

    print_json(&ValidationReport {
        total_tasks: graph.total_tasks,
        total_layers: graph.layer_count(),
        edges: graph.dependency_graph.edge_count(),
        validation: graph.validate(),
        conflicts,
    })
}

fn run_execute(config: ExecutionConfig, tasks_path: &Path, time_scale: Duration) -> Result<()> {
    let tasks = load_tasks(tasks_path)?;
    let graph = build_graph_with(&GraphBuilder::from_config(&config.inference), &tasks)?;

    info!(
        tasks = graph.total_tasks,
        layers = graph.layer_count(),
        workers = config.execution.max_parallel_workers,
        strategy = %config.execution.strategy,
        "Starting simulated run"
    );

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        let workers: Vec<Arc<dyn Worker>> = (0..config.execution.max_parallel_workers)
            .map(|i| Arc::new(SimulatedWorker::new(format!("sim-{}", i + 1), time_scale)) as Arc<dyn Worker>)
            .collect();
        let pool = Arc::new(WorkerPool::with_workers(workers).await);
        let orchestrator = Orchestrator::new(Arc::clone(&pool), config);

        let result = orchestrator
            .run(graph, RunOptions::default().with_metadata("source", tasks_path.display().to_string()))
            .await?;
        pool.shutdown_all().await;

        print_json(&result.report())
    })
}

fn run_config(config_path: Option<&Path>, init: bool) -> Result<()> {
    if init {
        let config = ExecutionConfig::default();
        let path = match config_path {
            Some(path) => {
                config.save_to(path)?;
                path.to_path_buf()
            }
            None => config.save()?,
        };
        println!("Wrote default config to {}", path.display());
        return Ok(());
    }

    let config = load_config(config_path)?;
    println!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}
