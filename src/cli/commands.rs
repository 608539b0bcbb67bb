//! CLI command definitions for dialer-orchestrator.
//!
//! One binary serves every role: the elected master, the worker processes it
//! spawns, and the operator tools that talk to both through Redis.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use redis::aio::ConnectionManager;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::OrchestratorConfig;
use crate::lock::RedisLock;
use crate::orchestrator::{ControlCommand, ExitReason, MasterDeps, MasterOrchestrator};
use crate::pool::{local_hostname, OsProcessSupervisor, WorkerType};
use crate::queue::{RedisTaskQueue, RetryPolicy, TaskQueue};
use crate::sources::{CampaignSource, PgSources, RedisCampaignSource, RedisStatsSink, StatsSink};
use crate::store::{connect, KeySpace, RedisStateStore, StateStore};
use crate::worker::{LoggingHandler, WorkerRuntime, WorkerSettings};

use super::signals::cancel_on_shutdown_signal;
use super::status::build_status;

/// Default number of dead tasks printed by `queue dead`.
const DEFAULT_DEAD_LIMIT: usize = 20;

/// Auto-dialer orchestration: master, workers and operator tools.
#[derive(Parser)]
#[command(name = "dialer-orchestrator")]
#[command(about = "Run the dialer master, its workers, and inspect the shared queue")]
#[command(version)]
#[command(
    long_about = "dialer-orchestrator runs a singleton master that keeps monitoring, statistics and campaign workers alive, backed by a Redis lock and task queue.\n\nExample usage:\n  dialer-orchestrator master --config orchestrator.yaml\n  dialer-orchestrator enqueue --type campaign --payload '{\"campaign_id\": 7}'\n  dialer-orchestrator command add_worker --type campaign"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// YAML configuration file layered under environment variables.
    #[arg(short, long, env = "DIALER_CONFIG", global = true)]
    pub config: Option<PathBuf>,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run the master orchestrator until stopped or the lock is lost.
    Master,

    /// Run one worker process (normally started by the master).
    Worker(WorkerArgs),

    /// Add a task to the queue.
    Enqueue(EnqueueArgs),

    /// Submit a control command to the running master.
    Command(CommandArgs),

    /// Print master, worker and queue status as JSON.
    Status,

    /// Inspect or maintain the task queue.
    Queue(QueueArgs),
}

/// Arguments for `dialer-orchestrator worker`.
#[derive(Parser, Debug)]
pub struct WorkerArgs {
    /// Worker id assigned by the master.
    #[arg(long)]
    pub id: String,

    /// Worker type (monitoring, statistics, campaign).
    #[arg(long = "type")]
    pub worker_type: WorkerType,
}

/// Arguments for `dialer-orchestrator enqueue`.
#[derive(Parser, Debug)]
pub struct EnqueueArgs {
    /// Task type; workers of the same type claim it.
    #[arg(short = 't', long = "type")]
    pub task_type: String,

    /// JSON payload.
    #[arg(short, long, default_value = "{}")]
    pub payload: String,

    /// Attempt budget; defaults to the configured `max_attempts`.
    #[arg(long)]
    pub max_attempts: Option<u32>,
}

/// Arguments for `dialer-orchestrator command`.
#[derive(Parser, Debug)]
pub struct CommandArgs {
    /// stop, restart_worker, add_worker, remove_worker, clear_queue or reload_config.
    pub action: String,

    /// Target worker for restart_worker and remove_worker.
    #[arg(long)]
    pub worker_id: Option<String>,

    /// Worker type for add_worker.
    #[arg(long = "type")]
    pub worker_type: Option<WorkerType>,
}

/// Arguments for `dialer-orchestrator queue`.
#[derive(Parser, Debug)]
pub struct QueueArgs {
    #[command(subcommand)]
    pub command: QueueSubcommand,
}

/// Queue subcommands.
#[derive(clap::Subcommand, Debug)]
pub enum QueueSubcommand {
    /// Print depth counters as JSON.
    Stats,

    /// Print the most recent dead tasks with their last error.
    Dead {
        #[arg(short = 'n', long, default_value_t = DEFAULT_DEAD_LIMIT)]
        limit: usize,
    },

    /// Drop every pending, delayed and claimed task. Dead tasks are kept.
    Clear {
        /// Confirm the destructive operation.
        #[arg(long)]
        yes: bool,
    },
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let config = OrchestratorConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;

    match cli.command {
        Commands::Master => run_master_command(config, cli.config.as_deref()).await,
        Commands::Worker(args) => run_worker_command(config, args).await,
        Commands::Enqueue(args) => run_enqueue_command(config, args).await,
        Commands::Command(args) => run_control_command(config, args).await,
        Commands::Status => run_status_command(config).await,
        Commands::Queue(args) => run_queue_command(config, args).await,
    }
}

struct Backend {
    redis: ConnectionManager,
    keys: KeySpace,
    config: OrchestratorConfig,
}

impl Backend {
    async fn connect(config: OrchestratorConfig) -> anyhow::Result<Self> {
        let redis = connect(&config.redis_url, config.store_timeout)
            .await
            .with_context(|| format!("Failed to connect to {}", config.redis_url))?;
        Ok(Self {
            redis,
            keys: KeySpace::new(config.key_prefix.clone()),
            config,
        })
    }

    fn store(&self) -> RedisStateStore {
        RedisStateStore::new(self.redis.clone(), self.keys.clone(), self.config.store_timeout)
    }

    fn queue(&self) -> RedisTaskQueue {
        RedisTaskQueue::new(self.redis.clone(), self.keys.clone(), self.config.store_timeout)
            .with_retry_policy(RetryPolicy::new(self.config.retry_base, self.config.retry_max))
            .with_max_attempts(self.config.max_attempts)
    }

    /// Postgres when a database URL is configured, Redis otherwise.
    async fn sources(&self) -> anyhow::Result<(Arc<dyn CampaignSource>, Arc<dyn StatsSink>)> {
        match self.config.database_url {
            Some(ref url) => {
                let pg = PgSources::connect(url, self.config.store_timeout)
                    .await
                    .context("Failed to connect to PostgreSQL")?;
                pg.run_migrations().await.context("Failed to run migrations")?;
                Ok((Arc::new(pg.clone()), Arc::new(pg)))
            }
            None => {
                let timeout = self.config.store_timeout;
                Ok((
                    Arc::new(RedisCampaignSource::new(self.redis.clone(), self.keys.clone(), timeout)),
                    Arc::new(RedisStatsSink::new(self.redis.clone(), self.keys.clone(), timeout)),
                ))
            }
        }
    }
}

// ============================================================================
// Process roles
// ============================================================================

async fn run_master_command(config: OrchestratorConfig, config_path: Option<&Path>) -> anyhow::Result<()> {
    let backend = Backend::connect(config).await?;
    let (campaigns, stats_sink) = backend.sources().await?;

    let mut supervisor = OsProcessSupervisor::from_config(&backend.config)?;
    if let Some(path) = config_path {
        supervisor = supervisor.with_env("DIALER_CONFIG", path.to_string_lossy());
    }

    let deps = MasterDeps {
        lock: Arc::new(RedisLock::new(
            backend.redis.clone(),
            backend.keys.clone(),
            backend.config.store_timeout,
        )),
        queue: Arc::new(backend.queue()),
        store: Arc::new(backend.store()),
        supervisor: Arc::new(supervisor),
        campaigns,
        stats_sink,
    };

    let cancel = CancellationToken::new();
    cancel_on_shutdown_signal(cancel.clone());

    let mut master = MasterOrchestrator::new(backend.config.clone(), deps, local_hostname())
        .with_cancellation(cancel);
    if let Some(path) = config_path {
        master = master.with_config_path(path);
    }

    let reason = master.run().await?;
    match reason {
        ExitReason::NotElected => info!("Another master is active, exiting"),
        other => info!(reason = %other, "Master exited"),
    }
    Ok(())
}

async fn run_worker_command(config: OrchestratorConfig, args: WorkerArgs) -> anyhow::Result<()> {
    let backend = Backend::connect(config).await?;
    let cancel = CancellationToken::new();
    cancel_on_shutdown_signal(cancel.clone());

    let runtime = WorkerRuntime::new(
        args.id,
        args.worker_type,
        Arc::new(backend.queue()),
        Arc::new(backend.store()),
        Arc::new(LoggingHandler::new(args.worker_type)),
    )?
    .with_settings(WorkerSettings::from_config(&backend.config))
    .with_cancellation(cancel);

    runtime.run().await?;
    Ok(())
}

// ============================================================================
// Operator tools
// ============================================================================

async fn run_enqueue_command(config: OrchestratorConfig, args: EnqueueArgs) -> anyhow::Result<()> {
    let payload: serde_json::Value =
        serde_json::from_str(&args.payload).context("--payload must be valid JSON")?;
    let backend = Backend::connect(config).await?;
    let queue = backend.queue();

    let max_attempts = args.max_attempts.unwrap_or_else(|| queue.default_max_attempts());
    let task_id = queue
        .enqueue_with_attempts(&args.task_type, payload, max_attempts)
        .await?;
    println!("{}", task_id);
    Ok(())
}

async fn run_control_command(config: OrchestratorConfig, args: CommandArgs) -> anyhow::Result<()> {
    let command = ControlCommand::from_parts(&args.action, args.worker_id.as_deref(), args.worker_type)
        .map_err(|e| anyhow::anyhow!(e))?;
    let backend = Backend::connect(config).await?;

    if !backend.store().submit_command(&command).await? {
        anyhow::bail!("A control command is already pending; try again after the master consumes it");
    }
    println!("Submitted {}", command);
    Ok(())
}

async fn run_status_command(config: OrchestratorConfig) -> anyhow::Result<()> {
    let backend = Backend::connect(config).await?;
    let status = build_status(&backend.store(), &backend.queue()).await?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

async fn run_queue_command(config: OrchestratorConfig, args: QueueArgs) -> anyhow::Result<()> {
    let backend = Backend::connect(config).await?;
    let queue = backend.queue();

    match args.command {
        QueueSubcommand::Stats => {
            println!("{}", serde_json::to_string_pretty(&queue.stats().await?)?);
        }
        QueueSubcommand::Dead { limit } => {
            println!("{}", serde_json::to_string_pretty(&queue.dead_tasks(limit).await?)?);
        }
        QueueSubcommand::Clear { yes } => {
            if !yes {
                anyhow::bail!("Refusing to clear the queue without --yes");
            }
            let removed = queue.clear().await?;
            println!("Removed {} task(s)", removed);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_parses() {
        // Verify CLI definition is valid
        Cli::command().debug_assert();
    }

    #[test]
    fn test_worker_command() {
        let cli = Cli::try_parse_from(["dialer-orchestrator", "worker", "--id", "campaign-1a2b", "--type", "campaign"])
            .expect("should parse");

        match cli.command {
            Commands::Worker(args) => {
                assert_eq!(args.id, "campaign-1a2b");
                assert_eq!(args.worker_type, WorkerType::Campaign);
            }
            _ => panic!("Expected Worker command"),
        }
        assert_eq!(cli.log_level, "info");
    }

    #[test]
    fn test_worker_rejects_unknown_type() {
        let result = Cli::try_parse_from(["dialer-orchestrator", "worker", "--id", "x", "--type", "billing"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_enqueue_defaults() {
        let cli = Cli::try_parse_from(["dialer-orchestrator", "enqueue", "--type", "campaign"]).expect("should parse");
        match cli.command {
            Commands::Enqueue(args) => {
                assert_eq!(args.task_type, "campaign");
                assert_eq!(args.payload, "{}");
                assert!(args.max_attempts.is_none());
            }
            _ => panic!("Expected Enqueue command"),
        }
    }

    #[test]
    fn test_command_with_global_options() {
        let cli = Cli::try_parse_from([
            "dialer-orchestrator",
            "command",
            "add_worker",
            "--type",
            "statistics",
            "--log-level",
            "debug",
            "--config",
            "/etc/dialer.yaml",
        ])
        .expect("should parse");

        assert_eq!(cli.log_level, "debug");
        assert_eq!(cli.config, Some(PathBuf::from("/etc/dialer.yaml")));
        match cli.command {
            Commands::Command(args) => {
                assert_eq!(args.action, "add_worker");
                assert_eq!(args.worker_type, Some(WorkerType::Statistics));
                assert!(args.worker_id.is_none());
            }
            _ => panic!("Expected Command command"),
        }
    }

    #[test]
    fn test_queue_subcommands() {
        let cli = Cli::try_parse_from(["dialer-orchestrator", "queue", "dead", "-n", "5"]).expect("should parse");
        match cli.command {
            Commands::Queue(QueueArgs {
                command: QueueSubcommand::Dead { limit },
            }) => assert_eq!(limit, 5),
            _ => panic!("Expected queue dead"),
        }

        let cli = Cli::try_parse_from(["dialer-orchestrator", "queue", "clear"]).expect("should parse");
        match cli.command {
            Commands::Queue(QueueArgs {
                command: QueueSubcommand::Clear { yes },
            }) => assert!(!yes),
            _ => panic!("Expected queue clear"),
        }
    }
}
