use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use queuectl::{
    CleanupTask, ConfigKey, FileLogSink, JobState, JsonLinesMetricsSink, RunningWorker, Worker,
    WorkerOptions, WorkerUtils,
};

/// How often a running pool checks for the stop flag.
const STOP_FLAG_POLL: Duration = Duration::from_millis(500);

#[derive(Parser, Debug)]
#[command(name = "queuectl")]
#[command(version)]
#[command(about = "A background job queue running shell commands")]
#[command(propagate_version = true)]
struct Cli {
    /// Path of the queue database
    #[arg(long, global = true, env = "QUEUECTL_DATABASE", default_value = "queue.db")]
    database: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create the database and install the schema
    InitDb,

    /// Enqueue a job, e.g. '{"id":"job1","command":"sleep 2","priority":5}'
    Enqueue {
        /// Job as a JSON object
        json: String,
    },

    /// List jobs, highest priority first
    List {
        /// Only list jobs in this state
        #[arg(long)]
        state: Option<JobState>,

        #[arg(long)]
        limit: Option<u32>,
    },

    /// Show one job
    Get { id: String },

    /// Show job counts per state
    Status,

    /// Dead letter queue commands
    Dlq {
        #[command(subcommand)]
        command: DlqCommands,
    },

    /// Worker pool commands
    Worker {
        #[command(subcommand)]
        command: WorkerCommands,
    },

    /// Queue configuration commands
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand, Debug)]
enum DlqCommands {
    /// List dead jobs
    List {
        #[arg(long)]
        limit: Option<u32>,
    },
    /// Move a dead job back to pending with its attempts reset
    Retry { id: String },
    /// Delete every dead job
    Purge,
}

#[derive(Subcommand, Debug)]
enum WorkerCommands {
    /// Run worker loops until `worker stop` or a shutdown signal
    Start(PoolArgs),
    /// Process the jobs eligible now, then exit
    RunOnce(PoolArgs),
    /// Ask running pools using this database to stop gracefully
    Stop,
}

#[derive(Args, Debug)]
struct PoolArgs {
    /// Number of worker loops
    #[arg(long, default_value_t = 1)]
    count: usize,

    /// Directory receiving one `<job_id>.log` file per job
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// File receiving one JSON line per execution
    #[arg(long)]
    metrics_file: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Show one value, or the whole configuration
    Get { key: Option<ConfigKey> },
    /// Change one value
    Set { key: ConfigKey, value: String },
}

fn print_json(value: &impl Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// The flag file `worker stop` creates next to the database.
fn stop_flag_path(database: &str) -> PathBuf {
    let path = database
        .strip_prefix("sqlite://")
        .or_else(|| database.strip_prefix("sqlite:"))
        .unwrap_or(database);
    let path = path.split('?').next().unwrap_or(path);
    PathBuf::from(format!("{path}.stop"))
}

async fn open_utils(database: &str) -> anyhow::Result<WorkerUtils> {
    let utils = WorkerUtils::connect(database)
        .await
        .with_context(|| format!("Could not open the queue database at {database}"))?;
    utils.migrate().await?;
    Ok(utils)
}

/// One connection per worker loop plus headroom for recovery and status queries.
fn pool_connections(count: usize) -> anyhow::Result<u32> {
    anyhow::ensure!(count > 0, "--count must be at least 1");
    u32::try_from(count)
        .ok()
        .and_then(|count| count.checked_add(2))
        .with_context(|| format!("--count {count} is too large"))
}

async fn init_worker(database: &str, args: &PoolArgs) -> anyhow::Result<Worker> {
    let mut options = WorkerOptions::default()
        .database_url(database)
        .concurrency(args.count)
        .max_db_conn(pool_connections(args.count)?);
    if let Some(dir) = &args.log_dir {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("Could not create the log directory {}", dir.display()))?;
        options = options.log_sink(FileLogSink::new(dir));
    }
    if let Some(path) = &args.metrics_file {
        options = options.metrics_sink(JsonLinesMetricsSink::new(path));
    }
    Ok(options.init().await?)
}

/// Waits until the pool is stopped by a signal or the stop flag appears.
async fn watch_stop_flag(running: &RunningWorker, flag: &Path) {
    let token = running.stop_token();
    loop {
        if tokio::fs::try_exists(flag).await.unwrap_or(false) {
            info!(flag = %flag.display(), "Stop requested");
            running.request_stop();
            tokio::fs::remove_file(flag).await.ok();
            return;
        }
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(STOP_FLAG_POLL) => {}
        }
    }
}

async fn run_worker(database: &str, command: WorkerCommands) -> anyhow::Result<()> {
    match command {
        WorkerCommands::Start(args) => {
            let flag = stop_flag_path(database);
            // A flag left by a previous pool must not stop this one
            tokio::fs::remove_file(&flag).await.ok();

            let worker = init_worker(database, &args).await?;
            let running = worker.start().await?;
            watch_stop_flag(&running, &flag).await;
            running.wait().await?;
            print_json(&worker.status().await?.counts)
        }
        WorkerCommands::RunOnce(args) => {
            let worker = init_worker(database, &args).await?;
            worker.run_once().await?;
            print_json(&worker.status().await?.counts)
        }
        WorkerCommands::Stop => {
            let flag = stop_flag_path(database);
            tokio::fs::write(&flag, b"stop")
                .await
                .with_context(|| format!("Could not write the stop flag {}", flag.display()))?;
            println!("Stop requested, running workers exit after their current job");
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let database = cli.database.as_str();

    match cli.command {
        Commands::InitDb => {
            open_utils(database).await?;
            println!("Initialized {database}");
        }
        Commands::Enqueue { json } => {
            let job = open_utils(database).await?.enqueue_json(&json).await?;
            info!(job_id = %job.id(), "Job enqueued");
            print_json(&job)?;
        }
        Commands::List { state, limit } => {
            let jobs = open_utils(database).await?.list_jobs(state, limit).await?;
            print_json(&jobs)?;
        }
        Commands::Get { id } => {
            print_json(&open_utils(database).await?.get_job(&id).await?)?;
        }
        Commands::Status => {
            let utils = open_utils(database).await?;
            let counts = utils.counts_by_state().await?;
            let running = utils.list_jobs(Some(JobState::Processing), None).await?;
            print_json(&serde_json::json!({
                "counts": counts,
                "processing": running,
            }))?;
        }
        Commands::Dlq { command } => {
            let utils = open_utils(database).await?;
            match command {
                DlqCommands::List { limit } => print_json(&utils.list_dead_jobs(limit).await?)?,
                DlqCommands::Retry { id } => print_json(&utils.retry_dead_job(&id).await?)?,
                DlqCommands::Purge => {
                    let deleted = utils.cleanup(&[CleanupTask::PurgeDeadJobs]).await?;
                    println!("Deleted {deleted} dead job(s)");
                }
            }
        }
        Commands::Worker { command } => run_worker(database, command).await?,
        Commands::Config { command } => {
            let utils = open_utils(database).await?;
            match command {
                ConfigCommands::Get { key: Some(key) } => {
                    println!("{}", utils.config().await?.get(key));
                }
                ConfigCommands::Get { key: None } => print_json(&utils.config().await?)?,
                ConfigCommands::Set { key, value } => {
                    let config = utils.set_config(key, &value).await?;
                    println!("{key} = {}", config.get(key));
                }
            }
        }
    }

    Ok(())
}
