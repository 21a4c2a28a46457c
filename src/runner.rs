use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use getset::Getters;
use queuectl_job::Job;
use queuectl_shutdown_signal::{cancel_on_shutdown_signal, ShutdownReason};
use serde::Serialize;
use sqlx::SqlitePool;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::builder::WorkerOptions;
use crate::config::QueueConfig;
use crate::errors::{QueueError, Result as QueueResult};
use crate::executor::JobExecutor;
use crate::retry::{decide, RetryDecision};
use crate::sql::config::load_config;
use crate::sql::get_job::get_job;
use crate::sql::list_jobs::{counts_by_state, JobCounts};
use crate::sql::record_outcome::record_outcome;
use crate::sql::recover::recover_stale_jobs;
use crate::worker_utils::WorkerUtils;

/// Storage retries start at this delay and double on every failure.
const STORAGE_BACKOFF_INITIAL: Duration = Duration::from_millis(100);
const STORAGE_BACKOFF_MAX: Duration = Duration::from_secs(5);

/// How many times an outcome write is attempted before giving up on it.
const MAX_RECORD_ATTEMPTS: u32 = 20;

/// A pool of worker loops executing jobs from one queue database.
///
/// Every loop independently claims the next eligible job, runs it, and records the
/// outcome. All coordination between loops (and between processes sharing the
/// database file) goes through the job store.
#[derive(Getters)]
#[getset(get = "pub")]
pub struct Worker {
    /// Unique identifier of this pool, loops are `<worker_id>-<n>`
    pub(crate) worker_id: String,
    /// Number of worker loops
    pub(crate) concurrency: usize,
    /// Overrides the stored `worker_poll_interval` when set
    pub(crate) poll_interval: Option<Duration>,
    pub(crate) sqlite_pool: SqlitePool,
    #[getset(skip)]
    pub(crate) executor: JobExecutor,
    /// Whether OS signals stop running loops
    pub(crate) listen_os_shutdown_signals: bool,
    pub(crate) stale_claim_grace: Duration,
    /// Cancelled by `request_shutdown`, parent of every run's token
    #[getset(skip)]
    pub(crate) shutdown_token: CancellationToken,
    #[getset(skip)]
    pub(crate) stats: PoolStats,
}

/// Live counters shared by the loops of a worker.
#[derive(Debug, Default, Clone)]
pub struct PoolStats {
    active: Arc<AtomicUsize>,
    busy: Arc<AtomicUsize>,
}

/// Decrements a counter when dropped, panics included.
struct CounterGuard(Arc<AtomicUsize>);

impl CounterGuard {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        CounterGuard(counter.clone())
    }
}

impl Drop for CounterGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Snapshot returned by `status()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WorkerStatus {
    /// Worker loops currently running
    pub active_workers: usize,
    /// Worker loops currently executing a job
    pub busy_workers: usize,
    pub counts: JobCounts,
}

/// Errors that can occur during worker runtime.
#[derive(Error, Debug)]
pub enum WorkerRuntimeError {
    /// The job store could not be prepared before starting the loops
    #[error("Unexpected error occured while preparing the job store : '{0}'")]
    Storage(#[from] QueueError),
    /// A worker loop panicked
    #[error("A worker loop terminated abnormally : '{0}'")]
    LoopPanicked(#[from] tokio::task::JoinError),
}

impl Worker {
    /// Creates a new `WorkerOptions` builder with default settings.
    pub fn options() -> WorkerOptions {
        WorkerOptions::default()
    }

    /// Starts the worker loops and waits until they stop.
    ///
    /// Loops stop after an OS shutdown signal (when enabled) or `request_shutdown`,
    /// each one finishing the job it is executing first.
    pub async fn run(&self) -> Result<(), WorkerRuntimeError> {
        self.start().await?.wait().await
    }

    /// Starts `concurrency` worker loops in the background.
    ///
    /// Claims left behind by a crashed process are requeued first.
    pub async fn start(&self) -> Result<RunningWorker, WorkerRuntimeError> {
        recover_stale_jobs(&self.sqlite_pool, self.stale_claim_grace, Utc::now()).await?;

        let token = self.shutdown_token.child_token();
        let signal_bridge = self
            .listen_os_shutdown_signals
            .then(|| cancel_on_shutdown_signal(token.clone()));

        info!(
            worker_id = %self.worker_id,
            concurrency = self.concurrency,
            "Worker started"
        );
        let loops = self.spawn_loops(LoopMode::Continuous, &token);

        Ok(RunningWorker {
            worker_id: self.worker_id.clone(),
            token,
            loops,
            signal_bridge,
            stats: self.stats.clone(),
            sqlite_pool: self.sqlite_pool.clone(),
        })
    }

    /// Processes the jobs that are eligible now, then returns.
    ///
    /// Up to `concurrency` loops drain the queue; each one exits as soon as it finds
    /// nothing to claim. Jobs whose retry becomes due during the run are picked up too.
    pub async fn run_once(&self) -> Result<(), WorkerRuntimeError> {
        let token = self.shutdown_token.child_token();
        let loops = self.spawn_loops(LoopMode::Drain, &token);
        join_loops(loops).await
    }

    /// Requests a graceful shutdown of every run of this worker.
    ///
    /// Loops finish their current job, then exit. A worker that was asked to shut
    /// down cannot be started again.
    pub fn request_shutdown(&self) {
        self.shutdown_token.cancel();
    }

    /// Number of running loops, number executing a job, and job counts per state.
    pub async fn status(&self) -> QueueResult<WorkerStatus> {
        worker_status(&self.stats, &self.sqlite_pool).await
    }

    /// Creates a utils object sharing this worker's database pool.
    pub fn create_utils(&self) -> WorkerUtils {
        WorkerUtils::new(self.sqlite_pool.clone())
    }

    fn spawn_loops(&self, mode: LoopMode, token: &CancellationToken) -> Vec<JoinHandle<()>> {
        (1..=self.concurrency)
            .map(|n| {
                let worker_loop = WorkerLoop {
                    loop_id: format!("{}-{n}", self.worker_id),
                    mode,
                    poll_interval: self.poll_interval,
                    sqlite_pool: self.sqlite_pool.clone(),
                    executor: self.executor.clone(),
                    token: token.clone(),
                    stats: self.stats.clone(),
                };
                // Counted before spawning so `status()` right after `start()` sees every loop
                let active = CounterGuard::enter(&self.stats.active);
                tokio::spawn(worker_loop.run(active))
            })
            .collect()
    }
}

async fn worker_status(stats: &PoolStats, pool: &SqlitePool) -> QueueResult<WorkerStatus> {
    Ok(WorkerStatus {
        active_workers: stats.active.load(Ordering::SeqCst),
        busy_workers: stats.busy.load(Ordering::SeqCst),
        counts: counts_by_state(pool).await?,
    })
}

async fn join_loops(loops: Vec<JoinHandle<()>>) -> Result<(), WorkerRuntimeError> {
    let mut first_error = None;
    for result in join_all(loops).await {
        if let Err(e) = result {
            error!(error = %e, "Worker loop terminated abnormally");
            first_error.get_or_insert(e);
        }
    }
    match first_error {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}

/// Handle on worker loops started by [`Worker::start`].
pub struct RunningWorker {
    worker_id: String,
    token: CancellationToken,
    loops: Vec<JoinHandle<()>>,
    signal_bridge: Option<JoinHandle<Option<ShutdownReason>>>,
    stats: PoolStats,
    sqlite_pool: SqlitePool,
}

impl RunningWorker {
    /// Asks the loops to stop fetching work, without waiting for them.
    pub fn request_stop(&self) {
        self.token.cancel();
    }

    /// Whether a stop was requested, by `request_stop` or by a shutdown signal.
    pub fn is_stopping(&self) -> bool {
        self.token.is_cancelled()
    }

    /// A token cancelled when the loops are asked to stop.
    pub fn stop_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Stops the loops and returns once every in-flight job has been recorded.
    pub async fn stop(self) -> Result<(), WorkerRuntimeError> {
        self.request_stop();
        self.wait().await
    }

    /// Waits until the loops exit, which happens only once a stop is requested.
    pub async fn wait(self) -> Result<(), WorkerRuntimeError> {
        let result = join_loops(self.loops).await;
        if let Some(bridge) = self.signal_bridge {
            bridge.abort();
        }
        info!(worker_id = %self.worker_id, "Worker stopped");
        result
    }

    pub async fn status(&self) -> QueueResult<WorkerStatus> {
        worker_status(&self.stats, &self.sqlite_pool).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopMode {
    /// Poll until stopped
    Continuous,
    /// Exit as soon as nothing is eligible
    Drain,
}

/// Capped exponential delay between retries of a failing storage operation.
#[derive(Debug)]
struct StorageBackoff {
    next: Duration,
}

impl StorageBackoff {
    fn new() -> Self {
        Self {
            next: STORAGE_BACKOFF_INITIAL,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(STORAGE_BACKOFF_MAX);
        delay
    }

    fn reset(&mut self) {
        self.next = STORAGE_BACKOFF_INITIAL;
    }
}

/// Sleeps for `duration`, returns true when cancelled first.
async fn sleep_or_cancelled(token: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = token.cancelled() => true,
        _ = tokio::time::sleep(duration) => false,
    }
}

fn log_storage_error(loop_id: &str, operation: &str, error: &QueueError, retry_in: Duration) {
    if error.is_transient() {
        warn!(loop_id, operation, error = %error, retry_in_ms = retry_in.as_millis() as u64, "Job store unavailable, retrying");
    } else {
        error!(loop_id, operation, error = %error, retry_in_ms = retry_in.as_millis() as u64, "Job store operation failed, retrying");
    }
}

struct WorkerLoop {
    loop_id: String,
    mode: LoopMode,
    poll_interval: Option<Duration>,
    sqlite_pool: SqlitePool,
    executor: JobExecutor,
    token: CancellationToken,
    stats: PoolStats,
}

impl WorkerLoop {
    async fn run(self, _active: CounterGuard) {
        debug!(loop_id = %self.loop_id, mode = ?self.mode, "Worker loop started");

        let Some(config) = self.load_initial_config().await else {
            return;
        };
        let poll_interval = self.poll_interval.unwrap_or_else(|| config.poll_interval());

        let mut backoff = StorageBackoff::new();
        while !self.token.is_cancelled() {
            let claimed = get_job(
                &self.sqlite_pool,
                &self.loop_id,
                config.job_timeout_duration(),
                Utc::now(),
            )
            .await;
            match claimed {
                Err(e) => {
                    let delay = backoff.next_delay();
                    log_storage_error(&self.loop_id, "claim", &e, delay);
                    if sleep_or_cancelled(&self.token, delay).await {
                        break;
                    }
                }
                Ok(None) => {
                    backoff.reset();
                    if self.mode == LoopMode::Drain {
                        break;
                    }
                    trace!(loop_id = %self.loop_id, "No job found");
                    if sleep_or_cancelled(&self.token, poll_interval).await {
                        break;
                    }
                }
                Ok(Some(job)) => {
                    backoff.reset();
                    let _busy = CounterGuard::enter(&self.stats.busy);
                    self.process_job(job, &config).await;
                }
            }
        }

        debug!(loop_id = %self.loop_id, "Worker loop stopped");
    }

    /// Reads the queue config, retrying until it succeeds or the loop is stopped.
    async fn load_initial_config(&self) -> Option<QueueConfig> {
        let mut backoff = StorageBackoff::new();
        loop {
            match load_config(&self.sqlite_pool).await {
                Ok(config) => return Some(config),
                Err(e) => {
                    let delay = backoff.next_delay();
                    log_storage_error(&self.loop_id, "load_config", &e, delay);
                    if sleep_or_cancelled(&self.token, delay).await {
                        return None;
                    }
                }
            }
        }
    }

    /// Executes a claimed job and records what happens to it next.
    ///
    /// Runs to completion even when a stop was requested meanwhile.
    async fn process_job(&self, job: Job, config: &QueueConfig) {
        let timeout = job.effective_timeout(config.job_timeout_duration());
        let outcome = self.executor.execute(&job, timeout).await;

        // Retry settings changed since the loop started apply to this decision
        let config = if outcome.is_success() {
            *config
        } else {
            match load_config(&self.sqlite_pool).await {
                Ok(latest) => latest,
                Err(e) => {
                    warn!(loop_id = %self.loop_id, error = %e, "Could not reload config, using the one read at start");
                    *config
                }
            }
        };

        let decision = decide(
            &outcome,
            &job,
            job.effective_max_retries(config.max_retries()),
            config.backoff_base(),
            Utc::now(),
        );

        match &decision {
            RetryDecision::Complete => {
                info!(job_id = %job.id(), attempt = job.attempts(), "Job completed");
            }
            RetryDecision::Retry { run_at, error } => {
                warn!(job_id = %job.id(), attempt = job.attempts(), error = %error, %run_at, "Job failed, retry scheduled");
            }
            RetryDecision::Kill { error } => {
                error!(job_id = %job.id(), attempt = job.attempts(), error = %error, "Job max retries reached, moved to the dead letter queue");
            }
        }

        self.record_decision(&job, &decision).await;
    }

    /// Writes the decision, retrying storage errors. Stop requests are ignored here
    /// since the claim must be released.
    async fn record_decision(&self, job: &Job, decision: &RetryDecision) {
        let mut backoff = StorageBackoff::new();
        for attempt in 1..=MAX_RECORD_ATTEMPTS {
            match record_outcome(
                &self.sqlite_pool,
                job.id(),
                &self.loop_id,
                decision,
                Utc::now(),
            )
            .await
            {
                Ok(_) => return,
                Err(e @ (QueueError::StaleClaim { .. } | QueueError::NotFound(_))) => {
                    warn!(loop_id = %self.loop_id, job_id = %job.id(), error = %e, "Outcome discarded");
                    return;
                }
                Err(e) => {
                    if attempt == MAX_RECORD_ATTEMPTS {
                        error!(
                            loop_id = %self.loop_id,
                            job_id = %job.id(),
                            error = %e,
                            "Giving up on recording the outcome, the claim will be recovered as stale"
                        );
                        return;
                    }
                    let delay = backoff.next_delay();
                    log_storage_error(&self.loop_id, "record_outcome", &e, delay);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
