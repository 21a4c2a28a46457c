use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use queuectl_migrations::migrate;
use rand::RngCore;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::executor::JobExecutor;
use crate::runner::{PoolStats, Worker};
use crate::sinks::{LogSink, MetricsSink, NoopLogSink, TracingMetricsSink};

/// How long a connection waits for the SQLite write lock before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration options for initializing a queuectl worker pool.
///
/// # Example
///
/// ```no_run
/// use queuectl::WorkerOptions;
/// use std::time::Duration;
///
/// async fn example() -> Result<(), Box<dyn std::error::Error>> {
///     let worker = WorkerOptions::default()
///         .concurrency(4)
///         .poll_interval(Duration::from_millis(500))
///         .database_url("queue.db")
///         .init()
///         .await?;
///
///     worker.run().await?;
///     Ok(())
/// }
/// ```
#[derive(Default)]
pub struct WorkerOptions {
    /// Number of worker loops
    concurrency: Option<usize>,

    /// Overrides the stored `worker_poll_interval`
    poll_interval: Option<Duration>,

    /// SQLite connection pool
    sqlite_pool: Option<SqlitePool>,

    /// Path of the database file, or a `sqlite:` URL
    database_url: Option<String>,

    /// Maximum number of database connections in the pool
    max_db_conn: Option<u32>,

    /// Prefix of the generated worker id
    worker_id_prefix: Option<String>,

    /// Destination of job output
    log_sink: Option<Arc<dyn LogSink>>,

    /// Destination of execution events
    metrics_sink: Option<Arc<dyn MetricsSink>>,

    /// Whether OS signals stop the worker
    listen_os_shutdown_signals: Option<bool>,

    /// Extra time granted to a claim beyond its timeout before it counts as stale
    stale_claim_grace: Option<Duration>,
}

/// Errors that can occur when initializing a worker.
#[derive(Error, Debug)]
pub enum WorkerBuildError {
    /// Failed to open the SQLite database
    #[error("Error occurred while opening the SQLite database: {0}")]
    ConnectError(#[from] sqlx::Error),

    /// Neither a database url nor a pool was provided
    #[error("Missing database_url configuration - must provide either database_url or sqlite_pool")]
    MissingDatabaseUrl,

    /// Failed to apply database migrations
    #[error("Error occurred while migrating the database schema: {0}")]
    MigrationError(#[from] queuectl_migrations::MigrateError),
}

/// Opens (and creates if needed) the queue database.
///
/// `database_url` is either a plain file path or a `sqlite:` URL.
pub async fn connect_sqlite(
    database_url: &str,
    max_connections: u32,
) -> Result<SqlitePool, sqlx::Error> {
    let options = if database_url.starts_with("sqlite:") {
        SqliteConnectOptions::from_str(database_url)?
    } else {
        SqliteConnectOptions::new().filename(database_url)
    };

    let options = options
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full)
        .busy_timeout(BUSY_TIMEOUT)
        .foreign_keys(true);

    SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await
}

impl WorkerOptions {
    /// Initializes a worker with the configured options.
    ///
    /// Opens the database (or uses the given pool), installs the schema and assigns
    /// the worker a random id.
    pub async fn init(self) -> Result<Worker, WorkerBuildError> {
        let sqlite_pool = match self.sqlite_pool {
            Some(sqlite_pool) => sqlite_pool,
            None => {
                let db_url = self
                    .database_url
                    .ok_or(WorkerBuildError::MissingDatabaseUrl)?;

                connect_sqlite(&db_url, self.max_db_conn.unwrap_or(10)).await?
            }
        };

        migrate(&sqlite_pool).await?;

        let mut random_bytes = [0u8; 9];
        rand::rng().fill_bytes(&mut random_bytes);
        let prefix = self
            .worker_id_prefix
            .unwrap_or_else(|| String::from("queuectl_worker"));

        let executor = JobExecutor::new(
            self.log_sink.unwrap_or_else(|| Arc::new(NoopLogSink)),
            self.metrics_sink
                .unwrap_or_else(|| Arc::new(TracingMetricsSink)),
        );

        let worker = Worker {
            worker_id: format!("{prefix}_{}", hex::encode(random_bytes)),
            concurrency: self.concurrency.unwrap_or_else(num_cpus::get),
            poll_interval: self.poll_interval,
            sqlite_pool,
            executor,
            listen_os_shutdown_signals: self.listen_os_shutdown_signals.unwrap_or(true),
            stale_claim_grace: self
                .stale_claim_grace
                .unwrap_or(Duration::from_secs(60)),
            shutdown_token: CancellationToken::new(),
            stats: PoolStats::default(),
        };

        Ok(worker)
    }

    /// Sets the number of worker loops, hence of jobs executed concurrently.
    ///
    /// # Default
    /// If not specified, defaults to the number of logical CPUs in the system.
    ///
    /// # Panics
    /// Panics if the value is 0.
    pub fn concurrency(mut self, value: usize) -> Self {
        assert!(value > 0, "Concurrency must be greater than 0");
        self.concurrency = Some(value);
        self
    }

    /// Sets how long an idle worker loop waits before polling an empty queue again.
    ///
    /// When unset, the `worker_poll_interval` stored in the database is used.
    pub fn poll_interval(mut self, value: Duration) -> Self {
        self.poll_interval = Some(value);
        self
    }

    /// Sets an existing SQLite connection pool for the worker to use.
    ///
    /// Takes precedence over `database_url`.
    pub fn sqlite_pool(mut self, value: SqlitePool) -> Self {
        self.sqlite_pool = Some(value);
        self
    }

    /// Sets the database file path (or `sqlite:` URL). The file is created if missing.
    pub fn database_url(mut self, value: &str) -> Self {
        self.database_url = Some(value.into());
        self
    }

    /// Sets the maximum number of database connections, when the pool is created
    /// from `database_url`. Defaults to 10.
    pub fn max_db_conn(mut self, value: u32) -> Self {
        self.max_db_conn = Some(value);
        self
    }

    pub fn worker_id_prefix(mut self, value: &str) -> Self {
        self.worker_id_prefix = Some(value.into());
        self
    }

    /// Sets where the output of jobs goes. Discarded by default.
    pub fn log_sink(mut self, value: impl LogSink + 'static) -> Self {
        self.log_sink = Some(Arc::new(value));
        self
    }

    /// Sets where execution events go. Logged through `tracing` by default.
    pub fn metrics_sink(mut self, value: impl MetricsSink + 'static) -> Self {
        self.metrics_sink = Some(Arc::new(value));
        self
    }

    /// Whether SIGINT, SIGTERM and SIGHUP stop the worker gracefully. Defaults to true.
    pub fn listen_os_shutdown_signals(mut self, value: bool) -> Self {
        self.listen_os_shutdown_signals = Some(value);
        self
    }

    /// Extra time a claim may outlive its job timeout before the pool requeues it at start.
    /// Defaults to 60 seconds.
    pub fn stale_claim_grace(mut self, value: Duration) -> Self {
        self.stale_claim_grace = Some(value);
        self
    }
}
