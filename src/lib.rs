#![doc = "A single-machine background job queue running shell commands, backed by SQLite."]
//!
//! Jobs are enqueued with [`WorkerUtils`] and executed by the loops of a [`Worker`].
//! Failed jobs are retried with exponential backoff until their retry budget is
//! exhausted, then moved to the dead letter queue.
//!
//! ```no_run
//! use queuectl::{JobSpec, WorkerOptions};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let worker = WorkerOptions::default()
//!     .concurrency(2)
//!     .database_url("queue.db")
//!     .init()
//!     .await?;
//!
//! let utils = worker.create_utils();
//! utils
//!     .add_job("echo hello", JobSpec::builder().priority(5).build())
//!     .await?;
//!
//! worker.run_once().await?;
//! # Ok(())
//! # }
//! ```

pub mod builder;
pub mod config;
pub mod errors;
pub mod executor;
pub mod retry;
pub mod runner;
pub mod sinks;
pub mod sql;
mod utils;
pub mod worker_utils;

pub use crate::builder::{connect_sqlite, WorkerBuildError, WorkerOptions};
pub use crate::config::{ConfigKey, QueueConfig};
pub use crate::errors::{QueueError, Result};
pub use crate::executor::{ExecutionOutcome, JobExecutor};
pub use crate::retry::{backoff_delay, decide, RetryDecision};
pub use crate::runner::{RunningWorker, Worker, WorkerRuntimeError, WorkerStatus};
pub use crate::sinks::{
    ExecutionEvent, FileLogSink, JsonLinesMetricsSink, LogSink, MetricsSink, NoopLogSink,
    OutputStream, TracingMetricsSink,
};
pub use crate::sql::list_jobs::JobCounts;
pub use crate::utils::gen_job_id;
pub use crate::worker_utils::{CleanupTask, WorkerUtils};

pub use queuectl_job::{DbJob, Job, JobState, UnknownJobState};
pub use queuectl_job_spec::{EnqueueRequest, JobSpec, JobSpecBuilder, JobSpecError};
pub use queuectl_migrations::MigrateError;
