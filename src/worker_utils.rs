use std::time::Duration;

use chrono::Utc;
use queuectl_job::{Job, JobState};
use queuectl_job_spec::{EnqueueRequest, JobSpec, JobSpecError};
use queuectl_migrations::{migrate, MigrateError};
use sqlx::SqlitePool;
use tracing::info;

use crate::builder::connect_sqlite;
use crate::config::{ConfigKey, QueueConfig};
use crate::errors::Result;
use crate::retry::RetryDecision;
use crate::sql::add_job::add_job;
use crate::sql::config::{load_config, store_config_value};
use crate::sql::dead_letter::{delete_jobs_in_state, retry_dead_job};
use crate::sql::get_job::get_job;
use crate::sql::list_jobs::{counts_by_state, get_job_by_id, list_jobs, JobCounts};
use crate::sql::record_outcome::record_outcome;
use crate::sql::recover::{force_unlock_workers, recover_stale_jobs};
use crate::utils::gen_job_id;

/// Administrative deletions. The core never deletes jobs on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupTask {
    /// Empties the dead letter queue
    PurgeDeadJobs,

    /// Removes jobs that completed successfully
    PurgeCompletedJobs,
}

impl CleanupTask {
    /// Executes the cleanup task, returns the number of deleted jobs.
    pub async fn execute(&self, pool: &SqlitePool) -> Result<u64> {
        let state = match self {
            CleanupTask::PurgeDeadJobs => JobState::Dead,
            CleanupTask::PurgeCompletedJobs => JobState::Completed,
        };
        let deleted = delete_jobs_in_state(pool, state).await?;
        info!(task = ?self, deleted, "Cleanup task executed");
        Ok(deleted)
    }
}

/// Management interface of the queue: enqueue, inspection, dead letter queue,
/// configuration and maintenance.
#[derive(Clone, Debug)]
pub struct WorkerUtils {
    sqlite_pool: SqlitePool,
}

impl WorkerUtils {
    pub fn new(sqlite_pool: SqlitePool) -> Self {
        Self { sqlite_pool }
    }

    /// Opens the database at `database_url` (file path or `sqlite:` URL).
    ///
    /// The schema is not installed, call [`WorkerUtils::migrate`] for that.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let sqlite_pool = connect_sqlite(database_url, 4).await?;
        Ok(Self::new(sqlite_pool))
    }

    pub fn sqlite_pool(&self) -> &SqlitePool {
        &self.sqlite_pool
    }

    /// Adds a job running `command`. An id is generated when `spec` has none.
    ///
    /// # Errors
    /// [`QueueError::DuplicateId`](crate::QueueError::DuplicateId) if the id is taken,
    /// [`QueueError::InvalidJob`](crate::QueueError::InvalidJob) if `spec` does not validate.
    pub async fn add_job(&self, command: &str, spec: JobSpec) -> Result<Job> {
        if command.trim().is_empty() {
            return Err(JobSpecError::EmptyCommand.into());
        }
        spec.validate()?;

        let id = spec.id().clone().unwrap_or_else(gen_job_id);
        add_job(&self.sqlite_pool, &id, command, &spec, Utc::now()).await
    }

    /// Adds a job from a JSON payload such as `{"id":"a","command":"echo hi","priority":1}`.
    pub async fn enqueue_json(&self, payload: &str) -> Result<Job> {
        let (command, spec) = EnqueueRequest::from_json(payload)?.into_parts()?;
        self.add_job(&command, spec).await
    }

    pub async fn get_job(&self, id: &str) -> Result<Job> {
        get_job_by_id(&self.sqlite_pool, id).await
    }

    /// Jobs ordered by priority (highest first) then creation time.
    pub async fn list_jobs(&self, state: Option<JobState>, limit: Option<u32>) -> Result<Vec<Job>> {
        list_jobs(&self.sqlite_pool, state, limit).await
    }

    pub async fn counts_by_state(&self) -> Result<JobCounts> {
        counts_by_state(&self.sqlite_pool).await
    }

    /// Claims the next eligible job for `worker_id`, as a worker loop does.
    ///
    /// The claim expires after the job's timeout under the current config.
    pub async fn claim_next(&self, worker_id: &str) -> Result<Option<Job>> {
        let config = self.config().await?;
        get_job(
            &self.sqlite_pool,
            worker_id,
            config.job_timeout_duration(),
            Utc::now(),
        )
        .await
    }

    /// Persists the next state of a job claimed by `worker_id` and releases the claim.
    pub async fn record_outcome(
        &self,
        job_id: &str,
        worker_id: &str,
        decision: &RetryDecision,
    ) -> Result<Job> {
        record_outcome(&self.sqlite_pool, job_id, worker_id, decision, Utc::now()).await
    }

    pub async fn list_dead_jobs(&self, limit: Option<u32>) -> Result<Vec<Job>> {
        self.list_jobs(Some(JobState::Dead), limit).await
    }

    /// Moves a dead job back to `pending` with `attempts` reset to 0.
    pub async fn retry_dead_job(&self, id: &str) -> Result<Job> {
        retry_dead_job(&self.sqlite_pool, id, Utc::now()).await
    }

    /// Returns the jobs held by the given workers to `pending`.
    ///
    /// Useful after a worker process died without releasing its claims. A late outcome
    /// from one of those workers is then rejected as stale.
    pub async fn force_unlock_workers(&self, worker_ids: &[&str]) -> Result<u64> {
        force_unlock_workers(&self.sqlite_pool, worker_ids, Utc::now()).await
    }

    /// Returns to `pending` the jobs whose claim expired more than `grace` ago.
    pub async fn recover_stale_jobs(&self, grace: Duration) -> Result<u64> {
        recover_stale_jobs(&self.sqlite_pool, grace, Utc::now()).await
    }

    /// Runs the given cleanup tasks, returns the total number of deleted jobs.
    pub async fn cleanup(&self, tasks: &[CleanupTask]) -> Result<u64> {
        let mut deleted = 0;
        for task in tasks {
            deleted += task.execute(&self.sqlite_pool).await?;
        }
        Ok(deleted)
    }

    pub async fn config(&self) -> Result<QueueConfig> {
        load_config(&self.sqlite_pool).await
    }

    /// Validates and stores one configuration value, returns the updated config.
    ///
    /// Running loops see the new retry settings on their next decision; other keys
    /// apply to loops started afterwards.
    pub async fn set_config(&self, key: ConfigKey, value: &str) -> Result<QueueConfig> {
        let mut config = self.config().await?;
        config.set(key, value)?;
        store_config_value(&self.sqlite_pool, key, &config.get(key), Utc::now()).await?;
        info!(%key, value = %config.get(key), "Configuration updated");
        Ok(config)
    }

    /// Runs database migrations to ensure the schema is up to date.
    ///
    /// Automatically called when initializing a worker.
    pub async fn migrate(&self) -> std::result::Result<(), MigrateError> {
        migrate(&self.sqlite_pool).await
    }
}
