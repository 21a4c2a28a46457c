use chrono::{DateTime, Utc};
use indoc::indoc;
use queuectl_job::{DbJob, Job};
use queuectl_job_spec::JobSpec;
use sqlx::{query_as, SqliteExecutor};
use tracing::info;

use crate::errors::{QueueError, Result};
use crate::utils::to_millis;

/// Add a job to the queue
#[tracing::instrument(skip_all, err, fields(job_id = id, db.system = "sqlite"))]
pub async fn add_job<'e>(
    executor: impl SqliteExecutor<'e>,
    id: &str,
    command: &str,
    spec: &JobSpec,
    now: DateTime<Utc>,
) -> Result<Job> {
    let run_at = spec.run_at().unwrap_or(now);

    let result = query_as::<_, DbJob>(indoc! {r#"
        insert into _private_jobs (
            id, command, state, priority, run_at, attempts,
            max_retries, timeout_secs, created_at, updated_at
        )
        values (?1, ?2, 'pending', ?3, ?4, 0, ?5, ?6, ?7, ?7)
        returning *
    "#})
    .bind(id)
    .bind(command)
    .bind(spec.priority().unwrap_or(0))
    .bind(to_millis(run_at))
    .bind(spec.max_retries())
    .bind(spec.timeout())
    .bind(to_millis(now))
    .fetch_one(executor)
    .await;

    let job: Job = match result {
        Ok(db_job) => db_job.into(),
        Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
            return Err(QueueError::DuplicateId(id.to_string()));
        }
        Err(e) => return Err(e.into()),
    };

    info!(
        job_id = id,
        command,
        priority = job.priority(),
        run_at = %job.run_at(),
        "Job added to queue"
    );

    Ok(job)
}
