use chrono::{DateTime, Utc};
use indoc::indoc;
use queuectl_job::{DbJob, Job, JobState};
use sqlx::{query_as, SqlitePool};
use tracing::info;

use crate::errors::{QueueError, Result};
use crate::sql::list_jobs::get_job_by_id;
use crate::utils::to_millis;

/// Moves a dead job back to `pending` with a fresh retry budget, eligible at `now`.
#[tracing::instrument(skip_all, err, fields(job_id = job_id, db.system = "sqlite"))]
pub async fn retry_dead_job(pool: &SqlitePool, job_id: &str, now: DateTime<Utc>) -> Result<Job> {
    let job = query_as::<_, DbJob>(indoc! {r#"
        update _private_jobs
            set
                state = 'pending',
                attempts = 0,
                last_error = null,
                run_at = ?2,
                claimed_by = null,
                locked_at = null,
                lock_expires_at = null,
                updated_at = ?2
            where id = ?1
            and state = 'dead'
            returning *
    "#})
    .bind(job_id)
    .bind(to_millis(now))
    .fetch_optional(pool)
    .await?;

    match job {
        Some(job) => {
            info!(job_id, "Job revived from the dead letter queue");
            Ok(job.into())
        }
        None => {
            let job = get_job_by_id(pool, job_id).await?;
            Err(QueueError::NotDead {
                job_id: job_id.to_string(),
                state: *job.state(),
            })
        }
    }
}

/// Deletes every job in `state`, returns how many were removed.
pub async fn delete_jobs_in_state(pool: &SqlitePool, state: JobState) -> Result<u64> {
    let result = sqlx::query("delete from _private_jobs where state = ?1")
        .bind(state)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}
