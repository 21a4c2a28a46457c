use chrono::{DateTime, Utc};
use indoc::indoc;
use queuectl_job::{DbJob, Job};
use sqlx::{query_as, SqlitePool};

use crate::errors::{QueueError, Result};
use crate::retry::RetryDecision;
use crate::sql::list_jobs::get_job_by_id;
use crate::utils::{to_millis, truncate};

/// Longest `last_error` persisted.
const MAX_ERROR_LEN: usize = 2048;

/// Persists the decision taken for a job and releases the claim.
///
/// The write only applies while the job is still `processing` under `worker_id`,
/// otherwise [`QueueError::StaleClaim`] (or [`QueueError::NotFound`]) is returned and
/// nothing changes.
#[tracing::instrument(skip_all, err, fields(job_id = job_id, worker_id = worker_id, state = %decision.state(), db.system = "sqlite"))]
pub async fn record_outcome(
    pool: &SqlitePool,
    job_id: &str,
    worker_id: &str,
    decision: &RetryDecision,
    now: DateTime<Utc>,
) -> Result<Job> {
    let run_at = match decision {
        RetryDecision::Retry { run_at, .. } => Some(to_millis(*run_at)),
        RetryDecision::Complete | RetryDecision::Kill { .. } => None,
    };
    let last_error = decision.error().map(|e| truncate(e, MAX_ERROR_LEN));

    let job = query_as::<_, DbJob>(indoc! {r#"
        update _private_jobs
            set
                state = ?3,
                last_error = ?4,
                run_at = coalesce(?5, run_at),
                claimed_by = null,
                locked_at = null,
                lock_expires_at = null,
                updated_at = ?6
            where id = ?1
            and state = 'processing'
            and claimed_by = ?2
            returning *
    "#})
    .bind(job_id)
    .bind(worker_id)
    .bind(decision.state())
    .bind(last_error)
    .bind(run_at)
    .bind(to_millis(now))
    .fetch_optional(pool)
    .await?;

    match job {
        Some(job) => Ok(job.into()),
        None => {
            // Tell an unknown id apart from a claim lost to someone else
            get_job_by_id(pool, job_id).await?;
            Err(QueueError::StaleClaim {
                job_id: job_id.to_string(),
                worker_id: worker_id.to_string(),
            })
        }
    }
}
