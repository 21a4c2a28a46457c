use std::time::Duration;

use chrono::{DateTime, Utc};
use indoc::indoc;
use queuectl_job::{DbJob, Job};
use sqlx::{query_as, SqliteExecutor};

use crate::errors::Result;
use crate::utils::to_millis;

/// Claims the next eligible job for `worker_id`.
///
/// Selection and transition happen in one statement, which holds the database
/// write lock from before its read, so two callers can never receive the same job.
///
/// The claim expires at `now` plus the job's own timeout, or `default_timeout` when it
/// has none. Callers must run the job under that same timeout.
#[tracing::instrument(skip_all, err, fields(worker_id = worker_id, db.system = "sqlite"))]
pub async fn get_job<'e>(
    executor: impl SqliteExecutor<'e>,
    worker_id: &str,
    default_timeout: Duration,
    now: DateTime<Utc>,
) -> Result<Option<Job>> {
    let default_timeout_ms = i64::try_from(default_timeout.as_millis()).unwrap_or(i64::MAX);

    let job = query_as::<_, DbJob>(indoc! {r#"
        update _private_jobs
            set
                state = 'processing',
                attempts = attempts + 1,
                claimed_by = ?1,
                locked_at = ?2,
                lock_expires_at = ?2 + (
                    case when timeout_secs > 0 then timeout_secs * 1000 else ?3 end
                ),
                updated_at = ?2
            where seq = (
                select seq
                    from _private_jobs
                    where state in ('pending', 'failed')
                    and run_at <= ?2
                    order by priority desc, run_at asc, created_at asc, seq asc
                    limit 1
            )
            and state in ('pending', 'failed')
            returning *
    "#})
    .bind(worker_id)
    .bind(to_millis(now))
    .bind(default_timeout_ms)
    .fetch_optional(executor)
    .await?;

    Ok(job.map(Job::from))
}
