use std::time::Duration;

use chrono::{DateTime, Utc};
use indoc::indoc;
use sqlx::SqliteExecutor;
use tracing::warn;

use crate::errors::Result;
use crate::utils::to_millis;

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

/// Returns the jobs claimed by the given workers to `pending`. Attempts are kept.
#[tracing::instrument(skip_all, err, fields(db.system = "sqlite"))]
pub async fn force_unlock_workers<'e>(
    executor: impl SqliteExecutor<'e>,
    worker_ids: &[&str],
    now: DateTime<Utc>,
) -> Result<u64> {
    let worker_ids = serde_json::to_string(worker_ids)?;

    let result = sqlx::query(indoc! {r#"
        update _private_jobs
            set
                state = 'pending',
                run_at = ?2,
                claimed_by = null,
                locked_at = null,
                lock_expires_at = null,
                updated_at = ?2
            where state = 'processing'
            and claimed_by in (select value from json_each(?1))
    "#})
    .bind(&worker_ids)
    .bind(to_millis(now))
    .execute(executor)
    .await?;

    let unlocked = result.rows_affected();
    if unlocked > 0 {
        warn!(unlocked, worker_ids = %worker_ids, "Forcefully unlocked jobs");
    }
    Ok(unlocked)
}

/// Returns to `pending` every `processing` job whose claim expired more than `grace` ago.
///
/// The expiry was fixed at claim time from the timeout the claiming worker runs the job
/// under, so a config change since then cannot shorten a live claim. A claim past it
/// belongs to a worker that crashed or was killed, since a live worker always records
/// an outcome once the timeout fires.
#[tracing::instrument(skip_all, err, fields(db.system = "sqlite"))]
pub async fn recover_stale_jobs<'e>(
    executor: impl SqliteExecutor<'e>,
    grace: Duration,
    now: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query(indoc! {r#"
        update _private_jobs
            set
                state = 'pending',
                run_at = ?2,
                claimed_by = null,
                locked_at = null,
                lock_expires_at = null,
                updated_at = ?2
            where state = 'processing'
            and lock_expires_at + ?1 < ?2
    "#})
    .bind(millis(grace))
    .bind(to_millis(now))
    .execute(executor)
    .await?;

    let recovered = result.rows_affected();
    if recovered > 0 {
        warn!(recovered, "Recovered jobs from stale claims");
    }
    Ok(recovered)
}
