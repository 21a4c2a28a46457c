use getset::CopyGetters;
use indoc::indoc;
use queuectl_job::{DbJob, Job, JobState};
use serde::Serialize;
use sqlx::{query_as, SqliteExecutor};

use crate::errors::{QueueError, Result};

/// Lists jobs, optionally restricted to one state, most urgent first.
pub async fn list_jobs<'e>(
    executor: impl SqliteExecutor<'e>,
    state: Option<JobState>,
    limit: Option<u32>,
) -> Result<Vec<Job>> {
    // A negative limit means no limit in SQLite
    let limit = limit.map(i64::from).unwrap_or(-1);

    let jobs = query_as::<_, DbJob>(indoc! {r#"
        select *
            from _private_jobs
            where (?1 is null or state = ?1)
            order by priority desc, created_at asc, seq asc
            limit ?2
    "#})
    .bind(state)
    .bind(limit)
    .fetch_all(executor)
    .await?;

    Ok(jobs.into_iter().map(Job::from).collect())
}

pub async fn get_job_by_id<'e>(executor: impl SqliteExecutor<'e>, id: &str) -> Result<Job> {
    query_as::<_, DbJob>("select * from _private_jobs where id = ?1")
        .bind(id)
        .fetch_optional(executor)
        .await?
        .map(Job::from)
        .ok_or_else(|| QueueError::NotFound(id.to_string()))
}

/// Number of jobs in each state. States without jobs count 0.
#[derive(CopyGetters, Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
#[getset(get_copy = "pub")]
pub struct JobCounts {
    pending: i64,
    processing: i64,
    completed: i64,
    failed: i64,
    dead: i64,
}

impl JobCounts {
    pub fn get(&self, state: JobState) -> i64 {
        match state {
            JobState::Pending => self.pending,
            JobState::Processing => self.processing,
            JobState::Completed => self.completed,
            JobState::Failed => self.failed,
            JobState::Dead => self.dead,
        }
    }

    pub fn total(&self) -> i64 {
        JobState::ALL.iter().map(|state| self.get(*state)).sum()
    }

    fn slot(&mut self, state: JobState) -> &mut i64 {
        match state {
            JobState::Pending => &mut self.pending,
            JobState::Processing => &mut self.processing,
            JobState::Completed => &mut self.completed,
            JobState::Failed => &mut self.failed,
            JobState::Dead => &mut self.dead,
        }
    }
}

impl FromIterator<(JobState, i64)> for JobCounts {
    fn from_iter<T: IntoIterator<Item = (JobState, i64)>>(iter: T) -> Self {
        let mut counts = JobCounts::default();
        for (state, count) in iter {
            *counts.slot(state) += count;
        }
        counts
    }
}

pub async fn counts_by_state<'e>(executor: impl SqliteExecutor<'e>) -> Result<JobCounts> {
    let rows: Vec<(JobState, i64)> = query_as(indoc! {r#"
        select state, count(*)
            from _private_jobs
            group by state
    "#})
    .fetch_all(executor)
    .await?;

    Ok(rows.into_iter().collect())
}
