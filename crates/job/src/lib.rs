use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use derive_builder::Builder;
use getset::Getters;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Lifecycle state of a job.
///
/// `Completed` and `Dead` are terminal. `Dead` jobs form the dead letter queue and only
/// leave it through an explicit retry.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type,
)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum JobState {
    /// Waiting for its first execution (or revived from the dead letter queue)
    Pending,
    /// Claimed by a worker and currently executing
    Processing,
    /// Finished with a zero exit code
    Completed,
    /// Failed at least once and waiting for its backoff to elapse
    Failed,
    /// Exhausted its retries
    Dead,
}

impl JobState {
    /// Every state, in lifecycle order.
    pub const ALL: [JobState; 5] = [
        JobState::Pending,
        JobState::Processing,
        JobState::Completed,
        JobState::Failed,
        JobState::Dead,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Processing => "processing",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Dead => "dead",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Dead)
    }
}

impl Display for JobState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Returned when a string does not name a [`JobState`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownJobState(pub String);

impl Display for UnknownJobState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "unknown job state '{}' (expected one of pending, processing, completed, failed, dead)",
            self.0
        )
    }
}

impl std::error::Error for UnknownJobState {}

impl FromStr for JobState {
    type Err = UnknownJobState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(JobState::Pending),
            "processing" => Ok(JobState::Processing),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            "dead" => Ok(JobState::Dead),
            _ => Err(UnknownJobState(s.to_string())),
        }
    }
}

/// `DbJob` is a row of the `_private_jobs` table as stored by SQLite.
///
/// Timestamps are kept as unix milliseconds so that comparisons and ordering
/// happen on integers inside the database.
#[derive(FromRow, Getters, Debug, Clone, PartialEq, Eq)]
#[getset(get = "pub")]
pub struct DbJob {
    /// Insertion sequence, used as the final tie-breaker when ordering
    seq: i64,
    /// Caller supplied (or generated) unique identifier
    id: String,
    /// Shell command run by the worker
    command: String,
    state: JobState,
    /// Higher number means it should run sooner
    priority: i32,
    /// Unix milliseconds before which the job cannot be claimed
    run_at: i64,
    /// How many times it has been claimed for execution
    attempts: i32,
    /// Per job override of the global retry limit
    max_retries: Option<i32>,
    /// Per job override of the global execution timeout, in seconds
    timeout_secs: Option<i64>,
    /// Why did the last attempt fail ?
    last_error: Option<String>,
    created_at: i64,
    updated_at: i64,
    /// Worker holding the claim while `state = processing`
    claimed_by: Option<String>,
    /// When the current claim was taken
    locked_at: Option<i64>,
    /// When the current claim stops being protected, claim time plus the timeout in force
    lock_expires_at: Option<i64>,
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

/// `Job` is the typed view of a job record used by the rest of the system.
#[derive(Getters, Debug, Clone, PartialEq, Eq, Serialize, Builder)]
#[getset(get = "pub")]
#[builder(build_fn(private, name = "build_internal"), pattern = "owned")]
pub struct Job {
    #[builder(default)]
    #[serde(skip)]
    seq: i64,
    #[builder(setter(into))]
    id: String,
    #[builder(setter(into))]
    command: String,
    #[builder(default = "JobState::Pending")]
    state: JobState,
    #[builder(default)]
    priority: i32,
    #[builder(default = "Utc::now()")]
    run_at: DateTime<Utc>,
    #[builder(default)]
    attempts: i32,
    #[builder(default, setter(strip_option))]
    max_retries: Option<i32>,
    #[builder(default, setter(strip_option))]
    timeout_secs: Option<i64>,
    #[builder(default, setter(strip_option, into))]
    last_error: Option<String>,
    #[builder(default = "Utc::now()")]
    created_at: DateTime<Utc>,
    #[builder(default = "Utc::now()")]
    updated_at: DateTime<Utc>,
    #[builder(default, setter(strip_option, into))]
    claimed_by: Option<String>,
    #[builder(default, setter(strip_option))]
    locked_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    lock_expires_at: Option<DateTime<Utc>>,
}

impl From<DbJob> for Job {
    fn from(db_job: DbJob) -> Job {
        Job {
            seq: db_job.seq,
            id: db_job.id,
            command: db_job.command,
            state: db_job.state,
            priority: db_job.priority,
            run_at: from_millis(db_job.run_at),
            attempts: db_job.attempts,
            max_retries: db_job.max_retries,
            timeout_secs: db_job.timeout_secs,
            last_error: db_job.last_error,
            created_at: from_millis(db_job.created_at),
            updated_at: from_millis(db_job.updated_at),
            claimed_by: db_job.claimed_by,
            locked_at: db_job.locked_at.map(from_millis),
            lock_expires_at: db_job.lock_expires_at.map(from_millis),
        }
    }
}

impl Job {
    /// Creates a new builder for constructing a `Job`.
    pub fn builder() -> JobBuilder {
        JobBuilder::default()
    }

    /// Retry limit for this job, falling back to the queue wide default.
    pub fn effective_max_retries(&self, default: u32) -> u32 {
        self.max_retries
            .and_then(|v| u32::try_from(v).ok())
            .unwrap_or(default)
    }

    /// Execution timeout for this job, falling back to the queue wide default.
    pub fn effective_timeout(&self, default: Duration) -> Duration {
        self.timeout_secs
            .and_then(|v| u64::try_from(v).ok())
            .filter(|v| *v > 0)
            .map(Duration::from_secs)
            .unwrap_or(default)
    }

    /// Whether the dequeue predicate accepts this job at `now`.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        matches!(self.state, JobState::Pending | JobState::Failed) && self.run_at <= now
    }
}

impl JobBuilder {
    /// Builds the Job with all configured values.
    ///
    /// # Panics
    /// Panics if `id` or `command` were not set.
    pub fn build(self) -> Job {
        self.build_internal()
            .expect("id and command must be set before building a Job")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db_job() -> DbJob {
        DbJob {
            seq: 7,
            id: "job-1".to_string(),
            command: "echo hi".to_string(),
            state: JobState::Failed,
            priority: 5,
            run_at: 1_700_000_000_000,
            attempts: 2,
            max_retries: Some(4),
            timeout_secs: Some(30),
            last_error: Some("exit code 1".to_string()),
            created_at: 1_600_000_000_000,
            updated_at: 1_650_000_000_000,
            claimed_by: None,
            locked_at: None,
            lock_expires_at: None,
        }
    }

    #[test]
    fn test_from_db_job() {
        let job = Job::from(db_job());
        assert_eq!(job.seq, 7);
        assert_eq!(job.id, "job-1");
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.priority, 5);
        assert_eq!(job.run_at.timestamp_millis(), 1_700_000_000_000);
        assert_eq!(job.created_at.timestamp_millis(), 1_600_000_000_000);
        assert_eq!(job.attempts, 2);
        assert_eq!(job.max_retries, Some(4));
        assert_eq!(job.last_error.as_deref(), Some("exit code 1"));
        assert!(job.locked_at.is_none());
        assert!(job.lock_expires_at.is_none());
    }

    #[test]
    fn state_round_trips_through_str() {
        for state in JobState::ALL {
            assert_eq!(state.as_str().parse::<JobState>(), Ok(state));
        }
        assert_eq!(" DEAD ".parse::<JobState>(), Ok(JobState::Dead));
        assert!("running".parse::<JobState>().is_err());
    }

    #[test]
    fn only_completed_and_dead_are_terminal() {
        let terminal: Vec<_> = JobState::ALL.iter().filter(|s| s.is_terminal()).collect();
        assert_eq!(terminal, vec![&JobState::Completed, &JobState::Dead]);
    }

    #[test]
    fn overrides_take_precedence_over_defaults() {
        let job = Job::builder().id("a").command("true").build();
        assert_eq!(job.effective_max_retries(3), 3);
        assert_eq!(
            job.effective_timeout(Duration::from_secs(60)),
            Duration::from_secs(60)
        );

        let job = Job::builder()
            .id("b")
            .command("true")
            .max_retries(0)
            .timeout_secs(5)
            .build();
        assert_eq!(job.effective_max_retries(3), 0);
        assert_eq!(
            job.effective_timeout(Duration::from_secs(60)),
            Duration::from_secs(5)
        );
    }

    #[test]
    fn eligibility_respects_state_and_run_at() {
        let now = Utc::now();
        let later = now + chrono::Duration::seconds(10);

        let pending = Job::builder().id("p").command("true").run_at(now).build();
        assert!(pending.is_eligible(now));
        assert!(!pending.is_eligible(now - chrono::Duration::seconds(1)));

        let failed_not_due = Job::builder()
            .id("f")
            .command("true")
            .state(JobState::Failed)
            .run_at(later)
            .build();
        assert!(!failed_not_due.is_eligible(now));
        assert!(failed_not_due.is_eligible(later));

        for state in [JobState::Processing, JobState::Completed, JobState::Dead] {
            let job = Job::builder()
                .id("x")
                .command("true")
                .state(state)
                .run_at(now)
                .build();
            assert!(!job.is_eligible(now), "{state} must never be eligible");
        }
    }
}
