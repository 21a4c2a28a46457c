use std::time::Duration;

use chrono::{DateTime, Utc};
use queuectl_job::{Job, JobState};

use crate::executor::ExecutionOutcome;

/// Longest delay a retry can be pushed back by.
pub const MAX_BACKOFF: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Next persisted state of a job after one execution attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Exit code 0, the job is `completed`
    Complete,
    /// Failed with retries left, the job is `failed` until `run_at`
    Retry { run_at: DateTime<Utc>, error: String },
    /// Failed with no retries left, the job goes to the dead letter queue
    Kill { error: String },
}

impl RetryDecision {
    /// The job state this decision writes.
    pub fn state(&self) -> JobState {
        match self {
            RetryDecision::Complete => JobState::Completed,
            RetryDecision::Retry { .. } => JobState::Failed,
            RetryDecision::Kill { .. } => JobState::Dead,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            RetryDecision::Complete => None,
            RetryDecision::Retry { error, .. } | RetryDecision::Kill { error } => Some(error),
        }
    }
}

/// `base ^ attempts` seconds, capped at [`MAX_BACKOFF`].
pub fn backoff_delay(base: f64, attempts: u32) -> Duration {
    let exponent = i32::try_from(attempts).unwrap_or(i32::MAX);
    let secs = base.powi(exponent);
    if !secs.is_finite() || secs >= MAX_BACKOFF.as_secs_f64() {
        return MAX_BACKOFF;
    }
    Duration::from_secs_f64(secs.max(0.0))
}

/// Maps an attempt outcome to the job's next state.
///
/// `job.attempts()` already counts the attempt that produced `outcome`. A job is
/// retried while it has consumed at most `max_retries` retries, so it runs
/// `max_retries + 1` times before it is killed.
pub fn decide(
    outcome: &ExecutionOutcome,
    job: &Job,
    max_retries: u32,
    backoff_base: f64,
    now: DateTime<Utc>,
) -> RetryDecision {
    let Some(error) = outcome.failure_detail() else {
        return RetryDecision::Complete;
    };

    let attempts = u32::try_from(*job.attempts()).unwrap_or(0);
    if attempts <= max_retries {
        let delay = backoff_delay(backoff_base, attempts);
        let delay = chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::days(7));
        RetryDecision::Retry {
            run_at: now.checked_add_signed(delay).unwrap_or(now),
            error,
        }
    } else {
        RetryDecision::Kill { error }
    }
}
