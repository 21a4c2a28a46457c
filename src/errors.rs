use queuectl_job::JobState;
use queuectl_job_spec::JobSpecError;
use queuectl_migrations::MigrateError;
use thiserror::Error;

/// Errors that can occur during queue operations.
///
/// Command level errors (bad id, duplicate enqueue, bad config) are returned to the
/// caller. Execution failures of a job never show up here, they are recorded in the
/// job itself.
#[derive(Error, Debug)]
pub enum QueueError {
    /// A job with the same id already exists
    #[error("A job with id '{0}' already exists")]
    DuplicateId(String),

    /// No job has the given id
    #[error("Job '{0}' not found")]
    NotFound(String),

    /// The job is no longer `processing` under this worker, the write was rejected
    #[error("Job '{job_id}' is not claimed by worker '{worker_id}' anymore")]
    StaleClaim { job_id: String, worker_id: String },

    /// Only dead jobs can be retried from the dead letter queue
    #[error("Job '{job_id}' is {state}, only dead jobs can be retried from the dead letter queue")]
    NotDead { job_id: String, state: JobState },

    /// The enqueue payload did not pass validation
    #[error("Invalid job: {0}")]
    InvalidJob(#[from] JobSpecError),

    /// A configuration value could not be parsed or is out of range
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// An error occurred while executing an SQL query
    #[error("Error occured while query: {0}")]
    SqlError(#[from] sqlx::Error),

    /// An error occurred while serializing or deserializing JSON data
    #[error("Error while serializing: {0}")]
    JsonSerializeError(#[from] serde_json::Error),

    /// The schema could not be installed or upgraded
    #[error("Error occured while migrating: {0}")]
    MigrateError(#[from] MigrateError),
}

impl QueueError {
    /// Whether retrying the same storage operation later could succeed.
    ///
    /// Locked or unreachable databases and exhausted pools are transient; constraint
    /// violations and ownership errors are not.
    pub fn is_transient(&self) -> bool {
        match self {
            QueueError::SqlError(e) => match e {
                sqlx::Error::Database(db) => {
                    // SQLITE_BUSY, SQLITE_LOCKED and SQLITE_IOERR, extended codes included
                    let primary_code = db
                        .code()
                        .and_then(|code| code.parse::<i32>().ok())
                        .map(|code| code & 0xff);
                    matches!(primary_code, Some(5) | Some(6) | Some(10))
                        || db.message().contains("database is locked")
                }
                sqlx::Error::Io(_)
                | sqlx::Error::PoolTimedOut
                | sqlx::Error::WorkerCrashed => true,
                _ => false,
            },
            _ => false,
        }
    }
}

/// A Result type alias for QueueError.
pub type Result<T> = core::result::Result<T, QueueError>;
