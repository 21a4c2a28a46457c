use chrono::{DateTime, Utc};
use derive_builder::Builder;
use getset::{Getters, MutGetters, Setters};
use serde::Deserialize;
use thiserror::Error;

/// Longest accepted job id.
pub const MAX_JOB_ID_LEN: usize = 128;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum JobSpecError {
    #[error("Invalid job JSON: {0}")]
    InvalidJson(String),
    #[error("Job command must not be empty")]
    EmptyCommand,
    #[error("Invalid job id '{0}': expected 1 to 128 characters among [A-Za-z0-9_.:-]")]
    InvalidId(String),
    #[error("max_retries must be zero or positive, got {0}")]
    NegativeMaxRetries(i64),
    #[error("timeout must be a positive number of seconds, got {0}")]
    InvalidTimeout(i64),
}

/// Optional attributes of a job being enqueued.
///
/// Every field left unset falls back to the queue defaults at execution time.
#[derive(Getters, Setters, MutGetters, Debug, Default, Clone, PartialEq, Eq, Builder)]
#[getset(get = "pub", set = "pub", get_mut = "pub")]
#[builder(
    build_fn(private, name = "build_internal"),
    setter(strip_option),
    default,
    pattern = "owned"
)]
pub struct JobSpec {
    /// Unique job id, generated when absent
    #[builder(setter(into))]
    pub id: Option<String>,

    /// Higher runs sooner, defaults to 0
    pub priority: Option<i32>,

    /// The job is not eligible before this instant
    #[builder(setter(into))]
    pub run_at: Option<DateTime<Utc>>,

    /// Per job override of the global `max_retries`
    pub max_retries: Option<i32>,

    /// Per job override of the global `job_timeout`, in seconds
    pub timeout: Option<i64>,
}

impl JobSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builder() -> JobSpecBuilder {
        JobSpecBuilder::new()
    }

    /// Checks the values a caller could have set to something unusable.
    pub fn validate(&self) -> Result<(), JobSpecError> {
        if let Some(id) = &self.id {
            validate_job_id(id)?;
        }
        if let Some(max_retries) = self.max_retries {
            if max_retries < 0 {
                return Err(JobSpecError::NegativeMaxRetries(max_retries.into()));
            }
        }
        if let Some(timeout) = self.timeout {
            if timeout <= 0 {
                return Err(JobSpecError::InvalidTimeout(timeout));
            }
        }
        Ok(())
    }
}

impl JobSpecBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn build(self) -> JobSpec {
        self.build_internal()
            .expect("There is a default value for all fields")
    }
}

impl From<Option<JobSpec>> for JobSpec {
    fn from(spec: Option<JobSpec>) -> Self {
        spec.unwrap_or_default()
    }
}

/// Job ids end up in log file names, so they are restricted to a safe alphabet.
pub fn validate_job_id(id: &str) -> Result<(), JobSpecError> {
    let valid_chars = id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | ':'));
    if id.is_empty() || id.len() > MAX_JOB_ID_LEN || !valid_chars || id == "." || id == ".." {
        return Err(JobSpecError::InvalidId(id.to_string()));
    }
    Ok(())
}

/// Loosely typed enqueue payload, as accepted from the command line.
///
/// Unknown keys are ignored.
#[derive(Deserialize, Debug, Default, Clone, PartialEq, Eq)]
pub struct EnqueueRequest {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default)]
    pub run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub max_retries: Option<i64>,
    #[serde(default)]
    pub timeout: Option<i64>,
}

impl EnqueueRequest {
    /// Parses a JSON object. Shells often mangle double quotes, so a payload
    /// written with single quotes is accepted as a fallback.
    pub fn from_json(input: &str) -> Result<Self, JobSpecError> {
        match serde_json::from_str(input) {
            Ok(request) => Ok(request),
            Err(e) => {
                if input.contains('\'') {
                    if let Ok(request) = serde_json::from_str(&input.replace('\'', "\"")) {
                        return Ok(request);
                    }
                }
                Err(JobSpecError::InvalidJson(e.to_string()))
            }
        }
    }

    /// Validates the payload and splits it into the command and its [`JobSpec`].
    pub fn into_parts(self) -> Result<(String, JobSpec), JobSpecError> {
        let command = self
            .command
            .filter(|c| !c.trim().is_empty())
            .ok_or(JobSpecError::EmptyCommand)?;

        let max_retries = self
            .max_retries
            .map(|v| match i32::try_from(v) {
                Ok(v) if v >= 0 => Ok(v),
                _ if v < 0 => Err(JobSpecError::NegativeMaxRetries(v)),
                _ => Ok(i32::MAX),
            })
            .transpose()?;

        let spec = JobSpec {
            id: self.id,
            priority: self.priority,
            run_at: self.run_at,
            max_retries,
            timeout: self.timeout,
        };
        spec.validate()?;

        Ok((command, spec))
    }
}
