use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::time::Duration;

use getset::CopyGetters;
use serde::Serialize;
use tracing::warn;

use crate::errors::{QueueError, Result};

/// Keys accepted by `config get` / `config set`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigKey {
    MaxRetries,
    BackoffBase,
    WorkerPollInterval,
    JobTimeout,
}

impl ConfigKey {
    pub const ALL: [ConfigKey; 4] = [
        ConfigKey::MaxRetries,
        ConfigKey::BackoffBase,
        ConfigKey::WorkerPollInterval,
        ConfigKey::JobTimeout,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ConfigKey::MaxRetries => "max_retries",
            ConfigKey::BackoffBase => "backoff_base",
            ConfigKey::WorkerPollInterval => "worker_poll_interval",
            ConfigKey::JobTimeout => "job_timeout",
        }
    }
}

impl Display for ConfigKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ConfigKey {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        ConfigKey::ALL
            .into_iter()
            .find(|key| key.as_str() == normalized)
            .ok_or_else(|| {
                QueueError::InvalidConfig(format!(
                    "unknown key '{s}' (expected one of max_retries, backoff_base, worker_poll_interval, job_timeout)"
                ))
            })
    }
}

/// Queue wide settings, persisted in the `_private_config` table.
///
/// Per job `max_retries` and `timeout` take precedence over these values.
#[derive(CopyGetters, Debug, Clone, Copy, PartialEq, Serialize)]
#[getset(get_copy = "pub")]
pub struct QueueConfig {
    /// Retries granted to a failing job before it is moved to the dead letter queue
    max_retries: u32,
    /// A failed job waits `backoff_base ^ attempts` seconds before its next attempt
    backoff_base: f64,
    /// Idle delay between two polls of an empty queue, in seconds
    worker_poll_interval: f64,
    /// Execution timeout, in seconds
    job_timeout: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            max_retries: 3,
            backoff_base: 2.0,
            worker_poll_interval: 1.0,
            job_timeout: 60,
        }
    }
}

fn invalid(key: ConfigKey, value: &str, expected: &str) -> QueueError {
    QueueError::InvalidConfig(format!("{key} must be {expected}, got '{value}'"))
}

impl QueueConfig {
    /// Builds a config from stored `(key, value)` rows on top of the defaults.
    ///
    /// Unknown keys are skipped so that an older binary can read a newer database.
    pub fn from_entries<I, K, V>(entries: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut config = QueueConfig::default();
        for (key, value) in entries {
            match key.as_ref().parse::<ConfigKey>() {
                Ok(key) => config.set(key, value.as_ref())?,
                Err(_) => warn!(key = key.as_ref(), "Ignoring unknown configuration key"),
            }
        }
        Ok(config)
    }

    /// Parses and validates `value` before assigning it to `key`.
    pub fn set(&mut self, key: ConfigKey, value: &str) -> Result<()> {
        let raw = value.trim();
        match key {
            ConfigKey::MaxRetries => {
                self.max_retries = raw
                    .parse()
                    .map_err(|_| invalid(key, value, "a non-negative integer"))?;
            }
            ConfigKey::BackoffBase => {
                let base: f64 = raw
                    .parse()
                    .map_err(|_| invalid(key, value, "a number"))?;
                if !base.is_finite() || base < 1.0 {
                    return Err(invalid(key, value, "a finite number >= 1"));
                }
                self.backoff_base = base;
            }
            ConfigKey::WorkerPollInterval => {
                let interval: f64 = raw
                    .parse()
                    .map_err(|_| invalid(key, value, "a number of seconds"))?;
                if !interval.is_finite() || interval <= 0.0 || interval > 86_400.0 {
                    return Err(invalid(key, value, "a positive number of seconds up to 86400"));
                }
                self.worker_poll_interval = interval;
            }
            ConfigKey::JobTimeout => {
                let timeout: u64 = raw
                    .parse()
                    .map_err(|_| invalid(key, value, "a positive integer number of seconds"))?;
                if timeout == 0 {
                    return Err(invalid(key, value, "a positive integer number of seconds"));
                }
                self.job_timeout = timeout;
            }
        }
        Ok(())
    }

    /// The canonical string form of `key`, as stored in the database.
    pub fn get(&self, key: ConfigKey) -> String {
        match key {
            ConfigKey::MaxRetries => self.max_retries.to_string(),
            ConfigKey::BackoffBase => self.backoff_base.to_string(),
            ConfigKey::WorkerPollInterval => self.worker_poll_interval.to_string(),
            ConfigKey::JobTimeout => self.job_timeout.to_string(),
        }
    }

    pub fn entries(&self) -> Vec<(ConfigKey, String)> {
        ConfigKey::ALL
            .into_iter()
            .map(|key| (key, self.get(key)))
            .collect()
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs_f64(self.worker_poll_interval)
    }

    pub fn job_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.job_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = QueueConfig::default();
        assert_eq!(config.max_retries(), 3);
        assert_eq!(config.backoff_base(), 2.0);
        assert_eq!(config.poll_interval(), Duration::from_secs(1));
        assert_eq!(config.job_timeout_duration(), Duration::from_secs(60));
    }

    #[test]
    fn parses_keys_leniently() {
        assert_eq!("max_retries".parse::<ConfigKey>().unwrap(), ConfigKey::MaxRetries);
        assert_eq!(
            "Worker-Poll-Interval".parse::<ConfigKey>().unwrap(),
            ConfigKey::WorkerPollInterval
        );
        assert!(matches!(
            "max-retry".parse::<ConfigKey>(),
            Err(QueueError::InvalidConfig(_))
        ));
    }

    #[test]
    fn from_entries_applies_known_keys_and_skips_unknown() {
        let config = QueueConfig::from_entries([
            ("max_retries", "5"),
            ("backoff_base", "1.5"),
            ("worker_poll_interval", "0.25"),
            ("job_timeout", "10"),
            ("dashboard_port", "8080"),
        ])
        .unwrap();

        assert_eq!(config.max_retries(), 5);
        assert_eq!(config.backoff_base(), 1.5);
        assert_eq!(config.poll_interval(), Duration::from_millis(250));
        assert_eq!(config.job_timeout(), 10);
    }

    #[test]
    fn rejects_out_of_range_values() {
        let mut config = QueueConfig::default();
        for (key, value) in [
            (ConfigKey::MaxRetries, "-1"),
            (ConfigKey::MaxRetries, "two"),
            (ConfigKey::BackoffBase, "0.5"),
            (ConfigKey::BackoffBase, "inf"),
            (ConfigKey::WorkerPollInterval, "0"),
            (ConfigKey::WorkerPollInterval, "NaN"),
            (ConfigKey::JobTimeout, "0"),
            (ConfigKey::JobTimeout, "1.5"),
        ] {
            assert!(
                matches!(config.set(key, value), Err(QueueError::InvalidConfig(_))),
                "{key}={value} should be rejected"
            );
        }
        assert_eq!(config, QueueConfig::default());
    }

    #[test]
    fn get_returns_what_set_stored() {
        let mut config = QueueConfig::default();
        config.set(ConfigKey::BackoffBase, " 3 ").unwrap();
        assert_eq!(config.get(ConfigKey::BackoffBase), "3");
        assert_eq!(config.entries().len(), 4);
    }
}
