//! Destinations for job output and execution metrics.

use std::fmt::{Display, Formatter};
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Which pipe of the child process a chunk of output came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl Display for OutputStream {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputStream::Stdout => write!(f, "stdout"),
            OutputStream::Stderr => write!(f, "stderr"),
        }
    }
}

/// Structured record of one execution attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionEvent {
    pub job_id: String,
    pub attempt: u32,
    /// `success`, `failure`, `timeout` or `launch_error`
    pub outcome: &'static str,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
}

/// Receives the raw output of job runs, one destination per job id.
#[async_trait]
pub trait LogSink: Send + Sync {
    async fn append(
        &self,
        job_id: &str,
        attempt: u32,
        stream: OutputStream,
        bytes: &[u8],
    ) -> io::Result<()>;
}

/// Receives one [`ExecutionEvent`] per attempt. Failures are the sink's own business.
#[async_trait]
pub trait MetricsSink: Send + Sync {
    async fn emit(&self, event: &ExecutionEvent);
}

/// Discards job output.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopLogSink;

#[async_trait]
impl LogSink for NoopLogSink {
    async fn append(&self, _: &str, _: u32, _: OutputStream, _: &[u8]) -> io::Result<()> {
        Ok(())
    }
}

/// Appends job output to `<dir>/<job_id>.log`, each line prefixed with its attempt and stream.
#[derive(Debug, Clone)]
pub struct FileLogSink {
    dir: PathBuf,
}

impl FileLogSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn log_path(&self, job_id: &str) -> PathBuf {
        self.dir.join(format!("{job_id}.log"))
    }
}

#[async_trait]
impl LogSink for FileLogSink {
    async fn append(
        &self,
        job_id: &str,
        attempt: u32,
        stream: OutputStream,
        bytes: &[u8],
    ) -> io::Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path(job_id))
            .await?;

        let mut chunk = format!("[attempt {attempt} {stream}] ").into_bytes();
        chunk.extend_from_slice(bytes);
        if !bytes.ends_with(b"\n") {
            chunk.push(b'\n');
        }
        // One write per line, stdout and stderr are pumped concurrently
        file.write_all(&chunk).await?;
        file.flush().await
    }
}

/// Reports execution events as structured `tracing` events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMetricsSink;

#[async_trait]
impl MetricsSink for TracingMetricsSink {
    async fn emit(&self, event: &ExecutionEvent) {
        info!(
            target: "queuectl::metrics",
            job_id = %event.job_id,
            attempt = event.attempt,
            outcome = event.outcome,
            exit_code = ?event.exit_code,
            duration_ms = event.duration_ms,
            "Job execution finished"
        );
    }
}

/// Appends one JSON object per line to a file.
#[derive(Debug)]
pub struct JsonLinesMetricsSink {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonLinesMetricsSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    async fn write_line(&self, event: &ExecutionEvent) -> io::Result<()> {
        let mut line = serde_json::to_vec(event).map_err(io::Error::other)?;
        line.push(b'\n');

        let _guard = self.lock.lock().await;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await
    }
}

#[async_trait]
impl MetricsSink for JsonLinesMetricsSink {
    async fn emit(&self, event: &ExecutionEvent) {
        if let Err(e) = self.write_line(event).await {
            warn!(error = %e, path = %self.path.display(), job_id = %event.job_id, "Failed to write metrics event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("queuectl-sinks-{name}-{}", uuid::Uuid::now_v7()))
    }

    #[tokio::test]
    async fn file_log_sink_appends_per_job() {
        let dir = temp_dir("logs");
        let sink = FileLogSink::new(&dir);

        sink.append("a", 1, OutputStream::Stdout, b"hello\n").await.unwrap();
        sink.append("a", 1, OutputStream::Stderr, b"oops").await.unwrap();
        sink.append("b", 2, OutputStream::Stdout, b"other\n").await.unwrap();

        let a = tokio::fs::read_to_string(sink.log_path("a")).await.unwrap();
        assert_eq!(a, "[attempt 1 stdout] hello\n[attempt 1 stderr] oops\n");
        let b = tokio::fs::read_to_string(sink.log_path("b")).await.unwrap();
        assert_eq!(b, "[attempt 2 stdout] other\n");

        tokio::fs::remove_dir_all(dir).await.unwrap();
    }

    #[tokio::test]
    async fn json_lines_metrics_sink_writes_one_object_per_event() {
        let dir = temp_dir("metrics");
        let path = dir.join("metrics.jsonl");
        let sink = JsonLinesMetricsSink::new(&path);

        for attempt in 1..=2 {
            sink.emit(&ExecutionEvent {
                job_id: "job-1".into(),
                attempt,
                outcome: "failure",
                exit_code: Some(1),
                duration_ms: 12,
                timestamp: Utc::now(),
            })
            .await;
        }

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<serde_json::Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["job_id"], "job-1");
        assert_eq!(lines[1]["attempt"], 2);
        assert_eq!(lines[1]["outcome"], "failure");
        assert_eq!(lines[1]["exit_code"], 1);

        tokio::fs::remove_dir_all(dir).await.unwrap();
    }
}
