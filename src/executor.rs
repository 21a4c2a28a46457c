use std::io;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use queuectl_job::Job;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::sinks::{ExecutionEvent, LogSink, MetricsSink, OutputStream};
use crate::utils::truncate;

/// Exit code `sh` uses when the command does not exist.
const COMMAND_NOT_FOUND: i32 = 127;

/// How long output pumps may keep running once the child is gone.
///
/// Background processes spawned by the command can inherit the pipes and keep them
/// open forever.
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Longest stderr excerpt kept in a failure detail.
const MAX_STDERR_EXCERPT: usize = 200;

/// Output lines longer than this reach the log sink in several chunks.
pub const MAX_OUTPUT_CHUNK: usize = 64 * 1024;

/// How one execution attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// Exit code 0
    Success,
    /// Nonzero exit code, or killed by a signal (`exit_code` is `None`)
    Failure {
        exit_code: Option<i32>,
        detail: String,
    },
    /// Still running when the timeout elapsed, the process was killed
    Timeout { after: Duration },
    /// The command could not be started
    LaunchError { detail: String },
}

impl ExecutionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionOutcome::Success)
    }

    /// Short machine friendly name, used in metrics.
    pub fn label(&self) -> &'static str {
        match self {
            ExecutionOutcome::Success => "success",
            ExecutionOutcome::Failure { .. } => "failure",
            ExecutionOutcome::Timeout { .. } => "timeout",
            ExecutionOutcome::LaunchError { .. } => "launch_error",
        }
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self {
            ExecutionOutcome::Success => Some(0),
            ExecutionOutcome::Failure { exit_code, .. } => *exit_code,
            ExecutionOutcome::Timeout { .. } | ExecutionOutcome::LaunchError { .. } => None,
        }
    }

    /// The text stored as the job's `last_error`, `None` on success.
    pub fn failure_detail(&self) -> Option<String> {
        match self {
            ExecutionOutcome::Success => None,
            ExecutionOutcome::Failure { detail, .. } => Some(detail.clone()),
            ExecutionOutcome::Timeout { after } => {
                Some(format!("timed out after {}s", after.as_secs_f64()))
            }
            ExecutionOutcome::LaunchError { detail } => Some(format!("launch error: {detail}")),
        }
    }
}

/// Runs job commands through `sh -c`.
///
/// Output is forwarded line by line to the log sink and exactly one
/// [`ExecutionEvent`] per attempt goes to the metrics sink.
#[derive(Clone)]
pub struct JobExecutor {
    log_sink: Arc<dyn LogSink>,
    metrics_sink: Arc<dyn MetricsSink>,
}

impl JobExecutor {
    pub fn new(log_sink: Arc<dyn LogSink>, metrics_sink: Arc<dyn MetricsSink>) -> Self {
        Self {
            log_sink,
            metrics_sink,
        }
    }

    /// Runs `job` once. The attempt number is the job's current `attempts`.
    #[tracing::instrument(skip_all, fields(job_id = %job.id(), attempt = job.attempts()))]
    pub async fn execute(&self, job: &Job, timeout: Duration) -> ExecutionOutcome {
        let attempt = u32::try_from(*job.attempts()).unwrap_or(0);
        info!(command = %job.command(), timeout_secs = timeout.as_secs_f64(), "Executing job");

        let start = Instant::now();
        let outcome = self.run_command(job, attempt, timeout).await;
        let duration = start.elapsed();

        let event = ExecutionEvent {
            job_id: job.id().clone(),
            attempt,
            outcome: outcome.label(),
            exit_code: outcome.exit_code(),
            duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
            timestamp: Utc::now(),
        };
        self.metrics_sink.emit(&event).await;

        debug!(outcome = outcome.label(), duration_ms = event.duration_ms, "Job execution finished");
        outcome
    }

    async fn run_command(&self, job: &Job, attempt: u32, timeout: Duration) -> ExecutionOutcome {
        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(job.command())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group: a timeout kills every process the command started, and
        // terminal signals meant for the worker do not reach the job
        #[cfg(unix)]
        command.process_group(0);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(error = %e, "Could not start job command");
                return ExecutionOutcome::LaunchError {
                    detail: e.to_string(),
                };
            }
        };

        let stdout = child.stdout.take().map(|pipe| {
            self.spawn_pump(pipe, job.id().clone(), attempt, OutputStream::Stdout)
        });
        let stderr = child.stderr.take().map(|pipe| {
            self.spawn_pump(pipe, job.id().clone(), attempt, OutputStream::Stderr)
        });

        let status = tokio::select! {
            status = child.wait() => Some(status),
            _ = tokio::time::sleep(timeout) => None,
        };

        let status = match status {
            Some(status) => status,
            None => {
                warn!(timeout_secs = timeout.as_secs_f64(), "Job timed out, killing it");
                kill_process_group(&child);
                if let Err(e) = child.kill().await {
                    warn!(error = %e, "Failed to kill timed out job");
                }
                drain(stdout).await;
                drain(stderr).await;
                return ExecutionOutcome::Timeout { after: timeout };
            }
        };

        drain(stdout).await;
        let stderr_tail = drain(stderr).await;

        match status {
            Ok(status) => classify(status, stderr_tail),
            Err(e) => ExecutionOutcome::Failure {
                exit_code: None,
                detail: format!("failed to wait for command: {e}"),
            },
        }
    }

    /// Forwards a pipe to the log sink and returns its last non-empty line.
    fn spawn_pump<R>(
        &self,
        pipe: R,
        job_id: String,
        attempt: u32,
        stream: OutputStream,
    ) -> JoinHandle<Option<String>>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let sink = self.log_sink.clone();
        tokio::spawn(async move {
            let mut reader = BufReader::new(pipe);
            let mut line = Vec::with_capacity(1024);
            let mut last_line = None;
            let mut sink_failed = false;
            loop {
                line.clear();
                match read_line_bounded(&mut reader, &mut line, MAX_OUTPUT_CHUNK).await {
                    Ok(0) => break,
                    Ok(_) => {}
                    Err(e) => {
                        debug!(job_id = %job_id, %stream, error = %e, "Stopped reading job output");
                        break;
                    }
                }

                let text = String::from_utf8_lossy(&line);
                let trimmed = text.trim();
                if !trimmed.is_empty() {
                    last_line = Some(truncate(trimmed, MAX_STDERR_EXCERPT).to_string());
                }

                // Keep draining after a sink failure so the child never blocks on a full pipe
                if !sink_failed {
                    if let Err(e) = sink.append(&job_id, attempt, stream, &line).await {
                        warn!(job_id = %job_id, %stream, error = %e, "Failed to write job output");
                        sink_failed = true;
                    }
                }
            }
            last_line
        })
    }
}

/// Reads through the next newline into `line`, stopping early once it holds `max` bytes.
///
/// Returns the number of bytes read, 0 at end of input.
async fn read_line_bounded<R>(reader: &mut R, line: &mut Vec<u8>, max: usize) -> io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let start = line.len();
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(line.len() - start);
        }

        let room = max.saturating_sub(line.len() - start).min(available.len());
        let (used, done) = match available[..room].iter().position(|b| *b == b'\n') {
            Some(newline) => (newline + 1, true),
            None => (room, line.len() - start + room >= max),
        };
        line.extend_from_slice(&available[..used]);
        reader.consume(used);

        if done {
            return Ok(line.len() - start);
        }
    }
}

/// Kills every process in the job's group. The shell leads it, so its pid is the group id.
#[cfg(unix)]
fn kill_process_group(child: &Child) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id().and_then(|pid| i32::try_from(pid).ok()) else {
        return;
    };
    if let Err(e) = killpg(Pid::from_raw(pid), Signal::SIGKILL) {
        debug!(pid, error = %e, "Could not kill the job's process group");
    }
}

#[cfg(not(unix))]
fn kill_process_group(_child: &Child) {}

async fn drain(pump: Option<JoinHandle<Option<String>>>) -> Option<String> {
    let mut pump = pump?;
    match tokio::time::timeout(OUTPUT_DRAIN_GRACE, &mut pump).await {
        Ok(result) => result.ok().flatten(),
        Err(_) => {
            debug!("Output still open after the job exited, detaching");
            pump.abort();
            None
        }
    }
}

fn classify(status: ExitStatus, stderr_tail: Option<String>) -> ExecutionOutcome {
    if status.success() {
        return ExecutionOutcome::Success;
    }

    let with_excerpt = |summary: String| match &stderr_tail {
        Some(tail) => format!("{summary}: {tail}"),
        None => summary,
    };

    match status.code() {
        Some(COMMAND_NOT_FOUND) => ExecutionOutcome::LaunchError {
            detail: with_excerpt(format!("command not found (exit code {COMMAND_NOT_FOUND})")),
        },
        Some(code) => ExecutionOutcome::Failure {
            exit_code: Some(code),
            detail: with_excerpt(format!("exit code {code}")),
        },
        None => ExecutionOutcome::Failure {
            exit_code: None,
            detail: with_excerpt(signal_summary(&status)),
        },
    }
}

#[cfg(unix)]
fn signal_summary(status: &ExitStatus) -> String {
    use std::os::unix::process::ExitStatusExt;

    match status.signal() {
        Some(signal) => format!("terminated by signal {signal}"),
        None => format!("terminated abnormally ({status})"),
    }
}

#[cfg(not(unix))]
fn signal_summary(status: &ExitStatus) -> String {
    format!("terminated abnormally ({status})")
}
