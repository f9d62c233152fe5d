use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{PullWorkerError, Result};

/// Default wall-clock limit for a single execution.
pub const DEFAULT_EXECUTION_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Slack added on top of the execution timeout when the visibility window is
/// derived rather than configured explicitly.
pub const DEFAULT_VISIBILITY_MARGIN: Duration = Duration::from_secs(10 * 60);

pub const DEFAULT_CONTINUE_MINUTES: i64 = 10;

/// Visibility window used when none is configured: the execution timeout plus
/// [`DEFAULT_VISIBILITY_MARGIN`].
pub fn derived_visibility_window(timeout: Duration) -> Result<Duration> {
    timeout.checked_add(DEFAULT_VISIBILITY_MARGIN).ok_or_else(|| {
        PullWorkerError::InvalidConfig(format!(
            "execution timeout ({timeout:?}) is too large to derive a visibility window"
        ))
    })
}

/// Configuration for the external command each job runs.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Program to spawn (looked up on `PATH` when not absolute)
    pub program: String,
    /// Arguments placed before the generated flags, e.g. a wrapper script
    pub program_args: Vec<String>,
    /// Hard deadline for one execution
    pub timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            program: "claude".to_string(),
            program_args: Vec::new(),
            timeout: DEFAULT_EXECUTION_TIMEOUT,
        }
    }
}

/// What the worker does with a failed execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetryPolicy {
    /// Every failure is terminal; `retry_count` is left untouched.
    #[default]
    Never,
    /// Put the job back to pending while `retry_count < max_retries`.
    UpToMaxRetries,
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub poll_interval: Duration,
    /// How long a claim stays invisible to other workers. There is no lease
    /// renewal while a job runs, so this must outlast the execution timeout.
    pub visibility_window: Duration,
    pub retry_policy: RetryPolicy,
    /// Continuation window used when a job carries no positive value of its own
    pub default_continue_minutes: i64,
    /// How long shutdown waits for in-flight notifications
    pub notification_grace: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            visibility_window: DEFAULT_EXECUTION_TIMEOUT + DEFAULT_VISIBILITY_MARGIN,
            retry_policy: RetryPolicy::Never,
            default_continue_minutes: DEFAULT_CONTINUE_MINUTES,
            notification_grace: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub database_path: PathBuf,
    pub listen_addr: SocketAddr,
    pub executor: ExecutorConfig,
    pub worker: WorkerConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("pull-worker.db"),
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8081)),
            executor: ExecutorConfig::default(),
            worker: WorkerConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Reject configurations under which a running job could be reclaimed by
    /// a second worker before its own deadline fires.
    pub fn validate(&self) -> Result<()> {
        if self.executor.timeout.is_zero() {
            return Err(PullWorkerError::InvalidConfig(
                "execution timeout must be greater than zero".to_string(),
            ));
        }
        if self.worker.poll_interval.is_zero() {
            return Err(PullWorkerError::InvalidConfig(
                "poll interval must be greater than zero".to_string(),
            ));
        }
        if self.worker.visibility_window <= self.executor.timeout {
            return Err(PullWorkerError::InvalidConfig(format!(
                "visibility window ({:?}) must be strictly greater than the execution timeout ({:?})",
                self.worker.visibility_window, self.executor.timeout
            )));
        }
        if self.executor.program.trim().is_empty() {
            return Err(PullWorkerError::InvalidConfig(
                "executor program must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}
