//! Public API types for the in-process `pubforge` engine.

use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};

use crate::coordinator::CoordinatorCommand;

/// Configuration for the job coordinator and its execution unit.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Backend base URL (e.g. `http://127.0.0.1:8000/api/`).
    pub backend_url: Url,

    /// Delay between two progress polls of a running backend job.
    pub poll_interval: Duration,

    /// Consecutive failed polls tolerated before the job is reported as lost.
    pub max_poll_failures: u32,

    /// Per-request HTTP timeout.
    pub request_timeout: Duration,
}

impl CoordinatorConfig {
    /// Default progress poll interval.
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

    /// Default number of consecutive poll failures tolerated.
    pub const DEFAULT_MAX_POLL_FAILURES: u32 = 5;

    /// Default HTTP request timeout.
    pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

    /// Config with every tunable at its default.
    pub fn new(backend_url: Url) -> Self {
        Self {
            backend_url,
            poll_interval: Self::DEFAULT_POLL_INTERVAL,
            max_poll_failures: Self::DEFAULT_MAX_POLL_FAILURES,
            request_timeout: Self::DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

/// Lifecycle state of a generation job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Nothing dispatched yet.
    #[default]
    Idle,
    /// Dispatched; progress is being observed.
    Running,
    /// The backend finished the batch.
    Complete,
    /// The job was stopped before it finished.
    Cancelled,
    /// The job failed or contact with it was lost. Recoverable.
    Error,
}

/// Severity of a job log record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", from = "String")]
pub enum LogLevel {
    /// Informational.
    #[default]
    Info,
    /// A step finished successfully.
    Success,
    /// Something degraded but the job continues.
    Warning,
    /// A step failed.
    Error,
}

impl From<String> for LogLevel {
    fn from(value: String) -> Self {
        LogLevel::parse(&value)
    }
}

impl LogLevel {
    /// Case-insensitive parse; unknown labels read as [`LogLevel::Info`].
    pub fn parse(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "success" => LogLevel::Success,
            "warn" | "warning" => LogLevel::Warning,
            "error" | "failed" => LogLevel::Error,
            _ => LogLevel::Info,
        }
    }
}

/// One entry of a job's append-only log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// When the backend (or the engine) recorded the message.
    pub timestamp: DateTime<Utc>,
    /// Human-readable message.
    pub message: String,
    /// Severity.
    pub level: LogLevel,
}

impl LogEntry {
    /// A record stamped with the current time.
    pub fn now(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            message: message.into(),
            level,
        }
    }
}

/// Authoritative state of the current (or last) generation job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Backend job identifier, once assigned.
    pub job_id: Option<String>,
    /// Lifecycle state.
    pub status: JobStatus,
    /// Overall progress in percent (0..=100).
    pub progress: f64,
    /// Number of books in the batch, once counted.
    pub total_books: Option<u32>,
    /// Books finished so far (`successful_books + failed_books`).
    pub processed_books: u32,
    /// Books generated successfully.
    pub successful_books: u32,
    /// Books that failed to generate.
    pub failed_books: u32,
    /// Books still to process, once `total_books` is known.
    pub remaining_books: Option<u32>,
    /// Label of the phase in progress.
    pub current_step: Option<String>,
    /// Title of the book being processed.
    pub current_book: Option<String>,
    /// Backend-formatted ETA.
    pub estimated_time_remaining: Option<String>,
    /// Elapsed wall-clock time reported by the backend.
    pub duration_seconds: Option<f64>,
    /// Failure reason while in [`JobStatus::Error`].
    pub error: Option<String>,
    /// Job log, oldest first.
    pub logs: Vec<LogEntry>,
    /// Backend log records already folded into `logs`.
    #[serde(skip)]
    pub log_cursor: usize,
}

/// Partial job fields carried by one execution-unit message.
///
/// `None` means "not reported by this message", never "reset".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressDelta {
    /// Backend job identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    /// Overall progress in percent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    /// Total books in the batch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_books: Option<u32>,
    /// Books processed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_books: Option<u32>,
    /// Books generated successfully.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub successful_books: Option<u32>,
    /// Books that failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_books: Option<u32>,
    /// Books remaining.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remaining_books: Option<u32>,
    /// Current phase label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,
    /// Current book title.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_book: Option<String>,
    /// Backend-formatted ETA.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_time_remaining: Option<String>,
    /// Elapsed seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
    /// Log records not delivered before.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub logs: Vec<LogEntry>,
    /// Backend log records consumed once `logs` is applied.
    #[serde(skip)]
    pub log_cursor: Option<usize>,
}

/// Execution-unit state reported in answer to a status check.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UnitStatus {
    /// Whether the unit is currently observing a job.
    pub running: bool,
    /// Every field the unit has learned about the job so far.
    pub known: ProgressDelta,
}

/// Messages emitted by the execution unit, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum UnitEvent {
    /// Incremental progress.
    Progress(ProgressDelta),
    /// Terminal: the batch finished; carries the final stats.
    Complete(ProgressDelta),
    /// Terminal: the job was stopped.
    Cancelled(ProgressDelta),
    /// Terminal: the job failed or could not be observed.
    Error {
        /// Failure reason.
        reason: String,
        /// Whatever stats were known when it failed.
        partial: ProgressDelta,
    },
    /// A start/recover was rejected because a job is already in progress.
    AlreadyRunning,
    /// Answer to a status check.
    Status(UnitStatus),
}

/// Handle to a running coordinator task.
///
/// Every command is fire-and-forget: it is queued and the call returns
/// immediately. Observe the outcome through [`CoordinatorHandle::watch`].
pub struct CoordinatorHandle {
    pub(crate) cmd_tx: mpsc::UnboundedSender<CoordinatorCommand>,
    pub(crate) state_rx: watch::Receiver<Job>,
    pub(crate) join: tokio::task::JoinHandle<()>,
}

impl CoordinatorHandle {
    /// Start a new generation job (ignored while one is running).
    pub fn start(&self) {
        self.send(CoordinatorCommand::Start);
    }

    /// Ask the running job to stop. The terminal state arrives later.
    pub fn stop(&self) {
        self.send(CoordinatorCommand::Stop);
    }

    /// Ask the execution unit to report what it currently knows.
    pub fn check_status(&self) {
        self.send(CoordinatorCommand::CheckStatus);
    }

    /// Reattach to the last known backend job.
    pub fn recover_connection(&self) {
        self.send(CoordinatorCommand::RecoverConnection);
    }

    /// Latest published job state.
    pub fn state(&self) -> Job {
        self.state_rx.borrow().clone()
    }

    /// Raw state subscription.
    pub fn subscribe(&self) -> watch::Receiver<Job> {
        self.state_rx.clone()
    }

    /// Observer that only sees states published from now on.
    ///
    /// Create it before dispatching a command to wait for that command's outcome.
    pub fn watch(&self) -> JobWatch {
        let mut rx = self.state_rx.clone();
        rx.mark_unchanged();
        JobWatch { rx }
    }

    /// Stop the coordinator task and its execution unit.
    ///
    /// A backend job that is still running keeps running and stays recoverable.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        drop(self.cmd_tx);
        match self.join.await {
            Ok(()) => Ok(()),
            Err(err) => Err(anyhow::anyhow!("coordinator task join error: {err}")),
        }
    }

    fn send(&self, cmd: CoordinatorCommand) {
        if self.cmd_tx.send(cmd).is_err() {
            tracing::warn!("coordinator is not running; command dropped");
        }
    }
}

/// Stream of job states published after the watch was created.
pub struct JobWatch {
    rx: watch::Receiver<Job>,
}

impl JobWatch {
    /// Next published state, or `None` once the coordinator has stopped.
    pub async fn changed(&mut self) -> Option<Job> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }

    /// First terminal state published from now on.
    pub async fn terminal(&mut self) -> Option<Job> {
        loop {
            let job = self.changed().await?;
            if job.is_terminal() {
                return Some(job);
            }
        }
    }
}
