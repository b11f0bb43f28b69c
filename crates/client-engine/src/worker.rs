use std::pin::Pin;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};

use crate::api::{LogEntry, LogLevel, ProgressDelta, UnitEvent, UnitStatus};
use crate::backend::{FrameStatus, JobBackend, JobFrame, is_transient};

pub(crate) enum UnitCommand {
    Start { token: String },
    /// `logs_seen` backend log records are already part of the job's log.
    RecoverConnection {
        job_id: String,
        token: String,
        logs_seen: usize,
    },
    CheckStatus,
    Stop,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct UnitConfig {
    pub(crate) poll_interval: Duration,
    pub(crate) max_poll_failures: u32,
}

/// Coordinator side of an execution unit: one channel in, one channel out.
pub(crate) struct ExecutionUnitHandle {
    cmd_tx: mpsc::UnboundedSender<UnitCommand>,
    pub(crate) events: mpsc::UnboundedReceiver<UnitEvent>,
    join: JoinHandle<()>,
}

impl ExecutionUnitHandle {
    pub(crate) fn send(&self, cmd: UnitCommand) -> bool {
        self.cmd_tx.send(cmd).is_ok()
    }

    /// Close the command channel; the unit drops its in-flight requests and exits.
    pub(crate) fn shutdown(self) {
        drop(self.cmd_tx);
        drop(self.join);
    }
}

pub(crate) fn spawn_execution_unit<B: JobBackend>(backend: B, cfg: UnitConfig) -> ExecutionUnitHandle {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (event_tx, events) = mpsc::unbounded_channel();
    let runtime = UnitRuntime {
        backend,
        cfg,
        cmd_rx,
        event_tx,
        run: None,
        request: None,
        stop_request: None,
        poll_backoff: None,
    };
    let join = tokio::spawn(runtime.run());
    ExecutionUnitHandle {
        cmd_tx,
        events,
        join,
    }
}

struct ActiveRun {
    job_id: Option<String>,
    token: String,
    known: ProgressDelta,
    logs_forwarded: usize,
    poll_failures: u32,
    stop_requested: bool,
}

impl ActiveRun {
    fn new(job_id: Option<String>, token: String, logs_forwarded: usize) -> Self {
        let known = ProgressDelta {
            job_id: job_id.clone(),
            ..ProgressDelta::default()
        };
        Self {
            job_id,
            token,
            known,
            logs_forwarded,
            poll_failures: 0,
            stop_requested: false,
        }
    }

    // Everything but logs: those are delivered exactly once, as they arrive.
    fn absorb(&mut self, delta: &ProgressDelta) {
        let known = &mut self.known;
        macro_rules! take {
            ($($field:ident),*) => {
                $(if delta.$field.is_some() {
                    known.$field = delta.$field.clone();
                })*
            };
        }
        take!(
            job_id,
            progress,
            total_books,
            processed_books,
            successful_books,
            failed_books,
            remaining_books,
            current_step,
            current_book,
            estimated_time_remaining,
            duration_seconds,
            log_cursor
        );
    }
}

enum RequestOutcome {
    Started(String),
    Frame(JobFrame),
}

enum Step {
    Command(Option<UnitCommand>),
    Request(Result<anyhow::Result<RequestOutcome>, JoinError>),
    StopAck(Result<anyhow::Result<()>, JoinError>),
    PollDue,
}

struct UnitRuntime<B> {
    backend: B,
    cfg: UnitConfig,
    cmd_rx: mpsc::UnboundedReceiver<UnitCommand>,
    event_tx: mpsc::UnboundedSender<UnitEvent>,

    run: Option<ActiveRun>,
    request: Option<JoinHandle<anyhow::Result<RequestOutcome>>>,
    stop_request: Option<JoinHandle<anyhow::Result<()>>>,
    poll_backoff: Option<Pin<Box<tokio::time::Sleep>>>,
}

impl<B: JobBackend> UnitRuntime<B> {
    fn emit(&self, event: UnitEvent) {
        let _ = self.event_tx.send(event);
    }

    fn progress_log(&self, level: LogLevel, message: impl Into<String>) {
        self.emit(UnitEvent::Progress(ProgressDelta {
            logs: vec![LogEntry::now(level, message)],
            ..ProgressDelta::default()
        }));
    }

    fn clear_requests(&mut self) {
        if let Some(task) = self.request.take() {
            task.abort();
        }
        if let Some(task) = self.stop_request.take() {
            task.abort();
        }
        self.poll_backoff = None;
    }

    fn finish(&mut self) -> Option<ActiveRun> {
        self.clear_requests();
        self.run.take()
    }

    fn spawn_start(&mut self, token: String) {
        let backend = self.backend.clone();
        self.request = Some(tokio::spawn(async move {
            backend
                .start_generation(&token)
                .await
                .map(RequestOutcome::Started)
        }));
    }

    fn spawn_poll(&mut self) {
        let Some(run) = &self.run else { return };
        let Some(job_id) = run.job_id.clone() else { return };
        let token = run.token.clone();
        let backend = self.backend.clone();
        self.poll_backoff = None;
        self.request = Some(tokio::spawn(async move {
            backend
                .job_frame(&job_id, &token)
                .await
                .map(RequestOutcome::Frame)
        }));
    }

    fn schedule_poll(&mut self) {
        self.poll_backoff = Some(Box::pin(tokio::time::sleep(self.cfg.poll_interval)));
    }

    fn handle_command(&mut self, cmd: UnitCommand) {
        match cmd {
            UnitCommand::Start { token } => {
                if self.run.is_some() {
                    self.emit(UnitEvent::AlreadyRunning);
                    return;
                }
                self.run = Some(ActiveRun::new(None, token.clone(), 0));
                self.spawn_start(token);
                self.emit(UnitEvent::Progress(ProgressDelta {
                    current_step: Some("Starting generation".to_string()),
                    logs: vec![LogEntry::now(LogLevel::Info, "Generation of pending books requested")],
                    ..ProgressDelta::default()
                }));
            }
            UnitCommand::RecoverConnection {
                job_id,
                token,
                logs_seen,
            } => {
                if self.run.is_some() {
                    self.emit(UnitEvent::AlreadyRunning);
                    return;
                }
                tracing::info!(%job_id, logs_seen, "reattaching to backend job");
                self.run = Some(ActiveRun::new(Some(job_id), token, logs_seen));
                self.spawn_poll();
            }
            UnitCommand::CheckStatus => {
                let status = match &self.run {
                    Some(run) => UnitStatus {
                        running: true,
                        known: run.known.clone(),
                    },
                    None => UnitStatus::default(),
                };
                self.emit(UnitEvent::Status(status));
            }
            UnitCommand::Stop => self.handle_stop(),
        }
    }

    fn handle_stop(&mut self) {
        let Some(run) = &mut self.run else {
            self.emit(UnitEvent::Cancelled(ProgressDelta::default()));
            return;
        };
        let Some(job_id) = run.job_id.clone() else {
            // The backend has not handed out a job id yet; there is nothing to cancel remotely.
            let mut partial = self.finish().map(|run| run.known).unwrap_or_default();
            partial
                .logs
                .push(LogEntry::now(LogLevel::Warning, "Stopped before the job was assigned an id"));
            self.emit(UnitEvent::Cancelled(partial));
            return;
        };
        if run.stop_requested {
            return;
        }
        run.stop_requested = true;
        let token = run.token.clone();
        let backend = self.backend.clone();
        let id = job_id.clone();
        self.stop_request = Some(tokio::spawn(async move { backend.stop_job(&id, &token).await }));
        tracing::info!(%job_id, "stop requested");
        self.emit(UnitEvent::Progress(ProgressDelta {
            current_step: Some("Stopping".to_string()),
            logs: vec![LogEntry::now(LogLevel::Info, "Stop requested")],
            ..ProgressDelta::default()
        }));
    }

    fn handle_request(&mut self, res: Result<anyhow::Result<RequestOutcome>, JoinError>) {
        self.request = None;
        if self.run.is_none() {
            return;
        }
        let res = match res {
            Ok(res) => res,
            Err(err) if err.is_cancelled() => return,
            Err(err) => Err(anyhow::anyhow!("backend request task failed: {err}")),
        };
        match res {
            Ok(RequestOutcome::Started(job_id)) => self.handle_started(job_id),
            Ok(RequestOutcome::Frame(frame)) => self.handle_frame(frame),
            Err(err) => self.handle_request_error(err),
        }
    }

    fn handle_started(&mut self, job_id: String) {
        let Some(run) = &mut self.run else { return };
        tracing::info!(%job_id, "backend accepted generation job");
        run.job_id = Some(job_id.clone());
        run.known.job_id = Some(job_id.clone());
        self.emit(UnitEvent::Progress(ProgressDelta {
            job_id: Some(job_id.clone()),
            logs: vec![LogEntry::now(LogLevel::Info, format!("Job {job_id} started"))],
            ..ProgressDelta::default()
        }));
        self.spawn_poll();
    }

    fn handle_frame(&mut self, frame: JobFrame) {
        let Some(run) = &mut self.run else { return };
        tracing::debug!(job_id = ?run.job_id, status = frame.status.as_str(), "job frame");
        run.poll_failures = 0;

        let mut delta = frame.to_delta(run.logs_forwarded);
        run.logs_forwarded = run.logs_forwarded.max(frame.log_count());
        if delta.job_id.is_none() {
            delta.job_id = run.job_id.clone();
        }
        run.absorb(&delta);

        match frame.status {
            FrameStatus::Complete => {
                self.finish();
                tracing::info!(job_id = ?delta.job_id, "job complete");
                self.emit(UnitEvent::Complete(delta));
            }
            FrameStatus::Cancelled => {
                self.finish();
                tracing::info!(job_id = ?delta.job_id, "job cancelled");
                self.emit(UnitEvent::Cancelled(delta));
            }
            FrameStatus::Failed => {
                self.finish();
                let reason = frame
                    .error
                    .filter(|e| !e.trim().is_empty())
                    .unwrap_or_else(|| "generation failed".to_string());
                self.emit(UnitEvent::Error {
                    reason,
                    partial: delta,
                });
            }
            FrameStatus::Pending | FrameStatus::Running | FrameStatus::Unknown(_) => {
                self.emit(UnitEvent::Progress(delta));
                self.schedule_poll();
            }
        }
    }

    fn handle_request_error(&mut self, err: anyhow::Error) {
        let max_failures = self.cfg.max_poll_failures.max(1);
        let Some(run) = &mut self.run else { return };

        let Some(job_id) = run.job_id.clone() else {
            let partial = self.finish().map(|run| run.known).unwrap_or_default();
            self.emit(UnitEvent::Error {
                reason: format!("failed to start generation: {err:#}"),
                partial,
            });
            return;
        };

        run.poll_failures += 1;
        let attempt = run.poll_failures;
        if is_transient(&err) && attempt < max_failures {
            tracing::warn!(%job_id, attempt, "progress poll failed, retrying: {err:#}");
            self.progress_log(
                LogLevel::Warning,
                format!("Lost contact with the backend ({attempt}/{max_failures}), retrying"),
            );
            self.schedule_poll();
            return;
        }

        let partial = self.finish().map(|run| run.known).unwrap_or_default();
        self.emit(UnitEvent::Error {
            reason: format!("lost contact with job {job_id}: {err:#}"),
            partial,
        });
    }

    fn handle_stop_ack(&mut self, res: Result<anyhow::Result<()>, JoinError>) {
        self.stop_request = None;
        match res {
            Ok(Ok(())) => {
                self.progress_log(LogLevel::Info, "Backend acknowledged the stop request");
            }
            Ok(Err(err)) => {
                tracing::warn!("stop request failed: {err:#}");
                if let Some(run) = &mut self.run {
                    run.stop_requested = false;
                }
                self.progress_log(LogLevel::Warning, format!("Stop request failed: {err:#}"));
            }
            Err(_) => {}
        }
    }

    async fn run(mut self) {
        loop {
            let step = {
                let cmd_rx = &mut self.cmd_rx;
                let request = &mut self.request;
                let stop_request = &mut self.stop_request;
                let poll_backoff = &mut self.poll_backoff;
                tokio::select! {
                    cmd = cmd_rx.recv() => Step::Command(cmd),
                    res = async {
                        match request.as_mut() {
                            Some(task) => task.await,
                            None => std::future::pending().await,
                        }
                    } => Step::Request(res),
                    res = async {
                        match stop_request.as_mut() {
                            Some(task) => task.await,
                            None => std::future::pending().await,
                        }
                    } => Step::StopAck(res),
                    _ = async {
                        match poll_backoff.as_mut() {
                            Some(sleep) => sleep.as_mut().await,
                            None => std::future::pending::<()>().await,
                        }
                    } => Step::PollDue,
                }
            };

            match step {
                Step::Command(None) => break,
                Step::Command(Some(cmd)) => self.handle_command(cmd),
                Step::Request(res) => self.handle_request(res),
                Step::StopAck(res) => self.handle_stop_ack(res),
                Step::PollDue => {
                    self.poll_backoff = None;
                    if self.request.is_none() {
                        self.spawn_poll();
                    }
                }
            }
        }

        self.clear_requests();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendError, FrameLog};
    use crate::testing::{FakeBackend, counts_frame, frame};

    const CFG: UnitConfig = UnitConfig {
        poll_interval: Duration::from_millis(500),
        max_poll_failures: 3,
    };

    async fn next(unit: &mut ExecutionUnitHandle) -> UnitEvent {
        tokio::time::timeout(Duration::from_secs(60), unit.events.recv())
            .await
            .expect("timed out waiting for unit event")
            .expect("unit event channel closed")
    }

    async fn until_terminal(unit: &mut ExecutionUnitHandle) -> (Vec<UnitEvent>, UnitEvent) {
        let mut seen = Vec::new();
        loop {
            let ev = next(unit).await;
            match ev {
                UnitEvent::Complete(_) | UnitEvent::Cancelled(_) | UnitEvent::Error { .. } => {
                    return (seen, ev);
                }
                other => seen.push(other),
            }
        }
    }

    fn start(unit: &ExecutionUnitHandle) {
        assert!(unit.send(UnitCommand::Start {
            token: "tok".into()
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn start_streams_progress_then_completes() {
        let backend = FakeBackend::default();
        backend.set_job_id("job-7");
        backend.push_frame(counts_frame(FrameStatus::Running, 10, 2, 1));
        backend.push_frame(counts_frame(FrameStatus::Running, 10, 6, 1));
        backend.push_frame(counts_frame(FrameStatus::Complete, 10, 8, 2));
        let mut unit = spawn_execution_unit(backend.clone(), CFG);

        start(&unit);
        let (progress, terminal) = until_terminal(&mut unit).await;

        let UnitEvent::Complete(stats) = terminal else {
            panic!("expected Complete, got {terminal:?}");
        };
        assert_eq!(stats.job_id.as_deref(), Some("job-7"));
        assert_eq!(stats.successful_books, Some(8));
        assert!(progress.iter().all(|ev| matches!(ev, UnitEvent::Progress(_))));
        assert!(progress.len() >= 3);
        assert_eq!(backend.polls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn second_start_is_rejected_while_running() {
        let backend = FakeBackend::default();
        backend.push_frame(frame(FrameStatus::Running));
        let mut unit = spawn_execution_unit(backend.clone(), CFG);

        start(&unit);
        start(&unit);
        let mut rejected = false;
        for _ in 0..3 {
            if next(&mut unit).await == UnitEvent::AlreadyRunning {
                rejected = true;
                break;
            }
        }
        assert!(rejected);
        assert_eq!(backend.start_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn recover_on_finished_job_completes_immediately() {
        let backend = FakeBackend::default();
        backend.push_frame(counts_frame(FrameStatus::Complete, 4, 4, 0));
        let mut unit = spawn_execution_unit(backend.clone(), CFG);

        unit.send(UnitCommand::RecoverConnection {
            job_id: "job-3".into(),
            token: "tok".into(),
            logs_seen: 0,
        });
        let first = next(&mut unit).await;
        let UnitEvent::Complete(stats) = first else {
            panic!("expected Complete first, got {first:?}");
        };
        assert_eq!(stats.job_id.as_deref(), Some("job-3"));
        assert_eq!(stats.total_books, Some(4));
        assert_eq!(backend.start_calls(), 0);

        // Idempotent: a second recovery of the same job gives the same answer.
        unit.send(UnitCommand::RecoverConnection {
            job_id: "job-3".into(),
            token: "tok".into(),
            logs_seen: 0,
        });
        assert!(matches!(next(&mut unit).await, UnitEvent::Complete(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_before_job_id_cancels_locally() {
        let backend = FakeBackend::default();
        backend.hold_start();
        let mut unit = spawn_execution_unit(backend.clone(), CFG);

        start(&unit);
        assert!(matches!(next(&mut unit).await, UnitEvent::Progress(_)));
        unit.send(UnitCommand::Stop);
        assert!(matches!(next(&mut unit).await, UnitEvent::Cancelled(_)));
        assert!(backend.stop_calls().is_empty());

        // The unit is idle again.
        unit.send(UnitCommand::CheckStatus);
        assert_eq!(next(&mut unit).await, UnitEvent::Status(UnitStatus::default()));
        backend.release_start();
    }

    #[tokio::test(start_paused = true)]
    async fn stop_with_job_id_asks_backend_and_waits_for_terminal_frame() {
        let backend = FakeBackend::default();
        backend.set_job_id("job-5");
        backend.push_frame(frame(FrameStatus::Running));
        let mut unit = spawn_execution_unit(backend.clone(), CFG);

        start(&unit);
        loop {
            if let UnitEvent::Progress(delta) = next(&mut unit).await {
                if delta.job_id.is_some() {
                    break;
                }
            }
        }
        unit.send(UnitCommand::Stop);
        backend.push_frame(frame(FrameStatus::Cancelled));

        let (_, terminal) = until_terminal(&mut unit).await;
        assert!(matches!(terminal, UnitEvent::Cancelled(_)));
        assert_eq!(backend.stop_calls(), vec!["job-5".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn check_status_answers_while_start_is_in_flight() {
        let backend = FakeBackend::default();
        backend.hold_start();
        let mut unit = spawn_execution_unit(backend.clone(), CFG);

        start(&unit);
        next(&mut unit).await;
        unit.send(UnitCommand::CheckStatus);
        let UnitEvent::Status(status) = next(&mut unit).await else {
            panic!("expected status");
        };
        assert!(status.running);
        assert_eq!(status.known.job_id, None);
        backend.release_start();
    }

    #[tokio::test(start_paused = true)]
    async fn transient_poll_failures_are_retried() {
        let backend = FakeBackend::default();
        backend.push_frame(counts_frame(FrameStatus::Running, 5, 1, 0));
        backend.push_poll_error(anyhow::anyhow!("connection reset"));
        backend.push_poll_error(
            BackendError::Http {
                status: 502,
                body: String::new(),
            }
            .into(),
        );
        backend.push_frame(counts_frame(FrameStatus::Complete, 5, 5, 0));
        let mut unit = spawn_execution_unit(backend.clone(), CFG);

        start(&unit);
        let (_, terminal) = until_terminal(&mut unit).await;
        assert!(matches!(terminal, UnitEvent::Complete(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn too_many_poll_failures_end_in_error_with_partial_stats() {
        let backend = FakeBackend::default();
        backend.push_frame(counts_frame(FrameStatus::Running, 5, 2, 0));
        for _ in 0..CFG.max_poll_failures {
            backend.push_poll_error(anyhow::anyhow!("timeout"));
        }
        let mut unit = spawn_execution_unit(backend.clone(), CFG);

        start(&unit);
        let (_, terminal) = until_terminal(&mut unit).await;
        let UnitEvent::Error { reason, partial } = terminal else {
            panic!("expected Error, got {terminal:?}");
        };
        assert!(reason.contains("job-1"));
        assert_eq!(partial.job_id.as_deref(), Some("job-1"));
        assert_eq!(partial.successful_books, Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_job_is_not_retried() {
        let backend = FakeBackend::default();
        backend.push_poll_error(BackendError::NotFound.into());
        let mut unit = spawn_execution_unit(backend.clone(), CFG);

        unit.send(UnitCommand::RecoverConnection {
            job_id: "gone".into(),
            token: "tok".into(),
            logs_seen: 0,
        });
        assert!(matches!(next(&mut unit).await, UnitEvent::Error { .. }));
        assert_eq!(backend.polls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn start_failure_is_reported_as_error() {
        let backend = FakeBackend::default();
        backend.fail_start("no pending books");
        let mut unit = spawn_execution_unit(backend.clone(), CFG);

        start(&unit);
        let (_, terminal) = until_terminal(&mut unit).await;
        let UnitEvent::Error { reason, partial } = terminal else {
            panic!("expected Error, got {terminal:?}");
        };
        assert!(reason.contains("no pending books"));
        assert_eq!(partial.job_id, None);
    }

    #[tokio::test(start_paused = true)]
    async fn backend_logs_are_forwarded_once() {
        let log = |message: &str| FrameLog {
            message: message.to_string(),
            ..FrameLog::default()
        };
        let backend = FakeBackend::default();
        backend.push_frame(JobFrame {
            logs: Some(vec![log("a")]),
            ..frame(FrameStatus::Running)
        });
        backend.push_frame(JobFrame {
            logs: Some(vec![log("a"), log("b")]),
            ..frame(FrameStatus::Complete)
        });
        let mut unit = spawn_execution_unit(backend, CFG);

        start(&unit);
        let (progress, terminal) = until_terminal(&mut unit).await;
        let mut messages: Vec<String> = progress
            .iter()
            .filter_map(|ev| match ev {
                UnitEvent::Progress(d) => Some(d.logs.clone()),
                _ => None,
            })
            .flatten()
            .map(|l| l.message)
            .collect();
        if let UnitEvent::Complete(d) = terminal {
            messages.extend(d.logs.into_iter().map(|l| l.message));
        }
        let backend_messages: Vec<&str> = messages
            .iter()
            .map(String::as_str)
            .filter(|m| *m == "a" || *m == "b")
            .collect();
        assert_eq!(backend_messages, vec!["a", "b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn recovery_skips_logs_already_seen() {
        let log = |message: &str| FrameLog {
            message: message.to_string(),
            ..FrameLog::default()
        };
        let backend = FakeBackend::default();
        backend.push_frame(JobFrame {
            logs: Some(vec![log("a"), log("b")]),
            ..frame(FrameStatus::Complete)
        });
        let mut unit = spawn_execution_unit(backend, CFG);

        unit.send(UnitCommand::RecoverConnection {
            job_id: "job-3".into(),
            token: "tok".into(),
            logs_seen: 1,
        });
        let UnitEvent::Complete(delta) = next(&mut unit).await else {
            panic!("expected Complete");
        };
        let messages: Vec<&str> = delta.logs.iter().map(|l| l.message.as_str()).collect();
        assert_eq!(messages, vec!["b"]);
        assert_eq!(delta.log_cursor, Some(2));
    }
}
