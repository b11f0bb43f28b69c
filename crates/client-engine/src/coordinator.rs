use std::sync::Arc;

use pubforge_client_core::token::TokenStore;
use tokio::sync::{mpsc, watch};

use crate::api::{
    CoordinatorConfig, CoordinatorHandle, Job, JobStatus, LogEntry, LogLevel, UnitEvent,
};
use crate::backend::JobBackend;
use crate::queue::{QueueCache, invalidate_all};
use crate::reconnect::{ActiveJobStore, RecoveryError, plan_recovery};
use crate::worker::{ExecutionUnitHandle, UnitCommand, UnitConfig, spawn_execution_unit};

pub(crate) enum CoordinatorCommand {
    Start,
    Stop,
    CheckStatus,
    RecoverConnection,
}

/// Builder for the job coordinator task.
///
/// ```no_run
/// # use std::sync::Arc;
/// # use pubforge_client_core::token::StaticTokenStore;
/// # use pubforge_client_engine::{Coordinator, CoordinatorConfig, HttpBackend};
/// # async fn demo() -> anyhow::Result<()> {
/// let cfg = CoordinatorConfig::new("http://127.0.0.1:8000/".parse()?);
/// let backend = HttpBackend::new(cfg.backend_url.clone(), cfg.request_timeout)?;
/// let tokens = Arc::new(StaticTokenStore::new(Some("token".into())));
/// let handle = Coordinator::new(cfg, backend, tokens).spawn();
///
/// let mut watch = handle.watch();
/// handle.start();
/// let outcome = watch.terminal().await;
/// println!("{outcome:?}");
/// # Ok(())
/// # }
/// ```
pub struct Coordinator<B> {
    cfg: CoordinatorConfig,
    backend: B,
    tokens: Arc<dyn TokenStore>,
    job_store: Option<ActiveJobStore>,
    queue_cache: Option<Arc<QueueCache>>,
}

impl<B: JobBackend> Coordinator<B> {
    /// Coordinator talking to `backend`, reading tokens from `tokens` at dispatch time.
    pub fn new(cfg: CoordinatorConfig, backend: B, tokens: Arc<dyn TokenStore>) -> Self {
        Self {
            cfg,
            backend,
            tokens,
            job_store: None,
            queue_cache: None,
        }
    }

    /// Persist the active job id so a later process can reattach to it.
    pub fn with_job_store(mut self, store: ActiveJobStore) -> Self {
        self.job_store = Some(store);
        self
    }

    /// Drop cached queue pages whenever a job completes or is cancelled.
    pub fn with_queue_cache(mut self, cache: Arc<QueueCache>) -> Self {
        self.queue_cache = Some(cache);
        self
    }

    /// Spawn the coordinator task. Must be called from within a Tokio runtime.
    pub fn spawn(self) -> CoordinatorHandle {
        let mut cfg = self.cfg;
        if cfg.poll_interval.is_zero() {
            cfg.poll_interval = CoordinatorConfig::DEFAULT_POLL_INTERVAL;
        }
        if cfg.max_poll_failures == 0 {
            cfg.max_poll_failures = CoordinatorConfig::DEFAULT_MAX_POLL_FAILURES;
        }

        // A fresh process starts idle but remembers which job it may reattach to.
        let initial = Job {
            job_id: self
                .job_store
                .as_ref()
                .and_then(|s| s.current())
                .map(|r| r.job_id.clone()),
            ..Job::default()
        };

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(initial.clone());
        let runtime = CoordinatorRuntime {
            unit_cfg: UnitConfig {
                poll_interval: cfg.poll_interval,
                max_poll_failures: cfg.max_poll_failures,
            },
            backend: self.backend,
            tokens: self.tokens,
            job_store: self.job_store,
            queue_cache: self.queue_cache,
            cmd_rx,
            state_tx,
            job: initial,
            unit: None,
        };
        let join = tokio::spawn(runtime.run());

        CoordinatorHandle {
            cmd_tx,
            state_rx,
            join,
        }
    }
}

enum Step {
    Command(Option<CoordinatorCommand>),
    Unit(Option<UnitEvent>),
}

struct CoordinatorRuntime<B> {
    unit_cfg: UnitConfig,
    backend: B,
    tokens: Arc<dyn TokenStore>,
    job_store: Option<ActiveJobStore>,
    queue_cache: Option<Arc<QueueCache>>,

    cmd_rx: mpsc::UnboundedReceiver<CoordinatorCommand>,
    state_tx: watch::Sender<Job>,
    job: Job,
    unit: Option<ExecutionUnitHandle>,
}

impl<B: JobBackend> CoordinatorRuntime<B> {
    fn publish(&self) {
        self.state_tx.send_replace(self.job.clone());
    }

    fn ensure_unit(&mut self) -> &ExecutionUnitHandle {
        let backend = &self.backend;
        let cfg = self.unit_cfg;
        self.unit
            .get_or_insert_with(|| spawn_execution_unit(backend.clone(), cfg))
    }

    fn replace_unit(&mut self) -> &ExecutionUnitHandle {
        if let Some(old) = self.unit.take() {
            old.shutdown();
        }
        self.ensure_unit()
    }

    async fn remember_job(&mut self, job_id: &str) {
        let Some(store) = &mut self.job_store else {
            return;
        };
        if store.set(job_id) {
            if let Err(err) = store.persist().await {
                tracing::warn!(job_id, "failed to persist active job: {err:#}");
            }
        }
    }

    async fn forget_job(&mut self) {
        let Some(store) = &mut self.job_store else {
            return;
        };
        if store.clear() {
            if let Err(err) = store.persist().await {
                tracing::warn!("failed to clear active job record: {err:#}");
            }
        }
    }

    async fn handle_command(&mut self, cmd: CoordinatorCommand) {
        match cmd {
            CoordinatorCommand::Start => self.start().await,
            CoordinatorCommand::Stop => {
                if !self.job.is_running() {
                    tracing::debug!(status = ?self.job.status, "stop ignored; no job running");
                    return;
                }
                let sent = self.unit.as_ref().is_some_and(|u| u.send(UnitCommand::Stop));
                if !sent {
                    self.job.fail("execution unit is not available");
                }
            }
            CoordinatorCommand::CheckStatus => {
                if let Some(unit) = &self.unit {
                    unit.send(UnitCommand::CheckStatus);
                }
            }
            CoordinatorCommand::RecoverConnection => self.recover().await,
        }
    }

    async fn start(&mut self) {
        if self.job.is_running() {
            tracing::warn!(job_id = ?self.job.job_id, "generation already running; start ignored");
            return;
        }

        self.job.begin();
        if let Some(previous) = self.job_store.as_ref().and_then(|s| s.current()) {
            let job_id = previous.job_id.clone();
            tracing::warn!(%job_id, "replacing recorded job; it can no longer be recovered");
            self.job.logs.push(LogEntry::now(
                LogLevel::Warning,
                format!("Previous job {job_id} is no longer tracked; it may still be running"),
            ));
        }
        self.forget_job().await;

        let Some(token) = self.tokens.access_token() else {
            tracing::warn!("start requested without an access token");
            self.job.fail("not authenticated");
            return;
        };

        tracing::info!("starting generation of pending books");
        if !self.ensure_unit().send(UnitCommand::Start { token }) {
            self.unit = None;
            self.job.fail("failed to reach the execution unit");
        }
    }

    async fn recover(&mut self) {
        let plan = plan_recovery(
            &self.job,
            self.unit.is_some(),
            self.job_store.as_ref(),
            self.tokens.as_ref(),
        );
        let recovery = match plan {
            Ok(recovery) => recovery,
            Err(RecoveryError::AlreadyAttached(job_id)) => {
                tracing::info!(%job_id, "already observing job; recover ignored");
                return;
            }
            Err(RecoveryError::NoJob) => {
                tracing::warn!("recover requested but no job id is known");
                return;
            }
            Err(RecoveryError::NotAuthenticated) => {
                if let Some(job_id) = self
                    .job
                    .job_id
                    .clone()
                    .or_else(|| self.job_store.as_ref()?.current().map(|r| r.job_id.clone()))
                {
                    self.job.resume(job_id);
                }
                self.job.fail("not authenticated");
                return;
            }
        };

        tracing::info!(job_id = %recovery.job_id, "recovering connection to job");
        self.job.resume(recovery.job_id.clone());
        self.remember_job(&recovery.job_id).await;
        let logs_seen = self.job.log_cursor;
        let sent = self.replace_unit().send(UnitCommand::RecoverConnection {
            job_id: recovery.job_id,
            token: recovery.token,
            logs_seen,
        });
        if !sent {
            self.unit = None;
            self.job.fail("failed to reach the execution unit");
        }
    }

    async fn handle_unit_event(&mut self, event: UnitEvent) -> bool {
        let changed = self.job.apply(&event);

        match &event {
            UnitEvent::AlreadyRunning => {
                tracing::warn!("execution unit is already running a job");
            }
            UnitEvent::Complete(_) | UnitEvent::Cancelled(_) if changed => {
                tracing::info!(
                    job_id = ?self.job.job_id,
                    status = ?self.job.status,
                    successful = self.job.successful_books,
                    failed = self.job.failed_books,
                    "job finished"
                );
                self.forget_job().await;
                if let Some(cache) = &self.queue_cache {
                    let dropped = invalidate_all(cache);
                    tracing::debug!(dropped, "queue cache invalidated");
                }
            }
            UnitEvent::Error { reason, .. } if changed => {
                tracing::warn!(job_id = ?self.job.job_id, "job failed: {reason}");
            }
            _ => {}
        }

        if self.job.status == JobStatus::Running {
            if let Some(job_id) = self.job.job_id.clone() {
                self.remember_job(&job_id).await;
            }
        }

        changed
    }

    async fn run(mut self) {
        loop {
            let step = {
                let cmd_rx = &mut self.cmd_rx;
                let unit = &mut self.unit;
                tokio::select! {
                    cmd = cmd_rx.recv() => Step::Command(cmd),
                    ev = async {
                        match unit.as_mut() {
                            Some(unit) => unit.events.recv().await,
                            None => std::future::pending().await,
                        }
                    } => Step::Unit(ev),
                }
            };

            match step {
                Step::Command(None) => break,
                Step::Command(Some(cmd)) => {
                    self.handle_command(cmd).await;
                    self.publish();
                }
                Step::Unit(Some(event)) => {
                    if self.handle_unit_event(event).await {
                        self.publish();
                    }
                }
                Step::Unit(None) => {
                    self.unit = None;
                    if self.job.is_running() {
                        self.job.fail("execution unit stopped unexpectedly");
                        self.publish();
                    }
                }
            }
        }

        if let Some(unit) = self.unit.take() {
            unit.shutdown();
        }
    }
}
