use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use pubforge_client_core::token::TokenStore;
use serde::{Deserialize, Serialize};

use crate::api::Job;
use crate::state;

const FILE_VERSION: u32 = 1;

/// Backend job the client last dispatched or reattached to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveJobRecord {
    /// Backend job identifier.
    pub job_id: String,
    /// When this client first saw the job.
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ActiveJobFile {
    #[serde(default)]
    version: u32,
    #[serde(default)]
    job_id: Option<String>,
    #[serde(default)]
    started_at: Option<DateTime<Utc>>,
}

/// Persisted pointer to the active backend job, so a restarted client can reattach.
#[derive(Debug, Clone)]
pub struct ActiveJobStore {
    path: PathBuf,
    current: Option<ActiveJobRecord>,
}

impl ActiveJobStore {
    /// Load from `$XDG_STATE_HOME/pubforge/active-job.json`.
    pub fn load_default() -> anyhow::Result<Self> {
        Self::load(state::state_file("active-job.json")?)
    }

    /// Load from `path`; a missing file means no active job.
    pub fn load(path: PathBuf) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self {
                path,
                current: None,
            });
        }

        let raw = std::fs::read_to_string(&path)?;
        let file: ActiveJobFile = serde_json::from_str(&raw)?;
        let current = file
            .job_id
            .filter(|id| !id.trim().is_empty())
            .map(|job_id| ActiveJobRecord {
                job_id,
                started_at: file.started_at.unwrap_or_else(Utc::now),
            });
        Ok(Self { path, current })
    }

    /// Store that never touches the disk until [`ActiveJobStore::persist`] is called.
    pub fn in_memory(path: PathBuf) -> Self {
        Self {
            path,
            current: None,
        }
    }

    /// The recorded job, if any.
    pub fn current(&self) -> Option<&ActiveJobRecord> {
        self.current.as_ref()
    }

    /// Backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record `job_id`. Returns whether the record changed.
    pub(crate) fn set(&mut self, job_id: &str) -> bool {
        if self.current.as_ref().is_some_and(|r| r.job_id == job_id) {
            return false;
        }
        self.current = Some(ActiveJobRecord {
            job_id: job_id.to_string(),
            started_at: Utc::now(),
        });
        true
    }

    /// Forget the recorded job. Returns whether there was one.
    pub(crate) fn clear(&mut self) -> bool {
        self.current.take().is_some()
    }

    pub(crate) async fn persist(&self) -> anyhow::Result<()> {
        let path = self.path.clone();
        let file = ActiveJobFile {
            version: FILE_VERSION,
            job_id: self.current.as_ref().map(|r| r.job_id.clone()),
            started_at: self.current.as_ref().map(|r| r.started_at),
        };

        tokio::task::spawn_blocking(move || persist_file(&path, &file))
            .await
            .map_err(|err| anyhow::anyhow!("persist active job: {err:#}"))??;
        Ok(())
    }
}

fn persist_file(path: &Path, file: &ActiveJobFile) -> anyhow::Result<()> {
    if file.job_id.is_none() {
        state::remove_file(path);
        return Ok(());
    }
    state::write_json(path, file)
}

/// Why a reconnect attempt could not be made.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecoveryError {
    /// Neither the current state nor the store names a job.
    #[error("no job to recover")]
    NoJob,
    /// No access token is available.
    #[error("not authenticated")]
    NotAuthenticated,
    /// The execution unit is already observing this job.
    #[error("already attached to job {0}")]
    AlreadyAttached(String),
}

/// Everything needed to reattach to a backend job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Recovery {
    pub(crate) job_id: String,
    pub(crate) token: String,
}

/// Pick the job to reattach to: the current state's id, else the persisted one.
pub(crate) fn plan_recovery(
    job: &Job,
    attached: bool,
    store: Option<&ActiveJobStore>,
    tokens: &dyn TokenStore,
) -> Result<Recovery, RecoveryError> {
    let job_id = job
        .job_id
        .clone()
        .or_else(|| store.and_then(|s| s.current()).map(|r| r.job_id.clone()))
        .ok_or(RecoveryError::NoJob)?;

    if attached && job.is_running() {
        return Err(RecoveryError::AlreadyAttached(job_id));
    }

    let token = tokens
        .access_token()
        .ok_or(RecoveryError::NotAuthenticated)?;
    Ok(Recovery { job_id, token })
}
