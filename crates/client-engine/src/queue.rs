use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use pubforge_client_core::token::TokenStore;
use serde::{Deserialize, Serialize};

use crate::backend::{JobBackend, de_id};
use crate::cache::{ExportedEntry, InvalidationEvent, TtlCache};
use crate::state;

/// Cache holding queue pages.
pub type QueueCache = TtlCache<QueueSnapshot>;

const KEY_PREFIX: &str = "queue:";

/// Per-user queue data goes stale on these events.
const QUEUE_EVENTS: [InvalidationEvent; 3] = [
    InvalidationEvent::UserLogin,
    InvalidationEvent::UserLogout,
    InvalidationEvent::ManualRefresh,
];

/// Queue state of a book.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueStatus {
    /// Waiting for generation.
    Pending,
    /// Generated, awaiting review.
    Review,
    /// Published.
    Uploaded,
    /// Generation or upload failed.
    Failed,
}

impl QueueStatus {
    /// Case-insensitive parse of a backend label.
    pub fn parse(label: &str) -> Option<Self> {
        let label = label.trim();
        [
            QueueStatus::Pending,
            QueueStatus::Review,
            QueueStatus::Uploaded,
            QueueStatus::Failed,
        ]
        .into_iter()
        .find(|status| status.as_str().eq_ignore_ascii_case(label))
    }

    /// Canonical label.
    pub fn as_str(self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Review => "review",
            QueueStatus::Uploaded => "uploaded",
            QueueStatus::Failed => "failed",
        }
    }
}

/// One book in the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    /// Backend identifier.
    #[serde(deserialize_with = "de_id")]
    pub id: String,
    /// Book title.
    #[serde(default)]
    pub title: String,
    /// Raw status label as sent by the backend.
    #[serde(default)]
    pub status: String,
    /// Every other field the backend sent.
    #[serde(flatten)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl QueueItem {
    /// Parsed status, if it is one of the known labels.
    pub fn status(&self) -> Option<QueueStatus> {
        QueueStatus::parse(&self.status)
    }
}

/// One page of the queue.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    /// Items on this page, in backend order.
    #[serde(default, alias = "book_queue")]
    pub items: Vec<QueueItem>,
    /// Items across all pages.
    #[serde(default)]
    pub total: u64,
    /// 1-based page number.
    #[serde(default)]
    pub page: u32,
    /// Page size.
    #[serde(default)]
    pub per_page: u32,
}

/// Item counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Items counted.
    pub total: usize,
    /// Pending items.
    pub pending: usize,
    /// Items in review.
    pub review: usize,
    /// Uploaded items.
    pub uploaded: usize,
    /// Failed items.
    pub failed: usize,
}

/// Advisory health report for a queue page.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueHealth {
    /// No issues found.
    pub is_healthy: bool,
    /// Problems, one per line.
    pub issues: Vec<String>,
    /// Remediation hint for each issue, in the same order.
    pub recommendations: Vec<String>,
}

impl QueueSnapshot {
    /// Count items by status.
    pub fn stats(&self) -> QueueStats {
        let mut stats = QueueStats {
            total: self.items.len(),
            ..QueueStats::default()
        };
        for item in &self.items {
            match item.status() {
                Some(QueueStatus::Pending) => stats.pending += 1,
                Some(QueueStatus::Review) => stats.review += 1,
                Some(QueueStatus::Uploaded) => stats.uploaded += 1,
                Some(QueueStatus::Failed) => stats.failed += 1,
                None => {}
            }
        }
        stats
    }

    /// Find an item by exact id, else by case-insensitive title.
    pub fn find_item(&self, id_or_title: &str) -> Option<&QueueItem> {
        let needle = id_or_title.trim();
        self.items
            .iter()
            .find(|item| item.id == needle)
            .or_else(|| {
                self.items
                    .iter()
                    .find(|item| item.title.eq_ignore_ascii_case(needle))
            })
    }

    /// Flag an empty queue, failed items and a pending backlog over `pending_threshold`.
    pub fn health(&self, pending_threshold: usize) -> QueueHealth {
        let stats = self.stats();
        let mut issues = Vec::new();
        let mut recommendations = Vec::new();

        if stats.total == 0 && self.total == 0 {
            issues.push("queue is empty".to_string());
            recommendations.push("add books or niches so there is something to generate".to_string());
        }
        if stats.failed > 0 {
            issues.push(format!("{} book(s) failed", stats.failed));
            recommendations.push("review the failed books and retry them".to_string());
        }
        if stats.pending > pending_threshold {
            issues.push(format!(
                "{} books pending (more than {pending_threshold})",
                stats.pending
            ));
            recommendations.push("run pending generation to work through the backlog".to_string());
        }

        QueueHealth {
            is_healthy: issues.is_empty(),
            issues,
            recommendations,
        }
    }
}

/// Queue fetch failed and nothing was cached to fall back on.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// Backend unreachable or failing, and no cached page exists.
    #[error("queue unavailable: {0:#}")]
    Unavailable(#[source] anyhow::Error),
}

/// Queue store tunables.
#[derive(Debug, Clone, Copy)]
pub struct QueueConfig {
    /// Freshness window of a cached page.
    pub ttl: Duration,
    /// How long the fallback copy of a page is kept.
    pub last_known_ttl: Duration,
    /// Default page size.
    pub per_page: u32,
    /// Pending count above which the queue is reported as backlogged.
    pub pending_backlog_threshold: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30),
            last_known_ttl: Duration::from_secs(24 * 60 * 60),
            per_page: 50,
            pending_backlog_threshold: 50,
        }
    }
}

fn page_key(page: u32, per_page: u32) -> String {
    format!("{KEY_PREFIX}page={page}:per_page={per_page}")
}

fn last_known_key(page: u32, per_page: u32) -> String {
    format!("{KEY_PREFIX}last-known:page={page}:per_page={per_page}")
}

/// Cached, read-only view of the backend queue.
pub struct QueueStore<B> {
    backend: B,
    cache: Arc<QueueCache>,
    tokens: Arc<dyn TokenStore>,
    cfg: QueueConfig,
}

impl<B: JobBackend> QueueStore<B> {
    /// Store reading through `cache`.
    pub fn new(
        backend: B,
        cache: Arc<QueueCache>,
        tokens: Arc<dyn TokenStore>,
        cfg: QueueConfig,
    ) -> Self {
        Self {
            backend,
            cache,
            tokens,
            cfg,
        }
    }

    /// Store config.
    pub fn config(&self) -> &QueueConfig {
        &self.cfg
    }

    /// Fetch a page, serving a fresh cached copy when `use_cache` is set.
    ///
    /// A backend failure falls back to the last cached copy, however old.
    pub async fn fetch(
        &self,
        page: u32,
        per_page: u32,
        use_cache: bool,
    ) -> Result<QueueSnapshot, QueueError> {
        let key = page_key(page, per_page);
        let fallback_key = last_known_key(page, per_page);

        if use_cache {
            if let Some(snapshot) = self.cache.get(&key) {
                return Ok(snapshot);
            }
        }

        let generation = self.cache.next_generation();
        let token = self.tokens.access_token();
        match self.backend.queue_page(page, per_page, token.as_deref()).await {
            Ok(snapshot) => {
                self.cache.set_registered(
                    key,
                    snapshot.clone(),
                    self.cfg.ttl,
                    generation,
                    &QUEUE_EVENTS,
                );
                self.cache.set_registered(
                    fallback_key,
                    snapshot.clone(),
                    self.cfg.last_known_ttl,
                    generation,
                    &QUEUE_EVENTS,
                );
                Ok(snapshot)
            }
            Err(err) => {
                let cached = self
                    .cache
                    .get(&key)
                    .or_else(|| self.cache.get(&fallback_key));
                match cached {
                    Some(snapshot) => {
                        tracing::warn!(page, "queue fetch failed, serving cached page: {err:#}");
                        Ok(snapshot)
                    }
                    None => Err(QueueError::Unavailable(err)),
                }
            }
        }
    }

    /// [`QueueSnapshot::health`] with the configured backlog threshold.
    pub fn health(&self, snapshot: &QueueSnapshot) -> QueueHealth {
        snapshot.health(self.cfg.pending_backlog_threshold)
    }
}

/// Drop every cached queue page, fresh and fallback alike.
pub fn invalidate_all(cache: &QueueCache) -> usize {
    cache.delete_where(|key| key.starts_with(KEY_PREFIX))
}

const CACHE_FILE_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedPage {
    key: String,
    expires_at: DateTime<Utc>,
    #[serde(default)]
    events: Vec<InvalidationEvent>,
    snapshot: QueueSnapshot,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct QueueCacheFileData {
    #[serde(default)]
    version: u32,
    #[serde(default)]
    pages: Vec<PersistedPage>,
}

/// Queue pages kept on disk between runs, so a short-lived process starts warm.
#[derive(Debug, Clone)]
pub struct QueueCacheFile {
    path: PathBuf,
}

impl QueueCacheFile {
    /// `$XDG_STATE_HOME/pubforge/queue-cache.json`.
    pub fn load_default() -> anyhow::Result<Self> {
        Ok(Self::new(state::state_file("queue-cache.json")?))
    }

    /// File at `path`.
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Copy the unexpired pages on disk into `cache`. Returns how many were restored.
    ///
    /// A missing file restores nothing; a file from another version is ignored.
    pub fn restore_into(&self, cache: &QueueCache) -> anyhow::Result<usize> {
        if !self.path.exists() {
            return Ok(0);
        }
        let raw = std::fs::read_to_string(&self.path)?;
        let file: QueueCacheFileData = serde_json::from_str(&raw)?;
        if file.version != CACHE_FILE_VERSION {
            tracing::warn!(
                version = file.version,
                path = %self.path.display(),
                "ignoring queue cache written by another version"
            );
            return Ok(0);
        }

        let now = Utc::now();
        let entries = file.pages.into_iter().filter_map(|page| {
            let remaining = (page.expires_at - now).to_std().ok()?;
            page.key.starts_with(KEY_PREFIX).then_some(ExportedEntry {
                key: page.key,
                value: page.snapshot,
                remaining,
                events: page.events,
            })
        });
        Ok(cache.import(entries))
    }

    /// Write the live queue pages of `cache`; with none left the file is removed.
    pub async fn save_from(&self, cache: &QueueCache) -> anyhow::Result<()> {
        let now = Utc::now();
        let pages = cache
            .export(|key| key.starts_with(KEY_PREFIX))
            .into_iter()
            .filter_map(|entry| {
                let remaining = chrono::Duration::from_std(entry.remaining).ok()?;
                Some(PersistedPage {
                    key: entry.key,
                    expires_at: now + remaining,
                    events: entry.events,
                    snapshot: entry.value,
                })
            })
            .collect();
        let file = QueueCacheFileData {
            version: CACHE_FILE_VERSION,
            pages,
        };

        let path = self.path.clone();
        tokio::task::spawn_blocking(move || {
            if file.pages.is_empty() {
                state::remove_file(&path);
                return Ok(());
            }
            state::write_json(&path, &file)
        })
        .await
        .map_err(|err| anyhow::anyhow!("persist queue cache: {err:#}"))??;
        Ok(())
    }
}
