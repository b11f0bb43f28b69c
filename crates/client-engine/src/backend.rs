use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::Url;
use serde::{Deserialize, Deserializer};

use crate::api::{LogEntry, LogLevel, ProgressDelta};
use crate::queue::QueueSnapshot;

/// Backend failures that callers may want to tell apart.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// The access token was rejected.
    #[error("not authorized (http {status})")]
    Unauthorized {
        /// HTTP status (401 or 403).
        status: u16,
    },
    /// The job (or route) does not exist.
    #[error("not found")]
    NotFound,
    /// Any other non-success HTTP status.
    #[error("http {status}: {body}")]
    Http {
        /// HTTP status code.
        status: u16,
        /// Response body, for diagnostics.
        body: String,
    },
}

impl BackendError {
    /// Whether retrying the same request later can succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            BackendError::Http { status, .. } => *status >= 500 || *status == 429,
            BackendError::Unauthorized { .. } | BackendError::NotFound => false,
        }
    }
}

/// Whether a backend call failed in a way worth retrying. Transport errors are.
pub(crate) fn is_transient(err: &anyhow::Error) -> bool {
    err.downcast_ref::<BackendError>()
        .is_none_or(BackendError::is_transient)
}

/// Backend-reported job state, as a case-insensitive label.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(from = "String")]
pub enum FrameStatus {
    /// Accepted but not started.
    #[default]
    Pending,
    /// Work in progress.
    Running,
    /// Finished.
    Complete,
    /// Failed.
    Failed,
    /// Stopped on request.
    Cancelled,
    /// A label this client does not know; treated as still running.
    Unknown(String),
}

impl From<String> for FrameStatus {
    fn from(value: String) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" | "queued" | "starting" => FrameStatus::Pending,
            "running" | "processing" | "in_progress" | "active" => FrameStatus::Running,
            "complete" | "completed" | "done" | "finished" | "success" => FrameStatus::Complete,
            "failed" | "error" => FrameStatus::Failed,
            "cancelled" | "canceled" | "stopped" => FrameStatus::Cancelled,
            _ => FrameStatus::Unknown(value),
        }
    }
}

impl FrameStatus {
    /// Label for display.
    pub fn as_str(&self) -> &str {
        match self {
            FrameStatus::Pending => "pending",
            FrameStatus::Running => "running",
            FrameStatus::Complete => "complete",
            FrameStatus::Failed => "failed",
            FrameStatus::Cancelled => "cancelled",
            FrameStatus::Unknown(label) => label,
        }
    }
}

/// A log record as sent by the backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct FrameLog {
    /// RFC 3339 timestamp, if any.
    #[serde(default)]
    pub timestamp: Option<String>,
    /// Message text.
    #[serde(default)]
    pub message: String,
    /// Severity label.
    #[serde(default)]
    pub level: Option<String>,
}

impl FrameLog {
    fn to_entry(&self) -> LogEntry {
        let timestamp = self
            .timestamp
            .as_deref()
            .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
            .map(|ts| ts.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);
        LogEntry {
            timestamp,
            message: self.message.clone(),
            level: self.level.as_deref().map(LogLevel::parse).unwrap_or_default(),
        }
    }
}

/// One progress frame of a backend job (`GET jobs/{id}`).
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct JobFrame {
    /// Job identifier, when echoed back.
    #[serde(default, alias = "jobId", deserialize_with = "de_opt_id")]
    pub job_id: Option<String>,
    /// Job state.
    #[serde(default)]
    pub status: FrameStatus,
    /// Overall percent.
    #[serde(default)]
    pub progress: Option<f64>,
    /// Total books.
    #[serde(default)]
    pub total_books: Option<u32>,
    /// Books processed.
    #[serde(default)]
    pub processed_books: Option<u32>,
    /// Books generated successfully.
    #[serde(default)]
    pub successful_books: Option<u32>,
    /// Books that failed.
    #[serde(default)]
    pub failed_books: Option<u32>,
    /// Books remaining.
    #[serde(default)]
    pub remaining_books: Option<u32>,
    /// Current phase.
    #[serde(default)]
    pub current_step: Option<String>,
    /// Current book.
    #[serde(default)]
    pub current_book: Option<String>,
    /// Formatted ETA.
    #[serde(default)]
    pub estimated_time_remaining: Option<String>,
    /// Elapsed seconds.
    #[serde(default)]
    pub duration_seconds: Option<f64>,
    /// Full job log so far.
    #[serde(default)]
    pub logs: Option<Vec<FrameLog>>,
    /// Failure detail for failed jobs.
    #[serde(default)]
    pub error: Option<String>,
}

impl JobFrame {
    /// Convert to a delta, skipping the first `logs_seen` log records.
    pub fn to_delta(&self, logs_seen: usize) -> ProgressDelta {
        let logs = self
            .logs
            .as_deref()
            .unwrap_or_default()
            .iter()
            .skip(logs_seen)
            .map(FrameLog::to_entry)
            .collect();
        ProgressDelta {
            job_id: self.job_id.clone(),
            progress: self.progress,
            total_books: self.total_books,
            processed_books: self.processed_books,
            successful_books: self.successful_books,
            failed_books: self.failed_books,
            remaining_books: self.remaining_books,
            current_step: self.current_step.clone(),
            current_book: self.current_book.clone(),
            estimated_time_remaining: self.estimated_time_remaining.clone(),
            duration_seconds: self.duration_seconds,
            logs,
            log_cursor: Some(logs_seen.max(self.log_count())),
        }
    }

    /// Number of log records in the frame.
    pub fn log_count(&self) -> usize {
        self.logs.as_ref().map_or(0, Vec::len)
    }
}

#[derive(Debug, Deserialize)]
struct StartResponse {
    #[serde(alias = "jobId", deserialize_with = "de_id")]
    job_id: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawId {
    Str(String),
    Num(u64),
}

impl From<RawId> for String {
    fn from(id: RawId) -> Self {
        match id {
            RawId::Str(s) => s,
            RawId::Num(n) => n.to_string(),
        }
    }
}

/// Accept identifiers sent either as JSON strings or numbers.
pub(crate) fn de_id<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    Ok(RawId::deserialize(d)?.into())
}

fn de_opt_id<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    Ok(Option::<RawId>::deserialize(d)?.map(String::from))
}

/// Backend operations the engine depends on.
///
/// [`HttpBackend`] is the production implementation.
pub trait JobBackend: Clone + Send + Sync + 'static {
    /// Dispatch generation of all pending books; returns the new job id.
    fn start_generation(&self, token: &str) -> impl Future<Output = anyhow::Result<String>> + Send;

    /// Current progress frame of a job.
    fn job_frame(
        &self,
        job_id: &str,
        token: &str,
    ) -> impl Future<Output = anyhow::Result<JobFrame>> + Send;

    /// Request cancellation of a job.
    fn stop_job(&self, job_id: &str, token: &str) -> impl Future<Output = anyhow::Result<()>> + Send;

    /// One page of the book queue.
    fn queue_page(
        &self,
        page: u32,
        per_page: u32,
        token: Option<&str>,
    ) -> impl Future<Output = anyhow::Result<QueueSnapshot>> + Send;
}

/// `reqwest`-based client for the backend job and queue API.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    http: reqwest::Client,
    base: Url,
}

impl HttpBackend {
    /// Client rooted at `base` (a trailing `/` is added if missing).
    pub fn new(mut base: Url, timeout: Duration) -> anyhow::Result<Self> {
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { http, base })
    }

    fn url(&self, path: &str) -> anyhow::Result<Url> {
        Ok(self.base.join(path)?)
    }

    /// `jobs/{job_id}[/{action}]`, with the id pushed as a single escaped segment.
    fn job_url(&self, job_id: &str, action: Option<&str>) -> anyhow::Result<Url> {
        if job_id.is_empty() || job_id == "." || job_id == ".." {
            anyhow::bail!("invalid job id: {job_id:?}");
        }
        let mut url = self.base.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|()| anyhow::anyhow!("backend url cannot carry a path: {}", self.base))?;
            segments.pop_if_empty().push("jobs").push(job_id);
            if let Some(action) = action {
                segments.push(action);
            }
        }
        Ok(url)
    }
}

async fn check_status(res: reqwest::Response) -> anyhow::Result<reqwest::Response> {
    let status = res.status();
    if status.is_success() {
        return Ok(res);
    }
    let code = status.as_u16();
    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        return Err(BackendError::Unauthorized { status: code }.into());
    }
    if status == reqwest::StatusCode::NOT_FOUND {
        return Err(BackendError::NotFound.into());
    }
    let body = res.text().await.unwrap_or_default();
    Err(BackendError::Http { status: code, body }.into())
}

impl JobBackend for HttpBackend {
    async fn start_generation(&self, token: &str) -> anyhow::Result<String> {
        let url = self.url("jobs/generate-pending")?;
        let res = self.http.post(url).bearer_auth(token).send().await?;
        let body: StartResponse = check_status(res).await?.json().await?;
        Ok(body.job_id)
    }

    async fn job_frame(&self, job_id: &str, token: &str) -> anyhow::Result<JobFrame> {
        let url = self.job_url(job_id, None)?;
        let res = self.http.get(url).bearer_auth(token).send().await?;
        Ok(check_status(res).await?.json().await?)
    }

    async fn stop_job(&self, job_id: &str, token: &str) -> anyhow::Result<()> {
        let url = self.job_url(job_id, Some("stop"))?;
        let res = self.http.post(url).bearer_auth(token).send().await?;
        check_status(res).await?;
        Ok(())
    }

    async fn queue_page(
        &self,
        page: u32,
        per_page: u32,
        token: Option<&str>,
    ) -> anyhow::Result<QueueSnapshot> {
        let mut url = self.url("queue")?;
        url.query_pairs_mut()
            .append_pair("page", &page.to_string())
            .append_pair("per_page", &per_page.to_string());
        let mut req = self.http.get(url);
        if let Some(token) = token {
            req = req.bearer_auth(token);
        }
        let res = req.send().await?;
        Ok(check_status(res).await?.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::QueueStatus;

    fn backend_for(server: &mockito::Server) -> HttpBackend {
        let base = Url::parse(&format!("{}/api", server.url())).unwrap();
        HttpBackend::new(base, Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn start_generation_sends_bearer_token_and_reads_job_id() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/jobs/generate-pending")
            .match_header("authorization", "Bearer tok")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"jobId": 42}"#)
            .create_async()
            .await;

        let job_id = backend_for(&server).start_generation("tok").await.unwrap();
        assert_eq!(job_id, "42");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn job_frame_parses_progress_fields() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/jobs/abc")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{
                    "status": "PROCESSING",
                    "progress": 40,
                    "total_books": 10,
                    "processed_books": 4,
                    "successful_books": 3,
                    "failed_books": 1,
                    "remaining_books": 6,
                    "current_book": "Dune",
                    "current_step": "Generating content",
                    "estimated_time_remaining": "2m 10s",
                    "duration_seconds": 31.5,
                    "logs": [
                        {"timestamp": "2026-01-02T03:04:05Z", "message": "started", "level": "info"},
                        {"message": "cover failed", "level": "ERROR"}
                    ]
                }"#,
            )
            .create_async()
            .await;

        let frame = backend_for(&server).job_frame("abc", "tok").await.unwrap();
        assert_eq!(frame.status, FrameStatus::Running);
        assert_eq!(frame.total_books, Some(10));
        assert_eq!(frame.current_book.as_deref(), Some("Dune"));

        let delta = frame.to_delta(1);
        assert_eq!(delta.logs.len(), 1);
        assert_eq!(delta.logs[0].message, "cover failed");
        assert_eq!(delta.logs[0].level, LogLevel::Error);
        assert_eq!(delta.duration_seconds, Some(31.5));
    }

    #[tokio::test]
    async fn http_errors_are_classified() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/jobs/gone")
            .with_status(404)
            .create_async()
            .await;
        server
            .mock("GET", "/api/jobs/busy")
            .with_status(503)
            .with_body("try later")
            .create_async()
            .await;
        server
            .mock("POST", "/api/jobs/busy/stop")
            .with_status(401)
            .create_async()
            .await;

        let backend = backend_for(&server);
        let err = backend.job_frame("gone", "tok").await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BackendError>(),
            Some(BackendError::NotFound)
        ));
        assert!(!is_transient(&err));

        let err = backend.job_frame("busy", "tok").await.unwrap_err();
        assert!(is_transient(&err));
        assert!(format!("{err}").contains("try later"));

        let err = backend.stop_job("busy", "tok").await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BackendError>(),
            Some(BackendError::Unauthorized { status: 401 })
        ));
    }

    #[tokio::test]
    async fn job_id_is_sent_as_one_escaped_path_segment() {
        let mut server = mockito::Server::new_async().await;
        let frame = server
            .mock("GET", "/api/jobs/a%2Fb%3Fc%23d")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"status": "running"}"#)
            .create_async()
            .await;
        let stop = server
            .mock("POST", "/api/jobs/a%2Fb%3Fc%23d/stop")
            .with_status(204)
            .create_async()
            .await;

        let backend = backend_for(&server);
        let got = backend.job_frame("a/b?c#d", "tok").await.unwrap();
        assert_eq!(got.status, FrameStatus::Running);
        backend.stop_job("a/b?c#d", "tok").await.unwrap();
        frame.assert_async().await;
        stop.assert_async().await;
    }

    #[tokio::test]
    async fn dot_segments_are_rejected_as_job_ids() {
        let server = mockito::Server::new_async().await;
        let backend = backend_for(&server);
        assert!(backend.job_frame("..", "tok").await.is_err());
        assert!(backend.stop_job(".", "tok").await.is_err());
        assert!(backend.job_frame("", "tok").await.is_err());
    }

    #[tokio::test]
    async fn queue_page_passes_paging_and_reads_book_queue() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/queue")
            .match_query(mockito::Matcher::AllOf(vec![
                mockito::Matcher::UrlEncoded("page".into(), "2".into()),
                mockito::Matcher::UrlEncoded("per_page".into(), "25".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"book_queue": [{"id": 7, "title": "Emma", "status": "Pending", "niche": "romance"}],
                    "total": 26, "page": 2, "per_page": 25}"#,
            )
            .create_async()
            .await;

        let snap = backend_for(&server).queue_page(2, 25, None).await.unwrap();
        assert_eq!(snap.total, 26);
        assert_eq!(snap.items.len(), 1);
        assert_eq!(snap.items[0].id, "7");
        assert_eq!(snap.items[0].status(), Some(QueueStatus::Pending));
        assert_eq!(snap.items[0].metadata["niche"], "romance");
    }

    #[test]
    fn unknown_frame_status_is_preserved() {
        let status = FrameStatus::from("paused".to_string());
        assert_eq!(status, FrameStatus::Unknown("paused".into()));
        assert_eq!(status.as_str(), "paused");
        assert_eq!(FrameStatus::from("Canceled".to_string()), FrameStatus::Cancelled);
    }
}
