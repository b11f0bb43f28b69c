//! Scripted in-memory backend for unit tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use crate::backend::{FrameStatus, JobBackend, JobFrame};
use crate::queue::QueueSnapshot;

#[derive(Default)]
struct FakeState {
    next_job_id: String,
    start_calls: u32,
    start_error: Option<String>,
    hold_start: bool,
    frames: VecDeque<anyhow::Result<JobFrame>>,
    last_frame: Option<JobFrame>,
    polls: u32,
    stop_calls: Vec<String>,
    queue: VecDeque<anyhow::Result<QueueSnapshot>>,
    queue_calls: u32,
    hold_queue: bool,
}

#[derive(Clone, Default)]
pub(crate) struct FakeBackend {
    state: Arc<Mutex<FakeState>>,
    release_start: Arc<Notify>,
    release_queue: Arc<Notify>,
}

impl FakeBackend {
    fn with<R>(&self, f: impl FnOnce(&mut FakeState) -> R) -> R {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    pub(crate) fn set_job_id(&self, job_id: &str) {
        self.with(|s| s.next_job_id = job_id.to_string());
    }

    pub(crate) fn fail_start(&self, message: &str) {
        self.with(|s| s.start_error = Some(message.to_string()));
    }

    /// Park `start_generation` until [`FakeBackend::release_start`].
    pub(crate) fn hold_start(&self) {
        self.with(|s| s.hold_start = true);
    }

    pub(crate) fn release_start(&self) {
        self.with(|s| s.hold_start = false);
        self.release_start.notify_one();
    }

    /// Queue a frame for the next poll. Once drained, the last frame repeats.
    pub(crate) fn push_frame(&self, frame: JobFrame) {
        self.with(|s| s.frames.push_back(Ok(frame)));
    }

    pub(crate) fn push_poll_error(&self, err: anyhow::Error) {
        self.with(|s| s.frames.push_back(Err(err)));
    }

    pub(crate) fn push_queue(&self, res: anyhow::Result<QueueSnapshot>) {
        self.with(|s| s.queue.push_back(res));
    }

    /// Park `queue_page` (after counting the call) until [`FakeBackend::release_queue`].
    pub(crate) fn hold_queue(&self) {
        self.with(|s| s.hold_queue = true);
    }

    pub(crate) fn release_queue(&self) {
        self.with(|s| s.hold_queue = false);
        self.release_queue.notify_one();
    }

    pub(crate) fn start_calls(&self) -> u32 {
        self.with(|s| s.start_calls)
    }

    pub(crate) fn polls(&self) -> u32 {
        self.with(|s| s.polls)
    }

    pub(crate) fn stop_calls(&self) -> Vec<String> {
        self.with(|s| s.stop_calls.clone())
    }

    pub(crate) fn queue_calls(&self) -> u32 {
        self.with(|s| s.queue_calls)
    }
}

pub(crate) fn frame(status: FrameStatus) -> JobFrame {
    JobFrame {
        status,
        ..JobFrame::default()
    }
}

pub(crate) fn counts_frame(
    status: FrameStatus,
    total: u32,
    successful: u32,
    failed: u32,
) -> JobFrame {
    JobFrame {
        status,
        total_books: Some(total),
        processed_books: Some(successful + failed),
        successful_books: Some(successful),
        failed_books: Some(failed),
        ..JobFrame::default()
    }
}

impl JobBackend for FakeBackend {
    async fn start_generation(&self, _token: &str) -> anyhow::Result<String> {
        let (held, release) = self.with(|s| {
            s.start_calls += 1;
            (s.hold_start, self.release_start.clone())
        });
        if held {
            release.notified().await;
        }
        self.with(|s| match s.start_error.take() {
            Some(message) => Err(anyhow::anyhow!(message)),
            None if s.next_job_id.is_empty() => Ok("job-1".to_string()),
            None => Ok(s.next_job_id.clone()),
        })
    }

    async fn job_frame(&self, _job_id: &str, _token: &str) -> anyhow::Result<JobFrame> {
        self.with(|s| {
            s.polls += 1;
            match s.frames.pop_front() {
                Some(Ok(frame)) => {
                    s.last_frame = Some(frame.clone());
                    Ok(frame)
                }
                Some(Err(err)) => Err(err),
                None => s
                    .last_frame
                    .clone()
                    .ok_or_else(|| anyhow::anyhow!("no frame scripted")),
            }
        })
    }

    async fn stop_job(&self, job_id: &str, _token: &str) -> anyhow::Result<()> {
        self.with(|s| s.stop_calls.push(job_id.to_string()));
        Ok(())
    }

    async fn queue_page(
        &self,
        _page: u32,
        _per_page: u32,
        _token: Option<&str>,
    ) -> anyhow::Result<QueueSnapshot> {
        let (held, release) = self.with(|s| {
            s.queue_calls += 1;
            (s.hold_queue, self.release_queue.clone())
        });
        if held {
            release.notified().await;
        }
        self.with(|s| {
            s.queue
                .pop_front()
                .unwrap_or_else(|| Err(anyhow::anyhow!("no queue page scripted")))
        })
    }
}
