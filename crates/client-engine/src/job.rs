use crate::api::{Job, JobStatus, LogEntry, LogLevel, ProgressDelta, UnitEvent};

impl Job {
    /// Whether a job is dispatched and not yet terminal.
    pub fn is_running(&self) -> bool {
        self.status == JobStatus::Running
    }

    /// Whether the job reached `Complete`, `Cancelled` or `Error`.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            JobStatus::Complete | JobStatus::Cancelled | JobStatus::Error
        )
    }

    /// Reset everything for a fresh run.
    pub(crate) fn begin(&mut self) {
        *self = Job {
            status: JobStatus::Running,
            ..Job::default()
        };
    }

    /// Resume observing `job_id`, keeping whatever counters are already known.
    pub(crate) fn resume(&mut self, job_id: String) {
        if self.job_id.as_deref() != Some(job_id.as_str()) {
            // Different job than the one in memory: its counters do not apply.
            *self = Job::default();
            self.job_id = Some(job_id);
        }
        self.status = JobStatus::Running;
        self.error = None;
    }

    pub(crate) fn fail(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        self.logs.push(LogEntry::now(LogLevel::Error, reason.clone()));
        self.status = JobStatus::Error;
        self.error = Some(reason);
    }

    /// Fold one execution-unit message into the job.
    ///
    /// Messages that arrive while no job is running are ignored; this returns
    /// `false` for them.
    pub fn apply(&mut self, event: &UnitEvent) -> bool {
        if !self.is_running() {
            return false;
        }
        match event {
            UnitEvent::Progress(delta) => {
                self.merge(delta);
                self.error = None;
            }
            UnitEvent::Complete(delta) => {
                self.merge(delta);
                self.finalize_counts();
                self.status = JobStatus::Complete;
                self.progress = 100.0;
                self.current_book = None;
                self.error = None;
            }
            UnitEvent::Cancelled(delta) => {
                self.merge(delta);
                self.status = JobStatus::Cancelled;
                self.current_book = None;
            }
            UnitEvent::Error { reason, partial } => {
                self.merge(partial);
                self.fail(reason.clone());
            }
            UnitEvent::Status(status) => {
                if !status.running {
                    return false;
                }
                self.merge(&status.known);
            }
            UnitEvent::AlreadyRunning => return false,
        }
        true
    }

    // Counters only grow; `remaining_books` is derived from them.
    fn merge(&mut self, delta: &ProgressDelta) {
        if let Some(job_id) = &delta.job_id {
            self.job_id = Some(job_id.clone());
        }

        if let Some(total) = delta.total_books {
            self.total_books = Some(self.total_books.map_or(total, |t| t.max(total)));
        }
        raise(&mut self.successful_books, delta.successful_books);
        raise(&mut self.failed_books, delta.failed_books);
        let accounted = self.successful_books.saturating_add(self.failed_books);
        let counts_known =
            delta.successful_books.is_some() || delta.failed_books.is_some() || accounted > 0;
        if counts_known {
            // Once outcomes are reported, `processed_books` is their sum.
            self.processed_books = accounted;
        } else {
            raise(&mut self.processed_books, delta.processed_books);
        }

        match self.total_books {
            Some(total) => {
                self.remaining_books = Some(total.saturating_sub(self.processed_books));
            }
            None => {
                if delta.remaining_books.is_some() {
                    self.remaining_books = delta.remaining_books;
                }
            }
        }

        let progress = match (delta.progress, self.total_books) {
            (Some(p), _) => p,
            (None, Some(total)) if total > 0 => {
                f64::from(self.processed_books) * 100.0 / f64::from(total)
            }
            _ => self.progress,
        };
        self.progress = self.progress.max(progress).clamp(0.0, 100.0);

        if let Some(secs) = delta.duration_seconds {
            self.duration_seconds = Some(self.duration_seconds.map_or(secs, |d| d.max(secs)));
        }
        if delta.current_step.is_some() {
            self.current_step = delta.current_step.clone();
        }
        if delta.current_book.is_some() {
            self.current_book = delta.current_book.clone();
        }
        if delta.estimated_time_remaining.is_some() {
            self.estimated_time_remaining = delta.estimated_time_remaining.clone();
        }
        self.logs.extend(delta.logs.iter().cloned());
        if let Some(cursor) = delta.log_cursor {
            self.log_cursor = self.log_cursor.max(cursor);
        }
    }

    fn finalize_counts(&mut self) {
        let accounted = self.successful_books.saturating_add(self.failed_books);
        match self.total_books {
            Some(total) if accounted < total => {
                let missing = total - accounted;
                self.failed_books += missing;
                self.logs.push(LogEntry::now(
                    LogLevel::Warning,
                    format!("{missing} book(s) were not reported by the backend; counted as failed"),
                ));
            }
            Some(total) if accounted > total => self.total_books = Some(accounted),
            Some(_) => {}
            None if accounted > 0 => self.total_books = Some(accounted),
            None => {}
        }
        self.processed_books = self.successful_books + self.failed_books;
        self.remaining_books = Some(0);
    }
}

fn raise(field: &mut u32, value: Option<u32>) {
    if let Some(v) = value {
        *field = (*field).max(v);
    }
}
