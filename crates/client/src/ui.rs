use std::io::Write;

use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};

use pubforge_client_engine::{Job, JobStatus, LogEntry, LogLevel};

use crate::constants::PROGRESS_BAR_STEPS;

struct Bars {
    mp: MultiProgress,
    job_pb: ProgressBar,
    stop_pb: ProgressBar,
    last_step: u64,
}

impl Bars {
    fn new() -> anyhow::Result<Self> {
        let mp = MultiProgress::new();
        mp.set_draw_target(ProgressDrawTarget::stdout());
        mp.set_move_cursor(true);

        let job_pb = mp.add(ProgressBar::new(PROGRESS_BAR_STEPS));
        job_pb.set_style(
            ProgressStyle::with_template("{prefix} {bar:30.cyan/blue} {msg}\u{1b}[0K")?
                .progress_chars("#--"),
        );
        job_pb.set_prefix("Books");
        job_pb.set_message("Waiting for the backend");

        let stop_pb = mp.add(ProgressBar::new(0));
        stop_pb.set_style(ProgressStyle::with_template("{msg}\u{1b}[0K")?);
        stop_pb.set_message(" ");

        Ok(Self {
            mp,
            job_pb,
            stop_pb,
            last_step: 0,
        })
    }
}

/// Renders job states as they are published: new log records as lines, the
/// rest on a progress bar (or as plain status lines without one).
pub(crate) struct JobView {
    bars: Option<Bars>,
    logs_printed: usize,
    last_line: String,
}

impl JobView {
    pub(crate) fn new(progress_bar: bool) -> anyhow::Result<Self> {
        let bars = if progress_bar { Some(Bars::new()?) } else { None };
        Ok(Self {
            bars,
            logs_printed: 0,
            last_line: String::new(),
        })
    }

    pub(crate) fn println(&self, msg: &str) {
        match &self.bars {
            Some(bars) => {
                let _ = bars.mp.println(msg);
            }
            None => println!("{msg}"),
        }
    }

    pub(crate) fn set_stop_message(&mut self, msg: &str) {
        match &self.bars {
            Some(bars) => bars.stop_pb.set_message(msg.to_string()),
            None => eprintln!("{msg}"),
        }
    }

    pub(crate) fn render(&mut self, job: &Job) {
        // A new run starts with an empty log.
        if job.logs.len() < self.logs_printed {
            self.logs_printed = 0;
        }
        for entry in &job.logs[self.logs_printed..] {
            self.println(&format_log_line(entry));
        }
        self.logs_printed = job.logs.len();

        let line = status_line(job);
        match &mut self.bars {
            Some(bars) => {
                let step = calc_progress_step(job.progress);
                if step != bars.last_step {
                    bars.last_step = step;
                    bars.job_pb.set_position(step);
                }
                bars.job_pb.set_message(line);
            }
            None => {
                if job.is_running() && line != self.last_line {
                    println!("{line}");
                    self.last_line = line;
                }
            }
        }
    }

    pub(crate) fn freeze(&self) {
        let Some(bars) = &self.bars else { return };
        bars.mp.set_move_cursor(false);
        bars.job_pb.abandon();
        bars.stop_pb.abandon();
        let _ = std::io::stdout().write_all(b"\n");
    }
}

fn calc_progress_step(progress: f64) -> u64 {
    if !progress.is_finite() {
        return 0;
    }
    let pct = progress.clamp(0.0, 100.0);
    ((pct * PROGRESS_BAR_STEPS as f64 / 100.0).round() as u64).min(PROGRESS_BAR_STEPS)
}

fn format_log_line(entry: &LogEntry) -> String {
    let level = match entry.level {
        LogLevel::Info => "info",
        LogLevel::Success => "ok",
        LogLevel::Warning => "warn",
        LogLevel::Error => "error",
    };
    format!(
        "[{}] {level:>5} {}",
        entry.timestamp.format("%H:%M:%S"),
        entry.message
    )
}

pub(crate) fn status_line(job: &Job) -> String {
    let mut parts = Vec::new();
    match job.total_books {
        Some(total) => parts.push(format!("{}/{total}", job.processed_books)),
        None => parts.push(format!("{} processed", job.processed_books)),
    }
    if job.successful_books > 0 || job.failed_books > 0 {
        parts.push(format!("ok {} failed {}", job.successful_books, job.failed_books));
    }
    if let Some(step) = job.current_step.as_deref() {
        parts.push(step.to_string());
    }
    if let Some(book) = job.current_book.as_deref() {
        parts.push(format!("\"{book}\""));
    }
    if let Some(eta) = job.estimated_time_remaining.as_deref() {
        parts.push(format!("eta {eta}"));
    }
    parts.join(" | ")
}

pub(crate) fn summary_line(job: &Job) -> String {
    let id = job.job_id.as_deref().unwrap_or("-");
    let counts = format!(
        "{} succeeded, {} failed{}",
        job.successful_books,
        job.failed_books,
        job.total_books
            .map(|total| format!(" of {total}"))
            .unwrap_or_default()
    );
    let took = job
        .duration_seconds
        .map(|secs| format!(" in {secs:.0}s"))
        .unwrap_or_default();
    match job.status {
        JobStatus::Complete => format!("Job {id} complete: {counts}{took}"),
        JobStatus::Cancelled => format!("Job {id} stopped: {counts}"),
        JobStatus::Error => format!(
            "Job {id} failed: {} ({counts}). Run `pubforge recover` to reattach.",
            job.error.as_deref().unwrap_or("unknown error")
        ),
        JobStatus::Idle | JobStatus::Running => format!("Job {id}: {counts}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn calc_progress_step_clamps_and_scales() {
        let steps = PROGRESS_BAR_STEPS;
        assert_eq!(calc_progress_step(0.0), 0);
        assert_eq!(calc_progress_step(50.0), steps / 2);
        assert_eq!(calc_progress_step(100.0), steps);
        assert_eq!(calc_progress_step(250.0), steps);
        assert_eq!(calc_progress_step(-3.0), 0);
        assert_eq!(calc_progress_step(f64::NAN), 0);
    }

    #[test]
    fn status_line_shows_only_known_fields() {
        let mut job = Job {
            status: JobStatus::Running,
            processed_books: 3,
            ..Job::default()
        };
        assert_eq!(status_line(&job), "3 processed");

        job.total_books = Some(10);
        job.successful_books = 2;
        job.failed_books = 1;
        job.current_book = Some("Dune".into());
        assert_eq!(status_line(&job), "3/10 | ok 2 failed 1 | \"Dune\"");
    }

    #[test]
    fn summary_mentions_recovery_on_error() {
        let job = Job {
            job_id: Some("j-1".into()),
            status: JobStatus::Error,
            error: Some("lost contact".into()),
            ..Job::default()
        };
        let line = summary_line(&job);
        assert!(line.starts_with("Job j-1 failed: lost contact"));
        assert!(line.contains("pubforge recover"));
    }

    #[test]
    fn log_lines_carry_the_level() {
        let entry = LogEntry::now(LogLevel::Warning, "slow backend");
        let line = format_log_line(&entry);
        assert!(line.ends_with(" warn slow backend"));
    }
}
