//! Progress reporting for sync runs.
//!
//! Two modes, auto-detected from the terminal:
//! - Interactive mode (TTY): an animated percentage bar using indicatif
//! - Logging mode (non-TTY): structured logging using tracing
//!
//! Both consume the same [`ProgressEvent`] stream the push transport
//! serves, so the CLI renders exactly what a remote observer would see.

use std::sync::Mutex;

use console::Term;
use indicatif::{ProgressBar, ProgressStyle};
use mirrorsync::ProgressEvent;
use mirrorsync::{ProgressSnapshot, TaskStatus};

/// Progress reporter that handles both interactive and logging modes.
pub(crate) enum ProgressReporter {
    /// Interactive progress bar for TTY.
    Interactive(InteractiveReporter),
    /// Structured logging for non-TTY (CI, pipes).
    Logging(LoggingReporter),
}

impl ProgressReporter {
    /// Create a new progress reporter, auto-detecting TTY mode.
    pub fn new() -> Self {
        if Term::stdout().is_term() {
            Self::Interactive(InteractiveReporter::new())
        } else {
            Self::Logging(LoggingReporter)
        }
    }

    /// Handle one progress event.
    pub fn handle(&self, event: &ProgressEvent) {
        match self {
            Self::Interactive(r) => r.handle(event),
            Self::Logging(r) => r.handle(event),
        }
    }

    /// Finish the bar (interactive mode only).
    pub fn finish(&self) {
        if let Self::Interactive(r) = self {
            r.finish();
        }
    }
}

/// Interactive reporter: one bar tracking overall percentage.
pub(crate) struct InteractiveReporter {
    bar: Mutex<Option<ProgressBar>>,
}

impl InteractiveReporter {
    pub fn new() -> Self {
        Self {
            bar: Mutex::new(None),
        }
    }

    pub fn handle(&self, event: &ProgressEvent) {
        let mut slot = self.bar.lock().unwrap();

        match event {
            ProgressEvent::Connected { progress, .. } | ProgressEvent::Progress { progress, .. } => {
                let bar = slot.get_or_insert_with(|| {
                    let bar = ProgressBar::new(100);
                    bar.set_style(Self::bar_style());
                    bar
                });
                bar.set_position(progress.percentage as u64);
                bar.set_prefix(format!("{:16}", step_label(progress)));
                bar.set_message(render_message(progress));
            }

            ProgressEvent::Completed { status, progress, .. } => {
                if let Some(bar) = slot.take() {
                    bar.set_position(progress.percentage as u64);
                    let symbol = match status {
                        TaskStatus::Cancelled => "∅ cancelled:",
                        _ => "✓",
                    };
                    bar.finish_with_message(format!(
                        "{symbol} {} synced, {} failed",
                        progress.counts.succeeded, progress.counts.failed
                    ));
                }
            }

            ProgressEvent::Failed { progress, .. } => {
                if let Some(bar) = slot.take() {
                    bar.abandon_with_message(format!("✗ failed: {}", progress.message));
                }
            }

            ProgressEvent::NotFound { task_id } => {
                if let Some(bar) = slot.take() {
                    bar.abandon_with_message(format!("✗ unknown task {task_id}"));
                }
            }

            ProgressEvent::Timeout { task_id } => {
                if let Some(bar) = slot.take() {
                    bar.abandon_with_message(format!("⏳ timed out waiting for task {task_id}"));
                }
            }
        }
    }

    pub fn finish(&self) {
        if let Some(bar) = self.bar.lock().unwrap().take()
            && !bar.is_finished()
        {
            bar.finish();
        }
    }

    fn bar_style() -> ProgressStyle {
        ProgressStyle::default_bar()
            .template("{prefix:.bold.cyan} [{bar:40.cyan/blue}] {pos:>3}% {msg}")
            .expect("Invalid template")
            .progress_chars("█▓░")
    }
}

/// Logging reporter using tracing for structured output.
pub(crate) struct LoggingReporter;

impl LoggingReporter {
    pub fn handle(&self, event: &ProgressEvent) {
        match event {
            ProgressEvent::Connected { task_id, status, .. } => {
                tracing::info!(task_id = %task_id, status = ?status, "Connected to task");
            }
            ProgressEvent::Progress { progress, .. } => {
                tracing::info!(
                    percentage = format!("{:.1}", progress.percentage),
                    step = ?progress.current_step,
                    processed = progress.counts.processed,
                    total = progress.counts.total,
                    failed = progress.counts.failed,
                    "{}",
                    progress.message
                );
            }
            ProgressEvent::Completed { task_id, status, progress } => {
                tracing::info!(
                    task_id = %task_id,
                    status = ?status,
                    succeeded = progress.counts.succeeded,
                    failed = progress.counts.failed,
                    elapsed_ms = progress.timing.elapsed_ms,
                    "Sync finished"
                );
            }
            ProgressEvent::Failed { task_id, progress, .. } => {
                tracing::error!(
                    task_id = %task_id,
                    message = %progress.message,
                    failed = progress.counts.failed,
                    "Sync failed"
                );
            }
            ProgressEvent::NotFound { task_id } => {
                tracing::error!(task_id = %task_id, "Task not found");
            }
            ProgressEvent::Timeout { task_id } => {
                tracing::error!(task_id = %task_id, "Timed out waiting for task");
            }
        }
    }
}

fn step_label(progress: &ProgressSnapshot) -> &'static str {
    use mirrorsync::SyncStep::*;
    match progress.current_step {
        Validate => "Validating",
        FetchPages => "Fetching",
        ProcessContent => "Processing",
        DownloadAssets => "Assets",
        SaveRecords => "Saving",
        UpdateIndex => "Indexing",
    }
}

fn render_message(progress: &ProgressSnapshot) -> String {
    if progress.counts.failed > 0 {
        format!("{} ({} failed)", progress.message, progress.counts.failed)
    } else {
        progress.message.clone()
    }
}
