//! Progress reporting.
//!
//! Sinks are called from the dispatcher and must return quickly; the dispatcher
//! throttles events so a slow display is never flooded.

use indicatif::{ProgressBar, ProgressStyle};
use std::time::{Duration, Instant};
use tracing::info;

/// Snapshot of run progress.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressEvent {
    /// Records with a terminal outcome (including ones resumed from a checkpoint)
    pub completed: usize,
    /// Records in the record set
    pub total: usize,
    /// Failed records so far
    pub failed: usize,
    /// Time since this run started
    pub elapsed: Duration,
    /// Records per second during this run
    pub rate: f64,
    /// Set when the event accompanies a checkpoint save
    pub checkpoint_saved: bool,
}

impl ProgressEvent {
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            return 100.0;
        }
        self.completed as f64 / self.total as f64 * 100.0
    }
}

/// Receiver of progress events.
pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, event: &ProgressEvent);

    /// Called once when the run returns, completed or not.
    fn on_finish(&self, event: &ProgressEvent) {
        self.on_progress(event);
    }
}

/// Discards all events.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn on_progress(&self, _event: &ProgressEvent) {}
}

/// Logs events through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogProgress;

impl ProgressSink for LogProgress {
    fn on_progress(&self, event: &ProgressEvent) {
        info!(
            completed = event.completed,
            total = event.total,
            failed = event.failed,
            rate = format!("{:.2}/s", event.rate),
            percent = format!("{:.1}%", event.percent()),
            "Progress"
        );
    }
}

/// Terminal progress bar.
pub struct BarProgress {
    bar: ProgressBar,
}

impl BarProgress {
    pub fn new(total: usize) -> Self {
        let bar = ProgressBar::new(total as u64);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} ({percent}%) {msg}")
        {
            bar.set_style(style.progress_chars("##-"));
        }
        Self { bar }
    }
}

impl ProgressSink for BarProgress {
    fn on_progress(&self, event: &ProgressEvent) {
        self.bar.set_position(event.completed as u64);
        self.bar
            .set_message(format!("{:.2}/s, failed: {}", event.rate, event.failed));
    }

    fn on_finish(&self, event: &ProgressEvent) {
        self.on_progress(event);
        self.bar.finish_with_message(format!(
            "{}/{} done, {} failed",
            event.completed, event.total, event.failed
        ));
    }
}

/// Rate limit for progress events.
#[derive(Debug)]
pub(crate) struct Throttle {
    interval: Duration,
    last: Option<Instant>,
}

impl Throttle {
    pub(crate) fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    /// True if an event may be emitted now. `force` always passes.
    pub(crate) fn ready(&mut self, force: bool) -> bool {
        let now = Instant::now();
        let due = self
            .last
            .is_none_or(|last| now.duration_since(last) >= self.interval);
        if force || due {
            self.last = Some(now);
            true
        } else {
            false
        }
    }
}
