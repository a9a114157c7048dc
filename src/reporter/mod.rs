// file: src/reporter/mod.rs
// version: 2.0.0
// guid: bf81da0c-f212-4772-8115-9784e9f6264f

//! Progress reporting for long-running operations
//!
//! Downloads, digests and image writes report byte counts through
//! [`ProgressReporter`]. Calls are fire-and-forget: a reporter never fails and
//! never blocks the caller for long.

use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Mutex;
use tracing::debug;

/// Sink for byte-level progress of one task at a time
pub trait ProgressReporter: Send + Sync {
    /// Start a new task; `total` is the expected byte count when known
    fn begin(&self, task: &str, total: Option<u64>);

    /// Bytes completed so far in the current task (non-decreasing)
    fn advance(&self, done: u64);

    /// The current task is over
    fn finish(&self);
}

/// Reporter that discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn begin(&self, _task: &str, _total: Option<u64>) {}
    fn advance(&self, _done: u64) {}
    fn finish(&self) {}
}

/// Terminal progress bars
pub struct ConsoleProgress {
    bar: Mutex<Option<ProgressBar>>,
}

impl ConsoleProgress {
    /// Create a new console reporter
    pub fn new() -> Self {
        Self {
            bar: Mutex::new(None),
        }
    }

    fn style(total_known: bool) -> ProgressStyle {
        let template = if total_known {
            "{spinner:.green} {msg} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})"
        } else {
            "{spinner:.green} {msg} [{elapsed_precise}] {bytes} ({bytes_per_sec})"
        };
        ProgressStyle::default_bar()
            .template(template)
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-")
    }
}

impl Default for ConsoleProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressReporter for ConsoleProgress {
    fn begin(&self, task: &str, total: Option<u64>) {
        let bar = match total {
            Some(total) => ProgressBar::new(total),
            None => ProgressBar::new_spinner(),
        };
        bar.set_style(Self::style(total.is_some()));
        bar.set_message(task.to_string());
        if let Ok(mut slot) = self.bar.lock() {
            if let Some(previous) = slot.replace(bar) {
                previous.finish_and_clear();
            }
        }
    }

    fn advance(&self, done: u64) {
        if let Ok(slot) = self.bar.lock() {
            if let Some(bar) = slot.as_ref() {
                bar.set_position(done);
            }
        }
    }

    fn finish(&self) {
        if let Ok(mut slot) = self.bar.lock() {
            if let Some(bar) = slot.take() {
                bar.finish();
            }
        }
    }
}

/// One recorded progress call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    Begin { task: String, total: Option<u64> },
    Advance(u64),
    Finish,
}

/// Reporter that keeps every call, for inspection in tests and tooling
#[derive(Debug, Default)]
pub struct RecordingProgress {
    events: Mutex<Vec<ProgressEvent>>,
}

impl RecordingProgress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the events recorded so far
    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Advance values reported for the task named `task`
    pub fn advances_for(&self, task: &str) -> Vec<u64> {
        let mut current = false;
        let mut values = Vec::new();
        for event in self.events() {
            match event {
                ProgressEvent::Begin { task: name, .. } => current = name == task,
                ProgressEvent::Advance(done) if current => values.push(done),
                ProgressEvent::Finish => current = false,
                _ => {}
            }
        }
        values
    }

    fn push(&self, event: ProgressEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

impl ProgressReporter for RecordingProgress {
    fn begin(&self, task: &str, total: Option<u64>) {
        debug!("progress begin: {} ({:?})", task, total);
        self.push(ProgressEvent::Begin {
            task: task.to_string(),
            total,
        });
    }

    fn advance(&self, done: u64) {
        self.push(ProgressEvent::Advance(done));
    }

    fn finish(&self) {
        self.push(ProgressEvent::Finish);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_progress_groups_by_task() {
        // Arrange
        let progress = RecordingProgress::new();

        // Act
        progress.begin("download", Some(10));
        progress.advance(4);
        progress.advance(10);
        progress.finish();
        progress.begin("write", None);
        progress.advance(2048);
        progress.finish();

        // Assert
        assert_eq!(progress.advances_for("download"), vec![4, 10]);
        assert_eq!(progress.advances_for("write"), vec![2048]);
        assert_eq!(progress.events().len(), 7);
    }

    #[test]
    fn test_console_progress_survives_out_of_order_calls() {
        let progress = ConsoleProgress::new();
        progress.advance(5);
        progress.finish();
        progress.begin("task", Some(1));
        progress.begin("next", None);
        progress.finish();
    }
}
