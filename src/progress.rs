// src/progress.rs

//! Progress reporting for conversions
//!
//! The orchestrator reports each stage through [`ProgressTracker::set_message`]
//! and each transcoded archive entry through [`ProgressTracker::increment`].
//! Implementations:
//! - `LogProgress`: logs to tracing
//! - `SilentProgress`: counts without output
//! - `CallbackProgress`: forwards events to a closure

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::info;

/// Core trait for progress tracking
///
/// Implementations must be thread-safe since conversions may run on worker
/// threads.
pub trait ProgressTracker: Send + Sync {
    /// Set the current status message
    fn set_message(&self, message: &str);

    /// Increment progress by the given amount
    fn increment(&self, amount: u64);

    /// Set the total (length) of the progress
    fn set_length(&self, length: u64);

    /// Get current position
    fn position(&self) -> u64;

    /// Finish progress successfully with a message
    fn finish_with_message(&self, message: &str);

    /// Finish progress with an error/abandonment message
    fn finish_with_error(&self, message: &str);

    /// Check if progress is finished
    fn is_finished(&self) -> bool;
}

/// Silent progress tracker
#[derive(Debug, Default)]
pub struct SilentProgress {
    position: AtomicU64,
    length: AtomicU64,
    finished: AtomicBool,
}

impl SilentProgress {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProgressTracker for SilentProgress {
    fn set_message(&self, _message: &str) {}

    fn increment(&self, amount: u64) {
        self.position.fetch_add(amount, Ordering::Relaxed);
    }

    fn set_length(&self, length: u64) {
        self.length.store(length, Ordering::Relaxed);
    }

    fn position(&self) -> u64 {
        self.position.load(Ordering::Relaxed)
    }

    fn finish_with_message(&self, _message: &str) {
        self.finished.store(true, Ordering::Relaxed);
    }

    fn finish_with_error(&self, _message: &str) {
        self.finished.store(true, Ordering::Relaxed);
    }

    fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Relaxed)
    }
}

/// Logging progress tracker
///
/// Stage messages are logged at info level; entry counts every
/// `log_interval` entries.
#[derive(Debug)]
pub struct LogProgress {
    name: String,
    position: AtomicU64,
    length: AtomicU64,
    finished: AtomicBool,
    log_interval: u64,
}

impl LogProgress {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            position: AtomicU64::new(0),
            length: AtomicU64::new(0),
            finished: AtomicBool::new(false),
            log_interval: 100,
        }
    }

    /// Set the logging interval
    pub fn with_log_interval(mut self, interval: u64) -> Self {
        self.log_interval = interval.max(1);
        self
    }
}

impl ProgressTracker for LogProgress {
    fn set_message(&self, message: &str) {
        info!("{}: {}", self.name, message);
    }

    fn increment(&self, amount: u64) {
        let old_pos = self.position.fetch_add(amount, Ordering::Relaxed);
        let new_pos = old_pos + amount;
        if new_pos / self.log_interval > old_pos / self.log_interval {
            let length = self.length.load(Ordering::Relaxed);
            if length > 0 {
                info!("{}: {}/{} entries", self.name, new_pos, length);
            } else {
                info!("{}: {} entries", self.name, new_pos);
            }
        }
    }

    fn set_length(&self, length: u64) {
        self.length.store(length, Ordering::Relaxed);
    }

    fn position(&self) -> u64 {
        self.position.load(Ordering::Relaxed)
    }

    fn finish_with_message(&self, message: &str) {
        self.finished.store(true, Ordering::Relaxed);
        info!("{}: {}", self.name, message);
    }

    fn finish_with_error(&self, message: &str) {
        self.finished.store(true, Ordering::Relaxed);
        info!("{}: ERROR - {}", self.name, message);
    }

    fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Relaxed)
    }
}

/// Events emitted by [`CallbackProgress`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    Message(String),
    Position(u64),
    Finished(String),
    Error(String),
}

/// Callback-based progress tracker
pub struct CallbackProgress<F>
where
    F: Fn(ProgressEvent) + Send + Sync,
{
    callback: F,
    position: AtomicU64,
    finished: AtomicBool,
}

impl<F> CallbackProgress<F>
where
    F: Fn(ProgressEvent) + Send + Sync,
{
    pub fn new(callback: F) -> Self {
        Self {
            callback,
            position: AtomicU64::new(0),
            finished: AtomicBool::new(false),
        }
    }
}

impl<F> ProgressTracker for CallbackProgress<F>
where
    F: Fn(ProgressEvent) + Send + Sync,
{
    fn set_message(&self, message: &str) {
        (self.callback)(ProgressEvent::Message(message.to_string()));
    }

    fn increment(&self, amount: u64) {
        let new_pos = self.position.fetch_add(amount, Ordering::Relaxed) + amount;
        (self.callback)(ProgressEvent::Position(new_pos));
    }

    fn set_length(&self, _length: u64) {}

    fn position(&self) -> u64 {
        self.position.load(Ordering::Relaxed)
    }

    fn finish_with_message(&self, message: &str) {
        self.finished.store(true, Ordering::Relaxed);
        (self.callback)(ProgressEvent::Finished(message.to_string()));
    }

    fn finish_with_error(&self, message: &str) {
        self.finished.store(true, Ordering::Relaxed);
        (self.callback)(ProgressEvent::Error(message.to_string()));
    }

    fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_silent_progress_counts() {
        let progress = SilentProgress::new();
        progress.increment(3);
        progress.increment(2);
        assert_eq!(progress.position(), 5);
        assert!(!progress.is_finished());
        progress.finish_with_message("done");
        assert!(progress.is_finished());
    }

    #[test]
    fn test_callback_progress_events() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let progress = CallbackProgress::new(move |e| sink.lock().unwrap().push(e));

        progress.set_message("Reading metadata");
        progress.increment(1);
        progress.finish_with_error("boom");

        assert_eq!(
            *events.lock().unwrap(),
            vec![
                ProgressEvent::Message("Reading metadata".to_string()),
                ProgressEvent::Position(1),
                ProgressEvent::Error("boom".to_string()),
            ]
        );
        assert!(progress.is_finished());
    }
}
