//! Progress reporting and cooperative cancellation.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Receives progress updates from a running install.
///
/// `report` is called after every written chunk and must not block;
/// `is_cancelled` is polled at chunk and archive boundaries, and a
/// `true` answer stops the job before the next write.
pub trait ProgressSink: Send + Sync {
    fn report(&self, done: u64, total: u64);

    fn is_cancelled(&self) -> bool {
        false
    }
}

/// Sink that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullProgress;

impl ProgressSink for NullProgress {
    fn report(&self, _done: u64, _total: u64) {}
}

/// Shared cancel flag plus last-reported counters, usable from another
/// thread while the install runs.
#[derive(Debug, Default)]
pub struct ProgressState {
    done: AtomicU64,
    total: AtomicU64,
    cancelled: AtomicBool,
}

impl ProgressState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> (u64, u64) {
        (
            self.done.load(Ordering::Relaxed),
            self.total.load(Ordering::Relaxed),
        )
    }
}

impl ProgressSink for ProgressState {
    fn report(&self, done: u64, total: u64) {
        self.done.store(done, Ordering::Relaxed);
        self.total.store(total, Ordering::Relaxed);
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn state_tracks_reports_and_cancel() {
        let state = ProgressState::new();
        assert!(!state.is_cancelled());

        state.report(10, 100);
        assert_eq!(state.snapshot(), (10, 100));

        state.cancel();
        assert!(state.is_cancelled());
    }

    #[test]
    fn null_progress_never_cancels() {
        let sink = NullProgress;
        sink.report(1, 2);
        assert!(!sink.is_cancelled());
    }
}
