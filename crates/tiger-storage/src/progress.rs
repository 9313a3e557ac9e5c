//! Progress reporting and cooperative cancellation

use crate::{Result, StorageError};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Receives fractional progress in `0.0..=1.0`.
///
/// [`ArchiveSet`](crate::ArchiveSet) reports while holding its state lock.
/// A reporter must not call back into the same set: structural operations
/// (add, enable, disable, delete, install, re-link, usage cache rebuild)
/// fail with [`StorageError::Busy`], and lookups such as `file` or
/// `read_file` block forever.
pub trait Progress {
    /// Report progress
    fn report(&self, fraction: f32);
}

impl<F: Fn(f32)> Progress for F {
    fn report(&self, fraction: f32) {
        self(fraction);
    }
}

/// Discards progress reports
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl Progress for NoProgress {
    fn report(&self, _fraction: f32) {}
}

/// Shared cancellation flag, checked between files
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    /// Token that has not been cancelled
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Whether cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// `Err(Cancelled)` once cancellation was requested
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(StorageError::Cancelled);
        }
        Ok(())
    }
}

/// Maps a sub-operation's progress onto a slice of the parent's range
pub(crate) struct ScaledProgress<'a> {
    inner: &'a dyn Progress,
    start: f32,
    span: f32,
}

impl<'a> ScaledProgress<'a> {
    pub(crate) fn new(inner: &'a dyn Progress, start: f32, span: f32) -> Self {
        Self { inner, start, span }
    }
}

impl Progress for ScaledProgress<'_> {
    fn report(&self, fraction: f32) {
        self.inner.report(fraction.mul_add(self.span, self.start));
    }
}

/// Progress over a known number of work items
pub(crate) struct ProgressTracker<'a> {
    sink: &'a dyn Progress,
    total: usize,
    done: usize,
}

impl<'a> ProgressTracker<'a> {
    pub(crate) fn new(sink: &'a dyn Progress, total: usize) -> Self {
        sink.report(0.0);
        Self {
            sink,
            total,
            done: 0,
        }
    }

    pub(crate) fn step(&mut self) {
        self.done += 1;
        if self.total > 0 {
            self.sink
                .report((self.done.min(self.total) as f32) / (self.total as f32));
        }
    }

    pub(crate) fn finish(&self) {
        self.sink.report(1.0);
    }
}
