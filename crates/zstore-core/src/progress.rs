//! # Progress and Cancellation
//!
//! Long-running store operations (hashing, copying, auditing) receive a
//! [`ProgressSink`] explicitly. They report work as they go and check for
//! cancellation between file-level units of work.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::StoreError;

/// Receives progress reports and answers whether the caller wants to stop.
pub trait ProgressSink: Send + Sync {
    /// `done` out of `total` units (bytes or items, depending on `task`) are complete.
    /// `total` is `None` when the amount of work is unknown.
    fn report(&self, task: &str, done: u64, total: Option<u64>);

    /// `true` once the caller has asked for the operation to stop.
    fn is_cancelled(&self) -> bool {
        false
    }
}

/// Return [`StoreError::Cancelled`] if `progress` has been cancelled.
pub fn check_cancelled(progress: &dyn ProgressSink) -> Result<(), StoreError> {
    if progress.is_cancelled() {
        Err(StoreError::Cancelled)
    } else {
        Ok(())
    }
}

/// Discards reports and never cancels.
#[derive(Debug, Clone, Copy, Default)]
pub struct SilentProgress;

impl ProgressSink for SilentProgress {
    fn report(&self, _task: &str, _done: u64, _total: Option<u64>) {}
}

/// Forwards reports to `tracing` at debug level.
#[derive(Debug, Clone, Default)]
pub struct LogProgress {
    cancel: CancelToken,
}

impl LogProgress {
    /// A logging sink that observes `cancel`.
    pub fn with_cancel(cancel: CancelToken) -> Self {
        Self { cancel }
    }
}

impl ProgressSink for LogProgress {
    fn report(&self, task: &str, done: u64, total: Option<u64>) {
        match total {
            Some(total) => tracing::debug!(task, done, total, "progress"),
            None => tracing::debug!(task, done, "progress"),
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// A shared cancellation flag. Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// A fresh, uncancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// `true` once [`CancelToken::cancel`] has been called on any clone.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

impl ProgressSink for CancelToken {
    fn report(&self, _task: &str, _done: u64, _total: Option<u64>) {}

    fn is_cancelled(&self) -> bool {
        CancelToken::is_cancelled(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silent_progress_never_cancels() {
        assert!(check_cancelled(&SilentProgress).is_ok());
    }

    #[test]
    fn cancel_token_is_shared_between_clones() {
        let token = CancelToken::new();
        let observer = LogProgress::with_cancel(token.clone());
        assert!(check_cancelled(&observer).is_ok());
        token.cancel();
        assert!(matches!(check_cancelled(&observer), Err(StoreError::Cancelled)));
        assert!(matches!(check_cancelled(&token), Err(StoreError::Cancelled)));
    }
}
