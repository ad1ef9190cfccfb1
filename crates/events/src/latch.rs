use std::sync::{Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Counting latch that lets a test block until handlers have run.
#[derive(Debug, Default)]
pub struct CompletionLatch {
    count: Mutex<usize>,
    changed: Condvar,
}

impl CompletionLatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count_up(&self) {
        let mut count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        *count += 1;
        self.changed.notify_all();
    }

    pub fn count(&self) -> usize {
        *self.count.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until at least `expected` completions were recorded.
    ///
    /// Returns `false` on timeout.
    pub fn wait_for(&self, expected: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        while *count < expected {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            let (guard, _) = self
                .changed
                .wait_timeout(count, remaining)
                .unwrap_or_else(PoisonError::into_inner);
            count = guard;
        }
        true
    }
}
