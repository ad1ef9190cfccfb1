use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

/// Lock-free accumulator for one kind of store round-trip.
#[derive(Debug, Default)]
pub struct RawTimer {
    count: AtomicU64,
    total_micros: AtomicU64,
    max_micros: AtomicU64,
}

impl RawTimer {
    pub fn record(&self, elapsed: Duration) {
        let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_micros.fetch_add(micros, Ordering::Relaxed);
        self.max_micros.fetch_max(micros, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TimerSnapshot {
        TimerSnapshot {
            count: self.count.load(Ordering::Relaxed),
            total_micros: self.total_micros.load(Ordering::Relaxed),
            max_micros: self.max_micros.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TimerSnapshot {
    pub count: u64,
    pub total_micros: u64,
    pub max_micros: u64,
}

impl TimerSnapshot {
    pub fn mean(&self) -> Duration {
        if self.count == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(self.total_micros / self.count)
    }
}

/// Raw store timings kept per engine.
#[derive(Debug, Default)]
pub struct QueueTimers {
    pub get_entries: RawTimer,
    pub insert_entry: RawTimer,
    pub claim_entries: RawTimer,
    pub claim_entry: RawTimer,
    pub delete_entries: RawTimer,
    pub delete_entry: RawTimer,
}

impl QueueTimers {
    pub fn snapshot(&self) -> QueueTimersSnapshot {
        QueueTimersSnapshot {
            get_entries: self.get_entries.snapshot(),
            insert_entry: self.insert_entry.snapshot(),
            claim_entries: self.claim_entries.snapshot(),
            claim_entry: self.claim_entry.snapshot(),
            delete_entries: self.delete_entries.snapshot(),
            delete_entry: self.delete_entry.snapshot(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueTimersSnapshot {
    pub get_entries: TimerSnapshot,
    pub insert_entry: TimerSnapshot,
    pub claim_entries: TimerSnapshot,
    pub claim_entry: TimerSnapshot,
    pub delete_entries: TimerSnapshot,
    pub delete_entry: TimerSnapshot,
}
