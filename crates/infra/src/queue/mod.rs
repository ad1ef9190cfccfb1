//! The queue engine: claiming, resolution, retries and reaping.

pub mod engine;
pub mod inflight;
pub mod metrics;

pub use engine::{DbBackedQueue, ErrorOutcome, ReadyEntries, ReapOutcome};
pub use inflight::InflightCache;
pub use metrics::{QueueTimers, QueueTimersSnapshot, RawTimer, TimerSnapshot};
