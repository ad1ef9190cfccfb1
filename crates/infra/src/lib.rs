//! Infrastructure layer: entry stores, the queue engine and its workers.
//!
//! - `store`: transactional access to the active and history tables
//! - `queue`: claiming, history migration, retries, reaping
//! - `service` / `workers` / `reaper`: the threads that drive a queue
//! - `bus` / `notification`: producer and consumer facades

pub mod bus;
pub mod config;
pub mod notification;
pub mod queue;
pub mod reaper;
pub mod service;
pub mod store;
pub mod workers;

pub use bus::{EventWithMetadata, PersistentBus};
pub use config::{ConfigError, QueueSettings};
pub use notification::{NotificationQueue, NotificationQueueService};
pub use queue::{DbBackedQueue, ErrorOutcome, ReadyEntries, ReapOutcome};
pub use reaper::{LeftBehind, Reaper};
pub use service::{QueueContext, QueueService, QueueServiceHandle, ServiceStatsSnapshot};
pub use store::{EntryStore, EntryTransaction, InMemoryEntryStore, PostgresEntryStore};

#[cfg(test)]
mod integration_tests;
