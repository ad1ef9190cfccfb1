//! `dbq-core`: queue model shared by every layer.
//!
//! Entries, identifiers, configuration, retry backoff and the clock. No
//! storage or threading concerns live here.

pub mod clock;
pub mod config;
pub mod entry;
pub mod error;
pub mod id;
pub mod retry;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{PersistentQueueConfig, PollingMode};
pub use entry::{ProcessingState, QueueEntry};
pub use error::{QueueError, QueueResult};
pub use id::{OwnerId, RecordId, UserToken};
pub use retry::{Backoff, BackoffStrategy, RetryPolicy};
