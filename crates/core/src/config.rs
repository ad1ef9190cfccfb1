//! Queue configuration.

use core::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{QueueError, QueueResult};
use crate::retry::RetryPolicy;

/// How the engine claims work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PollingMode {
    /// Select candidates, then claim each with its own conditional update.
    Polling,
    /// Claim a whole batch in one statement and keep it until resolved.
    #[default]
    StickyPolling,
}

impl PollingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PollingMode::Polling => "POLLING",
            PollingMode::StickyPolling => "STICKY_POLLING",
        }
    }

    pub fn is_sticky(&self) -> bool {
        matches!(self, PollingMode::StickyPolling)
    }
}

impl core::fmt::Display for PollingMode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PollingMode {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "POLLING" => Ok(PollingMode::Polling),
            "STICKY_POLLING" => Ok(PollingMode::StickyPolling),
            other => Err(QueueError::config(format!("unknown queue mode: {other}"))),
        }
    }
}

/// Configuration of one persistent queue.
///
/// Immutable once handed to an engine; [`PersistentQueueConfig::validate`] runs
/// at engine construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistentQueueConfig {
    /// Name handlers are registered under.
    pub queue_name: String,
    pub table_name: String,
    pub history_table_name: String,
    pub mode: PollingMode,
    /// Claim batch size; also bounds a single reaper pass.
    pub max_entries_claimed: usize,
    /// Claim lease length.
    pub claim_time: Duration,
    /// Idle sleep between polls.
    pub polling_sleep_time: Duration,
    pub max_failure_retries: u32,
    /// Dispatch threads per process.
    pub nb_threads: usize,
    /// Disable dispatching entirely (producers may still insert).
    pub processing_off: bool,
    pub use_inflight_cache: bool,
    /// How long past its lease an entry must be before the reaper looks at it.
    pub reap_threshold: Duration,
    pub reap_schedule: Duration,
    /// Orphans that already reached this count are failed instead of re-dispatched.
    pub max_redispatch_count: u32,
    pub retry_policy: RetryPolicy,
}

impl Default for PersistentQueueConfig {
    fn default() -> Self {
        Self {
            queue_name: "main".to_string(),
            table_name: "bus_events".to_string(),
            history_table_name: "bus_events_history".to_string(),
            mode: PollingMode::StickyPolling,
            max_entries_claimed: 1000,
            claim_time: Duration::from_secs(5 * 60),
            polling_sleep_time: Duration::from_millis(1000),
            max_failure_retries: 3,
            nb_threads: 1,
            processing_off: false,
            use_inflight_cache: true,
            reap_threshold: Duration::from_secs(10 * 60),
            reap_schedule: Duration::from_secs(3 * 60),
            max_redispatch_count: 10,
            retry_policy: RetryPolicy::default(),
        }
    }
}

impl PersistentQueueConfig {
    pub fn with_queue_name(mut self, name: impl Into<String>) -> Self {
        self.queue_name = name.into();
        self
    }

    pub fn with_tables(mut self, table: impl Into<String>, history: impl Into<String>) -> Self {
        self.table_name = table.into();
        self.history_table_name = history.into();
        self
    }

    pub fn with_mode(mut self, mode: PollingMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_max_entries_claimed(mut self, max: usize) -> Self {
        self.max_entries_claimed = max;
        self
    }

    pub fn with_claim_time(mut self, claim_time: Duration) -> Self {
        self.claim_time = claim_time;
        self
    }

    pub fn with_polling_sleep_time(mut self, sleep: Duration) -> Self {
        self.polling_sleep_time = sleep;
        self
    }

    pub fn with_max_failure_retries(mut self, max: u32) -> Self {
        self.max_failure_retries = max;
        self
    }

    pub fn with_nb_threads(mut self, threads: usize) -> Self {
        self.nb_threads = threads;
        self
    }

    pub fn with_processing_off(mut self, off: bool) -> Self {
        self.processing_off = off;
        self
    }

    pub fn with_inflight_cache(mut self, enabled: bool) -> Self {
        self.use_inflight_cache = enabled;
        self
    }

    pub fn with_reaping(mut self, threshold: Duration, schedule: Duration) -> Self {
        self.reap_threshold = threshold;
        self.reap_schedule = schedule;
        self
    }

    pub fn with_max_redispatch_count(mut self, max: u32) -> Self {
        self.max_redispatch_count = max;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Idle sleep for the dispatch loop; sticky mode polls four times as often.
    pub fn idle_sleep(&self) -> Duration {
        if self.mode.is_sticky() {
            self.polling_sleep_time / 4
        } else {
            self.polling_sleep_time
        }
    }

    pub fn validate(&self) -> QueueResult<()> {
        if self.queue_name.trim().is_empty() {
            return Err(QueueError::config("queue_name must not be empty"));
        }
        validate_table_name("table_name", &self.table_name)?;
        validate_table_name("history_table_name", &self.history_table_name)?;
        if self.table_name == self.history_table_name {
            return Err(QueueError::config(
                "table_name and history_table_name must differ",
            ));
        }
        if self.max_entries_claimed == 0 {
            return Err(QueueError::config("max_entries_claimed must be positive"));
        }
        if self.claim_time.is_zero() {
            return Err(QueueError::config("claim_time must be positive"));
        }
        if self.polling_sleep_time.is_zero() {
            return Err(QueueError::config("polling_sleep_time must be positive"));
        }
        if self.nb_threads == 0 {
            return Err(QueueError::config("nb_threads must be positive"));
        }
        if self.reap_schedule.is_zero() {
            return Err(QueueError::config("reap_schedule must be positive"));
        }
        Ok(())
    }
}

// Table names are interpolated into SQL, so only plain identifiers are accepted.
fn validate_table_name(field: &str, name: &str) -> QueueResult<()> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if !valid_start || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.') {
        return Err(QueueError::config(format!(
            "{field} is not a valid identifier: {name:?}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_deployment_values() {
        let config = PersistentQueueConfig::default();
        assert_eq!(config.mode, PollingMode::StickyPolling);
        assert_eq!(config.max_entries_claimed, 1000);
        assert_eq!(config.claim_time, Duration::from_secs(300));
        assert_eq!(config.max_failure_retries, 3);
        assert_eq!(config.polling_sleep_time, Duration::from_millis(1000));
        assert_eq!(config.nb_threads, 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_unsafe_table_names() {
        let config = PersistentQueueConfig::default().with_tables("events; drop table x", "h");
        assert!(matches!(config.validate(), Err(QueueError::Config(_))));

        let config = PersistentQueueConfig::default().with_tables("", "h");
        assert!(config.validate().is_err());

        let config = PersistentQueueConfig::default().with_tables("queue.events", "queue.history");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_same_table_for_history() {
        let config = PersistentQueueConfig::default().with_tables("events", "events");
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_batch_and_windows() {
        assert!(PersistentQueueConfig::default().with_max_entries_claimed(0).validate().is_err());
        assert!(PersistentQueueConfig::default().with_claim_time(Duration::ZERO).validate().is_err());
        assert!(PersistentQueueConfig::default().with_nb_threads(0).validate().is_err());
    }

    #[test]
    fn sticky_mode_polls_more_often() {
        let sticky = PersistentQueueConfig::default().with_polling_sleep_time(Duration::from_millis(400));
        let plain = sticky.clone().with_mode(PollingMode::Polling);
        assert_eq!(sticky.idle_sleep(), Duration::from_millis(100));
        assert_eq!(plain.idle_sleep(), Duration::from_millis(400));
    }

    #[test]
    fn mode_parses_case_insensitively() {
        assert_eq!("sticky_polling".parse::<PollingMode>().unwrap(), PollingMode::StickyPolling);
        assert_eq!("POLLING".parse::<PollingMode>().unwrap(), PollingMode::Polling);
        assert!("batch".parse::<PollingMode>().is_err());
    }
}
