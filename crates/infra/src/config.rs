//! Queue settings from environment variables.
//!
//! Every key is `<PREFIX>_<NAME>`; unset keys keep the
//! [`PersistentQueueConfig`] defaults.
//!
//! | key                          | field                  |
//! |------------------------------|------------------------|
//! | `_QUEUE_NAME`                | `queue_name`           |
//! | `_TABLE_NAME`                | `table_name`           |
//! | `_HISTORY_TABLE_NAME`        | `history_table_name`   |
//! | `_QUEUE_MODE`                | `mode`                 |
//! | `_MAX_ENTRIES_CLAIMED`       | `max_entries_claimed`  |
//! | `_CLAIM_TIME_MS`             | `claim_time`           |
//! | `_MAX_FAILURE_RETRY`         | `max_failure_retries`  |
//! | `_SLEEP_MS`                  | `polling_sleep_time`   |
//! | `_NB_THREADS`                | `nb_threads`           |
//! | `_OFF`                       | `processing_off`       |
//! | `_INFLIGHT_CACHE`            | `use_inflight_cache`   |
//! | `_REAP_THRESHOLD_MS`         | `reap_threshold`       |
//! | `_REAP_SCHEDULE_MS`          | `reap_schedule`        |
//! | `_MAX_REDISPATCH_COUNT`      | `max_redispatch_count` |
//! | `_OWNER`                     | node identity          |

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use dbq_core::{OwnerId, PersistentQueueConfig, PollingMode, QueueError};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },

    #[error(transparent)]
    Rejected(#[from] QueueError),
}

impl From<ConfigError> for QueueError {
    fn from(value: ConfigError) -> Self {
        match value {
            ConfigError::Rejected(inner) => inner,
            other => QueueError::config(other.to_string()),
        }
    }
}

/// Everything needed to build a queue engine on this node.
#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub config: PersistentQueueConfig,
    pub owner: OwnerId,
    /// `DATABASE_URL`, for callers wiring a Postgres store.
    pub database_url: Option<String>,
}

impl QueueSettings {
    pub fn from_env(prefix: &str) -> Result<Self, ConfigError> {
        Self::from_lookup(prefix, |key| std::env::var(key).ok())
    }

    /// Same as [`QueueSettings::from_env`] with an arbitrary key source.
    pub fn from_lookup<L>(prefix: &str, lookup: L) -> Result<Self, ConfigError>
    where
        L: Fn(&str) -> Option<String>,
    {
        let reader = Reader { prefix, lookup };
        let mut config = PersistentQueueConfig::default();

        if let Some(name) = reader.string("QUEUE_NAME") {
            config.queue_name = name;
        }
        if let Some(table) = reader.string("TABLE_NAME") {
            config.table_name = table;
        }
        if let Some(history) = reader.string("HISTORY_TABLE_NAME") {
            config.history_table_name = history;
        }
        if let Some(mode) = reader.parse::<PollingMode>("QUEUE_MODE")? {
            config.mode = mode;
        }
        if let Some(max) = reader.parse::<usize>("MAX_ENTRIES_CLAIMED")? {
            config.max_entries_claimed = max;
        }
        if let Some(claim_time) = reader.millis("CLAIM_TIME_MS")? {
            config.claim_time = claim_time;
        }
        if let Some(max) = reader.parse::<u32>("MAX_FAILURE_RETRY")? {
            config.max_failure_retries = max;
        }
        if let Some(sleep) = reader.millis("SLEEP_MS")? {
            config.polling_sleep_time = sleep;
        }
        if let Some(threads) = reader.parse::<usize>("NB_THREADS")? {
            config.nb_threads = threads;
        }
        if let Some(off) = reader.flag("OFF")? {
            config.processing_off = off;
        }
        if let Some(enabled) = reader.flag("INFLIGHT_CACHE")? {
            config.use_inflight_cache = enabled;
        }
        if let Some(threshold) = reader.millis("REAP_THRESHOLD_MS")? {
            config.reap_threshold = threshold;
        }
        if let Some(schedule) = reader.millis("REAP_SCHEDULE_MS")? {
            config.reap_schedule = schedule;
        }
        if let Some(max) = reader.parse::<u32>("MAX_REDISPATCH_COUNT")? {
            config.max_redispatch_count = max;
        }

        let owner = match reader.string("OWNER") {
            Some(owner) => OwnerId::new(owner)?,
            None => OwnerId::generate(),
        };

        config.validate()?;

        Ok(Self {
            config,
            owner,
            database_url: (reader.lookup)("DATABASE_URL").filter(|url| !url.trim().is_empty()),
        })
    }
}

struct Reader<'p, L> {
    prefix: &'p str,
    lookup: L,
}

impl<L> Reader<'_, L>
where
    L: Fn(&str) -> Option<String>,
{
    fn key(&self, name: &str) -> String {
        format!("{}_{name}", self.prefix)
    }

    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(&self.key(name))
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, name: &str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        let Some(raw) = self.string(name) else {
            return Ok(None);
        };
        raw.parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue {
                key: self.key(name),
                value: raw.clone(),
                reason: e.to_string(),
            })
    }

    fn millis(&self, name: &str) -> Result<Option<Duration>, ConfigError> {
        Ok(self.parse::<u64>(name)?.map(Duration::from_millis))
    }

    fn flag(&self, name: &str) -> Result<Option<bool>, ConfigError> {
        let Some(raw) = self.string(name) else {
            return Ok(None);
        };
        match raw.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(Some(true)),
            "false" | "0" | "no" | "off" => Ok(Some(false)),
            _ => Err(ConfigError::InvalidValue {
                key: self.key(name),
                value: raw,
                reason: "expected a boolean".to_string(),
            }),
        }
    }
}
