use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;

use dbq_core::{OwnerId, QueueEntry, QueueError, RecordId};

pub type StoreResult<T> = Result<T, StoreError>;

/// Entry store failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("database error in {operation}: {message}")]
    Database {
        operation: &'static str,
        message: String,
    },

    #[error("connection pool closed in {0}")]
    PoolClosed(&'static str),

    #[error("invalid row in {operation}: {message}")]
    InvalidRow {
        operation: &'static str,
        message: String,
    },

    #[error("no async runtime available: {0}")]
    Runtime(String),

    /// Raised by the in-memory store's failure injection.
    #[error("injected failure in {0}")]
    Injected(&'static str),
}

impl From<StoreError> for QueueError {
    fn from(value: StoreError) -> Self {
        QueueError::store(value.to_string())
    }
}

/// Statements the engine issues against the entry tables.
///
/// Every method runs inside one open transaction; nothing is visible to other
/// transactions until the surrounding [`EntryStore::in_transaction`] (or the
/// caller owning the wrapped transaction) commits.
///
/// Active-table rows are keyed by a store-generated id. History rows keep the
/// id of the active row they came from.
pub trait EntryTransaction {
    /// Insert an active row and return its generated id.
    fn insert_entry(&mut self, entry: &QueueEntry, table: &str) -> StoreResult<RecordId>;

    /// Insert active rows in order; ids are returned in the same order.
    fn insert_entries(&mut self, entries: &[QueueEntry], table: &str) -> StoreResult<Vec<RecordId>> {
        entries
            .iter()
            .map(|entry| self.insert_entry(entry, table))
            .collect()
    }

    /// Copy resolved entries into history. Ids already present are skipped;
    /// returns how many rows were written.
    fn insert_history(&mut self, entries: &[QueueEntry], history_table: &str) -> StoreResult<u64>;

    /// Conditional single-row claim. Affects the row only while it is
    /// `AVAILABLE` with no owner; returns rows affected (0 or 1).
    fn claim_entry(
        &mut self,
        record_id: RecordId,
        owner: &OwnerId,
        claim_expiry: DateTime<Utc>,
        table: &str,
    ) -> StoreResult<u64>;

    /// Claim up to `limit` ready rows in one statement, lowest ids first.
    fn claim_entries(
        &mut self,
        owner: &OwnerId,
        now: DateTime<Utc>,
        claim_expiry: DateTime<Utc>,
        limit: usize,
        table: &str,
    ) -> StoreResult<Vec<RecordId>>;

    /// With no owner: unclaimed `AVAILABLE` rows due at `now`.
    /// With an owner: `IN_PROCESSING` rows held by that owner.
    fn ready_entries(
        &mut self,
        now: DateTime<Utc>,
        owner: Option<&OwnerId>,
        limit: usize,
        table: &str,
    ) -> StoreResult<Vec<QueueEntry>>;

    fn entries_by_ids(&mut self, ids: &[RecordId], table: &str) -> StoreResult<Vec<QueueEntry>>;

    fn entry(&mut self, record_id: RecordId, table: &str) -> StoreResult<Option<QueueEntry>>;

    /// Rows another node left behind by `cutoff`: claims it holds that expired,
    /// and unclaimed rows it created that are still waiting. Rows whose
    /// `error_count` reached `max_redispatch_count` are skipped.
    fn entries_left_behind(
        &mut self,
        cutoff: DateTime<Utc>,
        owner: &OwnerId,
        max_redispatch_count: u32,
        limit: usize,
        table: &str,
    ) -> StoreResult<Vec<QueueEntry>>;

    /// The same rows when `owner` itself is behind: its expired claims and
    /// its own unclaimed backlog.
    fn own_entries_left_behind(
        &mut self,
        cutoff: DateTime<Utc>,
        owner: &OwnerId,
        limit: usize,
        table: &str,
    ) -> StoreResult<Vec<QueueEntry>>;

    /// Re-arm a row: back to `AVAILABLE`, owner and claim cleared.
    fn update_on_error(
        &mut self,
        record_id: RecordId,
        error_count: u32,
        effective_date: DateTime<Utc>,
        table: &str,
    ) -> StoreResult<u64>;

    /// Delete rows and return the ids that actually existed.
    fn remove_entries(&mut self, ids: &[RecordId], table: &str) -> StoreResult<Vec<RecordId>>;

    fn count_ready(&mut self, now: DateTime<Utc>, table: &str) -> StoreResult<u64>;

    /// Rows of one partition in `table`, lowest ids first. `None` keys match
    /// anything.
    fn entries_for_search_keys(
        &mut self,
        search_key1: Option<i64>,
        search_key2: Option<i64>,
        table: &str,
    ) -> StoreResult<Vec<QueueEntry>>;

    fn in_processing_entries(&mut self, table: &str) -> StoreResult<Vec<QueueEntry>>;
}

/// Transactional access to the entry tables.
pub trait EntryStore: Send + Sync {
    /// Run `f` in a fresh transaction, committed iff `f` returns `Ok`.
    fn in_transaction<R, F>(&self, f: F) -> StoreResult<R>
    where
        F: FnOnce(&mut dyn EntryTransaction) -> StoreResult<R>;
}

impl<S> EntryStore for Arc<S>
where
    S: EntryStore,
{
    fn in_transaction<R, F>(&self, f: F) -> StoreResult<R>
    where
        F: FnOnce(&mut dyn EntryTransaction) -> StoreResult<R>,
    {
        (**self).in_transaction(f)
    }
}
