//! In-memory entry store for tests and local development.
//!
//! Each transaction works on a private copy of the tables that replaces the
//! shared state only on commit, so a failed transaction leaves nothing
//! behind. Transactions are serialized by the store mutex, which stands in
//! for the database's row locks.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};

use dbq_core::{OwnerId, ProcessingState, QueueEntry, RecordId};

use super::r#trait::{EntryStore, EntryTransaction, StoreError, StoreResult};

/// Store statements that can be made to fail on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOperation {
    InsertEntry,
    InsertHistory,
    ClaimEntry,
    ClaimEntries,
    ReadyEntries,
    LeftBehind,
    UpdateOnError,
    RemoveEntries,
}

impl StoreOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreOperation::InsertEntry => "insert_entry",
            StoreOperation::InsertHistory => "insert_history",
            StoreOperation::ClaimEntry => "claim_entry",
            StoreOperation::ClaimEntries => "claim_entries",
            StoreOperation::ReadyEntries => "ready_entries",
            StoreOperation::LeftBehind => "entries_left_behind",
            StoreOperation::UpdateOnError => "update_on_error",
            StoreOperation::RemoveEntries => "remove_entries",
        }
    }
}

#[derive(Debug, Clone, Default)]
struct Tables {
    last_id: i64,
    tables: HashMap<String, BTreeMap<RecordId, QueueEntry>>,
}

/// In-memory entry store with failure injection.
#[derive(Debug, Default)]
pub struct InMemoryEntryStore {
    state: Mutex<Tables>,
    failures: Mutex<Vec<StoreOperation>>,
}

impl InMemoryEntryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Make the next `operation` fail, rolling back its transaction.
    pub fn fail_next(&self, operation: StoreOperation) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(operation);
    }

    /// Committed rows of `table`, lowest ids first.
    pub fn rows(&self, table: &str) -> Vec<QueueEntry> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state
            .tables
            .get(table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn row(&self, table: &str, record_id: RecordId) -> Option<QueueEntry> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state
            .tables
            .get(table)
            .and_then(|rows| rows.get(&record_id))
            .cloned()
    }

    pub fn len(&self, table: &str) -> usize {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.tables.get(table).map_or(0, BTreeMap::len)
    }
}

impl EntryStore for InMemoryEntryStore {
    fn in_transaction<R, F>(&self, f: F) -> StoreResult<R>
    where
        F: FnOnce(&mut dyn EntryTransaction) -> StoreResult<R>,
    {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let mut working = state.clone();
        let result = {
            let mut tx = InMemoryTransaction {
                tables: &mut working,
                failures: &self.failures,
            };
            let tx: &mut dyn EntryTransaction = &mut tx;
            f(tx)?
        };
        *state = working;
        Ok(result)
    }
}

struct InMemoryTransaction<'a> {
    tables: &'a mut Tables,
    failures: &'a Mutex<Vec<StoreOperation>>,
}

impl InMemoryTransaction<'_> {
    fn check(&self, operation: StoreOperation) -> StoreResult<()> {
        let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(pos) = failures.iter().position(|op| *op == operation) {
            failures.remove(pos);
            return Err(StoreError::Injected(operation.as_str()));
        }
        Ok(())
    }

    fn table_mut(&mut self, table: &str) -> &mut BTreeMap<RecordId, QueueEntry> {
        self.tables.tables.entry(table.to_string()).or_default()
    }

    fn select<P>(&self, table: &str, limit: usize, predicate: P) -> Vec<QueueEntry>
    where
        P: Fn(&QueueEntry) -> bool,
    {
        self.tables
            .tables
            .get(table)
            .map(|rows| {
                rows.values()
                    .filter(|e| predicate(e))
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl EntryTransaction for InMemoryTransaction<'_> {
    fn insert_entry(&mut self, entry: &QueueEntry, table: &str) -> StoreResult<RecordId> {
        self.check(StoreOperation::InsertEntry)?;
        self.tables.last_id += 1;
        let record_id = RecordId::new(self.tables.last_id);
        let mut row = entry.clone();
        row.record_id = record_id;
        self.table_mut(table).insert(record_id, row);
        Ok(record_id)
    }

    fn insert_history(&mut self, entries: &[QueueEntry], history_table: &str) -> StoreResult<u64> {
        self.check(StoreOperation::InsertHistory)?;
        let history = self.table_mut(history_table);
        let mut written = 0;
        for entry in entries {
            if history.contains_key(&entry.record_id) {
                continue;
            }
            history.insert(entry.record_id, entry.clone());
            written += 1;
        }
        Ok(written)
    }

    fn claim_entry(
        &mut self,
        record_id: RecordId,
        owner: &OwnerId,
        claim_expiry: DateTime<Utc>,
        table: &str,
    ) -> StoreResult<u64> {
        self.check(StoreOperation::ClaimEntry)?;
        match self.table_mut(table).get_mut(&record_id) {
            Some(row)
                if row.processing_state == ProcessingState::Available
                    && row.processing_owner.is_none() =>
            {
                row.mark_claimed(owner, claim_expiry);
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    fn claim_entries(
        &mut self,
        owner: &OwnerId,
        now: DateTime<Utc>,
        claim_expiry: DateTime<Utc>,
        limit: usize,
        table: &str,
    ) -> StoreResult<Vec<RecordId>> {
        self.check(StoreOperation::ClaimEntries)?;
        let mut claimed = Vec::new();
        for row in self.table_mut(table).values_mut() {
            if claimed.len() >= limit {
                break;
            }
            if row.is_ready(now) {
                row.mark_claimed(owner, claim_expiry);
                claimed.push(row.record_id);
            }
        }
        Ok(claimed)
    }

    fn ready_entries(
        &mut self,
        now: DateTime<Utc>,
        owner: Option<&OwnerId>,
        limit: usize,
        table: &str,
    ) -> StoreResult<Vec<QueueEntry>> {
        self.check(StoreOperation::ReadyEntries)?;
        Ok(match owner {
            None => self.select(table, limit, |e| e.is_ready(now)),
            Some(owner) => self.select(table, limit, |e| {
                e.processing_state == ProcessingState::InProcessing
                    && e.processing_owner.as_ref() == Some(owner)
            }),
        })
    }

    fn entries_by_ids(&mut self, ids: &[RecordId], table: &str) -> StoreResult<Vec<QueueEntry>> {
        Ok(self.select(table, usize::MAX, |e| ids.contains(&e.record_id)))
    }

    fn entry(&mut self, record_id: RecordId, table: &str) -> StoreResult<Option<QueueEntry>> {
        Ok(self
            .tables
            .tables
            .get(table)
            .and_then(|rows| rows.get(&record_id))
            .cloned())
    }

    fn entries_left_behind(
        &mut self,
        cutoff: DateTime<Utc>,
        owner: &OwnerId,
        max_redispatch_count: u32,
        limit: usize,
        table: &str,
    ) -> StoreResult<Vec<QueueEntry>> {
        self.check(StoreOperation::LeftBehind)?;
        Ok(self.select(table, limit, |e| {
            let expired = e.is_claim_expired(cutoff) && e.processing_owner.as_ref() != Some(owner);
            let waiting = e.is_ready(cutoff) && &e.creating_owner != owner;
            (expired || waiting) && e.error_count < max_redispatch_count
        }))
    }

    fn own_entries_left_behind(
        &mut self,
        cutoff: DateTime<Utc>,
        owner: &OwnerId,
        limit: usize,
        table: &str,
    ) -> StoreResult<Vec<QueueEntry>> {
        Ok(self.select(table, limit, |e| {
            (e.is_claim_expired(cutoff) && e.processing_owner.as_ref() == Some(owner))
                || (e.is_ready(cutoff) && &e.creating_owner == owner)
        }))
    }

    fn update_on_error(
        &mut self,
        record_id: RecordId,
        error_count: u32,
        effective_date: DateTime<Utc>,
        table: &str,
    ) -> StoreResult<u64> {
        self.check(StoreOperation::UpdateOnError)?;
        match self.table_mut(table).get_mut(&record_id) {
            Some(row) => {
                row.rearm(error_count, effective_date);
                Ok(1)
            }
            None => Ok(0),
        }
    }

    fn remove_entries(&mut self, ids: &[RecordId], table: &str) -> StoreResult<Vec<RecordId>> {
        self.check(StoreOperation::RemoveEntries)?;
        let rows = self.table_mut(table);
        Ok(ids
            .iter()
            .filter(|id| rows.remove(id).is_some())
            .copied()
            .collect())
    }

    fn count_ready(&mut self, now: DateTime<Utc>, table: &str) -> StoreResult<u64> {
        Ok(self.select(table, usize::MAX, |e| e.is_ready(now)).len() as u64)
    }

    fn entries_for_search_keys(
        &mut self,
        search_key1: Option<i64>,
        search_key2: Option<i64>,
        table: &str,
    ) -> StoreResult<Vec<QueueEntry>> {
        Ok(self.select(table, usize::MAX, |e| {
            search_key1.is_none_or(|k| e.search_key1 == Some(k))
                && search_key2.is_none_or(|k| e.search_key2 == Some(k))
        }))
    }

    fn in_processing_entries(&mut self, table: &str) -> StoreResult<Vec<QueueEntry>> {
        Ok(self.select(table, usize::MAX, |e| {
            e.processing_state == ProcessingState::InProcessing
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    const ACTIVE: &str = "bus_events";
    const HISTORY: &str = "bus_events_history";

    fn owner(name: &str) -> OwnerId {
        OwnerId::new(name).unwrap()
    }

    fn entry(now: DateTime<Utc>) -> QueueEntry {
        QueueEntry::new("bus", "Ping", "{}", owner("producer"), now)
    }

    #[test]
    fn generated_ids_are_monotonic() {
        let store = InMemoryEntryStore::new();
        let now = Utc::now();

        let ids = store
            .in_transaction(|tx| tx.insert_entries(&[entry(now), entry(now), entry(now)], ACTIVE))
            .unwrap();

        assert_eq!(ids, vec![RecordId::new(1), RecordId::new(2), RecordId::new(3)]);
        assert_eq!(store.len(ACTIVE), 3);
    }

    #[test]
    fn failed_transaction_rolls_back_every_statement() {
        let store = InMemoryEntryStore::new();
        let now = Utc::now();

        let result = store.in_transaction(|tx| {
            tx.insert_entry(&entry(now), ACTIVE)?;
            Err::<(), _>(StoreError::Injected("test"))
        });

        assert!(result.is_err());
        assert_eq!(store.len(ACTIVE), 0);
    }

    #[test]
    fn injected_failure_fires_once() {
        let store = InMemoryEntryStore::new();
        store.fail_next(StoreOperation::InsertEntry);
        let now = Utc::now();

        let first = store.in_transaction(|tx| tx.insert_entry(&entry(now), ACTIVE));
        let second = store.in_transaction(|tx| tx.insert_entry(&entry(now), ACTIVE));

        assert_eq!(first, Err(StoreError::Injected("insert_entry")));
        assert!(second.is_ok());
    }

    #[test]
    fn claim_is_conditional_on_availability() {
        let store = InMemoryEntryStore::new();
        let now = Utc::now();
        let id = store.in_transaction(|tx| tx.insert_entry(&entry(now), ACTIVE)).unwrap();
        let expiry = now + Duration::minutes(5);

        let first = store
            .in_transaction(|tx| tx.claim_entry(id, &owner("a"), expiry, ACTIVE))
            .unwrap();
        let second = store
            .in_transaction(|tx| tx.claim_entry(id, &owner("b"), expiry, ACTIVE))
            .unwrap();

        assert_eq!((first, second), (1, 0));
        assert_eq!(store.row(ACTIVE, id).unwrap().processing_owner, Some(owner("a")));
    }

    #[test]
    fn batch_claim_takes_lowest_due_ids() {
        let store = InMemoryEntryStore::new();
        let now = Utc::now();
        store
            .in_transaction(|tx| {
                tx.insert_entry(&entry(now), ACTIVE)?;
                tx.insert_entry(&entry(now).with_effective_date(now + Duration::hours(1)), ACTIVE)?;
                tx.insert_entry(&entry(now), ACTIVE)?;
                tx.insert_entry(&entry(now), ACTIVE)
            })
            .unwrap();

        let claimed = store
            .in_transaction(|tx| {
                tx.claim_entries(&owner("a"), now, now + Duration::minutes(5), 2, ACTIVE)
            })
            .unwrap();

        assert_eq!(claimed, vec![RecordId::new(1), RecordId::new(3)]);
    }

    #[test]
    fn history_ignores_duplicate_ids() {
        let store = InMemoryEntryStore::new();
        let mut resolved = entry(Utc::now()).resolved(ProcessingState::Processed);
        resolved.record_id = RecordId::new(9);

        let first = store
            .in_transaction(|tx| tx.insert_history(std::slice::from_ref(&resolved), HISTORY))
            .unwrap();
        let second = store
            .in_transaction(|tx| tx.insert_history(std::slice::from_ref(&resolved), HISTORY))
            .unwrap();

        assert_eq!((first, second), (1, 0));
        assert_eq!(store.len(HISTORY), 1);
    }

    #[test]
    fn remove_reports_only_existing_ids() {
        let store = InMemoryEntryStore::new();
        let id = store
            .in_transaction(|tx| tx.insert_entry(&entry(Utc::now()), ACTIVE))
            .unwrap();

        let removed = store
            .in_transaction(|tx| tx.remove_entries(&[id, RecordId::new(99)], ACTIVE))
            .unwrap();

        assert_eq!(removed, vec![id]);
    }
}
