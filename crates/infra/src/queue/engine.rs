//! Database-backed queue engine.

use std::slice;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use dbq_core::clock::span;
use dbq_core::{
    Backoff, Clock, OwnerId, PersistentQueueConfig, PollingMode, ProcessingState, QueueEntry,
    QueueResult, RecordId,
};

use super::inflight::InflightCache;
use super::metrics::QueueTimers;
use crate::reaper::LeftBehind;
use crate::store::{EntryStore, EntryTransaction, StoreResult};

/// Entries claimed by one poll.
#[derive(Debug, Clone, Default)]
pub struct ReadyEntries {
    pub entries: Vec<QueueEntry>,
    /// Time spent in the store for this poll.
    pub elapsed: Duration,
}

impl ReadyEntries {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// What `update_on_error` did with a failed entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorOutcome {
    /// Back to `AVAILABLE`, eligible again at `effective_date`.
    Rearmed {
        error_count: u32,
        effective_date: DateTime<Utc>,
    },
    /// Out of retries; moved to history as `FAILED`.
    Failed { error_count: u32 },
    /// The row was no longer active (already resolved or reaped).
    Vanished,
}

/// Result of one reaper pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReapOutcome {
    /// Ids moved to history as `REAPED`.
    pub reaped: Vec<RecordId>,
    /// Ids of the replacement rows, in the same order as `reaped`.
    pub redispatched: Vec<RecordId>,
    /// Expired claims held by this node.
    pub stuck: Vec<RecordId>,
    /// Unclaimed backlog created by this node.
    pub late: Vec<RecordId>,
}

impl ReapOutcome {
    pub fn is_empty(&self) -> bool {
        self.reaped.is_empty() && self.stuck.is_empty() && self.late.is_empty()
    }
}

/// A persistent queue over one active/history table pair.
///
/// Holds no state between calls apart from the inflight cache; every claim is
/// decided by a conditional update in the store, so any number of engines (in
/// this process or others) can share the same tables.
pub struct DbBackedQueue<S> {
    store: S,
    config: PersistentQueueConfig,
    owner: OwnerId,
    clock: Arc<dyn Clock>,
    backoff: Arc<dyn Backoff>,
    inflight: InflightCache,
    timers: QueueTimers,
}

impl<S: EntryStore> DbBackedQueue<S> {
    pub fn new(
        store: S,
        config: PersistentQueueConfig,
        owner: OwnerId,
        clock: Arc<dyn Clock>,
    ) -> QueueResult<Self> {
        config.validate()?;
        let backoff: Arc<dyn Backoff> = Arc::new(config.retry_policy.clone());
        let inflight = InflightCache::new(config.use_inflight_cache);
        Ok(Self {
            store,
            config,
            owner,
            clock,
            backoff,
            inflight,
            timers: QueueTimers::default(),
        })
    }

    /// Replace the configured retry policy.
    pub fn with_backoff(mut self, backoff: Arc<dyn Backoff>) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn config(&self) -> &PersistentQueueConfig {
        &self.config
    }

    pub fn owner(&self) -> &OwnerId {
        &self.owner
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn timers(&self) -> &QueueTimers {
        &self.timers
    }

    pub fn inflight(&self) -> &InflightCache {
        &self.inflight
    }

    pub fn initialize(&self) {
        self.inflight.clear();
        info!(
            queue = %self.config.queue_name,
            table = %self.config.table_name,
            mode = %self.config.mode,
            owner = %self.owner,
            "queue initialized"
        );
    }

    pub fn close(&self) {
        self.inflight.clear();
        info!(queue = %self.config.queue_name, owner = %self.owner, "queue closed");
    }

    // ----- insertion -----

    pub fn insert_entry(&self, entry: &QueueEntry) -> QueueResult<RecordId> {
        Ok(self
            .store
            .in_transaction(|tx| self.insert_entry_from_transaction(tx, entry))?)
    }

    /// All entries commit together, or none does.
    pub fn insert_entries(&self, entries: &[QueueEntry]) -> QueueResult<Vec<RecordId>> {
        Ok(self.store.in_transaction(|tx| {
            entries
                .iter()
                .map(|entry| self.insert_entry_from_transaction(tx, entry))
                .collect()
        })?)
    }

    /// Insert inside a transaction owned by the caller, so the entry commits
    /// (or rolls back) with the caller's own writes.
    pub fn insert_entry_from_transaction(
        &self,
        tx: &mut dyn EntryTransaction,
        entry: &QueueEntry,
    ) -> StoreResult<RecordId> {
        let mut row = entry.clone();
        row.processing_state = ProcessingState::Available;
        row.processing_owner = None;
        row.processing_available_date = None;

        let started = Instant::now();
        let record_id = tx.insert_entry(&row, &self.config.table_name)?;
        self.timers.insert_entry.record(started.elapsed());

        if !record_id.is_assigned() {
            warn!(
                queue = %self.config.queue_name,
                record_id = %record_id,
                "store returned a non-positive record id"
            );
        }
        debug!(
            queue = %self.config.queue_name,
            record_id = %record_id,
            class_name = %row.class_name,
            effective_date = %row.effective_date,
            "inserted entry"
        );
        Ok(record_id)
    }

    // ----- claiming -----

    /// Claim the next batch of work for this node.
    pub fn get_ready_entries(&self) -> QueueResult<ReadyEntries> {
        let started = Instant::now();
        let entries = match self.config.mode {
            PollingMode::Polling => self.claim_polling()?,
            PollingMode::StickyPolling => self.claim_sticky()?,
        };
        let elapsed = started.elapsed();
        self.timers.get_entries.record(elapsed);

        if !entries.is_empty() {
            debug!(
                queue = %self.config.queue_name,
                owner = %self.owner,
                count = entries.len(),
                elapsed_ms = elapsed.as_millis() as u64,
                "claimed entries"
            );
        }
        Ok(ReadyEntries { entries, elapsed })
    }

    fn claim_polling(&self) -> QueueResult<Vec<QueueEntry>> {
        let now = self.clock.now();
        let expiry = now + span(self.config.claim_time);
        let table = self.config.table_name.as_str();

        let candidates = self.store.in_transaction(|tx| {
            tx.ready_entries(now, None, self.config.max_entries_claimed, table)
        })?;

        let mut claimed = Vec::with_capacity(candidates.len());
        for mut candidate in candidates {
            let started = Instant::now();
            let result = self.store.in_transaction(|tx| {
                tx.claim_entry(candidate.record_id, &self.owner, expiry, table)
            });
            self.timers.claim_entry.record(started.elapsed());

            match result {
                Ok(1) => {
                    candidate.mark_claimed(&self.owner, expiry);
                    claimed.push(candidate);
                }
                Ok(_) => {
                    debug!(
                        queue = %self.config.queue_name,
                        record_id = %candidate.record_id,
                        "lost claim race"
                    );
                }
                Err(err) if claimed.is_empty() => return Err(err.into()),
                Err(err) => {
                    // Keep what was already claimed; the rest waits for the next poll.
                    warn!(
                        queue = %self.config.queue_name,
                        record_id = %candidate.record_id,
                        error = %err,
                        "claim failed, returning partial batch"
                    );
                    break;
                }
            }
        }
        Ok(claimed)
    }

    fn claim_sticky(&self) -> QueueResult<Vec<QueueEntry>> {
        let now = self.clock.now();
        let expiry = now + span(self.config.claim_time);
        let table = self.config.table_name.as_str();
        let batch = self.config.max_entries_claimed;
        let use_cache = self.inflight.is_enabled();

        let entries = self.store.in_transaction(|tx| {
            let started = Instant::now();
            let claimed = tx.claim_entries(&self.owner, now, expiry, batch, table)?;
            self.timers.claim_entries.record(started.elapsed());

            if use_cache {
                // Everything this node owns, minus what is already being dispatched.
                let limit = batch.saturating_add(self.inflight.len());
                tx.ready_entries(now, Some(&self.owner), limit, table)
            } else if claimed.is_empty() {
                Ok(Vec::new())
            } else {
                tx.entries_by_ids(&claimed, table)
            }
        })?;

        Ok(self.inflight.admit(entries))
    }

    // ----- resolution -----

    /// Move one resolved entry to history. Failures are logged, not returned;
    /// the row then stays active and is picked up again later.
    pub fn move_entry_to_history(&self, entry: &QueueEntry) -> bool {
        let started = Instant::now();
        let result = self
            .store
            .in_transaction(|tx| self.move_entries_to_history_from_transaction(tx, slice::from_ref(entry)));
        self.timers.delete_entry.record(started.elapsed());
        self.inflight.remove(entry.record_id);

        match result {
            Ok(moved) => moved == 1,
            Err(err) => {
                warn!(
                    queue = %self.config.queue_name,
                    record_id = %entry.record_id,
                    error = %err,
                    "failed to move entry to history"
                );
                false
            }
        }
    }

    /// Batch form of [`DbBackedQueue::move_entry_to_history`]; returns how many
    /// rows moved.
    pub fn move_entries_to_history(&self, entries: &[QueueEntry]) -> usize {
        if entries.is_empty() {
            return 0;
        }
        let started = Instant::now();
        let result = self
            .store
            .in_transaction(|tx| self.move_entries_to_history_from_transaction(tx, entries));
        self.timers.delete_entries.record(started.elapsed());
        self.inflight.remove_all(entries);

        match result {
            Ok(moved) => moved,
            Err(err) => {
                warn!(
                    queue = %self.config.queue_name,
                    count = entries.len(),
                    error = %err,
                    "failed to move entries to history"
                );
                0
            }
        }
    }

    pub fn move_entry_to_history_from_transaction(
        &self,
        tx: &mut dyn EntryTransaction,
        entry: &QueueEntry,
    ) -> StoreResult<bool> {
        Ok(self.move_entries_to_history_from_transaction(tx, slice::from_ref(entry))? == 1)
    }

    /// Delete from active and copy into history within `tx`.
    ///
    /// Only rows actually deleted are written to history, so repeating a move
    /// is a no-op. The inflight cache is left as is until the transaction
    /// commits; another poll on this node must keep skipping the rows until
    /// then.
    pub fn move_entries_to_history_from_transaction(
        &self,
        tx: &mut dyn EntryTransaction,
        entries: &[QueueEntry],
    ) -> StoreResult<usize> {
        for entry in entries {
            if !entry.processing_state.is_terminal() {
                warn!(
                    queue = %self.config.queue_name,
                    record_id = %entry.record_id,
                    state = %entry.processing_state,
                    "moving non-terminal entry to history"
                );
            }
        }

        let ids: Vec<RecordId> = entries.iter().map(|e| e.record_id).collect();
        let removed = tx.remove_entries(&ids, &self.config.table_name)?;
        if removed.len() < ids.len() {
            debug!(
                queue = %self.config.queue_name,
                missing = ids.len() - removed.len(),
                "entries already left the active table"
            );
        }

        let resolved: Vec<QueueEntry> = entries
            .iter()
            .filter(|e| removed.contains(&e.record_id))
            .cloned()
            .collect();
        tx.insert_history(&resolved, &self.config.history_table_name)?;

        for entry in &resolved {
            debug!(
                queue = %self.config.queue_name,
                record_id = %entry.record_id,
                state = %entry.processing_state,
                "moved entry to history"
            );
        }
        Ok(resolved.len())
    }

    /// Re-arm a failed entry, or fail it for good once it is out of retries.
    pub fn update_on_error(&self, entry: &QueueEntry, error: &str) -> QueueResult<ErrorOutcome> {
        let error_count = entry.error_count.saturating_add(1);

        if entry.error_count < self.config.max_failure_retries {
            let effective_date = self.clock.now() + span(self.backoff.delay_for(error_count));
            let result = self.store.in_transaction(|tx| {
                tx.update_on_error(
                    entry.record_id,
                    error_count,
                    effective_date,
                    &self.config.table_name,
                )
            });
            self.inflight.remove(entry.record_id);

            if result? == 0 {
                debug!(
                    queue = %self.config.queue_name,
                    record_id = %entry.record_id,
                    "failed entry is no longer active"
                );
                return Ok(ErrorOutcome::Vanished);
            }
            info!(
                queue = %self.config.queue_name,
                record_id = %entry.record_id,
                error_count,
                effective_date = %effective_date,
                error = %error,
                "entry failed, re-armed for retry"
            );
            return Ok(ErrorOutcome::Rearmed {
                error_count,
                effective_date,
            });
        }

        let mut failed = entry.resolved(ProcessingState::Failed);
        failed.error_count = error_count;
        let result = self
            .store
            .in_transaction(|tx| self.move_entry_to_history_from_transaction(tx, &failed));
        self.inflight.remove(entry.record_id);

        if !result? {
            return Ok(ErrorOutcome::Vanished);
        }
        warn!(
            queue = %self.config.queue_name,
            record_id = %entry.record_id,
            error_count,
            error = %error,
            "entry exhausted its retries, moved to history as FAILED"
        );
        Ok(ErrorOutcome::Failed { error_count })
    }

    /// Cancel an entry that has not been claimed yet.
    ///
    /// Returns `false` for unknown ids and for entries already in processing.
    pub fn remove_entry(&self, record_id: RecordId) -> QueueResult<bool> {
        self.remove_matching(record_id, None)
    }

    /// [`DbBackedQueue::remove_entry`], restricted to rows of `queue_name`.
    pub fn remove_entry_for_queue(&self, record_id: RecordId, queue_name: &str) -> QueueResult<bool> {
        self.remove_matching(record_id, Some(queue_name))
    }

    fn remove_matching(&self, record_id: RecordId, queue_name: Option<&str>) -> QueueResult<bool> {
        let removed = self.store.in_transaction(|tx| {
            match tx.entry(record_id, &self.config.table_name)? {
                Some(entry)
                    if entry.processing_state == ProcessingState::Available
                        && queue_name.is_none_or(|name| entry.queue_name == name) =>
                {
                    self.move_entry_to_history_from_transaction(
                        tx,
                        &entry.resolved(ProcessingState::Removed),
                    )
                }
                _ => Ok(false),
            }
        })?;
        self.inflight.remove(record_id);

        if !removed {
            debug!(
                queue = %self.config.queue_name,
                record_id = %record_id,
                "nothing to remove"
            );
        }
        Ok(removed)
    }

    // ----- reaping -----

    /// Recover entries left behind by dead or stalled nodes.
    ///
    /// One transaction: orphans move to history as `REAPED` and a fresh
    /// `AVAILABLE` copy is inserted; nothing is half-applied on failure.
    /// Rows whose `error_count` reached `max_redispatch_count` are no longer
    /// selected and stay where they are.
    pub fn reap_entries(&self, cutoff: DateTime<Utc>) -> QueueResult<ReapOutcome> {
        let now = self.clock.now();
        let table = self.config.table_name.as_str();
        let limit = self.config.max_entries_claimed;

        let outcome = self.store.in_transaction(|tx| {
            let mut outcome = ReapOutcome::default();
            for entry in tx.own_entries_left_behind(cutoff, &self.owner, limit, table)? {
                match LeftBehind::classify(&entry, &self.owner) {
                    LeftBehind::Stuck => outcome.stuck.push(entry.record_id),
                    LeftBehind::Late => outcome.late.push(entry.record_id),
                    LeftBehind::Orphaned => {}
                }
            }

            let orphans: Vec<QueueEntry> = tx
                .entries_left_behind(cutoff, &self.owner, self.config.max_redispatch_count, limit, table)?
                .into_iter()
                .filter(|entry| LeftBehind::classify(entry, &self.owner) == LeftBehind::Orphaned)
                .collect();
            if orphans.is_empty() {
                return Ok(outcome);
            }

            let ids: Vec<RecordId> = orphans.iter().map(|e| e.record_id).collect();
            let removed = tx.remove_entries(&ids, table)?;

            let mut history = Vec::with_capacity(removed.len());
            let mut replacements = Vec::with_capacity(removed.len());
            for entry in orphans {
                if removed.contains(&entry.record_id) {
                    replacements.push((entry.record_id, entry.redispatch_copy(&self.owner, now)));
                    history.push(entry.resolved(ProcessingState::Reaped));
                }
            }
            tx.insert_history(&history, &self.config.history_table_name)?;

            for (old_id, replacement) in replacements {
                let new_id = self.insert_entry_from_transaction(tx, &replacement)?;
                outcome.reaped.push(old_id);
                outcome.redispatched.push(new_id);
            }
            Ok(outcome)
        })?;

        for record_id in &outcome.stuck {
            warn!(
                queue = %self.config.queue_name,
                record_id = %record_id,
                owner = %self.owner,
                "entry stuck in processing on this node"
            );
        }
        if !outcome.late.is_empty() {
            warn!(
                queue = %self.config.queue_name,
                count = outcome.late.len(),
                "entries created by this node are late, dispatch is falling behind"
            );
        }
        for (old, new) in outcome.reaped.iter().zip(&outcome.redispatched) {
            warn!(
                queue = %self.config.queue_name,
                record_id = %old,
                new_record_id = %new,
                "reaped orphaned entry"
            );
        }
        Ok(outcome)
    }

    // ----- queries -----

    pub fn nb_ready_entries(&self) -> QueueResult<u64> {
        self.nb_ready_entries_at(self.clock.now())
    }

    pub fn nb_ready_entries_at(&self, now: DateTime<Utc>) -> QueueResult<u64> {
        Ok(self
            .store
            .in_transaction(|tx| tx.count_ready(now, &self.config.table_name))?)
    }

    /// Pending (`AVAILABLE`) entries of one partition.
    pub fn entries_for_search_keys(
        &self,
        search_key1: Option<i64>,
        search_key2: Option<i64>,
    ) -> QueueResult<Vec<QueueEntry>> {
        let mut entries = self.store.in_transaction(|tx| {
            tx.entries_for_search_keys(search_key1, search_key2, &self.config.table_name)
        })?;
        entries.retain(|e| e.processing_state == ProcessingState::Available);
        Ok(entries)
    }

    pub fn history_entries_for_search_keys(
        &self,
        search_key1: Option<i64>,
        search_key2: Option<i64>,
    ) -> QueueResult<Vec<QueueEntry>> {
        Ok(self.store.in_transaction(|tx| {
            tx.entries_for_search_keys(search_key1, search_key2, &self.config.history_table_name)
        })?)
    }

    pub fn in_processing_entries(&self) -> QueueResult<Vec<QueueEntry>> {
        Ok(self
            .store
            .in_transaction(|tx| tx.in_processing_entries(&self.config.table_name))?)
    }
}

impl<S> std::fmt::Debug for DbBackedQueue<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbBackedQueue")
            .field("queue", &self.config.queue_name)
            .field("table", &self.config.table_name)
            .field("mode", &self.config.mode)
            .field("owner", &self.owner)
            .finish()
    }
}
