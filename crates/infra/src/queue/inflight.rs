use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};

use dbq_core::{QueueEntry, RecordId};

/// Ids this process has handed to a dispatch thread and not resolved yet.
///
/// Only consulted in sticky mode, where a poll re-reads every row this node
/// owns. Losing the set is harmless: the worst case is a duplicate dispatch.
#[derive(Debug)]
pub struct InflightCache {
    enabled: bool,
    ids: Mutex<HashSet<RecordId>>,
}

impl InflightCache {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            ids: Mutex::new(HashSet::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Keep only entries not already in flight, marking them as in flight.
    pub fn admit(&self, entries: Vec<QueueEntry>) -> Vec<QueueEntry> {
        if !self.enabled {
            return entries;
        }
        let mut ids = self.ids.lock().unwrap_or_else(PoisonError::into_inner);
        entries
            .into_iter()
            .filter(|entry| ids.insert(entry.record_id))
            .collect()
    }

    pub fn remove(&self, record_id: RecordId) {
        if self.enabled {
            self.ids
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&record_id);
        }
    }

    pub fn remove_all(&self, entries: &[QueueEntry]) {
        if self.enabled {
            let mut ids = self.ids.lock().unwrap_or_else(PoisonError::into_inner);
            for entry in entries {
                ids.remove(&entry.record_id);
            }
        }
    }

    pub fn clear(&self) {
        self.ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn len(&self) -> usize {
        self.ids.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
