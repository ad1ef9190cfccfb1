//! Recovery of entries abandoned mid-processing.

use std::sync::Arc;
use std::sync::mpsc;
use std::thread;

use tracing::{debug, error, info};

use dbq_core::clock::span;
use dbq_core::{OwnerId, QueueEntry, QueueResult};

use crate::queue::{DbBackedQueue, ReapOutcome};
use crate::store::EntryStore;
use crate::workers::{WorkerHandle, sleep_or_shutdown};

/// Why a row is still in the active table past the reap cutoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeftBehind {
    /// Claimed by this node and never resolved; left alone.
    Stuck,
    /// Created by this node, never claimed; a backlog, left alone.
    Late,
    /// Anything else: the node that owns or created it is presumed gone.
    Orphaned,
}

impl LeftBehind {
    pub fn classify(entry: &QueueEntry, owner: &OwnerId) -> Self {
        match &entry.processing_owner {
            Some(processing_owner) if processing_owner == owner => LeftBehind::Stuck,
            None if &entry.creating_owner == owner => LeftBehind::Late,
            _ => LeftBehind::Orphaned,
        }
    }
}

/// Periodic reaper for one queue.
#[derive(Debug)]
pub struct Reaper;

impl Reaper {
    /// Reap everything left behind for longer than the configured threshold.
    pub fn reap_once<S: EntryStore>(queue: &DbBackedQueue<S>) -> QueueResult<ReapOutcome> {
        let cutoff = queue.clock().now() - span(queue.config().reap_threshold);
        queue.reap_entries(cutoff)
    }

    /// Run [`Reaper::reap_once`] every `reap_schedule` on a dedicated thread.
    pub fn spawn<S>(queue: Arc<DbBackedQueue<S>>) -> WorkerHandle
    where
        S: EntryStore + 'static,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let name = format!("{}-reaper", queue.config().queue_name);

        let worker_name = name.clone();
        let join = thread::Builder::new()
            .name(name.clone())
            .spawn(move || reaper_loop(&worker_name, &queue, &shutdown_rx))
            .expect("failed to spawn reaper thread");

        WorkerHandle::new(name, shutdown_tx, join)
    }
}

fn reaper_loop<S: EntryStore>(
    name: &str,
    queue: &DbBackedQueue<S>,
    shutdown_rx: &mpsc::Receiver<()>,
) {
    let schedule = queue.config().reap_schedule;
    info!(worker = %name, schedule_ms = schedule.as_millis() as u64, "reaper started");

    while !sleep_or_shutdown(shutdown_rx, schedule) {
        match Reaper::reap_once(queue) {
            Ok(outcome) if outcome.is_empty() => {
                debug!(worker = %name, "nothing to reap");
            }
            Ok(outcome) => {
                info!(
                    worker = %name,
                    reaped = outcome.reaped.len(),
                    stuck = outcome.stuck.len(),
                    late = outcome.late.len(),
                    "reaper pass complete"
                );
            }
            Err(err) => {
                error!(worker = %name, error = %err, "reaper pass failed");
            }
        }
    }

    info!(worker = %name, "reaper stopped");
}
