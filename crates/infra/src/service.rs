//! Dispatch loop: poll the engine, hand entries to handlers, report outcomes.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tracing::{debug, info, warn};

use dbq_core::{ProcessingState, QueueEntry, QueueResult};
use dbq_events::{EntryMetadata, EventPayload, HandlerError, HandlerRegistry};

use crate::queue::{DbBackedQueue, ErrorOutcome};
use crate::reaper::Reaper;
use crate::store::EntryStore;
use crate::workers::{DispatchWorker, WorkerHandle};

/// Everything one queue needs at runtime, passed explicitly to its workers.
pub struct QueueContext<S> {
    queue: Arc<DbBackedQueue<S>>,
    registry: Arc<HandlerRegistry>,
    stats: ServiceStats,
}

impl<S: EntryStore> QueueContext<S> {
    pub fn new(queue: DbBackedQueue<S>, registry: Arc<HandlerRegistry>) -> Self {
        Self::from_shared(Arc::new(queue), registry)
    }

    pub fn from_shared(queue: Arc<DbBackedQueue<S>>, registry: Arc<HandlerRegistry>) -> Self {
        Self {
            queue,
            registry,
            stats: ServiceStats::default(),
        }
    }

    pub fn queue(&self) -> &Arc<DbBackedQueue<S>> {
        &self.queue
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    pub fn stats(&self) -> &ServiceStats {
        &self.stats
    }
}

impl<S> std::fmt::Debug for QueueContext<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueContext")
            .field("queue", &self.queue)
            .field("registry", &self.registry)
            .finish()
    }
}

/// Runtime counters for one queue service.
#[derive(Debug, Default)]
pub struct ServiceStats {
    polls: AtomicU64,
    dispatched: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    rearmed: AtomicU64,
    dead: AtomicU64,
    store_errors: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ServiceStatsSnapshot {
    pub polls: u64,
    pub dispatched: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub rearmed: u64,
    /// Entries moved to history as `FAILED` after their last retry.
    pub dead: u64,
    pub store_errors: u64,
}

impl ServiceStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ServiceStatsSnapshot {
        ServiceStatsSnapshot {
            polls: self.polls.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            rearmed: self.rearmed.load(Ordering::Relaxed),
            dead: self.dead.load(Ordering::Relaxed),
            store_errors: self.store_errors.load(Ordering::Relaxed),
        }
    }
}

/// Drives one queue: a synchronous single cycle, or background workers.
pub struct QueueService<S> {
    context: Arc<QueueContext<S>>,
}

impl<S> Clone for QueueService<S> {
    fn clone(&self) -> Self {
        Self {
            context: Arc::clone(&self.context),
        }
    }
}

impl<S> std::fmt::Debug for QueueService<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueService")
            .field("context", &self.context)
            .finish()
    }
}

impl<S: EntryStore + 'static> QueueService<S> {
    pub fn new(context: QueueContext<S>) -> Self {
        Self {
            context: Arc::new(context),
        }
    }

    pub fn context(&self) -> &QueueContext<S> {
        &self.context
    }

    pub fn queue(&self) -> &Arc<DbBackedQueue<S>> {
        self.context.queue()
    }

    pub fn stats(&self) -> ServiceStatsSnapshot {
        self.context.stats.snapshot()
    }

    /// One poll and dispatch cycle; returns how many entries were dispatched.
    ///
    /// Only store failures while claiming are returned. Handler failures are
    /// reported to the engine and counted.
    pub fn process_ready_entries(&self) -> QueueResult<usize> {
        let queue = self.context.queue();
        let stats = &self.context.stats;
        ServiceStats::bump(&stats.polls);

        let ready = queue.get_ready_entries().inspect_err(|_| {
            ServiceStats::bump(&stats.store_errors);
        })?;
        if ready.is_empty() {
            return Ok(0);
        }

        let dispatched = ready.len();
        let mut processed = Vec::with_capacity(dispatched);
        for entry in ready.entries {
            ServiceStats::bump(&stats.dispatched);
            match self.dispatch(&entry) {
                Ok(()) => {
                    ServiceStats::bump(&stats.succeeded);
                    processed.push(entry.resolved(ProcessingState::Processed));
                }
                Err(err) => {
                    ServiceStats::bump(&stats.failed);
                    self.report_failure(&entry, &err);
                }
            }
        }

        let moved = queue.move_entries_to_history(&processed);
        if moved < processed.len() {
            debug!(
                queue = %queue.config().queue_name,
                expected = processed.len(),
                moved,
                "not every processed entry reached history"
            );
        }
        Ok(dispatched)
    }

    fn dispatch(&self, entry: &QueueEntry) -> Result<(), HandlerError> {
        let handler = self
            .context
            .registry
            .get(&entry.queue_name)
            .ok_or_else(|| HandlerError::NoHandler(entry.queue_name.clone()))?;

        let payload = EventPayload::from_entry(entry);
        let metadata = EntryMetadata::from_entry(entry);

        match panic::catch_unwind(AssertUnwindSafe(|| handler.handle(&payload, &metadata))) {
            Ok(result) => result,
            Err(panic) => Err(HandlerError::Panicked(panic_message(panic.as_ref()))),
        }
    }

    fn report_failure(&self, entry: &QueueEntry, err: &HandlerError) {
        let queue = self.context.queue();
        let stats = &self.context.stats;

        debug!(
            queue = %entry.queue_name,
            record_id = %entry.record_id,
            class_name = %entry.class_name,
            error = %err,
            "handler failed"
        );

        match queue.update_on_error(entry, &err.to_string()) {
            Ok(ErrorOutcome::Rearmed { .. }) => ServiceStats::bump(&stats.rearmed),
            Ok(ErrorOutcome::Failed { .. }) => ServiceStats::bump(&stats.dead),
            Ok(ErrorOutcome::Vanished) => {}
            Err(store_err) => {
                ServiceStats::bump(&stats.store_errors);
                warn!(
                    queue = %entry.queue_name,
                    record_id = %entry.record_id,
                    error = %store_err,
                    "could not record handler failure, entry stays claimed until reaped"
                );
            }
        }
    }

    /// Spawn `nb_threads` dispatch workers plus the reaper.
    ///
    /// With `processing_off` nothing is spawned; the queue still accepts inserts.
    pub fn start(&self) -> QueueServiceHandle<S> {
        let queue = self.context.queue();
        queue.initialize();

        let config = queue.config();
        let mut workers = Vec::new();
        if config.processing_off {
            info!(queue = %config.queue_name, "processing is off, no workers started");
        } else {
            for index in 0..config.nb_threads {
                workers.push(DispatchWorker::spawn(self.clone(), index));
            }
            workers.push(Reaper::spawn(Arc::clone(queue)));
            info!(
                queue = %config.queue_name,
                dispatchers = config.nb_threads,
                mode = %config.mode,
                "queue service started"
            );
        }

        QueueServiceHandle {
            context: Arc::clone(&self.context),
            workers,
        }
    }
}

/// Running workers of a started [`QueueService`].
pub struct QueueServiceHandle<S> {
    context: Arc<QueueContext<S>>,
    workers: Vec<WorkerHandle>,
}

impl<S> std::fmt::Debug for QueueServiceHandle<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueServiceHandle")
            .field("context", &self.context)
            .field("workers", &self.workers)
            .finish()
    }
}

impl<S> QueueServiceHandle<S> {
    /// Ask every worker to stop without waiting.
    pub fn signal_all(&self) {
        for worker in &self.workers {
            worker.signal();
        }
    }
}

impl<S: EntryStore> QueueServiceHandle<S> {
    pub fn worker_names(&self) -> Vec<&str> {
        self.workers.iter().map(WorkerHandle::name).collect()
    }

    /// Stop every worker, wait for in-flight dispatches, then close the queue.
    pub fn shutdown(self) {
        self.signal_all();
        for worker in self.workers {
            worker.shutdown();
        }
        let queue = self.context.queue();
        queue.close();
        info!(queue = %queue.config().queue_name, "queue service stopped");
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
