//! Persistent point-to-point bus over one queue.

use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, info, warn};

use dbq_core::{Clock, QueueEntry, QueueError, QueueResult, RecordId};
use dbq_events::{
    ClassRouter, EntryMetadata, EventCodec, EventHandler, EventPayload, HandlerError,
    HandlerRegistry, JsonCodec, QueueEvent,
};

use crate::queue::DbBackedQueue;
use crate::service::{QueueContext, QueueService, QueueServiceHandle};
use crate::store::{EntryStore, EntryTransaction};

/// A decoded event together with the row it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct EventWithMetadata<E> {
    pub event: E,
    pub metadata: EntryMetadata,
}

/// Decode the entries of class `E`, skipping other classes.
pub(crate) fn decode_entries<E: QueueEvent>(
    codec: &JsonCodec,
    entries: Vec<QueueEntry>,
) -> QueueResult<Vec<EventWithMetadata<E>>> {
    entries
        .into_iter()
        .filter(|entry| entry.class_name == E::CLASS_NAME)
        .map(|entry| {
            let event = codec.decode::<E>(&EventPayload::from_entry(&entry))?;
            Ok::<_, QueueError>(EventWithMetadata {
                event,
                metadata: EntryMetadata::from_entry(&entry),
            })
        })
        .collect()
}

/// Entry for a freshly posted event, stamped with this node and the queue clock.
pub(crate) fn entry_for_event<S, E>(
    queue: &DbBackedQueue<S>,
    codec: &JsonCodec,
    queue_name: &str,
    event: &E,
) -> QueueResult<QueueEntry>
where
    S: EntryStore,
    E: QueueEvent,
{
    let (class_name, body) = codec.encode(event)?.into_parts();
    let mut entry = QueueEntry::new(
        queue_name,
        class_name,
        body,
        queue.owner().clone(),
        queue.clock().now(),
    )
    .with_search_keys(event.search_key1(), event.search_key2());
    if let Some(token) = event.user_token() {
        entry = entry.with_user_token(token);
    }
    Ok(entry)
}

/// Durable bus: every posted event becomes a row, every row is delivered to
/// the subscribers of its class at least once.
pub struct PersistentBus<S> {
    service: QueueService<S>,
    router: Arc<ClassRouter>,
    codec: JsonCodec,
    running: Mutex<Option<QueueServiceHandle<S>>>,
}

impl<S: EntryStore + 'static> PersistentBus<S> {
    pub fn new(queue: DbBackedQueue<S>) -> QueueResult<Self> {
        let router = Arc::new(ClassRouter::new());
        let registry = HandlerRegistry::new();
        registry.register_shared(queue.config().queue_name.clone(), router.clone())?;

        Ok(Self {
            service: QueueService::new(QueueContext::new(queue, Arc::new(registry))),
            router,
            codec: JsonCodec,
            running: Mutex::new(None),
        })
    }

    pub fn service(&self) -> &QueueService<S> {
        &self.service
    }

    fn queue_name(&self) -> &str {
        &self.service.queue().config().queue_name
    }

    /// Subscribe a typed handler to events of class `E`.
    pub fn register<E, F>(&self, f: F)
    where
        E: QueueEvent,
        F: Fn(E, &EntryMetadata) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.router.subscribe::<E, F>(f);
        debug!(queue = %self.queue_name(), class_name = E::CLASS_NAME, "bus subscriber registered");
    }

    /// Subscribe a raw payload handler to `class_name`.
    pub fn register_handler<H>(&self, class_name: impl Into<String>, handler: H)
    where
        H: EventHandler + 'static,
    {
        self.router.subscribe_raw(class_name, handler);
    }

    pub fn post<E: QueueEvent>(&self, event: &E) -> QueueResult<RecordId> {
        let entry = entry_for_event(self.service.queue(), &self.codec, self.queue_name(), event)?;
        self.service.queue().insert_entry(&entry)
    }

    /// Post within the caller's transaction: the event exists only if that
    /// transaction commits.
    pub fn post_from_transaction<E: QueueEvent>(
        &self,
        event: &E,
        tx: &mut dyn EntryTransaction,
    ) -> QueueResult<RecordId> {
        let entry = entry_for_event(self.service.queue(), &self.codec, self.queue_name(), event)?;
        Ok(self.service.queue().insert_entry_from_transaction(tx, &entry)?)
    }

    /// Events of class `E` still waiting in one partition.
    pub fn available_events_for_search_keys<E: QueueEvent>(
        &self,
        search_key1: Option<i64>,
        search_key2: Option<i64>,
    ) -> QueueResult<Vec<EventWithMetadata<E>>> {
        let entries = self
            .service
            .queue()
            .entries_for_search_keys(search_key1, search_key2)?;
        decode_entries(&self.codec, entries)
    }

    /// Rows currently claimed by some node, any class.
    pub fn in_processing_events(&self) -> QueueResult<Vec<QueueEntry>> {
        self.service.queue().in_processing_entries()
    }

    /// Start dispatching; a second call while running is a no-op.
    pub fn start(&self) {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if running.is_some() {
            warn!(queue = %self.queue_name(), "bus already started");
            return;
        }
        *running = Some(self.service.start());
        info!(queue = %self.queue_name(), "persistent bus started");
    }

    pub fn stop(&self) {
        let handle = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match handle {
            Some(handle) => {
                handle.shutdown();
                info!(queue = %self.queue_name(), "persistent bus stopped");
            }
            None => debug!(queue = %self.queue_name(), "bus was not running"),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

impl<S> Drop for PersistentBus<S> {
    fn drop(&mut self) {
        let handle = self
            .running
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.signal_all();
        }
    }
}

impl<S> std::fmt::Debug for PersistentBus<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentBus")
            .field("service", &self.service)
            .finish()
    }
}
