//! Deferred notifications: events delivered at or after an effective date.

use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use dbq_core::{QueueEntry, QueueError, QueueResult, RecordId, UserToken};
use dbq_events::{EventHandler, HandlerRegistry, JsonCodec, QueueEvent};

use crate::bus::{EventWithMetadata, decode_entries, entry_for_event};
use crate::queue::DbBackedQueue;
use crate::service::{QueueContext, QueueService, QueueServiceHandle};
use crate::store::{EntryStore, EntryTransaction};

/// Owns one notification table and the named queues that share it.
pub struct NotificationQueueService<S> {
    service: QueueService<S>,
    registry: Arc<HandlerRegistry>,
    running: Mutex<Option<QueueServiceHandle<S>>>,
}

impl<S: EntryStore + 'static> NotificationQueueService<S> {
    pub fn new(queue: DbBackedQueue<S>) -> Self {
        let registry = Arc::new(HandlerRegistry::new());
        Self {
            service: QueueService::new(QueueContext::new(queue, registry.clone())),
            registry,
            running: Mutex::new(None),
        }
    }

    pub fn service(&self) -> &QueueService<S> {
        &self.service
    }

    pub fn queue_name(service_name: &str, queue_name: &str) -> String {
        format!("{service_name}:{queue_name}")
    }

    /// Register `handler` under `service_name:queue_name`.
    pub fn create_notification_queue<H>(
        &self,
        service_name: &str,
        queue_name: &str,
        handler: H,
    ) -> QueueResult<NotificationQueue<S>>
    where
        H: EventHandler + 'static,
    {
        if service_name.trim().is_empty() || queue_name.trim().is_empty() {
            return Err(QueueError::validation(
                "notification queue needs a service and a queue name",
            ));
        }
        let name = Self::queue_name(service_name, queue_name);
        self.registry.register(name.clone(), handler)?;
        info!(queue = %name, "notification queue created");

        Ok(NotificationQueue {
            name,
            queue: self.service.queue().clone(),
            codec: JsonCodec,
        })
    }

    /// Stop routing to `service_name:queue_name`. Pending rows stay and fail
    /// with "no handler" until a handler is registered again.
    pub fn delete_notification_queue(&self, service_name: &str, queue_name: &str) -> bool {
        self.registry
            .unregister(&Self::queue_name(service_name, queue_name))
    }

    pub fn notification_queue_names(&self) -> Vec<String> {
        self.registry.queue_names()
    }

    pub fn start(&self) {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if running.is_some() {
            warn!("notification service already started");
            return;
        }
        *running = Some(self.service.start());
    }

    pub fn stop(&self) {
        let handle = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match handle {
            Some(handle) => handle.shutdown(),
            None => debug!("notification service was not running"),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

impl<S> Drop for NotificationQueueService<S> {
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

impl<S> std::fmt::Debug for NotificationQueueService<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationQueueService")
            .field("service", &self.service)
            .finish()
    }
}

/// Producer side of one named notification queue.
pub struct NotificationQueue<S> {
    name: String,
    queue: Arc<DbBackedQueue<S>>,
    codec: JsonCodec,
}

impl<S: EntryStore> NotificationQueue<S> {
    /// `service:queue`, the value stored in each row's `queue_name`.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn entry_for<E: QueueEvent>(
        &self,
        effective_date: DateTime<Utc>,
        event: &E,
        future_user_token: Option<UserToken>,
    ) -> QueueResult<QueueEntry> {
        Ok(entry_for_event(&self.queue, &self.codec, &self.name, event)?
            .with_effective_date(effective_date)
            .with_future_user_token(future_user_token))
    }

    /// Schedule `event` for delivery at `effective_date`.
    pub fn record_future_notification<E: QueueEvent>(
        &self,
        effective_date: DateTime<Utc>,
        event: &E,
        future_user_token: Option<UserToken>,
    ) -> QueueResult<RecordId> {
        let entry = self.entry_for(effective_date, event, future_user_token)?;
        let record_id = self.queue.insert_entry(&entry)?;
        debug!(
            queue = %self.name,
            record_id = %record_id,
            effective_date = %effective_date,
            "recorded future notification"
        );
        Ok(record_id)
    }

    pub fn record_future_notification_from_transaction<E: QueueEvent>(
        &self,
        tx: &mut dyn EntryTransaction,
        effective_date: DateTime<Utc>,
        event: &E,
        future_user_token: Option<UserToken>,
    ) -> QueueResult<RecordId> {
        let entry = self.entry_for(effective_date, event, future_user_token)?;
        Ok(self.queue.insert_entry_from_transaction(tx, &entry)?)
    }

    /// Pending notifications of class `E` for this queue in one partition.
    pub fn future_notifications_for_search_keys<E: QueueEvent>(
        &self,
        search_key1: Option<i64>,
        search_key2: Option<i64>,
    ) -> QueueResult<Vec<EventWithMetadata<E>>> {
        let mut entries = self
            .queue
            .entries_for_search_keys(search_key1, search_key2)?;
        entries.retain(|entry| entry.queue_name == self.name);
        decode_entries(&self.codec, entries)
    }

    /// Cancel a pending notification of this queue; `false` if it was already
    /// picked up or belongs to another queue.
    pub fn remove_notification(&self, record_id: RecordId) -> QueueResult<bool> {
        self.queue.remove_entry_for_queue(record_id, &self.name)
    }
}

impl<S> std::fmt::Debug for NotificationQueue<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationQueue")
            .field("name", &self.name)
            .finish()
    }
}
