//! Handler lookup by queue name.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{debug, info};

use dbq_core::{QueueError, QueueResult};

use crate::handler::{EntryMetadata, EventHandler, HandlerError};
use crate::{EventPayload, QueueEvent};

/// Maps queue names to handlers.
///
/// Lookup tries the exact name first, then the longest matching `prefix.*` /
/// `prefix:*` pattern, then the `*` catch-all.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn EventHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `queue_name`; a name can only be taken once.
    pub fn register<H>(&self, queue_name: impl Into<String>, handler: H) -> QueueResult<()>
    where
        H: EventHandler + 'static,
    {
        self.register_shared(queue_name, Arc::new(handler))
    }

    pub fn register_shared(
        &self,
        queue_name: impl Into<String>,
        handler: Arc<dyn EventHandler>,
    ) -> QueueResult<()> {
        let queue_name = queue_name.into();
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        if handlers.contains_key(&queue_name) {
            return Err(QueueError::handler(format!(
                "a handler is already registered for {queue_name}"
            )));
        }
        info!(queue = %queue_name, "registered queue handler");
        handlers.insert(queue_name, handler);
        Ok(())
    }

    /// Returns whether a handler was registered under that exact name.
    pub fn unregister(&self, queue_name: &str) -> bool {
        let removed = self
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(queue_name)
            .is_some();
        if removed {
            info!(queue = %queue_name, "unregistered queue handler");
        }
        removed
    }

    pub fn get(&self, queue_name: &str) -> Option<Arc<dyn EventHandler>> {
        let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(h) = handlers.get(queue_name) {
            return Some(h.clone());
        }

        // Longest matching prefix wins; the separator is part of the prefix.
        let pattern_match = handlers
            .iter()
            .filter(|(pattern, _)| pattern.ends_with(".*") || pattern.ends_with(":*"))
            .filter_map(|(pattern, handler)| {
                let prefix = &pattern[..pattern.len() - 1];
                (queue_name.len() > prefix.len() && queue_name.starts_with(prefix))
                    .then_some((prefix.len(), handler))
            })
            .max_by_key(|(len, _)| *len);
        if let Some((_, handler)) = pattern_match {
            return Some(handler.clone());
        }

        handlers.get("*").cloned()
    }

    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("queues", &self.queue_names())
            .finish()
    }
}

/// Fans a single queue out to per-class subscribers.
///
/// Used by the bus, where many event types share one queue. Payloads with no
/// subscriber are acknowledged so they do not cycle through retries.
#[derive(Default)]
pub struct ClassRouter {
    routes: RwLock<HashMap<String, Vec<Arc<dyn EventHandler>>>>,
}

impl ClassRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe a typed handler to events of class `E`.
    pub fn subscribe<E, F>(&self, f: F)
    where
        E: QueueEvent,
        F: Fn(E, &EntryMetadata) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.subscribe_raw(E::CLASS_NAME, crate::handler::typed::<E, F>(f));
    }

    pub fn subscribe_raw<H>(&self, class_name: impl Into<String>, handler: H)
    where
        H: EventHandler + 'static,
    {
        self.routes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(class_name.into())
            .or_default()
            .push(Arc::new(handler));
    }

    pub fn subscriber_count(&self, class_name: &str) -> usize {
        self.routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(class_name)
            .map_or(0, Vec::len)
    }
}

impl EventHandler for ClassRouter {
    fn handle(&self, payload: &EventPayload, metadata: &EntryMetadata) -> Result<(), HandlerError> {
        let subscribers = self
            .routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(payload.class_name())
            .cloned()
            .unwrap_or_default();

        if subscribers.is_empty() {
            debug!(
                class_name = %payload.class_name(),
                record_id = %metadata.record_id,
                "no subscriber for event class"
            );
            return Ok(());
        }

        // First failure wins; the whole entry is retried, so every subscriber must be idempotent.
        for subscriber in subscribers {
            subscriber.handle(payload, metadata)?;
        }
        Ok(())
    }
}
