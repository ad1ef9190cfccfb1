use serde::{Deserialize, Serialize};

use dbq_core::QueueEntry;

/// Serialized event as stored in a queue row.
///
/// The engine moves this around untouched; only a codec or a typed handler
/// turns it back into a concrete event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventPayload {
    class_name: String,
    body: String,
}

impl EventPayload {
    pub fn new(class_name: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            body: body.into(),
        }
    }

    pub fn from_entry(entry: &QueueEntry) -> Self {
        Self::new(entry.class_name.clone(), entry.event_json.clone())
    }

    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn is<E: crate::QueueEvent>(&self) -> bool {
        self.class_name == E::CLASS_NAME
    }

    pub fn into_parts(self) -> (String, String) {
        (self.class_name, self.body)
    }
}
