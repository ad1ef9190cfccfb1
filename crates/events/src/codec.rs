//! Event serialization boundary.

use thiserror::Error;

use dbq_core::QueueError;

use crate::{EventPayload, QueueEvent};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("failed to encode {class_name}: {message}")]
    Encode { class_name: String, message: String },

    #[error("failed to decode {class_name}: {message}")]
    Decode { class_name: String, message: String },

    #[error("class name mismatch: expected {expected}, found {found}")]
    ClassMismatch { expected: String, found: String },
}

impl From<CodecError> for QueueError {
    fn from(value: CodecError) -> Self {
        QueueError::codec(value.to_string())
    }
}

/// Turns typed events into payloads and back.
pub trait EventCodec: Send + Sync {
    fn encode<E: QueueEvent>(&self, event: &E) -> Result<EventPayload, CodecError>;

    fn decode<E: QueueEvent>(&self, payload: &EventPayload) -> Result<E, CodecError>;
}

/// JSON codec (serde_json), the on-disk format of `event_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl EventCodec for JsonCodec {
    fn encode<E: QueueEvent>(&self, event: &E) -> Result<EventPayload, CodecError> {
        let body = serde_json::to_string(event).map_err(|e| CodecError::Encode {
            class_name: E::CLASS_NAME.to_string(),
            message: e.to_string(),
        })?;
        Ok(EventPayload::new(E::CLASS_NAME, body))
    }

    fn decode<E: QueueEvent>(&self, payload: &EventPayload) -> Result<E, CodecError> {
        if !payload.is::<E>() {
            return Err(CodecError::ClassMismatch {
                expected: E::CLASS_NAME.to_string(),
                found: payload.class_name().to_string(),
            });
        }
        serde_json::from_str(payload.body()).map_err(|e| CodecError::Decode {
            class_name: payload.class_name().to_string(),
            message: e.to_string(),
        })
    }
}
