use std::marker::PhantomData;

use chrono::{DateTime, Utc};
use thiserror::Error;

use dbq_core::{QueueEntry, RecordId, UserToken};

use crate::codec::{CodecError, EventCodec, JsonCodec};
use crate::{EventPayload, QueueEvent};

/// Row context handed to a handler alongside the event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryMetadata {
    pub record_id: RecordId,
    pub queue_name: String,
    pub effective_date: DateTime<Utc>,
    pub user_token: UserToken,
    pub future_user_token: Option<UserToken>,
    pub search_key1: Option<i64>,
    pub search_key2: Option<i64>,
    /// Failed attempts before this one.
    pub error_count: u32,
}

impl EntryMetadata {
    pub fn from_entry(entry: &QueueEntry) -> Self {
        Self {
            record_id: entry.record_id,
            queue_name: entry.queue_name.clone(),
            effective_date: entry.effective_date,
            user_token: entry.user_token,
            future_user_token: entry.future_user_token,
            search_key1: entry.search_key1,
            search_key2: entry.search_key2,
            error_count: entry.error_count,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandlerError {
    #[error("handler failed: {0}")]
    Failed(String),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("handler panicked: {0}")]
    Panicked(String),

    #[error("no handler registered for queue {0}")]
    NoHandler(String),
}

impl HandlerError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }
}

/// Processes one dispatched entry.
///
/// Delivery is at-least-once: a handler may see the same entry again after a
/// crash, a lost history move, or a reap, so it must be idempotent.
pub trait EventHandler: Send + Sync {
    fn handle(&self, payload: &EventPayload, metadata: &EntryMetadata) -> Result<(), HandlerError>;
}

/// Handler over raw payloads, built with [`handler_fn`].
pub struct FnHandler<F> {
    f: F,
}

impl<F> EventHandler for FnHandler<F>
where
    F: Fn(&EventPayload, &EntryMetadata) -> Result<(), HandlerError> + Send + Sync,
{
    fn handle(&self, payload: &EventPayload, metadata: &EntryMetadata) -> Result<(), HandlerError> {
        (self.f)(payload, metadata)
    }
}

pub fn handler_fn<F>(f: F) -> FnHandler<F>
where
    F: Fn(&EventPayload, &EntryMetadata) -> Result<(), HandlerError> + Send + Sync,
{
    FnHandler { f }
}

/// Handler that decodes the payload into `E` before calling `f`.
pub struct TypedHandler<E, F> {
    f: F,
    codec: JsonCodec,
    _event: PhantomData<fn() -> E>,
}

impl<E, F> EventHandler for TypedHandler<E, F>
where
    E: QueueEvent,
    F: Fn(E, &EntryMetadata) -> Result<(), HandlerError> + Send + Sync,
{
    fn handle(&self, payload: &EventPayload, metadata: &EntryMetadata) -> Result<(), HandlerError> {
        let event = self.codec.decode::<E>(payload)?;
        (self.f)(event, metadata)
    }
}

pub fn typed<E, F>(f: F) -> TypedHandler<E, F>
where
    E: QueueEvent,
    F: Fn(E, &EntryMetadata) -> Result<(), HandlerError> + Send + Sync,
{
    TypedHandler {
        f,
        codec: JsonCodec,
        _event: PhantomData,
    }
}
