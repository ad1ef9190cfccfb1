//! Events carried by persistent queues, and the handlers that consume them.

pub mod codec;
pub mod event;
pub mod handler;
pub mod latch;
pub mod payload;
pub mod registry;

pub use codec::{CodecError, EventCodec, JsonCodec};
pub use event::QueueEvent;
pub use handler::{
    EntryMetadata, EventHandler, FnHandler, HandlerError, TypedHandler, handler_fn, typed,
};
pub use latch::CompletionLatch;
pub use payload::EventPayload;
pub use registry::{ClassRouter, HandlerRegistry};
