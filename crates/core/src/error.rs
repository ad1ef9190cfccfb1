//! Queue error model.

use thiserror::Error;

/// Result type used across the queue layers.
pub type QueueResult<T> = Result<T, QueueError>;

/// Queue-level error.
///
/// Infrastructure layers keep their own richer error types (`StoreError`,
/// `CodecError`, `HandlerError`) and convert into this one at the engine
/// boundary.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// A value failed validation (e.g. malformed input).
    #[error("validation failed: {0}")]
    Validation(String),

    /// The queue configuration is unusable.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// The backing store rejected or failed an operation.
    #[error("store error: {0}")]
    Store(String),

    /// A payload could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),

    /// A handler could not be resolved or registered.
    #[error("handler error: {0}")]
    Handler(String),

    /// The queue has not been started, or was already stopped.
    #[error("queue {0} is not running")]
    NotRunning(String),
}

impl QueueError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    pub fn codec(msg: impl Into<String>) -> Self {
        Self::Codec(msg.into())
    }

    pub fn handler(msg: impl Into<String>) -> Self {
        Self::Handler(msg.into())
    }
}
