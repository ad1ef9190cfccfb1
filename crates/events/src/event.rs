use serde::Serialize;
use serde::de::DeserializeOwned;

use dbq_core::UserToken;

/// A typed event that can travel through a persistent queue.
///
/// Events are:
/// - **immutable** facts, serialized once at insert time
/// - identified on disk by a stable `CLASS_NAME`, never by the Rust type name
/// - optionally partitioned by two search keys (ordering scope)
pub trait QueueEvent: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Stable type tag persisted in the `class_name` column.
    const CLASS_NAME: &'static str;

    fn search_key1(&self) -> Option<i64> {
        None
    }

    fn search_key2(&self) -> Option<i64> {
        None
    }

    /// Correlation token; a fresh one is generated when `None`.
    fn user_token(&self) -> Option<UserToken> {
        None
    }
}
