//! Strongly-typed identifiers used by the queue.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::QueueError;

/// Store-assigned identifier of a queue row.
///
/// Monotonic by insertion; it is the only ordering key the engine uses.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(i64);

impl RecordId {
    /// Placeholder carried by entries that were not persisted yet.
    pub const UNASSIGNED: RecordId = RecordId(0);

    pub const fn new(value: i64) -> Self {
        Self(value)
    }

    pub const fn value(&self) -> i64 {
        self.0
    }

    pub const fn is_assigned(&self) -> bool {
        self.0 > 0
    }
}

impl core::fmt::Display for RecordId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

impl From<i64> for RecordId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl From<RecordId> for i64 {
    fn from(value: RecordId) -> Self {
        value.0
    }
}

/// Correlation token shared by entries produced from the same request.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserToken(Uuid);

macro_rules! impl_uuid_newtype {
    ($t:ty, $name:literal) => {
        impl $t {
            /// Create a new token (UUIDv7, time-ordered).
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $t {
            fn default() -> Self {
                Self::new()
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                core::fmt::Display::fmt(&self.0, f)
            }
        }

        impl From<Uuid> for $t {
            fn from(value: Uuid) -> Self {
                Self(value)
            }
        }

        impl From<$t> for Uuid {
            fn from(value: $t) -> Self {
                value.0
            }
        }

        impl FromStr for $t {
            type Err = QueueError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let uuid = Uuid::from_str(s)
                    .map_err(|e| QueueError::invalid_id(format!("{}: {}", $name, e)))?;
                Ok(Self(uuid))
            }
        }
    };
}

impl_uuid_newtype!(UserToken, "UserToken");

/// Identity of a node, written to `creating_owner` and `processing_owner`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(String);

impl OwnerId {
    /// Wrap an explicit node identity (typically the host name).
    pub fn new(value: impl Into<String>) -> Result<Self, QueueError> {
        let value = value.into();
        if value.trim().is_empty() {
            return Err(QueueError::invalid_id("OwnerId: empty"));
        }
        Ok(Self(value))
    }

    /// Generate a unique identity for this process.
    pub fn generate() -> Self {
        Self(format!("node-{}", Uuid::now_v7()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for OwnerId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for OwnerId {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_id_orders_by_value() {
        assert!(RecordId::new(1) < RecordId::new(2));
        assert!(!RecordId::UNASSIGNED.is_assigned());
        assert!(RecordId::new(7).is_assigned());
    }

    #[test]
    fn user_token_parses_back() {
        let token = UserToken::new();
        let parsed: UserToken = token.to_string().parse().unwrap();
        assert_eq!(token, parsed);
        assert!("not-a-uuid".parse::<UserToken>().is_err());
    }

    #[test]
    fn owner_rejects_blank_identity() {
        assert!(OwnerId::new("  ").is_err());
        assert_eq!(OwnerId::new("host-a").unwrap().as_str(), "host-a");
        assert!(OwnerId::generate().as_str().starts_with("node-"));
    }
}
