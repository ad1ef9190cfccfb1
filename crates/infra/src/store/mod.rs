//! Entry store boundary.
//!
//! The active/history table pair behind a queue, reached only through
//! transactions. The engine never holds a lock of its own for correctness:
//! exclusivity comes from the conditional claim statements issued here.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::{InMemoryEntryStore, StoreOperation};
pub use postgres::{PgEntryTransaction, PostgresEntryStore};
pub use r#trait::{EntryStore, EntryTransaction, StoreError, StoreResult};
