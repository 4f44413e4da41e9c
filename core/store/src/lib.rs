//! Persistent store for the offline sync core.
//!
//! Holds cached records per collection together with their sync status, the
//! conflict table and the durable request queue table. The store carries no
//! network or retry semantics; the sync engine drives it.
//!
//! # Backends
//! - [`SqliteStore`]: single-file database that survives restarts
//! - [`MemoryStore`]: in-memory, used by tests and as the degraded fallback
//! - [`ResilientStore`]: wraps a primary store and degrades to a read-only
//!   in-memory copy when the primary fails fatally

pub mod memory;
pub mod record;
pub mod resilient;
pub mod sqlite;
pub mod store;

pub use memory::MemoryStore;
pub use record::{
    CollectionSnapshot, ConflictItem, QueuedRequest, RequestStatus, StorageStats, StoredRecord,
    SyncState,
};
pub use resilient::{DegradedHook, ResilientStore};
pub use sqlite::SqliteStore;
pub use store::RecordStore;
