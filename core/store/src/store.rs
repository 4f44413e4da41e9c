//! Record store trait definition.

use harborsync_common::{Collection, ResourceId, Result};

use crate::record::{CollectionSnapshot, ConflictItem, QueuedRequest, StorageStats, StoredRecord};

/// Storage backend for cached records, conflicts and the request queue.
///
/// All operations are synchronous and must be durable once they return `Ok`
/// (for durable backends). Implementations report storage failures as
/// `Error::Storage` so callers can tell fatal from ordinary errors.
pub trait RecordStore: Send + Sync {
    /// Get the backend name (e.g., "sqlite", "memory").
    fn name(&self) -> &str;

    /// Get a record by id.
    fn get_record(&self, collection: &Collection, id: &ResourceId) -> Result<Option<StoredRecord>>;

    /// Insert or replace a record.
    fn put_record(&self, record: &StoredRecord) -> Result<()>;

    /// Remove a record. Returns whether it existed.
    fn remove_record(&self, collection: &Collection, id: &ResourceId) -> Result<bool>;

    /// List all records of a collection.
    fn list_records(&self, collection: &Collection) -> Result<Vec<StoredRecord>>;

    fn get_conflict(&self, collection: &Collection, id: &ResourceId)
        -> Result<Option<ConflictItem>>;

    fn put_conflict(&self, item: &ConflictItem) -> Result<()>;

    fn remove_conflict(&self, collection: &Collection, id: &ResourceId) -> Result<bool>;

    fn list_conflicts(&self, collection: &Collection) -> Result<Vec<ConflictItem>>;

    /// Load the persisted queue, in no particular order.
    fn queue_load(&self) -> Result<Vec<QueuedRequest>>;

    /// Insert or replace a queued request.
    fn queue_put(&self, request: &QueuedRequest) -> Result<()>;

    /// Remove a queued request. Returns whether it existed.
    fn queue_remove(&self, id: &str) -> Result<bool>;

    fn meta_get(&self, key: &str) -> Result<Option<String>>;

    fn meta_set(&self, key: &str, value: &str) -> Result<()>;

    /// Collections that currently hold records or conflicts.
    fn collections(&self) -> Result<Vec<Collection>>;

    /// Remove every record, conflict and queued request of a collection.
    ///
    /// Destructive and irreversible locally.
    fn clear(&self, collection: &Collection) -> Result<()>;

    /// Replace the records and conflicts of a collection with a snapshot.
    ///
    /// # Errors
    /// - Snapshot belongs to another collection
    fn import(&self, snapshot: &CollectionSnapshot) -> Result<()>;

    /// Derived counts for a collection.
    fn stats(&self, collection: &Collection) -> Result<StorageStats> {
        let records = self.list_records(collection)?;
        Ok(StorageStats::from_records(&records))
    }

    /// Snapshot of a collection's records and conflicts.
    fn export(&self, collection: &Collection) -> Result<CollectionSnapshot> {
        Ok(CollectionSnapshot::new(
            collection.clone(),
            self.list_records(collection)?,
            self.list_conflicts(collection)?,
        ))
    }
}
