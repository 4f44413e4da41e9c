//! In-memory record store.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use harborsync_common::{Collection, Error, ResourceId, Result};

use crate::record::{CollectionSnapshot, ConflictItem, QueuedRequest, StoredRecord};
use crate::store::RecordStore;

type Key = (Collection, ResourceId);

#[derive(Debug, Default)]
struct Inner {
    records: BTreeMap<Key, StoredRecord>,
    conflicts: BTreeMap<Key, ConflictItem>,
    queue: HashMap<String, QueuedRequest>,
    meta: HashMap<String, String>,
}

/// In-memory record store.
///
/// Useful for testing. Also backs the degraded mode, in which case it is
/// seeded from a snapshot and made read-only. All data is lost on drop.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
    read_only: Option<String>,
}

impl MemoryStore {
    /// Create a new empty writable store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a read-only store holding the given snapshots and queue.
    pub fn read_only(
        snapshots: Vec<CollectionSnapshot>,
        queue: Vec<QueuedRequest>,
        reason: impl Into<String>,
    ) -> Self {
        let mut inner = Inner::default();
        for snapshot in snapshots {
            for record in snapshot.records {
                inner
                    .records
                    .insert((record.collection.clone(), record.id.clone()), record);
            }
            for item in snapshot.conflicts {
                inner
                    .conflicts
                    .insert((item.collection.clone(), item.id.clone()), item);
            }
        }
        inner.queue = queue.into_iter().map(|r| (r.id.clone(), r)).collect();

        Self {
            inner: RwLock::new(inner),
            read_only: Some(reason.into()),
        }
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only.is_some()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Inner>> {
        self.inner
            .read()
            .map_err(|_| Error::Storage("memory store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Inner>> {
        if let Some(reason) = &self.read_only {
            return Err(Error::ReadOnly(reason.clone()));
        }
        self.inner
            .write()
            .map_err(|_| Error::Storage("memory store lock poisoned".to_string()))
    }
}

fn key(collection: &Collection, id: &ResourceId) -> Key {
    (collection.clone(), id.clone())
}

impl RecordStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    fn get_record(&self, collection: &Collection, id: &ResourceId) -> Result<Option<StoredRecord>> {
        Ok(self.read()?.records.get(&key(collection, id)).cloned())
    }

    fn put_record(&self, record: &StoredRecord) -> Result<()> {
        self.write()?
            .records
            .insert(key(&record.collection, &record.id), record.clone());
        Ok(())
    }

    fn remove_record(&self, collection: &Collection, id: &ResourceId) -> Result<bool> {
        Ok(self.write()?.records.remove(&key(collection, id)).is_some())
    }

    fn list_records(&self, collection: &Collection) -> Result<Vec<StoredRecord>> {
        Ok(self
            .read()?
            .records
            .values()
            .filter(|r| &r.collection == collection)
            .cloned()
            .collect())
    }

    fn get_conflict(
        &self,
        collection: &Collection,
        id: &ResourceId,
    ) -> Result<Option<ConflictItem>> {
        Ok(self.read()?.conflicts.get(&key(collection, id)).cloned())
    }

    fn put_conflict(&self, item: &ConflictItem) -> Result<()> {
        self.write()?
            .conflicts
            .insert(key(&item.collection, &item.id), item.clone());
        Ok(())
    }

    fn remove_conflict(&self, collection: &Collection, id: &ResourceId) -> Result<bool> {
        Ok(self.write()?.conflicts.remove(&key(collection, id)).is_some())
    }

    fn list_conflicts(&self, collection: &Collection) -> Result<Vec<ConflictItem>> {
        Ok(self
            .read()?
            .conflicts
            .values()
            .filter(|c| &c.collection == collection)
            .cloned()
            .collect())
    }

    fn queue_load(&self) -> Result<Vec<QueuedRequest>> {
        Ok(self.read()?.queue.values().cloned().collect())
    }

    fn queue_put(&self, request: &QueuedRequest) -> Result<()> {
        self.write()?
            .queue
            .insert(request.id.clone(), request.clone());
        Ok(())
    }

    fn queue_remove(&self, id: &str) -> Result<bool> {
        Ok(self.write()?.queue.remove(id).is_some())
    }

    fn meta_get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.read()?.meta.get(key).cloned())
    }

    fn meta_set(&self, key: &str, value: &str) -> Result<()> {
        self.write()?
            .meta
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn collections(&self) -> Result<Vec<Collection>> {
        let inner = self.read()?;
        let names: BTreeSet<Collection> = inner
            .records
            .keys()
            .chain(inner.conflicts.keys())
            .map(|(c, _)| c.clone())
            .collect();
        Ok(names.into_iter().collect())
    }

    fn clear(&self, collection: &Collection) -> Result<()> {
        let mut inner = self.write()?;
        inner.records.retain(|(c, _), _| c != collection);
        inner.conflicts.retain(|(c, _), _| c != collection);
        inner.queue.retain(|_, r| &r.collection != collection);
        Ok(())
    }

    fn import(&self, snapshot: &CollectionSnapshot) -> Result<()> {
        snapshot.validate_for(&snapshot.collection)?;
        let collection = &snapshot.collection;

        let mut inner = self.write()?;
        inner.records.retain(|(c, _), _| c != collection);
        inner.conflicts.retain(|(c, _), _| c != collection);
        for record in &snapshot.records {
            inner
                .records
                .insert(key(&record.collection, &record.id), record.clone());
        }
        for item in &snapshot.conflicts {
            inner
                .conflicts
                .insert(key(&item.collection, &item.id), item.clone());
        }
        Ok(())
    }
}
