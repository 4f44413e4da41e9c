//! Store wrapper that falls back to a read-only in-memory copy.
//!
//! When the durable backend reports a storage failure the wrapper switches,
//! once and for good, to a [`MemoryStore`] seeded with whatever could still be
//! read. Reads keep working; writes fail with `Error::ReadOnly`.

use std::path::Path;
use std::sync::{Arc, RwLock};
use tracing::{error, warn};

use harborsync_common::{Collection, Error, ResourceId, Result};

use crate::memory::MemoryStore;
use crate::record::{CollectionSnapshot, ConflictItem, QueuedRequest, StorageStats, StoredRecord};
use crate::sqlite::SqliteStore;
use crate::store::RecordStore;

/// Callback invoked once when the store degrades, with the reason.
pub type DegradedHook = Box<dyn Fn(&str) + Send + Sync>;

struct Degraded {
    store: Arc<MemoryStore>,
    reason: String,
}

/// Record store that survives failure of its durable backend.
pub struct ResilientStore {
    primary: Option<Box<dyn RecordStore>>,
    degraded: RwLock<Option<Degraded>>,
    hook: RwLock<Option<DegradedHook>>,
}

impl ResilientStore {
    /// Wrap a durable store.
    pub fn new(primary: Box<dyn RecordStore>) -> Self {
        Self {
            primary: Some(primary),
            degraded: RwLock::new(None),
            hook: RwLock::new(None),
        }
    }

    /// Open a SQLite store at `path`, degrading immediately if that fails.
    pub fn open(path: impl AsRef<Path>) -> Self {
        match SqliteStore::open(path.as_ref()) {
            Ok(store) => Self::new(Box::new(store)),
            Err(e) => {
                error!(
                    "Failed to open store at {}: {}",
                    path.as_ref().display(),
                    e
                );
                let reason = e.to_string();
                Self {
                    primary: None,
                    degraded: RwLock::new(Some(Degraded {
                        store: Arc::new(MemoryStore::read_only(Vec::new(), Vec::new(), &reason)),
                        reason,
                    })),
                    hook: RwLock::new(None),
                }
            }
        }
    }

    /// Register the callback fired when the store degrades.
    pub fn set_degraded_hook(&self, hook: DegradedHook) {
        if let Ok(mut slot) = self.hook.write() {
            *slot = Some(hook);
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded_reason().is_some()
    }

    /// Why the store degraded, if it has.
    pub fn degraded_reason(&self) -> Option<String> {
        self.degraded
            .read()
            .ok()
            .and_then(|d| d.as_ref().map(|d| d.reason.clone()))
    }

    fn fallback(&self) -> Option<Arc<MemoryStore>> {
        self.degraded
            .read()
            .ok()
            .and_then(|d| d.as_ref().map(|d| Arc::clone(&d.store)))
    }

    fn degrade(&self, reason: String) -> Arc<MemoryStore> {
        let store = {
            let mut slot = match self.degraded.write() {
                Ok(slot) => slot,
                Err(poisoned) => poisoned.into_inner(),
            };
            if let Some(existing) = slot.as_ref() {
                return Arc::clone(&existing.store);
            }

            warn!("Storage failure, switching to read-only memory store: {}", reason);
            let store = Arc::new(self.salvage(&reason));
            *slot = Some(Degraded {
                store: Arc::clone(&store),
                reason: reason.clone(),
            });
            store
        };

        if let Ok(hook) = self.hook.read() {
            if let Some(hook) = hook.as_ref() {
                hook(&reason);
            }
        }
        store
    }

    /// Copy whatever the failing backend still returns.
    fn salvage(&self, reason: &str) -> MemoryStore {
        let Some(primary) = self.primary.as_ref() else {
            return MemoryStore::read_only(Vec::new(), Vec::new(), reason);
        };
        let snapshots = primary
            .collections()
            .unwrap_or_default()
            .iter()
            .filter_map(|c| primary.export(c).ok())
            .collect();
        let queue = primary.queue_load().unwrap_or_default();
        MemoryStore::read_only(snapshots, queue, reason)
    }

    fn with<T>(&self, op: impl Fn(&dyn RecordStore) -> Result<T>) -> Result<T> {
        if let Some(fallback) = self.fallback() {
            return op(fallback.as_ref());
        }
        let Some(primary) = self.primary.as_ref() else {
            return Err(Error::Storage("no backing store".to_string()));
        };
        match op(primary.as_ref()) {
            Err(Error::Storage(reason)) => {
                let fallback = self.degrade(reason);
                op(fallback.as_ref())
            }
            other => other,
        }
    }
}

impl RecordStore for ResilientStore {
    fn name(&self) -> &str {
        match (&self.primary, self.is_degraded()) {
            (Some(primary), false) => primary.name(),
            _ => "memory-readonly",
        }
    }

    fn get_record(&self, collection: &Collection, id: &ResourceId) -> Result<Option<StoredRecord>> {
        self.with(|s| s.get_record(collection, id))
    }

    fn put_record(&self, record: &StoredRecord) -> Result<()> {
        self.with(|s| s.put_record(record))
    }

    fn remove_record(&self, collection: &Collection, id: &ResourceId) -> Result<bool> {
        self.with(|s| s.remove_record(collection, id))
    }

    fn list_records(&self, collection: &Collection) -> Result<Vec<StoredRecord>> {
        self.with(|s| s.list_records(collection))
    }

    fn get_conflict(
        &self,
        collection: &Collection,
        id: &ResourceId,
    ) -> Result<Option<ConflictItem>> {
        self.with(|s| s.get_conflict(collection, id))
    }

    fn put_conflict(&self, item: &ConflictItem) -> Result<()> {
        self.with(|s| s.put_conflict(item))
    }

    fn remove_conflict(&self, collection: &Collection, id: &ResourceId) -> Result<bool> {
        self.with(|s| s.remove_conflict(collection, id))
    }

    fn list_conflicts(&self, collection: &Collection) -> Result<Vec<ConflictItem>> {
        self.with(|s| s.list_conflicts(collection))
    }

    fn queue_load(&self) -> Result<Vec<QueuedRequest>> {
        self.with(|s| s.queue_load())
    }

    fn queue_put(&self, request: &QueuedRequest) -> Result<()> {
        self.with(|s| s.queue_put(request))
    }

    fn queue_remove(&self, id: &str) -> Result<bool> {
        self.with(|s| s.queue_remove(id))
    }

    fn meta_get(&self, key: &str) -> Result<Option<String>> {
        self.with(|s| s.meta_get(key))
    }

    fn meta_set(&self, key: &str, value: &str) -> Result<()> {
        self.with(|s| s.meta_set(key, value))
    }

    fn collections(&self) -> Result<Vec<Collection>> {
        self.with(|s| s.collections())
    }

    fn clear(&self, collection: &Collection) -> Result<()> {
        self.with(|s| s.clear(collection))
    }

    fn import(&self, snapshot: &CollectionSnapshot) -> Result<()> {
        self.with(|s| s.import(snapshot))
    }

    fn stats(&self, collection: &Collection) -> Result<StorageStats> {
        self.with(|s| s.stats(collection))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Memory store whose writes start failing on demand.
    struct FlakyStore {
        inner: MemoryStore,
        broken: AtomicBool,
    }

    impl FlakyStore {
        fn check(&self) -> Result<()> {
            if self.broken.load(Ordering::SeqCst) {
                return Err(Error::Storage("disk I/O error".to_string()));
            }
            Ok(())
        }
    }

    impl RecordStore for FlakyStore {
        fn name(&self) -> &str {
            "flaky"
        }
        fn get_record(&self, c: &Collection, id: &ResourceId) -> Result<Option<StoredRecord>> {
            self.inner.get_record(c, id)
        }
        fn put_record(&self, record: &StoredRecord) -> Result<()> {
            self.check()?;
            self.inner.put_record(record)
        }
        fn remove_record(&self, c: &Collection, id: &ResourceId) -> Result<bool> {
            self.check()?;
            self.inner.remove_record(c, id)
        }
        fn list_records(&self, c: &Collection) -> Result<Vec<StoredRecord>> {
            self.inner.list_records(c)
        }
        fn get_conflict(&self, c: &Collection, id: &ResourceId) -> Result<Option<ConflictItem>> {
            self.inner.get_conflict(c, id)
        }
        fn put_conflict(&self, item: &ConflictItem) -> Result<()> {
            self.check()?;
            self.inner.put_conflict(item)
        }
        fn remove_conflict(&self, c: &Collection, id: &ResourceId) -> Result<bool> {
            self.check()?;
            self.inner.remove_conflict(c, id)
        }
        fn list_conflicts(&self, c: &Collection) -> Result<Vec<ConflictItem>> {
            self.inner.list_conflicts(c)
        }
        fn queue_load(&self) -> Result<Vec<QueuedRequest>> {
            self.inner.queue_load()
        }
        fn queue_put(&self, request: &QueuedRequest) -> Result<()> {
            self.check()?;
            self.inner.queue_put(request)
        }
        fn queue_remove(&self, id: &str) -> Result<bool> {
            self.check()?;
            self.inner.queue_remove(id)
        }
        fn meta_get(&self, key: &str) -> Result<Option<String>> {
            self.inner.meta_get(key)
        }
        fn meta_set(&self, key: &str, value: &str) -> Result<()> {
            self.check()?;
            self.inner.meta_set(key, value)
        }
        fn collections(&self) -> Result<Vec<Collection>> {
            self.inner.collections()
        }
        fn clear(&self, c: &Collection) -> Result<()> {
            self.check()?;
            self.inner.clear(c)
        }
        fn import(&self, snapshot: &CollectionSnapshot) -> Result<()> {
            self.check()?;
            self.inner.import(snapshot)
        }
    }

    fn id(s: &str) -> ResourceId {
        ResourceId::new(s).unwrap()
    }

    #[test]
    fn test_degrades_on_storage_failure() {
        let flaky = FlakyStore {
            inner: MemoryStore::new(),
            broken: AtomicBool::new(false),
        };
        let record = StoredRecord::new_synced(Collection::containers(), id("web"), json!(1), None);
        flaky.put_record(&record).unwrap();
        flaky.broken.store(true, Ordering::SeqCst);

        let store = ResilientStore::new(Box::new(flaky));
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        store.set_degraded_hook(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let err = store
            .put_record(&StoredRecord::new_local(Collection::containers(), id("db"), json!(2)))
            .unwrap_err();
        assert!(matches!(err, Error::ReadOnly(_)));
        assert!(store.is_degraded());
        assert_eq!(store.name(), "memory-readonly");

        // Salvaged data stays readable.
        assert_eq!(
            store.get_record(&Collection::containers(), &id("web")).unwrap(),
            Some(record)
        );

        // Hook fires once.
        let _ = store.meta_set("k", "v");
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_healthy_store_passes_through() {
        let temp = TempDir::new().unwrap();
        let store = ResilientStore::open(temp.path().join("store.db"));
        assert!(!store.is_degraded());
        assert_eq!(store.name(), "sqlite");

        store
            .put_record(&StoredRecord::new_local(Collection::services(), id("api"), json!({})))
            .unwrap();
        assert_eq!(store.stats(&Collection::services()).unwrap().pending, 1);
    }

    #[test]
    fn test_open_failure_starts_degraded() {
        let temp = TempDir::new().unwrap();
        // A directory cannot be opened as a database file.
        let store = ResilientStore::open(temp.path());
        assert!(store.is_degraded());
        assert!(store.degraded_reason().is_some());
        assert!(store.list_records(&Collection::containers()).unwrap().is_empty());
    }
}
