//! Sync pass bookkeeping: the in-progress flag and last-sync times.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::warn;

use harborsync_common::{Collection, Error, Result};
use harborsync_store::RecordStore;

use crate::queue::{PriorityCounts, QueueCounts};

const LAST_SYNC_PREFIX: &str = "last_sync:";

/// Queue summary shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatus {
    pub total: usize,
    pub by_priority: PriorityCounts,
    pub failed: usize,
    pub conflicts: usize,
    pub sync_in_progress: bool,
    /// Most recent successful sync of any collection.
    pub last_sync: Option<DateTime<Utc>>,
}

impl QueueStatus {
    pub fn new(counts: QueueCounts, sync_in_progress: bool, last_sync: Option<DateTime<Utc>>) -> Self {
        Self {
            total: counts.total,
            by_priority: counts.by_priority,
            failed: counts.failed,
            conflicts: counts.conflicts,
            sync_in_progress,
            last_sync,
        }
    }
}

/// Mutual-exclusion flag for sync passes.
///
/// Not a lock: a second pass does not wait, it fails with
/// `Error::SyncInProgress`.
#[derive(Debug, Default)]
pub struct SyncFlag {
    in_progress: Arc<AtomicBool>,
}

impl SyncFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the flag for one pass. Released when the guard drops.
    pub fn try_begin(&self) -> Result<SyncGuard> {
        self.in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| Error::SyncInProgress)?;
        Ok(SyncGuard {
            flag: Arc::clone(&self.in_progress),
        })
    }

    pub fn is_set(&self) -> bool {
        self.in_progress.load(Ordering::SeqCst)
    }
}

/// Held for the duration of a sync pass.
#[derive(Debug)]
pub struct SyncGuard {
    flag: Arc<AtomicBool>,
}

impl Drop for SyncGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// Last successful sync per collection, kept in store metadata.
pub struct LastSync {
    store: Arc<dyn RecordStore>,
}

impl LastSync {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    fn key(collection: &Collection) -> String {
        format!("{}{}", LAST_SYNC_PREFIX, collection)
    }

    pub fn get(&self, collection: &Collection) -> Result<Option<DateTime<Utc>>> {
        let Some(value) = self.store.meta_get(&Self::key(collection))? else {
            return Ok(None);
        };
        match DateTime::parse_from_rfc3339(&value) {
            Ok(time) => Ok(Some(time.with_timezone(&Utc))),
            Err(e) => {
                warn!("Ignoring unreadable last sync time for {}: {}", collection, e);
                Ok(None)
            }
        }
    }

    pub fn record(&self, collection: &Collection, at: DateTime<Utc>) -> Result<()> {
        self.store.meta_set(&Self::key(collection), &at.to_rfc3339())
    }

    /// Most recent sync among `collections`.
    pub fn latest<'a>(
        &self,
        collections: impl IntoIterator<Item = &'a Collection>,
    ) -> Result<Option<DateTime<Utc>>> {
        let mut latest = None;
        for collection in collections {
            latest = latest.max(self.get(collection)?);
        }
        Ok(latest)
    }
}
