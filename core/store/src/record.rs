//! Records, conflicts and queued requests as persisted by the store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use harborsync_common::{
    Collection, ConflictStrategy, Error, Method, Priority, ResourceId, Result, Revision,
};

/// Sync status of a cached record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncState {
    /// Record matches the last acknowledged server state.
    Synced,
    /// A local write has not been acknowledged yet.
    Pending,
    /// Local and server state diverged and the conflict is unresolved.
    Conflict,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Synced => "synced",
            SyncState::Pending => "pending",
            SyncState::Conflict => "conflict",
        }
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "synced" => Ok(SyncState::Synced),
            "pending" => Ok(SyncState::Pending),
            "conflict" => Ok(SyncState::Conflict),
            other => Err(Error::Storage(format!("Unknown sync state: {}", other))),
        }
    }
}

/// Cached domain entity plus sync metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub collection: Collection,
    pub id: ResourceId,
    /// Last known local value.
    pub data: Value,
    /// Local modification time.
    pub last_modified: DateTime<Utc>,
    /// Server revision this record was last reconciled with.
    pub revision: Option<Revision>,
    pub sync_state: SyncState,
    /// Deleted locally, delete not yet acknowledged.
    #[serde(default)]
    pub deleted: bool,
}

impl StoredRecord {
    /// Create a record for an optimistic local write.
    pub fn new_local(collection: Collection, id: ResourceId, data: Value) -> Self {
        Self {
            collection,
            id,
            data,
            last_modified: Utc::now(),
            revision: None,
            sync_state: SyncState::Pending,
            deleted: false,
        }
    }

    /// Create a record pulled from the backend.
    pub fn new_synced(
        collection: Collection,
        id: ResourceId,
        data: Value,
        revision: Option<Revision>,
    ) -> Self {
        Self {
            collection,
            id,
            data,
            last_modified: Utc::now(),
            revision,
            sync_state: SyncState::Synced,
            deleted: false,
        }
    }

    /// Apply a local write.
    pub fn mark_local_modified(&mut self, data: Value) {
        self.data = data;
        self.deleted = false;
        self.last_modified = Utc::now();
        self.sync_state = SyncState::Pending;
    }

    /// Apply a local delete; the record stays as a tombstone until acknowledged.
    pub fn mark_deleted(&mut self) {
        self.deleted = true;
        self.last_modified = Utc::now();
        self.sync_state = SyncState::Pending;
    }

    /// Mark as acknowledged by the backend.
    ///
    /// `data` replaces the local value when the backend returned a canonical body.
    pub fn mark_synced(&mut self, revision: Option<Revision>, data: Option<Value>) {
        if let Some(data) = data {
            self.data = data;
        }
        self.revision = revision;
        self.sync_state = SyncState::Synced;
    }

    pub fn mark_conflicted(&mut self) {
        self.sync_state = SyncState::Conflict;
    }

    /// Drop the known revision so the next pull overwrites the local value.
    pub fn mark_stale(&mut self) {
        self.revision = None;
        self.deleted = false;
        self.sync_state = SyncState::Synced;
    }

    /// Serialized size of the record data in bytes.
    pub fn size_bytes(&self) -> u64 {
        serde_json::to_vec(&self.data)
            .map(|bytes| bytes.len() as u64)
            .unwrap_or(0)
    }
}

/// A detected divergence awaiting resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictItem {
    pub collection: Collection,
    /// Matches the id of the record it shadows.
    pub id: ResourceId,
    pub local_data: Value,
    /// Server value, populated lazily.
    pub server_data: Option<Value>,
    pub server_revision: Option<Revision>,
    /// Local modification time of the conflicting write.
    pub last_modified: DateTime<Utc>,
    /// Strategy in effect when the conflict was detected.
    pub strategy: ConflictStrategy,
    pub detected_at: DateTime<Utc>,
    /// Queued request held back by this conflict.
    pub request_id: Option<String>,
}

impl ConflictItem {
    pub fn from_record(record: &StoredRecord, strategy: ConflictStrategy) -> Self {
        Self {
            collection: record.collection.clone(),
            id: record.id.clone(),
            local_data: record.data.clone(),
            server_data: None,
            server_revision: None,
            last_modified: record.last_modified,
            strategy,
            detected_at: Utc::now(),
            request_id: None,
        }
    }

    pub fn with_server(mut self, data: Option<Value>, revision: Option<Revision>) -> Self {
        self.server_data = data;
        self.server_revision = revision;
        self
    }

    pub fn with_request(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }
}

/// Per-collection counts derived from the stored records.
///
/// A view, never persisted: `total == pending + synced + conflicts` holds by
/// construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageStats {
    pub total: usize,
    pub pending: usize,
    pub synced: usize,
    pub conflicts: usize,
    /// Serialized size of all record data in bytes.
    pub total_size: u64,
}

impl StorageStats {
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a StoredRecord>) -> Self {
        let mut stats = Self::default();
        for record in records {
            stats.total += 1;
            stats.total_size += record.size_bytes();
            match record.sync_state {
                SyncState::Synced => stats.synced += 1,
                SyncState::Pending => stats.pending += 1,
                SyncState::Conflict => stats.conflicts += 1,
            }
        }
        stats
    }

    pub fn is_consistent(&self) -> bool {
        self.total == self.pending + self.synced + self.conflicts
    }
}

/// Serialized snapshot of one collection, used for backup and restore.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionSnapshot {
    pub format: u32,
    pub collection: Collection,
    pub exported_at: DateTime<Utc>,
    pub records: Vec<StoredRecord>,
    pub conflicts: Vec<ConflictItem>,
}

impl CollectionSnapshot {
    pub const FORMAT: u32 = 1;

    pub fn new(
        collection: Collection,
        records: Vec<StoredRecord>,
        conflicts: Vec<ConflictItem>,
    ) -> Self {
        Self {
            format: Self::FORMAT,
            collection,
            exported_at: Utc::now(),
            records,
            conflicts,
        }
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize from JSON, checking the format version.
    pub fn from_json(json: &str) -> Result<Self> {
        let snapshot: Self =
            serde_json::from_str(json).map_err(|e| Error::Serialization(e.to_string()))?;
        if snapshot.format != Self::FORMAT {
            return Err(Error::InvalidInput(format!(
                "Unsupported snapshot format {}",
                snapshot.format
            )));
        }
        Ok(snapshot)
    }

    /// Check that every entry belongs to the snapshot's collection.
    pub fn validate_for(&self, collection: &Collection) -> Result<()> {
        let foreign = self
            .records
            .iter()
            .map(|r| &r.collection)
            .chain(self.conflicts.iter().map(|c| &c.collection))
            .any(|c| c != collection);
        if &self.collection != collection || foreign {
            return Err(Error::InvalidInput(format!(
                "Snapshot does not belong to collection {}",
                collection
            )));
        }
        Ok(())
    }
}

/// Lifecycle of a queued request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RequestStatus {
    Queued,
    InFlight,
    /// Waiting out a backoff delay after a transient failure.
    RetryScheduled,
    /// Gave up; waits for the user to retry or discard it.
    Failed,
    /// Held back by an unresolved manual conflict.
    Conflict,
}

/// One pending mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedRequest {
    /// Stable across retries.
    pub id: String,
    pub collection: Collection,
    pub resource_id: ResourceId,
    pub method: Method,
    pub body: Option<Value>,
    pub priority: Priority,
    /// Creation time, immutable.
    pub timestamp: DateTime<Utc>,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Conflict overwrites sent so far; separate from `retry_count`.
    #[serde(default)]
    pub force_count: u32,
    pub status: RequestStatus,
    /// Server revision the change was derived from (sent as `If-Match`).
    pub base_revision: Option<Revision>,
    /// Not eligible for dispatch before this time.
    pub not_before: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Position within the priority tier; moves to the tail on retry.
    pub seq: u64,
    /// Creation order; fixes per-resource ordering.
    pub order: u64,
}

impl QueuedRequest {
    /// Backend path of the target resource.
    pub fn url(&self) -> String {
        format!("/{}/{}", self.collection, self.resource_id)
    }

    /// Whether the request may be dispatched at `now`.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            RequestStatus::Queued => true,
            RequestStatus::RetryScheduled => self.not_before.map_or(true, |t| t <= now),
            _ => false,
        }
    }

    pub fn targets(&self, collection: &Collection, id: &ResourceId) -> bool {
        &self.collection == collection && &self.resource_id == id
    }
}
