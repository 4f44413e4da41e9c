//! SQLite-backed record store.
//!
//! Persists records, conflicts, the request queue and small metadata values in
//! a single database file so that queued mutations survive a restart.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use harborsync_common::{Collection, Error, ResourceId, Result, Revision};

use crate::record::{
    CollectionSnapshot, ConflictItem, QueuedRequest, StorageStats, StoredRecord, SyncState,
};
use crate::store::RecordStore;

/// Current schema version
const CURRENT_VERSION: i64 = 1;

fn db_err(err: rusqlite::Error) -> Error {
    Error::Storage(err.to_string())
}

/// Record store using SQLite.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Create or open a store database.
    ///
    /// # Errors
    /// - Database creation or migration failure
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| Error::Storage(e.to_string()))?;
            }
        }

        let conn = Connection::open(db_path).map_err(db_err)?;
        let store = Self::from_connection(conn)?;
        info!("Record store opened at {}", db_path.display());
        Ok(store)
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory().map_err(db_err)?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA synchronous = FULL;")
            .map_err(db_err)?;
        migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Storage("connection lock poisoned".to_string()))
    }
}

/// Run all pending migrations
fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY);",
    )
    .map_err(db_err)?;

    let version: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .map_err(db_err)?;

    if version > CURRENT_VERSION {
        return Err(Error::Storage(format!(
            "Database schema version {} is newer than supported {}",
            version, CURRENT_VERSION
        )));
    }

    if version < 1 {
        migrate_v1(conn)?;
    }

    Ok(())
}

/// Migration to version 1: Initial schema
fn migrate_v1(conn: &Connection) -> Result<()> {
    debug!("Applying store migration v1");
    conn.execute_batch(
        r#"
        BEGIN;

        CREATE TABLE IF NOT EXISTS records (
            collection TEXT NOT NULL,
            id TEXT NOT NULL,
            data TEXT NOT NULL,
            last_modified TEXT NOT NULL,
            revision INTEGER,
            sync_state TEXT NOT NULL,
            deleted INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (collection, id)
        );

        CREATE INDEX IF NOT EXISTS idx_records_state ON records(collection, sync_state);

        CREATE TABLE IF NOT EXISTS conflicts (
            collection TEXT NOT NULL,
            id TEXT NOT NULL,
            payload TEXT NOT NULL,
            PRIMARY KEY (collection, id)
        );

        CREATE TABLE IF NOT EXISTS queue (
            id TEXT PRIMARY KEY,
            collection TEXT NOT NULL,
            payload TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        INSERT INTO schema_version (version) VALUES (1);

        COMMIT;
        "#,
    )
    .map_err(db_err)
}

fn parse_time(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::Storage(format!("Invalid timestamp {}: {}", value, e)))
}

/// Raw column values of a `records` row.
struct RecordRow {
    collection: String,
    id: String,
    data: String,
    last_modified: String,
    revision: Option<i64>,
    sync_state: String,
    deleted: bool,
}

impl RecordRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            collection: row.get(0)?,
            id: row.get(1)?,
            data: row.get(2)?,
            last_modified: row.get(3)?,
            revision: row.get(4)?,
            sync_state: row.get(5)?,
            deleted: row.get::<_, i64>(6)? != 0,
        })
    }

    fn into_record(self) -> Result<StoredRecord> {
        let corrupt = |e: Error| Error::Storage(format!("Corrupt record row: {}", e));
        Ok(StoredRecord {
            collection: Collection::new(self.collection).map_err(corrupt)?,
            id: ResourceId::new(self.id).map_err(corrupt)?,
            data: serde_json::from_str(&self.data)
                .map_err(|e| Error::Storage(format!("Corrupt record data: {}", e)))?,
            last_modified: parse_time(&self.last_modified)?,
            revision: self.revision.map(|r| Revision(r as u64)),
            sync_state: self.sync_state.parse::<SyncState>()?,
            deleted: self.deleted,
        })
    }
}

const RECORD_COLUMNS: &str =
    "collection, id, data, last_modified, revision, sync_state, deleted";

fn decode_payload<T: serde::de::DeserializeOwned>(payload: &str) -> Result<T> {
    serde_json::from_str(payload).map_err(|e| Error::Storage(format!("Corrupt payload: {}", e)))
}

fn insert_record(conn: &Connection, record: &StoredRecord) -> Result<()> {
    let data = serde_json::to_string(&record.data)?;
    conn.execute(
        r#"
        INSERT OR REPLACE INTO records
        (collection, id, data, last_modified, revision, sync_state, deleted)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        "#,
        params![
            record.collection.as_str(),
            record.id.as_str(),
            data,
            record.last_modified.to_rfc3339(),
            record.revision.map(|r| r.0 as i64),
            record.sync_state.as_str(),
            record.deleted as i64,
        ],
    )
    .map_err(db_err)?;
    Ok(())
}

fn insert_conflict(conn: &Connection, item: &ConflictItem) -> Result<()> {
    let payload = serde_json::to_string(item)?;
    conn.execute(
        "INSERT OR REPLACE INTO conflicts (collection, id, payload) VALUES (?1, ?2, ?3)",
        params![item.collection.as_str(), item.id.as_str(), payload],
    )
    .map_err(db_err)?;
    Ok(())
}

impl RecordStore for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    fn get_record(&self, collection: &Collection, id: &ResourceId) -> Result<Option<StoredRecord>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!(
                    "SELECT {} FROM records WHERE collection = ?1 AND id = ?2",
                    RECORD_COLUMNS
                ),
                params![collection.as_str(), id.as_str()],
                RecordRow::from_row,
            )
            .optional()
            .map_err(db_err)?;
        row.map(RecordRow::into_record).transpose()
    }

    fn put_record(&self, record: &StoredRecord) -> Result<()> {
        debug!("Upserting record {}/{}", record.collection, record.id);
        insert_record(&*self.conn()?, record)
    }

    fn remove_record(&self, collection: &Collection, id: &ResourceId) -> Result<bool> {
        let changed = self
            .conn()?
            .execute(
                "DELETE FROM records WHERE collection = ?1 AND id = ?2",
                params![collection.as_str(), id.as_str()],
            )
            .map_err(db_err)?;
        Ok(changed > 0)
    }

    fn list_records(&self, collection: &Collection) -> Result<Vec<StoredRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM records WHERE collection = ?1 ORDER BY id",
                RECORD_COLUMNS
            ))
            .map_err(db_err)?;
        let rows = stmt
            .query_map([collection.as_str()], RecordRow::from_row)
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err)?;
        rows.into_iter().map(RecordRow::into_record).collect()
    }

    fn get_conflict(
        &self,
        collection: &Collection,
        id: &ResourceId,
    ) -> Result<Option<ConflictItem>> {
        let payload: Option<String> = self
            .conn()?
            .query_row(
                "SELECT payload FROM conflicts WHERE collection = ?1 AND id = ?2",
                params![collection.as_str(), id.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        payload.as_deref().map(decode_payload).transpose()
    }

    fn put_conflict(&self, item: &ConflictItem) -> Result<()> {
        insert_conflict(&*self.conn()?, item)
    }

    fn remove_conflict(&self, collection: &Collection, id: &ResourceId) -> Result<bool> {
        let changed = self
            .conn()?
            .execute(
                "DELETE FROM conflicts WHERE collection = ?1 AND id = ?2",
                params![collection.as_str(), id.as_str()],
            )
            .map_err(db_err)?;
        Ok(changed > 0)
    }

    fn list_conflicts(&self, collection: &Collection) -> Result<Vec<ConflictItem>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT payload FROM conflicts WHERE collection = ?1 ORDER BY id")
            .map_err(db_err)?;
        let payloads = stmt
            .query_map([collection.as_str()], |row| row.get::<_, String>(0))
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err)?;
        payloads.iter().map(|p| decode_payload(p)).collect()
    }

    fn queue_load(&self) -> Result<Vec<QueuedRequest>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT payload FROM queue").map_err(db_err)?;
        let payloads = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err)?;
        payloads.iter().map(|p| decode_payload(p)).collect()
    }

    fn queue_put(&self, request: &QueuedRequest) -> Result<()> {
        let payload = serde_json::to_string(request)?;
        self.conn()?
            .execute(
                "INSERT OR REPLACE INTO queue (id, collection, payload) VALUES (?1, ?2, ?3)",
                params![request.id, request.collection.as_str(), payload],
            )
            .map_err(db_err)?;
        Ok(())
    }

    fn queue_remove(&self, id: &str) -> Result<bool> {
        let changed = self
            .conn()?
            .execute("DELETE FROM queue WHERE id = ?1", [id])
            .map_err(db_err)?;
        Ok(changed > 0)
    }

    fn meta_get(&self, key: &str) -> Result<Option<String>> {
        self.conn()?
            .query_row("SELECT value FROM meta WHERE key = ?1", [key], |row| {
                row.get(0)
            })
            .optional()
            .map_err(db_err)
    }

    fn meta_set(&self, key: &str, value: &str) -> Result<()> {
        self.conn()?
            .execute(
                "INSERT OR REPLACE INTO meta (key, value) VALUES (?1, ?2)",
                params![key, value],
            )
            .map_err(db_err)?;
        Ok(())
    }

    fn collections(&self) -> Result<Vec<Collection>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT collection FROM records UNION SELECT collection FROM conflicts ORDER BY 1",
            )
            .map_err(db_err)?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err)?;
        names
            .into_iter()
            .map(|n| Collection::new(n).map_err(|e| Error::Storage(e.to_string())))
            .collect()
    }

    fn clear(&self, collection: &Collection) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(db_err)?;
        for table in ["records", "conflicts", "queue"] {
            tx.execute(
                &format!("DELETE FROM {} WHERE collection = ?1", table),
                [collection.as_str()],
            )
            .map_err(db_err)?;
        }
        tx.commit().map_err(db_err)?;
        info!("Cleared collection {}", collection);
        Ok(())
    }

    fn import(&self, snapshot: &CollectionSnapshot) -> Result<()> {
        snapshot.validate_for(&snapshot.collection)?;
        let collection = snapshot.collection.as_str();

        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(db_err)?;
        tx.execute("DELETE FROM records WHERE collection = ?1", [collection])
            .map_err(db_err)?;
        tx.execute("DELETE FROM conflicts WHERE collection = ?1", [collection])
            .map_err(db_err)?;
        for record in &snapshot.records {
            insert_record(&tx, record)?;
        }
        for item in &snapshot.conflicts {
            insert_conflict(&tx, item)?;
        }
        tx.commit().map_err(db_err)?;

        info!(
            "Imported {} records and {} conflicts into {}",
            snapshot.records.len(),
            snapshot.conflicts.len(),
            collection
        );
        Ok(())
    }

    fn stats(&self, collection: &Collection) -> Result<StorageStats> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                r#"
                SELECT sync_state, COUNT(*), COALESCE(SUM(LENGTH(CAST(data AS BLOB))), 0)
                FROM records WHERE collection = ?1 GROUP BY sync_state
                "#,
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map([collection.as_str()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err)?;

        let mut stats = StorageStats::default();
        for (state, count, size) in rows {
            let count = count as usize;
            stats.total += count;
            stats.total_size += size as u64;
            match state.parse::<SyncState>()? {
                SyncState::Synced => stats.synced += count,
                SyncState::Pending => stats.pending += count,
                SyncState::Conflict => stats.conflicts += count,
            }
        }
        Ok(stats)
    }
}
