//! Core sync engine that orchestrates all sync operations.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use harborsync_common::json::merge_patch;
use harborsync_common::{
    Collection, ConflictStrategy, Error, ErrorClass, Method, ResourceId, Result,
};
use harborsync_store::{
    CollectionSnapshot, ConflictItem, QueuedRequest, RecordStore, RequestStatus, StorageStats,
    StoredRecord, SyncState,
};
use harborsync_transport::{ApiRequest, ApiResponse, RemoteItem, Transport};

use crate::config::SyncConfig;
use crate::conflict::{compare, is_replay, LocalVersion, Resolution, VersionOrdering};
use crate::events::{EventBus, SyncEvent};
use crate::network::NetworkMonitor;
use crate::queue::{NewRequest, RequestQueue};
use crate::report::{CollectionResult, SyncAllReport, SyncScope};
use crate::scheduler::SyncRequest;
use crate::state::{LastSync, QueueStatus, SyncFlag};

/// Callback fired after a local change is queued. Must not block.
pub type ChangeHook = Arc<dyn Fn() + Send + Sync>;

type Results = BTreeMap<Collection, CollectionResult>;

/// Main sync engine.
///
/// Owns the request queue and drives it against the backend, one request at
/// a time. The queue lock is never held across a transport call.
pub struct SyncEngine<T: Transport + ?Sized = dyn Transport> {
    /// Backend.
    transport: Arc<T>,
    /// Local records, conflicts and the queue table.
    store: Arc<dyn RecordStore>,
    queue: RwLock<RequestQueue>,
    events: Arc<EventBus>,
    network: Arc<NetworkMonitor>,
    flag: SyncFlag,
    last_sync: LastSync,
    change_hook: StdRwLock<Option<ChangeHook>>,
    config: SyncConfig,
}

impl<T: Transport + ?Sized> SyncEngine<T> {
    /// Create an engine over a store, restoring the persisted queue.
    pub fn new(transport: Arc<T>, store: Arc<dyn RecordStore>, config: SyncConfig) -> Result<Self> {
        config.validate()?;
        let events = Arc::new(EventBus::default());
        let network = Arc::new(NetworkMonitor::new(
            true,
            config.network.debounce,
            Arc::clone(&events),
        ));
        let queue = RequestQueue::load(Arc::clone(&store), config.max_retries)?;

        info!(
            "Sync engine ready ({} store, {} transport, {} queued)",
            store.name(),
            transport.name(),
            queue.len()
        );

        Ok(Self {
            transport,
            last_sync: LastSync::new(Arc::clone(&store)),
            store,
            queue: RwLock::new(queue),
            events,
            network,
            flag: SyncFlag::new(),
            change_hook: StdRwLock::new(None),
            config,
        })
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn network(&self) -> &Arc<NetworkMonitor> {
        &self.network
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Register the callback fired after every queued change.
    pub fn set_change_hook(&self, hook: Option<ChangeHook>) {
        match self.change_hook.write() {
            Ok(mut slot) => *slot = hook,
            Err(poisoned) => *poisoned.into_inner() = hook,
        }
    }

    fn notify_change(&self) {
        let hook = match self.change_hook.read() {
            Ok(slot) => slot.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        if let Some(hook) = hook {
            hook();
        }
    }

    // ---- queries ----

    /// Whether the backend is considered reachable.
    pub fn network_status(&self) -> bool {
        self.network.is_online()
    }

    pub async fn queue_status(&self) -> Result<QueueStatus> {
        let counts = self.queue.read().await.counts();
        Ok(QueueStatus::new(
            counts,
            self.flag.is_set(),
            self.last_sync.latest(&self.config.collections)?,
        ))
    }

    /// Time since the last successful sync of `collection`, or of any
    /// configured collection. `None` if it never synced.
    pub fn data_age(&self, collection: Option<&Collection>) -> Result<Option<chrono::Duration>> {
        let last = match collection {
            Some(collection) => self.last_sync.get(collection)?,
            None => self.last_sync.latest(&self.config.collections)?,
        };
        Ok(last.map(|at| Utc::now() - at))
    }

    /// Queued requests in dispatch order.
    pub async fn queued_requests(&self) -> Vec<QueuedRequest> {
        self.queue.read().await.queued_requests()
    }

    pub fn storage_stats(&self, collection: &Collection) -> Result<StorageStats> {
        self.store.stats(collection)
    }

    pub fn conflict_items(&self, collection: &Collection) -> Result<Vec<ConflictItem>> {
        self.store.list_conflicts(collection)
    }

    pub fn record(&self, collection: &Collection, id: &ResourceId) -> Result<Option<StoredRecord>> {
        self.store.get_record(collection, id)
    }

    pub fn records(&self, collection: &Collection) -> Result<Vec<StoredRecord>> {
        self.store.list_records(collection)
    }

    // ---- local changes ----

    /// Apply a change locally and queue it for the backend.
    ///
    /// Never touches the network. A write to a resource held by a manual
    /// conflict supersedes the conflict and is based on the server revision
    /// recorded in it.
    pub async fn submit(&self, new: NewRequest) -> Result<QueuedRequest> {
        if new.method != Method::Delete && new.body.is_none() {
            return Err(Error::InvalidInput(format!(
                "{} requires a body",
                new.method
            )));
        }
        let collection = new.collection.clone();
        let id = new.resource_id.clone();

        let mut queue = self.queue.write().await;
        let existing = self.store.get_record(&collection, &id)?;
        let conflict = self.store.get_conflict(&collection, &id)?;

        let mut base = existing.as_ref().and_then(|r| r.revision);
        if let Some(conflict) = &conflict {
            for held in queue.requests_for(&collection, &id) {
                if held.status == RequestStatus::Conflict {
                    queue.discard(&held.id)?;
                }
            }
            queue.rebase_resource(&collection, &id, conflict.server_revision)?;
            base = conflict.server_revision;
        }

        let mut record = apply_local(existing, &new);
        record.revision = base;

        let request = queue.enqueue(new.with_base_revision(base))?;
        if let Err(e) = self.store.put_record(&record) {
            if let Err(undo) = queue.discard(&request.id) {
                error!("Failed to drop request {} after write failure: {}", request.id, undo);
            }
            return Err(e);
        }

        let superseded = conflict.is_some() && self.store.remove_conflict(&collection, &id)?;
        drop(queue);

        if superseded {
            info!("Local change to {}/{} supersedes its conflict", collection, id);
            self.events.emit(SyncEvent::ConflictResolved {
                collection,
                id,
            });
        }
        self.events.emit(SyncEvent::RequestQueued {
            status: request.status,
            request: request.clone(),
        });
        self.notify_change();
        Ok(request)
    }

    // ---- sync passes ----

    /// Drain the queue of every collection, without pulling.
    pub async fn process_pending_requests(&self) -> Result<SyncAllReport> {
        let _guard = self.flag.try_begin()?;
        let start = Instant::now();
        let scope = SyncScope::Pending;
        self.events.emit(SyncEvent::SyncStarted {
            scope: scope.clone(),
        });
        info!("Processing pending requests");

        let mut results: Results = self
            .queue
            .read()
            .await
            .dispatchable(None)
            .into_iter()
            .map(|c| (c.clone(), CollectionResult::new(c)))
            .collect();

        if let Err(e) = self.drain(None, self.config.default_strategy, &mut results).await {
            warn!("Processing pending requests stopped: {}", e);
            for result in results.values_mut() {
                result.error = Some(e.to_string());
            }
        }
        for result in results.values_mut() {
            result.finish();
        }

        self.finish_pass(scope, &results);
        Ok(SyncAllReport::new(results, start.elapsed()))
    }

    /// Sync every configured collection in one pass.
    pub async fn sync_all(&self, strategy: Option<ConflictStrategy>) -> Result<SyncAllReport> {
        let _guard = self.flag.try_begin()?;
        let start = Instant::now();
        let strategy = strategy.unwrap_or(self.config.default_strategy);
        let scope = SyncScope::All;
        self.events.emit(SyncEvent::SyncStarted {
            scope: scope.clone(),
        });
        info!("Starting sync of all collections ({})", strategy);

        let mut results = Results::new();
        for collection in &self.config.collections {
            let result = self.collection_pass(collection, strategy).await;
            results.insert(collection.clone(), result);
        }

        self.finish_pass(scope, &results);
        let report = SyncAllReport::new(results, start.elapsed());
        info!(
            "Sync finished in {:?}: {:?}, {} processed, {} failed, {} conflicts",
            report.duration,
            report.outcome,
            report.processed(),
            report.failed(),
            report.conflicts()
        );
        Ok(report)
    }

    /// Drain one collection's queue, then refresh it from the backend.
    pub async fn sync_collection(
        &self,
        collection: &Collection,
        strategy: Option<ConflictStrategy>,
    ) -> Result<CollectionResult> {
        let _guard = self.flag.try_begin()?;
        let strategy = strategy.unwrap_or(self.config.default_strategy);
        let scope = SyncScope::Collection(collection.clone());
        self.events.emit(SyncEvent::SyncStarted {
            scope: scope.clone(),
        });

        let result = self.collection_pass(collection, strategy).await;
        let results = BTreeMap::from([(collection.clone(), result.clone())]);
        self.finish_pass(scope, &results);
        Ok(result)
    }

    pub async fn sync_containers(&self, strategy: Option<ConflictStrategy>) -> Result<CollectionResult> {
        self.sync_collection(&Collection::containers(), strategy).await
    }

    pub async fn sync_services(&self, strategy: Option<ConflictStrategy>) -> Result<CollectionResult> {
        self.sync_collection(&Collection::services(), strategy).await
    }

    /// Run a scheduler request.
    ///
    /// The report carries the time of the next backed-off retry so the
    /// scheduler can come back for it.
    pub async fn run_request(&self, request: SyncRequest) -> Result<SyncAllReport> {
        let report = match request {
            SyncRequest::All(strategy) => self.sync_all(strategy).await,
            SyncRequest::Collection(collection, strategy) => {
                let start = Instant::now();
                let result = self.sync_collection(&collection, strategy).await?;
                Ok(SyncAllReport::new(
                    BTreeMap::from([(collection, result)]),
                    start.elapsed(),
                ))
            }
            SyncRequest::Pending => self.process_pending_requests().await,
            SyncRequest::Shutdown => Err(Error::InvalidInput(
                "Shutdown is not a sync request".to_string(),
            )),
        }?;
        Ok(report.with_next_retry(self.next_retry().await))
    }

    /// Earliest time a backed-off request becomes eligible, if any waits.
    pub async fn next_retry(&self) -> Option<DateTime<Utc>> {
        self.queue.read().await.next_wakeup(None)
    }

    fn finish_pass(&self, scope: SyncScope, results: &Results) {
        match results.values().find_map(|r| r.error.clone()) {
            Some(error) => self.events.emit(SyncEvent::SyncFailed {
                scope,
                error,
                results: results.clone(),
            }),
            None => self.events.emit(SyncEvent::SyncCompleted {
                scope,
                results: results.clone(),
            }),
        }
    }

    async fn collection_pass(&self, collection: &Collection, strategy: ConflictStrategy) -> CollectionResult {
        debug!("Syncing {} ({})", collection, strategy);
        let mut results = Results::new();
        results.insert(collection.clone(), CollectionResult::new(collection.clone()));

        let mut outcome = self.drain(Some(collection), strategy, &mut results).await;
        let mut result = results
            .remove(collection)
            .unwrap_or_else(|| CollectionResult::new(collection.clone()));

        if outcome.is_ok() && self.config.pull_on_sync {
            match self.pull(collection).await {
                Ok(pulled) => result.pulled += pulled,
                Err(e) => outcome = Err(e),
            }
        }

        match outcome {
            Ok(()) => {
                if let Err(e) = self.last_sync.record(collection, Utc::now()) {
                    result.error = Some(e.to_string());
                }
            }
            Err(e) => {
                warn!("Sync of {} stopped: {}", collection, e);
                result.error = Some(e.to_string());
            }
        }
        result.finish();
        result
    }

    /// Dispatch requests one at a time until nothing is eligible.
    ///
    /// Returns `Err` when the pass has to stop early: the backend went
    /// offline or local storage failed. Acknowledged requests stay applied.
    async fn drain(
        &self,
        collection: Option<&Collection>,
        strategy: ConflictStrategy,
        results: &mut Results,
    ) -> Result<()> {
        loop {
            if !self.network.is_online() {
                let waiting = !self.queue.read().await.dispatchable(collection).is_empty();
                return if waiting {
                    Err(Error::Offline("backend unreachable".to_string()))
                } else {
                    Ok(())
                };
            }

            let next = self.queue.write().await.dequeue_next(collection, Utc::now())?;
            let Some(request) = next else {
                let wakeup = self.queue.read().await.next_wakeup(collection);
                if let Some(at) = wakeup {
                    let wait = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                    if wait <= self.config.max_inline_backoff {
                        debug!("Waiting {:?} for a backed-off request", wait);
                        tokio::time::sleep(wait).await;
                        continue;
                    }
                    debug!("Next retry in {:?}, leaving it for a later pass", wait);
                }
                return Ok(());
            };

            let result = results
                .entry(request.collection.clone())
                .or_insert_with(|| CollectionResult::new(request.collection.clone()));
            self.dispatch(request, strategy, result).await?;
        }
    }

    async fn dispatch(
        &self,
        request: QueuedRequest,
        strategy: ConflictStrategy,
        result: &mut CollectionResult,
    ) -> Result<()> {
        let api = ApiRequest::new(
            request.method,
            request.collection.clone(),
            Some(request.resource_id.clone()),
        )
        .with_body(request.body.clone())
        .with_if_match(request.base_revision);

        debug!(
            request_id = %request.id,
            "Sending {} {} (attempt {})",
            request.method,
            request.url(),
            request.retry_count + 1
        );

        let response = match self.transport.send(&api).await {
            Ok(response) => response,
            Err(e) => return self.on_transient(&request, e, result).await,
        };

        if request.method == Method::Delete && response.status == 404 {
            return self.on_success(&request, &response, result).await;
        }
        match response.error() {
            None => self.on_success(&request, &response, result).await,
            Some(e) => match e.class() {
                ErrorClass::Transient => self.on_transient(&request, e, result).await,
                ErrorClass::Conflict => self.on_conflict(&request, response, strategy, result).await,
                ErrorClass::Permanent | ErrorClass::Fatal => {
                    self.on_permanent(&request, e, result).await
                }
            },
        }
    }

    async fn on_success(
        &self,
        request: &QueuedRequest,
        response: &ApiResponse,
        result: &mut CollectionResult,
    ) -> Result<()> {
        let collection = &request.collection;
        let id = &request.resource_id;

        let mut queue = self.queue.write().await;
        queue.complete(&request.id)?;
        queue.rebase_resource(collection, id, response.revision)?;
        let still_pending = queue.has_pending_for(collection, id);

        if let Some(mut record) = self.store.get_record(collection, id)? {
            if still_pending {
                record.revision = response.revision;
                self.store.put_record(&record)?;
            } else if request.method == Method::Delete {
                self.store.remove_record(collection, id)?;
            } else {
                let canonical = response.body.clone().filter(|body| !body.is_null());
                record.mark_synced(response.revision, canonical);
                self.store.put_record(&record)?;
            }
        }
        let had_conflict = self.store.remove_conflict(collection, id)?;
        drop(queue);

        debug!(request_id = %request.id, "{} {} acknowledged", request.method, request.url());
        result.processed += 1;
        if had_conflict {
            self.events.emit(SyncEvent::ConflictResolved {
                collection: collection.clone(),
                id: id.clone(),
            });
        }
        Ok(())
    }

    async fn on_transient(
        &self,
        request: &QueuedRequest,
        err: Error,
        result: &mut CollectionResult,
    ) -> Result<()> {
        let unreachable = matches!(err, Error::Network(_));
        warn!(request_id = %request.id, "{} {} failed: {}", request.method, request.url(), err);

        let updated = self.queue.write().await.schedule_retry(
            &request.id,
            err.to_string(),
            &self.config.retry,
            Utc::now(),
        )?;
        if updated.status == RequestStatus::Failed {
            result.failed += 1;
        }
        self.events.emit(SyncEvent::RequestQueued {
            status: updated.status,
            request: updated,
        });

        if unreachable {
            self.network.force(false);
        }
        Ok(())
    }

    async fn on_permanent(
        &self,
        request: &QueuedRequest,
        err: Error,
        result: &mut CollectionResult,
    ) -> Result<()> {
        error!(request_id = %request.id, "{} {} rejected: {}", request.method, request.url(), err);
        let updated = self.queue.write().await.mark_failed(&request.id, err.to_string())?;
        result.failed += 1;
        self.events.emit(SyncEvent::RequestQueued {
            status: updated.status,
            request: updated,
        });
        Ok(())
    }

    async fn on_conflict(
        &self,
        request: &QueuedRequest,
        response: ApiResponse,
        strategy: ConflictStrategy,
        result: &mut CollectionResult,
    ) -> Result<()> {
        let collection = &request.collection;
        let id = &request.resource_id;

        // Only a failed precondition answers with the current resource; any
        // other conflict body may be an error document.
        let (server_data, server_revision) = match (response.status, response.revision, response.body) {
            (412, Some(revision), Some(body)) => (Some(body), Some(revision)),
            _ => match self.transport.fetch(collection, id).await {
                Ok(Some(item)) => (Some(item.data), item.revision),
                Ok(None) => (None, None),
                Err(e) => {
                    warn!("Could not fetch {}/{} after a conflict: {}", collection, id, e);
                    return self.on_transient(request, e, result).await;
                }
            },
        };

        if is_replay(request, server_data.as_ref()) {
            debug!(request_id = %request.id, "Backend already holds {} {}", request.method, request.url());
            let response = ApiResponse {
                status: 200,
                body: server_data,
                revision: server_revision,
            };
            return self.on_success(request, &response, result).await;
        }

        let mut queue = self.queue.write().await;
        let Some(mut record) = self.store.get_record(collection, id)? else {
            // Cleared while the request was in flight.
            queue.complete(&request.id)?;
            return Ok(());
        };

        result.conflicts += 1;
        let item = ConflictItem::from_record(&record, strategy)
            .with_server(server_data.clone(), server_revision)
            .with_request(&request.id);
        info!(
            "Conflict on {}/{} (local base {:?}, server {:?}), applying {}",
            collection, id, request.base_revision, server_revision, strategy
        );

        match strategy {
            ConflictStrategy::ServerWins => {
                queue.discard_resource(collection, id)?;
                match server_data {
                    Some(data) => {
                        self.store.put_record(&StoredRecord::new_synced(
                            collection.clone(),
                            id.clone(),
                            data,
                            server_revision,
                        ))?;
                    }
                    None => {
                        self.store.remove_record(collection, id)?;
                    }
                }
                self.store.remove_conflict(collection, id)?;
                drop(queue);

                self.events.emit(SyncEvent::ConflictDetected { item });
                self.events.emit(SyncEvent::ConflictResolved {
                    collection: collection.clone(),
                    id: id.clone(),
                });
            }
            ConflictStrategy::ClientWins => {
                self.store.put_conflict(&item)?;
                let (method, body) = if record.deleted {
                    (Method::Delete, None)
                } else {
                    (Method::Put, Some(record.data.clone()))
                };
                let forced = queue.force(&request.id, method, body, server_revision)?;
                drop(queue);

                self.events.emit(SyncEvent::ConflictDetected { item });
                if forced.status == RequestStatus::Failed {
                    result.failed += 1;
                    self.events.emit(SyncEvent::RequestQueued {
                        status: forced.status,
                        request: forced,
                    });
                }
            }
            ConflictStrategy::Manual => {
                record.mark_conflicted();
                self.store.put_record(&record)?;
                self.store.put_conflict(&item)?;
                queue.mark_conflict(&request.id, "version conflict")?;
                drop(queue);

                self.events.emit(SyncEvent::ConflictDetected { item });
            }
        }
        Ok(())
    }

    /// Refresh local records from the backend listing.
    ///
    /// Only synced records are overwritten or removed; pending and conflicted
    /// records keep their local value.
    async fn pull(&self, collection: &Collection) -> Result<usize> {
        if !self.network.is_online() {
            return Err(Error::Offline("backend unreachable".to_string()));
        }
        let items = match self.transport.list(collection).await {
            Ok(items) => items,
            Err(e) => {
                if matches!(e, Error::Network(_)) {
                    self.network.force(false);
                }
                return Err(e);
            }
        };

        // Held so a concurrent submit cannot interleave with the overwrite.
        let _queue = self.queue.write().await;
        let mut pulled = 0;
        let mut remote = HashSet::with_capacity(items.len());

        for item in items {
            remote.insert(item.id.clone());
            let refreshed = StoredRecord::new_synced(
                collection.clone(),
                item.id.clone(),
                item.data.clone(),
                item.revision,
            );

            let Some(local) = self.store.get_record(collection, &item.id)? else {
                self.store.put_record(&refreshed)?;
                pulled += 1;
                continue;
            };

            match compare(LocalVersion::of(&local), item.revision) {
                VersionOrdering::RemoteNewer => {
                    self.store.put_record(&refreshed)?;
                    pulled += 1;
                }
                VersionOrdering::Equal if item.revision.is_none() && local.data != item.data => {
                    self.store.put_record(&refreshed)?;
                    pulled += 1;
                }
                VersionOrdering::Diverged if local.sync_state == SyncState::Conflict => {
                    if let Some(mut conflict) = self.store.get_conflict(collection, &item.id)? {
                        if conflict.server_data.is_none() {
                            conflict.server_data = Some(item.data);
                            conflict.server_revision = item.revision;
                            self.store.put_conflict(&conflict)?;
                        }
                    }
                }
                _ => {}
            }
        }

        for local in self.store.list_records(collection)? {
            if local.sync_state == SyncState::Synced && !remote.contains(&local.id) {
                self.store.remove_record(collection, &local.id)?;
                pulled += 1;
            }
        }

        debug!("Pulled {} changes into {}", pulled, collection);
        Ok(pulled)
    }

    // ---- conflicts and failed requests ----

    /// Apply a user decision to a conflict held by the manual strategy.
    pub async fn resolve_conflict(
        &self,
        collection: &Collection,
        id: &ResourceId,
        resolution: Resolution,
    ) -> Result<()> {
        let conflict = self
            .store
            .get_conflict(collection, id)?
            .ok_or_else(|| Error::NotFound(format!("Conflict on {}/{}", collection, id)))?;
        info!("Resolving conflict on {}/{}: {}", collection, id, resolution.as_str());

        // Server state, fetched before taking the queue lock.
        let server = match (&conflict.server_data, conflict.server_revision) {
            (Some(data), revision) => Some((data.clone(), revision)),
            (None, _) => self
                .fetch_for_resolution(collection, id)
                .await?
                .map(|item| (item.data, item.revision)),
        };

        let mut queue = self.queue.write().await;
        let record = self.store.get_record(collection, id)?;
        let queued = match resolution {
            Resolution::KeepServer => {
                queue.discard_resource(collection, id)?;
                match server {
                    Some((data, revision)) => self.store.put_record(&StoredRecord::new_synced(
                        collection.clone(),
                        id.clone(),
                        data,
                        revision,
                    ))?,
                    None => {
                        self.store.remove_record(collection, id)?;
                    }
                }
                None
            }
            Resolution::KeepLocal | Resolution::Merged(_) => {
                let deleted = record.as_ref().is_some_and(|r| r.deleted);
                let value = match resolution {
                    Resolution::Merged(value) => Some(value),
                    _ if deleted => None,
                    _ => Some(
                        record
                            .as_ref()
                            .map(|r| r.data.clone())
                            .unwrap_or_else(|| conflict.local_data.clone()),
                    ),
                };
                let revision = server.as_ref().and_then(|(_, revision)| *revision);
                let priority = queue
                    .requests_for(collection, id)
                    .first()
                    .map(|r| r.priority)
                    .unwrap_or_default();
                queue.discard_resource(collection, id)?;

                let mut local = record.unwrap_or_else(|| {
                    StoredRecord::new_local(collection.clone(), id.clone(), Value::Null)
                });
                let new = match value {
                    Some(value) => {
                        local.mark_local_modified(value.clone());
                        NewRequest::new(collection.clone(), id.clone(), Method::Put).with_body(value)
                    }
                    None => {
                        local.mark_deleted();
                        NewRequest::new(collection.clone(), id.clone(), Method::Delete)
                    }
                };
                local.revision = revision;
                let request = queue.enqueue(new.with_priority(priority).with_base_revision(revision))?;
                self.store.put_record(&local)?;
                Some(request)
            }
        };
        self.store.remove_conflict(collection, id)?;
        drop(queue);

        self.events.emit(SyncEvent::ConflictResolved {
            collection: collection.clone(),
            id: id.clone(),
        });
        if let Some(request) = queued {
            self.events.emit(SyncEvent::RequestQueued {
                status: request.status,
                request,
            });
            self.notify_change();
        }
        Ok(())
    }

    async fn fetch_for_resolution(
        &self,
        collection: &Collection,
        id: &ResourceId,
    ) -> Result<Option<RemoteItem>> {
        self.transport.fetch(collection, id).await.map_err(|e| {
            warn!("Could not fetch {}/{}: {}", collection, id, e);
            if e.is_transient() {
                Error::Offline(format!("server value of {}/{} unavailable", collection, id))
            } else {
                e
            }
        })
    }

    /// Give a failed request a fresh attempt budget.
    pub async fn retry_failed(&self, request_id: &str) -> Result<QueuedRequest> {
        let request = self.queue.write().await.retry_failed(request_id)?;
        info!(request_id = %request.id, "Retrying {} {}", request.method, request.url());
        self.events.emit(SyncEvent::RequestQueued {
            status: request.status,
            request: request.clone(),
        });
        self.notify_change();
        Ok(request)
    }

    /// Drop a failed request.
    ///
    /// If nothing else is pending for the resource, the record is marked
    /// stale so the next pull restores the server value.
    pub async fn discard_failed(&self, request_id: &str) -> Result<QueuedRequest> {
        let mut queue = self.queue.write().await;
        let status = queue
            .get(request_id)
            .map(|r| r.status)
            .ok_or_else(|| Error::NotFound(format!("Queued request {}", request_id)))?;
        if status != RequestStatus::Failed {
            return Err(Error::NotPermitted(format!(
                "Request {} has not failed",
                request_id
            )));
        }

        let request = queue.discard(request_id)?;
        let collection = &request.collection;
        let id = &request.resource_id;
        let mut resolved = false;
        if !queue.has_pending_for(collection, id) {
            if let Some(mut record) = self.store.get_record(collection, id)? {
                record.mark_stale();
                self.store.put_record(&record)?;
            }
            resolved = self.store.remove_conflict(collection, id)?;
        }
        drop(queue);

        info!(request_id = %request.id, "Discarded failed {} {}", request.method, request.url());
        if resolved {
            self.events.emit(SyncEvent::ConflictResolved {
                collection: collection.clone(),
                id: id.clone(),
            });
        }
        Ok(request)
    }

    // ---- store maintenance ----

    /// Drop every record, conflict and queued request of a collection.
    ///
    /// Irreversible; refuses to run without `confirm`.
    pub async fn clear(&self, collection: &Collection, confirm: bool) -> Result<()> {
        if !confirm {
            return Err(Error::NotPermitted(format!(
                "Clearing {} requires confirmation",
                collection
            )));
        }
        let _guard = self.flag.try_begin()?;
        let mut queue = self.queue.write().await;
        let dropped = queue.clear_collection(collection)?;
        self.store.clear(collection)?;
        warn!("Cleared {} ({} queued requests dropped)", collection, dropped);
        Ok(())
    }

    pub fn export(&self, collection: &Collection) -> Result<CollectionSnapshot> {
        self.store.export(collection)
    }

    /// Replace a collection with a snapshot.
    ///
    /// Pending records in the snapshot are queued again as full-state writes.
    /// Returns the number of queued requests.
    pub async fn import(&self, collection: &Collection, snapshot: &CollectionSnapshot) -> Result<usize> {
        snapshot.validate_for(collection)?;
        let _guard = self.flag.try_begin()?;

        // Records first: a failed import must leave the old queue in place.
        let mut queue = self.queue.write().await;
        self.store.import(snapshot)?;
        queue.clear_collection(collection)?;

        let mut queued = Vec::new();
        for record in snapshot
            .records
            .iter()
            .filter(|r| r.sync_state == SyncState::Pending)
        {
            let new = if record.deleted {
                NewRequest::new(collection.clone(), record.id.clone(), Method::Delete)
            } else {
                NewRequest::new(collection.clone(), record.id.clone(), Method::Put)
                    .with_body(record.data.clone())
            };
            queued.push(queue.enqueue(new.with_base_revision(record.revision))?);
        }
        drop(queue);

        info!(
            "Imported {} records into {} ({} queued)",
            snapshot.records.len(),
            collection,
            queued.len()
        );
        let count = queued.len();
        for request in queued {
            self.events.emit(SyncEvent::RequestQueued {
                status: request.status,
                request,
            });
        }
        if count > 0 {
            self.notify_change();
        }
        Ok(count)
    }
}

/// Apply a queued change to the local copy optimistically.
fn apply_local(existing: Option<StoredRecord>, new: &NewRequest) -> StoredRecord {
    let collection = new.collection.clone();
    let id = new.resource_id.clone();
    let body = new.body.clone().unwrap_or(Value::Null);

    match (new.method, existing) {
        (Method::Post | Method::Put, Some(mut record)) => {
            record.mark_local_modified(body);
            record
        }
        (Method::Post | Method::Put, None) => StoredRecord::new_local(collection, id, body),
        (Method::Patch, Some(mut record)) => {
            let mut data = record.data.clone();
            merge_patch(&mut data, &body);
            record.mark_local_modified(data);
            record
        }
        (Method::Patch, None) => {
            let mut data = Value::Object(Default::default());
            merge_patch(&mut data, &body);
            StoredRecord::new_local(collection, id, data)
        }
        (Method::Delete, Some(mut record)) => {
            record.mark_deleted();
            record
        }
        (Method::Delete, None) => {
            let mut record = StoredRecord::new_local(collection, id, Value::Null);
            record.mark_deleted();
            record
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;
    use crate::retry::RetryConfig;
    use crate::scheduler::SyncMode;
    use harborsync_common::{Priority, Revision};
    use harborsync_store::MemoryStore;
    use harborsync_transport::{Fault, MemoryBackend};
    use async_trait::async_trait;
    use proptest::prelude::*;
    use serde_json::json;
    use std::sync::Mutex;

    struct Harness {
        backend: Arc<MemoryBackend>,
        engine: SyncEngine<MemoryBackend>,
        events: Arc<Mutex<Vec<SyncEvent>>>,
    }

    impl Harness {
        fn kinds(&self) -> Vec<EventKind> {
            self.events.lock().unwrap().iter().map(|e| e.kind()).collect()
        }

        fn count(&self, kind: EventKind) -> usize {
            self.kinds().into_iter().filter(|k| *k == kind).count()
        }
    }

    fn test_config() -> SyncConfig {
        let mut config = SyncConfig::default().with_sync_mode(SyncMode::Manual);
        config.retry = RetryConfig::new()
            .with_initial_delay(Duration::from_millis(1))
            .with_max_delay(Duration::from_millis(5))
            .with_jitter(false);
        config
    }

    fn harness_with(config: SyncConfig) -> Harness {
        let backend = Arc::new(MemoryBackend::new());
        let store: Arc<dyn RecordStore> = Arc::new(MemoryStore::new());
        let engine = SyncEngine::new(Arc::clone(&backend), store, config).unwrap();

        let events = Arc::new(Mutex::new(Vec::new()));
        for kind in EventKind::ALL {
            let sink = Arc::clone(&events);
            engine.events().on(kind, move |event| sink.lock().unwrap().push(event.clone()));
        }
        Harness {
            backend,
            engine,
            events,
        }
    }

    fn harness() -> Harness {
        harness_with(test_config())
    }

    fn rid(s: &str) -> ResourceId {
        ResourceId::new(s).unwrap()
    }

    fn containers() -> Collection {
        Collection::containers()
    }

    fn put(id: &str, body: Value) -> NewRequest {
        NewRequest::new(containers(), rid(id), Method::Put).with_body(body)
    }

    /// Seed the backend and pull the resource so the local copy is synced.
    async fn seed(h: &Harness, id: &str, data: Value) -> Revision {
        let revision = h.backend.server_update(&containers(), &rid(id), data);
        let result = h.engine.sync_containers(None).await.unwrap();
        assert!(result.success);
        revision
    }

    #[tokio::test]
    async fn test_high_priority_drains_first() {
        let h = harness();
        h.engine.network().force(false);

        h.engine
            .submit(put("low", json!({"n": 1})).with_priority(Priority::Low))
            .await
            .unwrap();
        h.engine
            .submit(put("high-1", json!({"n": 2})).with_priority(Priority::High))
            .await
            .unwrap();
        h.engine
            .submit(put("high-2", json!({"n": 3})).with_priority(Priority::High))
            .await
            .unwrap();
        assert!(h.backend.requests().is_empty());

        h.engine.network().force(true);
        let report = h.engine.process_pending_requests().await.unwrap();
        assert_eq!(report.processed(), 3);

        let order: Vec<String> = h
            .backend
            .requests()
            .into_iter()
            .filter_map(|r| r.resource_id.map(|id| id.to_string()))
            .collect();
        assert_eq!(order, vec!["high-1", "high-2", "low"]);
        assert_eq!(h.count(EventKind::RequestQueued), 3);
    }

    #[tokio::test]
    async fn test_transient_failures_exhaust_retries() {
        let h = harness();
        h.backend.fail_next(10, Fault::Status(503));
        let request = h.engine.submit(put("web", json!({"v": 1}))).await.unwrap();

        let report = h.engine.process_pending_requests().await.unwrap();
        assert_eq!(report.failed(), 1);
        assert_eq!(h.backend.requests().len(), 3);

        let queued = h.engine.queued_requests().await;
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].id, request.id);
        assert_eq!(queued[0].status, RequestStatus::Failed);
        assert_eq!(queued[0].retry_count, 3);

        // Not retried automatically again.
        h.engine.process_pending_requests().await.unwrap();
        assert_eq!(h.backend.requests().len(), 3);
        assert_eq!(h.engine.queue_status().await.unwrap().failed, 1);
    }

    #[tokio::test]
    async fn test_server_wins_overwrites_local() {
        let h = harness();
        seed(&h, "web", json!({"image": "nginx:1"})).await;
        h.backend
            .server_update(&containers(), &rid("web"), json!({"image": "nginx:2"}));

        h.engine
            .submit(put("web", json!({"image": "nginx:local"})))
            .await
            .unwrap();
        let result = h
            .engine
            .sync_containers(Some(ConflictStrategy::ServerWins))
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.conflicts, 1);
        let record = h.engine.record(&containers(), &rid("web")).unwrap().unwrap();
        assert_eq!(record.data, json!({"image": "nginx:2"}));
        assert_eq!(record.sync_state, SyncState::Synced);
        assert!(h.engine.conflict_items(&containers()).unwrap().is_empty());
        assert!(h.engine.queued_requests().await.is_empty());
        assert_eq!(h.count(EventKind::ConflictDetected), 1);
        assert_eq!(h.count(EventKind::ConflictResolved), 1);
    }

    #[tokio::test]
    async fn test_clear_empties_stats() {
        let h = harness();
        seed(&h, "web", json!({"image": "nginx"})).await;
        h.engine.submit(put("db", json!({"image": "postgres"}))).await.unwrap();

        assert!(matches!(
            h.engine.clear(&containers(), false).await,
            Err(Error::NotPermitted(_))
        ));
        h.engine.clear(&containers(), true).await.unwrap();

        assert_eq!(
            h.engine.storage_stats(&containers()).unwrap(),
            StorageStats::default()
        );
        assert!(h.engine.queued_requests().await.is_empty());
    }

    #[tokio::test]
    async fn test_client_wins_overwrites_server() {
        let h = harness();
        seed(&h, "web", json!({"image": "nginx:1"})).await;
        h.backend
            .server_update(&containers(), &rid("web"), json!({"image": "nginx:2"}));

        h.engine
            .submit(put("web", json!({"image": "nginx:local"})))
            .await
            .unwrap();
        let result = h
            .engine
            .sync_containers(Some(ConflictStrategy::ClientWins))
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.conflicts, 1);
        let (server, revision) = h.backend.get(&containers(), &rid("web")).unwrap();
        assert_eq!(server, json!({"image": "nginx:local"}));

        let record = h.engine.record(&containers(), &rid("web")).unwrap().unwrap();
        assert_eq!(record.sync_state, SyncState::Synced);
        assert_eq!(record.revision, Some(revision));
        assert!(h.engine.conflict_items(&containers()).unwrap().is_empty());
        assert_eq!(h.count(EventKind::ConflictResolved), 1);
    }

    #[tokio::test]
    async fn test_client_wins_after_transient_failures_still_overwrites() {
        let h = harness();
        seed(&h, "web", json!({"image": "nginx:1"})).await;
        h.backend
            .server_update(&containers(), &rid("web"), json!({"image": "nginx:2"}));

        h.engine
            .submit(put("web", json!({"image": "nginx:local"})))
            .await
            .unwrap();
        // Two of the three attempts are spent before the conflict shows up.
        h.backend.fail_next(2, Fault::Status(503));
        let result = h
            .engine
            .sync_containers(Some(ConflictStrategy::ClientWins))
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.conflicts, 1);
        assert_eq!(result.failed, 0);
        let (server, _) = h.backend.get(&containers(), &rid("web")).unwrap();
        assert_eq!(server, json!({"image": "nginx:local"}));
        assert!(h.engine.queued_requests().await.is_empty());
        let record = h.engine.record(&containers(), &rid("web")).unwrap().unwrap();
        assert_eq!(record.sync_state, SyncState::Synced);
    }

    #[tokio::test]
    async fn test_replayed_request_has_no_second_effect() {
        for strategy in [ConflictStrategy::ServerWins, ConflictStrategy::ClientWins] {
            let h = harness_with(test_config().with_strategy(strategy));
            seed(&h, "web", json!({"image": "nginx:1"})).await;
            h.engine
                .submit(put("web", json!({"image": "nginx:2"})))
                .await
                .unwrap();

            // The backend applied the request but the client crashed before
            // removing it from the queue.
            let queued = h.engine.queued_requests().await.remove(0);
            let api = ApiRequest::new(queued.method, containers(), Some(rid("web")))
                .with_body(queued.body.clone())
                .with_if_match(queued.base_revision);
            let applied = h.backend.send(&api).await.unwrap();
            assert!(applied.is_success());

            let report = h.engine.process_pending_requests().await.unwrap();
            assert_eq!(report.processed(), 1);
            assert_eq!(report.conflicts(), 0);

            let (server, revision) = h.backend.get(&containers(), &rid("web")).unwrap();
            assert_eq!(server, json!({"image": "nginx:2"}));
            assert_eq!(Some(revision), applied.revision);

            let record = h.engine.record(&containers(), &rid("web")).unwrap().unwrap();
            assert_eq!(record.sync_state, SyncState::Synced);
            assert_eq!(record.revision, applied.revision);
            assert!(h.engine.conflict_items(&containers()).unwrap().is_empty());
        }
    }

    #[tokio::test]
    async fn test_manual_conflict_round_trip_keep_local() {
        let h = harness();
        seed(&h, "web", json!({"image": "nginx:1"})).await;
        let server_rev = h
            .backend
            .server_update(&containers(), &rid("web"), json!({"image": "nginx:2"}));
        h.engine
            .submit(put("web", json!({"image": "nginx:local"})))
            .await
            .unwrap();

        let result = h
            .engine
            .sync_containers(Some(ConflictStrategy::Manual))
            .await
            .unwrap();
        assert_eq!(result.conflicts, 1);

        let conflicts = h.engine.conflict_items(&containers()).unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].server_revision, Some(server_rev));
        assert_eq!(conflicts[0].local_data, json!({"image": "nginx:local"}));
        assert_eq!(h.engine.storage_stats(&containers()).unwrap().conflicts, 1);

        // The resource is held back until the user decides.
        let sent = h.backend.requests().len();
        h.engine.process_pending_requests().await.unwrap();
        assert_eq!(h.backend.requests().len(), sent);

        h.engine
            .resolve_conflict(&containers(), &rid("web"), Resolution::KeepLocal)
            .await
            .unwrap();
        assert!(h.engine.conflict_items(&containers()).unwrap().is_empty());

        let result = h.engine.sync_containers(None).await.unwrap();
        assert!(result.success);
        assert_eq!(result.conflicts, 0);
        let record = h.engine.record(&containers(), &rid("web")).unwrap().unwrap();
        assert_eq!(record.sync_state, SyncState::Synced);
        assert_eq!(
            h.backend.get(&containers(), &rid("web")).unwrap().0,
            json!({"image": "nginx:local"})
        );
    }

    #[tokio::test]
    async fn test_manual_conflict_round_trip_keep_server() {
        let h = harness();
        seed(&h, "web", json!({"image": "nginx:1"})).await;
        h.backend
            .server_update(&containers(), &rid("web"), json!({"image": "nginx:2"}));
        h.engine
            .submit(put("web", json!({"image": "nginx:local"})))
            .await
            .unwrap();
        h.engine
            .sync_containers(Some(ConflictStrategy::Manual))
            .await
            .unwrap();

        h.engine
            .resolve_conflict(&containers(), &rid("web"), Resolution::KeepServer)
            .await
            .unwrap();

        let record = h.engine.record(&containers(), &rid("web")).unwrap().unwrap();
        assert_eq!(record.sync_state, SyncState::Synced);
        assert_eq!(record.data, json!({"image": "nginx:2"}));
        assert!(h.engine.conflict_items(&containers()).unwrap().is_empty());
        assert!(h.engine.queued_requests().await.is_empty());
        assert!(matches!(
            h.engine
                .resolve_conflict(&containers(), &rid("web"), Resolution::KeepServer)
                .await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_new_write_supersedes_manual_conflict() {
        let h = harness();
        seed(&h, "web", json!({"image": "nginx:1"})).await;
        let server_rev = h
            .backend
            .server_update(&containers(), &rid("web"), json!({"image": "nginx:2"}));
        h.engine
            .submit(put("web", json!({"image": "nginx:local"})))
            .await
            .unwrap();
        h.engine
            .sync_containers(Some(ConflictStrategy::Manual))
            .await
            .unwrap();

        let request = h
            .engine
            .submit(put("web", json!({"image": "nginx:3"})))
            .await
            .unwrap();
        assert_eq!(request.base_revision, Some(server_rev));
        assert!(h.engine.conflict_items(&containers()).unwrap().is_empty());
        assert_eq!(h.engine.queued_requests().await.len(), 1);
        assert_eq!(h.count(EventKind::ConflictResolved), 1);

        let result = h.engine.sync_containers(None).await.unwrap();
        assert!(result.success);
        assert_eq!(
            h.backend.get(&containers(), &rid("web")).unwrap().0,
            json!({"image": "nginx:3"})
        );
    }

    #[tokio::test]
    async fn test_offline_mid_pass_keeps_progress() {
        let h = harness();
        for name in ["a", "b", "c"] {
            h.engine.submit(put(name, json!({"name": name}))).await.unwrap();
        }
        h.backend.script([None, Some(Fault::Network)]);

        let report = h.engine.process_pending_requests().await.unwrap();
        assert_eq!(report.processed(), 1);
        assert!(report.first_error().is_some());
        assert!(!h.engine.network_status());
        assert_eq!(h.count(EventKind::SyncFailed), 1);
        assert_eq!(h.count(EventKind::Offline), 1);

        // The acknowledged request stays applied; the rest wait.
        assert!(h.backend.get(&containers(), &rid("a")).is_some());
        assert_eq!(h.engine.queued_requests().await.len(), 2);

        h.engine.network().force(true);
        let report = h.engine.process_pending_requests().await.unwrap();
        assert_eq!(report.processed(), 2);
        assert!(h.engine.queued_requests().await.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_pass_is_rejected_silently() {
        let h = harness();
        let _guard = h.engine.flag.try_begin().unwrap();

        assert!(matches!(h.engine.sync_all(None).await, Err(Error::SyncInProgress)));
        assert!(matches!(
            h.engine.process_pending_requests().await,
            Err(Error::SyncInProgress)
        ));
        assert!(h.kinds().is_empty());
        assert!(h.engine.queue_status().await.unwrap().sync_in_progress);
    }

    #[tokio::test]
    async fn test_sync_all_reports_partial_success() {
        let h = harness();
        h.backend.fail_next(1, Fault::Status(422));
        h.engine.submit(put("web", json!({"replicas": -1}))).await.unwrap();

        let report = h.engine.sync_all(None).await.unwrap();
        assert_eq!(report.results.len(), 4);
        assert_eq!(report.outcome, crate::report::SyncOutcome::PartialSuccess);
        assert!(!report.results[&containers()].success);
        assert!(report.results[&Collection::services()].success);
        assert_eq!(h.count(EventKind::SyncCompleted), 1);
    }

    #[tokio::test]
    async fn test_permanent_failure_retry_and_discard() {
        let h = harness();
        seed(&h, "web", json!({"replicas": 1})).await;
        h.backend.fail_next(2, Fault::Status(422));

        let request = h
            .engine
            .submit(
                NewRequest::new(containers(), rid("web"), Method::Patch)
                    .with_body(json!({"replicas": 2})),
            )
            .await
            .unwrap();
        let result = h.engine.sync_containers(None).await.unwrap();
        assert_eq!(result.failed, 1);
        assert!(!result.success);
        assert_eq!(h.backend.requests().len(), 1);
        assert!(matches!(
            h.engine.discard_failed("missing").await,
            Err(Error::NotFound(_))
        ));

        h.engine.retry_failed(&request.id).await.unwrap();
        let result = h.engine.sync_containers(None).await.unwrap();
        assert_eq!(result.failed, 1);

        h.engine.discard_failed(&request.id).await.unwrap();
        let record = h.engine.record(&containers(), &rid("web")).unwrap().unwrap();
        assert_eq!(record.sync_state, SyncState::Synced);
        assert_eq!(record.revision, None);

        // The next pull restores the server value.
        h.engine.sync_containers(None).await.unwrap();
        let record = h.engine.record(&containers(), &rid("web")).unwrap().unwrap();
        assert_eq!(record.data, json!({"replicas": 1}));
        assert!(record.revision.is_some());
    }

    #[tokio::test]
    async fn test_chained_writes_do_not_conflict() {
        let h = harness();
        seed(&h, "web", json!({"image": "nginx", "replicas": 1})).await;
        h.engine
            .submit(put("web", json!({"image": "nginx:2", "replicas": 1})))
            .await
            .unwrap();
        h.engine
            .submit(
                NewRequest::new(containers(), rid("web"), Method::Patch)
                    .with_body(json!({"replicas": 3})),
            )
            .await
            .unwrap();

        let result = h
            .engine
            .sync_containers(Some(ConflictStrategy::Manual))
            .await
            .unwrap();
        assert_eq!(result.processed, 2);
        assert_eq!(result.conflicts, 0);

        let (server, revision) = h.backend.get(&containers(), &rid("web")).unwrap();
        assert_eq!(server, json!({"image": "nginx:2", "replicas": 3}));
        let record = h.engine.record(&containers(), &rid("web")).unwrap().unwrap();
        assert_eq!(record.data, server);
        assert_eq!(record.revision, Some(revision));
    }

    #[tokio::test]
    async fn test_delete_removes_record() {
        let h = harness();
        seed(&h, "web", json!({"image": "nginx"})).await;
        h.engine
            .submit(NewRequest::new(containers(), rid("web"), Method::Delete))
            .await
            .unwrap();
        let record = h.engine.record(&containers(), &rid("web")).unwrap().unwrap();
        assert!(record.deleted);
        assert_eq!(record.sync_state, SyncState::Pending);

        h.engine.sync_containers(None).await.unwrap();
        assert!(h.engine.record(&containers(), &rid("web")).unwrap().is_none());
        assert!(h.backend.get(&containers(), &rid("web")).is_none());
    }

    #[tokio::test]
    async fn test_pull_respects_pending_records() {
        let h = harness();
        seed(&h, "web", json!({"v": 1})).await;
        seed(&h, "db", json!({"v": 1})).await;

        h.engine.network().force(false);
        h.engine.submit(put("web", json!({"v": "local"}))).await.unwrap();
        h.backend.server_update(&containers(), &rid("web"), json!({"v": 2}));
        h.backend.server_update(&containers(), &rid("cache"), json!({"v": 1}));
        h.backend.server_delete(&containers(), &rid("db"));

        // The rejected write keeps the record pending, so the pull leaves it alone.
        h.engine.network().force(true);
        h.backend.fail_next(1, Fault::Status(422));
        let result = h.engine.sync_containers(None).await.unwrap();

        // Cache appeared, db vanished, web kept its local value until pushed.
        assert!(h.engine.record(&containers(), &rid("cache")).unwrap().is_some());
        assert!(h.engine.record(&containers(), &rid("db")).unwrap().is_none());
        assert_eq!(result.pulled, 2);
        let web = h.engine.record(&containers(), &rid("web")).unwrap().unwrap();
        assert_eq!(web.data, json!({"v": "local"}));
        assert_eq!(web.sync_state, SyncState::Pending);
    }

    #[tokio::test]
    async fn test_data_age_and_status() {
        let h = harness();
        assert_eq!(h.engine.data_age(None).unwrap(), None);

        h.engine.sync_containers(None).await.unwrap();
        let age = h.engine.data_age(Some(&containers())).unwrap().unwrap();
        assert!(age >= chrono::Duration::zero());
        assert!(h.engine.data_age(Some(&Collection::volumes())).unwrap().is_none());

        let status = h.engine.queue_status().await.unwrap();
        assert!(status.last_sync.is_some());
        assert!(!status.sync_in_progress);
    }

    #[tokio::test]
    async fn test_offline_sync_fails_without_losing_queue() {
        let h = harness();
        h.engine.submit(put("web", json!({}))).await.unwrap();
        h.engine.network().force(false);

        let result = h.engine.sync_containers(None).await.unwrap();
        assert!(!result.success);
        assert!(result.error.is_some());
        assert_eq!(h.count(EventKind::SyncFailed), 1);
        assert_eq!(h.engine.queued_requests().await.len(), 1);
        assert!(h.backend.requests().is_empty());
    }

    #[tokio::test]
    async fn test_export_import_requeues_pending() {
        let h = harness();
        seed(&h, "web", json!({"v": 1})).await;
        h.engine.network().force(false);
        h.engine.submit(put("db", json!({"v": 1}))).await.unwrap();
        let snapshot = h.engine.export(&containers()).unwrap();

        let other = harness();
        assert!(other.engine.import(&Collection::services(), &snapshot).await.is_err());
        let queued = other.engine.import(&containers(), &snapshot).await.unwrap();
        assert_eq!(queued, 1);
        assert_eq!(other.engine.storage_stats(&containers()).unwrap().total, 2);

        let report = other.engine.process_pending_requests().await.unwrap();
        assert_eq!(report.processed(), 1);
        assert!(other.backend.get(&containers(), &rid("db")).is_some());
    }

    /// Backend that answers `409` with an error document instead of the
    /// resource.
    struct ErrorDocuments(Arc<MemoryBackend>);

    #[async_trait]
    impl Transport for ErrorDocuments {
        fn name(&self) -> &str {
            "error-documents"
        }
        async fn send(&self, request: &ApiRequest) -> Result<ApiResponse> {
            let mut response = self.0.send(request).await?;
            if response.status == 409 {
                response.body = Some(json!({"message": "resource already exists"}));
            }
            Ok(response)
        }
        async fn fetch(&self, collection: &Collection, id: &ResourceId) -> Result<Option<RemoteItem>> {
            self.0.fetch(collection, id).await
        }
        async fn list(&self, collection: &Collection) -> Result<Vec<RemoteItem>> {
            self.0.list(collection).await
        }
        async fn probe(&self) -> Result<()> {
            self.0.probe().await
        }
    }

    #[tokio::test]
    async fn test_create_conflict_fetches_server_resource() {
        let backend = Arc::new(MemoryBackend::new());
        let revision = backend.server_update(&containers(), &rid("web"), json!({"image": "nginx:2"}));
        let store: Arc<dyn RecordStore> = Arc::new(MemoryStore::new());
        let engine = SyncEngine::new(
            Arc::new(ErrorDocuments(Arc::clone(&backend))),
            store,
            test_config(),
        )
        .unwrap();

        engine
            .submit(
                NewRequest::new(containers(), rid("web"), Method::Post)
                    .with_body(json!({"image": "nginx:local"})),
            )
            .await
            .unwrap();
        let report = engine.process_pending_requests().await.unwrap();
        assert_eq!(report.conflicts(), 1);

        let record = engine.record(&containers(), &rid("web")).unwrap().unwrap();
        assert_eq!(record.data, json!({"image": "nginx:2"}));
        assert_eq!(record.revision, Some(revision));
        assert_eq!(record.sync_state, SyncState::Synced);
    }

    /// Memory store whose imports always fail.
    struct NoImportStore(MemoryStore);

    impl RecordStore for NoImportStore {
        fn name(&self) -> &str {
            "no-import"
        }
        fn get_record(&self, c: &Collection, id: &ResourceId) -> Result<Option<StoredRecord>> {
            self.0.get_record(c, id)
        }
        fn put_record(&self, record: &StoredRecord) -> Result<()> {
            self.0.put_record(record)
        }
        fn remove_record(&self, c: &Collection, id: &ResourceId) -> Result<bool> {
            self.0.remove_record(c, id)
        }
        fn list_records(&self, c: &Collection) -> Result<Vec<StoredRecord>> {
            self.0.list_records(c)
        }
        fn get_conflict(&self, c: &Collection, id: &ResourceId) -> Result<Option<ConflictItem>> {
            self.0.get_conflict(c, id)
        }
        fn put_conflict(&self, item: &ConflictItem) -> Result<()> {
            self.0.put_conflict(item)
        }
        fn remove_conflict(&self, c: &Collection, id: &ResourceId) -> Result<bool> {
            self.0.remove_conflict(c, id)
        }
        fn list_conflicts(&self, c: &Collection) -> Result<Vec<ConflictItem>> {
            self.0.list_conflicts(c)
        }
        fn queue_load(&self) -> Result<Vec<QueuedRequest>> {
            self.0.queue_load()
        }
        fn queue_put(&self, request: &QueuedRequest) -> Result<()> {
            self.0.queue_put(request)
        }
        fn queue_remove(&self, id: &str) -> Result<bool> {
            self.0.queue_remove(id)
        }
        fn meta_get(&self, key: &str) -> Result<Option<String>> {
            self.0.meta_get(key)
        }
        fn meta_set(&self, key: &str, value: &str) -> Result<()> {
            self.0.meta_set(key, value)
        }
        fn collections(&self) -> Result<Vec<Collection>> {
            self.0.collections()
        }
        fn clear(&self, c: &Collection) -> Result<()> {
            self.0.clear(c)
        }
        fn import(&self, _snapshot: &CollectionSnapshot) -> Result<()> {
            Err(Error::Storage("disk I/O error".to_string()))
        }
    }

    #[tokio::test]
    async fn test_failed_import_keeps_queue() {
        let backend = Arc::new(MemoryBackend::new());
        let store: Arc<dyn RecordStore> = Arc::new(NoImportStore(MemoryStore::new()));
        let engine = SyncEngine::new(Arc::clone(&backend), store, test_config()).unwrap();
        engine.network().force(false);
        let request = engine.submit(put("web", json!({"v": 1}))).await.unwrap();

        let snapshot = CollectionSnapshot::new(containers(), Vec::new(), Vec::new());
        let err = engine.import(&containers(), &snapshot).await.unwrap_err();
        assert!(matches!(err, Error::Storage(_)));

        let queued = engine.queued_requests().await;
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].id, request.id);
        let record = engine.record(&containers(), &rid("web")).unwrap().unwrap();
        assert_eq!(record.sync_state, SyncState::Pending);

        engine.network().force(true);
        let report = engine.process_pending_requests().await.unwrap();
        assert_eq!(report.processed(), 1);
        assert!(backend.get(&containers(), &rid("web")).is_some());
    }

    #[tokio::test]
    async fn test_read_only_store_refuses_writes() {
        let backend = Arc::new(MemoryBackend::new());
        let store: Arc<dyn RecordStore> =
            Arc::new(MemoryStore::read_only(Vec::new(), Vec::new(), "disk full"));
        let engine = SyncEngine::new(backend, store, test_config()).unwrap();

        let err = engine.submit(put("web", json!({}))).await.unwrap_err();
        assert!(matches!(err, Error::ReadOnly(_)));
        assert!(engine.records(&containers()).unwrap().is_empty());
        assert!(engine.queued_requests().await.is_empty());
    }

    #[tokio::test]
    async fn test_submit_requires_body() {
        let h = harness();
        let err = h
            .engine
            .submit(NewRequest::new(containers(), rid("web"), Method::Put))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Submit(usize, Method),
        ServerEdit(usize),
        Fault(u16),
        Sync(ConflictStrategy),
        Resolve(usize, bool),
    }

    fn op() -> impl Strategy<Value = Op> {
        let method = prop_oneof![
            Just(Method::Put),
            Just(Method::Patch),
            Just(Method::Delete)
        ];
        let strategy = prop_oneof![
            Just(ConflictStrategy::ServerWins),
            Just(ConflictStrategy::ClientWins),
            Just(ConflictStrategy::Manual)
        ];
        prop_oneof![
            (0usize..3, method).prop_map(|(i, m)| Op::Submit(i, m)),
            (0usize..3).prop_map(Op::ServerEdit),
            prop_oneof![Just(503u16), Just(422u16)].prop_map(Op::Fault),
            strategy.prop_map(Op::Sync),
            (0usize..3, any::<bool>()).prop_map(|(i, keep)| Op::Resolve(i, keep)),
        ]
    }

    async fn run_ops(ops: Vec<Op>) {
        let h = harness();
        for (step, op) in ops.into_iter().enumerate() {
            match op {
                Op::Submit(i, method) => {
                    let body = match method {
                        Method::Delete => None,
                        _ => Some(json!({"step": step})),
                    };
                    let mut new = NewRequest::new(containers(), rid(&format!("r{}", i)), method);
                    new.body = body;
                    h.engine.submit(new).await.unwrap();
                }
                Op::ServerEdit(i) => {
                    h.backend
                        .server_update(&containers(), &rid(&format!("r{}", i)), json!({"server": step}));
                }
                Op::Fault(status) => h.backend.fail_next(1, Fault::Status(status)),
                Op::Sync(strategy) => {
                    h.engine.sync_containers(Some(strategy)).await.unwrap();
                }
                Op::Resolve(i, keep_local) => {
                    let resolution = if keep_local {
                        Resolution::KeepLocal
                    } else {
                        Resolution::KeepServer
                    };
                    let _ = h
                        .engine
                        .resolve_conflict(&containers(), &rid(&format!("r{}", i)), resolution)
                        .await;
                }
            }

            let stats = h.engine.storage_stats(&containers()).unwrap();
            assert!(stats.is_consistent());
            let queued = h.engine.queued_requests().await;
            for record in h.engine.records(&containers()).unwrap() {
                let has_request = queued.iter().any(|r| r.targets(&containers(), &record.id));
                if record.sync_state == SyncState::Pending {
                    assert!(has_request, "pending record {} has no request", record.id);
                }
                if record.sync_state == SyncState::Synced {
                    assert!(!has_request, "synced record {} still queued", record.id);
                }
            }
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn prop_stats_and_pending_invariants(ops in prop::collection::vec(op(), 1..25)) {
            tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap()
                .block_on(run_ops(ops));
        }
    }
}
