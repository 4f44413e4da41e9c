//! Durable, priority-aware queue of pending mutations.
//!
//! Dispatch order:
//! - only the oldest request of each resource (its *head*) may be dispatched,
//!   so writes to one resource are applied in submission order and never
//!   overlap;
//! - among eligible heads, `High` drains before `Medium` before `Low`, FIFO
//!   within a tier;
//! - enqueuing a higher-priority write promotes the earlier writes of the same
//!   resource, so the two rules never contradict each other.
//!
//! Every mutation is written through to the store before it returns.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use harborsync_common::{Collection, Error, Method, Priority, ResourceId, Result, Revision};
use harborsync_store::{QueuedRequest, RecordStore, RequestStatus};

use crate::retry::RetryConfig;

/// A mutation submitted for queueing.
#[derive(Debug, Clone, PartialEq)]
pub struct NewRequest {
    pub collection: Collection,
    pub resource_id: ResourceId,
    pub method: Method,
    pub body: Option<Value>,
    pub priority: Priority,
    /// Server revision the change is based on.
    pub base_revision: Option<Revision>,
}

impl NewRequest {
    pub fn new(collection: Collection, resource_id: ResourceId, method: Method) -> Self {
        Self {
            collection,
            resource_id,
            method,
            body: None,
            priority: Priority::default(),
            base_revision: None,
        }
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_base_revision(mut self, revision: Option<Revision>) -> Self {
        self.base_revision = revision;
        self
    }
}

/// Request counts per priority tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriorityCounts {
    pub high: usize,
    pub medium: usize,
    pub low: usize,
}

impl PriorityCounts {
    fn add(&mut self, priority: Priority) {
        match priority {
            Priority::High => self.high += 1,
            Priority::Medium => self.medium += 1,
            Priority::Low => self.low += 1,
        }
    }
}

/// Snapshot of the queue size.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub total: usize,
    pub by_priority: PriorityCounts,
    /// Requests that gave up and wait for the user.
    pub failed: usize,
    /// Requests held back by a manual conflict.
    pub conflicts: usize,
}

/// The request queue.
pub struct RequestQueue {
    store: Arc<dyn RecordStore>,
    requests: HashMap<String, QueuedRequest>,
    next_seq: u64,
    next_order: u64,
    max_retries: u32,
}

impl RequestQueue {
    /// Restore the queue from the store.
    ///
    /// Requests left in flight by an interrupted pass go back to `Queued`.
    pub fn load(store: Arc<dyn RecordStore>, max_retries: u32) -> Result<Self> {
        let mut requests = HashMap::new();
        let mut next_seq = 0;
        let mut next_order = 0;

        for mut request in store.queue_load()? {
            if request.status == RequestStatus::InFlight {
                debug!("Re-queueing interrupted request {}", request.id);
                request.status = RequestStatus::Queued;
                store.queue_put(&request)?;
            }
            next_seq = next_seq.max(request.seq + 1);
            next_order = next_order.max(request.order + 1);
            requests.insert(request.id.clone(), request);
        }

        info!("Loaded {} queued requests", requests.len());
        Ok(Self {
            store,
            requests,
            next_seq,
            next_order,
            max_retries: max_retries.max(1),
        })
    }

    /// Append a request, or fold it into a queued full-state write.
    ///
    /// A full-state write (POST/PUT) replaces the trailing run of queued,
    /// non-delete writes of the same resource; the replacement keeps the
    /// position and id of the oldest write it absorbs, and stays a POST if it
    /// absorbed one. Partial updates are always appended.
    pub fn enqueue(&mut self, new: NewRequest) -> Result<QueuedRequest> {
        let chain = self.requests_for(&new.collection, &new.resource_id);
        let mut removed = Vec::new();

        let merged = if new.method.is_full_state() {
            let replaceable: Vec<&QueuedRequest> = chain
                .iter()
                .rev()
                .take_while(|r| {
                    r.method != Method::Delete
                        && matches!(r.status, RequestStatus::Queued | RequestStatus::RetryScheduled)
                })
                .collect();

            replaceable.last().map(|oldest| {
                let mut merged = (*oldest).clone();
                let was_post = replaceable.iter().any(|r| r.method == Method::Post);
                merged.method = if was_post { Method::Post } else { new.method };
                merged.body = new.body.clone();
                merged.priority = merged.priority.min(new.priority);
                merged.retry_count = 0;
                merged.force_count = 0;
                merged.status = RequestStatus::Queued;
                merged.not_before = None;
                merged.last_error = None;
                removed.extend(
                    replaceable[..replaceable.len() - 1]
                        .iter()
                        .map(|r| r.id.clone()),
                );
                merged
            })
        } else {
            None
        };

        let is_new = merged.is_none();
        let request = merged.unwrap_or_else(|| QueuedRequest {
            id: Uuid::new_v4().to_string(),
            collection: new.collection.clone(),
            resource_id: new.resource_id.clone(),
            method: new.method,
            body: new.body.clone(),
            priority: new.priority,
            timestamp: Utc::now(),
            retry_count: 0,
            max_retries: self.max_retries,
            force_count: 0,
            status: RequestStatus::Queued,
            base_revision: new.base_revision,
            not_before: None,
            last_error: None,
            seq: self.next_seq,
            order: self.next_order,
        });

        let promoted: Vec<QueuedRequest> = chain
            .iter()
            .filter(|r| r.order < request.order && r.priority > request.priority)
            .filter(|r| !removed.contains(&r.id))
            .map(|r| {
                let mut r = r.clone();
                r.priority = request.priority;
                r
            })
            .collect();

        for id in &removed {
            self.store.queue_remove(id)?;
        }
        for r in &promoted {
            self.store.queue_put(r)?;
        }
        self.store.queue_put(&request)?;

        for id in &removed {
            self.requests.remove(id);
        }
        for r in promoted {
            self.requests.insert(r.id.clone(), r);
        }
        self.requests.insert(request.id.clone(), request.clone());
        if is_new {
            self.next_seq += 1;
            self.next_order += 1;
        }

        debug!(
            request_id = %request.id,
            "Queued {} {} ({}, replaced {})",
            request.method,
            request.url(),
            request.priority,
            removed.len()
        );
        Ok(request)
    }

    /// All requests in dispatch order, for display.
    pub fn queued_requests(&self) -> Vec<QueuedRequest> {
        let mut requests: Vec<QueuedRequest> = self.requests.values().cloned().collect();
        requests.sort_by_key(|r| (r.priority, r.seq));
        requests
    }

    pub fn counts(&self) -> QueueCounts {
        let mut counts = QueueCounts::default();
        for request in self.requests.values() {
            counts.total += 1;
            counts.by_priority.add(request.priority);
            match request.status {
                RequestStatus::Failed => counts.failed += 1,
                RequestStatus::Conflict => counts.conflicts += 1,
                _ => {}
            }
        }
        counts
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&QueuedRequest> {
        self.requests.get(id)
    }

    /// Requests of one resource, oldest first.
    pub fn requests_for(&self, collection: &Collection, id: &ResourceId) -> Vec<QueuedRequest> {
        let mut chain: Vec<QueuedRequest> = self
            .requests
            .values()
            .filter(|r| r.targets(collection, id))
            .cloned()
            .collect();
        chain.sort_by_key(|r| r.order);
        chain
    }

    /// Whether any request, in any state, still targets the resource.
    pub fn has_pending_for(&self, collection: &Collection, id: &ResourceId) -> bool {
        self.requests.values().any(|r| r.targets(collection, id))
    }

    /// Oldest request of every resource, optionally limited to one collection.
    fn heads(&self, collection: Option<&Collection>) -> Vec<&QueuedRequest> {
        let mut heads: BTreeMap<(&Collection, &ResourceId), &QueuedRequest> = BTreeMap::new();
        for request in self.requests.values() {
            if collection.is_some_and(|c| c != &request.collection) {
                continue;
            }
            heads
                .entry((&request.collection, &request.resource_id))
                .and_modify(|head| {
                    if request.order < head.order {
                        *head = request;
                    }
                })
                .or_insert(request);
        }
        heads.into_values().collect()
    }

    /// Take the next request to dispatch and mark it in flight.
    pub fn dequeue_next(
        &mut self,
        collection: Option<&Collection>,
        now: DateTime<Utc>,
    ) -> Result<Option<QueuedRequest>> {
        let next = self
            .heads(collection)
            .into_iter()
            .filter(|r| r.is_eligible(now))
            .min_by_key(|r| (r.priority, r.seq))
            .map(|r| r.id.clone());

        match next {
            Some(id) => self
                .update(&id, |r| r.status = RequestStatus::InFlight)
                .map(Some),
            None => Ok(None),
        }
    }

    /// Collections with a head that is queued or waiting out a backoff.
    pub fn dispatchable(&self, collection: Option<&Collection>) -> Vec<Collection> {
        let mut collections: Vec<Collection> = self
            .heads(collection)
            .into_iter()
            .filter(|r| {
                matches!(
                    r.status,
                    RequestStatus::Queued | RequestStatus::RetryScheduled
                )
            })
            .map(|r| r.collection.clone())
            .collect();
        collections.dedup();
        collections
    }

    /// Earliest time a backed-off head becomes eligible.
    pub fn next_wakeup(&self, collection: Option<&Collection>) -> Option<DateTime<Utc>> {
        self.heads(collection)
            .into_iter()
            .filter(|r| r.status == RequestStatus::RetryScheduled)
            .filter_map(|r| r.not_before)
            .min()
    }

    /// Remove an acknowledged request.
    pub fn complete(&mut self, id: &str) -> Result<Option<QueuedRequest>> {
        self.store.queue_remove(id)?;
        Ok(self.requests.remove(id))
    }

    fn update(
        &mut self,
        id: &str,
        apply: impl FnOnce(&mut QueuedRequest),
    ) -> Result<QueuedRequest> {
        let mut request = self
            .requests
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("Queued request {}", id)))?;
        apply(&mut request);
        self.store.queue_put(&request)?;
        self.requests.insert(request.id.clone(), request.clone());
        Ok(request)
    }

    /// Charge a transient failure.
    ///
    /// Below the attempt budget the request backs off and moves to the tail
    /// of its tier; at the budget it becomes `Failed` and is never retried
    /// automatically again.
    pub fn schedule_retry(
        &mut self,
        id: &str,
        error: impl Into<String>,
        retry: &RetryConfig,
        now: DateTime<Utc>,
    ) -> Result<QueuedRequest> {
        let seq = self.next_seq;
        let error = error.into();
        let request = self.update(id, |r| {
            r.retry_count += 1;
            r.last_error = Some(error);
            if r.retry_count < r.max_retries {
                r.status = RequestStatus::RetryScheduled;
                r.not_before = Some(retry.not_before(r.retry_count - 1, now));
                r.seq = seq;
            } else {
                r.status = RequestStatus::Failed;
                r.not_before = None;
            }
        })?;
        self.next_seq += 1;

        if request.status == RequestStatus::Failed {
            warn!(
                request_id = %request.id,
                "Giving up on {} {} after {} attempts",
                request.method,
                request.url(),
                request.retry_count
            );
        }
        Ok(request)
    }

    /// Mark a request as permanently failed.
    pub fn mark_failed(&mut self, id: &str, error: impl Into<String>) -> Result<QueuedRequest> {
        let error = error.into();
        self.update(id, |r| {
            r.status = RequestStatus::Failed;
            r.last_error = Some(error);
            r.not_before = None;
        })
    }

    /// Hold a request back until its conflict is resolved.
    pub fn mark_conflict(&mut self, id: &str, error: impl Into<String>) -> Result<QueuedRequest> {
        let error = error.into();
        self.update(id, |r| {
            r.status = RequestStatus::Conflict;
            r.last_error = Some(error);
        })
    }

    /// Rewrite a request to overwrite the server at `base`.
    ///
    /// Forced sends have their own budget of `max_retries`, independent of
    /// transient retries, so the first overwrite is always sent. A resource
    /// that keeps changing under us still ends in `Failed`.
    pub fn force(
        &mut self,
        id: &str,
        method: Method,
        body: Option<Value>,
        base: Option<Revision>,
    ) -> Result<QueuedRequest> {
        self.update(id, |r| {
            r.method = method;
            r.body = body;
            r.base_revision = base;
            r.force_count += 1;
            r.not_before = None;
            r.status = if r.force_count <= r.max_retries {
                RequestStatus::Queued
            } else {
                RequestStatus::Failed
            };
        })
    }

    /// Point every not-yet-sent request of a resource at a new server revision.
    pub fn rebase_resource(
        &mut self,
        collection: &Collection,
        id: &ResourceId,
        revision: Option<Revision>,
    ) -> Result<()> {
        let stale: Vec<String> = self
            .requests
            .values()
            .filter(|r| r.targets(collection, id))
            .filter(|r| r.status != RequestStatus::InFlight && r.base_revision != revision)
            .map(|r| r.id.clone())
            .collect();
        for request_id in stale {
            self.update(&request_id, |r| r.base_revision = revision)?;
        }
        Ok(())
    }

    /// Drop every request of a resource, in any state.
    pub fn discard_resource(
        &mut self,
        collection: &Collection,
        id: &ResourceId,
    ) -> Result<Vec<QueuedRequest>> {
        let chain = self.requests_for(collection, id);
        for request in &chain {
            self.store.queue_remove(&request.id)?;
            self.requests.remove(&request.id);
        }
        Ok(chain)
    }

    /// Give a failed request a fresh attempt budget.
    pub fn retry_failed(&mut self, id: &str) -> Result<QueuedRequest> {
        match self.requests.get(id).map(|r| r.status) {
            None => return Err(Error::NotFound(format!("Queued request {}", id))),
            Some(RequestStatus::Failed) => {}
            Some(status) => {
                return Err(Error::NotPermitted(format!(
                    "Request {} is {:?}, not failed",
                    id, status
                )))
            }
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.update(id, |r| {
            r.retry_count = 0;
            r.force_count = 0;
            r.status = RequestStatus::Queued;
            r.not_before = None;
            r.last_error = None;
            r.seq = seq;
        })
    }

    /// Remove a request.
    pub fn discard(&mut self, id: &str) -> Result<QueuedRequest> {
        if !self.requests.contains_key(id) {
            return Err(Error::NotFound(format!("Queued request {}", id)));
        }
        self.store.queue_remove(id)?;
        self.requests
            .remove(id)
            .ok_or_else(|| Error::NotFound(format!("Queued request {}", id)))
    }

    /// Drop every request of a collection. Returns how many were dropped.
    pub fn clear_collection(&mut self, collection: &Collection) -> Result<usize> {
        let ids: Vec<String> = self
            .requests
            .values()
            .filter(|r| &r.collection == collection)
            .map(|r| r.id.clone())
            .collect();
        for id in &ids {
            self.store.queue_remove(id)?;
            self.requests.remove(id);
        }
        Ok(ids.len())
    }
}
