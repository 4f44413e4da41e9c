//! In-memory backend for testing.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

use harborsync_common::json::merge_patch;
use harborsync_common::{Collection, Error, Method, ResourceId, Result, Revision};

use crate::transport::{ApiRequest, ApiResponse, RemoteItem, Transport};

/// Failure injected into the next `send` calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Connection refused.
    Network,
    /// No answer in time.
    Timeout,
    /// Backend answers with this status.
    Status(u16),
}

#[derive(Debug, Clone)]
struct Resource {
    data: Value,
    revision: Revision,
}

#[derive(Debug)]
struct State {
    resources: BTreeMap<(Collection, ResourceId), Resource>,
    online: bool,
    faults: VecDeque<Option<Fault>>,
    log: Vec<ApiRequest>,
    last_revision: u64,
}

/// Versioned in-process backend.
///
/// Every accepted write bumps the resource revision. Writes carrying a stale
/// `If-Match` are rejected with `412` and the current value, so replaying an
/// already applied request never produces a second effect. Useful for tests
/// and demos; all data is lost on drop.
#[derive(Debug)]
pub struct MemoryBackend {
    state: Mutex<State>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    /// Create a new empty, reachable backend.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                resources: BTreeMap::new(),
                online: true,
                faults: VecDeque::new(),
                log: Vec::new(),
                last_revision: 0,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Make the backend reachable or unreachable.
    pub fn set_online(&self, online: bool) {
        self.state().online = online;
    }

    pub fn is_online(&self) -> bool {
        self.state().online
    }

    /// Fail the next `count` sends with `fault`.
    pub fn fail_next(&self, count: usize, fault: Fault) {
        let mut state = self.state();
        state.faults.extend(std::iter::repeat(Some(fault)).take(count));
    }

    /// Script the outcome of the next sends in order; `None` lets a send through.
    pub fn script(&self, steps: impl IntoIterator<Item = Option<Fault>>) {
        self.state().faults.extend(steps);
    }

    /// Write a resource directly, as another client would. Returns the new revision.
    pub fn server_update(&self, collection: &Collection, id: &ResourceId, data: Value) -> Revision {
        let mut state = self.state();
        let revision = state.bump();
        state
            .resources
            .insert((collection.clone(), id.clone()), Resource { data, revision });
        revision
    }

    /// Delete a resource directly, as another client would.
    pub fn server_delete(&self, collection: &Collection, id: &ResourceId) -> bool {
        self.state()
            .resources
            .remove(&(collection.clone(), id.clone()))
            .is_some()
    }

    /// Current value and revision of a resource.
    pub fn get(&self, collection: &Collection, id: &ResourceId) -> Option<(Value, Revision)> {
        self.state()
            .resources
            .get(&(collection.clone(), id.clone()))
            .map(|r| (r.data.clone(), r.revision))
    }

    /// Every send that reached the backend, in arrival order.
    pub fn requests(&self) -> Vec<ApiRequest> {
        self.state().log.clone()
    }

    /// Sends that reached the backend for one resource.
    pub fn requests_for(&self, collection: &Collection, id: &ResourceId) -> Vec<ApiRequest> {
        self.state()
            .log
            .iter()
            .filter(|r| &r.collection == collection && r.resource_id.as_ref() == Some(id))
            .cloned()
            .collect()
    }

    fn unreachable() -> Error {
        Error::Network("backend unreachable".to_string())
    }
}

impl State {
    fn bump(&mut self) -> Revision {
        self.last_revision += 1;
        Revision(self.last_revision)
    }

    fn apply(&mut self, request: &ApiRequest) -> ApiResponse {
        let Some(id) = request.resource_id.clone() else {
            return ApiResponse::new(400);
        };
        let key = (request.collection.clone(), id);
        let current = self.resources.get(&key).cloned();

        if let Some(expected) = request.if_match {
            match &current {
                Some(resource) if resource.revision == expected => {}
                Some(resource) => return conflict(412, resource),
                None => return ApiResponse::new(412),
            }
        }

        match (request.method, current) {
            (Method::Post, Some(resource)) if request.if_match.is_none() => conflict(409, &resource),
            (Method::Post, _) | (Method::Put, _) => {
                let created = !self.resources.contains_key(&key);
                let data = request.body.clone().unwrap_or(Value::Null);
                self.store(key, data, if created { 201 } else { 200 })
            }
            (Method::Patch, Some(resource)) => {
                let mut data = resource.data;
                if let Some(patch) = &request.body {
                    merge_patch(&mut data, patch);
                }
                self.store(key, data, 200)
            }
            (Method::Patch, None) | (Method::Delete, None) => ApiResponse::new(404),
            (Method::Delete, Some(_)) => {
                self.resources.remove(&key);
                ApiResponse::new(204)
            }
        }
    }

    fn store(&mut self, key: (Collection, ResourceId), data: Value, status: u16) -> ApiResponse {
        let revision = self.bump();
        self.resources.insert(
            key,
            Resource {
                data: data.clone(),
                revision,
            },
        );
        ApiResponse {
            status,
            body: Some(data),
            revision: Some(revision),
        }
    }
}

fn conflict(status: u16, resource: &Resource) -> ApiResponse {
    ApiResponse {
        status,
        body: Some(resource.data.clone()),
        revision: Some(resource.revision),
    }
}

#[async_trait]
impl Transport for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    async fn send(&self, request: &ApiRequest) -> Result<ApiResponse> {
        let mut state = self.state();
        if !state.online {
            return Err(Self::unreachable());
        }
        state.log.push(request.clone());
        debug!("memory backend: {} {}", request.method, request.path());

        match state.faults.pop_front().flatten() {
            Some(Fault::Network) => Err(Self::unreachable()),
            Some(Fault::Timeout) => Err(Error::Timeout("backend did not answer".to_string())),
            Some(Fault::Status(status)) => Ok(ApiResponse::new(status)),
            None => Ok(state.apply(request)),
        }
    }

    async fn fetch(&self, collection: &Collection, id: &ResourceId) -> Result<Option<RemoteItem>> {
        let state = self.state();
        if !state.online {
            return Err(Self::unreachable());
        }
        Ok(state
            .resources
            .get(&(collection.clone(), id.clone()))
            .map(|r| RemoteItem {
                id: id.clone(),
                data: r.data.clone(),
                revision: Some(r.revision),
            }))
    }

    async fn list(&self, collection: &Collection) -> Result<Vec<RemoteItem>> {
        let state = self.state();
        if !state.online {
            return Err(Self::unreachable());
        }
        Ok(state
            .resources
            .iter()
            .filter(|((c, _), _)| c == collection)
            .map(|((_, id), r)| RemoteItem {
                id: id.clone(),
                data: r.data.clone(),
                revision: Some(r.revision),
            })
            .collect())
    }

    async fn probe(&self) -> Result<()> {
        if self.is_online() {
            Ok(())
        } else {
            Err(Self::unreachable())
        }
    }
}
