//! Transport trait definition.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use harborsync_common::{Collection, Error, Method, ResourceId, Result, Revision};

/// A mutating request sent to the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiRequest {
    pub method: Method,
    pub collection: Collection,
    pub resource_id: Option<ResourceId>,
    pub body: Option<Value>,
    /// Revision the change was based on; the backend rejects the write with
    /// `412` when its current revision differs.
    pub if_match: Option<Revision>,
}

impl ApiRequest {
    pub fn new(method: Method, collection: Collection, resource_id: Option<ResourceId>) -> Self {
        Self {
            method,
            collection,
            resource_id,
            body: None,
            if_match: None,
        }
    }

    pub fn with_body(mut self, body: Option<Value>) -> Self {
        self.body = body;
        self
    }

    pub fn with_if_match(mut self, revision: Option<Revision>) -> Self {
        self.if_match = revision;
        self
    }

    /// Backend path, e.g. `/containers/web`.
    pub fn path(&self) -> String {
        match &self.resource_id {
            Some(id) => format!("/{}/{}", self.collection, id),
            None => format!("/{}", self.collection),
        }
    }
}

/// Backend answer to an [`ApiRequest`].
///
/// Non-success statuses are returned as data, not errors; callers classify
/// them with [`ApiResponse::error`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Option<Value>,
    /// Current revision of the resource, when the backend reports one.
    pub revision: Option<Revision>,
}

impl ApiResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            body: None,
            revision: None,
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// The error this status maps to, if any.
    pub fn error(&self) -> Option<Error> {
        let message = self
            .body
            .as_ref()
            .and_then(|b| b.get("message"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format!("HTTP {}", self.status));
        Error::from_status(self.status, message)
    }
}

/// A resource as listed or fetched from the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteItem {
    pub id: ResourceId,
    pub data: Value,
    #[serde(default)]
    pub revision: Option<Revision>,
}

/// Request/response channel to the backend.
///
/// Implementations return `Err` only when no status was obtained (network
/// failure, timeout). Any status the backend produced comes back as an
/// [`ApiResponse`].
#[async_trait]
pub trait Transport: Send + Sync {
    /// Get the transport name (e.g., "http", "memory").
    fn name(&self) -> &str;

    /// Send a mutating request.
    ///
    /// # Errors
    /// - `Error::Network` if the backend could not be reached
    /// - `Error::Timeout` if no answer arrived in time
    async fn send(&self, request: &ApiRequest) -> Result<ApiResponse>;

    /// Fetch one resource. Returns `None` if the backend does not have it.
    async fn fetch(&self, collection: &Collection, id: &ResourceId) -> Result<Option<RemoteItem>>;

    /// List every resource of a collection.
    async fn list(&self, collection: &Collection) -> Result<Vec<RemoteItem>>;

    /// Cheap reachability check.
    async fn probe(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use harborsync_common::ErrorClass;
    use serde_json::json;

    #[test]
    fn test_request_path() {
        let request = ApiRequest::new(
            Method::Put,
            Collection::containers(),
            Some(ResourceId::new("web").unwrap()),
        );
        assert_eq!(request.path(), "/containers/web");

        let request = ApiRequest::new(Method::Post, Collection::services(), None);
        assert_eq!(request.path(), "/services");
    }

    #[test]
    fn test_response_error_uses_backend_message() {
        let mut response = ApiResponse::new(422);
        response.body = Some(json!({"message": "replicas must be positive"}));
        let err = response.error().unwrap();
        assert_eq!(err.class(), ErrorClass::Permanent);
        assert!(err.to_string().contains("replicas must be positive"));

        assert!(ApiResponse::new(204).error().is_none());
        assert!(ApiResponse::new(204).is_success());
    }

    #[test]
    fn test_remote_item_revision_optional() {
        let item: RemoteItem = serde_json::from_value(json!({"id": "db", "data": {}})).unwrap();
        assert_eq!(item.revision, None);
    }
}
