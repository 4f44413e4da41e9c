//! REST transport over HTTP.

use async_trait::async_trait;
use reqwest::{header, Client, StatusCode};
use std::time::Duration;
use tracing::debug;
use url::Url;

use harborsync_common::{Collection, Error, Method, ResourceId, Result, Revision};

use crate::transport::{ApiRequest, ApiResponse, RemoteItem, Transport};

/// Default per-request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Path probed for reachability, relative to the base URL.
const PROBE_PATH: &str = "health";

/// Transport talking to a REST backend.
///
/// Resources live at `<base>/<collection>/<id>`; listing a collection returns
/// a JSON array of [`RemoteItem`]. The resource revision travels in the
/// `ETag` response header and the `If-Match` request header.
///
/// A `412` answer is expected to carry the current resource and its `ETag`.
/// Bodies of other error statuses are only read for a `message`.
pub struct HttpTransport {
    http: Client,
    base: Url,
}

impl HttpTransport {
    /// Create a transport for the backend at `base_url`.
    ///
    /// # Errors
    /// - `base_url` is not an absolute http(s) URL
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let base = Url::parse(base_url)
            .map_err(|e| Error::InvalidInput(format!("Invalid backend URL {}: {}", base_url, e)))?;
        if base.cannot_be_a_base() || !matches!(base.scheme(), "http" | "https") {
            return Err(Error::InvalidInput(format!(
                "Backend URL must be http(s): {}",
                base_url
            )));
        }

        let http = Client::builder()
            .user_agent(concat!("harborsync/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { http, base })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    fn url_for(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| Error::InvalidInput(format!("Invalid backend URL {}", self.base)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn request_url(&self, collection: &Collection, id: Option<&ResourceId>) -> Result<Url> {
        match id {
            Some(id) => self.url_for(&[collection.as_str(), id.as_str()]),
            None => self.url_for(&[collection.as_str()]),
        }
    }

    async fn into_response(response: reqwest::Response) -> Result<ApiResponse> {
        let status = response.status().as_u16();
        let revision = response
            .headers()
            .get(header::ETAG)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim_start_matches("W/").parse::<Revision>().ok());
        let bytes = response.bytes().await.map_err(map_reqwest_error)?;
        // Non-JSON bodies (e.g. plain-text error pages) are dropped.
        let body = if bytes.is_empty() {
            None
        } else {
            serde_json::from_slice(&bytes).ok()
        };
        Ok(ApiResponse {
            status,
            body,
            revision,
        })
    }
}

fn map_reqwest_error(err: reqwest::Error) -> Error {
    if err.is_timeout() {
        Error::Timeout(err.to_string())
    } else {
        Error::Network(err.to_string())
    }
}

fn http_method(method: Method) -> reqwest::Method {
    match method {
        Method::Post => reqwest::Method::POST,
        Method::Put => reqwest::Method::PUT,
        Method::Patch => reqwest::Method::PATCH,
        Method::Delete => reqwest::Method::DELETE,
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn name(&self) -> &str {
        "http"
    }

    async fn send(&self, request: &ApiRequest) -> Result<ApiResponse> {
        let url = self.request_url(&request.collection, request.resource_id.as_ref())?;
        debug!("{} {}", request.method, url);

        let mut builder = self.http.request(http_method(request.method), url);
        if let Some(revision) = request.if_match {
            builder = builder.header(header::IF_MATCH, format!("\"{}\"", revision));
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(map_reqwest_error)?;
        Self::into_response(response).await
    }

    async fn fetch(&self, collection: &Collection, id: &ResourceId) -> Result<Option<RemoteItem>> {
        let url = self.request_url(collection, Some(id))?;
        let response = self.http.get(url).send().await.map_err(map_reqwest_error)?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let response = Self::into_response(response).await?;
        if let Some(err) = response.error() {
            return Err(err);
        }
        Ok(Some(RemoteItem {
            id: id.clone(),
            data: response.body.unwrap_or(serde_json::Value::Null),
            revision: response.revision,
        }))
    }

    async fn list(&self, collection: &Collection) -> Result<Vec<RemoteItem>> {
        let url = self.request_url(collection, None)?;
        let response = self.http.get(url).send().await.map_err(map_reqwest_error)?;

        let status = response.status();
        if !status.is_success() {
            let response = Self::into_response(response).await?;
            return Err(response
                .error()
                .unwrap_or_else(|| Error::Server {
                    status: status.as_u16(),
                    message: "Unexpected status".to_string(),
                }));
        }

        response
            .json::<Vec<RemoteItem>>()
            .await
            .map_err(|e| Error::Serialization(format!("Failed to parse listing: {}", e)))
    }

    async fn probe(&self) -> Result<()> {
        let url = self.url_for(&[PROBE_PATH])?;
        let response = self.http.get(url).send().await.map_err(map_reqwest_error)?;
        if response.status().is_server_error() {
            return Err(Error::Server {
                status: response.status().as_u16(),
                message: "Backend unhealthy".to_string(),
            });
        }
        Ok(())
    }
}
