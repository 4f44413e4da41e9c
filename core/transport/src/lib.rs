//! Backend transport for harborsync.
//!
//! The sync engine only needs a request/response contract with the backend
//! plus a comparable per-resource revision. This crate defines that contract
//! and ships two implementations.
//!
//! # Backends
//! - [`HttpTransport`]: REST over HTTP, revisions carried in `ETag`/`If-Match`
//! - [`MemoryBackend`]: versioned in-process backend with scripted faults

pub mod http;
pub mod memory;
pub mod transport;

pub use http::HttpTransport;
pub use memory::{Fault, MemoryBackend};
pub use transport::{ApiRequest, ApiResponse, RemoteItem, Transport};
