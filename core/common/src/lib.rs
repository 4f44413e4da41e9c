//! Common utilities and types shared across harborsync crates.
//!
//! This module provides the error taxonomy and the identifier types used by the
//! store, the transport and the sync engine, so that every layer agrees on what a
//! collection, a resource and a revision are.

pub mod error;
pub mod json;
pub mod types;

pub use error::{Error, ErrorClass, Result};
pub use types::{Collection, ConflictStrategy, Method, Priority, ResourceId, Revision};
