//! calibre-api-core - Core library for calibre-api
//!
//! Read-only Calibre metadata source, query engine, persistent query cache
//! with single-flight computation, and the token access gate.

pub mod auth;
pub mod cache;
pub mod config;
pub mod error;
pub mod models;
pub mod query;
pub mod service;
pub mod source;
#[cfg(any(test, feature = "test-utils"))]
pub mod testing;
pub mod watcher;

pub use auth::{AuthDecision, Authorizer, StaticTokenSet};
pub use cache::{CacheEntry, CacheStatus, Fingerprint, QueryCache};
pub use config::{InvalidationPolicy, ServiceConfig};
pub use error::{CacheError, ConfigError, DegradedState, QueryError, SourceError};
pub use query::QueryEngine;
pub use service::{LibraryService, QueryTtls};
pub use source::{CalibreLibrary, MetadataSource};
pub use watcher::LibraryWatcher;
