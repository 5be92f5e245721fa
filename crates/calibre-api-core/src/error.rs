//! Error types for calibre-api-core
//!
//! One thiserror enum per layer. `QueryError` is what callers of the service
//! see; source and cache errors are translated (or swallowed) before they get
//! that far.

use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced to callers of the query service
///
/// `Clone` because a single in-flight computation hands the same outcome to
/// every waiter on its fingerprint.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    // ===================
    // Access
    // ===================
    #[error("Missing or malformed access token")]
    Unauthorized,

    #[error("Access token not recognized")]
    Forbidden,

    // ===================
    // Request
    // ===================
    #[error("Invalid filter '{field}': {reason}")]
    InvalidFilter { field: String, reason: String },

    #[error("Book not found: {id}")]
    NotFound { id: i64 },

    // ===================
    // Backend
    // ===================
    #[error("Metadata source unavailable: {message}")]
    SourceUnavailable { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl QueryError {
    pub fn invalid_filter(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidFilter {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Client errors are never worth retrying with the same request
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::Unauthorized | Self::Forbidden | Self::InvalidFilter { .. } | Self::NotFound { .. }
        )
    }

    /// Returns `true` if a client retrying later (with backoff) might succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::SourceUnavailable { .. })
    }
}

impl From<SourceError> for QueryError {
    fn from(error: SourceError) -> Self {
        Self::SourceUnavailable {
            message: error.to_string(),
        }
    }
}

impl From<serde_json::Error> for QueryError {
    fn from(error: serde_json::Error) -> Self {
        Self::Internal {
            message: format!("Failed to serialize result: {}", error),
        }
    }
}

/// Errors raised by a metadata source adapter
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Metadata database not found: {path}")]
    DatabaseNotFound { path: PathBuf },

    #[error("Failed to open metadata database: {path}")]
    Open {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Metadata query failed: {context}")]
    Query {
        context: &'static str,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Failed to stat metadata database: {path}")]
    Stat {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{message}")]
    Unavailable { message: String },
}

/// Errors raised by the durable cache tier
///
/// These never reach a client: the cache layer logs them and degrades to
/// direct computation.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Failed to create cache directory: {path}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Cache database error: {context}")]
    Database {
        context: &'static str,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Cache storage unavailable: {message}")]
    Unavailable { message: String },

    #[error("Invalid invalidation pattern '{pattern}'")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("Cache storage task failed: {message}")]
    Task { message: String },
}

impl CacheError {
    pub(crate) fn db(context: &'static str) -> impl FnOnce(rusqlite::Error) -> Self {
        move |source| Self::Database { context, source }
    }
}

/// Errors raised while loading or validating configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[source] Box<figment::Error>),

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },
}

impl ConfigError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }
}

impl From<figment::Error> for ConfigError {
    fn from(error: figment::Error) -> Self {
        Self::Load(Box::new(error))
    }
}

/// Degraded state indicator for the cache layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DegradedState {
    /// Memory and durable tiers both available
    Healthy,
    /// Durable tier could not be opened; entries do not survive restarts
    MemoryOnly { reason: String },
}

impl DegradedState {
    pub fn is_healthy(&self) -> bool {
        matches!(self, DegradedState::Healthy)
    }

    pub fn is_degraded(&self) -> bool {
        !self.is_healthy()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_errors_are_not_retryable() {
        let errors = [
            QueryError::Unauthorized,
            QueryError::Forbidden,
            QueryError::invalid_filter("limit", "must be between 1 and 1000"),
            QueryError::NotFound { id: 7 },
        ];

        for error in errors {
            assert!(error.is_client_error(), "{error} should be a client error");
            assert!(!error.is_retryable(), "{error} should not be retryable");
        }
    }

    #[test]
    fn test_source_error_maps_to_unavailable() {
        let error: QueryError = SourceError::DatabaseNotFound {
            path: PathBuf::from("/library/metadata.db"),
        }
        .into();

        assert!(matches!(error, QueryError::SourceUnavailable { .. }));
        assert!(error.is_retryable());
        assert!(error.to_string().contains("/library/metadata.db"));
    }

    #[test]
    fn test_degraded_state() {
        assert!(DegradedState::Healthy.is_healthy());
        let degraded = DegradedState::MemoryOnly {
            reason: "disk full".to_string(),
        };
        assert!(degraded.is_degraded());
    }
}
