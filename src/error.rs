use std::io;
use std::time::Duration;

use thiserror::Error;

/// Errors produced by the aggregation layer.
///
/// Transient and rate-limit failures are absorbed by the HTTP client's retry
/// loop; adapters only ever surface `SourceUnavailable`. Callers of the
/// aggregator see `Validation`, `NotFound`, `ExplorerDenied` and
/// `AllSourcesFailed`.
#[derive(Error, Debug)]
pub enum HubError {
    #[error("transient network error for {url} after {attempts} attempt(s): {reason}")]
    TransientNetwork {
        url: String,
        attempts: u32,
        reason: String,
    },

    #[error("rate limited by {host} after {attempts} attempt(s)")]
    RateLimited {
        host: String,
        attempts: u32,
        retry_after: Option<Duration>,
    },

    #[error("source {source_id} unavailable: {reason}")]
    SourceUnavailable { source_id: String, reason: String },

    #[error("connection pool exhausted ({in_use} in use, max {max})")]
    PoolExhausted { in_use: usize, max: usize },

    #[error("corrupted cache entry {key}: {reason}")]
    CacheCorruption { key: String, reason: String },

    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("all sources failed for {query}: {}", .failures.join("; "))]
    AllSourcesFailed {
        query: String,
        failures: Vec<String>,
    },

    #[error("explorer query rejected: {reason}")]
    ExplorerDenied { reason: String },

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("JSON error at {context}: {source}")]
    Json {
        context: String,
        source: serde_json::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("http client error: {0}")]
    Http(String),
}

pub type Result<T> = std::result::Result<T, HubError>;

impl HubError {
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn source_unavailable(source_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SourceUnavailable {
            source_id: source_id.into(),
            reason: reason.into(),
        }
    }

    pub fn json(context: impl Into<String>, source: serde_json::Error) -> Self {
        Self::Json {
            context: context.into(),
            source,
        }
    }

    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Whether another attempt at the same operation could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TransientNetwork { .. } | Self::RateLimited { .. } | Self::PoolExhausted { .. }
        )
    }

    /// Wraps a network-level failure as the adapter-facing terminal error.
    pub fn into_source_unavailable(self, source_id: &str) -> Self {
        match self {
            Self::SourceUnavailable { .. } | Self::Cancelled => self,
            other => Self::source_unavailable(source_id, other.to_string()),
        }
    }
}
