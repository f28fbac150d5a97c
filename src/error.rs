//! Error types for the resilient gateway

use std::io;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for the gateway
pub type Result<T> = std::result::Result<T, Error>;

/// Gateway errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Config reload rejected; the previous registry stays in effect
    #[error("Config reload failed: {0}")]
    ConfigReload(String),

    /// Backend not found in the registry
    #[error("Backend not found: {0}")]
    BackendNotFound(String),

    /// Network unreachable / connection refused
    #[error("Connection to backend '{backend}' failed: {message}")]
    Connection {
        /// Backend id
        backend: String,
        /// Underlying error message
        message: String,
    },

    /// Call exceeded the per-backend timeout
    #[error("Backend '{backend}' timed out after {}ms", timeout.as_millis())]
    Timeout {
        /// Backend id
        backend: String,
        /// Timeout that was exceeded
        timeout: Duration,
    },

    /// Circuit breaker is blocking calls
    #[error("Circuit open for backend '{backend}', retry in {}s", retry_after.as_secs())]
    CircuitOpen {
        /// Backend id
        backend: String,
        /// Remaining cooldown
        retry_after: Duration,
    },

    /// Sliding-window rate limit hit
    #[error("Rate limit exceeded for backend '{backend}' ({limit} requests/minute)")]
    RateLimitExceeded {
        /// Backend id
        backend: String,
        /// Configured limit
        limit: u32,
    },

    /// No connection slot available
    #[error("Connection pool exhausted for backend '{0}'")]
    PoolExhausted(String),

    /// Backend answered with a failure status
    #[error("Backend '{backend}' returned HTTP {status}")]
    Backend {
        /// Backend id
        backend: String,
        /// HTTP status code
        status: u16,
        /// Response body (truncated)
        body: String,
    },

    /// Request queue at capacity
    #[error("Request queue full (capacity {0})")]
    QueueFull(usize),

    /// Diagnostics store error
    #[error("Diagnostics error: {0}")]
    Diagnostics(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// SQLite error
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Gateway shutting down
    #[error("Gateway shutdown")]
    Shutdown,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Coarse classification of an [`Error`], surfaced to callers in structured results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Network unreachable
    Connection,
    /// Per-call timeout exceeded
    Timeout,
    /// Circuit breaker open
    CircuitOpen,
    /// Rate limit hit
    RateLimitExceeded,
    /// Pool exhausted
    PoolExhausted,
    /// Backend failure status
    BackendError,
    /// Queue full
    QueueFull,
    /// Config reload rejected
    ConfigReload,
    /// Unknown backend
    BackendNotFound,
    /// Anything else
    Internal,
}

impl ErrorKind {
    /// Stable snake_case name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connection => "connection",
            Self::Timeout => "timeout",
            Self::CircuitOpen => "circuit_open",
            Self::RateLimitExceeded => "rate_limit_exceeded",
            Self::PoolExhausted => "pool_exhausted",
            Self::BackendError => "backend_error",
            Self::QueueFull => "queue_full",
            Self::ConfigReload => "config_reload",
            Self::BackendNotFound => "backend_not_found",
            Self::Internal => "internal",
        }
    }
}

impl Error {
    /// Classify this error
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Connection { .. } => ErrorKind::Connection,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            Self::RateLimitExceeded { .. } => ErrorKind::RateLimitExceeded,
            Self::PoolExhausted(_) => ErrorKind::PoolExhausted,
            Self::Backend { .. } => ErrorKind::BackendError,
            Self::QueueFull(_) => ErrorKind::QueueFull,
            Self::ConfigReload(_) => ErrorKind::ConfigReload,
            Self::BackendNotFound(_) => ErrorKind::BackendNotFound,
            Self::Http(e) if e.is_timeout() => ErrorKind::Timeout,
            Self::Http(e) if e.is_connect() => ErrorKind::Connection,
            _ => ErrorKind::Internal,
        }
    }

    /// Transient failures the executor retries locally: connection errors,
    /// timeouts and 5xx responses.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection { .. } | Self::Timeout { .. } => true,
            Self::Backend { status, .. } => *status >= 500,
            Self::Http(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }

    /// Failures that say nothing about backend health and must not trip the breaker.
    #[must_use]
    pub fn is_local_rejection(&self) -> bool {
        matches!(
            self,
            Self::CircuitOpen { .. }
                | Self::RateLimitExceeded { .. }
                | Self::PoolExhausted(_)
                | Self::QueueFull(_)
        )
    }

    /// Owned copy that keeps the variant of network failures; anything else
    /// becomes `Internal` carrying its message
    #[must_use]
    pub fn detached(&self) -> Self {
        match self {
            Self::Connection { backend, message } => Self::Connection {
                backend: backend.clone(),
                message: message.clone(),
            },
            Self::Timeout { backend, timeout } => Self::Timeout {
                backend: backend.clone(),
                timeout: *timeout,
            },
            Self::Backend { backend, status, body } => Self::Backend {
                backend: backend.clone(),
                status: *status,
                body: body.clone(),
            },
            other => Self::Internal(other.to_string()),
        }
    }

    /// Short form used in the `status` column of the request log
    #[must_use]
    pub fn status_label(&self) -> String {
        match self {
            Self::Backend { status, .. } => status.to_string(),
            Self::Timeout { .. } => "timeout".to_string(),
            Self::Connection { .. } => "connection_error".to_string(),
            other => other.kind().as_str().to_string(),
        }
    }
}
