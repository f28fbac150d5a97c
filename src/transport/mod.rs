//! Transport to HTTP backends

mod http;

pub use self::http::HttpTransport;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use serde_json::Value;

use crate::Result;
use crate::backend::Backend;
use crate::pool::PooledConnection;

/// A single outbound request, fully resolved
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    /// Backend id (for error attribution)
    pub backend_id: String,
    /// Absolute URL
    pub url: String,
    /// HTTP method
    pub method: Method,
    /// JSON payload: body for writes, query string for reads
    pub payload: Option<Value>,
    /// Static headers from the backend config
    pub headers: HashMap<String, String>,
    /// Bearer credential
    pub bearer: Option<String>,
    /// Per-request timeout
    pub timeout: Duration,
}

impl OutboundRequest {
    /// Request to `endpoint` under `base_url` carrying the backend's headers
    #[must_use]
    pub fn new(backend: &Backend, base_url: &str, endpoint: &str, method: Method, timeout: Duration) -> Self {
        Self {
            backend_id: backend.id.clone(),
            url: Backend::endpoint_url(base_url, endpoint),
            method,
            payload: None,
            headers: backend.config.headers.clone(),
            bearer: None,
            timeout,
        }
    }

    /// Attach a payload
    #[must_use]
    pub fn with_payload(mut self, payload: Option<Value>) -> Self {
        self.payload = payload;
        self
    }

    /// Attach a bearer credential
    #[must_use]
    pub fn with_bearer(mut self, bearer: Option<String>) -> Self {
        self.bearer = bearer;
        self
    }
}

/// Sends requests over a pooled connection
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a request and decode the response body.
    ///
    /// Non-2xx answers, timeouts and connection failures are returned as
    /// errors classified for the retry policy.
    async fn send(&self, conn: &PooledConnection, request: &OutboundRequest) -> Result<Value>;
}

/// Parse a method name, case-insensitively
///
/// # Errors
///
/// Returns [`crate::Error::Internal`] for names that are not valid HTTP methods.
pub fn parse_method(method: &str) -> Result<Method> {
    Method::from_bytes(method.trim().to_ascii_uppercase().as_bytes())
        .map_err(|_| crate::Error::Internal(format!("invalid HTTP method: {method}")))
}
