//! Call execution
//!
//! A logical call walks cache → circuit breaker → rate limiter → pool →
//! network. Transient failures are retried with exponential backoff; when the
//! primary URL is exhausted and a fallback URL is configured, exactly one
//! fallback attempt is made. Every attempt is logged to diagnostics, while
//! the circuit breaker and health tracker see one outcome per logical call.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::backend::{Backend, BackendRegistry};
use crate::cache::{CacheKey, ResponseCache};
use crate::config::AcquireMode;
use crate::credentials::{CredentialProvider, EnvCredentials, bearer_for};
use crate::diagnostics::{AttemptSource, DiagnosticsRecorder, RequestMetrics};
use crate::error::ErrorKind;
use crate::failsafe::{Admission, Failsafe, with_retry};
use crate::pool::ConnectionPool;
use crate::transport::{HttpTransport, OutboundRequest, Transport, parse_method};
use crate::{Error, Result};

/// A logical call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallRequest {
    /// Target backend
    pub backend_id: String,
    /// Path below the backend URL
    pub endpoint: String,
    /// HTTP method
    #[serde(default = "default_method")]
    pub method: String,
    /// JSON payload
    #[serde(default)]
    pub payload: Option<Value>,
    /// Serve from and store into the response cache
    #[serde(default = "default_use_cache")]
    pub use_cache: bool,
    /// TTL override for the stored response
    #[serde(default, with = "optional_duration")]
    pub cache_ttl: Option<Duration>,
    /// Attempt budget override (first try included)
    #[serde(default)]
    pub retries: Option<u32>,
    /// Pool acquisition override
    #[serde(default)]
    pub acquire: Option<AcquireMode>,
}

fn default_method() -> String {
    "GET".to_string()
}

fn default_use_cache() -> bool {
    true
}

impl CallRequest {
    /// A cacheable `GET` of `endpoint` on `backend_id`
    #[must_use]
    pub fn new(backend_id: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            backend_id: backend_id.into(),
            endpoint: endpoint.into(),
            method: default_method(),
            payload: None,
            use_cache: default_use_cache(),
            cache_ttl: None,
            retries: None,
            acquire: None,
        }
    }

    /// Set the HTTP method
    #[must_use]
    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }

    /// Set the payload
    #[must_use]
    pub fn payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Mark the call cacheable
    #[must_use]
    pub fn cached(mut self, use_cache: bool) -> Self {
        self.use_cache = use_cache;
        self
    }

    /// Override the cache TTL
    #[must_use]
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = Some(ttl);
        self
    }

    /// Override the attempt budget
    #[must_use]
    pub fn retries(mut self, attempts: u32) -> Self {
        self.retries = Some(attempts);
        self
    }

    /// Override how the pool is waited on
    #[must_use]
    pub fn acquire(mut self, mode: AcquireMode) -> Self {
        self.acquire = Some(mode);
        self
    }
}

/// Failure carried by a [`CallResult`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallError {
    /// Classification
    pub kind: ErrorKind,
    /// Human-readable description
    pub message: String,
}

impl From<&Error> for CallError {
    fn from(e: &Error) -> Self {
        Self {
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

/// Structured outcome of a logical call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallResult {
    /// Whether the call produced data
    pub success: bool,
    /// Response body
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Failure
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<CallError>,
    /// Wall time of the logical call
    pub latency_ms: u64,
    /// Answered from the response cache
    pub served_from_cache: bool,
    /// Answered by the fallback URL
    pub used_fallback: bool,
    /// Network attempts made
    pub attempts: u32,
}

impl CallResult {
    /// Failed result for an error raised before any attempt
    #[must_use]
    pub fn rejected(error: &Error) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
            latency_ms: 0,
            served_from_cache: false,
            used_fallback: false,
            attempts: 0,
        }
    }

    /// Error kind, when the call failed
    #[must_use]
    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }
}

/// What happened on the way to an outcome
#[derive(Debug, Default)]
struct Trace {
    attempts: u32,
    used_fallback: bool,
    served_from_cache: bool,
}

/// Executes calls against registered backends
pub struct CallExecutor {
    registry: Arc<BackendRegistry>,
    failsafe: Arc<Failsafe>,
    pool: Arc<ConnectionPool>,
    cache: Option<Arc<ResponseCache>>,
    diagnostics: Arc<DiagnosticsRecorder>,
    transport: Arc<dyn Transport>,
    credentials: Arc<dyn CredentialProvider>,
}

impl CallExecutor {
    /// Create an executor using the HTTP transport and env credentials.
    ///
    /// Pass `None` as `cache` to disable response caching.
    #[must_use]
    pub fn new(
        registry: Arc<BackendRegistry>,
        failsafe: Arc<Failsafe>,
        pool: Arc<ConnectionPool>,
        cache: Option<Arc<ResponseCache>>,
        diagnostics: Arc<DiagnosticsRecorder>,
    ) -> Self {
        Self {
            registry,
            failsafe,
            pool,
            cache,
            diagnostics,
            transport: Arc::new(HttpTransport::new()),
            credentials: Arc::new(EnvCredentials),
        }
    }

    /// Use a different transport
    #[must_use]
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = transport;
        self
    }

    /// Use a different credential provider
    #[must_use]
    pub fn with_credentials(mut self, credentials: Arc<dyn CredentialProvider>) -> Self {
        self.credentials = credentials;
        self
    }

    /// How long a deferred call to `backend_id` should wait before the rate
    /// limiter would admit it
    #[must_use]
    pub fn admission_delay(&self, backend_id: &str) -> Duration {
        let Some(backend) = self.registry.get(backend_id) else {
            return Duration::ZERO;
        };
        let limiter = &self.failsafe.rate_limiter;
        limiter.time_until_allowed(&backend.id, backend.rate_limit(limiter.default_limit()))
    }

    /// Execute a call; never fails, the outcome is carried in the result
    #[tracing::instrument(skip_all, fields(backend = %request.backend_id, endpoint = %request.endpoint))]
    pub async fn call(&self, request: &CallRequest) -> CallResult {
        let started = Instant::now();
        let mut trace = Trace::default();
        let outcome = self.execute(request, &mut trace).await;
        let latency = started.elapsed();

        let label = match &outcome {
            Ok(_) if trace.served_from_cache => "cache",
            Ok(_) if trace.used_fallback => "fallback",
            Ok(_) => "success",
            Err(e) => e.kind().as_str(),
        };
        telemetry_metrics::counter!(
            "gateway_calls_total",
            "backend" => request.backend_id.clone(),
            "outcome" => label
        )
        .increment(1);
        telemetry_metrics::histogram!("gateway_call_duration_seconds", "backend" => request.backend_id.clone())
            .record(latency.as_secs_f64());

        let (success, data, error) = match outcome {
            Ok(value) => (true, Some(value), None),
            Err(e) => {
                debug!(error = %e, attempts = trace.attempts, "Call failed");
                (false, None, Some(CallError::from(&e)))
            }
        };

        CallResult {
            success,
            data,
            error,
            latency_ms: latency.as_millis() as u64,
            served_from_cache: trace.served_from_cache,
            used_fallback: trace.used_fallback,
            attempts: trace.attempts,
        }
    }

    async fn execute(&self, request: &CallRequest, trace: &mut Trace) -> Result<Value> {
        let backend = self
            .registry
            .get(&request.backend_id)
            .ok_or_else(|| Error::BackendNotFound(request.backend_id.clone()))?;
        let method = parse_method(&request.method)?;

        let cache_key = self.cache.as_ref().filter(|_| request.use_cache).map(|cache| {
            let key = CacheKey::build(
                &backend.id,
                &request.endpoint,
                method.as_str(),
                request.payload.as_ref(),
            );
            (cache, key)
        });

        if let Some((cache, key)) = &cache_key {
            if let Some(value) = cache.get(key) {
                trace.served_from_cache = true;
                self.log_attempt(&backend, request, AttemptSource::Cache, Duration::ZERO, &Ok(()));
                debug!("Served from cache");
                return Ok(value);
            }
        }

        let breaker = self.failsafe.circuit_breakers.get(&backend.id);
        let admission = breaker.try_acquire().map_err(|retry_after| Error::CircuitOpen {
            backend: backend.id.clone(),
            retry_after,
        })?;
        let release = || {
            if admission == Admission::Trial {
                breaker.release_trial();
            }
        };

        let limit = backend.rate_limit(self.failsafe.rate_limiter.default_limit());
        if !self.failsafe.rate_limiter.allow(&backend.id, limit) {
            release();
            return Err(Error::RateLimitExceeded {
                backend: backend.id.clone(),
                limit,
            });
        }

        let bearer = match bearer_for(self.credentials.as_ref(), &backend) {
            Ok(bearer) => bearer,
            Err(e) => {
                release();
                return Err(e);
            }
        };

        let started = Instant::now();
        let outcome = self
            .attempt_with_fallback(&backend, request, &method, bearer, trace)
            .await;

        match &outcome {
            Err(e) if e.is_local_rejection() => release(),
            Ok(_) => self.failsafe.record_call(&backend.id, true, started.elapsed()),
            Err(_) => self.failsafe.record_call(&backend.id, false, started.elapsed()),
        }

        if let (Ok(value), Some((cache, key))) = (&outcome, &cache_key) {
            let ttl = request.cache_ttl.unwrap_or_else(|| cache.default_ttl());
            cache.put(key, value.clone(), ttl);
        }

        outcome
    }

    async fn attempt_with_fallback(
        &self,
        backend: &Backend,
        request: &CallRequest,
        method: &Method,
        bearer: Option<String>,
        trace: &mut Trace,
    ) -> Result<Value> {
        let mode = request.acquire.unwrap_or_else(|| self.pool.default_mode());
        let policy = match request.retries {
            Some(attempts) => self.failsafe.retry_policy.with_attempts(attempts),
            None => self.failsafe.retry_policy.clone(),
        };

        let mut attempts = 0;
        // Last failure that came from the backend itself
        let last_network_error: Mutex<Option<Error>> = Mutex::new(None);
        let primary = with_retry(&policy, &backend.id, |attempt| {
            attempts = attempt;
            let last = &last_network_error;
            let sent = self.attempt(
                backend,
                request,
                method,
                &backend.config.url,
                AttemptSource::Primary,
                bearer.clone(),
                mode,
            );
            async move {
                let result = sent.await;
                if let Err(e) = &result {
                    if !e.is_local_rejection() {
                        *last.lock() = Some(e.detached());
                    }
                }
                result
            }
        })
        .await;
        trace.attempts = attempts;

        let error = match primary {
            Ok(value) => return Ok(value),
            // A retry turned away locally does not erase an earlier backend failure
            Err(e) if e.is_local_rejection() => match last_network_error.into_inner() {
                Some(network) => {
                    debug!(backend = %backend.id, rejection = %e, "Retry rejected locally after a backend failure");
                    network
                }
                None => return Err(e),
            },
            Err(e) => e,
        };

        let Some(fallback_url) = backend.config.fallback_url.as_deref() else {
            return Err(error);
        };

        warn!(
            backend = %backend.id,
            attempts,
            error = %error,
            fallback = fallback_url,
            "Primary exhausted, trying fallback"
        );
        trace.attempts += 1;
        match self
            .attempt(
                backend,
                request,
                method,
                fallback_url,
                AttemptSource::Fallback,
                bearer,
                mode,
            )
            .await
        {
            Ok(value) => {
                info!(backend = %backend.id, "Fallback succeeded");
                trace.used_fallback = true;
                Ok(value)
            }
            Err(fallback_error) => {
                warn!(backend = %backend.id, error = %fallback_error, "Fallback failed");
                Err(fallback_error)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn attempt(
        &self,
        backend: &Backend,
        request: &CallRequest,
        method: &Method,
        base_url: &str,
        source: AttemptSource,
        bearer: Option<String>,
        mode: AcquireMode,
    ) -> Result<Value> {
        let conn = self.pool.acquire(&backend.id, mode, backend.timeout()).await?;

        let outbound = OutboundRequest::new(backend, base_url, &request.endpoint, method.clone(), backend.timeout())
            .with_payload(request.payload.clone())
            .with_bearer(bearer);

        let started = Instant::now();
        let result = self.transport.send(&conn, &outbound).await;
        drop(conn);

        let status = result.as_ref().map(|_| ()).map_err(Error::status_label);
        self.log_attempt(backend, request, source, started.elapsed(), &status);
        result
    }

    fn log_attempt(
        &self,
        backend: &Backend,
        request: &CallRequest,
        source: AttemptSource,
        duration: Duration,
        outcome: &std::result::Result<(), String>,
    ) {
        self.diagnostics.log_request(RequestMetrics {
            backend_id: backend.id.clone(),
            endpoint: request.endpoint.clone(),
            method: request.method.to_ascii_uppercase(),
            duration_ms: duration.as_millis() as u64,
            success: outcome.is_ok(),
            status: match outcome {
                Ok(()) if source == AttemptSource::Cache => "cache_hit".to_string(),
                Ok(()) => "ok".to_string(),
                Err(label) => label.clone(),
            },
            source,
            timestamp: Utc::now(),
        });
    }
}

/// Optional humantime durations for request bodies
mod optional_duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => crate::config::humantime_serde::serialize(d, serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        Option::<String>::deserialize(deserializer)?
            .map(|s| crate::config::humantime_serde::parse(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendConfig, Config};
    use crate::pool::PooledConnection;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails the first send with a 503 and, while doing so, queues another
    /// holder for the backend's only pool slot
    struct BusyAfterFailure {
        pool: Arc<ConnectionPool>,
        sends: AtomicU32,
    }

    #[async_trait]
    impl Transport for BusyAfterFailure {
        async fn send(&self, _conn: &PooledConnection, request: &OutboundRequest) -> Result<Value> {
            if self.sends.fetch_add(1, Ordering::SeqCst) > 0 {
                return Ok(json!("late"));
            }
            let pool = Arc::clone(&self.pool);
            let backend = request.backend_id.clone();
            tokio::spawn(async move {
                if let Ok(conn) = pool.acquire(&backend, AcquireMode::Wait, Duration::from_secs(5)).await {
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    drop(conn);
                }
            });
            // Let the holder start waiting before this slot is released
            tokio::time::sleep(Duration::from_millis(20)).await;
            Err(Error::Backend {
                backend: request.backend_id.clone(),
                status: 503,
                body: String::new(),
            })
        }
    }

    #[tokio::test]
    async fn test_local_rejection_on_retry_keeps_backend_failure() {
        let mut config = Config::default();
        config.pool.max_per_backend = 1;
        config.failsafe.retry.max_attempts = 3;
        config.failsafe.retry.initial_backoff = Duration::from_millis(50);
        config.failsafe.retry.max_backoff = Duration::from_millis(50);
        config
            .backends
            .insert("a".to_string(), BackendConfig::new("http://127.0.0.1:1"));

        let failsafe = Arc::new(Failsafe::new(&config.failsafe));
        let pool = Arc::new(ConnectionPool::new(config.pool.clone()));
        let transport = Arc::new(BusyAfterFailure {
            pool: Arc::clone(&pool),
            sends: AtomicU32::new(0),
        });
        let executor = CallExecutor::new(
            Arc::new(BackendRegistry::from_config(&config)),
            Arc::clone(&failsafe),
            pool,
            None,
            Arc::new(DiagnosticsRecorder::in_memory().unwrap()),
        )
        .with_transport(Arc::clone(&transport) as Arc<dyn Transport>);

        let result = executor
            .call(&CallRequest::new("a", "/items").acquire(AcquireMode::FailFast))
            .await;

        assert!(!result.success);
        assert_eq!(result.error_kind(), Some(ErrorKind::BackendError));
        assert_eq!(transport.sends.load(Ordering::SeqCst), 1);
        assert_eq!(failsafe.circuit_breakers.status("a").failure_count, 1);
    }

    #[test]
    fn test_call_request_builder() {
        let request = CallRequest::new("memory", "/items")
            .method("post")
            .payload(json!({"a": 1}))
            .cached(false)
            .ttl(Duration::from_secs(5))
            .retries(1)
            .acquire(AcquireMode::FailFast);

        assert_eq!(request.method, "post");
        assert!(!request.use_cache);
        assert_eq!(request.cache_ttl, Some(Duration::from_secs(5)));
        assert_eq!(request.retries, Some(1));
        assert_eq!(request.acquire, Some(AcquireMode::FailFast));
    }

    #[test]
    fn test_call_request_deserialize_defaults() {
        let request: CallRequest =
            serde_json::from_value(json!({"backend_id": "a", "endpoint": "/x", "cache_ttl": "250ms"})).unwrap();
        assert_eq!(request.method, "GET");
        assert!(request.use_cache);
        assert_eq!(request.cache_ttl, Some(Duration::from_millis(250)));
        assert!(request.payload.is_none());
    }

    #[test]
    fn test_rejected_result_shape() {
        let result = CallResult::rejected(&Error::QueueFull(10));
        assert!(!result.success);
        assert_eq!(result.error_kind(), Some(ErrorKind::QueueFull));

        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["error"]["kind"], "queue_full");
        assert!(json.get("data").is_none());
    }
}
