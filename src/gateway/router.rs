//! Admin HTTP router and handlers
//!
//! Thin JSON wrappers over the [`Gateway`] façade.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::{Value, json};
use tower_http::{catch_panic::CatchPanicLayer, timeout::TimeoutLayer, trace::TraceLayer};
use tracing::warn;

use super::facade::{Gateway, Submission};
use crate::Error;
use crate::config::AcquireMode;
use crate::config_reload::ReloadSource;
use crate::error::ErrorKind;
use crate::executor::{CallRequest, CallResult};

/// Shared application state
pub struct AppState {
    /// The gateway
    pub gateway: Arc<Gateway>,
    /// Config file used by `POST /reload` without a body
    pub config_path: Option<PathBuf>,
}

/// Create the router
pub fn create_router(state: Arc<AppState>, request_timeout: Duration) -> Router {
    Router::new()
        .route("/backends", get(backends_handler))
        .route("/call/{backend}/{*endpoint}", post(call_handler))
        .route("/health", get(health_all_handler))
        .route("/health/{backend}", get(health_one_handler))
        .route("/restart/{backend}", post(restart_handler))
        .route("/diagnostics", get(diagnostics_handler))
        .route("/circuits", get(circuits_handler))
        .route("/cache", get(cache_handler))
        .route("/queue", get(queue_handler))
        .route("/reload", post(reload_handler))
        .layer(CatchPanicLayer::new())
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            request_timeout,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Body of `POST /call/...`
#[derive(Debug, Deserialize)]
#[serde(default)]
struct CallBody {
    method: Option<String>,
    payload: Option<Value>,
    use_cache: bool,
    cache_ttl: Option<String>,
    retries: Option<u32>,
    acquire: Option<AcquireMode>,
    /// Defer to the queue under backpressure instead of failing
    queue: bool,
}

impl Default for CallBody {
    fn default() -> Self {
        Self {
            method: None,
            payload: None,
            use_cache: true,
            cache_ttl: None,
            retries: None,
            acquire: None,
            queue: false,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct HealthQuery {
    auto_restart: bool,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct DiagnosticsQuery {
    backend: Option<String>,
    window_hours: u32,
}

impl Default for DiagnosticsQuery {
    fn default() -> Self {
        Self {
            backend: None,
            window_hours: 24,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ReloadBody {
    /// Inline YAML document; the config file is re-read when absent
    yaml: Option<String>,
}

/// HTTP status for a failed call
fn call_status(result: &CallResult) -> StatusCode {
    match result.error_kind() {
        None => StatusCode::OK,
        Some(ErrorKind::BackendNotFound) => StatusCode::NOT_FOUND,
        Some(ErrorKind::CircuitOpen | ErrorKind::QueueFull | ErrorKind::PoolExhausted) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        Some(ErrorKind::RateLimitExceeded) => StatusCode::TOO_MANY_REQUESTS,
        Some(ErrorKind::Timeout) => StatusCode::GATEWAY_TIMEOUT,
        Some(ErrorKind::Connection | ErrorKind::BackendError) => StatusCode::BAD_GATEWAY,
        Some(ErrorKind::ConfigReload | ErrorKind::Internal) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(e: &Error) -> Response {
    let status = match e {
        Error::BackendNotFound(_) => StatusCode::NOT_FOUND,
        Error::ConfigReload(_) | Error::Config(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({ "error": { "kind": e.kind(), "message": e.to_string() } }))).into_response()
}

/// GET /backends
async fn backends_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.gateway.backends())
}

/// POST /call/{backend}/{*endpoint}
async fn call_handler(
    State(state): State<Arc<AppState>>,
    Path((backend, endpoint)): Path<(String, String)>,
    body: Option<Json<CallBody>>,
) -> Response {
    let Json(body) = body.unwrap_or_default();

    let mut request = CallRequest::new(backend, format!("/{endpoint}"))
        .method(body.method.unwrap_or_else(|| "GET".to_string()))
        .cached(body.use_cache);
    request.payload = body.payload;
    request.retries = body.retries;
    request.acquire = body.acquire;
    if let Some(ttl) = body.cache_ttl {
        match crate::config::humantime_serde::parse(&ttl) {
            Ok(ttl) => request.cache_ttl = Some(ttl),
            Err(e) => {
                return (StatusCode::BAD_REQUEST, Json(json!({ "error": format!("invalid cache_ttl: {e}") })))
                    .into_response();
            }
        }
    }

    if body.queue {
        return match state.gateway.submit(request).await {
            Submission::Completed { result } => {
                (call_status(&result), Json(Submission::Completed { result })).into_response()
            }
            queued @ Submission::Queued { .. } => (StatusCode::ACCEPTED, Json(queued)).into_response(),
        };
    }

    let result = state.gateway.execute(&request).await;
    (call_status(&result), Json(result)).into_response()
}

/// GET /health
async fn health_all_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HealthQuery>,
) -> Response {
    match state.gateway.health_check(None, query.auto_restart).await {
        Ok(results) => Json(results).into_response(),
        Err(e) => error_response(&e),
    }
}

/// GET /health/{backend}
async fn health_one_handler(
    State(state): State<Arc<AppState>>,
    Path(backend): Path<String>,
    Query(query): Query<HealthQuery>,
) -> Response {
    match state.gateway.health_check(Some(&backend), query.auto_restart).await {
        Ok(results) => Json(results).into_response(),
        Err(e) => error_response(&e),
    }
}

/// POST /restart/{backend}
async fn restart_handler(State(state): State<Arc<AppState>>, Path(backend): Path<String>) -> Response {
    match state.gateway.restart(&backend).await {
        Ok(report) => Json(report).into_response(),
        Err(e) => error_response(&e),
    }
}

/// GET /diagnostics
async fn diagnostics_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DiagnosticsQuery>,
) -> Response {
    match state
        .gateway
        .diagnostics(query.backend.as_deref(), query.window_hours)
        .await
    {
        Ok(report) => Json(report).into_response(),
        Err(e) => error_response(&e),
    }
}

/// GET /circuits
async fn circuits_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.gateway.circuit_status())
}

/// GET /cache
async fn cache_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.gateway.cache_stats())
}

/// GET /queue
async fn queue_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "queue": state.gateway.queue_stats(),
        "pool": state.gateway.pool_stats(),
    }))
}

/// POST /reload
async fn reload_handler(State(state): State<Arc<AppState>>, body: Option<Json<ReloadBody>>) -> Response {
    let Json(body) = body.unwrap_or_default();

    let source = match (body.yaml, &state.config_path) {
        (Some(yaml), _) => ReloadSource::Yaml(yaml),
        (None, Some(path)) => ReloadSource::Path(path.clone()),
        (None, None) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "success": false, "message": "no config file to reload; send a yaml document" })),
            )
                .into_response();
        }
    };

    match state.gateway.reload_config(&source) {
        Ok(outcome) => Json(outcome).into_response(),
        Err(e) => {
            warn!(error = %e, "Reload request rejected");
            (
                StatusCode::BAD_REQUEST,
                Json(json!({ "success": false, "reloaded_backends": [], "message": e.to_string() })),
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::CallError;

    fn failed(kind: ErrorKind) -> CallResult {
        CallResult {
            success: false,
            data: None,
            error: Some(CallError {
                kind,
                message: String::new(),
            }),
            latency_ms: 0,
            served_from_cache: false,
            used_fallback: false,
            attempts: 0,
        }
    }

    #[test]
    fn test_call_status_mapping() {
        assert_eq!(call_status(&failed(ErrorKind::RateLimitExceeded)), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(call_status(&failed(ErrorKind::CircuitOpen)), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(call_status(&failed(ErrorKind::Timeout)), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(call_status(&failed(ErrorKind::BackendError)), StatusCode::BAD_GATEWAY);
        assert_eq!(call_status(&failed(ErrorKind::BackendNotFound)), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_diagnostics_query_defaults() {
        let query = DiagnosticsQuery::default();
        assert_eq!(query.window_hours, 24);
        assert!(query.backend.is_none());
    }

    #[test]
    fn test_call_body_caches_by_default() {
        let empty: CallBody = serde_json::from_str("{}").unwrap();
        assert!(empty.use_cache);
        assert!(!empty.queue);
        assert!(CallBody::default().use_cache);

        let opted_out: CallBody = serde_json::from_str(r#"{"use_cache": false}"#).unwrap();
        assert!(!opted_out.use_cache);
    }
}
