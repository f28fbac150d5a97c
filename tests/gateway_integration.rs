//! End-to-end tests against mock HTTP backends

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::{Json, Router, http::StatusCode, routing::get};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use tokio::net::TcpListener;

use resilient_gateway::backend::Backend;
use resilient_gateway::config::{AcquireMode, BackendConfig, Config, Priority};
use resilient_gateway::config_reload::ReloadSource;
use resilient_gateway::error::ErrorKind;
use resilient_gateway::executor::CallRequest;
use resilient_gateway::failsafe::{CircuitPhase, HealthStatus};
use resilient_gateway::gateway::{Gateway, Submission};
use resilient_gateway::monitor::{Launcher, Notifier, Severity};

async fn spawn_backend(router: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

/// A URL nothing listens on
async fn dead_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{addr}")
}

/// Backend answering `/items` with a JSON body and counting hits
fn counting_backend(hits: Arc<AtomicU32>, status: StatusCode) -> Router {
    Router::new().route(
        "/items",
        get(move || {
            let hits = Arc::clone(&hits);
            async move {
                hits.fetch_add(1, Ordering::SeqCst);
                (status, Json(json!({"items": [1, 2, 3]})))
            }
        }),
    )
}

fn base_config() -> Config {
    let mut config = Config::default();
    config.diagnostics.path = ":memory:".to_string();
    config.failsafe.retry.initial_backoff = Duration::from_millis(1);
    config.failsafe.retry.max_backoff = Duration::from_millis(5);
    config.failsafe.health_check.enabled = false;
    config
}

fn with_backend(mut config: Config, id: &str, backend: BackendConfig) -> Config {
    config.backends.insert(id.to_string(), backend);
    config
}

#[tokio::test]
async fn test_successful_call_returns_data() {
    let hits = Arc::new(AtomicU32::new(0));
    let url = spawn_backend(counting_backend(Arc::clone(&hits), StatusCode::OK)).await;
    let gateway = Gateway::new(with_backend(base_config(), "memory", BackendConfig::new(url))).unwrap();

    let result = gateway.call("memory", "/items", "GET", None, false).await;

    assert!(result.success);
    assert_eq!(result.data, Some(json!({"items": [1, 2, 3]})));
    assert_eq!(result.attempts, 1);
    assert!(!result.used_fallback);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_retries_exact_attempt_budget() {
    let hits = Arc::new(AtomicU32::new(0));
    let url = spawn_backend(counting_backend(Arc::clone(&hits), StatusCode::SERVICE_UNAVAILABLE)).await;
    let mut config = with_backend(base_config(), "flaky", BackendConfig::new(url));
    config.failsafe.retry.max_attempts = 4;
    let gateway = Gateway::new(config).unwrap();

    let result = gateway.call("flaky", "/items", "GET", None, false).await;

    assert!(!result.success);
    assert_eq!(result.error_kind(), Some(ErrorKind::BackendError));
    assert_eq!(result.attempts, 4);
    assert_eq!(hits.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn test_client_errors_are_not_retried() {
    let hits = Arc::new(AtomicU32::new(0));
    let url = spawn_backend(counting_backend(Arc::clone(&hits), StatusCode::NOT_FOUND)).await;
    let gateway = Gateway::new(with_backend(base_config(), "a", BackendConfig::new(url))).unwrap();

    let result = gateway.call("a", "/items", "GET", None, false).await;

    assert!(!result.success);
    assert_eq!(result.attempts, 1);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_fallback_after_primary_exhausted() {
    let primary_hits = Arc::new(AtomicU32::new(0));
    let fallback_hits = Arc::new(AtomicU32::new(0));
    let primary = spawn_backend(counting_backend(Arc::clone(&primary_hits), StatusCode::BAD_GATEWAY)).await;
    let fallback = spawn_backend(counting_backend(Arc::clone(&fallback_hits), StatusCode::OK)).await;

    let mut backend = BackendConfig::new(primary);
    backend.fallback_url = Some(fallback);
    let gateway = Gateway::new(with_backend(base_config(), "search", backend)).unwrap();

    let result = gateway.call("search", "/items", "GET", None, false).await;

    assert!(result.success);
    assert!(result.used_fallback);
    assert_eq!(result.attempts, 4);
    assert_eq!(primary_hits.load(Ordering::SeqCst), 3);
    assert_eq!(fallback_hits.load(Ordering::SeqCst), 1);

    // The logical call succeeded, so the breaker saw no failure
    assert_eq!(gateway.circuit_status()["search"].failure_count, 0);
}

#[tokio::test]
async fn test_connection_refused_is_retried() {
    let mut config = with_backend(base_config(), "gone", BackendConfig::new(dead_url().await));
    config.failsafe.retry.max_attempts = 2;
    let gateway = Gateway::new(config).unwrap();

    let result = gateway.call("gone", "/items", "GET", None, false).await;

    assert!(!result.success);
    assert_eq!(result.error_kind(), Some(ErrorKind::Connection));
    assert_eq!(result.attempts, 2);
}

#[tokio::test]
async fn test_circuit_opens_then_recovers_through_trial() {
    let healthy = Arc::new(AtomicBool::new(false));
    let hits = Arc::new(AtomicU32::new(0));
    let router = {
        let healthy = Arc::clone(&healthy);
        let hits = Arc::clone(&hits);
        Router::new().route(
            "/items",
            get(move || {
                let healthy = Arc::clone(&healthy);
                let hits = Arc::clone(&hits);
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    if healthy.load(Ordering::SeqCst) {
                        (StatusCode::OK, Json(json!({"ok": true})))
                    } else {
                        (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"ok": false})))
                    }
                }
            }),
        )
    };
    let url = spawn_backend(router).await;

    let mut config = with_backend(base_config(), "db", BackendConfig::new(url));
    config.failsafe.retry.max_attempts = 1;
    config.failsafe.circuit_breaker.failure_threshold = 2;
    config.failsafe.circuit_breaker.cooldown = Duration::from_millis(200);
    let gateway = Gateway::new(config).unwrap();

    for _ in 0..2 {
        let result = gateway.call("db", "/items", "GET", None, false).await;
        assert_eq!(result.error_kind(), Some(ErrorKind::BackendError));
    }
    assert_eq!(gateway.circuit_status()["db"].phase, CircuitPhase::Open);

    let blocked = gateway.call("db", "/items", "GET", None, false).await;
    assert_eq!(blocked.error_kind(), Some(ErrorKind::CircuitOpen));
    assert_eq!(blocked.attempts, 0);
    assert_eq!(hits.load(Ordering::SeqCst), 2);

    healthy.store(true, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(250)).await;

    let trial = gateway.call("db", "/items", "GET", None, false).await;
    assert!(trial.success);
    let status = &gateway.circuit_status()["db"];
    assert_eq!(status.phase, CircuitPhase::Closed);
    assert_eq!(status.failure_count, 0);
}

#[tokio::test]
async fn test_cache_hit_bypasses_network() {
    let hits = Arc::new(AtomicU32::new(0));
    let url = spawn_backend(counting_backend(Arc::clone(&hits), StatusCode::OK)).await;
    let gateway = Gateway::new(with_backend(base_config(), "memory", BackendConfig::new(url))).unwrap();

    let first = gateway.call("memory", "/items", "GET", None, true).await;
    let second = gateway.call("memory", "/items", "GET", None, true).await;

    assert!(first.success && !first.served_from_cache);
    assert!(second.success && second.served_from_cache);
    assert_eq!(second.attempts, 0);
    assert_eq!(second.data, first.data);
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    // A different payload is a different key
    let other = gateway
        .call("memory", "/items", "GET", Some(json!({"page": 2})), true)
        .await;
    assert!(!other.served_from_cache);
    assert_eq!(hits.load(Ordering::SeqCst), 2);

    let report = gateway.diagnostics(Some("memory"), 24).await.unwrap();
    assert_eq!(report.overall.count, 2);
    assert_eq!(report.overall.cache_hits, 1);
    assert_eq!(report.cache.hits, 1);
}

#[tokio::test]
async fn test_rate_limited_submit_is_queued_and_drained() {
    let hits = Arc::new(AtomicU32::new(0));
    let url = spawn_backend(counting_backend(Arc::clone(&hits), StatusCode::OK)).await;
    let mut backend = BackendConfig::new(url);
    backend.rate_limit = Some(1);
    let mut config = with_backend(base_config(), "slow", backend);
    config.failsafe.rate_limit.window = Duration::from_millis(200);
    let gateway = Gateway::new(config).unwrap();

    let first = gateway.submit(CallRequest::new("slow", "/items").cached(false)).await;
    assert!(matches!(first, Submission::Completed { ref result } if result.success));

    let second = gateway.submit(CallRequest::new("slow", "/items").cached(false)).await;
    assert!(matches!(second, Submission::Queued { queue_len: 1 }));
    assert_eq!(gateway.queue_stats().len, 1);

    tokio::time::sleep(Duration::from_millis(250)).await;
    let drained = gateway.drain_queue().await;

    assert_eq!(drained.len(), 1);
    assert!(drained[0].success);
    assert_eq!(hits.load(Ordering::SeqCst), 2);
    assert_eq!(gateway.queue_stats().completed, 1);
    // Rate limiting never counts against the breaker
    assert_eq!(gateway.circuit_status()["slow"].failure_count, 0);
}

#[tokio::test]
async fn test_parallel_health_check_takes_max_latency() {
    let slow_health = || {
        Router::new().route(
            "/health",
            get(|| async {
                tokio::time::sleep(Duration::from_millis(300)).await;
                Json(json!({"status": "ok"}))
            }),
        )
    };

    let mut config = base_config();
    for id in ["a", "b", "c", "d"] {
        let url = spawn_backend(slow_health()).await;
        config = with_backend(config, id, BackendConfig::new(url));
    }
    let gateway = Gateway::new(config).unwrap();

    let started = Instant::now();
    let results = gateway.health_check(None, false).await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(results.len(), 4);
    assert!(results.values().all(|r| r.status == HealthStatus::Healthy));
    assert!(elapsed < Duration::from_millis(900), "sweep took {elapsed:?}");
}

#[tokio::test]
async fn test_batch_deadline_reports_unknown() {
    let hanging = Router::new().route(
        "/health",
        get(|| async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Json(json!({}))
        }),
    );
    let fast = Router::new().route("/health", get(|| async { Json(json!({})) }));

    let mut config = base_config();
    config.failsafe.health_check.batch_timeout = Duration::from_millis(300);
    config = with_backend(config, "hang", BackendConfig::new(spawn_backend(hanging).await));
    config = with_backend(config, "fast", BackendConfig::new(spawn_backend(fast).await));
    let gateway = Gateway::new(config).unwrap();

    let started = Instant::now();
    let results = gateway.health_check(None, false).await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(results["fast"].status, HealthStatus::Healthy);
    assert_eq!(results["hang"].status, HealthStatus::Unknown);
}

struct FlipLauncher {
    up: Arc<AtomicBool>,
    launches: AtomicU32,
}

#[async_trait]
impl Launcher for FlipLauncher {
    async fn launch(&self, _backend: &Backend) -> bool {
        self.launches.fetch_add(1, Ordering::SeqCst);
        self.up.store(true, Ordering::SeqCst);
        true
    }
}

#[derive(Default)]
struct RecordingNotifier {
    events: Mutex<Vec<(String, Severity)>>,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, event: &str, severity: Severity, _message: &str) {
        self.events.lock().push((event.to_string(), severity));
    }
}

#[tokio::test]
async fn test_critical_backend_auto_restart() {
    let up = Arc::new(AtomicBool::new(false));
    let router = {
        let up = Arc::clone(&up);
        Router::new().route(
            "/health",
            get(move || {
                let up = Arc::clone(&up);
                async move {
                    if up.load(Ordering::SeqCst) {
                        (StatusCode::OK, Json(json!({"status": "ok"})))
                    } else {
                        (StatusCode::SERVICE_UNAVAILABLE, Json(json!({"status": "down"})))
                    }
                }
            }),
        )
    };
    let url = spawn_backend(router).await;

    let mut backend = BackendConfig::new(url);
    backend.priority = Priority::Critical;
    backend.auto_restart = true;
    let mut config = with_backend(base_config(), "core", backend);
    config.failsafe.health_check.offline_threshold = 1;
    config.failsafe.health_check.restart_grace = Duration::from_millis(10);

    let launcher = Arc::new(FlipLauncher {
        up: Arc::clone(&up),
        launches: AtomicU32::new(0),
    });
    let notifier = Arc::new(RecordingNotifier::default());
    let gateway = Gateway::builder(config)
        .launcher(Arc::clone(&launcher) as Arc<dyn Launcher>)
        .notifier(Arc::clone(&notifier) as Arc<dyn Notifier>)
        .build()
        .unwrap();

    let results = gateway.health_check(Some("core"), true).await.unwrap();
    let result = &results["core"];

    assert_eq!(launcher.launches.load(Ordering::SeqCst), 1);
    assert_eq!(result.status, HealthStatus::Healthy);
    assert!(result.restart.as_ref().is_some_and(|r| r.success));

    tokio::time::sleep(Duration::from_millis(50)).await;
    let events: Vec<String> = notifier.events.lock().iter().map(|(e, _)| e.clone()).collect();
    assert!(events.contains(&"critical_offline".to_string()));
    assert!(events.contains(&"backend_restarted".to_string()));
}

#[tokio::test]
async fn test_offline_non_critical_backend_is_not_restarted() {
    let url = dead_url().await;
    let mut backend = BackendConfig::new(url);
    backend.auto_restart = true;
    let mut config = with_backend(base_config(), "aux", backend);
    config.failsafe.health_check.offline_threshold = 1;

    let launcher = Arc::new(FlipLauncher {
        up: Arc::new(AtomicBool::new(false)),
        launches: AtomicU32::new(0),
    });
    let gateway = Gateway::builder(config)
        .launcher(Arc::clone(&launcher) as Arc<dyn Launcher>)
        .build()
        .unwrap();

    let results = gateway.health_check(Some("aux"), true).await.unwrap();

    assert_eq!(results["aux"].status, HealthStatus::Offline);
    assert!(results["aux"].restart.is_none());
    assert_eq!(launcher.launches.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_probe_with_missing_credential_leaves_health_alone() {
    let hits = Arc::new(AtomicU32::new(0));
    let router = {
        let hits = Arc::clone(&hits);
        Router::new().route(
            "/health",
            get(move || {
                let hits = Arc::clone(&hits);
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    Json(json!({"status": "ok"}))
                }
            }),
        )
    };
    let mut backend = BackendConfig::new(spawn_backend(router).await);
    backend.priority = Priority::Critical;
    backend.auto_restart = true;
    backend.requires_auth = true;
    backend.credential = Some("env:RG_TEST_PROBE_CREDENTIAL_NEVER_SET".to_string());
    let mut config = with_backend(base_config(), "locked", backend);
    config.failsafe.health_check.offline_threshold = 1;

    let launcher = Arc::new(FlipLauncher {
        up: Arc::new(AtomicBool::new(false)),
        launches: AtomicU32::new(0),
    });
    let notifier = Arc::new(RecordingNotifier::default());
    let gateway = Gateway::builder(config)
        .launcher(Arc::clone(&launcher) as Arc<dyn Launcher>)
        .notifier(Arc::clone(&notifier) as Arc<dyn Notifier>)
        .build()
        .unwrap();

    for _ in 0..3 {
        let results = gateway.health_check(Some("locked"), true).await.unwrap();
        assert_eq!(results["locked"].status, HealthStatus::Unknown);
        assert!(results["locked"].error.as_deref().is_some_and(|e| e.contains("credential")));
    }

    assert_eq!(hits.load(Ordering::SeqCst), 0);
    assert_eq!(gateway.health_states()["locked"].status, HealthStatus::Unknown);
    assert_eq!(gateway.circuit_status()["locked"].failure_count, 0);
    assert_eq!(launcher.launches.load(Ordering::SeqCst), 0);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(notifier.events.lock().is_empty());
}

#[tokio::test]
async fn test_reload_of_unchanged_file_touches_nothing() {
    let hits = Arc::new(AtomicU32::new(0));
    let url = spawn_backend(counting_backend(Arc::clone(&hits), StatusCode::OK)).await;
    let dead = dead_url().await;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("gateway.yaml");
    let yaml = format!(
        "diagnostics:\n  path: \":memory:\"\nfailsafe:\n  retry:\n    max_attempts: 1\n  health_check:\n    enabled: false\nbackends:\n  live:\n    url: {url}\n  dead:\n    url: {dead}\n"
    );
    std::fs::write(&path, &yaml).unwrap();

    let gateway = Gateway::new(Config::load(Some(&path)).unwrap()).unwrap();
    assert!(gateway.call("live", "/items", "GET", None, true).await.success);
    assert!(!gateway.call("dead", "/items", "GET", None, false).await.success);

    let outcome = gateway.reload_config(&ReloadSource::Path(path.clone())).unwrap();

    assert!(outcome.success);
    assert!(outcome.reloaded_backends.is_empty());
    assert_eq!(gateway.circuit_status()["dead"].failure_count, 1);
    assert_eq!(gateway.cache_stats().size, 1);

    let cached = gateway.call("live", "/items", "GET", None, true).await;
    assert!(cached.served_from_cache);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_reload_modified_backend_drops_its_cache() {
    let url_a = spawn_backend(counting_backend(Arc::new(AtomicU32::new(0)), StatusCode::OK)).await;
    let url_b = spawn_backend(counting_backend(Arc::new(AtomicU32::new(0)), StatusCode::OK)).await;

    let gateway = Gateway::new(with_backend(base_config(), "svc", BackendConfig::new(url_a))).unwrap();
    assert!(gateway.call("svc", "/items", "GET", None, true).await.success);
    assert_eq!(gateway.cache_stats().size, 1);

    let yaml = format!(
        "diagnostics:\n  path: \":memory:\"\nfailsafe:\n  health_check:\n    enabled: false\nbackends:\n  svc:\n    url: {url_b}\n"
    );
    let outcome = gateway.reload_config(&ReloadSource::Yaml(yaml)).unwrap();

    assert_eq!(outcome.reloaded_backends, vec!["svc".to_string()]);
    assert_eq!(gateway.cache_stats().size, 0);
    assert_eq!(gateway.backends()[0].url, url_b);

    let result = gateway.call("svc", "/items", "GET", None, true).await;
    assert!(result.success && !result.served_from_cache);
}

#[tokio::test]
async fn test_requires_auth_sends_bearer() {
    let router = Router::new().route(
        "/secure",
        get(|headers: axum::http::HeaderMap| async move {
            let auth = headers
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string();
            Json(json!({ "auth": auth }))
        }),
    );
    let url = spawn_backend(router).await;

    let mut backend = BackendConfig::new(url);
    backend.requires_auth = true;
    backend.credential = Some("s3cret".to_string());
    let gateway = Gateway::new(with_backend(base_config(), "vault", backend)).unwrap();

    let result = gateway.call("vault", "/secure", "GET", None, false).await;
    assert!(result.success);
    assert_eq!(result.data, Some(json!({"auth": "Bearer s3cret"})));
}

#[tokio::test]
async fn test_post_payload_roundtrip() {
    let router = Router::new().route(
        "/echo",
        axum::routing::post(|Json(body): Json<Value>| async move { Json(json!({ "got": body })) }),
    );
    let url = spawn_backend(router).await;
    let gateway = Gateway::new(with_backend(base_config(), "echo", BackendConfig::new(url))).unwrap();

    let result = gateway
        .call("echo", "/echo", "POST", Some(json!({"name": "widget"})), false)
        .await;

    assert!(result.success);
    assert_eq!(result.data, Some(json!({"got": {"name": "widget"}})));
}

#[tokio::test]
async fn test_queue_worker_replays_once_the_window_reopens() {
    let hits = Arc::new(AtomicU32::new(0));
    let url = spawn_backend(counting_backend(Arc::clone(&hits), StatusCode::OK)).await;
    let mut backend = BackendConfig::new(url);
    backend.rate_limit = Some(1);
    let mut config = with_backend(base_config(), "burst", backend);
    config.failsafe.rate_limit.window = Duration::from_millis(300);
    let gateway = Arc::new(Gateway::new(config).unwrap());

    let (shutdown, _) = tokio::sync::broadcast::channel(1);
    let handles = gateway.spawn_background(&shutdown);

    let first = gateway.submit(CallRequest::new("burst", "/items").cached(false)).await;
    assert!(matches!(first, Submission::Completed { ref result } if result.success));
    for _ in 0..3 {
        let queued = gateway.submit(CallRequest::new("burst", "/items").cached(false)).await;
        assert!(matches!(queued, Submission::Queued { .. }));
    }

    let deadline = Instant::now() + Duration::from_secs(5);
    while gateway.queue_stats().completed < 3 && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let stats = gateway.queue_stats();
    assert_eq!(stats.completed, 3);
    assert_eq!(stats.failed, 0);
    assert_eq!(stats.len, 0);
    assert_eq!(hits.load(Ordering::SeqCst), 4);

    let _ = shutdown.send(());
    for handle in handles {
        handle.await.unwrap();
    }
}

/// Backend whose `/items` answers only after `delay`
fn sleepy_backend(delay: Duration) -> Router {
    Router::new().route(
        "/items",
        get(move || async move {
            tokio::time::sleep(delay).await;
            Json(json!({"late": true}))
        }),
    )
}

#[tokio::test]
async fn test_timeout_releases_connection_and_counts_as_failure() {
    let url = spawn_backend(sleepy_backend(Duration::from_millis(500))).await;
    let mut backend = BackendConfig::new(url);
    backend.timeout = Duration::from_millis(100);
    let mut config = with_backend(base_config(), "slow", backend);
    config.failsafe.retry.max_attempts = 1;
    let gateway = Gateway::new(config).unwrap();

    let started = Instant::now();
    let result = gateway.call("slow", "/items", "GET", None, false).await;

    assert!(!result.success);
    assert_eq!(result.error_kind(), Some(ErrorKind::Timeout));
    assert!(started.elapsed() < Duration::from_millis(450));
    assert_eq!(gateway.pool_stats().in_use, 0);
    assert_eq!(gateway.pool_stats().backends["slow"].in_use, 0);
    assert_eq!(gateway.circuit_status()["slow"].failure_count, 1);
}

#[tokio::test]
async fn test_fail_fast_pool_exhaustion_is_not_a_breaker_failure() {
    let url = spawn_backend(sleepy_backend(Duration::from_millis(300))).await;
    let mut config = with_backend(base_config(), "narrow", BackendConfig::new(url));
    config.pool.max_per_backend = 1;
    let gateway = Arc::new(Gateway::new(config).unwrap());

    let holder = {
        let gateway = Arc::clone(&gateway);
        tokio::spawn(async move { gateway.call("narrow", "/items", "GET", None, false).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    let rejected = gateway
        .execute(&CallRequest::new("narrow", "/items").cached(false).acquire(AcquireMode::FailFast))
        .await;
    assert_eq!(rejected.error_kind(), Some(ErrorKind::PoolExhausted));
    assert_eq!(rejected.attempts, 1);
    assert_eq!(gateway.circuit_status()["narrow"].failure_count, 0);

    assert!(holder.await.unwrap().success);
    assert_eq!(gateway.pool_stats().in_use, 0);
    assert_eq!(gateway.circuit_status()["narrow"].failure_count, 0);
}
