//! Gateway façade
//!
//! Owns every component and the state they share. Components receive `Arc`
//! handles at construction; nothing lives in module globals.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::backend::{BackendInfo, BackendRegistry, RegistrySnapshot};
use crate::cache::{CacheStatsSnapshot, ResponseCache};
use crate::config::Config;
use crate::config_reload::{LiveConfig, ReloadOutcome, ReloadSource, compute_diff};
use crate::credentials::{CredentialProvider, EnvCredentials};
use crate::diagnostics::{DiagnosticsRecorder, DiagnosticsStats, RecorderCounters};
use crate::error::ErrorKind;
use crate::executor::{CallExecutor, CallRequest, CallResult};
use crate::failsafe::{CircuitStatus, Failsafe, HealthState};
use crate::monitor::{HealthMonitor, Launcher, NoopLauncher, NoopNotifier, Notifier, ProbeResult, RestartReport};
use crate::pool::{ConnectionPool, PoolStats};
use crate::queue::{QueueStats, RequestQueue};
use crate::transport::{HttpTransport, Transport};
use crate::{Error, Result};

/// Builder for [`Gateway`] with pluggable collaborators
pub struct GatewayBuilder {
    config: Config,
    launcher: Arc<dyn Launcher>,
    notifier: Arc<dyn Notifier>,
    credentials: Arc<dyn CredentialProvider>,
    transport: Arc<dyn Transport>,
}

impl GatewayBuilder {
    /// Start from a validated config
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            config,
            launcher: Arc::new(NoopLauncher),
            notifier: Arc::new(NoopNotifier),
            credentials: Arc::new(EnvCredentials),
            transport: Arc::new(HttpTransport::new()),
        }
    }

    /// Launcher used to restart critical backends
    #[must_use]
    pub fn launcher(mut self, launcher: Arc<dyn Launcher>) -> Self {
        self.launcher = launcher;
        self
    }

    /// Alert side channel
    #[must_use]
    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Credential source for `requires_auth` backends
    #[must_use]
    pub fn credentials(mut self, credentials: Arc<dyn CredentialProvider>) -> Self {
        self.credentials = credentials;
        self
    }

    /// Transport used for calls and probes
    #[must_use]
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = transport;
        self
    }

    /// Assemble the gateway.
    ///
    /// An unavailable diagnostics store is replaced by an in-memory one.
    ///
    /// # Errors
    ///
    /// Returns an error if not even the in-memory diagnostics store starts.
    pub fn build(self) -> Result<Gateway> {
        let config = self.config;

        let registry = Arc::new(BackendRegistry::from_config(&config));
        let failsafe = Arc::new(Failsafe::new(&config.failsafe));
        let pool = Arc::new(ConnectionPool::new(config.pool.clone()));
        let cache = Arc::new(ResponseCache::from_config(&config.cache));
        let diagnostics = Arc::new(DiagnosticsRecorder::open_or_in_memory(&config.diagnostics)?);
        let queue = Arc::new(RequestQueue::from_config(&config.queue));

        let executor = Arc::new(
            CallExecutor::new(
                Arc::clone(&registry),
                Arc::clone(&failsafe),
                Arc::clone(&pool),
                config.cache.enabled.then(|| Arc::clone(&cache)),
                Arc::clone(&diagnostics),
            )
            .with_transport(Arc::clone(&self.transport))
            .with_credentials(Arc::clone(&self.credentials)),
        );

        let monitor = Arc::new(
            HealthMonitor::new(
                config.failsafe.health_check.clone(),
                Arc::clone(&registry),
                Arc::clone(&failsafe),
                Arc::clone(&pool),
                Arc::clone(&diagnostics),
            )
            .with_transport(self.transport)
            .with_credentials(self.credentials)
            .with_launcher(self.launcher)
            .with_notifier(self.notifier),
        );

        for backend in registry.all() {
            info!(backend = %backend.id, url = %backend.config.url, priority = ?backend.config.priority, "Registered backend");
        }

        let settings = Arc::new(config.clone());
        Ok(Gateway {
            settings,
            live: LiveConfig::new(config),
            registry,
            failsafe,
            pool,
            cache,
            diagnostics,
            executor,
            monitor,
            queue,
            reload_lock: Mutex::new(()),
        })
    }
}

/// Outcome of [`Gateway::submit`]
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Submission {
    /// The call ran (successfully or not)
    Completed {
        /// Call outcome
        result: CallResult,
    },
    /// The call was deferred to the request queue
    Queued {
        /// Queue length after enqueueing
        queue_len: usize,
    },
}

/// Per-backend section of a diagnostics report
#[derive(Debug, Clone, Serialize)]
pub struct BackendDiagnostics {
    /// Current health
    pub health: HealthState,
    /// Current breaker state
    pub circuit: CircuitStatus,
    /// Persisted aggregates
    pub stats: DiagnosticsStats,
}

/// Result of [`Gateway::diagnostics`]
#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticsReport {
    /// Window the aggregates cover
    pub window_hours: u32,
    /// Aggregates over the selected backends
    pub overall: DiagnosticsStats,
    /// Per-backend breakdown
    pub backends: BTreeMap<String, BackendDiagnostics>,
    /// Recorder write-side counters
    pub recorder: RecorderCounters,
    /// Response cache counters
    pub cache: CacheStatsSnapshot,
}

/// The resilient gateway
pub struct Gateway {
    /// Startup config; only the backend map is applied on reload
    settings: Arc<Config>,
    live: LiveConfig,
    registry: Arc<BackendRegistry>,
    failsafe: Arc<Failsafe>,
    pool: Arc<ConnectionPool>,
    cache: Arc<ResponseCache>,
    diagnostics: Arc<DiagnosticsRecorder>,
    executor: Arc<CallExecutor>,
    monitor: Arc<HealthMonitor>,
    queue: Arc<RequestQueue>,
    reload_lock: Mutex<()>,
}

impl Gateway {
    /// Create a gateway with default collaborators
    ///
    /// # Errors
    ///
    /// Returns an error if the diagnostics store cannot be opened.
    pub fn new(config: Config) -> Result<Self> {
        GatewayBuilder::new(config).build()
    }

    /// Builder with pluggable collaborators
    #[must_use]
    pub fn builder(config: Config) -> GatewayBuilder {
        GatewayBuilder::new(config)
    }

    /// Current configuration
    #[must_use]
    pub fn config(&self) -> Arc<Config> {
        self.live.get()
    }

    /// Registered backends
    #[must_use]
    pub fn backends(&self) -> Vec<BackendInfo> {
        self.registry.infos()
    }

    /// Call `endpoint` on a backend
    pub async fn call(
        &self,
        backend_id: &str,
        endpoint: &str,
        method: &str,
        payload: Option<Value>,
        use_cache: bool,
    ) -> CallResult {
        let mut request = CallRequest::new(backend_id, endpoint).method(method).cached(use_cache);
        request.payload = payload;
        self.execute(&request).await
    }

    /// Execute a fully specified call
    pub async fn execute(&self, request: &CallRequest) -> CallResult {
        self.executor.call(request).await
    }

    /// Execute now, deferring to the request queue when the backend is
    /// rate limited or its pool is exhausted
    pub async fn submit(&self, request: CallRequest) -> Submission {
        let result = self.executor.call(&request).await;
        let deferrable = matches!(
            result.error_kind(),
            Some(ErrorKind::RateLimitExceeded | ErrorKind::PoolExhausted)
        );
        if !deferrable || !self.settings.queue.enabled {
            return Submission::Completed { result };
        }

        match self.queue.enqueue(request, result.attempts) {
            Ok(()) => Submission::Queued {
                queue_len: self.queue.len(),
            },
            Err(e) => Submission::Completed {
                result: CallResult::rejected(&e),
            },
        }
    }

    /// Replay everything currently queued
    pub async fn drain_queue(&self) -> Vec<CallResult> {
        self.queue.drain(&self.executor).await
    }

    /// Probe one backend (`Some`) or all of them (`None`)
    ///
    /// # Errors
    ///
    /// Returns [`Error::BackendNotFound`] for an unknown target.
    pub async fn health_check(&self, target: Option<&str>, auto_restart: bool) -> Result<BTreeMap<String, ProbeResult>> {
        match target {
            Some(id) => {
                let result = self.monitor.check(id, auto_restart).await?;
                Ok(BTreeMap::from([(id.to_string(), result)]))
            }
            None => Ok(self.monitor.check_all(auto_restart).await),
        }
    }

    /// Probe every backend in parallel
    pub async fn batch_health_check(&self) -> BTreeMap<String, ProbeResult> {
        let auto_restart = self.settings.failsafe.health_check.auto_restart;
        self.monitor.check_all(auto_restart).await
    }

    /// Relaunch a backend
    ///
    /// # Errors
    ///
    /// Returns [`Error::BackendNotFound`] for unknown ids.
    pub async fn restart(&self, backend_id: &str) -> Result<RestartReport> {
        self.monitor.restart(backend_id).await
    }

    /// Health, breaker and persisted statistics over the trailing window
    ///
    /// # Errors
    ///
    /// Returns [`Error::BackendNotFound`] for an unknown target, or a
    /// diagnostics error when the store cannot be queried.
    pub async fn diagnostics(&self, target: Option<&str>, window_hours: u32) -> Result<DiagnosticsReport> {
        let snapshot = self.registry.snapshot();
        let ids = match target {
            Some(id) if snapshot.get(id).is_none() => return Err(Error::BackendNotFound(id.to_string())),
            Some(id) => vec![id.to_string()],
            None => snapshot.ids(),
        };

        self.diagnostics.flush().await;
        let window = Duration::from_secs(u64::from(window_hours) * 3600);

        let mut backends = BTreeMap::new();
        for id in &ids {
            let stats = self.diagnostics.stats(Some(id), window).await?;
            backends.insert(
                id.clone(),
                BackendDiagnostics {
                    health: self.failsafe.health.state(id),
                    circuit: self.failsafe.circuit_breakers.status(id),
                    stats,
                },
            );
        }

        Ok(DiagnosticsReport {
            window_hours,
            overall: self.diagnostics.stats(target, window).await?,
            backends,
            recorder: self.diagnostics.counters(),
            cache: self.cache.stats(),
        })
    }

    /// Breaker state of every backend
    #[must_use]
    pub fn circuit_status(&self) -> BTreeMap<String, CircuitStatus> {
        self.failsafe.circuit_breakers.snapshot(&self.registry.snapshot().ids())
    }

    /// Health state of every backend
    #[must_use]
    pub fn health_states(&self) -> BTreeMap<String, HealthState> {
        self.failsafe.health.snapshot(&self.registry.snapshot().ids())
    }

    /// Response cache counters
    #[must_use]
    pub fn cache_stats(&self) -> CacheStatsSnapshot {
        self.cache.stats()
    }

    /// Connection pool usage
    #[must_use]
    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Request queue counters
    #[must_use]
    pub fn queue_stats(&self) -> QueueStats {
        self.queue.stats()
    }

    /// Load a new config and swap the backend registry.
    ///
    /// The new document is parsed and validated first; on failure the running
    /// registry stays in effect. Backends that disappear lose their breaker,
    /// health, limiter, cache and pool state. Modified backends keep breaker
    /// and health state but get fresh connections and an empty cache shard.
    /// Reloading an unchanged document touches nothing.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigReload`] when the document is unusable.
    #[tracing::instrument(skip_all)]
    pub fn reload_config(&self, source: &ReloadSource) -> Result<ReloadOutcome> {
        let _guard = self.reload_lock.lock();

        let new_config = source.load().inspect_err(|e| {
            warn!(error = %e, "Config reload rejected, keeping current registry");
        })?;

        let old_config = self.live.get();
        let patch = compute_diff(&old_config, &new_config);

        if patch.is_empty() {
            debug!("Config reload: no changes detected");
            return Ok(ReloadOutcome {
                success: true,
                reloaded_backends: Vec::new(),
                message: patch.summary(),
            });
        }

        info!(changes = %patch.summary(), "Config reload: applying patch");

        if patch.touches_backends() {
            self.registry.replace(RegistrySnapshot::from_config(&new_config));

            for id in &patch.backends_removed {
                self.failsafe.forget(id);
                self.cache.invalidate_backend(id);
                self.pool.evict(id);
                info!(backend = %id, "Config reload: backend removed");
            }
            for (id, _) in &patch.backends_modified {
                self.cache.invalidate_backend(id);
                self.pool.evict(id);
                info!(backend = %id, "Config reload: backend updated");
            }
            for (id, _) in &patch.backends_added {
                info!(backend = %id, "Config reload: backend added");
            }
        }

        if patch.settings_changed {
            warn!("Config reload: gateway settings changed, restart required to apply them");
        }

        let outcome = ReloadOutcome {
            success: true,
            reloaded_backends: patch.changed_ids(),
            message: patch.summary(),
        };
        self.live.set(new_config);
        Ok(outcome)
    }

    /// Start the health monitor, queue worker and maintenance loop
    pub fn spawn_background(self: &Arc<Self>, shutdown: &broadcast::Sender<()>) -> Vec<JoinHandle<()>> {
        let config = &self.settings;
        let mut handles = Vec::new();

        if config.failsafe.health_check.enabled {
            handles.push(Arc::clone(&self.monitor).spawn(shutdown.subscribe()));
        }
        if config.queue.enabled {
            handles.push(
                Arc::clone(&self.queue).spawn_worker(Arc::clone(&self.executor), shutdown.subscribe()),
            );
        }
        handles.push(self.spawn_maintenance(
            config.cache.sweep_interval,
            config.diagnostics.retention,
            shutdown.subscribe(),
        ));
        handles
    }

    fn spawn_maintenance(
        self: &Arc<Self>,
        interval: Duration,
        retention: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let expired = this.cache.evict_expired();
                        if expired > 0 {
                            debug!(expired, "Evicted expired cache entries");
                        }
                        match this.diagnostics.prune(retention).await {
                            Ok(0) => {}
                            Ok(rows) => debug!(rows, "Pruned diagnostics rows"),
                            Err(e) => warn!(error = %e, "Failed to prune diagnostics"),
                        }
                    }
                    _ = shutdown.recv() => break,
                }
            }
        })
    }

    /// Wait for pending diagnostics writes
    pub async fn flush_diagnostics(&self) {
        self.diagnostics.flush().await;
    }
}
