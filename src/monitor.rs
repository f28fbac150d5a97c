//! Active health monitoring
//!
//! Probes each backend's health endpoint through the same pool and transport
//! the executor uses. Probe outcomes feed the health trackers, the circuit
//! breakers and the diagnostics store. Critical backends that go offline are
//! reported to the [`Notifier`] and, when allowed, relaunched through the
//! [`Launcher`] and probed once more.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::backend::{Backend, BackendRegistry};
use crate::config::{AcquireMode, HealthCheckConfig, Priority};
use crate::credentials::{CredentialProvider, EnvCredentials, bearer_for};
use crate::diagnostics::{DiagnosticsRecorder, HealthRecord};
use crate::failsafe::{Failsafe, HealthStatus};
use crate::pool::ConnectionPool;
use crate::transport::{HttpTransport, OutboundRequest, Transport};
use crate::{Error, Result};

/// Notification severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Informational
    Info,
    /// Needs attention
    Warning,
    /// Gateway is impaired
    Critical,
}

/// Starts backend processes
#[async_trait]
pub trait Launcher: Send + Sync {
    /// Launch `backend`; returns whether the launch was initiated
    async fn launch(&self, backend: &Backend) -> bool;
}

/// Fire-and-forget alert side channel
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver one event
    async fn notify(&self, event: &str, severity: Severity, message: &str);
}

/// Launcher that never launches anything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopLauncher;

#[async_trait]
impl Launcher for NoopLauncher {
    async fn launch(&self, backend: &Backend) -> bool {
        debug!(backend = %backend.id, "No launcher configured");
        false
    }
}

/// Runs the backend's `launch_command` as a detached process
#[derive(Debug, Default, Clone, Copy)]
pub struct CommandLauncher;

#[async_trait]
impl Launcher for CommandLauncher {
    async fn launch(&self, backend: &Backend) -> bool {
        let Some(command) = backend.config.launch_command.as_deref() else {
            warn!(backend = %backend.id, "No launch_command configured");
            return false;
        };
        let Some(parts) = shlex::split(command) else {
            warn!(backend = %backend.id, command, "Cannot parse launch_command");
            return false;
        };
        let Some((program, args)) = parts.split_first() else {
            warn!(backend = %backend.id, "Empty launch_command");
            return false;
        };

        match tokio::process::Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
        {
            Ok(child) => {
                info!(backend = %backend.id, pid = child.id(), "Launched backend");
                true
            }
            Err(e) => {
                error!(backend = %backend.id, error = %e, "Failed to launch backend");
                false
            }
        }
    }
}

/// Notifier that drops every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify(&self, _event: &str, _severity: Severity, _message: &str) {}
}

/// Notifier that writes events to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, event: &str, severity: Severity, message: &str) {
        match severity {
            Severity::Info => info!(event, "{message}"),
            Severity::Warning => warn!(event, "{message}"),
            Severity::Critical => error!(event, "{message}"),
        }
    }
}

/// Outcome of a restart
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestartReport {
    /// Backend healthy after the relaunch
    pub success: bool,
    /// Human-readable outcome
    pub message: String,
}

/// Outcome of probing one backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeResult {
    /// Health status after the probe
    pub status: HealthStatus,
    /// Probe latency
    pub latency_ms: Option<u64>,
    /// Failure description
    pub error: Option<String>,
    /// Restart triggered by this check
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart: Option<RestartReport>,
}

impl ProbeResult {
    fn unfinished() -> Self {
        Self {
            status: HealthStatus::Unknown,
            latency_ms: None,
            error: Some("health check did not finish in time".to_string()),
            restart: None,
        }
    }

    /// Whether the probe reached a healthy backend
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy && self.error.is_none()
    }
}

/// Health monitor
pub struct HealthMonitor {
    config: HealthCheckConfig,
    registry: Arc<BackendRegistry>,
    failsafe: Arc<Failsafe>,
    pool: Arc<ConnectionPool>,
    diagnostics: Arc<DiagnosticsRecorder>,
    transport: Arc<dyn Transport>,
    credentials: Arc<dyn CredentialProvider>,
    launcher: Arc<dyn Launcher>,
    notifier: Arc<dyn Notifier>,
}

impl HealthMonitor {
    /// Create a monitor with the HTTP transport, env credentials and no-op
    /// launcher and notifier
    #[must_use]
    pub fn new(
        config: HealthCheckConfig,
        registry: Arc<BackendRegistry>,
        failsafe: Arc<Failsafe>,
        pool: Arc<ConnectionPool>,
        diagnostics: Arc<DiagnosticsRecorder>,
    ) -> Self {
        Self {
            config,
            registry,
            failsafe,
            pool,
            diagnostics,
            transport: Arc::new(HttpTransport::new()),
            credentials: Arc::new(EnvCredentials),
            launcher: Arc::new(NoopLauncher),
            notifier: Arc::new(NoopNotifier),
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

    /// Use a launcher
    #[must_use]
    pub fn with_launcher(mut self, launcher: Arc<dyn Launcher>) -> Self {
        self.launcher = launcher;
        self
    }

    /// Use a notifier
    #[must_use]
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Probe one backend.
    ///
    /// With `auto_restart`, a critical backend found offline is relaunched
    /// and probed once more.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BackendNotFound`] for unknown ids.
    #[tracing::instrument(skip(self), fields(backend = backend_id))]
    pub async fn check(&self, backend_id: &str, auto_restart: bool) -> Result<ProbeResult> {
        let backend = self
            .registry
            .get(backend_id)
            .ok_or_else(|| Error::BackendNotFound(backend_id.to_string()))?;
        let result = self.probe(&backend).await;
        Ok(self.after_probe(&backend, result, auto_restart).await)
    }

    /// Probe every backend concurrently.
    ///
    /// Results are collected as they complete until `batch_timeout`; probes
    /// still running at the deadline are aborted and reported `unknown`.
    pub async fn check_all(self: &Arc<Self>, auto_restart: bool) -> BTreeMap<String, ProbeResult> {
        let backends = self.registry.all();
        let deadline = tokio::time::Instant::now() + self.config.batch_timeout;

        let mut probes = JoinSet::new();
        for backend in &backends {
            let this = Arc::clone(self);
            let backend = Arc::clone(backend);
            probes.spawn(async move {
                let result = this.probe(&backend).await;
                (backend.id.clone(), result)
            });
        }

        let mut finished = BTreeMap::new();
        loop {
            match tokio::time::timeout_at(deadline, probes.join_next()).await {
                Ok(Some(Ok((id, result)))) => {
                    finished.insert(id, result);
                }
                Ok(Some(Err(e))) => warn!(error = %e, "Health probe task failed"),
                Ok(None) => break,
                Err(_) => {
                    warn!(pending = probes.len(), "Batch health check deadline reached");
                    break;
                }
            }
        }
        probes.abort_all();

        let followups = backends.iter().map(|backend| {
            let result = finished
                .remove(&backend.id)
                .unwrap_or_else(ProbeResult::unfinished);
            async move {
                let result = self.after_probe(backend, result, auto_restart).await;
                (backend.id.clone(), result)
            }
        });
        futures::future::join_all(followups).await.into_iter().collect()
    }

    /// Relaunch a backend through the launcher and probe it after the grace
    /// period.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BackendNotFound`] for unknown ids.
    #[tracing::instrument(skip(self), fields(backend = backend_id))]
    pub async fn restart(&self, backend_id: &str) -> Result<RestartReport> {
        let backend = self
            .registry
            .get(backend_id)
            .ok_or_else(|| Error::BackendNotFound(backend_id.to_string()))?;
        Ok(self.restart_and_reprobe(&backend).await.0)
    }

    /// Run [`HealthMonitor::check_all`] every `interval` until shutdown
    pub fn spawn(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let period = self.config.interval.max(Duration::from_millis(100));
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval_ms = period.as_millis() as u64, "Health monitor started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let results = self.check_all(self.config.auto_restart).await;
                        let healthy = results.values().filter(|r| r.is_healthy()).count();
                        debug!(healthy, total = results.len(), "Health sweep complete");
                    }
                    _ = shutdown.recv() => {
                        info!("Health monitor shutting down");
                        break;
                    }
                }
            }
        })
    }

    async fn after_probe(&self, backend: &Backend, result: ProbeResult, auto_restart: bool) -> ProbeResult {
        if backend.config.priority != Priority::Critical || result.status != HealthStatus::Offline {
            return result;
        }

        self.notify(
            "critical_offline",
            Severity::Critical,
            format!(
                "Critical backend '{}' is offline: {}",
                backend.display_name(),
                result.error.as_deref().unwrap_or("no response")
            ),
        );

        if !(auto_restart && backend.restartable()) {
            return result;
        }

        let (report, reprobe) = self.restart_and_reprobe(backend).await;
        let mut result = reprobe.unwrap_or(result);
        result.restart = Some(report);
        result
    }

    async fn restart_and_reprobe(&self, backend: &Backend) -> (RestartReport, Option<ProbeResult>) {
        info!(backend = %backend.id, "Restarting backend");
        telemetry_metrics::counter!("gateway_restarts_total", "backend" => backend.id.clone()).increment(1);

        if !self.launcher.launch(backend).await {
            let message = format!("Launcher could not start '{}'", backend.id);
            self.notify("restart_failed", Severity::Critical, message.clone());
            return (RestartReport { success: false, message }, None);
        }

        self.pool.evict(&backend.id);
        tokio::time::sleep(self.config.restart_grace).await;

        let probe = self.probe(backend).await;
        let report = if probe.is_healthy() {
            let message = format!(
                "Backend '{}' restarted and healthy ({}ms)",
                backend.id,
                probe.latency_ms.unwrap_or_default()
            );
            self.notify("backend_restarted", Severity::Info, message.clone());
            RestartReport { success: true, message }
        } else {
            let message = format!(
                "Backend '{}' relaunched but still unhealthy: {}",
                backend.id,
                probe.error.as_deref().unwrap_or("no response")
            );
            self.notify("restart_failed", Severity::Critical, message.clone());
            RestartReport { success: false, message }
        };
        (report, Some(probe))
    }

    /// Probe a backend and record the outcome
    async fn probe(&self, backend: &Backend) -> ProbeResult {
        let tracker = self.failsafe.health.get(&backend.id);

        // A missing credential is a local configuration problem
        let bearer = match bearer_for(self.credentials.as_ref(), backend) {
            Ok(bearer) => bearer,
            Err(e) => {
                warn!(backend = %backend.id, error = %e, "Probe skipped, credential unavailable");
                return ProbeResult {
                    status: tracker.status(),
                    latency_ms: None,
                    error: Some(e.to_string()),
                    restart: None,
                };
            }
        };

        let timeout = backend.timeout().min(self.config.timeout);
        let started = Instant::now();
        let outcome = self.send_probe(backend, bearer, timeout).await;
        let latency = started.elapsed();
        let latency_ms = latency.as_millis() as u64;

        let result = match outcome {
            // Pool pressure says nothing about the backend itself
            Err(e) if e.is_local_rejection() => {
                debug!(backend = %backend.id, error = %e, "Probe skipped");
                return ProbeResult {
                    status: tracker.status(),
                    latency_ms: None,
                    error: Some(e.to_string()),
                    restart: None,
                };
            }
            Ok(_) => {
                tracker.record_success(latency);
                ProbeResult {
                    status: HealthStatus::Healthy,
                    latency_ms: Some(latency_ms),
                    error: None,
                    restart: None,
                }
            }
            Err(e) => {
                let status = tracker.record_failure(Some(latency));
                ProbeResult {
                    status,
                    latency_ms: Some(latency_ms),
                    error: Some(e.to_string()),
                    restart: None,
                }
            }
        };

        let healthy = result.error.is_none();
        self.failsafe.circuit_breakers.get(&backend.id).record_probe(healthy);
        self.diagnostics.log_health(HealthRecord {
            backend_id: backend.id.clone(),
            healthy,
            latency_ms: result.latency_ms,
            error: result.error.clone(),
            timestamp: Utc::now(),
        });
        telemetry_metrics::counter!(
            "gateway_health_probes_total",
            "backend" => backend.id.clone(),
            "healthy" => healthy.to_string()
        )
        .increment(1);

        result
    }

    async fn send_probe(&self, backend: &Backend, bearer: Option<String>, timeout: Duration) -> Result<Value> {
        let conn = self.pool.acquire(&backend.id, AcquireMode::Wait, timeout).await?;
        let request = OutboundRequest::new(
            backend,
            &backend.config.url,
            &backend.config.health_path,
            Method::GET,
            timeout,
        )
        .with_bearer(bearer);
        self.transport.send(&conn, &request).await
    }

    fn notify(&self, event: &'static str, severity: Severity, message: String) {
        let notifier = Arc::clone(&self.notifier);
        tokio::spawn(async move {
            notifier.notify(event, severity, &message).await;
        });
    }
}
