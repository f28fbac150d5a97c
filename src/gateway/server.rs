//! Gateway server

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use super::facade::Gateway;
use super::router::{AppState, create_router};
use crate::config_reload::ConfigWatcher;
use crate::{Error, Result};

/// Admin HTTP server around a [`Gateway`]
pub struct GatewayServer {
    gateway: Arc<Gateway>,
    config_path: Option<PathBuf>,
}

impl GatewayServer {
    /// Serve `gateway`; `config_path` enables hot reload of that file
    #[must_use]
    pub fn new(gateway: Arc<Gateway>, config_path: Option<PathBuf>) -> Self {
        Self { gateway, config_path }
    }

    /// Run until Ctrl+C or SIGTERM
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot be bound.
    pub async fn run(self) -> Result<()> {
        let config = self.gateway.config();
        let addr = SocketAddr::new(
            config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            config.server.port,
        );

        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        let background = self.gateway.spawn_background(&shutdown_tx);

        let _watcher = match &self.config_path {
            Some(path) if config.server.watch_config => {
                match ConfigWatcher::start(path.clone(), Arc::clone(&self.gateway), shutdown_tx.subscribe()) {
                    Ok(watcher) => {
                        info!(path = %path.display(), "Config hot-reload enabled");
                        Some(watcher)
                    }
                    Err(e) => {
                        warn!(error = %e, "Config watcher unavailable, reload via POST /reload only");
                        None
                    }
                }
            }
            _ => None,
        };

        let state = Arc::new(AppState {
            gateway: Arc::clone(&self.gateway),
            config_path: self.config_path.clone(),
        });
        let app = create_router(state, config.server.request_timeout);

        let listener = TcpListener::bind(addr).await?;

        info!("============================================================");
        info!("RESILIENT GATEWAY v{}", env!("CARGO_PKG_VERSION"));
        info!("============================================================");
        info!(host = %config.server.host, port = %config.server.port, "Listening");
        info!(backends = self.gateway.backends().len(), "Backends registered");
        info!(
            threshold = config.failsafe.circuit_breaker.failure_threshold,
            cooldown = ?config.failsafe.circuit_breaker.cooldown,
            "Circuit breaker"
        );
        if config.failsafe.health_check.enabled {
            info!(
                interval = ?config.failsafe.health_check.interval,
                auto_restart = config.failsafe.health_check.auto_restart,
                "Health monitor"
            );
        }
        if config.cache.enabled {
            info!(max_entries = config.cache.max_entries, ttl = ?config.cache.default_ttl, "Response cache");
        }
        info!(path = %config.diagnostics.path, "Diagnostics store");
        for backend in self.gateway.backends() {
            info!("  /call/{}/...  -> {}", backend.id, backend.url);
        }
        info!("============================================================");

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal(shutdown_tx))
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;

        info!("Waiting for background tasks...");
        for handle in background {
            if let Err(e) = handle.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }
        self.gateway.flush_diagnostics().await;

        Ok(())
    }
}

/// Shutdown signal handler
async fn shutdown_signal(shutdown_tx: broadcast::Sender<()>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
    let _ = shutdown_tx.send(());
}
