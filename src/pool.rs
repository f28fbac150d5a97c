//! Connection pool
//!
//! Bounds concurrent backend connections globally and per backend. Each
//! backend gets its own `reqwest` client, whose keep-alive pool reuses idle
//! connections; the semaphores decide how many calls may hold one at a time.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use reqwest::Client;
use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tracing::{debug, trace};

use crate::config::{AcquireMode, PoolConfig};
use crate::{Error, Result};

/// Per-backend slot: connection budget plus the keep-alive client
struct BackendSlot {
    permits: Arc<Semaphore>,
    client: Client,
}

/// Bounded pool of backend connections
pub struct ConnectionPool {
    config: PoolConfig,
    global: Arc<Semaphore>,
    backends: DashMap<String, Arc<BackendSlot>>,
}

/// A checked-out connection.
///
/// Both permits are returned when the guard is dropped, whatever the exit
/// path of the call holding it.
pub struct PooledConnection {
    backend_id: String,
    client: Client,
    _local: OwnedSemaphorePermit,
    _global: OwnedSemaphorePermit,
}

impl PooledConnection {
    /// HTTP client bound to this backend's connection pool
    #[must_use]
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Backend the connection belongs to
    #[must_use]
    pub fn backend_id(&self) -> &str {
        &self.backend_id
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        trace!(backend = %self.backend_id, "Connection returned to pool");
    }
}

impl ConnectionPool {
    /// Create a pool from configuration
    #[must_use]
    pub fn new(config: PoolConfig) -> Self {
        let global = Arc::new(Semaphore::new(config.max_connections.max(1)));
        Self {
            config,
            global,
            backends: DashMap::new(),
        }
    }

    /// Default acquisition mode
    #[must_use]
    pub fn default_mode(&self) -> AcquireMode {
        self.config.acquire
    }

    /// Check out a connection for `backend_id`.
    ///
    /// In [`AcquireMode::Wait`] the caller waits at most `wait_bound` for a
    /// slot; in [`AcquireMode::FailFast`] it fails at once when none is free.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PoolExhausted`] when no slot could be obtained.
    pub async fn acquire(
        &self,
        backend_id: &str,
        mode: AcquireMode,
        wait_bound: Duration,
    ) -> Result<PooledConnection> {
        let slot = self.slot(backend_id)?;

        let (local, global) = match mode {
            AcquireMode::FailFast => {
                let local = try_permit(&slot.permits, backend_id)?;
                let global = try_permit(&self.global, backend_id)?;
                (local, global)
            }
            AcquireMode::Wait => {
                let permits = Arc::clone(&slot.permits);
                let global = Arc::clone(&self.global);
                tokio::time::timeout(wait_bound, async move {
                    let local = permits.acquire_owned().await;
                    let global = global.acquire_owned().await;
                    (local, global)
                })
                .await
                .map_err(|_| {
                    debug!(backend = backend_id, wait_ms = wait_bound.as_millis() as u64, "Timed out waiting for pool slot");
                    Error::PoolExhausted(backend_id.to_string())
                })
                .and_then(|(local, global)| match (local, global) {
                    (Ok(l), Ok(g)) => Ok((l, g)),
                    _ => Err(Error::Shutdown),
                })?
            }
        };

        trace!(backend = backend_id, "Connection checked out");
        Ok(PooledConnection {
            backend_id: backend_id.to_string(),
            client: slot.client.clone(),
            _local: local,
            _global: global,
        })
    }

    /// Drop a backend's client and budget.
    ///
    /// Connections already checked out stay valid; the next acquire builds a
    /// fresh client.
    pub fn evict(&self, backend_id: &str) {
        if self.backends.remove(backend_id).is_some() {
            debug!(backend = backend_id, "Evicted pooled connections");
        }
    }

    /// Current usage
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let max_per_backend = self.config.max_per_backend.max(1);
        let backends: BTreeMap<String, BackendPoolStats> = self
            .backends
            .iter()
            .map(|entry| {
                let in_use = max_per_backend - entry.permits.available_permits();
                (
                    entry.key().clone(),
                    BackendPoolStats {
                        in_use,
                        capacity: max_per_backend,
                    },
                )
            })
            .collect();

        let capacity = self.config.max_connections.max(1);
        PoolStats {
            in_use: capacity - self.global.available_permits(),
            capacity,
            backends,
        }
    }

    fn slot(&self, backend_id: &str) -> Result<Arc<BackendSlot>> {
        if let Some(slot) = self.backends.get(backend_id) {
            return Ok(Arc::clone(&slot));
        }

        let client = Client::builder()
            .pool_max_idle_per_host(self.config.max_per_backend)
            .pool_idle_timeout(self.config.idle_timeout)
            .tcp_keepalive(Duration::from_secs(30))
            .tcp_nodelay(true)
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .map_err(|e| Error::Internal(format!("failed to build HTTP client: {e}")))?;

        let slot = self
            .backends
            .entry(backend_id.to_string())
            .or_insert_with(|| {
                Arc::new(BackendSlot {
                    permits: Arc::new(Semaphore::new(self.config.max_per_backend.max(1))),
                    client,
                })
            });
        Ok(Arc::clone(&slot))
    }
}

fn try_permit(semaphore: &Arc<Semaphore>, backend_id: &str) -> Result<OwnedSemaphorePermit> {
    Arc::clone(semaphore)
        .try_acquire_owned()
        .map_err(|e| match e {
            TryAcquireError::NoPermits => Error::PoolExhausted(backend_id.to_string()),
            TryAcquireError::Closed => Error::Shutdown,
        })
}

/// Pool usage snapshot
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    /// Connections checked out across all backends
    pub in_use: usize,
    /// Global cap
    pub capacity: usize,
    /// Per-backend usage
    pub backends: BTreeMap<String, BackendPoolStats>,
}

/// Usage of one backend's budget
#[derive(Debug, Clone, Serialize)]
pub struct BackendPoolStats {
    /// Connections checked out
    pub in_use: usize,
    /// Per-backend cap
    pub capacity: usize,
}
