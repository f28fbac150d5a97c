//! Request queue
//!
//! A bounded FIFO that absorbs calls rejected under backpressure. A single
//! worker replays them through the executor in arrival order. Before each
//! replay the worker waits until the backend's rate-limit window has room;
//! a replay turned away by the limiter or the pool is held and retried. Only a
//! replay that actually ran and failed on its own retry budget is dropped, and
//! it is never queued again.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::QueueConfig;
use crate::error::ErrorKind;
use crate::executor::{CallExecutor, CallRequest, CallResult};
use crate::{Error, Result};

/// Pause between replays held back by an exhausted pool
const BACKPRESSURE_POLL: Duration = Duration::from_millis(50);

/// A call waiting for replay
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedRequest {
    /// The call
    pub request: CallRequest,
    /// When it was queued
    pub enqueued_at: DateTime<Utc>,
    /// Attempts made before it was queued
    pub attempts_so_far: u32,
}

/// Queue counters
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    /// Requests waiting
    pub len: usize,
    /// Maximum requests waiting
    pub capacity: usize,
    /// Requests replayed successfully
    pub completed: u64,
    /// Requests that failed on replay, or waited out `max_wait`, and were dropped
    pub failed: u64,
    /// Requests rejected because the queue was full
    pub rejected: u64,
}

/// Bounded FIFO of pending calls
pub struct RequestQueue {
    capacity: usize,
    max_wait: Duration,
    tx: mpsc::Sender<QueuedRequest>,
    rx: Mutex<mpsc::Receiver<QueuedRequest>>,
    len: AtomicUsize,
    completed: AtomicU64,
    failed: AtomicU64,
    rejected: AtomicU64,
}

impl RequestQueue {
    /// Create a queue holding at most `capacity` requests
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self::from_config(&QueueConfig {
            capacity,
            ..QueueConfig::default()
        })
    }

    /// Create from configuration
    #[must_use]
    pub fn from_config(config: &QueueConfig) -> Self {
        let capacity = config.capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            capacity,
            max_wait: config.max_wait,
            tx,
            rx: Mutex::new(rx),
            len: AtomicUsize::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    /// Append a request; never waits.
    ///
    /// # Errors
    ///
    /// Returns [`Error::QueueFull`] at capacity.
    pub fn enqueue(&self, request: CallRequest, attempts_so_far: u32) -> Result<()> {
        let queued = QueuedRequest {
            request,
            enqueued_at: Utc::now(),
            attempts_so_far,
        };
        // Counted before the send so the worker can never dequeue first
        let len = self.len.fetch_add(1, Ordering::Relaxed) + 1;
        match self.tx.try_send(queued) {
            Ok(()) => {
                telemetry_metrics::gauge!("gateway_queue_length").set(len as f64);
                debug!(len, "Request queued");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(q)) => {
                self.len.fetch_sub(1, Ordering::Relaxed);
                self.rejected.fetch_add(1, Ordering::Relaxed);
                warn!(backend = %q.request.backend_id, capacity = self.capacity, "Request queue full");
                Err(Error::QueueFull(self.capacity))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.len.fetch_sub(1, Ordering::Relaxed);
                Err(Error::Shutdown)
            }
        }
    }

    /// Requests waiting
    #[must_use]
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    /// True when nothing is waiting
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Counters
    #[must_use]
    pub fn stats(&self) -> QueueStats {
        QueueStats {
            len: self.len(),
            capacity: self.capacity,
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }

    /// Replay everything queued right now, in order; returns the results
    pub async fn drain(&self, executor: &CallExecutor) -> Vec<CallResult> {
        let mut results = Vec::new();
        loop {
            let next = self.rx.lock().await.try_recv();
            match next {
                Ok(queued) => results.push(self.process(queued, executor).await),
                Err(_) => break,
            }
        }
        results
    }

    /// Replay requests as they arrive until shutdown
    pub fn spawn_worker(
        self: Arc<Self>,
        executor: Arc<CallExecutor>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(capacity = self.capacity, "Queue worker started");
            loop {
                tokio::select! {
                    _ = shutdown.recv() => {
                        info!(pending = self.len(), "Queue worker shutting down");
                        break;
                    }
                    next = async { self.rx.lock().await.recv().await } => {
                        let Some(queued) = next else { break };
                        let backend_id = queued.request.backend_id.clone();
                        tokio::select! {
                            _ = shutdown.recv() => {
                                warn!(
                                    backend = %backend_id,
                                    pending = self.len(),
                                    "Queue worker shutting down mid-replay"
                                );
                                break;
                            }
                            _ = self.process(queued, &executor) => {}
                        }
                    }
                }
            }
        })
    }

    async fn process(&self, queued: QueuedRequest, executor: &CallExecutor) -> CallResult {
        let len = self.len.fetch_sub(1, Ordering::Relaxed).saturating_sub(1);
        telemetry_metrics::gauge!("gateway_queue_length").set(len as f64);

        let result = self.replay(&queued.request, executor).await;
        let waited_ms = (Utc::now() - queued.enqueued_at).num_milliseconds();

        if result.success {
            self.completed.fetch_add(1, Ordering::Relaxed);
            debug!(backend = %queued.request.backend_id, waited_ms, "Queued request completed");
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
            warn!(
                backend = %queued.request.backend_id,
                endpoint = %queued.request.endpoint,
                attempts_so_far = queued.attempts_so_far,
                attempts = result.attempts,
                error = ?result.error,
                "Queued request failed, dropping"
            );
        }
        result
    }

    /// Run a queued call, holding it while the backend is still rate limited
    /// or its pool is exhausted
    async fn replay(&self, request: &CallRequest, executor: &CallExecutor) -> CallResult {
        let deadline = Instant::now() + self.max_wait;
        let mut wait = executor.admission_delay(&request.backend_id);
        loop {
            if !wait.is_zero() {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if wait > remaining {
                    // Out of patience: one last try, whatever it returns stands
                    tokio::time::sleep(remaining).await;
                    return executor.call(request).await;
                }
                tokio::time::sleep(wait).await;
            }

            let result = executor.call(request).await;
            if !matches!(
                result.error_kind(),
                Some(ErrorKind::RateLimitExceeded | ErrorKind::PoolExhausted)
            ) {
                return result;
            }
            wait = executor.admission_delay(&request.backend_id).max(BACKPRESSURE_POLL);
            debug!(
                backend = %request.backend_id,
                wait_ms = wait.as_millis() as u64,
                "Queued request still under backpressure"
            );
        }
    }
}
