//! Backend health state
//!
//! Tracks per-backend health:
//! - HEALTHY / DEGRADED / OFFLINE / UNKNOWN status
//! - Consecutive failure streak
//! - Last check time and latency
//! - Recent latency percentiles (p50, p95, p99)

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Default capacity for latency histogram
const DEFAULT_HISTOGRAM_CAPACITY: usize = 1000;

/// Health status of a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Last observation succeeded
    Healthy,
    /// Failing, below the offline threshold
    Degraded,
    /// Failing for `offline_threshold` consecutive observations
    Offline,
    /// Never observed
    #[default]
    Unknown,
}

/// Snapshot of a backend's health
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthState {
    /// Current status
    pub status: HealthStatus,
    /// Consecutive failed observations
    pub consecutive_failures: u32,
    /// When the backend was last observed
    pub last_checked_at: Option<DateTime<Utc>>,
    /// Latency of the last observation
    pub last_latency_ms: Option<u64>,
}

impl Default for HealthState {
    fn default() -> Self {
        Self {
            status: HealthStatus::Unknown,
            consecutive_failures: 0,
            last_checked_at: None,
            last_latency_ms: None,
        }
    }
}

/// Health tracker for one backend
pub struct HealthTracker {
    /// Backend name
    name: String,
    offline_threshold: u32,
    state: RwLock<HealthState>,
    /// Latency histogram (for percentile calculation)
    latencies: RwLock<LatencyHistogram>,
}

impl HealthTracker {
    /// Create a new health tracker
    #[must_use]
    pub fn new(name: &str, offline_threshold: u32) -> Self {
        Self {
            name: name.to_string(),
            offline_threshold: offline_threshold.max(1),
            state: RwLock::new(HealthState::default()),
            latencies: RwLock::new(LatencyHistogram::new(DEFAULT_HISTOGRAM_CAPACITY)),
        }
    }

    /// Record a successful observation
    pub fn record_success(&self, latency: Duration) {
        self.latencies.write().record(latency);

        let mut state = self.state.write();
        if matches!(state.status, HealthStatus::Degraded | HealthStatus::Offline) {
            info!(backend = %self.name, previous = ?state.status, "Backend recovered");
        }
        state.status = HealthStatus::Healthy;
        state.consecutive_failures = 0;
        state.last_checked_at = Some(Utc::now());
        state.last_latency_ms = Some(latency.as_millis() as u64);
    }

    /// Record a failed observation; returns the new status
    pub fn record_failure(&self, latency: Option<Duration>) -> HealthStatus {
        let mut state = self.state.write();
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        state.last_checked_at = Some(Utc::now());
        state.last_latency_ms = latency.map(|l| l.as_millis() as u64);

        let next = if state.consecutive_failures >= self.offline_threshold {
            HealthStatus::Offline
        } else {
            HealthStatus::Degraded
        };

        if next != state.status {
            warn!(
                backend = %self.name,
                consecutive_failures = state.consecutive_failures,
                status = ?next,
                "Backend health degraded"
            );
        }
        state.status = next;
        next
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> HealthState {
        self.state.read().clone()
    }

    /// Current status
    #[must_use]
    pub fn status(&self) -> HealthStatus {
        self.state.read().status
    }

    /// Latency percentile over recent successes
    #[must_use]
    pub fn latency_percentile(&self, p: f64) -> Option<Duration> {
        self.latencies.read().percentile(p)
    }

    /// Reset all state
    pub fn reset(&self) {
        *self.state.write() = HealthState::default();
        self.latencies.write().clear();
    }
}

/// Per-backend health trackers
pub struct HealthTrackers {
    offline_threshold: u32,
    trackers: DashMap<String, Arc<HealthTracker>>,
}

impl HealthTrackers {
    /// Create an empty set
    #[must_use]
    pub fn new(offline_threshold: u32) -> Self {
        Self {
            offline_threshold,
            trackers: DashMap::new(),
        }
    }

    /// Tracker for a backend, created UNKNOWN on first use
    #[must_use]
    pub fn get(&self, backend_id: &str) -> Arc<HealthTracker> {
        if let Some(t) = self.trackers.get(backend_id) {
            return Arc::clone(&t);
        }
        Arc::clone(
            &self
                .trackers
                .entry(backend_id.to_string())
                .or_insert_with(|| Arc::new(HealthTracker::new(backend_id, self.offline_threshold))),
        )
    }

    /// State of a backend (UNKNOWN when never observed)
    #[must_use]
    pub fn state(&self, backend_id: &str) -> HealthState {
        self.trackers
            .get(backend_id)
            .map(|t| t.state())
            .unwrap_or_default()
    }

    /// States for the given ids
    #[must_use]
    pub fn snapshot<'a>(&self, ids: impl IntoIterator<Item = &'a String>) -> BTreeMap<String, HealthState> {
        ids.into_iter().map(|id| (id.clone(), self.state(id))).collect()
    }

    /// Drop state for a backend that left the registry
    pub fn remove(&self, backend_id: &str) {
        self.trackers.remove(backend_id);
    }
}

/// Latency histogram for percentile calculation
struct LatencyHistogram {
    /// Recent latency samples (in milliseconds)
    samples: std::collections::VecDeque<u64>,
    /// Maximum number of samples to keep
    capacity: usize,
}

impl LatencyHistogram {
    fn new(capacity: usize) -> Self {
        Self {
            samples: std::collections::VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn record(&mut self, latency: Duration) {
        if self.samples.len() >= self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(latency.as_millis() as u64);
    }

    /// Calculate percentile (0.0 to 1.0)
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
    fn percentile(&self, p: f64) -> Option<Duration> {
        if self.samples.is_empty() {
            return None;
        }
        let mut sorted: Vec<u64> = self.samples.iter().copied().collect();
        sorted.sort_unstable();
        let index = ((sorted.len() as f64) * p).floor() as usize;
        Some(Duration::from_millis(sorted[index.min(sorted.len() - 1)]))
    }

    fn clear(&mut self) {
        self.samples.clear();
    }
}
