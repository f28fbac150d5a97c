//! Circuit breaker implementation
//!
//! Each backend owns one [`CircuitBreaker`] guarded by its own lock;
//! [`CircuitBreakers`] keys them by backend id so unrelated backends never
//! contend.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::CircuitBreakerConfig;

/// Circuit breaker phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitPhase {
    /// Circuit is closed (allowing requests)
    Closed,
    /// Circuit is open (blocking requests)
    Open,
    /// Cooldown elapsed; a single trial call decides the next phase
    HalfOpen,
}

/// Outcome of asking the breaker for permission to call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Normal call
    Allowed,
    /// The single trial call after cooldown
    Trial,
}

/// Point-in-time breaker state
#[derive(Debug, Clone, Serialize)]
pub struct CircuitStatus {
    /// Current phase
    pub phase: CircuitPhase,
    /// Consecutive failures
    pub failure_count: u32,
    /// When the circuit last opened
    pub opened_at: Option<DateTime<Utc>>,
    /// When the current cooldown ends (open phase only)
    pub opens_until: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct State {
    phase: CircuitPhase,
    failures: u32,
    opened_at: Option<Instant>,
    opened_wall: Option<DateTime<Utc>>,
    trial_in_flight: bool,
}

impl State {
    fn open(&mut self, now: Instant) {
        self.phase = CircuitPhase::Open;
        self.opened_at = Some(now);
        self.opened_wall = Some(Utc::now());
        self.trial_in_flight = false;
    }

    fn close(&mut self) {
        self.phase = CircuitPhase::Closed;
        self.failures = 0;
        self.opened_at = None;
        self.opened_wall = None;
        self.trial_in_flight = false;
    }

    fn cooldown_remaining(&self, cooldown: Duration, now: Instant) -> Duration {
        self.opened_at
            .map_or(Duration::ZERO, |t| cooldown.saturating_sub(now.duration_since(t)))
    }
}

/// Circuit breaker for a single backend
pub struct CircuitBreaker {
    /// Backend name
    name: String,
    enabled: bool,
    failure_threshold: u32,
    cooldown: Duration,
    state: Mutex<State>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker
    #[must_use]
    pub fn new(name: &str, config: &CircuitBreakerConfig) -> Self {
        Self {
            name: name.to_string(),
            enabled: config.enabled,
            failure_threshold: config.failure_threshold.max(1),
            cooldown: config.cooldown,
            state: Mutex::new(State {
                phase: CircuitPhase::Closed,
                failures: 0,
                opened_at: None,
                opened_wall: None,
                trial_in_flight: false,
            }),
        }
    }

    /// Ask for permission to issue a call.
    ///
    /// # Errors
    ///
    /// Returns the remaining cooldown when the circuit is blocking calls.
    pub fn try_acquire(&self) -> Result<Admission, Duration> {
        self.try_acquire_at(Instant::now())
    }

    fn try_acquire_at(&self, now: Instant) -> Result<Admission, Duration> {
        if !self.enabled {
            return Ok(Admission::Allowed);
        }

        let mut state = self.state.lock();
        match state.phase {
            CircuitPhase::Closed => Ok(Admission::Allowed),
            CircuitPhase::Open => {
                let remaining = state.cooldown_remaining(self.cooldown, now);
                if remaining.is_zero() {
                    state.phase = CircuitPhase::HalfOpen;
                    state.trial_in_flight = true;
                    debug!(backend = %self.name, "Cooldown elapsed, admitting trial call");
                    Ok(Admission::Trial)
                } else {
                    tracing::trace!(backend = %self.name, "Circuit open, rejecting request");
                    Err(remaining)
                }
            }
            CircuitPhase::HalfOpen => {
                if state.trial_in_flight {
                    Err(Duration::ZERO)
                } else {
                    state.trial_in_flight = true;
                    Ok(Admission::Trial)
                }
            }
        }
    }

    /// Give back a trial slot that never reached the network
    pub fn release_trial(&self) {
        let mut state = self.state.lock();
        if state.phase == CircuitPhase::HalfOpen {
            state.trial_in_flight = false;
        }
    }

    /// True while calls are being blocked
    #[must_use]
    pub fn is_open(&self) -> bool {
        if !self.enabled {
            return false;
        }
        let state = self.state.lock();
        match state.phase {
            CircuitPhase::Closed => false,
            CircuitPhase::Open => !state.cooldown_remaining(self.cooldown, Instant::now()).is_zero(),
            CircuitPhase::HalfOpen => state.trial_in_flight,
        }
    }

    /// Record the successful outcome of a logical call
    #[tracing::instrument(skip(self), fields(backend = %self.name))]
    pub fn record_success(&self) {
        if !self.enabled {
            return;
        }

        let mut state = self.state.lock();
        match state.phase {
            CircuitPhase::Closed => {
                state.failures = 0;
                tracing::trace!("Success in closed state, reset failure count");
            }
            CircuitPhase::HalfOpen => {
                state.close();
                info!(backend = %self.name, "Trial call succeeded, circuit closed");
            }
            CircuitPhase::Open => {
                tracing::trace!("Success recorded in open state (ignored)");
            }
        }
    }

    /// Record the failed outcome of a logical call
    #[tracing::instrument(skip(self), fields(backend = %self.name))]
    pub fn record_failure(&self) {
        self.record_failure_at(Instant::now());
    }

    fn record_failure_at(&self, now: Instant) {
        if !self.enabled {
            return;
        }

        let mut state = self.state.lock();
        state.failures = state.failures.saturating_add(1);
        match state.phase {
            CircuitPhase::Closed => {
                warn!(
                    backend = %self.name,
                    failures = state.failures,
                    threshold = self.failure_threshold,
                    "Failure in closed state"
                );
                if state.failures >= self.failure_threshold {
                    state.open(now);
                    warn!(backend = %self.name, failures = state.failures, "Circuit breaker opened");
                }
            }
            CircuitPhase::HalfOpen => {
                state.open(now);
                warn!(backend = %self.name, "Trial call failed, reopening circuit");
            }
            CircuitPhase::Open => {
                tracing::trace!("Failure recorded in open state (cooldown unchanged)");
            }
        }
    }

    /// Feed a health probe result.
    ///
    /// A passing probe closes the circuit only once the cooldown has run out;
    /// a failing probe counts like a failed call while the circuit is closed.
    pub fn record_probe(&self, healthy: bool) {
        if !self.enabled {
            return;
        }

        let now = Instant::now();
        let mut state = self.state.lock();
        match (state.phase, healthy) {
            (CircuitPhase::Closed, true) => state.failures = 0,
            (CircuitPhase::HalfOpen, true) => {
                state.close();
                info!(backend = %self.name, "Health probe succeeded, circuit closed");
            }
            (CircuitPhase::Open, true) => {
                if state.cooldown_remaining(self.cooldown, now).is_zero() {
                    state.close();
                    info!(backend = %self.name, "Health probe after cooldown succeeded, circuit closed");
                }
            }
            (CircuitPhase::Closed | CircuitPhase::HalfOpen, false) => {
                drop(state);
                self.record_failure_at(now);
            }
            (CircuitPhase::Open, false) => {}
        }
    }

    /// Current phase
    #[must_use]
    pub fn phase(&self) -> CircuitPhase {
        self.state.lock().phase
    }

    /// Snapshot of the breaker
    #[must_use]
    pub fn status(&self) -> CircuitStatus {
        let state = self.state.lock();
        let opens_until = match (state.phase, state.opened_wall) {
            (CircuitPhase::Open, Some(wall)) => chrono::Duration::from_std(self.cooldown)
                .ok()
                .map(|cooldown| wall + cooldown),
            _ => None,
        };
        CircuitStatus {
            phase: state.phase,
            failure_count: state.failures,
            opened_at: state.opened_wall,
            opens_until,
        }
    }

    /// Human-readable status line
    #[must_use]
    pub fn status_message(&self) -> String {
        let state = self.state.lock();
        match state.phase {
            CircuitPhase::Closed => format!("Backend '{}' circuit closed", self.name),
            CircuitPhase::Open => format!(
                "Backend '{}' circuit breaker is open after {} failures, retry in {} seconds",
                self.name,
                state.failures,
                state.cooldown_remaining(self.cooldown, Instant::now()).as_secs()
            ),
            CircuitPhase::HalfOpen => {
                format!("Backend '{}' circuit half-open, trial call pending", self.name)
            }
        }
    }
}

/// Per-backend circuit breakers
pub struct CircuitBreakers {
    config: CircuitBreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl CircuitBreakers {
    /// Create an empty set
    #[must_use]
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    /// Breaker for a backend, created closed on first use
    #[must_use]
    pub fn get(&self, backend_id: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.get(backend_id) {
            return Arc::clone(&breaker);
        }
        Arc::clone(
            &self
                .breakers
                .entry(backend_id.to_string())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(backend_id, &self.config))),
        )
    }

    /// Record a successful call
    pub fn record_success(&self, backend_id: &str) {
        self.get(backend_id).record_success();
    }

    /// Record a failed call
    pub fn record_failure(&self, backend_id: &str) {
        self.get(backend_id).record_failure();
    }

    /// True while the backend's circuit is blocking calls
    #[must_use]
    pub fn is_open(&self, backend_id: &str) -> bool {
        self.breakers
            .get(backend_id)
            .is_some_and(|b| b.is_open())
    }

    /// Status of one backend's breaker
    #[must_use]
    pub fn status(&self, backend_id: &str) -> CircuitStatus {
        self.get(backend_id).status()
    }

    /// Status of every known breaker for the given ids
    #[must_use]
    pub fn snapshot<'a>(&self, ids: impl IntoIterator<Item = &'a String>) -> BTreeMap<String, CircuitStatus> {
        ids.into_iter()
            .map(|id| (id.clone(), self.status(id)))
            .collect()
    }

    /// Drop state for a backend that left the registry
    pub fn remove(&self, backend_id: &str) {
        self.breakers.remove(backend_id);
    }
}
