//! Failsafe mechanisms: circuit breaker, retry, rate limiting, health tracking

mod circuit_breaker;
mod health;
mod rate_limiter;
mod retry;

pub use circuit_breaker::{Admission, CircuitBreaker, CircuitBreakers, CircuitPhase, CircuitStatus};
pub use health::{HealthState, HealthStatus, HealthTracker, HealthTrackers};
pub use rate_limiter::RateLimiter;
pub use retry::{RetryPolicy, with_retry};

use crate::config::FailsafeConfig;

/// Per-backend failsafe state shared by the executor and the health monitor
pub struct Failsafe {
    /// Circuit breakers
    pub circuit_breakers: CircuitBreakers,
    /// Sliding-window rate limiter
    pub rate_limiter: RateLimiter,
    /// Health trackers
    pub health: HealthTrackers,
    /// Retry policy
    pub retry_policy: RetryPolicy,
}

impl Failsafe {
    /// Create a new failsafe from configuration
    #[must_use]
    pub fn new(config: &FailsafeConfig) -> Self {
        Self {
            circuit_breakers: CircuitBreakers::new(config.circuit_breaker.clone()),
            rate_limiter: RateLimiter::new(&config.rate_limit),
            health: HealthTrackers::new(config.health_check.offline_threshold),
            retry_policy: RetryPolicy::new(&config.retry),
        }
    }

    /// Record the outcome of a logical call
    pub fn record_call(&self, backend_id: &str, success: bool, latency: std::time::Duration) {
        if success {
            self.circuit_breakers.record_success(backend_id);
            self.health.get(backend_id).record_success(latency);
        } else {
            self.circuit_breakers.record_failure(backend_id);
            self.health.get(backend_id).record_failure(Some(latency));
        }
    }

    /// Forget every trace of a backend
    pub fn forget(&self, backend_id: &str) {
        self.circuit_breakers.remove(backend_id);
        self.rate_limiter.remove(backend_id);
        self.health.remove(backend_id);
    }
}
