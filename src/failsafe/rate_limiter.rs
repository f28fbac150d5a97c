//! Sliding-window rate limiting
//!
//! Every backend keeps a deque of admission timestamps. Before each check the
//! timestamps older than the window are pruned; the request is admitted when
//! fewer than `limit` remain.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::config::RateLimitConfig;

/// Sliding window for a single backend
#[derive(Debug)]
struct Window {
    admitted: VecDeque<Instant>,
}

impl Window {
    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(&oldest) = self.admitted.front() {
            if now.duration_since(oldest) >= window {
                self.admitted.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Per-backend sliding-window rate limiter
pub struct RateLimiter {
    enabled: bool,
    window: Duration,
    default_limit: u32,
    windows: DashMap<String, Arc<Mutex<Window>>>,
}

impl RateLimiter {
    /// Create a new rate limiter
    #[must_use]
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            enabled: config.enabled,
            window: config.window,
            default_limit: config.requests_per_minute,
            windows: DashMap::new(),
        }
    }

    /// Limit used when a backend configures none
    #[must_use]
    pub fn default_limit(&self) -> u32 {
        self.default_limit
    }

    /// Try to admit one request for `backend_id` under `limit` requests per window.
    ///
    /// Returns `false` without touching any other state when the window is full.
    pub fn allow(&self, backend_id: &str, limit: u32) -> bool {
        self.allow_at(backend_id, limit, Instant::now())
    }

    fn allow_at(&self, backend_id: &str, limit: u32, now: Instant) -> bool {
        if !self.enabled {
            return true;
        }

        let window = self.window_for(backend_id);
        let mut window = window.lock();
        window.prune(now, self.window);

        if window.admitted.len() < limit as usize {
            window.admitted.push_back(now);
            true
        } else {
            tracing::debug!(backend = backend_id, limit, "Rate limit window full");
            false
        }
    }

    /// How long until `backend_id` would be admitted under `limit`; zero when
    /// a request would pass now. Admits nothing.
    #[must_use]
    pub fn time_until_allowed(&self, backend_id: &str, limit: u32) -> Duration {
        self.time_until_allowed_at(backend_id, limit, Instant::now())
    }

    fn time_until_allowed_at(&self, backend_id: &str, limit: u32, now: Instant) -> Duration {
        if !self.enabled {
            return Duration::ZERO;
        }
        let Some(window) = self.windows.get(backend_id).map(|w| Arc::clone(w.value())) else {
            return Duration::ZERO;
        };
        let mut window = window.lock();
        window.prune(now, self.window);

        let len = window.admitted.len();
        let limit = limit as usize;
        if len < limit {
            return Duration::ZERO;
        }
        // The oldest `len - limit + 1` timestamps have to leave the window
        window
            .admitted
            .get(len - limit)
            .map_or(self.window, |&stamp| (stamp + self.window).saturating_duration_since(now))
    }

    /// Requests currently counted in the backend's window
    #[must_use]
    pub fn in_window(&self, backend_id: &str) -> usize {
        self.windows.get(backend_id).map_or(0, |w| {
            let mut w = w.lock();
            w.prune(Instant::now(), self.window);
            w.admitted.len()
        })
    }

    /// Drop state for a backend that left the registry
    pub fn remove(&self, backend_id: &str) {
        self.windows.remove(backend_id);
    }

    fn window_for(&self, backend_id: &str) -> Arc<Mutex<Window>> {
        if let Some(w) = self.windows.get(backend_id) {
            return Arc::clone(&w);
        }
        Arc::clone(
            &self
                .windows
                .entry(backend_id.to_string())
                .or_insert_with(|| {
                    Arc::new(Mutex::new(Window {
                        admitted: VecDeque::new(),
                    }))
                }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter() -> RateLimiter {
        RateLimiter::new(&RateLimitConfig::default())
    }

    #[test]
    fn test_limit_then_reject() {
        let rl = limiter();
        let start = Instant::now();

        for i in 0..100 {
            assert!(rl.allow_at("b", 100, start + Duration::from_millis(i)));
        }
        assert!(!rl.allow_at("b", 100, start + Duration::from_secs(30)));
    }

    #[test]
    fn test_window_slides() {
        let rl = limiter();
        let start = Instant::now();

        for _ in 0..5 {
            assert!(rl.allow_at("b", 5, start));
        }
        assert!(!rl.allow_at("b", 5, start + Duration::from_secs(59)));
        // 60s after the first request the whole burst falls out of the window
        assert!(rl.allow_at("b", 5, start + Duration::from_secs(60)));
    }

    #[test]
    fn test_partial_slide() {
        let rl = limiter();
        let start = Instant::now();

        assert!(rl.allow_at("b", 2, start));
        assert!(rl.allow_at("b", 2, start + Duration::from_secs(30)));
        assert!(!rl.allow_at("b", 2, start + Duration::from_secs(45)));
        // First timestamp expires, second still counts
        assert!(rl.allow_at("b", 2, start + Duration::from_secs(61)));
        assert!(!rl.allow_at("b", 2, start + Duration::from_secs(62)));
    }

    #[test]
    fn test_rejection_does_not_consume_capacity() {
        let rl = limiter();
        let start = Instant::now();
        assert!(rl.allow_at("b", 1, start));
        for s in 1..10 {
            assert!(!rl.allow_at("b", 1, start + Duration::from_secs(s)));
        }
        assert!(rl.allow_at("b", 1, start + Duration::from_secs(60)));
    }

    #[test]
    fn test_backends_are_independent() {
        let rl = limiter();
        let now = Instant::now();
        assert!(rl.allow_at("a", 1, now));
        assert!(!rl.allow_at("a", 1, now));
        assert!(rl.allow_at("b", 1, now));
    }

    #[test]
    fn test_disabled_always_allows() {
        let rl = RateLimiter::new(&RateLimitConfig {
            enabled: false,
            ..RateLimitConfig::default()
        });
        for _ in 0..1000 {
            assert!(rl.allow("b", 1));
        }
    }

    #[test]
    fn test_time_until_allowed_does_not_admit() {
        let rl = limiter();
        let start = Instant::now();
        assert_eq!(rl.time_until_allowed_at("b", 2, start), Duration::ZERO);

        assert!(rl.allow_at("b", 2, start));
        assert!(rl.allow_at("b", 2, start + Duration::from_secs(10)));
        assert_eq!(
            rl.time_until_allowed_at("b", 2, start + Duration::from_secs(20)),
            Duration::from_secs(40)
        );
        // Asking twice changes nothing
        assert_eq!(
            rl.time_until_allowed_at("b", 2, start + Duration::from_secs(20)),
            Duration::from_secs(40)
        );
        assert_eq!(rl.time_until_allowed_at("b", 2, start + Duration::from_secs(60)), Duration::ZERO);
        assert!(rl.allow_at("b", 2, start + Duration::from_secs(60)));
    }

    #[test]
    fn test_in_window_and_remove() {
        let rl = limiter();
        rl.allow("b", 10);
        rl.allow("b", 10);
        assert_eq!(rl.in_window("b"), 2);
        rl.remove("b");
        assert_eq!(rl.in_window("b"), 0);
    }
}
