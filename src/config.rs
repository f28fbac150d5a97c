//! Configuration management

use std::{collections::HashMap, env, path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{Error, Result};

/// Prefix for environment overrides, e.g. `RESILIENT_GATEWAY_SERVER__PORT=8080`
pub const ENV_PREFIX: &str = "RESILIENT_GATEWAY_";

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before processing config.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    pub env_files: Vec<String>,
    /// Admin API server configuration
    pub server: ServerConfig,
    /// Failsafe configuration
    pub failsafe: FailsafeConfig,
    /// Connection pool configuration
    pub pool: PoolConfig,
    /// Response cache configuration
    pub cache: CacheConfig,
    /// Request queue configuration
    pub queue: QueueConfig,
    /// Diagnostics persistence configuration
    pub diagnostics: DiagnosticsConfig,
    /// Backend configurations keyed by backend id
    pub backends: HashMap<String, BackendConfig>,
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist, cannot be parsed,
    /// or fails validation.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        Self::finish(figment)
    }

    /// Parse configuration from an in-memory YAML document.
    ///
    /// Environment overrides are not applied, so the result depends only on
    /// the document.
    ///
    /// # Errors
    ///
    /// Returns an error if the document cannot be parsed or fails validation.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        Self::finish(Figment::new().merge(Yaml::string(yaml)))
    }

    fn finish(figment: Figment) -> Result<Self> {
        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.load_env_files();
        config.expand_env_vars();
        config.validate()?;

        Ok(config)
    }

    /// Load environment files into the process environment.
    /// Files that don't exist are silently skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = expand_home(path_str);
            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => tracing::info!("Loaded env file: {expanded}"),
                    Err(e) => tracing::warn!("Failed to load env file {expanded}: {e}"),
                }
            } else {
                tracing::debug!("Env file not found (skipped): {expanded}");
            }
        }
    }

    /// Expand `${VAR}` and `${VAR:-default}` in URLs and headers
    fn expand_env_vars(&mut self) {
        let Ok(re) = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}") else {
            return;
        };

        for backend in self.backends.values_mut() {
            backend.url = expand_string(&re, &backend.url);
            if let Some(fallback) = backend.fallback_url.as_mut() {
                *fallback = expand_string(&re, fallback);
            }
            for value in backend.headers.values_mut() {
                *value = expand_string(&re, value);
            }
        }

        self.diagnostics.path = expand_home(&expand_string(&re, &self.diagnostics.path));
    }

    /// Reject documents that cannot produce a usable registry.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] naming the first offending backend.
    pub fn validate(&self) -> Result<()> {
        for (id, backend) in &self.backends {
            if id.trim().is_empty() {
                return Err(Error::Config("backend id must not be empty".to_string()));
            }
            Url::parse(&backend.url)
                .map_err(|e| Error::Config(format!("backend '{id}': invalid url: {e}")))?;
            if let Some(fallback) = &backend.fallback_url {
                Url::parse(fallback).map_err(|e| {
                    Error::Config(format!("backend '{id}': invalid fallback_url: {e}"))
                })?;
            }
            if backend.timeout.is_zero() {
                return Err(Error::Config(format!("backend '{id}': timeout must be > 0")));
            }
            if backend.requires_auth && backend.credential.is_none() {
                return Err(Error::Config(format!(
                    "backend '{id}': requires_auth is set but no credential reference given"
                )));
            }
        }
        if self.pool.max_connections == 0 || self.pool.max_per_backend == 0 {
            return Err(Error::Config("pool limits must be > 0".to_string()));
        }
        if self.cache.max_entries == 0 {
            return Err(Error::Config("cache.max_entries must be > 0".to_string()));
        }
        Ok(())
    }

    /// Get enabled backends only
    pub fn enabled_backends(&self) -> impl Iterator<Item = (&String, &BackendConfig)> {
        self.backends.iter().filter(|(_, b)| b.enabled)
    }
}

/// Expand a leading `~` to the home directory
fn expand_home(path: &str) -> String {
    if path.starts_with('~') {
        if let Some(home) = dirs::home_dir() {
            return path.replacen('~', &home.display().to_string(), 1);
        }
    }
    path.to_string()
}

/// Expand environment variables in a string
fn expand_string(re: &Regex, value: &str) -> String {
    re.replace_all(value, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map_or("", |m| m.as_str());
        env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .into_owned()
}

/// Admin API server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Request timeout for admin endpoints
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Reload backends when the config file changes on disk
    pub watch_config: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 39500,
            request_timeout: Duration::from_secs(120),
            watch_config: true,
        }
    }
}

/// Failsafe configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct FailsafeConfig {
    /// Circuit breaker configuration
    pub circuit_breaker: CircuitBreakerConfig,
    /// Retry configuration
    pub retry: RetryConfig,
    /// Rate limiting configuration
    pub rate_limit: RateLimitConfig,
    /// Health check configuration
    pub health_check: HealthCheckConfig,
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Enable circuit breaker
    pub enabled: bool,
    /// Consecutive failures before opening
    pub failure_threshold: u32,
    /// Time the circuit stays open before a trial call is admitted
    #[serde(with = "humantime_serde")]
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: 5,
            cooldown: Duration::from_secs(60),
        }
    }
}

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Enable retries
    pub enabled: bool,
    /// Total attempts per logical call (first try included)
    pub max_attempts: u32,
    /// Delay before the second attempt
    #[serde(with = "humantime_serde")]
    pub initial_backoff: Duration,
    /// Upper bound for a single delay
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,
    /// Backoff multiplier
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

/// Rate limiting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Enable rate limiting
    pub enabled: bool,
    /// Default requests per window when a backend sets none
    pub requests_per_minute: u32,
    /// Sliding window length
    #[serde(with = "humantime_serde")]
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            requests_per_minute: 100,
            window: Duration::from_secs(60),
        }
    }
}

/// Health check configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    /// Enable the background health monitor
    pub enabled: bool,
    /// Interval between background sweeps
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Per-probe timeout ceiling (the backend timeout applies if lower)
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Hard ceiling for a whole `check_all` sweep
    #[serde(with = "humantime_serde")]
    pub batch_timeout: Duration,
    /// Consecutive failed probes before a backend is OFFLINE
    pub offline_threshold: u32,
    /// Wait between launching a backend and re-probing it
    #[serde(with = "humantime_serde")]
    pub restart_grace: Duration,
    /// Let the background monitor restart critical backends
    pub auto_restart: bool,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(5),
            batch_timeout: Duration::from_secs(10),
            offline_threshold: 3,
            restart_grace: Duration::from_secs(5),
            auto_restart: true,
        }
    }
}

/// How a caller waits on an exhausted per-backend pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AcquireMode {
    /// Wait for a slot, bounded by the backend timeout
    #[default]
    Wait,
    /// Fail immediately with `PoolExhausted`
    FailFast,
}

/// Connection pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Connections across all backends
    pub max_connections: usize,
    /// Connections per backend
    pub max_per_backend: usize,
    /// Idle keep-alive before a pooled connection is closed
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,
    /// Default acquisition behaviour
    pub acquire: AcquireMode,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 100,
            max_per_backend: 10,
            idle_timeout: Duration::from_secs(90),
            acquire: AcquireMode::Wait,
        }
    }
}

/// Cache configuration for response caching
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Enable response caching
    pub enabled: bool,
    /// Default TTL for cached responses
    #[serde(with = "humantime_serde")]
    pub default_ttl: Duration,
    /// Maximum number of entries before LRU eviction
    pub max_entries: usize,
    /// Interval of the background expiry sweep
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_ttl: Duration::from_secs(30),
            max_entries: 1000,
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Request queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Enable the background drain worker
    pub enabled: bool,
    /// Maximum queued requests
    pub capacity: usize,
    /// Longest a queued request waits out backpressure before it is dropped
    #[serde(with = "humantime_serde")]
    pub max_wait: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: 1000,
            max_wait: Duration::from_secs(300),
        }
    }
}

/// Diagnostics persistence configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiagnosticsConfig {
    /// SQLite database path, or `:memory:`
    pub path: String,
    /// Pending rows buffered before new rows are dropped
    pub buffer_size: usize,
    /// Rows older than this are pruned
    #[serde(with = "humantime_serde")]
    pub retention: Duration,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            path: "~/.resilient-gateway/diagnostics.db".to_string(),
            buffer_size: 10_000,
            retention: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

/// Backend priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Gateway is useless without it; eligible for auto-restart
    Critical,
    /// Important
    High,
    /// Default
    #[default]
    Medium,
    /// Best effort
    Low,
}

/// Backend configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Human-readable name
    pub display_name: String,
    /// Whether backend is enabled
    pub enabled: bool,
    /// Base URL
    pub url: String,
    /// Secondary URL tried once when the primary is exhausted
    pub fallback_url: Option<String>,
    /// Request timeout for this backend
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Priority class
    pub priority: Priority,
    /// Send a bearer credential on every call
    pub requires_auth: bool,
    /// Credential reference (`env:VAR` or literal), resolved per call
    pub credential: Option<String>,
    /// Requests per minute; falls back to the global default when absent
    pub rate_limit: Option<u32>,
    /// Restart through the launcher when this critical backend goes offline
    pub auto_restart: bool,
    /// Probe path
    pub health_path: String,
    /// Extra HTTP headers
    pub headers: HashMap<String, String>,
    /// Command used by the bundled command launcher
    pub launch_command: Option<String>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            display_name: String::new(),
            enabled: true,
            url: String::new(),
            fallback_url: None,
            timeout: Duration::from_secs(30),
            priority: Priority::Medium,
            requires_auth: false,
            credential: None,
            rate_limit: None,
            auto_restart: false,
            health_path: "/health".to_string(),
            headers: HashMap::new(),
            launch_command: None,
        }
    }
}

impl BackendConfig {
    /// Convenience constructor used by tests and programmatic setups
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }
}

/// Custom humantime serde module for Duration
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to human-readable string (e.g., "30s", "250ms")
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    /// Deserialize human-readable duration string (e.g., "30s", "5m", "100ms", "1h", "7d")
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(serde::de::Error::custom)
    }

    /// Parse a duration string
    ///
    /// # Errors
    ///
    /// Returns the offending input when it is not `<n>`, `<n>ms`, `<n>s`,
    /// `<n>m`, `<n>h` or `<n>d`.
    pub fn parse(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        let num = |v: &str| v.trim().parse::<u64>().map_err(|e| format!("{s}: {e}"));

        if let Some(ms) = s.strip_suffix("ms") {
            num(ms).map(Duration::from_millis)
        } else if let Some(secs) = s.strip_suffix('s') {
            num(secs).map(Duration::from_secs)
        } else if let Some(mins) = s.strip_suffix('m') {
            num(mins).map(|m| Duration::from_secs(m * 60))
        } else if let Some(hours) = s.strip_suffix('h') {
            num(hours).map(|h| Duration::from_secs(h * 3600))
        } else if let Some(days) = s.strip_suffix('d') {
            num(days).map(|d| Duration::from_secs(d * 86_400))
        } else {
            // Assume seconds
            num(s).map(Duration::from_secs)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const SAMPLE: &str = r"
failsafe:
  circuit_breaker:
    failure_threshold: 3
    cooldown: 250ms
pool:
  max_per_backend: 4
  acquire: fail_fast
backends:
  memory:
    display_name: Memory Service
    url: http://127.0.0.1:9001
    fallback_url: http://127.0.0.1:9101
    timeout: 2s
    priority: critical
    rate_limit: 20
    auto_restart: true
  search:
    url: http://127.0.0.1:9002
";

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.failsafe.circuit_breaker.failure_threshold, 5);
        assert_eq!(config.failsafe.circuit_breaker.cooldown, Duration::from_secs(60));
        assert_eq!(config.failsafe.retry.max_attempts, 3);
        assert_eq!(config.failsafe.rate_limit.requests_per_minute, 100);
        assert_eq!(config.pool.max_connections, 100);
        assert_eq!(config.pool.max_per_backend, 10);
        assert_eq!(config.cache.max_entries, 1000);
        assert_eq!(config.cache.default_ttl, Duration::from_secs(30));
        assert_eq!(config.queue.capacity, 1000);
    }

    #[test]
    fn test_from_yaml_str() {
        let config = Config::from_yaml_str(SAMPLE).unwrap();

        assert_eq!(config.backends.len(), 2);
        let memory = &config.backends["memory"];
        assert_eq!(memory.display_name, "Memory Service");
        assert_eq!(memory.priority, Priority::Critical);
        assert_eq!(memory.timeout, Duration::from_secs(2));
        assert_eq!(memory.rate_limit, Some(20));
        assert!(memory.auto_restart);
        assert_eq!(memory.health_path, "/health");

        let search = &config.backends["search"];
        assert_eq!(search.priority, Priority::Medium);
        assert!(search.fallback_url.is_none());

        assert_eq!(config.failsafe.circuit_breaker.cooldown, Duration::from_millis(250));
        assert_eq!(config.pool.acquire, AcquireMode::FailFast);
        assert_eq!(config.pool.max_per_backend, 4);
    }

    #[test]
    fn test_invalid_url_rejected() {
        let yaml = "backends:\n  broken:\n    url: not a url\n";
        let err = Config::from_yaml_str(yaml).unwrap_err();
        assert!(err.to_string().contains("broken"));
    }

    #[test]
    fn test_auth_without_credential_rejected() {
        let yaml = "backends:\n  secret:\n    url: http://localhost:1\n    requires_auth: true\n";
        assert!(Config::from_yaml_str(yaml).is_err());
    }

    #[test]
    fn test_env_expansion() {
        let yaml = "backends:\n  a:\n    url: http://${RG_TEST_MISSING_HOST:-localhost}:7000\n    headers:\n      x-path: ${PATH}\n";
        let config = Config::from_yaml_str(yaml).unwrap();
        assert_eq!(config.backends["a"].url, "http://localhost:7000");
        assert_eq!(
            config.backends["a"].headers["x-path"],
            env::var("PATH").unwrap_or_default()
        );
    }

    #[test]
    fn test_enabled_backends_filter() {
        let yaml = "backends:\n  a:\n    url: http://localhost:1\n  b:\n    url: http://localhost:2\n    enabled: false\n";
        let config = Config::from_yaml_str(yaml).unwrap();
        let enabled: Vec<_> = config.enabled_backends().map(|(id, _)| id.clone()).collect();
        assert_eq!(enabled, vec!["a".to_string()]);
    }

    #[test]
    fn test_humantime_parse() {
        assert_eq!(humantime_serde::parse("100ms").unwrap(), Duration::from_millis(100));
        assert_eq!(humantime_serde::parse("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(humantime_serde::parse("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(humantime_serde::parse("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(humantime_serde::parse("7d").unwrap(), Duration::from_secs(604_800));
        assert_eq!(humantime_serde::parse("12").unwrap(), Duration::from_secs(12));
        assert!(humantime_serde::parse("soon").is_err());
    }

    #[test]
    fn test_load_env_files_sets_env_vars() {
        let dir = tempfile::tempdir().unwrap();
        let env_path = dir.path().join("test.env");
        std::fs::write(&env_path, "RG_TEST_ENV_FILE_VAR=loaded\n").unwrap();

        let config = Config {
            env_files: vec![env_path.to_string_lossy().to_string()],
            ..Config::default()
        };
        config.load_env_files();

        assert_eq!(env::var("RG_TEST_ENV_FILE_VAR").unwrap(), "loaded");
    }

    #[test]
    fn test_load_missing_file_errors() {
        let err = Config::load(Some(Path::new("/nonexistent/gateway.yaml"))).unwrap_err();
        assert!(err.to_string().contains("Config file not found"));
    }
}
