//! Backend registry
//!
//! The registry is an immutable snapshot of every enabled backend. Reloads
//! build a complete new snapshot and swap it in under a write lock, so a
//! reader sees either the old registry or the new one, never a mix.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;

use crate::config::{BackendConfig, Config, Priority};

/// A configured backend: its id plus an immutable config snapshot
#[derive(Debug, Clone, PartialEq)]
pub struct Backend {
    /// Backend id (key in the config document)
    pub id: String,
    /// Configuration
    pub config: BackendConfig,
}

impl Backend {
    /// Create a new backend entry
    #[must_use]
    pub fn new(id: impl Into<String>, config: BackendConfig) -> Self {
        Self {
            id: id.into(),
            config,
        }
    }

    /// Display name, defaulting to the id
    #[must_use]
    pub fn display_name(&self) -> &str {
        if self.config.display_name.is_empty() {
            &self.id
        } else {
            &self.config.display_name
        }
    }

    /// Per-call timeout
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.config.timeout
    }

    /// Whether the health monitor may restart this backend on its own
    #[must_use]
    pub fn restartable(&self) -> bool {
        self.config.priority == Priority::Critical && self.config.auto_restart
    }

    /// Effective requests-per-minute limit
    #[must_use]
    pub fn rate_limit(&self, default: u32) -> u32 {
        self.config.rate_limit.unwrap_or(default)
    }

    /// Join the base URL (or fallback URL) with an endpoint path
    #[must_use]
    pub fn endpoint_url(base: &str, endpoint: &str) -> String {
        let base = base.trim_end_matches('/');
        let endpoint = endpoint.trim_start_matches('/');
        if endpoint.is_empty() {
            base.to_string()
        } else {
            format!("{base}/{endpoint}")
        }
    }
}

/// Summary row used by listing endpoints
#[derive(Debug, Clone, Serialize)]
pub struct BackendInfo {
    /// Backend id
    pub id: String,
    /// Display name
    pub display_name: String,
    /// Base URL
    pub url: String,
    /// Whether a fallback is configured
    pub has_fallback: bool,
    /// Priority class
    pub priority: Priority,
}

/// Immutable set of backends
#[derive(Debug, Default)]
pub struct RegistrySnapshot {
    backends: HashMap<String, Arc<Backend>>,
}

impl RegistrySnapshot {
    /// Build a snapshot from the enabled backends of a config
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        let backends = config
            .enabled_backends()
            .map(|(id, cfg)| (id.clone(), Arc::new(Backend::new(id.clone(), cfg.clone()))))
            .collect();
        Self { backends }
    }

    /// Look up a backend
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Arc<Backend>> {
        self.backends.get(id)
    }

    /// Iterate over all backends
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Backend>> {
        self.backends.values()
    }

    /// Sorted backend ids
    #[must_use]
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.backends.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Number of backends
    #[must_use]
    pub fn len(&self) -> usize {
        self.backends.len()
    }

    /// True when no backends are registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}

/// Live, atomically-swappable backend registry
pub struct BackendRegistry {
    inner: RwLock<Arc<RegistrySnapshot>>,
}

impl BackendRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Arc::new(RegistrySnapshot::default())),
        }
    }

    /// Create a registry seeded from a config
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            inner: RwLock::new(Arc::new(RegistrySnapshot::from_config(config))),
        }
    }

    /// Clone the current snapshot
    #[must_use]
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        Arc::clone(&self.inner.read())
    }

    /// Get a backend by id
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<Backend>> {
        self.inner.read().get(id).cloned()
    }

    /// Get all backends
    #[must_use]
    pub fn all(&self) -> Vec<Arc<Backend>> {
        self.inner.read().iter().cloned().collect()
    }

    /// Listing rows, sorted by id
    #[must_use]
    pub fn infos(&self) -> Vec<BackendInfo> {
        let snapshot = self.snapshot();
        snapshot
            .ids()
            .into_iter()
            .filter_map(|id| snapshot.get(&id).cloned())
            .map(|b| BackendInfo {
                id: b.id.clone(),
                display_name: b.display_name().to_string(),
                url: b.config.url.clone(),
                has_fallback: b.config.fallback_url.is_some(),
                priority: b.config.priority,
            })
            .collect()
    }

    /// Atomically replace the whole registry, returning the previous snapshot
    pub fn replace(&self, snapshot: RegistrySnapshot) -> Arc<RegistrySnapshot> {
        std::mem::replace(&mut *self.inner.write(), Arc::new(snapshot))
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}
