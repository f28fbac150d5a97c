//! Config hot-reload with diff patching.
//!
//! A reload parses and validates the new document, computes a diff of the
//! enabled backends against the running config and, when anything changed,
//! swaps in a complete new registry snapshot. A document that fails to parse
//! or validate leaves the running registry untouched.
//!
//! # Limitations
//!
//! Only the `backends` section is applied live. Changes to the server,
//! failsafe, pool, cache, queue or diagnostics sections are detected and
//! logged; they take effect on the next restart.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{BackendConfig, Config};
use crate::gateway::Gateway;
use crate::{Error, Result};

// ============================================================================
// Public types
// ============================================================================

/// Structural diff computed between two [`Config`] snapshots.
#[derive(Debug, Default, Clone)]
pub struct ConfigPatch {
    /// Backends enabled in `new` but not in `old`
    pub backends_added: Vec<(String, BackendConfig)>,
    /// Backends enabled in `old` but absent or disabled in `new`
    pub backends_removed: Vec<String>,
    /// Backends whose config changed between `old` and `new`
    pub backends_modified: Vec<(String, BackendConfig)>,
    /// `true` when any section outside `backends` changed (restart required)
    pub settings_changed: bool,
}

impl ConfigPatch {
    /// Returns `true` when no changes were detected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.backends_added.is_empty()
            && self.backends_removed.is_empty()
            && self.backends_modified.is_empty()
            && !self.settings_changed
    }

    /// Returns `true` when the registry must be swapped.
    #[must_use]
    pub fn touches_backends(&self) -> bool {
        !(self.backends_added.is_empty()
            && self.backends_removed.is_empty()
            && self.backends_modified.is_empty())
    }

    /// Sorted ids of every added, removed or modified backend
    #[must_use]
    pub fn changed_ids(&self) -> Vec<String> {
        self.backends_added
            .iter()
            .map(|(n, _)| n.clone())
            .chain(self.backends_removed.iter().cloned())
            .chain(self.backends_modified.iter().map(|(n, _)| n.clone()))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Human-readable summary of the patch (one clause per change type).
    #[must_use]
    pub fn summary(&self) -> String {
        let names = |v: &[(String, BackendConfig)]| {
            v.iter().map(|(n, _)| n.as_str()).collect::<Vec<_>>().join(", ")
        };

        let mut parts = Vec::new();
        if !self.backends_added.is_empty() {
            parts.push(format!("added backends: [{}]", names(&self.backends_added)));
        }
        if !self.backends_removed.is_empty() {
            parts.push(format!("removed backends: [{}]", self.backends_removed.join(", ")));
        }
        if !self.backends_modified.is_empty() {
            parts.push(format!("modified backends: [{}]", names(&self.backends_modified)));
        }
        if self.settings_changed {
            parts.push("gateway settings changed (restart required)".to_string());
        }

        if parts.is_empty() {
            "no changes".to_string()
        } else {
            parts.join("; ")
        }
    }
}

/// Live, atomically-swappable config snapshot.
///
/// Readers clone the inner `Arc`; writers swap the whole `Arc`.
pub struct LiveConfig {
    inner: RwLock<Arc<Config>>,
}

impl LiveConfig {
    /// Create a new `LiveConfig` seeded with the startup configuration.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            inner: RwLock::new(Arc::new(config)),
        }
    }

    /// Clone the current active configuration snapshot.
    #[must_use]
    pub fn get(&self) -> Arc<Config> {
        Arc::clone(&self.inner.read())
    }

    /// Atomically replace the current config.
    pub fn set(&self, config: Config) {
        *self.inner.write() = Arc::new(config);
    }
}

/// Where a reload reads the new document from
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReloadSource {
    /// YAML file; environment overrides apply
    Path(PathBuf),
    /// In-memory YAML document
    Yaml(String),
}

impl ReloadSource {
    /// Parse and validate the document.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigReload`] when the document is unusable.
    pub fn load(&self) -> Result<Config> {
        match self {
            Self::Path(path) => Config::load(Some(path)),
            Self::Yaml(yaml) => Config::from_yaml_str(yaml),
        }
        .map_err(|e| Error::ConfigReload(e.to_string()))
    }
}

/// Result of a reload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReloadOutcome {
    /// Whether the document was accepted
    pub success: bool,
    /// Added, removed and modified backend ids
    pub reloaded_backends: Vec<String>,
    /// Summary of the changes
    pub message: String,
}

// ============================================================================
// Diff computation (pure, synchronous)
// ============================================================================

/// Compute the structural diff between two config snapshots.
///
/// This is a pure function: it does not touch the registry.
#[must_use]
pub fn compute_diff(old: &Config, new: &Config) -> ConfigPatch {
    let mut patch = ConfigPatch {
        settings_changed: settings_changed(old, new),
        ..ConfigPatch::default()
    };
    classify_backends(old, new, &mut patch);
    patch
}

/// Returns `true` when any non-backend section differs.
///
/// Uses JSON serialization as a structural equality check so the nested
/// config types don't all need `PartialEq`.
fn settings_changed(old: &Config, new: &Config) -> bool {
    let sections = |c: &Config| {
        serde_json::to_string(&(
            &c.server,
            &c.failsafe,
            &c.pool,
            &c.cache,
            &c.queue,
            &c.diagnostics,
        ))
        .unwrap_or_default()
    };
    sections(old) != sections(new)
}

/// Partition backends into added / removed / modified buckets.
fn classify_backends(old: &Config, new: &Config, patch: &mut ConfigPatch) {
    let old_enabled: HashMap<&str, &BackendConfig> =
        old.enabled_backends().map(|(k, v)| (k.as_str(), v)).collect();
    let new_enabled: HashMap<&str, &BackendConfig> =
        new.enabled_backends().map(|(k, v)| (k.as_str(), v)).collect();

    for (name, cfg) in &new_enabled {
        match old_enabled.get(name) {
            None => patch.backends_added.push(((*name).to_string(), (*cfg).clone())),
            Some(old_cfg) if old_cfg != cfg => {
                patch.backends_modified.push(((*name).to_string(), (*cfg).clone()));
            }
            Some(_) => {}
        }
    }

    for name in old_enabled.keys() {
        if !new_enabled.contains_key(name) {
            patch.backends_removed.push((*name).to_string());
        }
    }

    patch.backends_added.sort_by(|a, b| a.0.cmp(&b.0));
    patch.backends_modified.sort_by(|a, b| a.0.cmp(&b.0));
    patch.backends_removed.sort();
}

// ============================================================================
// File watcher
// ============================================================================

/// File watcher that triggers a gateway reload when the config file changes.
///
/// Holds the underlying `notify` watcher alive for the lifetime of the struct.
pub struct ConfigWatcher {
    /// Kept alive to prevent the OS watcher from being dropped.
    _watcher: Mutex<Option<RecommendedWatcher>>,
}

impl ConfigWatcher {
    /// Start watching `config_path`.
    ///
    /// Spawns a debounced background task that reloads the gateway from the
    /// file after each burst of changes.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying `notify` watcher cannot be created.
    pub fn start(
        config_path: PathBuf,
        gateway: Arc<Gateway>,
        shutdown_rx: tokio::sync::broadcast::Receiver<()>,
    ) -> Result<Self> {
        let (event_tx, event_rx) = tokio::sync::mpsc::channel(32);
        let watcher = Self::create_notify_watcher(event_tx, &config_path)?;
        Self::spawn_reload_task(config_path, gateway, event_rx, shutdown_rx);
        Ok(Self {
            _watcher: Mutex::new(Some(watcher)),
        })
    }

    /// Create the low-level `notify` watcher.
    fn create_notify_watcher(
        event_tx: tokio::sync::mpsc::Sender<()>,
        config_path: &Path,
    ) -> Result<RecommendedWatcher> {
        let watch_dir = config_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."))
            .to_path_buf();
        let file_name = config_path.file_name().map(std::ffi::OsStr::to_os_string);

        let mut watcher = RecommendedWatcher::new(
            move |result: std::result::Result<Event, notify::Error>| {
                let is_relevant = result
                    .as_ref()
                    .is_ok_and(|e| is_config_event(e, file_name.as_deref()));
                if is_relevant {
                    let _ = event_tx.try_send(());
                }
            },
            NotifyConfig::default().with_poll_interval(Duration::from_secs(2)),
        )
        .map_err(|e| Error::Internal(format!("Failed to create config watcher: {e}")))?;

        watcher
            .watch(&watch_dir, RecursiveMode::NonRecursive)
            .map_err(|e| Error::Internal(format!("Failed to watch config path: {e}")))?;

        Ok(watcher)
    }

    /// Spawn the debounced reload task.
    fn spawn_reload_task(
        config_path: PathBuf,
        gateway: Arc<Gateway>,
        mut event_rx: tokio::sync::mpsc::Receiver<()>,
        mut shutdown_rx: tokio::sync::broadcast::Receiver<()>,
    ) {
        tokio::spawn(async move {
            const DEBOUNCE: Duration = Duration::from_millis(500);
            let mut last_event: Option<Instant> = None;
            let mut pending = false;
            let mut ticker = tokio::time::interval(Duration::from_millis(100));

            loop {
                tokio::select! {
                    Some(()) = event_rx.recv() => {
                        last_event = Some(Instant::now());
                        pending = true;
                    }
                    _ = ticker.tick() => {
                        if pending && last_event.is_some_and(|t| t.elapsed() >= DEBOUNCE) {
                            pending = false;
                            last_event = None;
                            match gateway.reload_config(&ReloadSource::Path(config_path.clone())) {
                                Ok(outcome) => debug!(message = %outcome.message, "Config file reload finished"),
                                Err(e) => warn!(error = %e, "Config reload: keeping current config"),
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Config watcher shutting down");
                        break;
                    }
                }
            }
        });
    }
}

/// Returns `true` for create/modify events on the watched config file.
fn is_config_event(event: &Event, file_name: Option<&std::ffi::OsStr>) -> bool {
    matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_))
        && event
            .paths
            .iter()
            .any(|p| file_name.is_some_and(|name| p.file_name() == Some(name)))
}

// ============================================================================
// Tests
// ============================================================================
