//! Diagnostics recorder
//!
//! Persists one row per call attempt (`request_log`) and one per health probe
//! (`health_history`) in SQLite. Callers never wait on the database: rows go
//! through a bounded channel to a dedicated writer thread, and rows that do
//! not fit are counted and dropped.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, SyncSender, TrySendError, sync_channel};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

use crate::config::DiagnosticsConfig;
use crate::{Error, Result};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS request_log (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp   INTEGER NOT NULL,
    backend_id  TEXT    NOT NULL,
    endpoint    TEXT    NOT NULL,
    method      TEXT    NOT NULL,
    duration_ms INTEGER NOT NULL,
    status      TEXT    NOT NULL,
    success     INTEGER NOT NULL,
    source      TEXT    NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_request_log_backend_ts ON request_log(backend_id, timestamp);
CREATE TABLE IF NOT EXISTS health_history (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp   INTEGER NOT NULL,
    backend_id  TEXT    NOT NULL,
    healthy     INTEGER NOT NULL,
    latency_ms  INTEGER,
    error       TEXT
);
CREATE INDEX IF NOT EXISTS idx_health_history_backend_ts ON health_history(backend_id, timestamp);
";

/// Where an attempt was served from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptSource {
    /// Primary URL
    Primary,
    /// Fallback URL
    Fallback,
    /// Response cache
    Cache,
}

impl AttemptSource {
    /// Column value
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Fallback => "fallback",
            Self::Cache => "cache",
        }
    }
}

/// One row of `request_log`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestMetrics {
    /// Backend id
    pub backend_id: String,
    /// Endpoint path
    pub endpoint: String,
    /// HTTP method
    pub method: String,
    /// Attempt duration
    pub duration_ms: u64,
    /// Whether the attempt succeeded
    pub success: bool,
    /// HTTP status or error label
    pub status: String,
    /// Primary, fallback or cache
    pub source: AttemptSource,
    /// When the attempt finished
    pub timestamp: DateTime<Utc>,
}

/// One row of `health_history`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthRecord {
    /// Backend id
    pub backend_id: String,
    /// Probe outcome
    pub healthy: bool,
    /// Probe latency
    pub latency_ms: Option<u64>,
    /// Failure description
    pub error: Option<String>,
    /// When the probe finished
    pub timestamp: DateTime<Utc>,
}

/// Aggregates over a time window
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticsStats {
    /// Network attempts
    pub count: u64,
    /// Mean attempt latency
    pub avg_latency_ms: f64,
    /// 95th percentile attempt latency
    pub p95_latency_ms: u64,
    /// Successful attempts / attempts, 0.0-1.0
    pub success_rate: f64,
    /// Healthy probes / probes as a percentage; `None` without probes
    pub uptime_percent: Option<f64>,
    /// Requests answered from the cache
    pub cache_hits: u64,
}

/// Write-side counters
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct RecorderCounters {
    /// Rows dropped because the buffer was full
    pub dropped: u64,
    /// Rows the writer failed to insert
    pub write_failures: u64,
}

enum Command {
    Request(RequestMetrics),
    Health(HealthRecord),
    Flush(oneshot::Sender<()>),
}

#[derive(Default)]
struct Counters {
    dropped: AtomicU64,
    write_failures: AtomicU64,
}

/// SQLite-backed recorder
pub struct DiagnosticsRecorder {
    tx: SyncSender<Command>,
    conn: Arc<Mutex<Connection>>,
    counters: Arc<Counters>,
}

impl DiagnosticsRecorder {
    /// Open (or create) the database and start the writer thread.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or migrated, or the
    /// writer thread cannot be spawned.
    pub fn open(config: &DiagnosticsConfig) -> Result<Self> {
        let conn = if config.path == ":memory:" {
            Connection::open_in_memory()?
        } else {
            let path = Path::new(&config.path);
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            let conn = Connection::open(path)?;
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
                row.get::<_, String>(0)
            })?;
            conn
        };
        conn.execute_batch(SCHEMA)?;
        debug!(path = %config.path, "Diagnostics store opened");

        let conn = Arc::new(Mutex::new(conn));
        let counters = Arc::new(Counters::default());
        let (tx, rx) = sync_channel(config.buffer_size.max(1));

        {
            let conn = Arc::clone(&conn);
            let counters = Arc::clone(&counters);
            std::thread::Builder::new()
                .name("diagnostics-writer".to_string())
                .spawn(move || writer_loop(&rx, &conn, &counters))?;
        }

        Ok(Self { tx, conn, counters })
    }

    /// Open the configured store, falling back to an in-memory one when it is
    /// unavailable. Rows then live only as long as the process.
    ///
    /// # Errors
    ///
    /// Returns an error only if the in-memory fallback cannot start either.
    pub fn open_or_in_memory(config: &DiagnosticsConfig) -> Result<Self> {
        match Self::open(config) {
            Ok(recorder) => Ok(recorder),
            Err(e) => {
                warn!(path = %config.path, error = %e, "Diagnostics store unavailable, keeping rows in memory");
                Self::open(&DiagnosticsConfig {
                    path: ":memory:".to_string(),
                    ..config.clone()
                })
            }
        }
    }

    /// Open an in-memory store
    ///
    /// # Errors
    ///
    /// See [`DiagnosticsRecorder::open`].
    pub fn in_memory() -> Result<Self> {
        Self::open(&DiagnosticsConfig {
            path: ":memory:".to_string(),
            ..DiagnosticsConfig::default()
        })
    }

    /// Queue an attempt row; never blocks
    pub fn log_request(&self, metrics: RequestMetrics) {
        self.submit(Command::Request(metrics));
    }

    /// Queue a probe row; never blocks
    pub fn log_health(&self, record: HealthRecord) {
        self.submit(Command::Health(record));
    }

    fn submit(&self, command: Command) {
        match self.tx.try_send(command) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                let dropped = self.counters.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                telemetry_metrics::counter!("gateway_diagnostics_dropped_total").increment(1);
                // Log the first drop and then every thousandth
                if dropped == 1 || dropped % 1000 == 0 {
                    warn!(dropped, "Diagnostics buffer full, dropping rows");
                }
            }
            Err(TrySendError::Disconnected(_)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                error!("Diagnostics writer is gone, dropping row");
            }
        }
    }

    /// Wait until every row queued before this call is written
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        let tx = self.tx.clone();
        let queued = tokio::task::spawn_blocking(move || tx.send(Command::Flush(done)).is_ok())
            .await
            .unwrap_or(false);
        if queued {
            let _ = wait.await;
        }
    }

    /// Write-side counters
    #[must_use]
    pub fn counters(&self) -> RecorderCounters {
        RecorderCounters {
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            write_failures: self.counters.write_failures.load(Ordering::Relaxed),
        }
    }

    /// Aggregate statistics for one backend (or all when `backend_id` is
    /// `None`) over the trailing `window`.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn stats(&self, backend_id: Option<&str>, window: Duration) -> Result<DiagnosticsStats> {
        let conn = Arc::clone(&self.conn);
        let backend_id = backend_id.map(str::to_string);
        let cutoff = cutoff_ms(window);

        tokio::task::spawn_blocking(move || query_stats(&conn.lock(), backend_id.as_deref(), cutoff))
            .await
            .map_err(|e| Error::Diagnostics(e.to_string()))?
    }

    /// Delete rows older than `retention`; returns the number removed
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub async fn prune(&self, retention: Duration) -> Result<usize> {
        let conn = Arc::clone(&self.conn);
        let cutoff = cutoff_ms(retention);

        tokio::task::spawn_blocking(move || -> Result<usize> {
            let conn = conn.lock();
            let requests = conn.execute("DELETE FROM request_log WHERE timestamp < ?1", params![cutoff])?;
            let probes = conn.execute("DELETE FROM health_history WHERE timestamp < ?1", params![cutoff])?;
            Ok(requests + probes)
        })
        .await
        .map_err(|e| Error::Diagnostics(e.to_string()))?
    }
}

fn cutoff_ms(window: Duration) -> i64 {
    let window = chrono::Duration::from_std(window).unwrap_or(chrono::Duration::MAX);
    Utc::now()
        .checked_sub_signed(window)
        .map_or(0, |t| t.timestamp_millis())
}

fn writer_loop(rx: &Receiver<Command>, conn: &Mutex<Connection>, counters: &Counters) {
    while let Ok(command) = rx.recv() {
        let result = match command {
            Command::Request(m) => conn.lock().execute(
                "INSERT INTO request_log (timestamp, backend_id, endpoint, method, duration_ms, status, success, source)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    m.timestamp.timestamp_millis(),
                    m.backend_id,
                    m.endpoint,
                    m.method,
                    i64::try_from(m.duration_ms).unwrap_or(i64::MAX),
                    m.status,
                    m.success,
                    m.source.as_str(),
                ],
            ),
            Command::Health(h) => conn.lock().execute(
                "INSERT INTO health_history (timestamp, backend_id, healthy, latency_ms, error)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    h.timestamp.timestamp_millis(),
                    h.backend_id,
                    h.healthy,
                    h.latency_ms.map(|l| i64::try_from(l).unwrap_or(i64::MAX)),
                    h.error,
                ],
            ),
            Command::Flush(done) => {
                let _ = done.send(());
                continue;
            }
        };

        if let Err(e) = result {
            counters.write_failures.fetch_add(1, Ordering::Relaxed);
            telemetry_metrics::counter!("gateway_diagnostics_write_failures_total").increment(1);
            warn!(error = %e, "Failed to write diagnostics row");
        }
    }
    debug!("Diagnostics writer stopped");
}

#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn query_stats(conn: &Connection, backend_id: Option<&str>, cutoff: i64) -> Result<DiagnosticsStats> {
    let (count, avg, successes): (i64, Option<f64>, i64) = conn.query_row(
        "SELECT COUNT(*), AVG(duration_ms), COALESCE(SUM(success), 0)
         FROM request_log
         WHERE timestamp >= ?1 AND source != 'cache' AND (?2 IS NULL OR backend_id = ?2)",
        params![cutoff, backend_id],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
    )?;

    let p95 = if count > 0 {
        let offset = ((count as f64) * 0.95).ceil() as i64 - 1;
        conn.query_row(
            "SELECT duration_ms FROM request_log
             WHERE timestamp >= ?1 AND source != 'cache' AND (?2 IS NULL OR backend_id = ?2)
             ORDER BY duration_ms ASC LIMIT 1 OFFSET ?3",
            params![cutoff, backend_id, offset.max(0)],
            |row| row.get::<_, i64>(0),
        )
        .optional()?
        .unwrap_or(0)
    } else {
        0
    };

    let cache_hits: i64 = conn.query_row(
        "SELECT COUNT(*) FROM request_log
         WHERE timestamp >= ?1 AND source = 'cache' AND (?2 IS NULL OR backend_id = ?2)",
        params![cutoff, backend_id],
        |row| row.get(0),
    )?;

    let (probes, healthy): (i64, i64) = conn.query_row(
        "SELECT COUNT(*), COALESCE(SUM(healthy), 0) FROM health_history
         WHERE timestamp >= ?1 AND (?2 IS NULL OR backend_id = ?2)",
        params![cutoff, backend_id],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;

    Ok(DiagnosticsStats {
        count: count as u64,
        avg_latency_ms: avg.unwrap_or(0.0),
        p95_latency_ms: p95.max(0) as u64,
        success_rate: if count == 0 { 0.0 } else { successes as f64 / count as f64 },
        uptime_percent: (probes > 0).then(|| healthy as f64 * 100.0 / probes as f64),
        cache_hits: cache_hits as u64,
    })
}
