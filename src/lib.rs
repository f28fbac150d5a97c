//! Resilient Gateway Library
//!
//! Fronts a set of HTTP backends and makes every call fail-safe.
//!
//! # Features
//!
//! - **Circuit breakers**: per-backend closed/open/half-open with a single trial call
//! - **Retries and fallback**: exponential backoff on transient failures, then one fallback URL
//! - **Connection pool**: global and per-backend slot limits over reused HTTP clients
//! - **Response cache**: TTL + LRU, keyed on backend, endpoint, method and payload
//! - **Rate limiting**: sliding one-minute window per backend
//! - **Health monitoring**: parallel probes, offline detection, auto-restart of critical backends
//! - **Diagnostics**: request and health history persisted to SQLite
//! - **Hot reload**: backend registry swapped atomically from a watched YAML file

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod backend;
pub mod cache;
pub mod cli;
pub mod config;
pub mod config_reload;
pub mod credentials;
pub mod diagnostics;
pub mod error;
pub mod executor;
pub mod failsafe;
pub mod gateway;
pub mod monitor;
pub mod pool;
pub mod queue;
pub mod transport;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
///
/// # Errors
///
/// Returns an error if a global subscriber is already installed.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    let installed = match format {
        Some("json") => subscriber.with(fmt::layer().json()).try_init(),
        _ => subscriber.with(fmt::layer()).try_init(),
    };

    installed.map_err(|e| Error::Internal(format!("tracing already initialized: {e}")))
}
