//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Resilient multi-backend gateway
#[derive(Parser, Debug)]
#[command(name = "resilient-gateway")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "RESILIENT_GATEWAY_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "RESILIENT_GATEWAY_PORT")]
    pub port: Option<u16>,

    /// Host to bind to
    #[arg(long, env = "RESILIENT_GATEWAY_HOST")]
    pub host: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "RESILIENT_GATEWAY_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "RESILIENT_GATEWAY_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Disable config file watching
    #[arg(long)]
    pub no_watch: bool,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the gateway server (default)
    Serve,

    /// Probe backends once and print the results
    Check {
        /// Backend id (all backends when omitted)
        backend: Option<String>,

        /// Restart critical backends found offline
        #[arg(long)]
        restart: bool,
    },

    /// Print persisted diagnostics
    Stats {
        /// Backend id (all backends when omitted)
        backend: Option<String>,

        /// Trailing window in hours
        #[arg(long, default_value_t = 24)]
        window_hours: u32,
    },

    /// Validate a configuration file and list its backends
    Validate,
}
