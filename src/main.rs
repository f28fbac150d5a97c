//! Resilient gateway - fronts HTTP backends with circuit breaking, retries,
//! pooling, caching, rate limiting and health monitoring.

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};

use resilient_gateway::{
    cli::{Cli, Command},
    config::Config,
    gateway::{Gateway, GatewayServer},
    monitor::{CommandLauncher, LogNotifier},
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    match cli.command {
        Some(Command::Serve) | None => run_server(cli).await,
        Some(Command::Check { backend, restart }) => {
            exit_code(run_check(cli.config.as_deref(), backend.as_deref(), restart).await)
        }
        Some(Command::Stats { backend, window_hours }) => {
            exit_code(run_stats(cli.config.as_deref(), backend.as_deref(), window_hours).await)
        }
        Some(Command::Validate) => exit_code(run_validate(cli.config.as_deref())),
    }
}

fn exit_code(outcome: anyhow::Result<()>) -> ExitCode {
    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn build_gateway(config_path: Option<&Path>) -> anyhow::Result<Gateway> {
    let config = Config::load(config_path).context("loading configuration")?;
    Gateway::builder(config)
        .launcher(Arc::new(CommandLauncher))
        .notifier(Arc::new(LogNotifier))
        .build()
        .context("creating gateway")
}

/// Probe backends once
async fn run_check(config_path: Option<&Path>, backend: Option<&str>, restart: bool) -> anyhow::Result<()> {
    let gateway = build_gateway(config_path)?;
    let results = gateway.health_check(backend, restart).await?;
    gateway.flush_diagnostics().await;

    println!("{}", serde_json::to_string_pretty(&results)?);
    if results.values().all(|r| r.is_healthy()) {
        Ok(())
    } else {
        anyhow::bail!("one or more backends are unhealthy")
    }
}

/// Print persisted diagnostics
async fn run_stats(config_path: Option<&Path>, backend: Option<&str>, window_hours: u32) -> anyhow::Result<()> {
    let gateway = build_gateway(config_path)?;
    let report = gateway
        .diagnostics(backend, window_hours)
        .await
        .context("reading diagnostics")?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// Validate configuration
fn run_validate(config_path: Option<&Path>) -> anyhow::Result<()> {
    let config = Config::load(config_path).context("loading configuration")?;
    println!("Configuration OK ({} backends)", config.backends.len());

    let mut ids: Vec<_> = config.backends.keys().collect();
    ids.sort();
    for id in ids {
        let backend = &config.backends[id];
        println!(
            "  {id}: {} [{:?}{}{}]",
            backend.url,
            backend.priority,
            if backend.fallback_url.is_some() { ", fallback" } else { "" },
            if backend.enabled { "" } else { ", disabled" },
        );
    }
    Ok(())
}

/// Run the admin server
async fn run_server(cli: Cli) -> ExitCode {
    let config = match Config::load(cli.config.as_deref()) {
        Ok(mut config) => {
            if let Some(port) = cli.port {
                config.server.port = port;
            }
            if let Some(ref host) = cli.host {
                config.server.host = host.clone();
            }
            if cli.no_watch {
                config.server.watch_config = false;
            }
            config
        }
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.server.port,
        backends = config.backends.len(),
        "Starting resilient gateway"
    );

    let gateway = match Gateway::builder(config)
        .launcher(Arc::new(CommandLauncher))
        .notifier(Arc::new(LogNotifier))
        .build()
    {
        Ok(g) => Arc::new(g),
        Err(e) => {
            error!("Failed to create gateway: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = GatewayServer::new(gateway, cli.config).run().await {
        error!("Gateway error: {e}");
        return ExitCode::FAILURE;
    }

    info!("Gateway shutdown complete");
    ExitCode::SUCCESS
}
