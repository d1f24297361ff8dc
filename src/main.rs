//! llamactl - control plane for local LLM inference servers
//!
//! Manages a fleet of inference-server child processes behind a single
//! OpenAI-compatible endpoint, starting them on demand and enforcing a
//! global cap on concurrently running instances.

use anyhow::{Context, Result};
use clap::Parser;
use llamactl::Config;
use std::path::PathBuf;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Grace period for stopping instances at shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(name = "llamactl")]
#[command(about = "Control plane for local LLM inference servers")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "llamactl.json")]
    config: PathBuf,

    /// Port to listen on (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Child process output goes to per-instance log files, not tracing;
    // RUST_LOG only affects the control plane itself.
    let filter = if args.verbose {
        EnvFilter::new("llamactl=debug,tower_http=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    info!("Starting llamactl");

    let mut config = if args.config.exists() {
        Config::from_file(&args.config)
            .await
            .with_context(|| format!("Failed to load config from {}", args.config.display()))?
    } else {
        info!(
            path = %args.config.display(),
            "Config file not found, using defaults"
        );
        Config::default()
    };

    if let Some(port) = args.port {
        config.port = port;
    }

    config.validate();

    info!(
        port = config.port,
        max_running = config.instances.max_running_instances,
        on_demand_start = config.instances.on_demand_start,
        state_dir = %config.instances.state_dir.display(),
        log_dir = %config.instances.log_dir.display(),
        "Configuration loaded"
    );

    // Spawn metrics server if enabled
    if config.metrics_port > 0
        && let Some(handle) = llamactl::telemetry::install()
    {
        let metrics_addr = format!("{}:{}", config.host, config.metrics_port);
        let metrics_listener = TcpListener::bind(&metrics_addr)
            .await
            .with_context(|| format!("Failed to bind metrics to {}", metrics_addr))?;
        info!(addr = %metrics_addr, "Serving metrics");

        let metrics_app = axum::Router::new().route(
            "/metrics",
            axum::routing::get(move || {
                let handle = handle.clone();
                async move { handle.render() }
            }),
        );
        tokio::spawn(async move {
            if let Err(e) = axum::serve(metrics_listener, metrics_app).await {
                tracing::error!(error = %e, "Metrics server error");
            }
        });
    }

    let (app, registry) = llamactl::build_app(config.clone())
        .await
        .context("Failed to build application")?;

    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    info!(addr = %addr, "Listening for requests");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Shutting down");
    registry.shutdown(SHUTDOWN_GRACE).await;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        return;
    }
    info!("Received shutdown signal");
}
