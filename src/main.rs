//! Phosphor gateway server.
//!
//! Serves the terminal command API and streaming ask endpoint, answering
//! through OpenAI or Perplexity (or an echo when no key is configured).
//!
//! # Usage
//!
//! ```bash
//! # With config file
//! phosphor-gateway config/gateway.toml
//!
//! # With environment variables
//! OPENAI_API_KEY=sk-... GATEWAY_LISTEN=0.0.0.0:3000 phosphor-gateway
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use phosphor_gateway::{
    config::{Config, LoggingConfig},
    metrics::{init_metrics, start_metrics_server},
    resolver::ProviderKind,
    server::{serve, AppState},
    shutdown::ShutdownCoordinator,
};

/// HTTP/SSE gateway for terminal prompts.
#[derive(Parser, Debug)]
#[command(name = "phosphor-gateway")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (TOML).
    #[arg(value_name = "CONFIG")]
    config: Option<PathBuf>,

    /// Override listen address.
    #[arg(short, long)]
    listen: Option<String>,

    /// Override default provider (openai, perplexity).
    #[arg(short, long)]
    provider: Option<String>,

    /// Enable debug logging.
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = Config::load(args.config.as_ref())?;

    // CLI flags win over file and environment
    if let Some(listen) = args.listen {
        config.server.listen_addr = listen;
    }
    if let Some(provider) = args.provider {
        let kind = provider
            .parse::<ProviderKind>()
            .map_err(|_| anyhow::anyhow!("Unknown provider {:?}", provider))?;
        config.providers.default_provider = Some(kind);
    }
    if args.debug {
        config.logging.level = "debug".to_string();
    }

    init_logging(&config.logging)?;

    tracing::info!(
        listen = %config.server.listen_addr,
        provider = config.providers.default_provider.map(|p| p.as_str()).unwrap_or("auto"),
        openai_key = config.providers.openai.api_key.is_some(),
        perplexity_key = config.providers.perplexity.api_key.is_some(),
        rate_limit = config.rate_limit.enabled,
        basic_auth = config.server.basic_auth().is_some(),
        "Starting gateway"
    );

    init_metrics();

    if config.metrics.enabled {
        let addr = config
            .metrics
            .listen_addr
            .parse()
            .context("Invalid metrics listen address")?;
        start_metrics_server(addr).await?;
    }

    let shutdown = ShutdownCoordinator::new();
    let shutdown_timeout = config.server.shutdown_timeout();

    let listener = TcpListener::bind(&config.server.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.listen_addr))?;
    tracing::info!(addr = %listener.local_addr()?, "Gateway listening");

    let state = Arc::new(AppState::new(config, shutdown.clone())?);

    let signals = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = handle_signals(signals).await {
            tracing::error!(error = %e, "Signal handling failed");
        }
    });

    serve(listener, state).await?;

    tracing::info!(
        active = shutdown.active_streams(),
        timeout_secs = shutdown_timeout.as_secs(),
        "Waiting for streams to drain"
    );

    match tokio::time::timeout(shutdown_timeout, shutdown.wait_for_drain()).await {
        Ok(()) => tracing::info!("All streams drained"),
        Err(_) => tracing::warn!(
            active = shutdown.active_streams(),
            "Shutdown timeout reached, forcing exit"
        ),
    }

    tracing::info!("Gateway stopped");
    Ok(())
}

/// Initialize logging with tracing.
fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let filter =
        EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&config.level))?;

    match config.format.as_str() {
        "json" => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json())
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer())
                .init();
        }
    }

    Ok(())
}

/// Trigger shutdown on SIGINT or SIGTERM; log a status line on SIGHUP.
async fn handle_signals(shutdown: ShutdownCoordinator) -> anyhow::Result<()> {
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to register SIGINT")?;
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to register SIGTERM")?;
    let mut sighup = signal(SignalKind::hangup()).context("Failed to register SIGHUP")?;

    loop {
        tokio::select! {
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT, initiating shutdown");
                shutdown.shutdown();
                return Ok(());
            }
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, initiating shutdown");
                shutdown.shutdown();
                return Ok(());
            }
            _ = sighup.recv() => {
                tracing::info!(
                    active_streams = shutdown.active_streams(),
                    "Received SIGHUP, status report"
                );
            }
        }
    }
}
