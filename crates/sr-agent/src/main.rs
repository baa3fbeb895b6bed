//! scrape-relay Agent Daemon
//!
//! The agent runs next to HTTP targets a central collector cannot reach
//! and opens one outbound connection to the broker. The broker routes
//! scrape requests down that connection; the agent fetches the mapped
//! local target and relays the result back.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sr_agent::fetch::HttpFetcher;
use sr_agent::metrics::{serve_metrics, AgentMetrics};
use sr_agent::Supervisor;
use sr_core::config;
use sr_core::registry::PathRegistry;

#[derive(Parser)]
#[command(name = "sr-agent")]
#[command(about = "scrape-relay agent - relays broker scrape requests to local targets")]
#[command(version)]
struct Args {
    /// Broker to connect to (host:port), overrides the config file
    #[arg(short, long)]
    broker: Option<String>,

    /// Path to configuration file
    #[arg(short, long)]
    config: PathBuf,

    /// Metrics endpoint port, overrides the config file
    #[arg(long)]
    metrics_port: Option<u16>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Enable debugging info
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.verbose {
        "debug"
    } else {
        &args.log_level
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("scrape-relay agent starting...");

    // Load configuration
    let mut config = config::load_config(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;

    // Apply command-line overrides
    if let Some(broker) = args.broker {
        // Add default port if not specified
        config.broker_address = if broker.contains(':') {
            broker
        } else {
            format!("{}:50051", broker)
        };
    }
    if let Some(port) = args.metrics_port {
        config.metrics_port = port;
    }

    let registry = Arc::new(
        PathRegistry::from_entries(&config.paths).context("Invalid path configuration")?,
    );
    if registry.is_empty() {
        tracing::warn!("No paths configured; the broker has nothing to route here");
    }

    let fetcher =
        Arc::new(HttpFetcher::new(config.fetch_timeout).context("Failed to build HTTP client")?);
    let metrics = Arc::new(AgentMetrics::new());
    let cancel = CancellationToken::new();

    // Metrics endpoint runs beside the supervisor for the process lifetime
    let metrics_server = tokio::spawn(serve_metrics(
        config.metrics_port,
        Arc::clone(&metrics),
        cancel.clone(),
    ));

    // Ctrl-C requests shutdown; tasks observe the token and exit
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Shutdown signal received");
                cancel.cancel();
            }
        });
    }

    tracing::info!("Connecting to broker at {}", config.broker_address);
    let supervisor = Supervisor::new(config, registry, fetcher, Arc::clone(&metrics));
    supervisor.run(cancel.clone()).await;

    cancel.cancel();
    match metrics_server.await {
        Ok(Err(e)) => tracing::warn!("Metrics server failed: {}", e),
        Err(e) => tracing::warn!("Metrics server task failed: {}", e),
        Ok(Ok(())) => {}
    }

    tracing::info!("Agent shut down");
    Ok(())
}
