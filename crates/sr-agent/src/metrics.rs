//! Agent metrics and the local metrics endpoint
//!
//! Counters are plain atomics rendered in Prometheus text format and
//! served over HTTP on a local port, so the agent itself can be scraped
//! directly.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::Router;
use tokio_util::sync::CancellationToken;

/// Counters for the agent's connection and scrape activity
#[derive(Debug, Default)]
pub struct AgentMetrics {
    connect_attempts: AtomicU64,
    connect_failures: AtomicU64,
    scrape_successes: AtomicU64,
    scrape_invalid_paths: AtomicU64,
    scrape_fetch_failures: AtomicU64,
    responses_relayed: AtomicU64,
    responses_dropped: AtomicU64,
    response_queue_depth: AtomicI64,
}

impl AgentMetrics {
    /// Create a zeroed metrics set
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_connect_attempts(&self) {
        self.connect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_connect_failures(&self) {
        self.connect_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_scrape_successes(&self) {
        self.scrape_successes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_scrape_invalid_paths(&self) {
        self.scrape_invalid_paths.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_scrape_fetch_failures(&self) {
        self.scrape_fetch_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_responses_relayed(&self) {
        self.responses_relayed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_responses_dropped(&self, n: u64) {
        self.responses_dropped.fetch_add(n, Ordering::Relaxed);
    }

    pub fn inc_queue_depth(&self) {
        self.response_queue_depth.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_queue_depth(&self) {
        self.response_queue_depth.fetch_sub(1, Ordering::Relaxed);
    }

    /// Reset the queue depth gauge; called when a dead session's queue
    /// is discarded
    pub fn reset_queue_depth(&self) {
        self.response_queue_depth.store(0, Ordering::Relaxed);
    }

    pub fn connect_attempts(&self) -> u64 {
        self.connect_attempts.load(Ordering::Relaxed)
    }

    pub fn responses_relayed(&self) -> u64 {
        self.responses_relayed.load(Ordering::Relaxed)
    }

    pub fn responses_dropped(&self) -> u64 {
        self.responses_dropped.load(Ordering::Relaxed)
    }

    /// Render all metrics in Prometheus text exposition format
    pub fn render(&self) -> String {
        let mut out = String::with_capacity(1024);

        let counters = [
            (
                "sr_agent_connect_attempts_total",
                "Broker connection attempts",
                self.connect_attempts.load(Ordering::Relaxed),
            ),
            (
                "sr_agent_connect_failures_total",
                "Failed broker connection attempts",
                self.connect_failures.load(Ordering::Relaxed),
            ),
            (
                "sr_agent_scrape_successes_total",
                "Scrape requests answered with a valid body",
                self.scrape_successes.load(Ordering::Relaxed),
            ),
            (
                "sr_agent_scrape_invalid_paths_total",
                "Scrape requests for unregistered paths",
                self.scrape_invalid_paths.load(Ordering::Relaxed),
            ),
            (
                "sr_agent_scrape_fetch_failures_total",
                "Scrape requests whose target fetch failed",
                self.scrape_fetch_failures.load(Ordering::Relaxed),
            ),
            (
                "sr_agent_responses_relayed_total",
                "Responses written to the broker",
                self.responses_relayed.load(Ordering::Relaxed),
            ),
            (
                "sr_agent_responses_dropped_total",
                "Queued responses discarded at disconnect",
                self.responses_dropped.load(Ordering::Relaxed),
            ),
        ];

        for (name, help, value) in counters {
            out.push_str(&format!(
                "# HELP {name} {help}\n# TYPE {name} counter\n{name} {value}\n"
            ));
        }

        let depth = self.response_queue_depth.load(Ordering::Relaxed);
        out.push_str(&format!(
            "# HELP sr_agent_response_queue_depth Responses waiting in the relay queue\n\
             # TYPE sr_agent_response_queue_depth gauge\n\
             sr_agent_response_queue_depth {depth}\n"
        ));

        out
    }
}

async fn render_metrics(State(metrics): State<Arc<AgentMetrics>>) -> String {
    metrics.render()
}

/// Serve the metrics endpoint until the cancellation token fires
pub async fn serve_metrics(
    port: u16,
    metrics: Arc<AgentMetrics>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/metrics", get(render_metrics))
        .with_state(metrics);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!("Metrics endpoint listening on port {}", port);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;

    Ok(())
}
