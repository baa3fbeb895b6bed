//! Connection supervisor
//!
//! Owns the reconnect loop: handshake, then dispatcher and relay against
//! the bound session, teardown as soon as either side stops, backoff,
//! repeat until shutdown. Each connection attempt gets a fresh session
//! and a fresh response queue; nothing is carried across attempts.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use sr_core::config::AgentConfig;
use sr_core::registry::PathRegistry;
use sr_protocol::Message;

use crate::broker::{BrokerConnector, ExponentialBackoff};
use crate::dispatch::Dispatcher;
use crate::fetch::Fetcher;
use crate::metrics::AgentMetrics;
use crate::relay::run_relay;

/// Drives the Disconnected -> Connecting -> Streaming loop
pub struct Supervisor {
    config: AgentConfig,
    registry: Arc<PathRegistry>,
    fetcher: Arc<dyn Fetcher>,
    metrics: Arc<AgentMetrics>,
}

impl Supervisor {
    /// Create a new supervisor
    pub fn new(
        config: AgentConfig,
        registry: Arc<PathRegistry>,
        fetcher: Arc<dyn Fetcher>,
        metrics: Arc<AgentMetrics>,
    ) -> Self {
        Self {
            config,
            registry,
            fetcher,
            metrics,
        }
    }

    /// Run until the cancellation token fires.
    ///
    /// Connection failures are never fatal; the only way out is the
    /// token.
    pub async fn run(&self, cancel: CancellationToken) {
        let connector = BrokerConnector::new(
            self.config.clone(),
            Arc::clone(&self.registry),
            Arc::clone(&self.metrics),
        );

        loop {
            if cancel.is_cancelled() {
                break;
            }

            // Connecting: retry with fresh backoff until a handshake
            // lands or shutdown wins
            let backoff = ExponentialBackoff::from_config(&self.config.backoff);
            let Some(session) = connector.connect_with_retry(backoff, &cancel).await else {
                break;
            };

            // Streaming: fresh queue, dispatcher and relay bound to
            // this session only
            let (queue_tx, queue_rx) = mpsc::unbounded_channel();
            let session_cancel = cancel.child_token();

            let dispatcher = Dispatcher::new(
                session.agent_id,
                Arc::clone(&self.registry),
                Arc::clone(&self.fetcher),
                queue_tx,
                self.config.max_inflight_fetches,
                Arc::clone(&self.metrics),
            );
            let mut reader = tokio::spawn(dispatcher.run(session.inbound, session_cancel.clone()));
            let mut writer = tokio::spawn(run_relay(
                session.outbound,
                queue_rx,
                session_cancel.clone(),
                Arc::clone(&self.metrics),
            ));

            // The session is dead as soon as either side stops; join
            // the other side after cancelling it
            let queue_rx = tokio::select! {
                _ = &mut reader => {
                    tracing::info!("Request reader finished");
                    session_cancel.cancel();
                    writer.await.ok()
                }
                res = &mut writer => {
                    tracing::info!("Response writer finished");
                    session_cancel.cancel();
                    let _ = reader.await;
                    res.ok()
                }
                _ = cancel.cancelled() => {
                    tracing::debug!("Shutdown requested");
                    session_cancel.cancel();
                    let _ = reader.await;
                    writer.await.ok()
                }
            };

            // Anything still queued belongs to the dead session and is
            // dropped; make the loss visible instead of silent
            if let Some(mut queue_rx) = queue_rx {
                let mut dropped = 0u64;
                while let Ok(message) = queue_rx.try_recv() {
                    if matches!(message, Message::ScrapeResponse { .. }) {
                        dropped += 1;
                    }
                }
                if dropped > 0 {
                    tracing::warn!("Discarding {} queued responses from dead session", dropped);
                    self.metrics.add_responses_dropped(dropped);
                }
            }
            self.metrics.reset_queue_depth();

            if cancel.is_cancelled() {
                break;
            }
            tracing::info!(
                "Disconnected from broker at {}, reconnecting...",
                session.broker_address
            );
        }

        tracing::info!("Supervisor stopped");
    }
}
