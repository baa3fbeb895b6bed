//! Request dispatcher
//!
//! Consumes the inbound request stream of one session, resolves each
//! request against the path registry, fetches the target, and enqueues
//! a response for the relay. A response is produced for every request
//! received, echoing its scrape ID, and never more than one.

use std::sync::Arc;

use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use sr_core::registry::PathRegistry;
use sr_protocol::{AgentId, Message, ProtocolError};

use crate::fetch::Fetcher;
use crate::metrics::AgentMetrics;

/// Processes the inbound request stream for the lifetime of one session
pub struct Dispatcher {
    agent_id: AgentId,
    registry: Arc<PathRegistry>,
    fetcher: Arc<dyn Fetcher>,
    queue: mpsc::UnboundedSender<Message>,
    max_inflight: usize,
    metrics: Arc<AgentMetrics>,
}

impl Dispatcher {
    /// Create a dispatcher bound to one session's response queue
    pub fn new(
        agent_id: AgentId,
        registry: Arc<PathRegistry>,
        fetcher: Arc<dyn Fetcher>,
        queue: mpsc::UnboundedSender<Message>,
        max_inflight: usize,
        metrics: Arc<AgentMetrics>,
    ) -> Self {
        Self {
            agent_id,
            registry,
            fetcher,
            queue,
            max_inflight,
            metrics,
        }
    }

    /// Run until the inbound stream ends, errors, or the token fires.
    ///
    /// Fetches fan out onto a join set bounded by `max_inflight`;
    /// responses are enqueued in fetch completion order, which the
    /// broker tolerates by correlating on scrape ID.
    pub async fn run<S>(self, mut inbound: S, cancel: CancellationToken)
    where
        S: Stream<Item = Result<Message, ProtocolError>> + Unpin,
    {
        let limiter = Arc::new(Semaphore::new(self.max_inflight.max(1)));
        let mut fetches: JoinSet<()> = JoinSet::new();

        tracing::info!("Starting request reader...");

        'read: loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("Request reader cancelled");
                    break 'read;
                }

                // Reap finished fetch tasks so the set doesn't grow
                Some(_) = fetches.join_next(), if !fetches.is_empty() => {}

                item = inbound.next() => {
                    let message = match item {
                        None => {
                            tracing::info!("Request stream closed by broker");
                            break 'read;
                        }
                        Some(Err(e)) => {
                            tracing::warn!("Request stream error: {}", e);
                            break 'read;
                        }
                        Some(Ok(message)) => message,
                    };

                    match message {
                        Message::ScrapeRequest { scrape_id, path, .. } => {
                            tracing::debug!("Received {} for {}", scrape_id, path);

                            let Some(target) = self.registry.resolve(&path).map(str::to_string)
                            else {
                                tracing::warn!("Invalid path in scrape request: {}", path);
                                self.metrics.inc_scrape_invalid_paths();
                                enqueue(
                                    &self.queue,
                                    Message::ScrapeResponse {
                                        agent_id: self.agent_id,
                                        scrape_id,
                                        valid: false,
                                        status_code: None,
                                        text: format!("Invalid path {}", path),
                                    },
                                    &self.metrics,
                                );
                                continue 'read;
                            };

                            // Bound in-flight fetches; waiting here is the
                            // backpressure on reading further requests
                            let permit = tokio::select! {
                                _ = cancel.cancelled() => break 'read,
                                permit = Arc::clone(&limiter).acquire_owned() => {
                                    match permit {
                                        Ok(permit) => permit,
                                        Err(_) => break 'read,
                                    }
                                }
                            };

                            let agent_id = self.agent_id;
                            let fetcher = Arc::clone(&self.fetcher);
                            let queue = self.queue.clone();
                            let metrics = Arc::clone(&self.metrics);
                            fetches.spawn(async move {
                                let _permit = permit;
                                tracing::debug!("Fetching {} from {}", path, target);

                                let response = match fetcher.fetch(&target).await {
                                    Ok(outcome) => {
                                        metrics.inc_scrape_successes();
                                        Message::ScrapeResponse {
                                            agent_id,
                                            scrape_id,
                                            valid: true,
                                            status_code: Some(outcome.status_code),
                                            text: outcome.body,
                                        }
                                    }
                                    Err(e) => {
                                        tracing::warn!("Error fetching {} [{}]", path, e);
                                        metrics.inc_scrape_fetch_failures();
                                        Message::ScrapeResponse {
                                            agent_id,
                                            scrape_id,
                                            valid: false,
                                            status_code: None,
                                            text: e.to_string(),
                                        }
                                    }
                                };

                                enqueue(&queue, response, &metrics);
                            });
                        }

                        Message::Heartbeat { timestamp } => {
                            tracing::trace!("Heartbeat received, queueing ack");
                            enqueue(
                                &self.queue,
                                Message::HeartbeatAck { timestamp },
                                &self.metrics,
                            );
                        }

                        other => {
                            tracing::warn!(
                                "Unexpected {:?} message from broker",
                                other.message_type()
                            );
                        }
                    }
                }
            }
        }

        if cancel.is_cancelled() {
            fetches.shutdown().await;
        } else {
            // Let in-flight fetches finish so their responses still
            // reach the queue before the stream end is reported
            while fetches.join_next().await.is_some() {}
        }

        tracing::debug!("Request reader exiting");
    }
}

/// Put a message on the response queue, tracking queue depth
fn enqueue(queue: &mpsc::UnboundedSender<Message>, message: Message, metrics: &AgentMetrics) {
    let is_response = matches!(message, Message::ScrapeResponse { .. });
    if queue.send(message).is_ok() {
        if is_response {
            metrics.inc_queue_depth();
        }
    } else {
        tracing::debug!("Response queue closed, dropping outbound message");
    }
}
