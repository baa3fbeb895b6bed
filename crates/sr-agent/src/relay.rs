//! Response relay
//!
//! Drains the per-session response queue and writes each item to the
//! session's outbound sink. Queue order is preserved on the wire: items
//! go out in the order they were enqueued, which is fetch completion
//! order, not request arrival order.

use std::fmt::Display;
use std::sync::Arc;

use futures::{Sink, SinkExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use sr_protocol::Message;

use crate::metrics::AgentMetrics;

/// Run the relay until the queue closes, a write fails, or the token
/// fires.
///
/// Returns the queue receiver so the caller can count anything still
/// queued when the session died.
pub async fn run_relay<W>(
    mut outbound: W,
    mut queue: mpsc::UnboundedReceiver<Message>,
    cancel: CancellationToken,
    metrics: Arc<AgentMetrics>,
) -> mpsc::UnboundedReceiver<Message>
where
    W: Sink<Message> + Unpin,
    W::Error: Display,
{
    tracing::info!("Starting response writer...");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!("Response writer cancelled");
                break;
            }

            item = queue.recv() => {
                let message = match item {
                    None => {
                        tracing::debug!("Response queue closed");
                        break;
                    }
                    Some(message) => message,
                };

                let is_response = matches!(message, Message::ScrapeResponse { .. });
                if let Message::ScrapeResponse { scrape_id, .. } = &message {
                    tracing::debug!("Returning {} results to broker", scrape_id);
                }

                // The write itself can stall indefinitely when the broker
                // stops reading, so it has to race the token too
                let sent = tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::debug!("Response writer cancelled mid-send");
                        break;
                    }
                    res = outbound.send(message) => res,
                };
                if let Err(e) = sent {
                    tracing::warn!("Response writer disconnected from broker: {}", e);
                    break;
                }

                if is_response {
                    metrics.dec_queue_depth();
                    metrics.inc_responses_relayed();
                }
            }
        }
    }

    tracing::debug!("Response writer exiting");
    queue
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use sr_protocol::{AgentId, ScrapeId};

    fn response(scrape_id: u64) -> Message {
        Message::ScrapeResponse {
            agent_id: AgentId::new(1),
            scrape_id: ScrapeId::new(scrape_id),
            valid: true,
            status_code: Some(200),
            text: "ok".to_string(),
        }
    }

    #[tokio::test]
    async fn test_relay_preserves_enqueue_order() {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (sink, mut collected) = futures::channel::mpsc::unbounded::<Message>();
        let metrics = Arc::new(AgentMetrics::new());

        for id in 0..5u64 {
            queue_tx.send(response(id)).unwrap();
        }
        drop(queue_tx);

        run_relay(sink, queue_rx, CancellationToken::new(), Arc::clone(&metrics)).await;

        let mut seen = Vec::new();
        while let Some(message) = collected.next().await {
            if let Message::ScrapeResponse { scrape_id, .. } = message {
                seen.push(scrape_id.as_u64());
            }
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
        assert_eq!(metrics.responses_relayed(), 5);
    }

    #[tokio::test]
    async fn test_relay_neither_loses_nor_duplicates() {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (sink, collected) = futures::channel::mpsc::unbounded::<Message>();
        let metrics = Arc::new(AgentMetrics::new());

        // Producer runs concurrently with the relay consumer
        let producer = tokio::spawn(async move {
            for id in 0..100u64 {
                queue_tx.send(response(id)).unwrap();
                if id % 7 == 0 {
                    tokio::task::yield_now().await;
                }
            }
        });

        let relay = tokio::spawn(run_relay(
            sink,
            queue_rx,
            CancellationToken::new(),
            Arc::clone(&metrics),
        ));

        producer.await.unwrap();
        relay.await.unwrap();

        let seen: Vec<u64> = collected
            .map(|message| match message {
                Message::ScrapeResponse { scrape_id, .. } => scrape_id.as_u64(),
                other => panic!("Expected ScrapeResponse, got {:?}", other),
            })
            .collect()
            .await;
        assert_eq!(seen, (0..100u64).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_relay_stops_on_write_failure() {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (sink, collected) = futures::channel::mpsc::unbounded::<Message>();
        // Receiver dropped: every send into the sink fails
        drop(collected);
        let metrics = Arc::new(AgentMetrics::new());

        queue_tx.send(response(0)).unwrap();
        queue_tx.send(response(1)).unwrap();

        let mut leftover = run_relay(
            sink,
            queue_rx,
            CancellationToken::new(),
            Arc::clone(&metrics),
        )
        .await;

        assert_eq!(metrics.responses_relayed(), 0);
        // The second response is still queued and comes back to the caller
        assert!(leftover.try_recv().is_ok());
    }

    /// Sink that accepts items but never completes a flush, like a peer
    /// that stopped reading with a full send buffer
    struct StalledSink;

    impl futures::Sink<Message> for StalledSink {
        type Error = std::convert::Infallible;

        fn poll_ready(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<Result<(), Self::Error>> {
            std::task::Poll::Ready(Ok(()))
        }

        fn start_send(self: std::pin::Pin<&mut Self>, _item: Message) -> Result<(), Self::Error> {
            Ok(())
        }

        fn poll_flush(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<Result<(), Self::Error>> {
            std::task::Poll::Pending
        }

        fn poll_close(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<Result<(), Self::Error>> {
            std::task::Poll::Pending
        }
    }

    #[tokio::test]
    async fn test_relay_cancellable_while_blocked_in_send() {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let metrics = Arc::new(AgentMetrics::new());
        let cancel = CancellationToken::new();

        queue_tx.send(response(0)).unwrap();

        let relay = tokio::spawn(run_relay(
            StalledSink,
            queue_rx,
            cancel.clone(),
            Arc::clone(&metrics),
        ));

        // Give the relay time to get stuck in the write
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        cancel.cancel();

        tokio::time::timeout(std::time::Duration::from_millis(500), relay)
            .await
            .expect("relay did not exit after cancellation while sending")
            .unwrap();
        assert_eq!(metrics.responses_relayed(), 0);
    }

    #[tokio::test]
    async fn test_relay_exits_on_cancellation() {
        let (_queue_tx, queue_rx) = mpsc::unbounded_channel::<Message>();
        let (sink, _collected) = futures::channel::mpsc::unbounded::<Message>();
        let metrics = Arc::new(AgentMetrics::new());

        let cancel = CancellationToken::new();
        cancel.cancel();

        // Returns immediately instead of blocking on the empty queue
        run_relay(sink, queue_rx, cancel, metrics).await;
    }
}
