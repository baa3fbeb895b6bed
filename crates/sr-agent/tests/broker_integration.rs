//! Broker integration tests
//!
//! Runs the full supervisor against a mock broker on a real TCP socket:
//! handshake, request/response round trips, and reconnection after the
//! broker drops the link.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use sr_agent::fetch::{FetchError, FetchOutcome, Fetcher};
use sr_agent::metrics::AgentMetrics;
use sr_agent::Supervisor;
use sr_core::config::{AgentConfig, BackoffConfig, PathEntry};
use sr_core::registry::PathRegistry;
use sr_protocol::{AgentId, FrameCodec, Message, PathId, ScrapeId};

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Fetcher returning a canned result and counting invocations
struct CountingFetcher {
    calls: AtomicUsize,
    fail_with_timeout: bool,
}

impl CountingFetcher {
    fn ok() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            fail_with_timeout: false,
        }
    }

    fn timing_out() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            fail_with_timeout: true,
        }
    }

    fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Fetcher for CountingFetcher {
    async fn fetch(&self, _url: &str) -> Result<FetchOutcome, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_with_timeout {
            Err(FetchError::Timeout)
        } else {
            Ok(FetchOutcome {
                status_code: 200,
                body: "up 1".to_string(),
            })
        }
    }
}

fn test_config(broker_address: String) -> AgentConfig {
    AgentConfig {
        broker_address,
        connect_timeout: Duration::from_secs(2),
        backoff: BackoffConfig {
            initial: Duration::from_millis(10),
            max: Duration::from_millis(50),
            multiplier: 2.0,
            jitter: 0.0,
        },
        paths: vec![PathEntry {
            path: "/metrics".to_string(),
            url: "http://localhost:9100/metrics".to_string(),
        }],
        ..AgentConfig::default()
    }
}

fn test_registry(config: &AgentConfig) -> Arc<PathRegistry> {
    Arc::new(PathRegistry::from_entries(&config.paths).unwrap())
}

/// Spawn the supervisor for the given config; returns its cancel token
fn start_agent(
    config: AgentConfig,
    fetcher: Arc<dyn Fetcher>,
    metrics: Arc<AgentMetrics>,
) -> (CancellationToken, tokio::task::JoinHandle<()>) {
    let registry = test_registry(&config);
    let cancel = CancellationToken::new();
    let supervisor = Supervisor::new(config, registry, fetcher, metrics);
    let token = cancel.clone();
    let handle = tokio::spawn(async move { supervisor.run(token).await });
    (cancel, handle)
}

/// Accept one agent connection and walk it through the full handshake
async fn accept_and_handshake(
    listener: &TcpListener,
    agent_id: AgentId,
    expected_paths: &[&str],
) -> Framed<TcpStream, FrameCodec> {
    let (stream, _) = timeout(TEST_TIMEOUT, listener.accept())
        .await
        .expect("timed out waiting for agent connection")
        .unwrap();
    let mut framed = Framed::new(stream, FrameCodec::new());

    match timeout(TEST_TIMEOUT, framed.next()).await.unwrap() {
        Some(Ok(Message::RegisterAgent { hostname, .. })) => {
            assert!(!hostname.is_empty());
        }
        other => panic!("Expected RegisterAgent, got {:?}", other),
    }
    framed
        .send(Message::RegisterAgentAck {
            agent_id,
            proxy_url: format!("http://proxy.local/{}", agent_id),
        })
        .await
        .unwrap();

    for (i, expected) in expected_paths.iter().enumerate() {
        match timeout(TEST_TIMEOUT, framed.next()).await.unwrap() {
            Some(Ok(Message::RegisterPath {
                agent_id: id, path, ..
            })) => {
                assert_eq!(id, agent_id);
                assert_eq!(&path, expected);
            }
            other => panic!("Expected RegisterPath, got {:?}", other),
        }
        framed
            .send(Message::RegisterPathAck {
                path_id: PathId::new(i as u64 + 1),
            })
            .await
            .unwrap();
    }

    framed
}

/// Read frames until the next scrape response shows up
async fn next_scrape_response(framed: &mut Framed<TcpStream, FrameCodec>) -> Message {
    loop {
        match timeout(TEST_TIMEOUT, framed.next())
            .await
            .expect("timed out waiting for response")
        {
            Some(Ok(message @ Message::ScrapeResponse { .. })) => return message,
            Some(Ok(_)) => continue,
            other => panic!("Stream ended while waiting for response: {:?}", other),
        }
    }
}

#[tokio::test]
async fn test_scrape_round_trip() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();

    let fetcher = Arc::new(CountingFetcher::ok());
    let metrics = Arc::new(AgentMetrics::new());
    let (cancel, agent) = start_agent(
        test_config(address),
        Arc::clone(&fetcher) as Arc<dyn Fetcher>,
        Arc::clone(&metrics),
    );

    let agent_id = AgentId::new(7);
    let mut broker = accept_and_handshake(&listener, agent_id, &["/metrics"]).await;

    broker
        .send(Message::ScrapeRequest {
            agent_id,
            scrape_id: ScrapeId::new(100),
            path: "/metrics".to_string(),
        })
        .await
        .unwrap();

    match next_scrape_response(&mut broker).await {
        Message::ScrapeResponse {
            agent_id: id,
            scrape_id,
            valid,
            status_code,
            text,
        } => {
            assert_eq!(id, agent_id);
            assert_eq!(scrape_id, ScrapeId::new(100));
            assert!(valid);
            assert_eq!(status_code, Some(200));
            assert_eq!(text, "up 1");
        }
        other => panic!("Expected ScrapeResponse, got {:?}", other),
    }
    assert_eq!(fetcher.call_count(), 1);

    cancel.cancel();
    timeout(TEST_TIMEOUT, agent).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_unknown_path_answered_without_fetch() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();

    let fetcher = Arc::new(CountingFetcher::ok());
    let metrics = Arc::new(AgentMetrics::new());
    let (cancel, agent) = start_agent(
        test_config(address),
        Arc::clone(&fetcher) as Arc<dyn Fetcher>,
        Arc::clone(&metrics),
    );

    let agent_id = AgentId::new(2);
    let mut broker = accept_and_handshake(&listener, agent_id, &["/metrics"]).await;

    broker
        .send(Message::ScrapeRequest {
            agent_id,
            scrape_id: ScrapeId::new(5),
            path: "/unknown".to_string(),
        })
        .await
        .unwrap();

    match next_scrape_response(&mut broker).await {
        Message::ScrapeResponse {
            scrape_id,
            valid,
            status_code,
            text,
            ..
        } => {
            assert_eq!(scrape_id, ScrapeId::new(5));
            assert!(!valid);
            assert_eq!(status_code, None);
            assert_eq!(text, "Invalid path /unknown");
        }
        other => panic!("Expected ScrapeResponse, got {:?}", other),
    }
    assert_eq!(fetcher.call_count(), 0);

    cancel.cancel();
    timeout(TEST_TIMEOUT, agent).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_fetch_timeout_surfaced_to_broker() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();

    let fetcher = Arc::new(CountingFetcher::timing_out());
    let metrics = Arc::new(AgentMetrics::new());
    let (cancel, agent) = start_agent(
        test_config(address),
        Arc::clone(&fetcher) as Arc<dyn Fetcher>,
        Arc::clone(&metrics),
    );

    let agent_id = AgentId::new(3);
    let mut broker = accept_and_handshake(&listener, agent_id, &["/metrics"]).await;

    broker
        .send(Message::ScrapeRequest {
            agent_id,
            scrape_id: ScrapeId::new(8),
            path: "/metrics".to_string(),
        })
        .await
        .unwrap();

    match next_scrape_response(&mut broker).await {
        Message::ScrapeResponse { valid, text, .. } => {
            assert!(!valid);
            assert_eq!(text, "Request timed out");
        }
        other => panic!("Expected ScrapeResponse, got {:?}", other),
    }
    assert_eq!(fetcher.call_count(), 1);

    cancel.cancel();
    timeout(TEST_TIMEOUT, agent).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_reconnects_and_reregisters_after_disconnect() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();

    let fetcher = Arc::new(CountingFetcher::ok());
    let metrics = Arc::new(AgentMetrics::new());
    let (cancel, agent) = start_agent(
        test_config(address),
        Arc::clone(&fetcher) as Arc<dyn Fetcher>,
        Arc::clone(&metrics),
    );

    // First session: handshake, then drop the connection mid-stream
    let broker = accept_and_handshake(&listener, AgentId::new(1), &["/metrics"]).await;
    drop(broker);

    // Second session: the agent must redo the whole handshake,
    // including re-registering every configured path
    let agent_id = AgentId::new(2);
    let mut broker = accept_and_handshake(&listener, agent_id, &["/metrics"]).await;

    broker
        .send(Message::ScrapeRequest {
            agent_id,
            scrape_id: ScrapeId::new(42),
            path: "/metrics".to_string(),
        })
        .await
        .unwrap();

    match next_scrape_response(&mut broker).await {
        Message::ScrapeResponse {
            agent_id: id,
            scrape_id,
            valid,
            ..
        } => {
            assert_eq!(id, agent_id);
            assert_eq!(scrape_id, ScrapeId::new(42));
            assert!(valid);
        }
        other => panic!("Expected ScrapeResponse, got {:?}", other),
    }

    cancel.cancel();
    timeout(TEST_TIMEOUT, agent).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_handshake_failure_retries_until_success() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();

    let fetcher = Arc::new(CountingFetcher::ok());
    let metrics = Arc::new(AgentMetrics::new());
    let (cancel, agent) = start_agent(
        test_config(address),
        Arc::clone(&fetcher) as Arc<dyn Fetcher>,
        Arc::clone(&metrics),
    );

    // Two connections die before registration completes
    for _ in 0..2 {
        let (stream, _) = timeout(TEST_TIMEOUT, listener.accept())
            .await
            .expect("timed out waiting for agent connection")
            .unwrap();
        drop(stream);
    }

    // Third attempt succeeds end to end
    let agent_id = AgentId::new(9);
    let mut broker = accept_and_handshake(&listener, agent_id, &["/metrics"]).await;

    broker
        .send(Message::ScrapeRequest {
            agent_id,
            scrape_id: ScrapeId::new(1),
            path: "/metrics".to_string(),
        })
        .await
        .unwrap();
    next_scrape_response(&mut broker).await;

    assert!(metrics.connect_attempts() >= 3);

    cancel.cancel();
    timeout(TEST_TIMEOUT, agent).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_heartbeat_acked_over_session() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();

    let fetcher = Arc::new(CountingFetcher::ok());
    let metrics = Arc::new(AgentMetrics::new());
    let (cancel, agent) = start_agent(
        test_config(address),
        Arc::clone(&fetcher) as Arc<dyn Fetcher>,
        Arc::clone(&metrics),
    );

    let agent_id = AgentId::new(4);
    let mut broker = accept_and_handshake(&listener, agent_id, &["/metrics"]).await;

    broker
        .send(Message::Heartbeat { timestamp: 12345 })
        .await
        .unwrap();

    match timeout(TEST_TIMEOUT, broker.next())
        .await
        .expect("timed out waiting for heartbeat ack")
    {
        Some(Ok(Message::HeartbeatAck { timestamp })) => assert_eq!(timestamp, 12345),
        other => panic!("Expected HeartbeatAck, got {:?}", other),
    }

    cancel.cancel();
    timeout(TEST_TIMEOUT, agent).await.unwrap().unwrap();
}
