//! Outbound broker connector
//!
//! Performs the registration handshake for one connection attempt and
//! produces a bound `BrokerSession`, or fails with a `ConnectionError`.
//! Retry policy belongs to the caller.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use sr_core::config::AgentConfig;
use sr_core::registry::PathRegistry;
use sr_protocol::{AgentId, FrameCodec, Message, MessageType, ProtocolError, PROTOCOL_VERSION};

use super::backoff::ExponentialBackoff;
use crate::metrics::AgentMetrics;

/// Framed inbound half of a broker connection
pub type Inbound = SplitStream<Framed<TcpStream, FrameCodec>>;

/// Framed outbound half of a broker connection
pub type Outbound = SplitSink<Framed<TcpStream, FrameCodec>, Message>;

/// Connection errors that abort a handshake attempt
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Connect or handshake round-trip exceeded the configured timeout
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// Broker closed the connection mid-handshake
    #[error("Broker closed the connection during handshake")]
    Closed,

    /// Broker rejected the registration
    #[error("Registration rejected: {reason}")]
    Rejected { reason: String },

    /// Broker answered with something other than the expected ack
    #[error("Unexpected {0:?} message during handshake")]
    UnexpectedMessage(MessageType),

    /// Protocol error on the wire
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One live, registered connection to the broker.
///
/// Exactly one session exists at a time; the supervisor hands its halves
/// to the dispatcher (inbound) and relay (outbound) and tears the whole
/// thing down when either side stops.
pub struct BrokerSession {
    /// Agent ID assigned by the broker for this connection
    pub agent_id: AgentId,
    /// Address the session is bound to
    pub broker_address: String,
    /// Request stream from the broker
    pub inbound: Inbound,
    /// Response sink towards the broker
    pub outbound: Outbound,
}

/// Establishes registered sessions with the broker
pub struct BrokerConnector {
    config: AgentConfig,
    registry: Arc<PathRegistry>,
    metrics: Arc<AgentMetrics>,
}

impl BrokerConnector {
    /// Create a new connector
    pub fn new(
        config: AgentConfig,
        registry: Arc<PathRegistry>,
        metrics: Arc<AgentMetrics>,
    ) -> Self {
        Self {
            config,
            registry,
            metrics,
        }
    }

    /// Connect to the broker with automatic retry.
    ///
    /// Retries indefinitely with backoff until a handshake succeeds.
    /// Returns `None` when the cancellation token fires first.
    pub async fn connect_with_retry(
        &self,
        mut backoff: ExponentialBackoff,
        cancel: &CancellationToken,
    ) -> Option<BrokerSession> {
        loop {
            if cancel.is_cancelled() {
                return None;
            }

            self.metrics.inc_connect_attempts();
            match self.try_connect().await {
                Ok(session) => {
                    tracing::info!(
                        "Connected to broker at {} as {}",
                        session.broker_address,
                        session.agent_id
                    );
                    return Some(session);
                }
                Err(e) => {
                    self.metrics.inc_connect_failures();
                    let delay = backoff.next_delay();
                    tracing::warn!("Connection failed: {}. Retrying in {:?}", e, delay);
                    tokio::select! {
                        _ = cancel.cancelled() => return None,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Attempt a single connection and registration handshake.
    ///
    /// Any failure aborts the whole attempt; there is no partial-success
    /// state to clean up because the connection is simply dropped.
    pub async fn try_connect(&self) -> Result<BrokerSession, ConnectionError> {
        let address = self.config.broker_address.clone();
        tracing::debug!("Connecting to broker at {}", address);

        let stream = tokio::time::timeout(
            self.config.connect_timeout,
            TcpStream::connect(&address),
        )
        .await
        .map_err(|_| ConnectionError::Timeout(self.config.connect_timeout))??;

        let mut framed = Framed::new(stream, FrameCodec::new());

        // Agent registration
        let hostname = gethostname::gethostname().to_string_lossy().into_owned();
        framed
            .send(Message::RegisterAgent {
                hostname,
                version: Some(PROTOCOL_VERSION.to_string()),
            })
            .await?;

        let agent_id = match self.recv(&mut framed).await? {
            Message::RegisterAgentAck {
                agent_id,
                proxy_url,
            } => {
                tracing::info!(
                    "Registered with broker as {} (served at {})",
                    agent_id,
                    proxy_url
                );
                agent_id
            }
            Message::Error { message, .. } => {
                return Err(ConnectionError::Rejected { reason: message })
            }
            other => return Err(ConnectionError::UnexpectedMessage(other.message_type())),
        };

        // Path registration, sequential, in configuration order
        for (path, _url) in self.registry.iter() {
            tracing::debug!("Registering path {}...", path);
            framed
                .send(Message::RegisterPath {
                    agent_id,
                    path: path.to_string(),
                })
                .await?;

            match self.recv(&mut framed).await? {
                Message::RegisterPathAck { path_id } => {
                    tracing::info!("Registered path {} as {}", path, path_id);
                }
                Message::Error { message, .. } => {
                    return Err(ConnectionError::Rejected { reason: message })
                }
                other => return Err(ConnectionError::UnexpectedMessage(other.message_type())),
            }
        }

        let (outbound, inbound) = framed.split();

        Ok(BrokerSession {
            agent_id,
            broker_address: address,
            inbound,
            outbound,
        })
    }

    /// Read the next handshake reply, bounded by the connect timeout
    async fn recv(
        &self,
        framed: &mut Framed<TcpStream, FrameCodec>,
    ) -> Result<Message, ConnectionError> {
        match tokio::time::timeout(self.config.connect_timeout, framed.next()).await {
            Err(_) => Err(ConnectionError::Timeout(self.config.connect_timeout)),
            Ok(None) => Err(ConnectionError::Closed),
            Ok(Some(Ok(message))) => Ok(message),
            Ok(Some(Err(e))) => Err(ConnectionError::Protocol(e)),
        }
    }
}
