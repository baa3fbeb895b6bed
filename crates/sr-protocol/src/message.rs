//! Message types for the scrape-relay protocol
//!
//! This module defines the messages exchanged between the agent and the
//! broker. Messages are serialized into frames using the codec defined
//! in `codec.rs`.
//!
//! # Message Flow
//!
//! Typical sequence for one connection:
//!
//! 1. Agent connects and sends `RegisterAgent`
//! 2. Broker responds with `RegisterAgentAck` carrying the assigned agent ID
//! 3. Agent sends `RegisterPath` for every configured path, broker acks each
//! 4. Broker streams `ScrapeRequest` messages; agent answers each with a
//!    `ScrapeResponse` correlated by scrape ID
//! 5. Broker may send `Heartbeat` at any time; agent answers `HeartbeatAck`

use serde::{Deserialize, Serialize};

use crate::ids::{AgentId, PathId, ScrapeId};

/// Current protocol version string.
///
/// Included in `RegisterAgent` messages to enable version negotiation.
/// Format: "MAJOR.MINOR" where MAJOR changes indicate breaking changes.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Message type identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    /// Agent registration (agent -> broker)
    RegisterAgent = 0x01,
    /// Registration acknowledgment with assigned agent ID
    RegisterAgentAck = 0x02,
    /// Path registration (agent -> broker)
    RegisterPath = 0x03,
    /// Path registration acknowledgment
    RegisterPathAck = 0x04,
    /// Scrape request (broker -> agent)
    ScrapeRequest = 0x05,
    /// Scrape result (agent -> broker)
    ScrapeResponse = 0x06,
    /// Heartbeat ping
    Heartbeat = 0x07,
    /// Heartbeat acknowledgment
    HeartbeatAck = 0x08,
    /// Error response
    Error = 0xFF,
}

impl MessageType {
    /// Convert to u8
    pub fn as_u8(&self) -> u8 {
        *self as u8
    }

    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::RegisterAgent),
            0x02 => Some(Self::RegisterAgentAck),
            0x03 => Some(Self::RegisterPath),
            0x04 => Some(Self::RegisterPathAck),
            0x05 => Some(Self::ScrapeRequest),
            0x06 => Some(Self::ScrapeResponse),
            0x07 => Some(Self::Heartbeat),
            0x08 => Some(Self::HeartbeatAck),
            0xFF => Some(Self::Error),
            _ => None,
        }
    }
}

/// Error codes for error messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u16)]
pub enum ErrorCode {
    /// Unknown error
    Unknown = 0,
    /// Agent not registered
    AgentNotRegistered = 1,
    /// Path registration rejected
    PathRejected = 2,
    /// Invalid message
    InvalidMessage = 3,
}

/// Protocol messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Agent registration.
    ///
    /// Sent by the agent immediately after connecting to identify itself.
    /// The broker responds with `RegisterAgentAck`.
    RegisterAgent {
        /// Hostname of the agent machine
        hostname: String,
        /// Protocol version (e.g., "1.0"). Optional for backward
        /// compatibility; use `PROTOCOL_VERSION` when sending.
        version: Option<String>,
    },

    /// Registration acknowledgment
    RegisterAgentAck {
        /// Agent ID assigned by the broker for this connection
        agent_id: AgentId,
        /// Advisory URL under which the broker exposes this agent.
        /// Informational only; the agent just logs it.
        proxy_url: String,
    },

    /// Register one scrapeable path with the broker
    RegisterPath {
        /// Agent ID from the preceding registration
        agent_id: AgentId,
        /// Logical path name the broker will route on
        path: String,
    },

    /// Path registration acknowledgment
    RegisterPathAck {
        /// Path ID assigned by the broker (logged, not otherwise used)
        path_id: PathId,
    },

    /// Request to scrape one registered path
    ScrapeRequest {
        /// Agent the request is addressed to
        agent_id: AgentId,
        /// Correlation ID, echoed on the response
        scrape_id: ScrapeId,
        /// Logical path to scrape
        path: String,
    },

    /// Result of one scrape request
    ScrapeResponse {
        /// Agent that produced the response
        agent_id: AgentId,
        /// Correlation ID copied from the originating request
        scrape_id: ScrapeId,
        /// Whether the scrape produced a usable body
        valid: bool,
        /// HTTP status of the fetch, when one was made
        status_code: Option<u16>,
        /// Fetched body on success, failure description otherwise
        text: String,
    },

    /// Heartbeat ping
    Heartbeat {
        /// Timestamp for latency measurement
        timestamp: u64,
    },

    /// Heartbeat acknowledgment
    HeartbeatAck {
        /// Echo of the original timestamp
        timestamp: u64,
    },

    /// Error response
    Error {
        /// Error code
        code: ErrorCode,
        /// Human-readable message
        message: String,
    },
}

impl Message {
    /// Get the message type for this message
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::RegisterAgent { .. } => MessageType::RegisterAgent,
            Message::RegisterAgentAck { .. } => MessageType::RegisterAgentAck,
            Message::RegisterPath { .. } => MessageType::RegisterPath,
            Message::RegisterPathAck { .. } => MessageType::RegisterPathAck,
            Message::ScrapeRequest { .. } => MessageType::ScrapeRequest,
            Message::ScrapeResponse { .. } => MessageType::ScrapeResponse,
            Message::Heartbeat { .. } => MessageType::Heartbeat,
            Message::HeartbeatAck { .. } => MessageType::HeartbeatAck,
            Message::Error { .. } => MessageType::Error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_roundtrip() {
        for msg_type in [
            MessageType::RegisterAgent,
            MessageType::RegisterAgentAck,
            MessageType::RegisterPath,
            MessageType::RegisterPathAck,
            MessageType::ScrapeRequest,
            MessageType::ScrapeResponse,
            MessageType::Heartbeat,
            MessageType::HeartbeatAck,
            MessageType::Error,
        ] {
            let byte = msg_type.as_u8();
            let recovered = MessageType::from_u8(byte).unwrap();
            assert_eq!(recovered, msg_type);
        }
    }

    #[test]
    fn test_unknown_message_type_byte() {
        assert!(MessageType::from_u8(0x42).is_none());
    }

    #[test]
    fn test_response_echoes_request_ids() {
        let request = Message::ScrapeRequest {
            agent_id: AgentId::new(3),
            scrape_id: ScrapeId::new(99),
            path: "/metrics".to_string(),
        };

        if let Message::ScrapeRequest {
            agent_id, scrape_id, ..
        } = request
        {
            let response = Message::ScrapeResponse {
                agent_id,
                scrape_id,
                valid: true,
                status_code: Some(200),
                text: "up 1".to_string(),
            };
            assert_eq!(response.message_type(), MessageType::ScrapeResponse);
        } else {
            panic!("Expected ScrapeRequest");
        }
    }
}
