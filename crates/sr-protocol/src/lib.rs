//! sr-protocol: Wire protocol for the scrape-relay broker link
//!
//! This crate defines the binary protocol spoken between the agent and
//! the broker over the single outbound TCP connection the agent opens.

pub mod codec;
pub mod error;
pub mod frame;
pub mod ids;
pub mod message;

pub use codec::FrameCodec;
pub use error::ProtocolError;
pub use frame::{FrameHeader, HEADER_SIZE, MAX_PAYLOAD_SIZE};
pub use ids::{AgentId, PathId, ScrapeId};
pub use message::{ErrorCode, Message, MessageType, PROTOCOL_VERSION};
