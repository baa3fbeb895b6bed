//! Frame header encoding/decoding
//!
//! The frame format uses a 4-byte header:
//! - message_type: 1 byte (u8)
//! - payload_length: 3 bytes (u24, big-endian, max 16MB)

use bytes::{Buf, BufMut, BytesMut};

use crate::error::ProtocolError;
use crate::message::MessageType;

/// Size of the frame header in bytes
pub const HEADER_SIZE: usize = 4;

/// Maximum payload size (16MB - 1, limited by 24-bit length field)
pub const MAX_PAYLOAD_SIZE: usize = 0x00FF_FFFF;

/// Frame header containing type and length information
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Type of message in the payload
    pub message_type: MessageType,
    /// Length of the payload in bytes
    pub payload_length: u32,
}

impl FrameHeader {
    /// Create a new frame header
    pub fn new(message_type: MessageType, payload_length: u32) -> Self {
        Self {
            message_type,
            payload_length,
        }
    }

    /// Encode the header into a byte buffer
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(HEADER_SIZE);
        // message_type: 1 byte
        dst.put_u8(self.message_type.as_u8());
        // payload_length: 3 bytes big-endian (24-bit)
        dst.put_u8((self.payload_length >> 16) as u8);
        dst.put_u16(self.payload_length as u16);
    }

    /// Decode a header from a byte buffer
    ///
    /// Returns None if there aren't enough bytes in the buffer.
    /// Returns Err if the header is invalid (unknown message type).
    pub fn decode(src: &mut BytesMut) -> Result<Option<Self>, ProtocolError> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        // Peek at the message type first to validate
        let msg_type_byte = src[0];
        let message_type = MessageType::from_u8(msg_type_byte)
            .ok_or(ProtocolError::UnknownMessageType(msg_type_byte))?;

        // Now consume the bytes
        let _ = src.get_u8(); // message_type already parsed
        let len_high = src.get_u8() as u32;
        let len_low = src.get_u16() as u32;
        let payload_length = (len_high << 16) | len_low;

        Ok(Some(Self {
            message_type,
            payload_length,
        }))
    }
}
