//! Message envelopes
//!
//! A received frame is split into its header and a still-encoded body, so a
//! service can inspect ids before paying for body decoding. The encoded body
//! is zeroed when the envelope goes away; a `Hello` carries a password.

use bytes::BytesMut;
use zeroize::Zeroize;

use super::header::{Message, MINIMUM_ID};
use super::protocol::MessageBody;
use super::MessageError;

/// Bytes in the message header (id + correlation id).
pub const HEADER_LENGTH: usize = 2;

/// Header of a received message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    /// Message id.
    pub id: u8,
    /// Correlation id (0x00 when unsolicited).
    pub correlation_id: u8,
    /// Encoded body length in bytes.
    pub body_length: usize,
}

/// A received message whose body has not been decoded yet.
#[derive(Debug)]
pub struct MessageEnvelope {
    header: MessageHeader,
    body: BytesMut,
}

impl MessageEnvelope {
    /// Split a frame (without its length prefix) into header and body.
    pub fn from_frame(mut frame: BytesMut) -> Result<Self, MessageError> {
        if frame.len() < HEADER_LENGTH {
            return Err(MessageError::Truncated(frame.len()));
        }

        let id = frame[0];
        if id < MINIMUM_ID {
            return Err(MessageError::InvalidId(id as i32));
        }
        let correlation_id = frame[1];
        let body = frame.split_off(HEADER_LENGTH);

        Ok(Self {
            header: MessageHeader {
                id,
                correlation_id,
                body_length: body.len(),
            },
            body,
        })
    }

    /// Envelope header.
    pub fn header(&self) -> &MessageHeader {
        &self.header
    }

    /// Raw encoded body.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Decode the body into a full message.
    pub fn into_message(self) -> Result<Message, MessageError> {
        let body: MessageBody = bincode::deserialize(&self.body)?;
        Ok(Message::from_parts(
            self.header.id,
            self.header.correlation_id,
            body,
        ))
    }

    fn erase(&mut self) {
        self.body[..].zeroize();
    }
}

impl Drop for MessageEnvelope {
    fn drop(&mut self) {
        self.erase();
    }
}
