//! Message identity
//!
//! Every message carries an id in [0x01, 0xFF] and a correlation id that
//! links a response to the request it answers. A correlation id of 0x00
//! marks an unsolicited message.

use bytes::{Bytes, BytesMut};

use super::envelope::MessageEnvelope;
use super::protocol::MessageBody;
use super::MessageError;

/// Smallest legal message id.
pub const MINIMUM_ID: u8 = 0x01;

/// Largest legal message id.
pub const MAXIMUM_ID: u8 = 0xFF;

/// Correlation id of a message that answers nothing.
pub const NO_CORRELATION_ID: u8 = 0x00;

/// A protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    id: u8,
    correlation_id: u8,
    body: MessageBody,
}

impl Message {
    /// Create an unsolicited message with the minimum id.
    pub fn new(body: MessageBody) -> Self {
        Self {
            id: MINIMUM_ID,
            correlation_id: NO_CORRELATION_ID,
            body,
        }
    }

    /// Create a message with the given id.
    pub fn with_id(id: i32, body: MessageBody) -> Result<Self, MessageError> {
        let mut message = Self::new(body);
        message.set_id(id)?;
        Ok(message)
    }

    /// Message id.
    pub fn id(&self) -> u8 {
        self.id
    }

    /// Set the message id; fails outside [0x01, 0xFF].
    pub fn set_id(&mut self, id: i32) -> Result<(), MessageError> {
        if id < MINIMUM_ID as i32 || id > MAXIMUM_ID as i32 {
            return Err(MessageError::InvalidId(id));
        }
        self.id = id as u8;
        Ok(())
    }

    /// Correlation id (0x00 when unsolicited).
    pub fn correlation_id(&self) -> u8 {
        self.correlation_id
    }

    /// Set the correlation id; fails outside [0x00, 0xFF].
    pub fn set_correlation_id(&mut self, correlation_id: i32) -> Result<(), MessageError> {
        if correlation_id != NO_CORRELATION_ID as i32
            && (correlation_id < MINIMUM_ID as i32 || correlation_id > MAXIMUM_ID as i32)
        {
            return Err(MessageError::InvalidCorrelationId(correlation_id));
        }
        self.correlation_id = correlation_id as u8;
        Ok(())
    }

    /// True if this message answers nothing.
    pub fn is_unsolicited(&self) -> bool {
        self.correlation_id == NO_CORRELATION_ID
    }

    /// Message body.
    pub fn body(&self) -> &MessageBody {
        &self.body
    }

    /// Consume the message, returning its body.
    pub fn into_body(self) -> MessageBody {
        self.body
    }

    /// Serialize to wire form (header + bincode body, no length prefix).
    ///
    /// The body is serialized straight into the returned buffer.
    pub fn encode(&self) -> Result<Bytes, MessageError> {
        let mut frame = Vec::with_capacity(self.body.frame_length()?);
        frame.push(self.id);
        frame.push(self.correlation_id);
        bincode::serialize_into(&mut frame, &self.body)?;
        Ok(Bytes::from(frame))
    }

    /// Deserialize from wire form.
    pub fn decode(frame: &[u8]) -> Result<Self, MessageError> {
        MessageEnvelope::from_frame(BytesMut::from(frame))?.into_message()
    }

    pub(crate) fn from_parts(id: u8, correlation_id: u8, body: MessageBody) -> Self {
        Self {
            id,
            correlation_id,
            body,
        }
    }
}

/// Hands out message ids, wrapping from 0xFF back to 0x01.
#[derive(Debug, Clone)]
pub struct MessageIdAllocator {
    next: u8,
}

impl MessageIdAllocator {
    /// Create an allocator starting at the minimum id.
    pub fn new() -> Self {
        Self { next: MINIMUM_ID }
    }

    /// Next id to use.
    pub fn next_id(&mut self) -> u8 {
        let id = self.next;
        self.next = if id == MAXIMUM_ID { MINIMUM_ID } else { id + 1 };
        id
    }
}

impl Default for MessageIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}
