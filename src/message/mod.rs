//! Message Codec
//!
//! Wire contract shared by every layer: a one-byte message id, a one-byte
//! correlation id and a bincode body, carried in length-delimited frames.
//!
//! ```text
//! +------------------+------+-------------+------------------+
//! | Length (4B BE)   |  id  | correlation | Body (bincode)   |
//! +------------------+------+-------------+------------------+
//!                     1 byte    1 byte
//! ```

pub mod envelope;
pub mod header;
pub mod protocol;

pub use envelope::{MessageEnvelope, MessageHeader, HEADER_LENGTH};
pub use header::{
    Message, MessageIdAllocator, MAXIMUM_ID, MINIMUM_ID, NO_CORRELATION_ID,
};
pub use protocol::{
    choose_protocol_version, Hello, HelloResponse, MessageBody, RejectionReason,
    TableChanged, TableSnapshot, PROTOCOL_VERSION, SUPPORTED_PROTOCOL_VERSIONS,
};

/// Message codec errors.
#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    /// Message id outside [0x01, 0xFF].
    #[error("Invalid message id: {0}")]
    InvalidId(i32),

    /// Correlation id outside [0x00, 0xFF].
    #[error("Invalid correlation id: {0}")]
    InvalidCorrelationId(i32),

    /// Frame shorter than the message header.
    #[error("Truncated frame: {0} bytes")]
    Truncated(usize),

    /// Encoded message exceeds the frame limit.
    #[error("Frame too large: {size} bytes (max {max_size})")]
    FrameTooLarge {
        /// Encoded frame size.
        size: usize,
        /// Configured limit.
        max_size: usize,
    },

    /// Body failed to serialize or deserialize.
    #[error("Body error: {0}")]
    Body(#[from] bincode::Error),
}
