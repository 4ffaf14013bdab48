//! Table network errors.

use crate::message::RejectionReason;
use crate::table::TableError;
use crate::transport::TransportError;

use super::DisconnectReason;

/// Errors returned by [`TableNetworkController`](super::TableNetworkController) operations.
#[derive(Debug, thiserror::Error)]
pub enum TableNetworkError {
    /// `host` or `join` while a session is active.
    #[error("Already connected")]
    AlreadyConnected,

    /// Operation needs an active session.
    #[error("Not connected")]
    NotConnected,

    /// Underlying transport failed.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Host refused the join.
    #[error("Rejected by host: {0}")]
    Rejected(RejectionReason),

    /// Host did not answer the join in time.
    #[error("Join timed out")]
    JoinTimedOut,

    /// Table change could not be applied.
    #[error("Table error: {0}")]
    Table(#[from] TableError),

    /// Session ended while the operation was in flight.
    #[error("Connection lost: {0}")]
    ConnectionLost(String),
}

impl From<&DisconnectReason> for TableNetworkError {
    fn from(reason: &DisconnectReason) -> Self {
        match reason {
            DisconnectReason::Requested => TableNetworkError::NotConnected,
            DisconnectReason::Rejected(reason) => TableNetworkError::Rejected(*reason),
            DisconnectReason::HostClosed => {
                TableNetworkError::ConnectionLost("host closed the table".to_string())
            }
            DisconnectReason::ConnectionLost(cause) => {
                TableNetworkError::ConnectionLost(cause.clone())
            }
        }
    }
}
