//! Protocol Messages
//!
//! Bodies exchanged between a table host and its clients. Bodies are
//! bincode-encoded behind the one-byte id / correlation header.

use std::fmt;

use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use super::envelope::HEADER_LENGTH;
use super::MessageError;
use crate::table::{TableChange, TableDigest, TableMemento};

/// Protocol version spoken by this build.
pub const PROTOCOL_VERSION: u32 = 1;

/// Protocol versions this build can negotiate.
pub const SUPPORTED_PROTOCOL_VERSIONS: &[u32] = &[PROTOCOL_VERSION];

/// Pick the highest version offered by the peer that we also support.
pub fn choose_protocol_version(offered: &[u32]) -> Option<u32> {
    offered
        .iter()
        .copied()
        .filter(|version| SUPPORTED_PROTOCOL_VERSIONS.contains(version))
        .max()
}

/// All message bodies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageBody {
    /// Client introduces itself to the host.
    Hello(Hello),

    /// Host answers a `Hello`.
    HelloResponse(HelloResponse),

    /// Keep-alive probe.
    Echo {
        /// Opaque content, returned unchanged.
        content: Vec<u8>,
    },

    /// Keep-alive answer.
    EchoResponse {
        /// Content of the echo being answered.
        content: Vec<u8>,
    },

    /// Host announces the current roster.
    PlayersUpdated {
        /// Player names, sorted.
        players: Vec<String>,
    },

    /// Client asks the host to change the table.
    ChangeTable {
        /// Requested changes.
        changes: Vec<TableChange>,
    },

    /// Host announces an applied table change.
    TableChanged(TableChanged),

    /// Host is closing the table.
    Goodbye,
}

impl MessageBody {
    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            MessageBody::Hello(_) => "hello",
            MessageBody::HelloResponse(_) => "hello_response",
            MessageBody::Echo { .. } => "echo",
            MessageBody::EchoResponse { .. } => "echo_response",
            MessageBody::PlayersUpdated { .. } => "players_updated",
            MessageBody::ChangeTable { .. } => "change_table",
            MessageBody::TableChanged(_) => "table_changed",
            MessageBody::Goodbye => "goodbye",
        }
    }

    /// Length of the frame carrying this body, header included.
    pub fn frame_length(&self) -> Result<usize, MessageError> {
        Ok(HEADER_LENGTH + bincode::serialized_size(self)? as usize)
    }
}

// =============================================================================
// HANDSHAKE
// =============================================================================

/// Handshake request. The password is zeroed when the message is dropped.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    /// Protocol versions the client speaks.
    pub supported_protocol_versions: Vec<u32>,
    /// Requested player name.
    pub player_name: String,
    /// Table password.
    pub password: Vec<u8>,
}

impl fmt::Debug for Hello {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hello")
            .field("supported_protocol_versions", &self.supported_protocol_versions)
            .field("player_name", &self.player_name)
            .field("password", &"***")
            .finish()
    }
}

impl Drop for Hello {
    fn drop(&mut self) {
        self.password.zeroize();
    }
}

/// Handshake answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HelloResponse {
    /// Client admitted to the table.
    Accepted {
        /// Negotiated protocol version.
        protocol_version: u32,
        /// Roster including the new player.
        players: Vec<String>,
        /// Authoritative table state at admission.
        snapshot: TableSnapshot,
    },
    /// Client refused.
    Rejected {
        /// Why the host refused.
        reason: RejectionReason,
    },
}

/// Why a host refused a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum RejectionReason {
    /// Password did not match.
    #[error("authentication failed")]
    AuthenticationFailed,
    /// Another player already uses the name.
    #[error("duplicate player name")]
    DuplicatePlayerName,
    /// Player name is empty.
    #[error("invalid player name")]
    InvalidPlayerName,
    /// No protocol version in common.
    #[error("unsupported protocol version")]
    UnsupportedProtocolVersion,
    /// Message arrived out of order.
    #[error("unexpected message")]
    UnexpectedMessage,
    /// Host is going offline.
    #[error("host shutting down")]
    HostShuttingDown,
}

// =============================================================================
// TABLE STATE
// =============================================================================

/// Full table state at a given sequence number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSnapshot {
    /// Sequence number of the last applied change.
    pub sequence: u64,
    /// Table state.
    pub memento: TableMemento,
    /// Digest of `memento`, checked by the receiver.
    pub digest: TableDigest,
}

impl TableSnapshot {
    /// Capture a memento at a sequence number.
    pub fn new(sequence: u64, memento: TableMemento) -> Self {
        let digest = memento.digest();
        Self {
            sequence,
            memento,
            digest,
        }
    }

    /// True if the digest matches the memento.
    pub fn verify(&self) -> bool {
        self.memento.digest() == self.digest
    }
}

/// A change the host applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableChanged {
    /// Sequence number assigned by the host.
    pub sequence: u64,
    /// Player who requested the change.
    pub origin: String,
    /// Applied changes.
    pub changes: Vec<TableChange>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;

    #[test]
    fn test_choose_protocol_version() {
        assert_eq!(choose_protocol_version(&[1]), Some(1));
        assert_eq!(choose_protocol_version(&[0, 1, 7]), Some(1));
        assert_eq!(choose_protocol_version(&[2, 3]), None);
        assert_eq!(choose_protocol_version(&[]), None);
    }

    #[test]
    fn test_hello_debug_hides_password() {
        let hello = Hello {
            supported_protocol_versions: vec![1],
            player_name: "alice".into(),
            password: b"secret".to_vec(),
        };
        let debug = format!("{:?}", hello);
        assert!(debug.contains("alice"));
        assert!(!debug.contains("secret"));
    }

    #[test]
    fn test_accepted_response_roundtrip() {
        let mut memento = TableMemento::new();
        memento.insert("deck", vec![1, 2, 3]);

        let body = MessageBody::HelloResponse(HelloResponse::Accepted {
            protocol_version: PROTOCOL_VERSION,
            players: vec!["alice".into(), "host".into()],
            snapshot: TableSnapshot::new(4, memento),
        });
        let message = Message::with_id(2, body).unwrap();

        let decoded = Message::decode(&message.encode().unwrap()).unwrap();
        assert_eq!(decoded, message);

        if let MessageBody::HelloResponse(HelloResponse::Accepted { snapshot, .. }) = decoded.body() {
            assert!(snapshot.verify());
            assert_eq!(snapshot.sequence, 4);
        } else {
            panic!("Wrong message type");
        }
    }

    #[test]
    fn test_tampered_snapshot_fails_verification() {
        let mut snapshot = TableSnapshot::new(1, TableMemento::new());
        snapshot.memento.insert("card", vec![9]);
        assert!(!snapshot.verify());
    }

    #[test]
    fn test_rejection_reason_display() {
        assert_eq!(
            RejectionReason::AuthenticationFailed.to_string(),
            "authentication failed"
        );
    }
}
