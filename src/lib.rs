//! # Table Net
//!
//! Peer-to-peer networking for shared tables: one node hosts a table, other
//! nodes join it over TCP and mirror its state.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         TABLE NET                            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  message/        - Wire format                               │
//! │  ├── header.rs   - Message ids and frame codec               │
//! │  ├── envelope.rs - Header-first view of a received frame     │
//! │  └── protocol.rs - Message bodies and version negotiation    │
//! │                                                              │
//! │  transport/      - TCP lifecycle (role-agnostic)             │
//! │  ├── active.rs   - Outbound connector                        │
//! │  ├── passive.rs  - Inbound listener                          │
//! │  ├── connection.rs - Per-peer task and handle                │
//! │  └── service.rs  - Protocol hook bound to a connection       │
//! │                                                              │
//! │  node/           - Host/client session                       │
//! │  ├── host.rs     - Admission, broadcast, keep-alive          │
//! │  ├── client.rs   - Handshake and table mirroring             │
//! │  └── config.rs   - Session configuration and secrets         │
//! │                                                              │
//! │  table.rs        - Table state and digests                   │
//! │  settings.rs     - Timeouts and limits                       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Authority
//!
//! The host orders every table change and assigns it a sequence number.
//! Clients start from the snapshot they receive on admission and then apply
//! the host's changes strictly in sequence; a gap drops the link.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod message;
pub mod node;
pub mod settings;
pub mod table;
pub mod transport;

// Re-export commonly used types
pub use message::{Message, MessageBody, MessageEnvelope, MessageError, RejectionReason};
pub use node::{
    DisconnectReason, NetworkRole, NetworkStatus, SecretBuffer, TableNetwork,
    TableNetworkConfiguration, TableNetworkController, TableNetworkError, TableNetworkEvent,
};
pub use settings::NetworkSettings;
pub use table::{InMemoryTable, Table, TableChange, TableMemento};
pub use transport::{TransportError, TransportLayer};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
