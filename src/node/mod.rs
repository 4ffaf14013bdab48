//! Table Network Node
//!
//! A node either hosts a table (passive transport, many clients) or joins one
//! (active transport, one host). The host is authoritative: it admits players,
//! orders table changes and broadcasts them; clients mirror its state.
//!
//! ## Session lifecycle
//!
//! ```text
//!   Offline ──host()/join()──▶ Connecting ──admitted──▶ Online
//!      ▲                           │                      │
//!      └───── failure / rejection ─┴──── disconnect() ────┘
//! ```
//!
//! Every session gets a fresh generation number. Callbacks from transport
//! tasks carry the generation they were created under and are ignored once
//! the session they belong to has ended.

mod client;
pub mod config;
mod error;
mod host;
mod keep_alive;
mod roster;

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tokio::sync::{broadcast, oneshot};
use tokio::time::timeout;
use tracing::{debug, info, warn};

pub use config::{
    ConfigurationError, SecretBuffer, TableNetworkConfiguration, TableNetworkConfigurationBuilder,
};
pub use error::TableNetworkError;

use crate::message::{
    choose_protocol_version, Hello, MessageBody, MessageError, RejectionReason, TableChanged,
    TableSnapshot, SUPPORTED_PROTOCOL_VERSIONS,
};
use crate::settings::NetworkSettings;
use crate::table::{Table, TableChange};
use crate::transport::{
    ActiveTransportLayerFactory, ConnectionHandle, PassiveTransportLayerFactory, TransportError,
    TransportLayer, TransportLayerFactory,
};
use client::ClientContext;
use host::HostContext;
use roster::Roster;

const EVENT_CAPACITY: usize = 256;

/// Role of the local node in the current session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkRole {
    /// Authoritative owner of the table.
    Host,
    /// Mirror of a remote host's table.
    Client,
}

/// Connection status of the local node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum NetworkStatus {
    /// No session.
    #[default]
    Offline,
    /// Opening the transport or waiting for admission.
    Connecting,
    /// Session established.
    Online,
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DisconnectReason {
    /// Local `disconnect` call.
    #[error("disconnect requested")]
    Requested,
    /// Host refused the join.
    #[error("rejected: {0}")]
    Rejected(RejectionReason),
    /// Host announced it is closing the table.
    #[error("host closed the table")]
    HostClosed,
    /// Transport failed.
    #[error("connection lost: {0}")]
    ConnectionLost(String),
}

/// Notifications published by a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableNetworkEvent {
    /// Local status changed.
    StatusChanged(NetworkStatus),
    /// A remote player was admitted (host only).
    PlayerJoined(String),
    /// A remote player left (host only).
    PlayerLeft(String),
    /// Roster changed.
    PlayersUpdated(Vec<String>),
    /// Local table replaced by the host's snapshot (client only).
    TableSynchronized {
        /// Sequence number of the snapshot.
        sequence: u64,
    },
    /// A table change was applied locally.
    TableChanged {
        /// Sequence number assigned by the host.
        sequence: u64,
        /// Player who requested the change.
        origin: String,
    },
    /// Session ended.
    Disconnected(DisconnectReason),
}

/// Operations on a table network node.
#[allow(async_fn_in_trait)]
pub trait TableNetworkController {
    /// Start hosting a table. Returns the bound listener address.
    async fn host(&self, config: TableNetworkConfiguration) -> Result<SocketAddr, TableNetworkError>;

    /// Join a hosted table. Resolves once the host admits or refuses us.
    async fn join(&self, config: TableNetworkConfiguration) -> Result<(), TableNetworkError>;

    /// End the current session. Does nothing when offline.
    async fn disconnect(&self);

    /// Names of all players in the session, sorted. Empty when offline.
    fn players(&self) -> Vec<String>;

    /// True while the session is online.
    fn is_connected(&self) -> bool;

    /// Current status.
    fn status(&self) -> NetworkStatus;

    /// Current role, `None` when offline.
    fn role(&self) -> Option<NetworkRole>;

    /// Subscribe to node events.
    fn subscribe(&self) -> broadcast::Receiver<TableNetworkEvent>;

    /// Change the shared table. The host applies and broadcasts the change;
    /// a client forwards it to the host.
    fn change_table(&self, changes: Vec<TableChange>) -> Result<(), TableNetworkError>;
}

#[derive(Default)]
struct Session {
    generation: u64,
    role: Option<NetworkRole>,
    status: NetworkStatus,
    transport: Option<TransportLayer>,
    local_player: Option<String>,
    table: Option<Arc<dyn Table>>,
    password: Option<SecretBuffer>,
    /// Host roster.
    roster: Roster,
    /// Client view of the roster.
    players: Vec<String>,
    sequence: u64,
    host_link: Option<ConnectionHandle>,
    pending_join: Option<oneshot::Sender<Result<(), TableNetworkError>>>,
    last_disconnect: Option<DisconnectReason>,
}

/// Admission granted to a client.
pub(crate) struct Admission {
    pub protocol_version: u32,
    pub players: Vec<String>,
    pub snapshot: TableSnapshot,
}

/// State shared between the controller and the transport callbacks.
pub(crate) struct Shared {
    settings: NetworkSettings,
    session: Mutex<Session>,
    events: broadcast::Sender<TableNetworkEvent>,
}

impl Shared {
    fn emit(&self, event: TableNetworkEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Lock the session if it is still `generation`.
    fn session(&self, generation: u64) -> Option<MutexGuard<'_, Session>> {
        let session = self.session.lock();
        (session.generation == generation).then_some(session)
    }

    /// End the current session. Returns the transport for the caller to close
    /// once the lock is released.
    fn end_session(&self, session: &mut Session, reason: DisconnectReason) -> Option<TransportLayer> {
        if session.role == Some(NetworkRole::Host) {
            session.roster.broadcast(&MessageBody::Goodbye, None);
        }

        let was_offline = session.status == NetworkStatus::Offline;
        session.generation += 1;
        session.role = None;
        session.status = NetworkStatus::Offline;
        session.local_player = None;
        session.table = None;
        session.password = None;
        session.roster.reset(None);
        session.players.clear();
        session.host_link = None;
        if let Some(pending) = session.pending_join.take() {
            let _ = pending.send(Err(TableNetworkError::from(&reason)));
        }
        let transport = session.transport.take();

        if !was_offline {
            info!("Session ended: {}", reason);
            self.emit(TableNetworkEvent::StatusChanged(NetworkStatus::Offline));
            self.emit(TableNetworkEvent::Disconnected(reason.clone()));
        }
        session.last_disconnect = Some(reason);
        transport
    }

    // -------------------------------------------------------------------------
    // Host side
    // -------------------------------------------------------------------------

    /// Validate a `Hello` and admit the player.
    ///
    /// Checks run in a fixed order: protocol version, password, player name.
    pub(crate) fn admit_peer(
        &self,
        generation: u64,
        hello: &Hello,
        handle: ConnectionHandle,
    ) -> Result<Admission, RejectionReason> {
        let mut session = self
            .session(generation)
            .ok_or(RejectionReason::HostShuttingDown)?;
        if session.role != Some(NetworkRole::Host) {
            return Err(RejectionReason::HostShuttingDown);
        }

        let protocol_version = choose_protocol_version(&hello.supported_protocol_versions)
            .ok_or(RejectionReason::UnsupportedProtocolVersion)?;

        let authenticated = session
            .password
            .as_ref()
            .map(|password| password.matches(&hello.password))
            .unwrap_or(false);
        if !authenticated {
            return Err(RejectionReason::AuthenticationFailed);
        }

        let table = session
            .table
            .clone()
            .ok_or(RejectionReason::HostShuttingDown)?;

        session.roster.admit(&hello.player_name, handle)?;
        let players = session.roster.names();
        let snapshot = TableSnapshot::new(session.sequence, table.memento());

        session.roster.broadcast(
            &MessageBody::PlayersUpdated {
                players: players.clone(),
            },
            Some(&hello.player_name),
        );
        self.emit(TableNetworkEvent::PlayerJoined(hello.player_name.clone()));
        self.emit(TableNetworkEvent::PlayersUpdated(players.clone()));

        Ok(Admission {
            protocol_version,
            players,
            snapshot,
        })
    }

    /// Drop a departed player and tell the others.
    pub(crate) fn remove_peer(&self, generation: u64, name: &str, connection_id: uuid::Uuid) {
        let Some(mut session) = self.session(generation) else {
            return;
        };
        if !session.roster.remove(name, connection_id) {
            return;
        }

        let players = session.roster.names();
        session.roster.broadcast(
            &MessageBody::PlayersUpdated {
                players: players.clone(),
            },
            None,
        );
        info!("Player {} left", name);
        self.emit(TableNetworkEvent::PlayerLeft(name.to_string()));
        self.emit(TableNetworkEvent::PlayersUpdated(players));
    }

    /// Apply a change on the host and broadcast it. Returns the new sequence
    /// number.
    pub(crate) fn host_apply(
        &self,
        generation: u64,
        origin: &str,
        changes: Vec<TableChange>,
    ) -> Result<u64, TableNetworkError> {
        let mut session = self
            .session(generation)
            .ok_or(TableNetworkError::NotConnected)?;
        let sequence =
            host_apply_locked(&mut session, origin, changes, self.settings.max_frame_length)?;
        self.emit(TableNetworkEvent::TableChanged {
            sequence,
            origin: origin.to_string(),
        });
        Ok(sequence)
    }

    // -------------------------------------------------------------------------
    // Client side
    // -------------------------------------------------------------------------

    /// Build the `Hello` for the current join attempt.
    pub(crate) fn client_hello(&self, generation: u64) -> Option<Hello> {
        let session = self.session(generation)?;
        let player_name = session.local_player.clone()?;
        let password = session.password.as_ref()?.expose().to_vec();
        Some(Hello {
            supported_protocol_versions: SUPPORTED_PROTOCOL_VERSIONS.to_vec(),
            player_name,
            password,
        })
    }

    /// Host admitted us: install its snapshot and go online.
    pub(crate) fn client_accepted(
        &self,
        generation: u64,
        players: Vec<String>,
        snapshot: TableSnapshot,
        host_link: ConnectionHandle,
    ) -> Result<(), TransportError> {
        let mut session = self.session(generation).ok_or(TransportError::Closed)?;
        if session.role != Some(NetworkRole::Client) || session.status != NetworkStatus::Connecting {
            return Err(TransportError::Protocol("unexpected admission".to_string()));
        }
        let table = session.table.clone().ok_or(TransportError::Closed)?;

        table.restore(&snapshot.memento);
        session.sequence = snapshot.sequence;
        session.players = players.clone();
        session.host_link = Some(host_link);
        session.status = NetworkStatus::Online;
        // Only needed for the handshake.
        session.password = None;
        if let Some(pending) = session.pending_join.take() {
            let _ = pending.send(Ok(()));
        }

        info!(
            "Joined table as {} at sequence {}",
            session.local_player.as_deref().unwrap_or_default(),
            snapshot.sequence
        );
        self.emit(TableNetworkEvent::TableSynchronized {
            sequence: snapshot.sequence,
        });
        self.emit(TableNetworkEvent::PlayersUpdated(players));
        self.emit(TableNetworkEvent::StatusChanged(NetworkStatus::Online));
        Ok(())
    }

    pub(crate) fn client_players(&self, generation: u64, players: Vec<String>) {
        let Some(mut session) = self.session(generation) else {
            return;
        };
        session.players = players.clone();
        self.emit(TableNetworkEvent::PlayersUpdated(players));
    }

    /// Apply a change broadcast by the host. Changes must arrive in sequence.
    pub(crate) fn client_table_changed(
        &self,
        generation: u64,
        changed: TableChanged,
    ) -> Result<(), TransportError> {
        let Some(mut session) = self.session(generation) else {
            return Ok(());
        };
        let expected = session.sequence + 1;
        if changed.sequence != expected {
            return Err(TransportError::Protocol(format!(
                "table change {} out of order, expected {}",
                changed.sequence, expected
            )));
        }
        let table = session.table.clone().ok_or(TransportError::Closed)?;
        table
            .apply(&changed.changes)
            .map_err(|e| TransportError::Protocol(format!("host sent bad change: {}", e)))?;

        session.sequence = changed.sequence;
        self.emit(TableNetworkEvent::TableChanged {
            sequence: changed.sequence,
            origin: changed.origin,
        });
        Ok(())
    }

    /// The client session is over. Loss of the host link always ends the
    /// client session.
    pub(crate) fn client_lost(&self, generation: u64, reason: DisconnectReason) {
        let Some(mut session) = self.session(generation) else {
            return;
        };
        // The transport is already shutting down on its own.
        drop(self.end_session(&mut session, reason));
    }
}

/// Apply a change on the host and broadcast it. A change whose broadcast
/// would not fit in a frame is refused before the table is touched.
fn host_apply_locked(
    session: &mut Session,
    origin: &str,
    changes: Vec<TableChange>,
    max_frame_length: usize,
) -> Result<u64, TableNetworkError> {
    if session.role != Some(NetworkRole::Host) || session.status != NetworkStatus::Online {
        return Err(TableNetworkError::NotConnected);
    }
    let table = session.table.clone().ok_or(TableNetworkError::NotConnected)?;

    let sequence = session.sequence + 1;
    let body = MessageBody::TableChanged(TableChanged {
        sequence,
        origin: origin.to_string(),
        changes: changes.clone(),
    });
    ensure_frame_fits(&body, max_frame_length)?;
    table.apply(&changes)?;

    session.sequence = sequence;
    session.roster.broadcast(&body, None);
    debug!("Applied table change {} from {}", sequence, origin);
    Ok(sequence)
}

fn ensure_frame_fits(body: &MessageBody, max_frame_length: usize) -> Result<(), TableNetworkError> {
    let size = body.frame_length().map_err(TransportError::from)?;
    if size > max_frame_length {
        return Err(TransportError::from(MessageError::FrameTooLarge {
            size,
            max_size: max_frame_length,
        })
        .into());
    }
    Ok(())
}

/// A table network node.
///
/// Cheap to clone; clones control the same node.
#[derive(Clone)]
pub struct TableNetwork {
    shared: Arc<Shared>,
}

impl TableNetwork {
    /// Create an offline node.
    pub fn new(settings: NetworkSettings) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                settings,
                session: Mutex::new(Session::default()),
                events,
            }),
        }
    }

    /// Why the last session ended, if one did.
    pub fn last_disconnect_reason(&self) -> Option<DisconnectReason> {
        self.shared.session.lock().last_disconnect.clone()
    }

    /// Sequence number of the last table change applied locally.
    pub fn table_sequence(&self) -> u64 {
        self.shared.session.lock().sequence
    }

    /// Settings this node was created with.
    pub fn settings(&self) -> &NetworkSettings {
        &self.shared.settings
    }

    /// Start a session and its transport. Fails if one is already active.
    fn begin_session(
        &self,
        role: NetworkRole,
        player: String,
        table: Arc<dyn Table>,
        password: SecretBuffer,
        pending_join: Option<oneshot::Sender<Result<(), TableNetworkError>>>,
    ) -> Result<(u64, TransportLayer), TableNetworkError> {
        let mut session = self.shared.session.lock();
        if session.status != NetworkStatus::Offline {
            return Err(TableNetworkError::AlreadyConnected);
        }

        session.generation += 1;
        let generation = session.generation;
        session.role = Some(role);
        session.status = NetworkStatus::Connecting;
        session.local_player = Some(player.clone());
        session.table = Some(table);
        session.password = Some(password);
        session.roster.reset(match role {
            NetworkRole::Host => Some(player),
            NetworkRole::Client => None,
        });
        session.players.clear();
        session.sequence = 0;
        session.host_link = None;
        session.pending_join = pending_join;
        session.last_disconnect = None;

        let weak = Arc::downgrade(&self.shared);
        let settings = self.shared.settings.clone();
        let transport = match role {
            NetworkRole::Host => PassiveTransportLayerFactory
                .create_transport_layer(Arc::new(HostContext::new(weak, generation)), settings),
            NetworkRole::Client => ActiveTransportLayerFactory
                .create_transport_layer(Arc::new(ClientContext::new(weak, generation)), settings),
        };
        session.transport = Some(transport.clone());
        self.shared
            .emit(TableNetworkEvent::StatusChanged(NetworkStatus::Connecting));

        Ok((generation, transport))
    }

    /// Abandon a session that failed to start.
    async fn abort_session(&self, generation: u64, reason: DisconnectReason, transport: TransportLayer) {
        let ended = self
            .shared
            .session(generation)
            .map(|mut session| self.shared.end_session(&mut session, reason));
        drop(ended);
        transport.close().await;
    }
}

impl Default for TableNetwork {
    fn default() -> Self {
        Self::new(NetworkSettings::default())
    }
}

impl TableNetworkController for TableNetwork {
    async fn host(&self, config: TableNetworkConfiguration) -> Result<SocketAddr, TableNetworkError> {
        let parts = config.into_parts();
        let (generation, transport) = self.begin_session(
            NetworkRole::Host,
            parts.local_player_name,
            parts.local_table,
            parts.password,
            None,
        )?;

        let addr = match transport.open(&parts.host_name, parts.port).await {
            Ok(addr) => addr,
            Err(e) => {
                warn!("Failed to host on {}:{}: {}", parts.host_name, parts.port, e);
                self.abort_session(generation, DisconnectReason::ConnectionLost(e.to_string()), transport)
                    .await;
                return Err(e.into());
            }
        };

        {
            let Some(mut session) = self.shared.session(generation) else {
                // disconnect() won the race; it closes the transport.
                return Err(TableNetworkError::NotConnected);
            };
            session.status = NetworkStatus::Online;
            self.shared
                .emit(TableNetworkEvent::StatusChanged(NetworkStatus::Online));
            self.shared
                .emit(TableNetworkEvent::PlayersUpdated(session.roster.names()));
        }

        info!("Hosting table on {}", addr);
        Ok(addr)
    }

    async fn join(&self, config: TableNetworkConfiguration) -> Result<(), TableNetworkError> {
        let parts = config.into_parts();
        let (pending_tx, pending_rx) = oneshot::channel();
        let (generation, transport) = self.begin_session(
            NetworkRole::Client,
            parts.local_player_name,
            parts.local_table,
            parts.password,
            Some(pending_tx),
        )?;

        if let Err(e) = transport.open(&parts.host_name, parts.port).await {
            warn!("Failed to join {}:{}: {}", parts.host_name, parts.port, e);
            self.abort_session(generation, DisconnectReason::ConnectionLost(e.to_string()), transport)
                .await;
            return Err(e.into());
        }

        match timeout(self.shared.settings.join_timeout, pending_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TableNetworkError::NotConnected),
            Err(_) => {
                warn!("Host {}:{} did not answer in time", parts.host_name, parts.port);
                self.abort_session(
                    generation,
                    DisconnectReason::ConnectionLost("join timed out".to_string()),
                    transport,
                )
                .await;
                Err(TableNetworkError::JoinTimedOut)
            }
        }
    }

    async fn disconnect(&self) {
        let transport = {
            let mut session = self.shared.session.lock();
            if session.status == NetworkStatus::Offline && session.transport.is_none() {
                return;
            }
            self.shared
                .end_session(&mut session, DisconnectReason::Requested)
        };
        if let Some(transport) = transport {
            transport.close().await;
        }
    }

    fn players(&self) -> Vec<String> {
        let session = self.shared.session.lock();
        match (session.role, session.status) {
            (Some(NetworkRole::Host), NetworkStatus::Online) => session.roster.names(),
            (Some(NetworkRole::Client), NetworkStatus::Online) => session.players.clone(),
            _ => Vec::new(),
        }
    }

    fn is_connected(&self) -> bool {
        self.shared.session.lock().status == NetworkStatus::Online
    }

    fn status(&self) -> NetworkStatus {
        self.shared.session.lock().status
    }

    fn role(&self) -> Option<NetworkRole> {
        self.shared.session.lock().role
    }

    fn subscribe(&self) -> broadcast::Receiver<TableNetworkEvent> {
        self.shared.events.subscribe()
    }

    fn change_table(&self, changes: Vec<TableChange>) -> Result<(), TableNetworkError> {
        let mut session = self.shared.session.lock();
        if session.status != NetworkStatus::Online {
            return Err(TableNetworkError::NotConnected);
        }
        match session.role {
            Some(NetworkRole::Host) => {
                let origin = session.local_player.clone().unwrap_or_default();
                let sequence = host_apply_locked(
                    &mut session,
                    &origin,
                    changes,
                    self.shared.settings.max_frame_length,
                )?;
                self.shared
                    .emit(TableNetworkEvent::TableChanged { sequence, origin });
                Ok(())
            }
            Some(NetworkRole::Client) => {
                let link = session
                    .host_link
                    .as_ref()
                    .ok_or(TableNetworkError::NotConnected)?;
                let body = MessageBody::ChangeTable { changes };
                ensure_frame_fits(&body, self.shared.settings.max_frame_length)?;
                link.send(body)?;
                Ok(())
            }
            None => Err(TableNetworkError::NotConnected),
        }
    }
}
