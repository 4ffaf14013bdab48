//! Transport Layer
//!
//! TCP lifecycle for a node. A transport layer is either *active* (connects
//! out to one peer) or *passive* (listens and accepts peers); it knows
//! nothing about hosts or clients.
//!
//! Every transport layer runs on its own task. The public [`TransportLayer`]
//! is only a handle that submits commands to that task, so listener and
//! connection bookkeeping is never touched from two threads at once.

pub mod active;
pub mod connection;
pub mod passive;
pub mod service;

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use active::ActiveTransportLayerFactory;
pub use connection::ConnectionHandle;
pub use passive::PassiveTransportLayerFactory;
pub use service::{Service, ServiceContext};

use crate::message::MessageError;
use crate::settings::NetworkSettings;
use connection::{spawn_connection, ConnectionExit};

/// Transport errors.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed or oversized message.
    #[error("Message error: {0}")]
    Message(#[from] MessageError),

    /// Operation not allowed in the current state.
    #[error("Transport layer is {0:?}")]
    InvalidState(TransportState),

    /// Transport layer or connection already closed.
    #[error("Transport closed")]
    Closed,

    /// Outbound queue of a connection is full.
    #[error("Outbound queue full")]
    QueueFull,

    /// Outbound connect did not finish in time.
    #[error("Connect to {0} timed out")]
    ConnectTimedOut(String),

    /// Peer did not answer an echo, or take our frames, in time.
    #[error("Peer did not answer within {0:?}")]
    PeerTimeout(Duration),

    /// Peer broke the protocol.
    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// Transport layer lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    /// Created, not yet opened.
    Pristine,
    /// Connected (active) or listening (passive).
    Open,
    /// Shut down.
    Closed,
}

/// Connection direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Outbound connector.
    Active,
    /// Inbound listener.
    Passive,
}

/// Callbacks from a transport layer to its owner.
///
/// Called from transport and connection tasks; implementations must not
/// block.
pub trait TransportLayerContext: Send + Sync + 'static {
    /// Create the service for a new connection.
    fn create_service(&self) -> Box<dyn Service>;

    /// A connection was established.
    fn peer_connected(&self, _peer: SocketAddr) {}

    /// A connection ended.
    fn peer_disconnected(&self, _peer: SocketAddr, _error: Option<&TransportError>) {}

    /// The transport layer itself closed.
    fn transport_layer_disconnected(&self, _error: Option<&TransportError>) {}
}

/// Creates transport layers.
pub trait TransportLayerFactory: Send + Sync {
    /// Create a transport layer in the `Pristine` state.
    ///
    /// Must be called from within a Tokio runtime.
    fn create_transport_layer(
        &self,
        context: Arc<dyn TransportLayerContext>,
        settings: NetworkSettings,
    ) -> TransportLayer;
}

enum TransportCommand {
    Open {
        host_name: String,
        port: u16,
        reply: oneshot::Sender<Result<SocketAddr, TransportError>>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
    State {
        reply: oneshot::Sender<TransportState>,
    },
    LocalAddr {
        reply: oneshot::Sender<Option<SocketAddr>>,
    },
    Connections {
        reply: oneshot::Sender<Vec<ConnectionHandle>>,
    },
}

/// Handle to a transport layer task.
#[derive(Clone)]
pub struct TransportLayer {
    kind: TransportKind,
    commands: mpsc::UnboundedSender<TransportCommand>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl TransportLayer {
    pub(crate) fn spawn(
        kind: TransportKind,
        context: Arc<dyn TransportLayerContext>,
        settings: NetworkSettings,
    ) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (exits_tx, exits_rx) = mpsc::unbounded_channel();

        let driver = TransportDriver {
            kind,
            context,
            settings,
            state: TransportState::Pristine,
            listener: None,
            local_addr: None,
            connections: BTreeMap::new(),
            commands: commands_rx,
            exits_tx,
            exits_rx,
        };
        let task = tokio::spawn(driver.run());

        Self {
            kind,
            commands: commands_tx,
            task: Arc::new(Mutex::new(Some(task))),
        }
    }

    /// Connection direction.
    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    /// Connect (active) or bind (passive). Returns the peer address for an
    /// active layer and the bound address for a passive one.
    pub async fn open(&self, host_name: &str, port: u16) -> Result<SocketAddr, TransportError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(TransportCommand::Open {
                host_name: host_name.to_string(),
                port,
                reply,
            })
            .map_err(|_| TransportError::InvalidState(TransportState::Closed))?;
        rx.await
            .map_err(|_| TransportError::InvalidState(TransportState::Closed))?
    }

    /// Close the layer and every connection on it. Idempotent.
    pub async fn close(&self) {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(TransportCommand::Close { reply }).is_ok() {
            let _ = rx.await;
        }

        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> TransportState {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(TransportCommand::State { reply }).is_err() {
            return TransportState::Closed;
        }
        rx.await.unwrap_or(TransportState::Closed)
    }

    /// Bound address of a passive layer, local address of an active one.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(TransportCommand::LocalAddr { reply })
            .ok()?;
        rx.await.ok().flatten()
    }

    /// Handles to the live connections.
    pub async fn connections(&self) -> Vec<ConnectionHandle> {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(TransportCommand::Connections { reply }).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }
}

impl std::fmt::Debug for TransportLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportLayer")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// TRANSPORT TASK
// =============================================================================

struct TransportDriver {
    kind: TransportKind,
    context: Arc<dyn TransportLayerContext>,
    settings: NetworkSettings,
    state: TransportState,
    listener: Option<TcpListener>,
    local_addr: Option<SocketAddr>,
    connections: BTreeMap<Uuid, (ConnectionHandle, JoinHandle<()>)>,
    commands: mpsc::UnboundedReceiver<TransportCommand>,
    exits_tx: mpsc::UnboundedSender<ConnectionExit>,
    exits_rx: mpsc::UnboundedReceiver<ConnectionExit>,
}

impl TransportDriver {
    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    let flow = match command {
                        Some(command) => self.handle_command(command).await,
                        None => {
                            self.shutdown().await;
                            ControlFlow::Break(())
                        }
                    };
                    if flow.is_break() {
                        break;
                    }
                }
                accepted = accept(self.listener.as_ref()) => match accepted {
                    Ok((stream, peer_addr)) => {
                        info!("Accepted connection from {}", peer_addr);
                        self.start_connection(stream, peer_addr);
                    }
                    Err(e) => warn!("Accept error: {}", e),
                },
                Some(exit) = self.exits_rx.recv() => {
                    if self.connection_exited(exit).is_break() {
                        break;
                    }
                }
            }
        }
        debug!("{:?} transport layer task finished", self.kind);
    }

    async fn handle_command(&mut self, command: TransportCommand) -> ControlFlow<()> {
        match command {
            TransportCommand::Open {
                host_name,
                port,
                reply,
            } => {
                if self.state != TransportState::Pristine {
                    let _ = reply.send(Err(TransportError::InvalidState(self.state)));
                    return ControlFlow::Continue(());
                }
                match self.kind {
                    TransportKind::Passive => {
                        let result = self.open_passive(&host_name, port).await;
                        let _ = reply.send(result);
                        ControlFlow::Continue(())
                    }
                    TransportKind::Active => self.open_active(host_name, port, reply).await,
                }
            }
            TransportCommand::Close { reply } => {
                self.shutdown().await;
                let _ = reply.send(());
                ControlFlow::Break(())
            }
            query => {
                self.answer(query);
                ControlFlow::Continue(())
            }
        }
    }

    /// Answer commands that only read state.
    fn answer(&self, command: TransportCommand) {
        match command {
            TransportCommand::State { reply } => {
                let _ = reply.send(self.state);
            }
            TransportCommand::LocalAddr { reply } => {
                let _ = reply.send(self.local_addr);
            }
            TransportCommand::Connections { reply } => {
                let handles = self
                    .connections
                    .values()
                    .map(|(handle, _)| handle.clone())
                    .collect();
                let _ = reply.send(handles);
            }
            TransportCommand::Open { reply, .. } => {
                let _ = reply.send(Err(TransportError::InvalidState(self.state)));
            }
            TransportCommand::Close { reply } => {
                let _ = reply.send(());
            }
        }
    }

    async fn open_passive(&mut self, host_name: &str, port: u16) -> Result<SocketAddr, TransportError> {
        let listener = passive::bind(host_name, port).await?;
        let local_addr = listener.local_addr()?;
        self.listener = Some(listener);
        self.local_addr = Some(local_addr);
        self.state = TransportState::Open;
        info!("Listening on {}", local_addr);
        Ok(local_addr)
    }

    /// Connect while still answering commands; a close cancels the attempt.
    async fn open_active(
        &mut self,
        host_name: String,
        port: u16,
        reply: oneshot::Sender<Result<SocketAddr, TransportError>>,
    ) -> ControlFlow<()> {
        let connect = active::connect(&host_name, port, self.settings.connect_timeout);
        tokio::pin!(connect);

        loop {
            tokio::select! {
                result = &mut connect => {
                    let result = result.map(|(stream, peer_addr)| {
                        self.local_addr = stream.local_addr().ok();
                        self.start_connection(stream, peer_addr);
                        self.state = TransportState::Open;
                        peer_addr
                    });
                    if let Err(e) = &result {
                        warn!("Connect to {}:{} failed: {}", host_name, port, e);
                    }
                    let _ = reply.send(result);
                    return ControlFlow::Continue(());
                }
                command = self.commands.recv() => match command {
                    Some(TransportCommand::Close { reply: close_reply }) => {
                        debug!("Connect to {}:{} cancelled", host_name, port);
                        let _ = reply.send(Err(TransportError::Closed));
                        self.shutdown().await;
                        let _ = close_reply.send(());
                        return ControlFlow::Break(());
                    }
                    Some(query) => self.answer(query),
                    None => {
                        let _ = reply.send(Err(TransportError::Closed));
                        self.shutdown().await;
                        return ControlFlow::Break(());
                    }
                },
            }
        }
    }

    fn start_connection(&mut self, stream: TcpStream, peer_addr: SocketAddr) {
        let service = self.context.create_service();
        let (handle, task) = spawn_connection(
            stream,
            peer_addr,
            service,
            self.context.clone(),
            &self.settings,
            self.exits_tx.clone(),
        );
        self.connections.insert(handle.id(), (handle, task));
        self.context.peer_connected(peer_addr);
    }

    fn connection_exited(&mut self, exit: ConnectionExit) -> ControlFlow<()> {
        self.connections.remove(&exit.id);
        debug!("Connection {} to {} exited", exit.id, exit.peer_addr);

        if self.kind == TransportKind::Active {
            // The only connection is gone; so is the layer.
            self.state = TransportState::Closed;
            self.context.transport_layer_disconnected(exit.error.as_ref());
            return ControlFlow::Break(());
        }
        ControlFlow::Continue(())
    }

    async fn shutdown(&mut self) {
        if self.state == TransportState::Closed && self.connections.is_empty() {
            return;
        }
        self.state = TransportState::Closed;
        self.listener = None;

        let connections = std::mem::take(&mut self.connections);
        for (handle, _) in connections.values() {
            handle.close();
        }
        // A closing connection spends at most one echo timeout on its final writes.
        let grace = self.settings.echo_timeout.saturating_mul(2);
        for (id, (_, mut task)) in connections {
            let finished = tokio::time::timeout(grace, &mut task).await;
            if finished.is_err() {
                warn!("Connection {} did not stop in time; aborting", id);
                task.abort();
            }
        }

        self.context.transport_layer_disconnected(None);
        info!("{:?} transport layer closed", self.kind);
    }
}

async fn accept(listener: Option<&TcpListener>) -> std::io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(listener) => listener.accept().await,
        None => std::future::pending().await,
    }
}
