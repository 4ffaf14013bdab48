//! Host side of a table session: one `HostService` per connected client.

use std::net::SocketAddr;
use std::sync::Weak;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};
use uuid::Uuid;

use super::keep_alive::KeepAlive;
use super::Shared;
use crate::message::{Hello, HelloResponse, MessageBody, MessageEnvelope, RejectionReason};
use crate::transport::{Service, ServiceContext, TransportError, TransportLayerContext};

/// Transport callbacks for a hosting node.
pub(crate) struct HostContext {
    shared: Weak<Shared>,
    generation: u64,
}

impl HostContext {
    pub fn new(shared: Weak<Shared>, generation: u64) -> Self {
        Self { shared, generation }
    }
}

impl TransportLayerContext for HostContext {
    fn create_service(&self) -> Box<dyn Service> {
        let (handshake_timeout, keep_alive_interval, echo_timeout) = match self.shared.upgrade() {
            Some(shared) => (
                shared.settings.handshake_timeout,
                shared.settings.keep_alive_interval,
                shared.settings.echo_timeout,
            ),
            // Node is gone; the service stops as soon as it starts.
            None => (Duration::ZERO, Duration::ZERO, Duration::ZERO),
        };
        Box::new(HostService {
            shared: self.shared.clone(),
            generation: self.generation,
            handshake_timeout,
            keep_alive_interval,
            echo_timeout,
            connection_id: Uuid::nil(),
            phase: Phase::AwaitingHello {
                deadline: Instant::now() + handshake_timeout,
            },
        })
    }

    fn peer_connected(&self, peer: SocketAddr) {
        debug!("Client connected from {}", peer);
    }

    fn peer_disconnected(&self, peer: SocketAddr, error: Option<&TransportError>) {
        match error {
            Some(e) => debug!("Client {} disconnected: {}", peer, e),
            None => debug!("Client {} disconnected", peer),
        }
    }

    fn transport_layer_disconnected(&self, error: Option<&TransportError>) {
        if let Some(e) = error {
            warn!("Host listener stopped: {}", e);
        }
    }
}

enum Phase {
    /// Waiting for `Hello`. Nothing else is accepted before authentication.
    AwaitingHello { deadline: Instant },
    /// Player admitted.
    Admitted { player: String, keep_alive: KeepAlive },
    /// Rejected or failed; waiting for the connection to close.
    Closing,
}

/// Host-side protocol for one client link.
pub(crate) struct HostService {
    shared: Weak<Shared>,
    generation: u64,
    handshake_timeout: Duration,
    keep_alive_interval: Duration,
    echo_timeout: Duration,
    connection_id: Uuid,
    phase: Phase,
}

impl HostService {
    fn handle_hello(&mut self, ctx: &mut ServiceContext, request_id: u8, hello: Hello) {
        let Some(shared) = self.shared.upgrade() else {
            self.reject(ctx, request_id, RejectionReason::HostShuttingDown);
            return;
        };

        let admission = match shared.admit_peer(self.generation, &hello, ctx.handle()) {
            Ok(admission) => admission,
            Err(reason) => {
                info!(
                    "Rejected {} from {}: {}",
                    hello.player_name,
                    ctx.peer_addr(),
                    reason
                );
                self.reject(ctx, request_id, reason);
                return;
            }
        };

        let response = MessageBody::HelloResponse(HelloResponse::Accepted {
            protocol_version: admission.protocol_version,
            players: admission.players,
            snapshot: admission.snapshot,
        });
        if let Err(e) = ctx.reply(request_id, response) {
            warn!("Could not answer {}: {}", hello.player_name, e);
            ctx.fail(e.into());
        }

        info!("Player {} joined from {}", hello.player_name, ctx.peer_addr());
        self.phase = Phase::Admitted {
            player: hello.player_name.clone(),
            keep_alive: KeepAlive::new(self.keep_alive_interval, self.echo_timeout, Instant::now()),
        };
    }

    fn reject(&mut self, ctx: &mut ServiceContext, request_id: u8, reason: RejectionReason) {
        let response = MessageBody::HelloResponse(HelloResponse::Rejected { reason });
        if let Err(e) = ctx.reply(request_id, response) {
            debug!("Could not send rejection to {}: {}", ctx.peer_addr(), e);
        }
        ctx.stop_service();
        self.phase = Phase::Closing;
    }

    fn handle_admitted(&mut self, ctx: &mut ServiceContext, correlation_id: u8, body: MessageBody) {
        let Phase::Admitted { player, keep_alive } = &mut self.phase else {
            return;
        };

        match body {
            MessageBody::EchoResponse { content } => {
                keep_alive.on_response(correlation_id, &content, Instant::now());
            }
            MessageBody::ChangeTable { changes } => {
                let Some(shared) = self.shared.upgrade() else {
                    ctx.stop_service();
                    return;
                };
                if let Err(e) = shared.host_apply(self.generation, player, changes) {
                    warn!("Change from {} refused: {}", player, e);
                }
            }
            other => {
                ctx.fail(TransportError::Protocol(format!(
                    "unexpected {} from {}",
                    other.kind(),
                    player
                )));
            }
        }
    }
}

impl Service for HostService {
    fn started(&mut self, ctx: &mut ServiceContext) {
        self.connection_id = ctx.connection_id();
        self.phase = Phase::AwaitingHello {
            deadline: Instant::now() + self.handshake_timeout,
        };
        if self.shared.upgrade().is_none() {
            ctx.stop_service();
        }
    }

    fn message_received(&mut self, ctx: &mut ServiceContext, envelope: MessageEnvelope) {
        let message = match envelope.into_message() {
            Ok(message) => message,
            Err(e) => {
                ctx.fail(e.into());
                return;
            }
        };
        let request_id = message.id();
        let correlation_id = message.correlation_id();
        let body = message.into_body();

        if let MessageBody::Echo { content } = body {
            if let Err(e) = ctx.reply(request_id, MessageBody::EchoResponse { content }) {
                ctx.fail(e.into());
            }
            return;
        }

        match self.phase {
            Phase::AwaitingHello { .. } => match body {
                MessageBody::Hello(hello) => self.handle_hello(ctx, request_id, hello),
                other => {
                    debug!("{} from {} before hello", other.kind(), ctx.peer_addr());
                    self.reject(ctx, request_id, RejectionReason::UnexpectedMessage);
                }
            },
            Phase::Admitted { .. } => self.handle_admitted(ctx, correlation_id, body),
            Phase::Closing => {}
        }
    }

    fn peer_stopped(&mut self, ctx: &mut ServiceContext) {
        debug!("Client {} hung up", ctx.peer_addr());
    }

    fn stopped(&mut self, error: Option<&TransportError>) {
        if let Phase::Admitted { player, .. } = &self.phase {
            if let Some(e) = error {
                info!("Player {} dropped: {}", player, e);
            }
            if let Some(shared) = self.shared.upgrade() {
                shared.remove_peer(self.generation, player, self.connection_id);
            }
        }
        self.phase = Phase::Closing;
    }

    fn tick(&mut self, ctx: &mut ServiceContext) {
        let now = Instant::now();
        match &mut self.phase {
            Phase::AwaitingHello { deadline } => {
                if now >= *deadline {
                    warn!("Client {} never sent hello", ctx.peer_addr());
                    ctx.fail(TransportError::Protocol("handshake timed out".to_string()));
                }
            }
            Phase::Admitted { keep_alive, .. } => keep_alive.drive(ctx, now),
            Phase::Closing => {}
        }
    }
}
