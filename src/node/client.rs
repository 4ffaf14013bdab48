//! Client side of a table session: a single `ClientService` on the link to the
//! host.

use std::net::SocketAddr;
use std::sync::Weak;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::keep_alive::KeepAlive;
use super::{DisconnectReason, Shared};
use crate::message::{HelloResponse, MessageBody, MessageEnvelope};
use crate::transport::{Service, ServiceContext, TransportError, TransportLayerContext};

/// Transport callbacks for a joining node.
pub(crate) struct ClientContext {
    shared: Weak<Shared>,
    generation: u64,
}

impl ClientContext {
    pub fn new(shared: Weak<Shared>, generation: u64) -> Self {
        Self { shared, generation }
    }
}

impl TransportLayerContext for ClientContext {
    fn create_service(&self) -> Box<dyn Service> {
        let (keep_alive_interval, echo_timeout) = match self.shared.upgrade() {
            Some(shared) => (
                shared.settings.keep_alive_interval,
                shared.settings.echo_timeout,
            ),
            None => (Duration::ZERO, Duration::ZERO),
        };
        Box::new(ClientService {
            shared: self.shared.clone(),
            generation: self.generation,
            keep_alive_interval,
            echo_timeout,
            phase: Phase::Connecting,
        })
    }

    fn peer_connected(&self, peer: SocketAddr) {
        debug!("Connected to host {}", peer);
    }

    fn transport_layer_disconnected(&self, error: Option<&TransportError>) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let reason = match error {
            Some(e) => DisconnectReason::ConnectionLost(e.to_string()),
            None => DisconnectReason::ConnectionLost("connection closed by host".to_string()),
        };
        shared.client_lost(self.generation, reason);
    }
}

enum Phase {
    Connecting,
    /// `Hello` sent under this id.
    Greeting { hello_id: u8 },
    Joined { keep_alive: KeepAlive },
    Closing,
}

/// Client-side protocol on the link to the host.
pub(crate) struct ClientService {
    shared: Weak<Shared>,
    generation: u64,
    keep_alive_interval: Duration,
    echo_timeout: Duration,
    phase: Phase,
}

impl ClientService {
    fn end(&mut self, ctx: &mut ServiceContext, reason: DisconnectReason) {
        if let Some(shared) = self.shared.upgrade() {
            shared.client_lost(self.generation, reason);
        }
        ctx.stop_service();
        self.phase = Phase::Closing;
    }

    fn handle_hello_response(&mut self, ctx: &mut ServiceContext, response: HelloResponse) {
        let Some(shared) = self.shared.upgrade() else {
            ctx.stop_service();
            return;
        };

        match response {
            HelloResponse::Accepted {
                protocol_version,
                players,
                snapshot,
            } => {
                if !snapshot.verify() {
                    ctx.fail(TransportError::Protocol("table snapshot digest mismatch".to_string()));
                    self.phase = Phase::Closing;
                    return;
                }
                debug!("Host accepted us with protocol version {}", protocol_version);
                match shared.client_accepted(self.generation, players, snapshot, ctx.handle()) {
                    Ok(()) => {
                        self.phase = Phase::Joined {
                            keep_alive: KeepAlive::new(
                                self.keep_alive_interval,
                                self.echo_timeout,
                                Instant::now(),
                            ),
                        };
                    }
                    Err(e) => {
                        debug!("Admission arrived for a finished session: {}", e);
                        ctx.stop_service();
                        self.phase = Phase::Closing;
                    }
                }
            }
            HelloResponse::Rejected { reason } => {
                info!("Host rejected us: {}", reason);
                self.end(ctx, DisconnectReason::Rejected(reason));
            }
        }
    }

    fn handle_joined(&mut self, ctx: &mut ServiceContext, correlation_id: u8, body: MessageBody) {
        let Some(shared) = self.shared.upgrade() else {
            ctx.stop_service();
            return;
        };

        match body {
            MessageBody::EchoResponse { content } => {
                if let Phase::Joined { keep_alive } = &mut self.phase {
                    keep_alive.on_response(correlation_id, &content, Instant::now());
                }
            }
            MessageBody::PlayersUpdated { players } => {
                shared.client_players(self.generation, players);
            }
            MessageBody::TableChanged(changed) => {
                if let Err(e) = shared.client_table_changed(self.generation, changed) {
                    warn!("Dropping link to host: {}", e);
                    ctx.fail(e);
                }
            }
            MessageBody::Goodbye => {
                info!("Host closed the table");
                self.end(ctx, DisconnectReason::HostClosed);
            }
            other => {
                ctx.fail(TransportError::Protocol(format!(
                    "unexpected {} from host",
                    other.kind()
                )));
            }
        }
    }
}

impl Service for ClientService {
    fn started(&mut self, ctx: &mut ServiceContext) {
        let hello = self
            .shared
            .upgrade()
            .and_then(|shared| shared.client_hello(self.generation));
        let Some(hello) = hello else {
            ctx.stop_service();
            self.phase = Phase::Closing;
            return;
        };

        match ctx.send(MessageBody::Hello(hello)) {
            Ok(hello_id) => self.phase = Phase::Greeting { hello_id },
            Err(e) => {
                ctx.fail(e.into());
                self.phase = Phase::Closing;
            }
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
            Phase::Greeting { hello_id } => match body {
                MessageBody::HelloResponse(response) if correlation_id == hello_id => {
                    self.handle_hello_response(ctx, response)
                }
                other => ctx.fail(TransportError::Protocol(format!(
                    "expected hello response, got {}",
                    other.kind()
                ))),
            },
            Phase::Joined { .. } => self.handle_joined(ctx, correlation_id, body),
            Phase::Connecting | Phase::Closing => {}
        }
    }

    fn peer_stopped(&mut self, _ctx: &mut ServiceContext) {
        debug!("Host hung up");
    }

    fn stopped(&mut self, error: Option<&TransportError>) {
        if let Some(e) = error {
            debug!("Link to host failed: {}", e);
        }
        self.phase = Phase::Closing;
    }

    fn tick(&mut self, ctx: &mut ServiceContext) {
        if let Phase::Joined { keep_alive } = &mut self.phase {
            keep_alive.drive(ctx, Instant::now());
        }
    }
}
