//! Connections
//!
//! One task per peer link owns the framed socket and the bound service.
//! Socket I/O and every service callback run on that task, so connection
//! state needs no locking.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;
use zeroize::Zeroize;

use super::service::{Service, ServiceContext};
use super::{TransportError, TransportLayerContext};
use crate::message::{MessageBody, MessageEnvelope};
use crate::settings::NetworkSettings;

/// Floor for the service timer; tokio rejects a zero period.
pub(crate) const MIN_TICK_INTERVAL: Duration = Duration::from_millis(1);

/// Handle to a running connection.
///
/// Cheap to clone; usable from any thread.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: Uuid,
    peer_addr: SocketAddr,
    commands: mpsc::Sender<MessageBody>,
    cancel: CancellationToken,
}

impl ConnectionHandle {
    /// Connection identifier.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Remote address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Queue an unsolicited message. Never blocks.
    pub fn send(&self, body: MessageBody) -> Result<(), TransportError> {
        if self.cancel.is_cancelled() {
            return Err(TransportError::Closed);
        }
        self.commands.try_send(body).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TransportError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => TransportError::Closed,
        })
    }

    /// Ask the connection to close after writing what is already queued.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// True once the connection is closing or closed.
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.commands.is_closed()
    }

    /// Handle with no task behind it, for exercising services directly.
    #[cfg(test)]
    pub(crate) fn detached(
        peer_addr: SocketAddr,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<MessageBody>) {
        let (commands, rx) = mpsc::channel(capacity);
        let handle = Self {
            id: Uuid::new_v4(),
            peer_addr,
            commands,
            cancel: CancellationToken::new(),
        };
        (handle, rx)
    }
}

/// Reported to the transport task when a connection ends.
pub(crate) struct ConnectionExit {
    pub id: Uuid,
    pub peer_addr: SocketAddr,
    pub error: Option<TransportError>,
}

/// Start a connection task for an established stream.
pub(crate) fn spawn_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    service: Box<dyn Service>,
    context: Arc<dyn TransportLayerContext>,
    settings: &NetworkSettings,
    exits: mpsc::UnboundedSender<ConnectionExit>,
) -> (ConnectionHandle, JoinHandle<()>) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("set_nodelay failed for {}: {}", peer_addr, e);
    }

    let (commands_tx, commands_rx) = mpsc::channel(settings.outbound_queue.max(1));
    let handle = ConnectionHandle {
        id: Uuid::new_v4(),
        peer_addr,
        commands: commands_tx,
        cancel: CancellationToken::new(),
    };

    let connection = Connection {
        handle: handle.clone(),
        stream,
        service,
        context,
        commands: commands_rx,
        settings: settings.clone(),
        exits,
    };
    let task = tokio::spawn(connection.run());

    (handle, task)
}

struct Connection {
    handle: ConnectionHandle,
    stream: TcpStream,
    service: Box<dyn Service>,
    context: Arc<dyn TransportLayerContext>,
    commands: mpsc::Receiver<MessageBody>,
    settings: NetworkSettings,
    exits: mpsc::UnboundedSender<ConnectionExit>,
}

type FramedStream = Framed<TcpStream, LengthDelimitedCodec>;

impl Connection {
    async fn run(self) {
        let Connection {
            handle,
            stream,
            mut service,
            context,
            mut commands,
            settings,
            exits,
        } = self;

        let id = handle.id();
        let peer_addr = handle.peer_addr();
        let cancel = handle.cancel.clone();

        let codec = LengthDelimitedCodec::builder()
            .max_frame_length(settings.max_frame_length)
            .new_codec();
        let mut framed = Framed::new(stream, codec);
        let mut ctx = ServiceContext::new(handle, settings.max_frame_length);
        // A peer that cannot take our frames within an echo timeout is as
        // dead as one that does not answer the echo.
        let write_timeout = settings.echo_timeout;
        let tick_interval = settings.tick_interval.max(MIN_TICK_INTERVAL);

        debug!("Connection {} to {} started", id, peer_addr);
        service.started(&mut ctx);

        let mut ticker = interval_at(Instant::now() + tick_interval, tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let error = loop {
            let written = tokio::select! {
                biased;
                written = write_frames(&mut framed, &mut ctx, write_timeout) => written,
                _ = cancel.cancelled() => break None,
            };
            if let Err(e) = written {
                break Some(e);
            }
            if let Some(outcome) = ctx.take_stop() {
                break outcome;
            }

            tokio::select! {
                _ = cancel.cancelled() => break None,
                frame = framed.next() => match frame {
                    Some(Ok(frame)) => {
                        #[cfg(feature = "debug-tracing")]
                        tracing::trace!("Frame from {}: {}", peer_addr, hex::encode(&frame));

                        match MessageEnvelope::from_frame(frame) {
                            Ok(envelope) => service.message_received(&mut ctx, envelope),
                            Err(e) => break Some(TransportError::Message(e)),
                        }
                    }
                    Some(Err(e)) => break Some(TransportError::Io(e)),
                    None => {
                        debug!("Peer {} closed connection {}", peer_addr, id);
                        service.peer_stopped(&mut ctx);
                        break None;
                    }
                },
                Some(body) = commands.recv() => {
                    if let Err(e) = ctx.send(body) {
                        break Some(TransportError::Message(e));
                    }
                }
                _ = ticker.tick() => service.tick(&mut ctx),
            }
        };

        if error.is_none() {
            if cancel.is_cancelled() {
                // Deliver whatever was queued before the close request.
                while let Ok(body) = commands.try_recv() {
                    if let Err(e) = ctx.send(body) {
                        warn!("Dropping queued message for {}: {}", peer_addr, e);
                    }
                }
            }
            let finish = async {
                write_frames(&mut framed, &mut ctx, write_timeout).await?;
                SinkExt::<Bytes>::close(&mut framed).await?;
                Ok::<(), TransportError>(())
            };
            match timeout(write_timeout, finish).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!("Final flush to {} failed: {}", peer_addr, e),
                Err(_) => debug!("Peer {} did not take the final frames", peer_addr),
            }
        }
        cancel.cancel();
        drop(framed);

        match &error {
            Some(e) => info!("Connection {} to {} failed: {}", id, peer_addr, e),
            None => debug!("Connection {} to {} closed", id, peer_addr),
        }

        service.stopped(error.as_ref());
        context.peer_disconnected(peer_addr, error.as_ref());
        let _ = exits.send(ConnectionExit {
            id,
            peer_addr,
            error,
        });
    }
}

/// Write every queued frame within `limit`.
async fn write_frames(
    framed: &mut FramedStream,
    ctx: &mut ServiceContext,
    limit: Duration,
) -> Result<(), TransportError> {
    let frames = ctx.take_outbox();
    if frames.is_empty() {
        return Ok(());
    }
    let write = async {
        for frame in frames {
            framed.feed(frame.clone()).await?;
            wipe(frame);
        }
        SinkExt::<Bytes>::flush(&mut *framed).await?;
        Ok::<(), TransportError>(())
    };
    timeout(limit, write)
        .await
        .map_err(|_| TransportError::PeerTimeout(limit))?
}

/// Zero a frame once the codec has copied it. Frames may carry a password.
fn wipe(frame: Bytes) {
    if let Ok(mut frame) = frame.try_into_mut() {
        frame[..].zeroize();
    }
}
