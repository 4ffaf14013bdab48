//! Services
//!
//! A service is the protocol state machine bound to one connection. The
//! connection task invokes its callbacks one at a time; a callback talks back
//! to the connection only through the [`ServiceContext`] it is handed.

use std::net::SocketAddr;

use bytes::Bytes;
use uuid::Uuid;

use super::connection::ConnectionHandle;
use super::TransportError;
use crate::message::{Message, MessageBody, MessageEnvelope, MessageError, MessageIdAllocator};

/// Per-connection protocol handler.
///
/// All callbacks for one connection run sequentially on that connection's
/// task, never concurrently.
pub trait Service: Send + 'static {
    /// The connection is up.
    fn started(&mut self, context: &mut ServiceContext);

    /// A message arrived.
    fn message_received(&mut self, context: &mut ServiceContext, envelope: MessageEnvelope);

    /// The peer closed its end of the connection.
    fn peer_stopped(&mut self, context: &mut ServiceContext);

    /// The connection is gone. Called exactly once; `error` is set when the
    /// termination was abnormal.
    fn stopped(&mut self, error: Option<&TransportError>);

    /// Timer callback, invoked every `tick_interval`.
    fn tick(&mut self, _context: &mut ServiceContext) {}
}

enum StopRequest {
    Normal,
    Failed(TransportError),
}

/// A service's view of its connection.
///
/// Messages queued during a callback are written before the next callback
/// runs. A stop takes effect after those messages are written.
pub struct ServiceContext {
    handle: ConnectionHandle,
    ids: MessageIdAllocator,
    outbox: Vec<Bytes>,
    max_frame_length: usize,
    stop: Option<StopRequest>,
}

impl ServiceContext {
    pub(crate) fn new(handle: ConnectionHandle, max_frame_length: usize) -> Self {
        Self {
            handle,
            ids: MessageIdAllocator::new(),
            outbox: Vec::new(),
            max_frame_length,
            stop: None,
        }
    }

    /// Connection identifier.
    pub fn connection_id(&self) -> Uuid {
        self.handle.id()
    }

    /// Remote address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.handle.peer_addr()
    }

    /// Handle for queueing messages from outside the connection task.
    pub fn handle(&self) -> ConnectionHandle {
        self.handle.clone()
    }

    /// Queue a fully formed message.
    pub fn send_message(&mut self, message: &Message) -> Result<(), MessageError> {
        let frame = message.encode()?;
        if frame.len() > self.max_frame_length {
            return Err(MessageError::FrameTooLarge {
                size: frame.len(),
                max_size: self.max_frame_length,
            });
        }
        self.outbox.push(frame);
        Ok(())
    }

    /// Queue an unsolicited message under a fresh id. Returns the id.
    pub fn send(&mut self, body: MessageBody) -> Result<u8, MessageError> {
        let id = self.ids.next_id();
        let message = Message::with_id(id as i32, body)?;
        self.send_message(&message)?;
        Ok(id)
    }

    /// Queue an answer to the request with id `request_id`. Returns the id.
    pub fn reply(&mut self, request_id: u8, body: MessageBody) -> Result<u8, MessageError> {
        let id = self.ids.next_id();
        let mut message = Message::with_id(id as i32, body)?;
        message.set_correlation_id(request_id as i32)?;
        self.send_message(&message)?;
        Ok(id)
    }

    /// Close the connection once queued messages are written.
    pub fn stop_service(&mut self) {
        if self.stop.is_none() {
            self.stop = Some(StopRequest::Normal);
        }
    }

    /// Close the connection abnormally.
    pub fn fail(&mut self, error: TransportError) {
        if !matches!(self.stop, Some(StopRequest::Failed(_))) {
            self.stop = Some(StopRequest::Failed(error));
        }
    }

    /// True once a stop was requested.
    pub fn is_stopping(&self) -> bool {
        self.stop.is_some()
    }

    pub(crate) fn take_outbox(&mut self) -> Vec<Bytes> {
        std::mem::take(&mut self.outbox)
    }

    /// `Some(error)` once a stop was requested.
    pub(crate) fn take_stop(&mut self) -> Option<Option<TransportError>> {
        self.stop.take().map(|stop| match stop {
            StopRequest::Normal => None,
            StopRequest::Failed(error) => Some(error),
        })
    }
}
