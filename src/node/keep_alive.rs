//! Echo-based liveness check for an established peer link.

use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::message::MessageBody;
use crate::transport::{ServiceContext, TransportError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum KeepAliveAction {
    Idle,
    Probe(Vec<u8>),
    Expired,
}

#[derive(Debug)]
struct PendingEcho {
    id: u8,
    content: Vec<u8>,
    sent_at: Instant,
}

/// One outstanding echo at a time. A probe is due `interval` after the last
/// answered one; an unanswered probe expires after `timeout`.
#[derive(Debug)]
pub(crate) struct KeepAlive {
    interval: Duration,
    timeout: Duration,
    last_answer: Instant,
    pending: Option<PendingEcho>,
    counter: u64,
}

impl KeepAlive {
    pub fn new(interval: Duration, timeout: Duration, now: Instant) -> Self {
        Self {
            interval,
            timeout,
            last_answer: now,
            pending: None,
            counter: 0,
        }
    }

    pub fn poll(&mut self, now: Instant) -> KeepAliveAction {
        match &self.pending {
            Some(pending) if now.duration_since(pending.sent_at) >= self.timeout => {
                KeepAliveAction::Expired
            }
            Some(_) => KeepAliveAction::Idle,
            None if now.duration_since(self.last_answer) >= self.interval => {
                self.counter += 1;
                KeepAliveAction::Probe(self.counter.to_be_bytes().to_vec())
            }
            None => KeepAliveAction::Idle,
        }
    }

    pub fn sent(&mut self, id: u8, content: Vec<u8>, now: Instant) {
        self.pending = Some(PendingEcho {
            id,
            content,
            sent_at: now,
        });
    }

    /// Match an `EchoResponse`. Returns false for stale or foreign answers.
    pub fn answered(&mut self, correlation_id: u8, content: &[u8], now: Instant) -> bool {
        match &self.pending {
            Some(pending) if pending.id == correlation_id && pending.content == content => {
                self.pending = None;
                self.last_answer = now;
                true
            }
            _ => false,
        }
    }

    /// Send a due probe or fail the connection if the last one expired.
    pub fn drive(&mut self, context: &mut ServiceContext, now: Instant) {
        match self.poll(now) {
            KeepAliveAction::Idle => {}
            KeepAliveAction::Probe(content) => {
                match context.send(MessageBody::Echo {
                    content: content.clone(),
                }) {
                    Ok(id) => self.sent(id, content, now),
                    Err(e) => context.fail(e.into()),
                }
            }
            KeepAliveAction::Expired => {
                warn!("Peer {} stopped answering echoes", context.peer_addr());
                context.fail(TransportError::PeerTimeout(self.timeout));
            }
        }
    }

    /// Handle an `EchoResponse` received on the link.
    pub fn on_response(&mut self, correlation_id: u8, content: &[u8], now: Instant) {
        if !self.answered(correlation_id, content, now) {
            debug!("Ignoring stale echo response {}", correlation_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INTERVAL: Duration = Duration::from_secs(5);
    const TIMEOUT: Duration = Duration::from_secs(10);

    #[test]
    fn test_probe_after_interval() {
        let start = Instant::now();
        let mut keep_alive = KeepAlive::new(INTERVAL, TIMEOUT, start);

        assert_eq!(keep_alive.poll(start), KeepAliveAction::Idle);
        let KeepAliveAction::Probe(content) = keep_alive.poll(start + INTERVAL) else {
            panic!("Expected a probe");
        };
        keep_alive.sent(3, content.clone(), start + INTERVAL);

        // No second probe while one is outstanding.
        assert_eq!(keep_alive.poll(start + INTERVAL * 2), KeepAliveAction::Idle);
        assert!(keep_alive.answered(3, &content, start + INTERVAL * 2));
        assert_eq!(keep_alive.poll(start + INTERVAL * 2), KeepAliveAction::Idle);
    }

    #[test]
    fn test_unanswered_probe_expires() {
        let start = Instant::now();
        let mut keep_alive = KeepAlive::new(INTERVAL, TIMEOUT, start);
        let KeepAliveAction::Probe(content) = keep_alive.poll(start + INTERVAL) else {
            panic!("Expected a probe");
        };
        keep_alive.sent(1, content, start + INTERVAL);

        assert_eq!(
            keep_alive.poll(start + INTERVAL + TIMEOUT),
            KeepAliveAction::Expired
        );
    }

    #[test]
    fn test_mismatched_answer_ignored() {
        let start = Instant::now();
        let mut keep_alive = KeepAlive::new(INTERVAL, TIMEOUT, start);
        let KeepAliveAction::Probe(content) = keep_alive.poll(start + INTERVAL) else {
            panic!("Expected a probe");
        };
        keep_alive.sent(7, content.clone(), start + INTERVAL);

        assert!(!keep_alive.answered(8, &content, start + INTERVAL));
        assert!(!keep_alive.answered(7, b"other", start + INTERVAL));
        assert!(keep_alive.answered(7, &content, start + INTERVAL));
    }

    #[test]
    fn test_probe_contents_differ() {
        let start = Instant::now();
        let mut keep_alive = KeepAlive::new(INTERVAL, TIMEOUT, start);
        let KeepAliveAction::Probe(first) = keep_alive.poll(start + INTERVAL) else {
            panic!("Expected a probe");
        };
        keep_alive.sent(1, first.clone(), start + INTERVAL);
        keep_alive.answered(1, &first, start + INTERVAL);

        let KeepAliveAction::Probe(second) = keep_alive.poll(start + INTERVAL * 2) else {
            panic!("Expected a probe");
        };
        assert_ne!(first, second);
    }
}
