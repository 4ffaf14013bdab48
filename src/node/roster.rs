//! Host-side player roster.

use std::collections::BTreeMap;

use tracing::warn;
use uuid::Uuid;

use crate::message::{MessageBody, RejectionReason};
use crate::transport::ConnectionHandle;

/// Admitted players keyed by name. The host's own player has no connection.
#[derive(Debug, Default)]
pub(crate) struct Roster {
    local: Option<String>,
    peers: BTreeMap<String, ConnectionHandle>,
}

impl Roster {
    pub fn reset(&mut self, local: Option<String>) {
        self.local = local;
        self.peers.clear();
    }

    pub fn contains(&self, name: &str) -> bool {
        self.local.as_deref() == Some(name) || self.peers.contains_key(name)
    }

    /// Admit a remote player.
    pub fn admit(&mut self, name: &str, handle: ConnectionHandle) -> Result<(), RejectionReason> {
        if name.trim().is_empty() {
            return Err(RejectionReason::InvalidPlayerName);
        }
        if self.contains(name) {
            return Err(RejectionReason::DuplicatePlayerName);
        }
        self.peers.insert(name.to_string(), handle);
        Ok(())
    }

    /// Remove `name` if it is still bound to `connection_id`.
    ///
    /// Returns false if the player was already removed, so every departure is
    /// reported once.
    pub fn remove(&mut self, name: &str, connection_id: Uuid) -> bool {
        match self.peers.get(name) {
            Some(handle) if handle.id() == connection_id => {
                self.peers.remove(name);
                true
            }
            _ => false,
        }
    }

    /// All player names, sorted, local player included.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.peers.keys().cloned().collect();
        if let Some(local) = &self.local {
            names.push(local.clone());
        }
        names.sort();
        names
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Queue `body` to every remote player except `skip`.
    ///
    /// A peer whose queue rejects the message is closed; its service reports
    /// the departure.
    pub fn broadcast(&self, body: &MessageBody, skip: Option<&str>) {
        for (name, handle) in &self.peers {
            if skip == Some(name.as_str()) {
                continue;
            }
            if let Err(e) = handle.send(body.clone()) {
                warn!("Dropping player {}: {}", name, e);
                handle.close();
            }
        }
    }
}
