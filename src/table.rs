//! Table State
//!
//! The tabletop itself lives outside this crate. The network only needs to
//! capture it, restore it, and apply ordered changes to it, so the table is
//! modelled as an ordered map from component id to opaque bytes.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Digest output type (256 bits / 32 bytes).
pub type TableDigest = [u8; 32];

/// Domain separator for memento digests.
const MEMENTO_DOMAIN: &[u8] = b"TABLE_NET_MEMENTO_V1";

/// Captured table state.
///
/// Uses BTreeMap so digests do not depend on insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableMemento {
    components: BTreeMap<String, Vec<u8>>,
}

impl TableMemento {
    /// Create an empty memento.
    pub fn new() -> Self {
        Self::default()
    }

    /// Component state by id.
    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.components.get(key).map(Vec::as_slice)
    }

    /// Insert or replace a component.
    pub fn insert(&mut self, key: impl Into<String>, value: Vec<u8>) {
        self.components.insert(key.into(), value);
    }

    /// Remove a component.
    pub fn remove(&mut self, key: &str) -> Option<Vec<u8>> {
        self.components.remove(key)
    }

    /// Number of components.
    pub fn len(&self) -> usize {
        self.components.len()
    }

    /// True if there are no components.
    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    /// Iterate components in id order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.components.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// Apply changes atomically: either all apply or none do.
    pub fn apply(&mut self, changes: &[TableChange]) -> Result<(), TableError> {
        let mut next = self.components.clone();
        for change in changes {
            match change {
                TableChange::Put { key, value } => {
                    if key.is_empty() {
                        return Err(TableError::EmptyComponentId);
                    }
                    next.insert(key.clone(), value.clone());
                }
                TableChange::Remove { key } => {
                    if next.remove(key).is_none() {
                        return Err(TableError::UnknownComponent(key.clone()));
                    }
                }
            }
        }
        self.components = next;
        Ok(())
    }

    /// SHA-256 over every component, length-prefixed, in id order.
    pub fn digest(&self) -> TableDigest {
        let mut hasher = Sha256::new();
        hasher.update(MEMENTO_DOMAIN);
        hasher.update((self.components.len() as u64).to_le_bytes());
        for (key, value) in &self.components {
            hasher.update((key.len() as u64).to_le_bytes());
            hasher.update(key.as_bytes());
            hasher.update((value.len() as u64).to_le_bytes());
            hasher.update(value);
        }
        hasher.finalize().into()
    }
}

/// One edit to the table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TableChange {
    /// Insert or replace a component.
    Put {
        /// Component id.
        key: String,
        /// New component state.
        value: Vec<u8>,
    },
    /// Remove a component.
    Remove {
        /// Component id.
        key: String,
    },
}

/// Table errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TableError {
    /// Component ids must not be empty.
    #[error("Empty component id")]
    EmptyComponentId,

    /// Removed component does not exist.
    #[error("Unknown component: {0}")]
    UnknownComponent(String),
}

/// The local table a node synchronizes.
pub trait Table: Send + Sync {
    /// Capture the current state.
    fn memento(&self) -> TableMemento;

    /// Replace the current state.
    fn restore(&self, memento: &TableMemento);

    /// Apply changes atomically.
    fn apply(&self, changes: &[TableChange]) -> Result<(), TableError>;
}

/// Table held entirely in memory.
#[derive(Debug, Default)]
pub struct InMemoryTable {
    state: Mutex<TableMemento>,
}

impl InMemoryTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a table seeded with a memento.
    pub fn with_memento(memento: TableMemento) -> Self {
        Self {
            state: Mutex::new(memento),
        }
    }
}

impl Table for InMemoryTable {
    fn memento(&self) -> TableMemento {
        self.state.lock().clone()
    }

    fn restore(&self, memento: &TableMemento) {
        *self.state.lock() = memento.clone();
    }

    fn apply(&self, changes: &[TableChange]) -> Result<(), TableError> {
        self.state.lock().apply(changes)
    }
}
