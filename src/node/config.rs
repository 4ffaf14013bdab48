//! Table network configuration.

use std::fmt;
use std::sync::Arc;

use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::table::Table;

/// Password bytes, zeroed on drop.
///
/// Deliberately not `Clone` and not `Display`; `Debug` never shows the bytes.
#[derive(Default, Zeroize, ZeroizeOnDrop)]
pub struct SecretBuffer {
    bytes: Vec<u8>,
}

impl SecretBuffer {
    /// Take ownership of secret bytes.
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    /// Borrow the secret bytes.
    pub fn expose(&self) -> &[u8] {
        &self.bytes
    }

    /// Compare against a candidate without early exit on the first mismatch.
    pub fn matches(&self, candidate: &[u8]) -> bool {
        if self.bytes.len() != candidate.len() {
            return false;
        }
        self.bytes
            .iter()
            .zip(candidate)
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }

    /// Zero and release the secret now.
    pub fn erase(&mut self) {
        self.bytes.zeroize();
    }

    /// True if the buffer holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl From<&str> for SecretBuffer {
    fn from(value: &str) -> Self {
        Self::new(value.as_bytes().to_vec())
    }
}

impl From<String> for SecretBuffer {
    fn from(value: String) -> Self {
        Self::new(value.into_bytes())
    }
}

impl fmt::Debug for SecretBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretBuffer(***)")
    }
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigurationError {
    /// Host name is empty.
    #[error("Host name must not be empty")]
    EmptyHostName,

    /// Local player name is empty.
    #[error("Local player name must not be empty")]
    EmptyPlayerName,

    /// Port 0 without opting into an ephemeral port.
    #[error("Invalid port: {0}")]
    InvalidPort(u16),

    /// No local table given.
    #[error("Local table is required")]
    MissingTable,
}

/// Everything needed to host or join one table session.
///
/// Immutable; build a new one per connection attempt.
pub struct TableNetworkConfiguration {
    host_name: String,
    port: u16,
    password: SecretBuffer,
    local_player_name: String,
    local_table: Arc<dyn Table>,
}

pub(crate) struct ConfigurationParts {
    pub host_name: String,
    pub port: u16,
    pub password: SecretBuffer,
    pub local_player_name: String,
    pub local_table: Arc<dyn Table>,
}

impl TableNetworkConfiguration {
    /// Start building a configuration.
    pub fn builder() -> TableNetworkConfigurationBuilder {
        TableNetworkConfigurationBuilder::default()
    }

    /// Host to bind (hosting) or connect to (joining).
    pub fn host_name(&self) -> &str {
        &self.host_name
    }

    /// TCP port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Table password.
    pub fn password(&self) -> &SecretBuffer {
        &self.password
    }

    /// Name of the local player.
    pub fn local_player_name(&self) -> &str {
        &self.local_player_name
    }

    /// Table synchronized by the session.
    pub fn local_table(&self) -> &Arc<dyn Table> {
        &self.local_table
    }

    pub(crate) fn into_parts(self) -> ConfigurationParts {
        ConfigurationParts {
            host_name: self.host_name,
            port: self.port,
            password: self.password,
            local_player_name: self.local_player_name,
            local_table: self.local_table,
        }
    }
}

impl fmt::Debug for TableNetworkConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableNetworkConfiguration")
            .field("host_name", &self.host_name)
            .field("port", &self.port)
            .field("password", &self.password)
            .field("local_player_name", &self.local_player_name)
            .finish_non_exhaustive()
    }
}

/// Builder for [`TableNetworkConfiguration`].
#[derive(Default)]
pub struct TableNetworkConfigurationBuilder {
    host_name: String,
    port: u16,
    allow_ephemeral_port: bool,
    password: SecretBuffer,
    local_player_name: String,
    local_table: Option<Arc<dyn Table>>,
}

impl TableNetworkConfigurationBuilder {
    /// Host name.
    pub fn host_name(mut self, host_name: impl Into<String>) -> Self {
        self.host_name = host_name.into();
        self
    }

    /// TCP port.
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Accept port 0 (let the OS pick). Only meaningful when hosting.
    pub fn ephemeral_port(mut self) -> Self {
        self.allow_ephemeral_port = true;
        self
    }

    /// Table password.
    pub fn password(mut self, password: impl Into<SecretBuffer>) -> Self {
        self.password = password.into();
        self
    }

    /// Local player name.
    pub fn local_player_name(mut self, name: impl Into<String>) -> Self {
        self.local_player_name = name.into();
        self
    }

    /// Local table.
    pub fn local_table(mut self, table: Arc<dyn Table>) -> Self {
        self.local_table = Some(table);
        self
    }

    /// Validate and build.
    pub fn build(self) -> Result<TableNetworkConfiguration, ConfigurationError> {
        if self.host_name.trim().is_empty() {
            return Err(ConfigurationError::EmptyHostName);
        }
        if self.local_player_name.trim().is_empty() {
            return Err(ConfigurationError::EmptyPlayerName);
        }
        if self.port == 0 && !self.allow_ephemeral_port {
            return Err(ConfigurationError::InvalidPort(self.port));
        }
        let local_table = self.local_table.ok_or(ConfigurationError::MissingTable)?;

        Ok(TableNetworkConfiguration {
            host_name: self.host_name,
            port: self.port,
            password: self.password,
            local_player_name: self.local_player_name,
            local_table,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::InMemoryTable;

    fn builder() -> TableNetworkConfigurationBuilder {
        TableNetworkConfiguration::builder()
            .host_name("localhost")
            .port(9999)
            .password("secret")
            .local_player_name("alice")
            .local_table(Arc::new(InMemoryTable::new()))
    }

    #[test]
    fn test_valid_configuration() {
        let config = builder().build().unwrap();
        assert_eq!(config.host_name(), "localhost");
        assert_eq!(config.port(), 9999);
        assert_eq!(config.local_player_name(), "alice");
        assert!(config.password().matches(b"secret"));
    }

    #[test]
    fn test_validation_errors() {
        assert_eq!(
            builder().host_name("").build().unwrap_err(),
            ConfigurationError::EmptyHostName
        );
        assert_eq!(
            builder().local_player_name("  ").build().unwrap_err(),
            ConfigurationError::EmptyPlayerName
        );
        assert_eq!(
            builder().port(0).build().unwrap_err(),
            ConfigurationError::InvalidPort(0)
        );
        assert!(builder().port(0).ephemeral_port().build().is_ok());

        let missing_table = TableNetworkConfiguration::builder()
            .host_name("localhost")
            .port(1)
            .local_player_name("alice")
            .build();
        assert_eq!(missing_table.unwrap_err(), ConfigurationError::MissingTable);
    }

    #[test]
    fn test_debug_never_shows_password() {
        let config = builder().build().unwrap();
        let debug = format!("{:?}", config);
        assert!(debug.contains("SecretBuffer(***)"));
        assert!(!debug.contains("secret\""));
    }

    #[test]
    fn test_secret_matches_and_erase() {
        let mut secret = SecretBuffer::from("secret");
        assert!(secret.matches(b"secret"));
        assert!(!secret.matches(b"secreT"));
        assert!(!secret.matches(b"secret!"));

        secret.erase();
        assert!(secret.is_empty());
        assert!(!secret.matches(b"secret"));
    }
}
