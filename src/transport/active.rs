//! Active transport layers connect out to a single peer.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use super::{TransportError, TransportKind, TransportLayer, TransportLayerContext, TransportLayerFactory};
use crate::settings::NetworkSettings;

/// Creates outbound transport layers.
#[derive(Debug, Clone, Copy, Default)]
pub struct ActiveTransportLayerFactory;

impl TransportLayerFactory for ActiveTransportLayerFactory {
    fn create_transport_layer(
        &self,
        context: Arc<dyn TransportLayerContext>,
        settings: NetworkSettings,
    ) -> TransportLayer {
        TransportLayer::spawn(TransportKind::Active, context, settings)
    }
}

/// Connect to `host_name:port` within `limit`.
pub(crate) async fn connect(
    host_name: &str,
    port: u16,
    limit: Duration,
) -> Result<(TcpStream, SocketAddr), TransportError> {
    debug!("Connecting to {}:{}", host_name, port);
    let stream = timeout(limit, TcpStream::connect((host_name, port)))
        .await
        .map_err(|_| TransportError::ConnectTimedOut(format!("{}:{}", host_name, port)))??;
    let peer_addr = stream.peer_addr()?;
    Ok((stream, peer_addr))
}
