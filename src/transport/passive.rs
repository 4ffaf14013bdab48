//! Passive transport layers listen for inbound peers. Each accepted peer gets
//! its own connection task and service.

use std::sync::Arc;

use tokio::net::TcpListener;

use super::{TransportError, TransportKind, TransportLayer, TransportLayerContext, TransportLayerFactory};
use crate::settings::NetworkSettings;

/// Creates inbound transport layers.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassiveTransportLayerFactory;

impl TransportLayerFactory for PassiveTransportLayerFactory {
    fn create_transport_layer(
        &self,
        context: Arc<dyn TransportLayerContext>,
        settings: NetworkSettings,
    ) -> TransportLayer {
        TransportLayer::spawn(TransportKind::Passive, context, settings)
    }
}

/// Bind a listener on `host_name:port`; port 0 picks an ephemeral port.
pub(crate) async fn bind(host_name: &str, port: u16) -> Result<TcpListener, TransportError> {
    Ok(TcpListener::bind((host_name, port)).await?)
}
