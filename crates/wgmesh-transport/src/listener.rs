//! QUIC listener and connector

use crate::config::QuicConfig;
use crate::connection::ControlConnection;
use crate::{TransportError, TransportResult};
use quinn::Endpoint;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, error, info};

/// QUIC listener for accepting incoming connections
#[derive(Debug)]
pub struct QuicListener {
    endpoint: Endpoint,
}

impl QuicListener {
    pub fn new(bind_addr: SocketAddr, config: Arc<QuicConfig>) -> TransportResult<Self> {
        config.validate()?;

        let server_config = config.build_server_config()?;
        let endpoint = Endpoint::server(server_config, bind_addr).map_err(TransportError::IoError)?;

        let local_addr = endpoint.local_addr().map_err(TransportError::IoError)?;
        info!("QUIC listener bound to {}", local_addr);

        Ok(Self { endpoint })
    }

    /// Accept the next established connection.
    ///
    /// Handshake failures are logged and skipped; the error return is
    /// reserved for endpoint shutdown.
    pub async fn accept(&self) -> TransportResult<(ControlConnection, SocketAddr)> {
        loop {
            match self.endpoint.accept().await {
                Some(connecting) => {
                    let remote = connecting.remote_address();
                    debug!("Incoming QUIC connection from {}", remote);

                    match connecting.await {
                        Ok(connection) => {
                            debug!("QUIC connection established from {}", remote);
                            return Ok((ControlConnection::new(connection), remote));
                        }
                        Err(e) => {
                            error!("Failed to establish QUIC connection from {}: {}", remote, e);
                            continue;
                        }
                    }
                }
                None => return Err(TransportError::EndpointClosed),
            }
        }
    }

    pub fn local_addr(&self) -> TransportResult<SocketAddr> {
        self.endpoint.local_addr().map_err(TransportError::IoError)
    }

    pub fn close(&self) {
        self.endpoint.close(0u32.into(), b"listener closed");
        info!("QUIC listener closed");
    }
}

/// QUIC connector for establishing outgoing connections
#[derive(Debug)]
pub struct QuicConnector {
    endpoint: Endpoint,
}

impl QuicConnector {
    pub fn new(config: Arc<QuicConfig>) -> TransportResult<Self> {
        config.validate()?;

        let client_config = config.build_client_config()?;

        let mut endpoint = Endpoint::client("0.0.0.0:0".parse().unwrap())
            .map_err(TransportError::IoError)?;
        endpoint.set_default_client_config(client_config);

        debug!("QUIC connector created");
        Ok(Self { endpoint })
    }

    pub async fn connect(
        &self,
        server_addr: SocketAddr,
        server_name: &str,
    ) -> TransportResult<ControlConnection> {
        debug!("Connecting to QUIC server {} ({})", server_name, server_addr);

        let connection = self
            .endpoint
            .connect(server_addr, server_name)
            .map_err(|e| TransportError::ConnectionError(e.to_string()))?
            .await
            .map_err(|e| TransportError::ConnectionError(e.to_string()))?;

        debug!("QUIC connection established to {}", server_addr);
        Ok(ControlConnection::new(connection))
    }
}
