//! Directory RPC client

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;
use wgmesh_proto::{ControlError, ControlMessage, ControlPayload, CoordinatorInfo};
use wgmesh_transport::{ControlConnection, QuicConfig, QuicConnector, TransportResult};

/// Client for the directory RPCs.
///
/// The QUIC connection is cached across calls and re-dialed after a
/// transport error.
pub struct DirectoryClient {
    connector: QuicConnector,
    server_addr: SocketAddr,
    server_name: String,
    connection: Mutex<Option<Arc<ControlConnection>>>,
}

impl DirectoryClient {
    pub fn new(
        server_addr: SocketAddr,
        server_name: &str,
        config: Arc<QuicConfig>,
    ) -> TransportResult<Self> {
        Ok(Self {
            connector: QuicConnector::new(config)?,
            server_addr,
            server_name: server_name.to_string(),
            connection: Mutex::new(None),
        })
    }

    async fn connection(&self) -> Result<Arc<ControlConnection>, ControlError> {
        let mut cached = self.connection.lock().await;

        if let Some(conn) = cached.as_ref() {
            if !conn.is_closed() {
                return Ok(conn.clone());
            }
        }

        let conn = self
            .connector
            .connect(self.server_addr, &self.server_name)
            .await
            .map_err(|e| ControlError::Unavailable(format!("directory dial: {}", e)))?;
        let conn = Arc::new(conn);
        *cached = Some(conn.clone());
        Ok(conn)
    }

    async fn request(&self, payload: ControlPayload) -> Result<ControlPayload, ControlError> {
        let conn = self.connection().await?;

        let mut stream = conn
            .open_stream()
            .await
            .map_err(|e| ControlError::Unavailable(format!("directory stream: {}", e)))?;

        stream
            .send_message(&ControlMessage::new(payload))
            .await
            .map_err(|e| ControlError::Unavailable(format!("directory send: {}", e)))?;
        stream
            .finish()
            .await
            .map_err(|e| ControlError::Unavailable(format!("directory finish: {}", e)))?;

        let response: ControlMessage = stream
            .recv_message()
            .await
            .map_err(|e| ControlError::Unavailable(format!("directory recv: {}", e)))?
            .ok_or_else(|| ControlError::Unavailable("directory closed stream".to_string()))?;

        Ok(response.payload)
    }

    /// Upsert this coordinator's entry
    pub async fn register_coordinator(
        &self,
        coordinator_id: &str,
        region: &str,
        address: &str,
        port: u16,
        current_load: u32,
        max_capacity: u32,
    ) -> Result<(), ControlError> {
        let response = self
            .request(ControlPayload::RegisterCoordinatorRequest {
                coordinator_id: coordinator_id.to_string(),
                region: region.to_string(),
                address: address.to_string(),
                port,
                current_load,
                max_capacity,
            })
            .await?;

        match response {
            ControlPayload::RegisterCoordinatorResponse { success: true, .. } => {
                debug!(coordinator_id = %coordinator_id, "Directory registration refreshed");
                Ok(())
            }
            ControlPayload::RegisterCoordinatorResponse { message, .. } => {
                Err(ControlError::InvalidArgument(message))
            }
            other => Err(ControlError::Unavailable(format!(
                "unexpected directory response: {:?}",
                other
            ))),
        }
    }

    /// Region-scoped candidate list, load-ordered
    pub async fn candidates(
        &self,
        target_region: &str,
        requesting_coordinator_id: &str,
    ) -> Result<Vec<CoordinatorInfo>, ControlError> {
        let response = self
            .request(ControlPayload::CandidatesRequest {
                target_region: target_region.to_string(),
                requesting_coordinator_id: requesting_coordinator_id.to_string(),
            })
            .await?;

        match response {
            ControlPayload::CandidatesResponse { candidates } => Ok(candidates),
            other => Err(ControlError::Unavailable(format!(
                "unexpected directory response: {:?}",
                other
            ))),
        }
    }

    /// Administrative snapshot
    pub async fn list_all(&self) -> Result<Vec<CoordinatorInfo>, ControlError> {
        let response = self.request(ControlPayload::ListCoordinatorsRequest).await?;

        match response {
            ControlPayload::ListCoordinatorsResponse { coordinators } => Ok(coordinators),
            other => Err(ControlError::Unavailable(format!(
                "unexpected directory response: {:?}",
                other
            ))),
        }
    }
}
