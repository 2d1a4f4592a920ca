//! Client-side tunnel interface
//!
//! One interface per peer for consuming exits. Connecting to a granted
//! exit replaces any previous exit peer entry and assigns the address
//! the exit allocated.

use crate::client::{CommandHandler, ExitGrant};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};
use wgmesh_dataplane::{DataPlane, DataPlaneError};
use wgmesh_keys::WgKeyPair;
use wgmesh_proto::messages::setup_exit;
use wgmesh_proto::{Command, CommandResponse, ControlError, ExitPeerInfo};

/// The exit this tunnel is currently bound to
#[derive(Debug, Clone)]
pub struct ActiveExit {
    pub exit_peer: ExitPeerInfo,
    pub allocation_id: String,
    pub address: String,
}

/// Client-role tunnel interface lifecycle
pub struct ClientTunnel {
    interface: String,
    dataplane: Arc<dyn DataPlane>,
    keys: WgKeyPair,
    current: Mutex<Option<ActiveExit>>,
}

impl ClientTunnel {
    pub fn new(peer_id: &str, dataplane: Arc<dyn DataPlane>) -> Arc<Self> {
        Arc::new(Self {
            interface: format!("wg-client-{}", peer_id),
            dataplane,
            keys: WgKeyPair::generate(),
            current: Mutex::new(None),
        })
    }

    /// Tunnel public key announced in exit requests
    pub fn public_key(&self) -> String {
        self.keys.public.to_base64()
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub async fn current_exit(&self) -> Option<ActiveExit> {
        self.current.lock().await.clone()
    }

    /// Create and key the client interface
    pub async fn start(&self) -> Result<(), ControlError> {
        self.dataplane.interface_create(&self.interface).await?;
        self.dataplane
            .interface_configure(&self.interface, &self.keys.private.to_base64(), None, None)
            .await?;

        info!(
            interface = %self.interface,
            public_key = %self.public_key(),
            "Client interface initialized"
        );
        Ok(())
    }

    /// Tear the interface down, dropping any bound exit
    pub async fn stop(&self) {
        self.current.lock().await.take();
        if let Err(e) = self.dataplane.interface_delete(&self.interface).await {
            if !matches!(e, DataPlaneError::NotFound(_)) {
                warn!(interface = %self.interface, error = %e, "Interface delete failed");
            }
        }
    }

    /// Bind to a granted exit: replace the previous peer entry, point
    /// at the exit's endpoint, and take the allocated address.
    pub async fn connect(&self, grant: &ExitGrant) -> Result<(), ControlError> {
        let mut current = self.current.lock().await;

        if let Some(previous) = current.take() {
            if let Err(e) = self
                .dataplane
                .peer_remove(&self.interface, &previous.exit_peer.public_key)
                .await
            {
                if !matches!(e, DataPlaneError::NotFound(_)) {
                    warn!(error = %e, "Failed to remove previous exit peer");
                }
            }
        }

        self.dataplane
            .peer_add(
                &self.interface,
                &grant.exit_peer.public_key,
                &grant.exit_peer.allowed_ips,
                Some(&grant.exit_peer.endpoint),
            )
            .await
            .map_err(|e| ControlError::from(e).at_step("exit peer add"))?;

        let address = format!("{}/32", grant.allocated_ip);
        if let Err(e) = self
            .dataplane
            .interface_configure(
                &self.interface,
                &self.keys.private.to_base64(),
                None,
                Some(&address),
            )
            .await
        {
            let _ = self
                .dataplane
                .peer_remove(&self.interface, &grant.exit_peer.public_key)
                .await;
            return Err(ControlError::from(e).at_step("client address assign"));
        }

        info!(
            exit_peer = %grant.exit_peer.peer_id,
            endpoint = %grant.exit_peer.endpoint,
            allocation_id = %grant.allocation_id,
            address = %address,
            "Connected to exit"
        );

        *current = Some(ActiveExit {
            exit_peer: grant.exit_peer.clone(),
            allocation_id: grant.allocation_id.clone(),
            address,
        });
        Ok(())
    }

    /// Drop the current exit binding
    pub async fn disconnect(&self) -> Result<(), ControlError> {
        let mut current = self.current.lock().await;
        let active = current
            .take()
            .ok_or_else(|| ControlError::NotFound("not connected to any exit".to_string()))?;

        if let Err(e) = self
            .dataplane
            .peer_remove(&self.interface, &active.exit_peer.public_key)
            .await
        {
            if !matches!(e, DataPlaneError::NotFound(_)) {
                return Err(ControlError::from(e));
            }
        }

        info!(
            exit_peer = %active.exit_peer.peer_id,
            allocation_id = %active.allocation_id,
            "Disconnected from exit"
        );
        Ok(())
    }
}

/// DISCONNECT (client side): the coordinator revoked an allocation.
/// Reply first, tear the binding down deferred.
pub struct ClientDisconnectHandler {
    tunnel: Arc<ClientTunnel>,
}

impl ClientDisconnectHandler {
    pub fn new(tunnel: Arc<ClientTunnel>) -> Arc<Self> {
        Arc::new(Self { tunnel })
    }
}

#[async_trait]
impl CommandHandler for ClientDisconnectHandler {
    async fn handle(&self, command: &Command) -> CommandResponse {
        let session_id = command.field(setup_exit::SESSION_ID).map(|s| s.to_string());

        let tunnel = self.tunnel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;

            if let Some(session_id) = session_id {
                let matches = tunnel
                    .current_exit()
                    .await
                    .map(|active| active.allocation_id == session_id)
                    .unwrap_or(false);
                if !matches {
                    return;
                }
            }

            if let Err(e) = tunnel.disconnect().await {
                warn!(error = %e, "Deferred exit disconnect failed");
            }
        });

        CommandResponse::ok(command.command_id, "disconnect scheduled")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wgmesh_dataplane::MemoryDataPlane;

    fn grant(public_key: &str, allocated_ip: &str) -> ExitGrant {
        ExitGrant {
            exit_peer: ExitPeerInfo {
                peer_id: "exit-1".to_string(),
                public_key: public_key.to_string(),
                endpoint: "203.0.113.9:52000".to_string(),
                allowed_ips: vec!["0.0.0.0/0".to_string()],
                supports_direct: true,
            },
            allocation_id: "alloc-1".to_string(),
            allocated_ip: allocated_ip.to_string(),
        }
    }

    #[tokio::test]
    async fn test_connect_assigns_peer_and_address() {
        let dataplane = Arc::new(MemoryDataPlane::new());
        let tunnel = ClientTunnel::new("p1", dataplane.clone());
        tunnel.start().await.unwrap();

        let key = WgKeyPair::generate().public.to_base64();
        tunnel.connect(&grant(&key, "10.9.0.2")).await.unwrap();

        let snapshot = dataplane.snapshot();
        let iface = &snapshot.interfaces["wg-client-p1"];
        assert_eq!(iface.address.as_deref(), Some("10.9.0.2/32"));
        let peer = &iface.peers[&key];
        assert_eq!(peer.endpoint.as_deref(), Some("203.0.113.9:52000"));
        assert_eq!(peer.allowed_addrs, vec!["0.0.0.0/0".to_string()]);
    }

    #[tokio::test]
    async fn test_reconnect_replaces_previous_exit() {
        let dataplane = Arc::new(MemoryDataPlane::new());
        let tunnel = ClientTunnel::new("p1", dataplane.clone());
        tunnel.start().await.unwrap();

        let first = WgKeyPair::generate().public.to_base64();
        let second = WgKeyPair::generate().public.to_base64();
        tunnel.connect(&grant(&first, "10.9.0.2")).await.unwrap();
        tunnel.connect(&grant(&second, "10.9.0.3")).await.unwrap();

        let snapshot = dataplane.snapshot();
        let peers = &snapshot.interfaces["wg-client-p1"].peers;
        assert!(!peers.contains_key(&first));
        assert!(peers.contains_key(&second));
        assert_eq!(peers.len(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_requires_active_exit() {
        let dataplane = Arc::new(MemoryDataPlane::new());
        let tunnel = ClientTunnel::new("p1", dataplane);
        tunnel.start().await.unwrap();

        assert!(matches!(
            tunnel.disconnect().await,
            Err(ControlError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_disconnect_handler_defers_teardown_for_matching_allocation() {
        use crate::client::CommandHandler;
        use wgmesh_proto::{Command, CommandKind};

        let dataplane = Arc::new(MemoryDataPlane::new());
        let tunnel = ClientTunnel::new("p1", dataplane);
        tunnel.start().await.unwrap();

        let key = WgKeyPair::generate().public.to_base64();
        tunnel.connect(&grant(&key, "10.9.0.2")).await.unwrap();

        let handler = ClientDisconnectHandler::new(tunnel.clone());

        // Mismatched allocation id: binding survives
        let mut payload = std::collections::HashMap::new();
        payload.insert(setup_exit::SESSION_ID.to_string(), "other-alloc".to_string());
        let response = handler
            .handle(&Command::new(1, CommandKind::Disconnect, payload))
            .await;
        assert!(response.success);
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(tunnel.current_exit().await.is_some());

        // Matching allocation id: response first, teardown deferred
        let mut payload = std::collections::HashMap::new();
        payload.insert(setup_exit::SESSION_ID.to_string(), "alloc-1".to_string());
        let response = handler
            .handle(&Command::new(2, CommandKind::Disconnect, payload))
            .await;
        assert!(response.success);
        assert!(tunnel.current_exit().await.is_some());

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(tunnel.current_exit().await.is_none());
    }

    #[tokio::test]
    async fn test_disconnect_removes_peer_entry() {
        let dataplane = Arc::new(MemoryDataPlane::new());
        let tunnel = ClientTunnel::new("p1", dataplane.clone());
        tunnel.start().await.unwrap();

        let key = WgKeyPair::generate().public.to_base64();
        tunnel.connect(&grant(&key, "10.9.0.2")).await.unwrap();
        tunnel.disconnect().await.unwrap();

        assert!(dataplane.snapshot().interfaces["wg-client-p1"]
            .peers
            .is_empty());
        assert!(tunnel.current_exit().await.is_none());
    }
}
