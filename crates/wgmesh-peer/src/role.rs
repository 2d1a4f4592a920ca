//! Runtime role control
//!
//! A peer may serve as client, exit, or both; the controller owns the
//! current role, stands the exit data plane up or down on transition,
//! and re-asserts the role upward through the stream client. One async
//! mutex serializes transitions against in-flight provisioning.

use crate::client::PeerClient;
use crate::client_tunnel::ClientTunnel;
use crate::exit_service::ExitService;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};
use wgmesh_proto::{ControlError, PeerRole};

pub struct RoleController {
    client: Arc<PeerClient>,
    client_tunnel: Arc<ClientTunnel>,
    exit_service: Arc<ExitService>,
    current: Mutex<PeerRole>,
}

impl RoleController {
    pub fn new(
        initial_role: PeerRole,
        client: Arc<PeerClient>,
        client_tunnel: Arc<ClientTunnel>,
        exit_service: Arc<ExitService>,
    ) -> Arc<Self> {
        Arc::new(Self {
            client,
            client_tunnel,
            exit_service,
            current: Mutex::new(initial_role),
        })
    }

    pub async fn current_role(&self) -> PeerRole {
        *self.current.lock().await
    }

    /// Bring the data plane in line with the initial role at startup
    pub async fn activate(&self) -> Result<(), ControlError> {
        let role = *self.current.lock().await;

        if role.consumes_exit() {
            self.client_tunnel.start().await?;
        }
        if role.provides_exit() {
            self.exit_service.start().await?;
        }

        info!(role = %role, "Role data plane activated");
        Ok(())
    }

    /// Tear down whatever the current role stood up
    pub async fn deactivate(&self) {
        let role = *self.current.lock().await;

        if role.provides_exit() {
            self.exit_service.stop().await;
        }
        if role.consumes_exit() {
            self.client_tunnel.stop().await;
        }
    }

    /// Move to a new role. All six directed edges between distinct
    /// roles are permitted; a same-role transition is a no-op. The exit
    /// interface comes up before the role is re-asserted upward and
    /// goes down after leaving exit service.
    pub async fn transition(&self, new_role: PeerRole) -> Result<(), ControlError> {
        let mut current = self.current.lock().await;
        let old_role = *current;

        if old_role == new_role {
            return Ok(());
        }

        info!(old_role = %old_role, new_role = %new_role, "Role transition");

        if new_role.provides_exit() && !old_role.provides_exit() {
            self.exit_service.start().await?;
        }
        if new_role.consumes_exit() && !old_role.consumes_exit() {
            self.client_tunnel.start().await?;
        }

        if !new_role.provides_exit() && old_role.provides_exit() {
            self.exit_service.stop().await;
        }
        if !new_role.consumes_exit() && old_role.consumes_exit() {
            self.client_tunnel.stop().await;
        }

        *current = new_role;

        // Republish upward; on failure the reconnect loop keeps
        // re-authenticating with the new role until it sticks.
        self.client.rebind_role(new_role);

        if !self.client.is_connected() {
            warn!(new_role = %new_role, "Role re-assertion deferred to reconnect loop");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::PeerClientConfig;
    use std::sync::OnceLock;
    use wgmesh_dataplane::MemoryDataPlane;
    use wgmesh_identity::PeerIdentity;
    use wgmesh_transport::QuicConfig;

    static CRYPTO_PROVIDER_INIT: OnceLock<()> = OnceLock::new();

    fn init_crypto_provider() {
        CRYPTO_PROVIDER_INIT.get_or_init(|| {
            let _ = rustls::crypto::ring::default_provider().install_default();
        });
    }

    fn controller(
        initial: PeerRole,
        dataplane: Arc<MemoryDataPlane>,
    ) -> Arc<RoleController> {
        init_crypto_provider();

        let config = PeerClientConfig::new(
            "p1",
            "us",
            "127.0.0.1:1".parse().unwrap(),
            Arc::new(QuicConfig::client_insecure()),
        );
        let client = PeerClient::new(config, PeerIdentity::generate()).unwrap();

        let tunnel = ClientTunnel::new("p1", dataplane.clone());
        let exit = ExitService::new(
            crate::exit_service::ExitServiceConfig::new("p1", 52000),
            dataplane,
        );

        RoleController::new(initial, client, tunnel, exit)
    }

    #[tokio::test]
    async fn test_client_to_hybrid_stands_up_exit_interface() {
        let dataplane = Arc::new(MemoryDataPlane::new());
        let controller = controller(PeerRole::Client, dataplane.clone());
        controller.activate().await.unwrap();

        assert!(dataplane.has_interface("wg-client-p1"));
        assert!(!dataplane.has_interface("wg-exit-p1"));

        controller.transition(PeerRole::Hybrid).await.unwrap();

        assert!(dataplane.has_interface("wg-client-p1"));
        assert!(dataplane.has_interface("wg-exit-p1"));
        assert_eq!(controller.current_role().await, PeerRole::Hybrid);
    }

    #[tokio::test]
    async fn test_hybrid_to_client_tears_down_exit_interface() {
        let dataplane = Arc::new(MemoryDataPlane::new());
        let controller = controller(PeerRole::Hybrid, dataplane.clone());
        controller.activate().await.unwrap();
        assert!(dataplane.has_interface("wg-exit-p1"));

        controller.transition(PeerRole::Client).await.unwrap();

        assert!(!dataplane.has_interface("wg-exit-p1"));
        assert!(dataplane.has_interface("wg-client-p1"));
    }

    #[tokio::test]
    async fn test_exit_to_client_swaps_interfaces() {
        let dataplane = Arc::new(MemoryDataPlane::new());
        let controller = controller(PeerRole::Exit, dataplane.clone());
        controller.activate().await.unwrap();
        assert!(dataplane.has_interface("wg-exit-p1"));
        assert!(!dataplane.has_interface("wg-client-p1"));

        controller.transition(PeerRole::Client).await.unwrap();

        assert!(!dataplane.has_interface("wg-exit-p1"));
        assert!(dataplane.has_interface("wg-client-p1"));
    }

    #[tokio::test]
    async fn test_same_role_transition_is_noop() {
        let dataplane = Arc::new(MemoryDataPlane::new());
        let controller = controller(PeerRole::Client, dataplane.clone());
        controller.activate().await.unwrap();

        let before = dataplane.snapshot();
        controller.transition(PeerRole::Client).await.unwrap();
        assert_eq!(dataplane.snapshot(), before);
    }

    #[tokio::test]
    async fn test_deactivate_cleans_up_everything() {
        let dataplane = Arc::new(MemoryDataPlane::new());
        let controller = controller(PeerRole::Hybrid, dataplane.clone());
        controller.activate().await.unwrap();
        controller.deactivate().await;

        assert!(!dataplane.has_interface("wg-exit-p1"));
        assert!(!dataplane.has_interface("wg-client-p1"));
    }
}
