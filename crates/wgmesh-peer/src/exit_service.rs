//! Exit-side data plane and client table
//!
//! When a peer serves the exit role it owns a tunnel interface with a
//! listen port, an address pool for its clients, and per-client NAT out
//! the egress interface. SETUP_EXIT, ROTATE_PEER and DISCONNECT arrive
//! as commands on the control stream and are handled here.

use crate::client::CommandHandler;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};
use wgmesh_dataplane::{DataPlane, DataPlaneError, IpPool};
use wgmesh_keys::WgKeyPair;
use wgmesh_proto::messages::setup_exit;
use wgmesh_proto::{Command, CommandResponse, ControlError};

#[derive(Debug, Clone)]
pub struct ExitServiceConfig {
    pub interface: String,
    pub listen_port: u16,
    pub pool_cidr: String,
    pub egress_interface: String,
    /// Whether this exit declares itself directly reachable
    pub advertise_direct: bool,
}

impl ExitServiceConfig {
    pub fn new(peer_id: &str, listen_port: u16) -> Self {
        Self {
            interface: format!("wg-exit-{}", peer_id),
            listen_port,
            pool_cidr: "10.9.0.0/24".to_string(),
            egress_interface: "eth0".to_string(),
            advertise_direct: false,
        }
    }
}

/// One client provisioned on the exit interface
#[derive(Debug, Clone)]
pub struct ExitClient {
    pub client_id: String,
    pub public_key: String,
    pub allocated_ip: Ipv4Addr,
    pub allowed_ips: Vec<String>,
    pub session_id: String,
    pub connected_at: DateTime<Utc>,
}

struct ExitState {
    pool: IpPool,
    clients: HashMap<String, ExitClient>,
}

/// Exit-role data plane. The pool lives and dies with the interface.
pub struct ExitService {
    config: ExitServiceConfig,
    dataplane: Arc<dyn DataPlane>,
    keys: WgKeyPair,
    state: Mutex<Option<ExitState>>,
}

impl ExitService {
    pub fn new(config: ExitServiceConfig, dataplane: Arc<dyn DataPlane>) -> Arc<Self> {
        Arc::new(Self {
            config,
            dataplane,
            keys: WgKeyPair::generate(),
            state: Mutex::new(None),
        })
    }

    /// Exit interface public key (for SETUP_EXIT responses)
    pub fn public_key(&self) -> String {
        self.keys.public.to_base64()
    }

    /// Declared endpoint; the coordinator substitutes the observed host
    pub fn endpoint(&self) -> String {
        format!("0.0.0.0:{}", self.config.listen_port)
    }

    pub fn listen_port(&self) -> u16 {
        self.config.listen_port
    }

    pub async fn is_active(&self) -> bool {
        self.state.lock().await.is_some()
    }

    pub async fn clients(&self) -> Vec<ExitClient> {
        match self.state.lock().await.as_ref() {
            Some(state) => state.clients.values().cloned().collect(),
            None => Vec::new(),
        }
    }

    pub async fn client_count(&self) -> usize {
        match self.state.lock().await.as_ref() {
            Some(state) => state.clients.len(),
            None => 0,
        }
    }

    /// Bring the exit interface up: create, key, address, forwarding.
    /// Idempotent; a second start while active is a no-op.
    pub async fn start(&self) -> Result<(), ControlError> {
        let mut state = self.state.lock().await;
        if state.is_some() {
            return Ok(());
        }

        let pool = IpPool::new(&self.config.pool_cidr)?;
        let gateway = pool
            .cidr()
            .hosts()
            .next()
            .ok_or_else(|| ControlError::InvalidArgument("exit pool too small".to_string()))?;
        pool.reserve(gateway)?;

        self.dataplane
            .interface_create(&self.config.interface)
            .await?;

        let address = format!("{}/{}", gateway, pool.cidr().prefix_len());
        if let Err(e) = self
            .dataplane
            .interface_configure(
                &self.config.interface,
                &self.keys.private.to_base64(),
                Some(self.config.listen_port),
                Some(&address),
            )
            .await
        {
            let _ = self.dataplane.interface_delete(&self.config.interface).await;
            return Err(ControlError::from(e).at_step("exit interface configure"));
        }

        if let Err(e) = self.dataplane.forwarding_enable().await {
            let _ = self.dataplane.interface_delete(&self.config.interface).await;
            return Err(ControlError::from(e).at_step("exit forwarding enable"));
        }

        info!(
            interface = %self.config.interface,
            listen_port = self.config.listen_port,
            public_key = %self.public_key(),
            "Exit interface initialized"
        );

        *state = Some(ExitState {
            pool,
            clients: HashMap::new(),
        });
        Ok(())
    }

    /// Tear everything down: peers, NAT rules, addresses, interface.
    /// Cleanup is best-effort; missing pieces are tolerated.
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        let Some(exit_state) = state.take() else {
            return;
        };

        for client in exit_state.clients.values() {
            if let Err(e) = self
                .dataplane
                .nat_remove(
                    &client.allocated_ip.to_string(),
                    &self.config.egress_interface,
                )
                .await
            {
                if !matches!(e, DataPlaneError::NotFound(_)) {
                    warn!(client_id = %client.client_id, error = %e, "NAT cleanup failed");
                }
            }
            if let Err(e) = self
                .dataplane
                .peer_remove(&self.config.interface, &client.public_key)
                .await
            {
                if !matches!(e, DataPlaneError::NotFound(_)) {
                    warn!(client_id = %client.client_id, error = %e, "Peer cleanup failed");
                }
            }
            exit_state.pool.release(client.allocated_ip);
        }

        if let Err(e) = self.dataplane.interface_delete(&self.config.interface).await {
            if !matches!(e, DataPlaneError::NotFound(_)) {
                warn!(interface = %self.config.interface, error = %e, "Interface delete failed");
            }
        }

        info!(interface = %self.config.interface, "Exit interface torn down");
    }

    /// Provision one client: address, peer entry, NAT. Rolls back in
    /// reverse order on failure.
    pub async fn add_client(
        &self,
        client_id: &str,
        public_key: &str,
        session_id: &str,
        allowed_ips: Vec<String>,
    ) -> Result<ExitClient, ControlError> {
        let mut state = self.state.lock().await;
        let exit_state = state
            .as_mut()
            .ok_or_else(|| ControlError::Unavailable("exit mode not active".to_string()))?;

        if exit_state.clients.contains_key(client_id) {
            return Err(ControlError::Conflict(format!(
                "client {} already present",
                client_id
            )));
        }

        let allocated_ip = exit_state
            .pool
            .allocate()
            .map_err(|e| ControlError::from(e).at_step("exit ip allocation"))?;

        let peer_allowed = vec![format!("{}/32", allocated_ip)];
        if let Err(e) = self
            .dataplane
            .peer_add(&self.config.interface, public_key, &peer_allowed, None)
            .await
        {
            exit_state.pool.release(allocated_ip);
            return Err(ControlError::from(e).at_step("exit peer add"));
        }

        if let Err(e) = self
            .dataplane
            .nat_add(&allocated_ip.to_string(), &self.config.egress_interface)
            .await
        {
            if let Err(undo) = self
                .dataplane
                .peer_remove(&self.config.interface, public_key)
                .await
            {
                warn!(error = %undo, "Rollback peer_remove failed");
            }
            exit_state.pool.release(allocated_ip);
            return Err(ControlError::from(e).at_step("exit nat add"));
        }

        let client = ExitClient {
            client_id: client_id.to_string(),
            public_key: public_key.to_string(),
            allocated_ip,
            allowed_ips,
            session_id: session_id.to_string(),
            connected_at: Utc::now(),
        };
        exit_state.clients.insert(client_id.to_string(), client.clone());

        info!(
            client_id = %client_id,
            allocated_ip = %allocated_ip,
            session_id = %session_id,
            "Added client to exit"
        );
        Ok(client)
    }

    /// Remove one client and release everything it held
    pub async fn remove_client(&self, client_id: &str) -> Result<(), ControlError> {
        let mut state = self.state.lock().await;
        let exit_state = state
            .as_mut()
            .ok_or_else(|| ControlError::Unavailable("exit mode not active".to_string()))?;

        let client = exit_state
            .clients
            .remove(client_id)
            .ok_or_else(|| ControlError::NotFound(format!("client {}", client_id)))?;

        if let Err(e) = self
            .dataplane
            .nat_remove(
                &client.allocated_ip.to_string(),
                &self.config.egress_interface,
            )
            .await
        {
            if !matches!(e, DataPlaneError::NotFound(_)) {
                warn!(client_id = %client_id, error = %e, "NAT removal failed");
            }
        }

        if let Err(e) = self
            .dataplane
            .peer_remove(&self.config.interface, &client.public_key)
            .await
        {
            if !matches!(e, DataPlaneError::NotFound(_)) {
                warn!(client_id = %client_id, error = %e, "Peer removal failed");
            }
        }

        exit_state.pool.release(client.allocated_ip);

        info!(
            client_id = %client_id,
            allocated_ip = %client.allocated_ip,
            "Removed client from exit"
        );
        Ok(())
    }

    /// Remove the client bound to an allocation id
    pub async fn remove_by_session(&self, session_id: &str) -> Result<(), ControlError> {
        let client_id = {
            let state = self.state.lock().await;
            let exit_state = state
                .as_ref()
                .ok_or_else(|| ControlError::Unavailable("exit mode not active".to_string()))?;
            exit_state
                .clients
                .values()
                .find(|c| c.session_id == session_id)
                .map(|c| c.client_id.clone())
                .ok_or_else(|| {
                    ControlError::NotFound(format!("no client for session {}", session_id))
                })?
        };
        self.remove_client(&client_id).await
    }

    /// Swap a client's tunnel key, keeping its address
    pub async fn rotate_client(
        &self,
        client_id: &str,
        new_public_key: &str,
    ) -> Result<(), ControlError> {
        let mut state = self.state.lock().await;
        let exit_state = state
            .as_mut()
            .ok_or_else(|| ControlError::Unavailable("exit mode not active".to_string()))?;

        let client = exit_state
            .clients
            .get_mut(client_id)
            .ok_or_else(|| ControlError::NotFound(format!("client {}", client_id)))?;

        if let Err(e) = self
            .dataplane
            .peer_remove(&self.config.interface, &client.public_key)
            .await
        {
            if !matches!(e, DataPlaneError::NotFound(_)) {
                return Err(ControlError::from(e).at_step("rotate peer remove"));
            }
        }

        let allowed = vec![format!("{}/32", client.allocated_ip)];
        self.dataplane
            .peer_add(&self.config.interface, new_public_key, &allowed, None)
            .await
            .map_err(|e| ControlError::from(e).at_step("rotate peer add"))?;

        info!(
            client_id = %client_id,
            "Rotated client tunnel key"
        );
        client.public_key = new_public_key.to_string();
        Ok(())
    }
}

// ----------------------------------------------------------------------
// Command handlers
// ----------------------------------------------------------------------

/// SETUP_EXIT: provision a client on the exit interface
pub struct SetupExitHandler {
    service: Arc<ExitService>,
}

impl SetupExitHandler {
    pub fn new(service: Arc<ExitService>) -> Arc<Self> {
        Arc::new(Self { service })
    }
}

#[async_trait]
impl CommandHandler for SetupExitHandler {
    async fn handle(&self, command: &Command) -> CommandResponse {
        let (Some(client_id), Some(client_pubkey), Some(session_id)) = (
            command.field(setup_exit::CLIENT_ID),
            command.field(setup_exit::CLIENT_PUBKEY),
            command.field(setup_exit::SESSION_ID),
        ) else {
            return CommandResponse::failed(
                command.command_id,
                "missing required parameters: client_id, client_pubkey, session_id",
            );
        };

        let allowed_ips: Vec<String> = match command.field(setup_exit::ALLOWED_IPS) {
            Some(raw) => raw.split(',').map(|s| s.trim().to_string()).collect(),
            None => vec!["0.0.0.0/0".to_string()],
        };

        match self
            .service
            .add_client(client_id, client_pubkey, session_id, allowed_ips)
            .await
        {
            Ok(client) => {
                let mut result = HashMap::new();
                result.insert(
                    setup_exit::RESULT_ALLOCATED_IP.to_string(),
                    client.allocated_ip.to_string(),
                );
                result.insert(
                    setup_exit::RESULT_ENDPOINT.to_string(),
                    self.service.endpoint(),
                );
                result.insert(
                    setup_exit::RESULT_PUBLIC_KEY.to_string(),
                    self.service.public_key(),
                );
                result.insert(
                    "supports_direct".to_string(),
                    self.service.config.advertise_direct.to_string(),
                );
                CommandResponse::ok_with(command.command_id, "client added", result)
            }
            Err(e) => {
                warn!(client_id = %client_id, error = %e, "SETUP_EXIT failed");
                CommandResponse::failed(command.command_id, format!("failed to add client: {}", e))
            }
        }
    }
}

/// ROTATE_PEER: swap a provisioned client's tunnel key
pub struct RotatePeerHandler {
    service: Arc<ExitService>,
}

impl RotatePeerHandler {
    pub fn new(service: Arc<ExitService>) -> Arc<Self> {
        Arc::new(Self { service })
    }
}

#[async_trait]
impl CommandHandler for RotatePeerHandler {
    async fn handle(&self, command: &Command) -> CommandResponse {
        let (Some(client_id), Some(new_pubkey)) = (
            command.field(setup_exit::CLIENT_ID),
            command.field("new_pubkey"),
        ) else {
            return CommandResponse::failed(
                command.command_id,
                "missing required parameters: client_id, new_pubkey",
            );
        };

        match self.service.rotate_client(client_id, new_pubkey).await {
            Ok(()) => CommandResponse::ok(command.command_id, "peer rotated"),
            Err(e) => CommandResponse::failed(command.command_id, e.to_string()),
        }
    }
}

/// DISCONNECT (exit side): release the client bound to an allocation.
/// The response is returned first; teardown runs deferred.
pub struct DisconnectHandler {
    service: Arc<ExitService>,
}

impl DisconnectHandler {
    pub fn new(service: Arc<ExitService>) -> Arc<Self> {
        Arc::new(Self { service })
    }
}

#[async_trait]
impl CommandHandler for DisconnectHandler {
    async fn handle(&self, command: &Command) -> CommandResponse {
        let Some(session_id) = command.field(setup_exit::SESSION_ID) else {
            return CommandResponse::failed(command.command_id, "missing session_id");
        };

        let service = self.service.clone();
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            // Deferred so the response leaves before teardown
            tokio::time::sleep(Duration::from_millis(200)).await;
            if let Err(e) = service.remove_by_session(&session_id).await {
                warn!(session_id = %session_id, error = %e, "Deferred disconnect failed");
            }
        });

        CommandResponse::ok(command.command_id, "disconnect scheduled")
    }
}
