//! Exit allocation across coordinators
//!
//! The requesting side resolves a target-region coordinator through the
//! directory, walks the candidates in load order, and asks the chosen
//! remote to set up an exit peer. The remote side picks its least-loaded
//! exit session and pushes SETUP_EXIT down that peer's stream. If the
//! requester cannot be reached directly, the requesting coordinator
//! splices a relay path before handing the tunnel parameters back.

use crate::relay::{RelayLease, RelayProvisioner};
use crate::stream_manager::StreamManager;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};
use wgmesh_proto::messages::setup_exit;
use wgmesh_proto::{
    CommandKind, ControlError, ControlMessage, ControlPayload, CoordinatorInfo, ExitPeerInfo,
};
use wgmesh_directory::DirectoryClient;
use wgmesh_transport::{ControlConnection, QuicConnector};

/// One active client→exit assignment, owned by the originating
/// coordinator. The allocation id is opaque and echoed on every related
/// command.
#[derive(Debug, Clone)]
pub struct ExitAllocation {
    pub allocation_id: String,
    pub client_peer_id: String,
    pub origin_region: String,
    pub target_region: String,
    pub exit_peer_id: String,
    pub exit_coordinator_id: String,
    pub allocated_ip: String,
    pub relay: Option<RelayLease>,
    pub created_at: DateTime<Utc>,
}

/// Outcome of a successful allocation, as handed back to the requester
#[derive(Debug, Clone)]
pub struct AllocatedExit {
    pub exit_peer: ExitPeerInfo,
    pub allocation_id: String,
    pub allocated_ip: String,
}

pub struct ExitOrchestrator {
    coordinator_id: String,
    region: String,
    /// Host peers use to reach this coordinator's relay endpoint
    public_address: String,
    directory: Arc<DirectoryClient>,
    connector: QuicConnector,
    rpc_connections: Mutex<HashMap<String, Arc<ControlConnection>>>,
    allocations: RwLock<HashMap<String, ExitAllocation>>,
    /// Exit-side bookkeeping: local exit peer id -> live allocation ids
    exit_load: RwLock<HashMap<String, HashSet<String>>>,
    relay: Arc<RelayProvisioner>,
    stream_manager: Arc<StreamManager>,
    force_relay: bool,
    rpc_timeout: Duration,
}

impl ExitOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        coordinator_id: String,
        region: String,
        public_address: String,
        directory: Arc<DirectoryClient>,
        connector: QuicConnector,
        relay: Arc<RelayProvisioner>,
        stream_manager: Arc<StreamManager>,
        force_relay: bool,
    ) -> Self {
        Self {
            coordinator_id,
            region,
            public_address,
            directory,
            connector,
            rpc_connections: Mutex::new(HashMap::new()),
            allocations: RwLock::new(HashMap::new()),
            exit_load: RwLock::new(HashMap::new()),
            relay,
            stream_manager,
            force_relay,
            // Remote waits up to the command timeout for its exit peer;
            // leave headroom on top of that.
            rpc_timeout: Duration::from_secs(15),
        }
    }

    // ------------------------------------------------------------------
    // Requesting side
    // ------------------------------------------------------------------

    /// Arrange an exit in `target_region` for a local client peer.
    ///
    /// Per-candidate failures are logged and the walk advances; the
    /// caller sees a single error for the whole request.
    pub async fn request_exit(
        &self,
        client_peer_id: &str,
        client_tunnel_key: &str,
        target_region: &str,
    ) -> Result<AllocatedExit, ControlError> {
        let candidates = self
            .directory
            .candidates(target_region, &self.coordinator_id)
            .await
            .map_err(|e| e.at_step("directory lookup"))?;

        if candidates.is_empty() {
            return Err(ControlError::NoCandidate(format!(
                "no coordinators in region {}",
                target_region
            )));
        }

        let mut remote_result = None;
        for candidate in &candidates {
            match self
                .allocate_remote(candidate, client_peer_id, client_tunnel_key)
                .await
            {
                Ok(result) => {
                    remote_result = Some((candidate.coordinator_id.clone(), result));
                    break;
                }
                Err(e) => {
                    warn!(
                        coordinator_id = %candidate.coordinator_id,
                        error = %e,
                        "Exit candidate failed, advancing"
                    );
                }
            }
        }

        let (exit_coordinator_id, (mut exit_peer, allocation_id, allocated_ip)) = remote_result
            .ok_or_else(|| {
                ControlError::NoCandidate(format!(
                    "all {} coordinator(s) in region {} failed",
                    candidates.len(),
                    target_region
                ))
            })?;

        // Reachability decision: explicit configuration or the exit's own
        // declaration, never inferred from traffic.
        let relayed = self.force_relay || !exit_peer.supports_direct;
        let mut relay_lease = None;

        if relayed {
            match self.relay.provision(client_tunnel_key).await {
                Ok(lease) => {
                    // Endpoint is substituted; exit key and allocation id
                    // stay exactly as the remote returned them.
                    exit_peer.endpoint =
                        format!("{}:{}", self.public_address, self.relay.listen_port());
                    relay_lease = Some(lease);
                }
                Err(e) => {
                    // The remote already committed its side; undo it so a
                    // failed request leaves no state at either coordinator.
                    self.release_remote(&candidates, &exit_coordinator_id, &allocation_id)
                        .await;
                    return Err(e);
                }
            }
        }

        let allocation = ExitAllocation {
            allocation_id: allocation_id.clone(),
            client_peer_id: client_peer_id.to_string(),
            origin_region: self.region.clone(),
            target_region: target_region.to_string(),
            exit_peer_id: exit_peer.peer_id.clone(),
            exit_coordinator_id,
            allocated_ip: allocated_ip.clone(),
            relay: relay_lease,
            created_at: Utc::now(),
        };

        info!(
            client_peer_id = %client_peer_id,
            exit_peer_id = %exit_peer.peer_id,
            allocation_id = %allocation_id,
            relayed = relayed,
            "Exit allocated"
        );

        self.allocations
            .write()
            .unwrap()
            .insert(allocation_id.clone(), allocation);

        Ok(AllocatedExit {
            exit_peer,
            allocation_id,
            allocated_ip,
        })
    }

    async fn rpc_connection(
        &self,
        candidate: &CoordinatorInfo,
    ) -> Result<Arc<ControlConnection>, ControlError> {
        let mut cached = self.rpc_connections.lock().await;

        if let Some(conn) = cached.get(&candidate.coordinator_id) {
            if !conn.is_closed() {
                return Ok(conn.clone());
            }
        }

        let addr = format!("{}:{}", candidate.address, candidate.port)
            .parse()
            .map_err(|e| {
                ControlError::InvalidArgument(format!(
                    "bad coordinator address {}:{}: {}",
                    candidate.address, candidate.port, e
                ))
            })?;

        let conn = self
            .connector
            .connect(addr, "localhost")
            .await
            .map_err(|e| ControlError::Unavailable(format!("coordinator dial: {}", e)))?;
        let conn = Arc::new(conn);
        cached.insert(candidate.coordinator_id.clone(), conn.clone());
        Ok(conn)
    }

    async fn allocate_remote(
        &self,
        candidate: &CoordinatorInfo,
        client_id: &str,
        client_pubkey: &str,
    ) -> Result<(ExitPeerInfo, String, String), ControlError> {
        let conn = self.rpc_connection(candidate).await?;

        let mut stream = conn
            .open_stream()
            .await
            .map_err(|e| ControlError::Unavailable(format!("rpc stream: {}", e)))?;

        stream
            .send_message(&ControlMessage::new(
                ControlPayload::AllocateExitPeerRequest {
                    client_id: client_id.to_string(),
                    client_pubkey: client_pubkey.to_string(),
                    requesting_region: self.region.clone(),
                    session_id_hint: None,
                },
            ))
            .await
            .map_err(|e| ControlError::Unavailable(format!("rpc send: {}", e)))?;
        stream
            .finish()
            .await
            .map_err(|e| ControlError::Unavailable(format!("rpc finish: {}", e)))?;

        let response: ControlMessage =
            tokio::time::timeout(self.rpc_timeout, stream.recv_message())
                .await
                .map_err(|_| {
                    ControlError::Timeout(format!(
                        "allocate_exit_peer to {} timed out",
                        candidate.coordinator_id
                    ))
                })?
                .map_err(|e| ControlError::Unavailable(format!("rpc recv: {}", e)))?
                .ok_or_else(|| {
                    ControlError::Unavailable("remote closed rpc stream".to_string())
                })?;

        match response.payload {
            ControlPayload::AllocateExitPeerResponse {
                success: true,
                exit_peer: Some(exit_peer),
                allocation_id,
                allocated_ip,
                ..
            } => Ok((exit_peer, allocation_id, allocated_ip)),
            ControlPayload::AllocateExitPeerResponse { message, .. } => Err(
                ControlError::NoCandidate(format!("remote refused: {}", message)),
            ),
            other => Err(ControlError::Unavailable(format!(
                "unexpected rpc response: {:?}",
                other
            ))),
        }
    }

    /// Best-effort remote rollback after a local provisioning failure
    async fn release_remote(
        &self,
        candidates: &[CoordinatorInfo],
        exit_coordinator_id: &str,
        allocation_id: &str,
    ) {
        let Some(candidate) = candidates
            .iter()
            .find(|c| c.coordinator_id == exit_coordinator_id)
        else {
            return;
        };
        self.release_remote_at(candidate, allocation_id).await;
    }

    /// Best-effort release of a remote allocation, looking the exit
    /// coordinator up in the directory
    async fn release_remote_by_id(&self, exit_coordinator_id: &str, allocation_id: &str) {
        let all = match self.directory.list_all().await {
            Ok(all) => all,
            Err(e) => {
                warn!(error = %e, "Directory lookup for remote release failed");
                return;
            }
        };

        let Some(candidate) = all.iter().find(|c| c.coordinator_id == exit_coordinator_id)
        else {
            warn!(
                exit_coordinator_id = %exit_coordinator_id,
                "Exit coordinator no longer in directory, skipping remote release"
            );
            return;
        };
        self.release_remote_at(candidate, allocation_id).await;
    }

    async fn release_remote_at(&self, candidate: &CoordinatorInfo, allocation_id: &str) {
        let result = async {
            let conn = self.rpc_connection(candidate).await?;
            let mut stream = conn
                .open_stream()
                .await
                .map_err(|e| ControlError::Unavailable(format!("rpc stream: {}", e)))?;

            stream
                .send_message(&ControlMessage::new(ControlPayload::ReleaseExitPeerRequest {
                    allocation_id: allocation_id.to_string(),
                }))
                .await
                .map_err(|e| ControlError::Unavailable(format!("rpc send: {}", e)))?;
            stream
                .finish()
                .await
                .map_err(|e| ControlError::Unavailable(format!("rpc finish: {}", e)))?;

            tokio::time::timeout(self.rpc_timeout, stream.recv_message::<ControlMessage>())
                .await
                .map_err(|_| ControlError::Timeout("release_exit_peer".to_string()))?
                .map_err(|e| ControlError::Unavailable(format!("rpc recv: {}", e)))
        }
        .await;

        if let Err(e) = result {
            warn!(
                allocation_id = %allocation_id,
                exit_coordinator_id = %candidate.coordinator_id,
                error = %e,
                "Remote release failed; exit side will age out on rotation"
            );
        }
    }

    /// Drop every allocation belonging to a client peer (session loss or
    /// explicit disconnect), revoking relay state on the way out.
    pub async fn release_for_client(&self, client_peer_id: &str) {
        let dropped: Vec<ExitAllocation> = {
            let mut allocations = self.allocations.write().unwrap();
            let ids: Vec<String> = allocations
                .values()
                .filter(|a| a.client_peer_id == client_peer_id)
                .map(|a| a.allocation_id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| allocations.remove(&id))
                .collect()
        };

        for allocation in dropped {
            if let Some(lease) = &allocation.relay {
                self.relay.revoke(lease).await;
            }
            self.release_remote_by_id(
                &allocation.exit_coordinator_id,
                &allocation.allocation_id,
            )
            .await;
            info!(
                client_peer_id = %client_peer_id,
                allocation_id = %allocation.allocation_id,
                "Released exit allocation"
            );
        }
    }

    /// Drop one allocation by id
    pub async fn release_allocation(&self, allocation_id: &str) -> Result<(), ControlError> {
        let allocation = self
            .allocations
            .write()
            .unwrap()
            .remove(allocation_id)
            .ok_or_else(|| {
                ControlError::NotFound(format!("allocation {}", allocation_id))
            })?;

        if let Some(lease) = &allocation.relay {
            self.relay.revoke(lease).await;
        }
        self.release_remote_by_id(&allocation.exit_coordinator_id, allocation_id)
            .await;

        info!(allocation_id = %allocation_id, "Released exit allocation");
        Ok(())
    }

    pub fn allocation(&self, allocation_id: &str) -> Option<ExitAllocation> {
        self.allocations.read().unwrap().get(allocation_id).cloned()
    }

    pub fn allocation_count(&self) -> usize {
        self.allocations.read().unwrap().len()
    }

    // ------------------------------------------------------------------
    // Exit (remote) side
    // ------------------------------------------------------------------

    /// Serve an inter-coordinator allocation request against the local
    /// exit-capable sessions. Selection: fewest live allocations first,
    /// stable tie-break by peer id.
    pub async fn allocate_local_exit(
        &self,
        client_id: &str,
        client_pubkey: &str,
    ) -> Result<(ExitPeerInfo, String, String), ControlError> {
        let mut candidates = self.stream_manager.sessions_where(|s| s.role.provides_exit());
        if candidates.is_empty() {
            return Err(ControlError::NoCandidate(
                "no exit peers available".to_string(),
            ));
        }

        {
            let load = self.exit_load.read().unwrap();
            candidates.sort_by(|a, b| {
                let load_a = load.get(&a.peer_id).map(|s| s.len()).unwrap_or(0);
                let load_b = load.get(&b.peer_id).map(|s| s.len()).unwrap_or(0);
                load_a.cmp(&load_b).then_with(|| a.peer_id.cmp(&b.peer_id))
            });
        }
        let selected = candidates.remove(0);

        let allocation_id = uuid::Uuid::new_v4().to_string();

        let mut payload = HashMap::new();
        payload.insert(setup_exit::CLIENT_ID.to_string(), client_id.to_string());
        payload.insert(
            setup_exit::CLIENT_PUBKEY.to_string(),
            client_pubkey.to_string(),
        );
        payload.insert(
            setup_exit::SESSION_ID.to_string(),
            allocation_id.clone(),
        );
        payload.insert(
            setup_exit::ALLOWED_IPS.to_string(),
            "0.0.0.0/0".to_string(),
        );

        let response = self
            .stream_manager
            .send_command_await(&selected.peer_id, CommandKind::SetupExit, payload)
            .await
            .map_err(|e| e.at_step("setup_exit dispatch"))?;

        if !response.success {
            return Err(ControlError::Unavailable(format!(
                "exit peer {} rejected setup: {}",
                selected.peer_id, response.message
            )));
        }

        let allocated_ip = response
            .result
            .get(setup_exit::RESULT_ALLOCATED_IP)
            .cloned()
            .ok_or_else(|| {
                ControlError::InvalidArgument(
                    "setup_exit result missing allocated_ip".to_string(),
                )
            })?;
        let public_key = response
            .result
            .get(setup_exit::RESULT_PUBLIC_KEY)
            .cloned()
            .ok_or_else(|| {
                ControlError::InvalidArgument("setup_exit result missing public_key".to_string())
            })?;
        let declared_endpoint = response
            .result
            .get(setup_exit::RESULT_ENDPOINT)
            .cloned()
            .unwrap_or_default();

        let supports_direct = response
            .result
            .get("supports_direct")
            .map(|v| v == "true")
            .unwrap_or(false);

        // Exits declare a wildcard host; substitute the address this
        // coordinator actually observes for the peer.
        let endpoint = substitute_endpoint_host(
            &declared_endpoint,
            &selected.remote_address.ip().to_string(),
        );

        self.exit_load
            .write()
            .unwrap()
            .entry(selected.peer_id.clone())
            .or_default()
            .insert(allocation_id.clone());

        info!(
            client_id = %client_id,
            exit_peer_id = %selected.peer_id,
            allocation_id = %allocation_id,
            allocated_ip = %allocated_ip,
            "Local exit allocated"
        );

        Ok((
            ExitPeerInfo {
                peer_id: selected.peer_id.clone(),
                public_key,
                endpoint,
                allowed_ips: vec!["0.0.0.0/0".to_string()],
                supports_direct,
            },
            allocation_id,
            allocated_ip,
        ))
    }

    /// Undo one locally served allocation: forget the bookkeeping and
    /// tell the exit peer to release the client binding.
    pub async fn release_local_exit(&self, allocation_id: &str) -> Result<(), ControlError> {
        let exit_peer_id = {
            let mut load = self.exit_load.write().unwrap();
            let owner = load
                .iter_mut()
                .find(|(_, ids)| ids.contains(allocation_id))
                .map(|(peer_id, ids)| {
                    ids.remove(allocation_id);
                    peer_id.clone()
                });
            owner.ok_or_else(|| {
                ControlError::NotFound(format!("allocation {}", allocation_id))
            })?
        };

        let mut payload = HashMap::new();
        payload.insert(
            setup_exit::SESSION_ID.to_string(),
            allocation_id.to_string(),
        );
        self.stream_manager
            .send_command(&exit_peer_id, CommandKind::Disconnect, payload)
            .await?;

        info!(
            allocation_id = %allocation_id,
            exit_peer_id = %exit_peer_id,
            "Released local exit allocation"
        );
        Ok(())
    }

    /// Forget exit-side bookkeeping for an exit peer that unregistered
    pub fn release_exits_for_peer(&self, exit_peer_id: &str) {
        if let Some(ids) = self.exit_load.write().unwrap().remove(exit_peer_id) {
            info!(
                exit_peer_id = %exit_peer_id,
                allocations = ids.len(),
                "Dropped exit-side allocations for departed peer"
            );
        }
    }

    /// Live allocations served by a local exit peer (selection input)
    pub fn exit_load_for(&self, exit_peer_id: &str) -> usize {
        self.exit_load
            .read()
            .unwrap()
            .get(exit_peer_id)
            .map(|s| s.len())
            .unwrap_or(0)
    }
}

/// Replace a wildcard host in `host:port` with the observed address
fn substitute_endpoint_host(declared: &str, observed_host: &str) -> String {
    match declared.rsplit_once(':') {
        Some((host, port)) if host.is_empty() || host == "0.0.0.0" => {
            format!("{}:{}", observed_host, port)
        }
        Some(_) => declared.to_string(),
        None => declared.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_substitute_endpoint_host() {
        assert_eq!(
            substitute_endpoint_host("0.0.0.0:51820", "203.0.113.9"),
            "203.0.113.9:51820"
        );
        assert_eq!(
            substitute_endpoint_host("198.51.100.7:51820", "203.0.113.9"),
            "198.51.100.7:51820"
        );
        assert_eq!(substitute_endpoint_host("", "203.0.113.9"), "");
    }
}
