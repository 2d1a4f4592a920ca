//! Coordinator node: stream termination, auth, dispatch, RPC serving

use crate::orchestrator::ExitOrchestrator;
use crate::relay::RelayProvisioner;
use crate::session::Session;
use crate::stream_manager::{StreamManager, StreamManagerConfig};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};
use wgmesh_dataplane::DataPlane;
use wgmesh_identity::{verify_auth, NonceCache};
use wgmesh_proto::{
    ControlError, ControlMessage, ControlPayload, PeerRole,
};
use wgmesh_directory::DirectoryClient;
use wgmesh_transport::{
    ControlConnection, ControlStream, QuicConfig, QuicConnector, QuicListener,
};

/// Relay data-plane settings
#[derive(Debug, Clone)]
pub struct RelaySettings {
    /// Interface name; defaults to `wg-relay-<coordinator_id>`
    pub interface: Option<String>,
    pub listen_port: u16,
    pub pool_cidr: String,
    pub egress_interface: String,
    /// Force every allocation through the relay regardless of what the
    /// exit declares
    pub force_relay: bool,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            interface: None,
            listen_port: 51820,
            pool_cidr: "10.8.0.0/24".to_string(),
            egress_interface: "eth0".to_string(),
            force_relay: false,
        }
    }
}

#[derive(Clone)]
pub struct CoordinatorConfig {
    pub coordinator_id: String,
    pub region: String,
    pub listen_addr: SocketAddr,
    /// Host peers use to reach this coordinator (relay endpoint)
    pub public_address: String,
    pub directory_addr: SocketAddr,
    pub directory_server_name: String,
    pub server_config: Arc<QuicConfig>,
    /// Client config for directory and inter-coordinator dials
    pub client_config: Arc<QuicConfig>,
    pub max_capacity: u32,
    pub directory_heartbeat_interval: Duration,
    /// Clock-skew tolerance for the auth timestamp
    pub auth_timestamp_skew: Duration,
    pub session: StreamManagerConfig,
    pub relay: RelaySettings,
}

impl CoordinatorConfig {
    pub fn new(
        coordinator_id: &str,
        region: &str,
        listen_addr: SocketAddr,
        directory_addr: SocketAddr,
        server_config: Arc<QuicConfig>,
        client_config: Arc<QuicConfig>,
    ) -> Self {
        Self {
            coordinator_id: coordinator_id.to_string(),
            region: region.to_string(),
            listen_addr,
            public_address: "127.0.0.1".to_string(),
            directory_addr,
            directory_server_name: "localhost".to_string(),
            server_config,
            client_config,
            max_capacity: 1000,
            directory_heartbeat_interval: Duration::from_secs(30),
            auth_timestamp_skew: Duration::from_secs(120),
            session: StreamManagerConfig::default(),
            relay: RelaySettings::default(),
        }
    }
}

/// Regional control-plane node.
///
/// One QUIC listener serves both conversations, routed by the first
/// frame on each stream: `AuthRequest` opens a persistent peer session,
/// `AllocateExitPeerRequest` runs the unary inter-coordinator RPC.
pub struct Coordinator {
    config: CoordinatorConfig,
    listener: QuicListener,
    stream_manager: Arc<StreamManager>,
    orchestrator: Arc<ExitOrchestrator>,
    directory: Arc<DirectoryClient>,
    nonces: NonceCache,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Coordinator {
    /// Bind the listener and stand up the relay data plane.
    /// `Unavailable` from the data plane here is fatal.
    pub async fn new(
        config: CoordinatorConfig,
        dataplane: Arc<dyn DataPlane>,
    ) -> Result<Arc<Self>, ControlError> {
        let listener = QuicListener::new(config.listen_addr, config.server_config.clone())
            .map_err(|e| ControlError::Unavailable(format!("listener bind: {}", e)))?;

        let directory = Arc::new(
            DirectoryClient::new(
                config.directory_addr,
                &config.directory_server_name,
                config.client_config.clone(),
            )
            .map_err(|e| ControlError::Unavailable(format!("directory client: {}", e)))?,
        );

        let relay_interface = config
            .relay
            .interface
            .clone()
            .unwrap_or_else(|| format!("wg-relay-{}", config.coordinator_id));
        let relay = Arc::new(RelayProvisioner::new(
            dataplane,
            relay_interface,
            config.relay.listen_port,
            config.relay.egress_interface.clone(),
            &config.relay.pool_cidr,
        )?);
        relay.ensure().await?;

        let stream_manager = Arc::new(StreamManager::new(config.session.clone()));

        let connector = QuicConnector::new(config.client_config.clone())
            .map_err(|e| ControlError::Unavailable(format!("rpc connector: {}", e)))?;

        let orchestrator = Arc::new(ExitOrchestrator::new(
            config.coordinator_id.clone(),
            config.region.clone(),
            config.public_address.clone(),
            directory.clone(),
            connector,
            relay,
            stream_manager.clone(),
            config.relay.force_relay,
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(Arc::new(Self {
            config,
            listener,
            stream_manager,
            orchestrator,
            directory,
            nonces: NonceCache::default(),
            shutdown_tx,
            shutdown_rx,
        }))
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ControlError> {
        self.listener
            .local_addr()
            .map_err(|e| ControlError::Unavailable(e.to_string()))
    }

    pub fn stream_manager(&self) -> &Arc<StreamManager> {
        &self.stream_manager
    }

    pub fn orchestrator(&self) -> &Arc<ExitOrchestrator> {
        &self.orchestrator
    }

    /// Request graceful shutdown: background loops exit, the listener
    /// closes, and every session transport is closed.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        for session in self.stream_manager.active_sessions() {
            session.mark_inactive();
            session.close_transport(b"coordinator shutting down");
        }
        self.listener.close();
    }

    /// Serve until stopped
    pub async fn run(self: Arc<Self>) {
        info!(
            coordinator_id = %self.config.coordinator_id,
            region = %self.config.region,
            addr = %self.local_addr().map(|a| a.to_string()).unwrap_or_default(),
            "Starting coordinator"
        );

        let heartbeat = tokio::spawn(self.clone().directory_heartbeat_loop());
        let sweeper = tokio::spawn(self.clone().session_sweep_loop());

        let mut shutdown = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((connection, peer_addr)) => {
                            let node = self.clone();
                            tokio::spawn(async move {
                                node.handle_connection(Arc::new(connection), peer_addr).await;
                            });
                        }
                        Err(e) => {
                            debug!("Coordinator accept loop ended: {}", e);
                            break;
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Coordinator shutting down");
                        break;
                    }
                }
            }
        }

        heartbeat.abort();
        sweeper.abort();
    }

    async fn directory_heartbeat_loop(self: Arc<Self>) {
        let port = match self.local_addr() {
            Ok(addr) => addr.port(),
            Err(_) => return,
        };

        let mut ticker = tokio::time::interval(self.config.directory_heartbeat_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut shutdown = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let load = self.stream_manager.active_count() as u32;
                    if let Err(e) = self
                        .directory
                        .register_coordinator(
                            &self.config.coordinator_id,
                            &self.config.region,
                            &self.config.public_address,
                            port,
                            load,
                            self.config.max_capacity,
                        )
                        .await
                    {
                        error!("Directory heartbeat failed: {}", e);
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    async fn session_sweep_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.stream_manager.config().sweep_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut shutdown = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let evicted = self.stream_manager.sweep_stale();
                    for session in evicted {
                        self.orchestrator.release_for_client(&session.peer_id).await;
                        self.orchestrator.release_exits_for_peer(&session.peer_id);
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    async fn handle_connection(
        self: Arc<Self>,
        connection: Arc<ControlConnection>,
        peer_addr: SocketAddr,
    ) {
        debug!("New connection from {}", peer_addr);

        loop {
            let stream = match connection.accept_stream().await {
                Ok(stream) => stream,
                Err(_) => {
                    debug!("Connection from {} closed", peer_addr);
                    return;
                }
            };

            let node = self.clone();
            let conn = connection.clone();
            tokio::spawn(async move {
                node.handle_stream(conn, stream, peer_addr).await;
            });
        }
    }

    /// Route one stream by its first frame
    async fn handle_stream(
        self: Arc<Self>,
        connection: Arc<ControlConnection>,
        mut stream: ControlStream,
        peer_addr: SocketAddr,
    ) {
        let first: ControlMessage = match tokio::time::timeout(
            Duration::from_secs(30),
            stream.recv_message(),
        )
        .await
        {
            Ok(Ok(Some(msg))) => msg,
            Ok(Ok(None)) => return,
            Ok(Err(e)) => {
                debug!("Failed to read first frame from {}: {}", peer_addr, e);
                return;
            }
            Err(_) => {
                debug!("First frame from {} timed out", peer_addr);
                return;
            }
        };

        match first.payload {
            ControlPayload::AuthRequest {
                peer_id,
                role,
                public_key_b64,
                region,
                signature_b64,
                nonce_b64,
            } => {
                self.handle_control_stream(
                    connection,
                    stream,
                    peer_addr,
                    first.timestamp,
                    peer_id,
                    role,
                    public_key_b64,
                    region,
                    signature_b64,
                    nonce_b64,
                )
                .await;
            }
            ControlPayload::AllocateExitPeerRequest {
                client_id,
                client_pubkey,
                requesting_region,
                ..
            } => {
                self.handle_allocate_rpc(stream, client_id, client_pubkey, requesting_region)
                    .await;
            }
            ControlPayload::ReleaseExitPeerRequest { allocation_id } => {
                let response = match self.orchestrator.release_local_exit(&allocation_id).await {
                    Ok(()) => ControlPayload::ReleaseExitPeerResponse {
                        success: true,
                        message: "released".to_string(),
                    },
                    Err(e) => ControlPayload::ReleaseExitPeerResponse {
                        success: false,
                        message: e.to_string(),
                    },
                };
                let _ = stream.send_message(&ControlMessage::new(response)).await;
                let _ = stream.finish().await;
            }
            other => {
                warn!(
                    "Unauthenticated first frame from {}: {:?}, terminating stream",
                    peer_addr, other
                );
                let _ = stream
                    .send_message(&ControlMessage::new(ControlPayload::AuthResponse {
                        success: false,
                        message: "authentication required".to_string(),
                        session_id: String::new(),
                    }))
                    .await;
                let _ = stream.finish().await;
            }
        }
    }

    fn verify_auth_request(
        &self,
        sent_at: i64,
        peer_id: &str,
        role: PeerRole,
        public_key_b64: &str,
        region: &str,
        signature_b64: &str,
        nonce_b64: &str,
    ) -> Result<(), ControlError> {
        if peer_id.is_empty() || region.is_empty() {
            return Err(ControlError::InvalidArgument(
                "peer_id and region are required".to_string(),
            ));
        }

        let skew = self.config.auth_timestamp_skew.as_secs() as i64;
        let now = chrono::Utc::now().timestamp();
        if (now - sent_at).abs() > skew {
            return Err(ControlError::Unauthenticated(format!(
                "auth timestamp outside ±{}s window",
                skew
            )));
        }

        if !self.nonces.check_and_insert(peer_id, nonce_b64) {
            return Err(ControlError::Unauthenticated(
                "nonce replayed within window".to_string(),
            ));
        }

        verify_auth(
            public_key_b64,
            peer_id,
            role,
            region,
            nonce_b64,
            signature_b64,
        )
        .map_err(|e| ControlError::Unauthenticated(format!("signature verification: {}", e)))
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_control_stream(
        self: Arc<Self>,
        connection: Arc<ControlConnection>,
        stream: ControlStream,
        peer_addr: SocketAddr,
        auth_sent_at: i64,
        peer_id: String,
        role: PeerRole,
        public_key_b64: String,
        region: String,
        signature_b64: String,
        nonce_b64: String,
    ) {
        let mut stream = stream;

        if let Err(e) = self.verify_auth_request(
            auth_sent_at,
            &peer_id,
            role,
            &public_key_b64,
            &region,
            &signature_b64,
            &nonce_b64,
        ) {
            error!(peer_id = %peer_id, error = %e, "Authentication failed");
            self.stream_manager.record_auth_failure();

            let _ = stream
                .send_message(&ControlMessage::new(ControlPayload::AuthResponse {
                    success: false,
                    message: format!("authentication failed: {}", e),
                    session_id: String::new(),
                }))
                .await;
            // Finish the stream and give QUIC time to flush the refusal
            // before tearing the connection down
            let _ = stream.finish().await;
            tokio::time::sleep(Duration::from_millis(50)).await;
            connection.close(1, b"unauthenticated");
            return;
        }

        let session_id = uuid::Uuid::new_v4().to_string();
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<ControlMessage>(64);

        let (mut send_half, mut recv_half) = stream.split();

        // Writer task: the only path to the wire. Frames leave in
        // enqueue order; AuthResponse below is the first enqueue.
        let writer_peer = peer_id.clone();
        let writer = tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                if let Err(e) = send_half.send_message(&message).await {
                    debug!(peer_id = %writer_peer, "Writer stopping: {}", e);
                    break;
                }
            }
            let _ = send_half.finish().await;
        });

        let session = Arc::new(Session::new(
            peer_id.clone(),
            role,
            region.clone(),
            session_id.clone(),
            public_key_b64,
            peer_addr,
            outbound_tx,
            Some(connection.clone()),
        ));

        // AuthResponse is enqueued before the session becomes visible to
        // command dispatch, so it is always the first frame on the wire.
        if session
            .send(ControlMessage::new(ControlPayload::AuthResponse {
                success: true,
                message: "authentication successful".to_string(),
                session_id: session_id.clone(),
            }))
            .await
            .is_err()
        {
            return;
        }

        self.stream_manager.register(session.clone());

        info!(
            peer_id = %peer_id,
            role = %role,
            region = %region,
            session_id = %session_id,
            "Peer authenticated"
        );

        // Reader loop: single consumer of inbound frames
        loop {
            let message: ControlMessage = match recv_half.recv_message().await {
                Ok(Some(msg)) => msg,
                Ok(None) => {
                    info!(peer_id = %peer_id, "Control stream closed by peer");
                    break;
                }
                Err(e) => {
                    debug!(peer_id = %peer_id, "Control stream error: {}", e);
                    break;
                }
            };

            session.record_message_received();
            self.clone()
                .dispatch_session_message(&session, message.payload)
                .await;
        }

        if self
            .stream_manager
            .unregister(&peer_id, &session_id)
            .is_some()
        {
            self.orchestrator.release_for_client(&peer_id).await;
            self.orchestrator.release_exits_for_peer(&peer_id);
        }
        writer.abort();
    }

    async fn dispatch_session_message(
        self: Arc<Self>,
        session: &Arc<Session>,
        payload: ControlPayload,
    ) {
        match payload {
            ControlPayload::PingRequest { timestamp_ms, .. } => {
                let now_ms = chrono::Utc::now().timestamp_millis();
                let latency_ms = (now_ms - timestamp_ms) as f64;
                self.stream_manager
                    .update_heartbeat(&session.peer_id, latency_ms);

                let pong = ControlMessage::new(ControlPayload::PongResponse {
                    timestamp_ms: now_ms,
                    original_timestamp_ms: timestamp_ms,
                    peer_id: session.peer_id.clone(),
                });
                if let Err(e) = session.send(pong).await {
                    warn!(peer_id = %session.peer_id, "Failed to enqueue pong: {}", e);
                }
            }
            ControlPayload::CommandResponse(response) => {
                debug!(
                    peer_id = %session.peer_id,
                    command_id = response.command_id,
                    success = response.success,
                    "Received command response"
                );
                self.stream_manager
                    .handle_command_response(&session.peer_id, response);
            }
            ControlPayload::InfoRequest {
                requested_fields, ..
            } => {
                let mut info = HashMap::new();
                for field in requested_fields {
                    let value = match field.as_str() {
                        "active_peers" => self.stream_manager.active_count().to_string(),
                        "region" => self.config.region.clone(),
                        "coordinator_id" => self.config.coordinator_id.clone(),
                        _ => "unknown".to_string(),
                    };
                    info.insert(field, value);
                }

                let response = ControlMessage::new(ControlPayload::InfoResponse {
                    peer_id: session.peer_id.clone(),
                    info,
                });
                if let Err(e) = session.send(response).await {
                    warn!(peer_id = %session.peer_id, "Failed to enqueue info response: {}", e);
                }
            }
            ControlPayload::ExitRequest {
                target_region,
                tunnel_public_key,
                ..
            } => {
                session.set_tunnel_public_key(&tunnel_public_key);

                // The candidate walk can take several seconds; never
                // block the reader loop on it.
                let node = self.clone();
                let session = session.clone();
                tokio::spawn(async move {
                    let response = match node
                        .orchestrator
                        .request_exit(&session.peer_id, &tunnel_public_key, &target_region)
                        .await
                    {
                        Ok(allocated) => ControlPayload::ExitResponse {
                            success: true,
                            message: "exit allocated".to_string(),
                            exit_peer: Some(allocated.exit_peer),
                            allocation_id: allocated.allocation_id,
                            allocated_ip: allocated.allocated_ip,
                        },
                        Err(e) => {
                            warn!(
                                peer_id = %session.peer_id,
                                error = %e,
                                "Exit request failed"
                            );
                            ControlPayload::ExitResponse {
                                success: false,
                                message: e.to_string(),
                                exit_peer: None,
                                allocation_id: String::new(),
                                allocated_ip: String::new(),
                            }
                        }
                    };

                    let _ = session.send(ControlMessage::new(response)).await;
                });
            }
            ControlPayload::AuthRequest { .. } => {
                warn!(
                    peer_id = %session.peer_id,
                    "Duplicate auth request on established session, ignoring"
                );
            }
            other => {
                warn!(
                    peer_id = %session.peer_id,
                    "Unknown message on control stream: {:?}", other
                );
            }
        }
    }

    async fn handle_allocate_rpc(
        self: Arc<Self>,
        mut stream: ControlStream,
        client_id: String,
        client_pubkey: String,
        requesting_region: String,
    ) {
        debug!(
            client_id = %client_id,
            requesting_region = %requesting_region,
            "Inter-coordinator exit allocation request"
        );

        let response = match self
            .orchestrator
            .allocate_local_exit(&client_id, &client_pubkey)
            .await
        {
            Ok((exit_peer, allocation_id, allocated_ip)) => {
                ControlPayload::AllocateExitPeerResponse {
                    success: true,
                    message: "exit peer allocated".to_string(),
                    exit_peer: Some(exit_peer),
                    allocation_id,
                    allocated_ip,
                }
            }
            Err(e) => {
                warn!(client_id = %client_id, error = %e, "Local exit allocation failed");
                ControlPayload::AllocateExitPeerResponse {
                    success: false,
                    message: e.to_string(),
                    exit_peer: None,
                    allocation_id: String::new(),
                    allocated_ip: String::new(),
                }
            }
        };

        if let Err(e) = stream.send_message(&ControlMessage::new(response)).await {
            warn!("Failed to send allocation response: {}", e);
        }
        let _ = stream.finish().await;
    }
}
