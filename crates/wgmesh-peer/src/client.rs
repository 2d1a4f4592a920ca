//! Persistent stream client
//!
//! Owns the Disconnected → Dialing → Authenticating → Connected loop
//! against one coordinator: signed authentication, a single reader
//! loop, a serialized send channel, a heartbeat ticker with a miss
//! budget, and reconnection with capped exponential backoff. Inbound
//! commands dispatch through a handler table keyed by command kind; a
//! bounded replay cache makes command application idempotent.

use crate::backoff::{BackoffConfig, ReconnectBackoff};
use crate::replay::ReplayCache;
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use wgmesh_identity::PeerIdentity;
use wgmesh_proto::{
    Command, CommandResponse, ControlError, ControlMessage, ControlPayload, ExitPeerInfo, PeerRole,
};
use wgmesh_transport::{ControlConnection, ControlStream, QuicConfig, QuicConnector};

/// Handler for one command kind. Handlers convert their own failures
/// into `CommandResponse { success: false }`; they never tear the
/// stream down. Slow work is offloaded so the response returns quickly.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, command: &Command) -> CommandResponse;
}

/// Tunnel parameters granted by a successful exit request
#[derive(Debug, Clone)]
pub struct ExitGrant {
    pub exit_peer: ExitPeerInfo,
    pub allocation_id: String,
    pub allocated_ip: String,
}

#[derive(Clone)]
pub struct PeerClientConfig {
    pub peer_id: String,
    pub region: String,
    pub initial_role: PeerRole,
    pub coordinator_addr: SocketAddr,
    pub coordinator_server_name: String,
    pub quic: Arc<QuicConfig>,
    pub auth_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub heartbeat_miss_budget: Duration,
    pub exit_request_timeout: Duration,
    pub backoff: BackoffConfig,
}

impl PeerClientConfig {
    pub fn new(
        peer_id: &str,
        region: &str,
        coordinator_addr: SocketAddr,
        quic: Arc<QuicConfig>,
    ) -> Self {
        Self {
            peer_id: peer_id.to_string(),
            region: region.to_string(),
            initial_role: PeerRole::Client,
            coordinator_addr,
            coordinator_server_name: "localhost".to_string(),
            quic,
            auth_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_miss_budget: Duration::from_secs(90),
            exit_request_timeout: Duration::from_secs(30),
            backoff: BackoffConfig::default(),
        }
    }
}

enum DisconnectReason {
    /// Transport ended or heartbeats went unanswered: normal backoff
    Stream,
    /// Role rebind requested: redial immediately
    Rebind,
    Shutdown,
}

type ExitWaiter = oneshot::Sender<Result<ExitGrant, ControlError>>;

/// Client side of the persistent control stream
pub struct PeerClient {
    /// Back-reference for spawning the supervisor from `&self`
    self_ref: Weak<Self>,
    config: PeerClientConfig,
    identity: PeerIdentity,
    connector: QuicConnector,

    role: Mutex<PeerRole>,
    handlers: RwLock<HashMap<wgmesh_proto::CommandKind, Arc<dyn CommandHandler>>>,
    replay: ReplayCache,

    session_id: Mutex<Option<String>>,
    latency_ms: Mutex<f64>,
    last_pong: Mutex<Instant>,
    outbound: Mutex<Option<mpsc::Sender<ControlMessage>>>,
    pending_exit: Mutex<Option<ExitWaiter>>,

    connected_tx: watch::Sender<bool>,
    connected_rx: watch::Receiver<bool>,
    reconnect_now: Notify,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl PeerClient {
    pub fn new(config: PeerClientConfig, identity: PeerIdentity) -> Result<Arc<Self>, ControlError> {
        let connector = QuicConnector::new(config.quic.clone())
            .map_err(|e| ControlError::Unavailable(format!("connector: {}", e)))?;

        let (connected_tx, connected_rx) = watch::channel(false);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            role: Mutex::new(config.initial_role),
            config,
            identity,
            connector,
            handlers: RwLock::new(HashMap::new()),
            replay: ReplayCache::default(),
            session_id: Mutex::new(None),
            latency_ms: Mutex::new(0.0),
            last_pong: Mutex::new(Instant::now()),
            outbound: Mutex::new(None),
            pending_exit: Mutex::new(None),
            connected_tx,
            connected_rx,
            reconnect_now: Notify::new(),
            shutdown_tx,
            shutdown_rx,
            supervisor: Mutex::new(None),
        }))
    }

    /// Install or replace the handler for a command kind
    pub fn register_command_handler(
        &self,
        kind: wgmesh_proto::CommandKind,
        handler: Arc<dyn CommandHandler>,
    ) {
        self.handlers.write().unwrap().insert(kind, handler);
    }

    /// Spawn the reconnect loop; returns immediately
    pub fn start(&self) {
        let Some(client) = self.self_ref.upgrade() else {
            return;
        };

        let mut supervisor = self.supervisor.lock().unwrap();
        if supervisor.is_some() {
            return;
        }
        *supervisor = Some(tokio::spawn(async move {
            client.supervise().await;
        }));

        info!(
            peer_id = %self.config.peer_id,
            role = %self.role(),
            region = %self.config.region,
            "Peer stream client started"
        );
    }

    /// Request graceful termination and wait for background tasks
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        self.reconnect_now.notify_one();

        let handle = self.supervisor.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        info!(peer_id = %self.config.peer_id, "Peer stream client stopped");
    }

    pub fn is_connected(&self) -> bool {
        *self.connected_rx.borrow()
    }

    pub fn session_id(&self) -> Option<String> {
        self.session_id.lock().unwrap().clone()
    }

    pub fn current_latency_estimate(&self) -> f64 {
        *self.latency_ms.lock().unwrap()
    }

    pub fn role(&self) -> PeerRole {
        *self.role.lock().unwrap()
    }

    pub fn peer_id(&self) -> &str {
        &self.config.peer_id
    }

    /// Change the declared role. When connected this closes the current
    /// session and re-authenticates with the new role; the reconnect
    /// loop keeps retrying until it succeeds.
    pub fn rebind_role(&self, new_role: PeerRole) {
        let previous = {
            let mut role = self.role.lock().unwrap();
            let previous = *role;
            *role = new_role;
            previous
        };

        if previous != new_role && self.is_connected() {
            info!(
                peer_id = %self.config.peer_id,
                old_role = %previous,
                new_role = %new_role,
                "Role changed, reconnecting"
            );
            self.reconnect_now.notify_one();
        }
    }

    /// Wait until the client reports Connected (test and startup hook)
    pub async fn wait_connected(&self, timeout: Duration) -> bool {
        let mut rx = self.connected_rx.clone();
        tokio::time::timeout(timeout, async {
            while !*rx.borrow() {
                if rx.changed().await.is_err() {
                    return false;
                }
            }
            true
        })
        .await
        .unwrap_or(false)
    }

    /// Ask the coordinator for egress in `target_region`, announcing the
    /// tunnel key the exit should provision. One request in flight at a
    /// time.
    pub async fn request_exit(
        &self,
        target_region: &str,
        tunnel_public_key: &str,
    ) -> Result<ExitGrant, ControlError> {
        let tx = self
            .outbound
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| ControlError::Unavailable("not connected".to_string()))?;

        let (waiter_tx, waiter_rx) = oneshot::channel();
        {
            let mut pending = self.pending_exit.lock().unwrap();
            if pending.is_some() {
                return Err(ControlError::Conflict(
                    "exit request already in flight".to_string(),
                ));
            }
            *pending = Some(waiter_tx);
        }

        let request = ControlMessage::new(ControlPayload::ExitRequest {
            peer_id: self.config.peer_id.clone(),
            target_region: target_region.to_string(),
            tunnel_public_key: tunnel_public_key.to_string(),
        });

        if tx.send(request).await.is_err() {
            self.pending_exit.lock().unwrap().take();
            return Err(ControlError::Unavailable("send channel closed".to_string()));
        }

        match tokio::time::timeout(self.config.exit_request_timeout, waiter_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ControlError::Unavailable(
                "disconnected while awaiting exit response".to_string(),
            )),
            Err(_) => {
                self.pending_exit.lock().unwrap().take();
                Err(ControlError::Timeout("exit request".to_string()))
            }
        }
    }

    // ------------------------------------------------------------------
    // Connection lifecycle
    // ------------------------------------------------------------------

    async fn supervise(self: Arc<Self>) {
        let mut backoff = ReconnectBackoff::new(self.config.backoff.clone());
        let shutdown = self.shutdown_rx.clone();

        loop {
            if *shutdown.borrow() {
                break;
            }

            let reason = match self.establish().await {
                Ok((connection, stream, session_id)) => {
                    backoff.reset();
                    *self.session_id.lock().unwrap() = Some(session_id);
                    self.run_connected(connection, stream).await
                }
                Err(e) => {
                    warn!(
                        peer_id = %self.config.peer_id,
                        error = %e,
                        "Connection attempt failed"
                    );
                    DisconnectReason::Stream
                }
            };

            if *shutdown.borrow() || matches!(reason, DisconnectReason::Shutdown) {
                break;
            }

            if matches!(reason, DisconnectReason::Rebind) {
                continue;
            }

            let delay = backoff.next_delay();
            debug!(
                peer_id = %self.config.peer_id,
                delay_ms = delay.as_millis() as u64,
                attempt = backoff.attempt(),
                "Waiting before reconnect"
            );

            let mut shutdown_wait = shutdown.clone();
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.reconnect_now.notified() => {}
                _ = shutdown_wait.changed() => {}
            }
        }

        self.teardown_connection_state();
    }

    /// Dial and authenticate one stream
    async fn establish(
        &self,
    ) -> Result<(Arc<ControlConnection>, ControlStream, String), ControlError> {
        debug!(peer_id = %self.config.peer_id, "Dialing coordinator");

        let connection = self
            .connector
            .connect(
                self.config.coordinator_addr,
                &self.config.coordinator_server_name,
            )
            .await
            .map_err(|e| ControlError::Unavailable(format!("dial: {}", e)))?;

        let mut stream = connection
            .open_stream()
            .await
            .map_err(|e| ControlError::Unavailable(format!("control stream: {}", e)))?;

        let role = self.role();
        let nonce_b64 = PeerIdentity::fresh_nonce();
        let signature_b64 =
            self.identity
                .sign_auth(&self.config.peer_id, role, &self.config.region, &nonce_b64);

        stream
            .send_message(&ControlMessage::new(ControlPayload::AuthRequest {
                peer_id: self.config.peer_id.clone(),
                role,
                public_key_b64: self.identity.public_key_b64(),
                region: self.config.region.clone(),
                signature_b64,
                nonce_b64,
            }))
            .await
            .map_err(|e| ControlError::Unavailable(format!("auth send: {}", e)))?;

        let response: ControlMessage =
            tokio::time::timeout(self.config.auth_timeout, stream.recv_message())
                .await
                .map_err(|_| ControlError::Timeout("auth response".to_string()))?
                .map_err(|e| ControlError::Unavailable(format!("auth recv: {}", e)))?
                .ok_or_else(|| {
                    ControlError::Unauthenticated("stream closed during auth".to_string())
                })?;

        match response.payload {
            ControlPayload::AuthResponse {
                success: true,
                session_id,
                ..
            } => {
                info!(
                    peer_id = %self.config.peer_id,
                    session_id = %session_id,
                    role = %role,
                    "Authentication successful"
                );
                Ok((Arc::new(connection), stream, session_id))
            }
            ControlPayload::AuthResponse { message, .. } => {
                Err(ControlError::Unauthenticated(message))
            }
            other => Err(ControlError::Unauthenticated(format!(
                "unexpected auth reply: {:?}",
                other
            ))),
        }
    }

    /// Connected phase: reader loop, heartbeat ticker, and writer task
    /// cooperating through the send channel and the shutdown signal.
    async fn run_connected(
        &self,
        connection: Arc<ControlConnection>,
        stream: ControlStream,
    ) -> DisconnectReason {
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<ControlMessage>(64);
        *self.outbound.lock().unwrap() = Some(outbound_tx.clone());
        *self.last_pong.lock().unwrap() = Instant::now();
        let _ = self.connected_tx.send(true);

        let (mut send_half, mut recv_half) = stream.split();
        let writer = tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                if send_half.send_message(&message).await.is_err() {
                    break;
                }
            }
            let _ = send_half.finish().await;
        });

        let mut ticker = tokio::time::interval(self.config.heartbeat_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut shutdown = self.shutdown_rx.clone();

        let reason = loop {
            tokio::select! {
                inbound = recv_half.recv_message::<ControlMessage>() => {
                    match inbound {
                        Ok(Some(message)) => {
                            self.handle_inbound(message.payload, &outbound_tx).await;
                        }
                        Ok(None) => {
                            info!(peer_id = %self.config.peer_id, "Stream closed by coordinator");
                            break DisconnectReason::Stream;
                        }
                        Err(e) => {
                            debug!(peer_id = %self.config.peer_id, "Stream error: {}", e);
                            break DisconnectReason::Stream;
                        }
                    }
                }
                _ = ticker.tick() => {
                    let silent_for = self.last_pong.lock().unwrap().elapsed();
                    if silent_for > self.config.heartbeat_miss_budget {
                        warn!(
                            peer_id = %self.config.peer_id,
                            silent_secs = silent_for.as_secs(),
                            "Heartbeat miss budget exceeded"
                        );
                        break DisconnectReason::Stream;
                    }

                    let ping = ControlMessage::new(ControlPayload::PingRequest {
                        timestamp_ms: chrono::Utc::now().timestamp_millis(),
                        peer_id: self.config.peer_id.clone(),
                    });
                    if outbound_tx.send(ping).await.is_err() {
                        break DisconnectReason::Stream;
                    }
                }
                _ = self.reconnect_now.notified() => {
                    break DisconnectReason::Rebind;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break DisconnectReason::Shutdown;
                    }
                }
            }
        };

        self.teardown_connection_state();
        connection.close(0, b"peer disconnecting");
        drop(outbound_tx);
        let _ = writer.await;

        reason
    }

    fn teardown_connection_state(&self) {
        *self.outbound.lock().unwrap() = None;
        *self.session_id.lock().unwrap() = None;
        let _ = self.connected_tx.send(false);

        if let Some(waiter) = self.pending_exit.lock().unwrap().take() {
            let _ = waiter.send(Err(ControlError::Unavailable(
                "disconnected before exit response".to_string(),
            )));
        }
    }

    async fn handle_inbound(
        &self,
        payload: ControlPayload,
        outbound: &mpsc::Sender<ControlMessage>,
    ) {
        match payload {
            ControlPayload::PongResponse {
                timestamp_ms,
                original_timestamp_ms,
                ..
            } => {
                *self.last_pong.lock().unwrap() = Instant::now();
                let latency = (timestamp_ms - original_timestamp_ms) as f64;
                *self.latency_ms.lock().unwrap() = latency;
                debug!(
                    peer_id = %self.config.peer_id,
                    latency_ms = latency,
                    "Received pong"
                );
            }
            ControlPayload::Command(command) => {
                self.handle_command(command, outbound).await;
            }
            ControlPayload::ExitResponse {
                success,
                message,
                exit_peer,
                allocation_id,
                allocated_ip,
            } => {
                let result = if success {
                    match exit_peer {
                        Some(exit_peer) => Ok(ExitGrant {
                            exit_peer,
                            allocation_id,
                            allocated_ip,
                        }),
                        None => Err(ControlError::Unavailable(
                            "exit response missing peer info".to_string(),
                        )),
                    }
                } else {
                    Err(ControlError::NoCandidate(message))
                };

                match self.pending_exit.lock().unwrap().take() {
                    Some(waiter) => {
                        let _ = waiter.send(result);
                    }
                    None => {
                        warn!(
                            peer_id = %self.config.peer_id,
                            "Exit response without pending request, dropping"
                        );
                    }
                }
            }
            ControlPayload::InfoResponse { info, .. } => {
                debug!(peer_id = %self.config.peer_id, ?info, "Received info response");
            }
            other => {
                warn!(
                    peer_id = %self.config.peer_id,
                    "Unknown message on control stream: {:?}", other
                );
            }
        }
    }

    /// Dispatch a command through the handler table. Replayed command
    /// ids return the cached response without re-running the handler;
    /// the response is always sent before any handler-scheduled local
    /// action runs.
    async fn handle_command(&self, command: Command, outbound: &mpsc::Sender<ControlMessage>) {
        if let Some(cached) = self.replay.get(command.command_id) {
            debug!(
                peer_id = %self.config.peer_id,
                command_id = command.command_id,
                "Replayed command, returning cached response"
            );
            let _ = outbound
                .send(ControlMessage::new(ControlPayload::CommandResponse(cached)))
                .await;
            return;
        }

        let handler = self.handlers.read().unwrap().get(&command.kind).cloned();

        let response = match handler {
            Some(handler) => handler.handle(&command).await,
            None => {
                warn!(
                    peer_id = %self.config.peer_id,
                    command_kind = %command.kind,
                    "No handler for command kind"
                );
                CommandResponse::failed(
                    command.command_id,
                    format!("no handler for {}", command.kind),
                )
            }
        };

        self.replay.insert(command.command_id, response.clone());

        if outbound
            .send(ControlMessage::new(ControlPayload::CommandResponse(
                response,
            )))
            .await
            .is_err()
        {
            error!(
                peer_id = %self.config.peer_id,
                command_id = command.command_id,
                "Failed to enqueue command response"
            );
        }
    }
}
