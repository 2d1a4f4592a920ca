//! Directory RPC server

use crate::registry::DirectoryRegistry;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use wgmesh_proto::{ControlMessage, ControlPayload};
use wgmesh_transport::{ControlConnection, QuicConfig, QuicListener, TransportResult};

/// Serves the directory RPCs over QUIC.
///
/// Each request is one bidirectional stream: read one frame, answer one
/// frame, finish.
pub struct DirectoryServer {
    listener: QuicListener,
    registry: DirectoryRegistry,
    shutdown: watch::Receiver<bool>,
}

impl DirectoryServer {
    pub fn bind(
        bind_addr: SocketAddr,
        config: Arc<QuicConfig>,
        registry: DirectoryRegistry,
        shutdown: watch::Receiver<bool>,
    ) -> TransportResult<Self> {
        let listener = QuicListener::new(bind_addr, config)?;
        Ok(Self {
            listener,
            registry,
            shutdown,
        })
    }

    pub fn local_addr(&self) -> TransportResult<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept loop; returns when the shutdown signal flips.
    pub async fn run(&self) {
        let sweeper = self.registry.spawn_sweeper(self.shutdown.clone());
        let mut shutdown = self.shutdown.clone();

        info!("Directory server running");

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((connection, peer_addr)) => {
                            let registry = self.registry.clone();
                            tokio::spawn(async move {
                                handle_connection(connection, peer_addr, registry).await;
                            });
                        }
                        Err(e) => {
                            error!("Directory accept failed: {}", e);
                            break;
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Directory server shutting down");
                        break;
                    }
                }
            }
        }

        self.listener.close();
        sweeper.abort();
    }
}

async fn handle_connection(
    connection: ControlConnection,
    peer_addr: SocketAddr,
    registry: DirectoryRegistry,
) {
    debug!("Directory connection from {}", peer_addr);

    loop {
        let mut stream = match connection.accept_stream().await {
            Ok(stream) => stream,
            Err(_) => {
                debug!("Directory connection from {} closed", peer_addr);
                return;
            }
        };

        let registry = registry.clone();
        tokio::spawn(async move {
            let request: ControlMessage = match stream.recv_message().await {
                Ok(Some(msg)) => msg,
                Ok(None) => return,
                Err(e) => {
                    warn!("Failed to read directory request: {}", e);
                    return;
                }
            };

            let response = dispatch(&registry, request.payload);

            if let Err(e) = stream.send_message(&ControlMessage::new(response)).await {
                warn!("Failed to send directory response: {}", e);
            }
            let _ = stream.finish().await;
        });
    }
}

fn dispatch(registry: &DirectoryRegistry, request: ControlPayload) -> ControlPayload {
    match request {
        ControlPayload::RegisterCoordinatorRequest {
            coordinator_id,
            region,
            address,
            port,
            current_load,
            max_capacity,
        } => {
            if coordinator_id.is_empty() || region.is_empty() {
                return ControlPayload::RegisterCoordinatorResponse {
                    success: false,
                    message: "coordinator_id and region are required".to_string(),
                };
            }

            registry.register(
                &coordinator_id,
                &region,
                &address,
                port,
                current_load,
                max_capacity,
            );
            ControlPayload::RegisterCoordinatorResponse {
                success: true,
                message: "registered".to_string(),
            }
        }
        ControlPayload::CandidatesRequest {
            target_region,
            requesting_coordinator_id,
        } => {
            let candidates = registry.candidates(&target_region);
            debug!(
                target_region = %target_region,
                requesting_coordinator = %requesting_coordinator_id,
                candidates = candidates.len(),
                "Candidates request"
            );
            ControlPayload::CandidatesResponse { candidates }
        }
        ControlPayload::ListCoordinatorsRequest => ControlPayload::ListCoordinatorsResponse {
            coordinators: registry.list_all(),
        },
        other => {
            warn!("Unexpected directory request: {:?}", other);
            ControlPayload::RegisterCoordinatorResponse {
                success: false,
                message: "unsupported request".to_string(),
            }
        }
    }
}
