//! Authenticated peer sessions

use chrono::{DateTime, Utc};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use wgmesh_proto::{ControlError, ControlMessage, PeerRole};
use wgmesh_transport::ControlConnection;

/// Per-session counters. Individually atomic; cross-counter consistency
/// is not required.
#[derive(Debug, Default)]
pub struct SessionStats {
    pub messages_received: AtomicU64,
    pub messages_sent: AtomicU64,
    pub commands_executed: AtomicU64,
    pub commands_failed: AtomicU64,
}

/// One authenticated peer stream.
///
/// The session owns nothing but its send channel and a handle to the
/// underlying transport; the registry in [`crate::StreamManager`] is the
/// single owner of sessions, and eviction closes the transport through
/// the handle. All outbound frames go through the send channel, which
/// serializes them in enqueue order — writers never touch the stream
/// directly.
pub struct Session {
    pub peer_id: String,
    pub role: PeerRole,
    pub region: String,
    pub session_id: String,
    /// Ed25519 key that authenticated this stream
    pub auth_public_key: String,
    pub remote_address: SocketAddr,
    pub connected_at: DateTime<Utc>,
    pub stats: SessionStats,

    /// WireGuard key the peer announced for tunnel provisioning.
    /// Distinct from the auth key; learned from exit requests.
    tunnel_public_key: Mutex<Option<String>>,

    active: AtomicBool,
    last_heartbeat: Mutex<Instant>,
    latency_ms: Mutex<f64>,

    outbound: mpsc::Sender<ControlMessage>,
    connection: Option<Arc<ControlConnection>>,
}

impl Session {
    pub fn new(
        peer_id: String,
        role: PeerRole,
        region: String,
        session_id: String,
        auth_public_key: String,
        remote_address: SocketAddr,
        outbound: mpsc::Sender<ControlMessage>,
        connection: Option<Arc<ControlConnection>>,
    ) -> Self {
        Self {
            peer_id,
            role,
            region,
            session_id,
            auth_public_key,
            remote_address,
            connected_at: Utc::now(),
            stats: SessionStats::default(),
            tunnel_public_key: Mutex::new(None),
            active: AtomicBool::new(true),
            last_heartbeat: Mutex::new(Instant::now()),
            latency_ms: Mutex::new(0.0),
            outbound,
            connection,
        }
    }

    /// Enqueue a frame on the session's send channel
    pub async fn send(&self, message: ControlMessage) -> Result<(), ControlError> {
        self.outbound.send(message).await.map_err(|_| {
            ControlError::Unavailable(format!("send channel closed for peer {}", self.peer_id))
        })?;
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn mark_inactive(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    /// Close the underlying transport. Safe to call repeatedly.
    pub fn close_transport(&self, reason: &[u8]) {
        if let Some(connection) = &self.connection {
            connection.close(0, reason);
        }
    }

    pub fn touch_heartbeat(&self, latency_ms: f64) {
        *self.last_heartbeat.lock().unwrap() = Instant::now();
        *self.latency_ms.lock().unwrap() = latency_ms;
    }

    pub fn heartbeat_age(&self) -> Duration {
        self.last_heartbeat.lock().unwrap().elapsed()
    }

    pub fn latency_ms(&self) -> f64 {
        *self.latency_ms.lock().unwrap()
    }

    pub fn set_tunnel_public_key(&self, key: &str) {
        *self.tunnel_public_key.lock().unwrap() = Some(key.to_string());
    }

    pub fn tunnel_public_key(&self) -> Option<String> {
        self.tunnel_public_key.lock().unwrap().clone()
    }

    pub fn record_message_received(&self) {
        self.stats.messages_received.fetch_add(1, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("peer_id", &self.peer_id)
            .field("role", &self.role)
            .field("region", &self.region)
            .field("session_id", &self.session_id)
            .field("active", &self.is_active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_session(peer_id: &str) -> (Session, mpsc::Receiver<ControlMessage>) {
        let (tx, rx) = mpsc::channel(8);
        let session = Session::new(
            peer_id.to_string(),
            PeerRole::Client,
            "us".to_string(),
            "s-1".to_string(),
            "pk".to_string(),
            "127.0.0.1:1234".parse().unwrap(),
            tx,
            None,
        );
        (session, rx)
    }

    #[tokio::test]
    async fn test_send_goes_through_channel_in_order() {
        let (session, mut rx) = test_session("p1");

        for i in 0..3 {
            session
                .send(ControlMessage::new(wgmesh_proto::ControlPayload::PingRequest {
                    timestamp_ms: i,
                    peer_id: "p1".to_string(),
                }))
                .await
                .unwrap();
        }

        for i in 0..3 {
            match rx.recv().await.unwrap().payload {
                wgmesh_proto::ControlPayload::PingRequest { timestamp_ms, .. } => {
                    assert_eq!(timestamp_ms, i)
                }
                other => panic!("unexpected payload: {:?}", other),
            }
        }
        assert_eq!(session.stats.messages_sent.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn test_send_fails_after_receiver_dropped() {
        let (session, rx) = test_session("p1");
        drop(rx);

        let result = session
            .send(ControlMessage::new(
                wgmesh_proto::ControlPayload::ListCoordinatorsRequest,
            ))
            .await;
        assert!(matches!(result, Err(ControlError::Unavailable(_))));
    }

    #[test]
    fn test_heartbeat_tracking() {
        let (session, _rx) = test_session("p1");
        session.touch_heartbeat(12.5);
        assert!(session.heartbeat_age() < Duration::from_secs(1));
        assert_eq!(session.latency_ms(), 12.5);
    }

    #[test]
    fn test_tunnel_key_distinct_from_auth_key() {
        let (session, _rx) = test_session("p1");
        assert_eq!(session.tunnel_public_key(), None);
        session.set_tunnel_public_key("wg-key");
        assert_eq!(session.tunnel_public_key().as_deref(), Some("wg-key"));
        assert_eq!(session.auth_public_key, "pk");
    }
}
