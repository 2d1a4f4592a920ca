//! Integration tests for stream authentication and session lifecycle
//!
//! These drive a real coordinator over QUIC loopback with a raw
//! transport client, so the auth protocol is exercised exactly as a
//! peer would speak it.

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::watch;
use wgmesh_coordinator::{Coordinator, CoordinatorConfig, StreamManagerConfig};
use wgmesh_dataplane::MemoryDataPlane;
use wgmesh_directory::{DirectoryConfig, DirectoryRegistry, DirectoryServer};
use wgmesh_identity::PeerIdentity;
use wgmesh_proto::{ControlMessage, ControlPayload, PeerRole};
use wgmesh_transport::{ControlConnection, ControlStream, QuicConfig, QuicConnector};

static CRYPTO_PROVIDER_INIT: OnceLock<()> = OnceLock::new();

fn init_crypto_provider() {
    CRYPTO_PROVIDER_INIT.get_or_init(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

async fn start_directory() -> (SocketAddr, watch::Sender<bool>) {
    let registry = DirectoryRegistry::new(DirectoryConfig::default());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = DirectoryServer::bind(
        "127.0.0.1:0".parse().unwrap(),
        Arc::new(QuicConfig::server_ephemeral().unwrap()),
        registry,
        shutdown_rx,
    )
    .unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(async move { server.run().await });
    (addr, shutdown_tx)
}

async fn start_coordinator(
    id: &str,
    region: &str,
    directory_addr: SocketAddr,
    session: StreamManagerConfig,
) -> (Arc<Coordinator>, SocketAddr, Arc<MemoryDataPlane>) {
    let dataplane = Arc::new(MemoryDataPlane::new());

    let mut config = CoordinatorConfig::new(
        id,
        region,
        "127.0.0.1:0".parse().unwrap(),
        directory_addr,
        Arc::new(QuicConfig::server_ephemeral().unwrap()),
        Arc::new(QuicConfig::client_insecure()),
    );
    config.session = session;

    let coordinator = Coordinator::new(config, dataplane.clone()).await.unwrap();
    let addr = coordinator.local_addr().unwrap();
    tokio::spawn(coordinator.clone().run());

    (coordinator, addr, dataplane)
}

async fn open_stream(addr: SocketAddr) -> (ControlConnection, ControlStream) {
    let connector = QuicConnector::new(Arc::new(QuicConfig::client_insecure())).unwrap();
    let connection = connector.connect(addr, "localhost").await.unwrap();
    let stream = connection.open_stream().await.unwrap();
    (connection, stream)
}

fn auth_request(identity: &PeerIdentity, peer_id: &str, role: PeerRole, region: &str) -> ControlMessage {
    let nonce_b64 = PeerIdentity::fresh_nonce();
    let signature_b64 = identity.sign_auth(peer_id, role, region, &nonce_b64);
    ControlMessage::new(ControlPayload::AuthRequest {
        peer_id: peer_id.to_string(),
        role,
        public_key_b64: identity.public_key_b64(),
        region: region.to_string(),
        signature_b64,
        nonce_b64,
    })
}

async fn poll_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    check()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_auth_happy_path_creates_session() {
    init_crypto_provider();
    let (directory_addr, _dir) = start_directory().await;
    let (coordinator, addr, _dp) =
        start_coordinator("c1", "us", directory_addr, StreamManagerConfig::default()).await;

    assert_eq!(coordinator.stream_manager().metrics().active_sessions, 0);

    let identity = PeerIdentity::generate();
    let (_conn, mut stream) = open_stream(addr).await;
    stream
        .send_message(&auth_request(&identity, "p1", PeerRole::Client, "us"))
        .await
        .unwrap();

    let reply: ControlMessage = stream.recv_message().await.unwrap().unwrap();
    match reply.payload {
        ControlPayload::AuthResponse {
            success,
            session_id,
            ..
        } => {
            assert!(success);
            assert!(!session_id.is_empty());
        }
        other => panic!("unexpected reply: {:?}", other),
    }

    let metrics = coordinator.stream_manager().metrics();
    assert_eq!(metrics.active_sessions, 1);
    assert_eq!(metrics.sessions_by_role[&PeerRole::Client], 1);
    assert_eq!(metrics.auth_failures_total, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_auth_bad_signature_rejected() {
    init_crypto_provider();
    let (directory_addr, _dir) = start_directory().await;
    let (coordinator, addr, _dp) =
        start_coordinator("c1", "us", directory_addr, StreamManagerConfig::default()).await;

    // Signature produced by a different key than the one announced
    let announced = PeerIdentity::generate();
    let signer = PeerIdentity::generate();
    let nonce_b64 = PeerIdentity::fresh_nonce();
    let signature_b64 = signer.sign_auth("p1", PeerRole::Client, "us", &nonce_b64);

    let (_conn, mut stream) = open_stream(addr).await;
    stream
        .send_message(&ControlMessage::new(ControlPayload::AuthRequest {
            peer_id: "p1".to_string(),
            role: PeerRole::Client,
            public_key_b64: announced.public_key_b64(),
            region: "us".to_string(),
            signature_b64,
            nonce_b64,
        }))
        .await
        .unwrap();

    let reply: ControlMessage = stream.recv_message().await.unwrap().unwrap();
    match reply.payload {
        ControlPayload::AuthResponse { success, .. } => assert!(!success),
        other => panic!("unexpected reply: {:?}", other),
    }

    let metrics = coordinator.stream_manager().metrics();
    assert_eq!(metrics.auth_failures_total, 1);
    assert_eq!(metrics.active_sessions, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_replayed_nonce_rejected() {
    init_crypto_provider();
    let (directory_addr, _dir) = start_directory().await;
    let (coordinator, addr, _dp) =
        start_coordinator("c1", "us", directory_addr, StreamManagerConfig::default()).await;

    let identity = PeerIdentity::generate();
    let request = auth_request(&identity, "p1", PeerRole::Client, "us");

    let (_conn1, mut first) = open_stream(addr).await;
    first.send_message(&request).await.unwrap();
    let reply: ControlMessage = first.recv_message().await.unwrap().unwrap();
    assert!(matches!(
        reply.payload,
        ControlPayload::AuthResponse { success: true, .. }
    ));

    // The identical auth frame replayed on a second connection
    let (_conn2, mut second) = open_stream(addr).await;
    second.send_message(&request).await.unwrap();
    let reply: ControlMessage = second.recv_message().await.unwrap().unwrap();
    match reply.payload {
        ControlPayload::AuthResponse { success, message, .. } => {
            assert!(!success);
            assert!(message.contains("nonce"), "{}", message);
        }
        other => panic!("unexpected reply: {:?}", other),
    }

    assert_eq!(coordinator.stream_manager().metrics().auth_failures_total, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_first_message_must_be_auth() {
    init_crypto_provider();
    let (directory_addr, _dir) = start_directory().await;
    let (coordinator, addr, _dp) =
        start_coordinator("c1", "us", directory_addr, StreamManagerConfig::default()).await;

    let (_conn, mut stream) = open_stream(addr).await;
    stream
        .send_message(&ControlMessage::new(ControlPayload::PingRequest {
            timestamp_ms: 1,
            peer_id: "p1".to_string(),
        }))
        .await
        .unwrap();

    let reply: ControlMessage = stream.recv_message().await.unwrap().unwrap();
    match reply.payload {
        ControlPayload::AuthResponse { success, message, .. } => {
            assert!(!success);
            assert!(message.contains("authentication required"));
        }
        other => panic!("unexpected reply: {:?}", other),
    }

    assert_eq!(coordinator.stream_manager().metrics().active_sessions, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_new_stream_replaces_existing_session() {
    init_crypto_provider();
    let (directory_addr, _dir) = start_directory().await;
    let (coordinator, addr, _dp) =
        start_coordinator("c1", "us", directory_addr, StreamManagerConfig::default()).await;

    let identity = PeerIdentity::generate();

    let (conn1, mut first) = open_stream(addr).await;
    first
        .send_message(&auth_request(&identity, "p1", PeerRole::Client, "us"))
        .await
        .unwrap();
    let _: ControlMessage = first.recv_message().await.unwrap().unwrap();

    let (_conn2, mut second) = open_stream(addr).await;
    second
        .send_message(&auth_request(&identity, "p1", PeerRole::Client, "us"))
        .await
        .unwrap();
    let reply: ControlMessage = second.recv_message().await.unwrap().unwrap();
    assert!(matches!(
        reply.payload,
        ControlPayload::AuthResponse { success: true, .. }
    ));

    // The new stream wins; the old transport is closed
    assert!(poll_until(Duration::from_secs(5), || conn1.is_closed()).await);
    assert_eq!(coordinator.stream_manager().metrics().active_sessions, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stale_session_evicted_and_transport_closed() {
    init_crypto_provider();
    let (directory_addr, _dir) = start_directory().await;
    let session = StreamManagerConfig {
        stale_timeout: Duration::from_millis(300),
        sweep_interval: Duration::from_millis(100),
        command_timeout: Duration::from_secs(10),
    };
    let (coordinator, addr, _dp) = start_coordinator("c1", "us", directory_addr, session).await;

    let identity = PeerIdentity::generate();
    let (conn, mut stream) = open_stream(addr).await;
    stream
        .send_message(&auth_request(&identity, "p1", PeerRole::Client, "us"))
        .await
        .unwrap();
    let _: ControlMessage = stream.recv_message().await.unwrap().unwrap();
    assert_eq!(coordinator.stream_manager().metrics().active_sessions, 1);

    // Send nothing further: the sweeper evicts and closes the transport
    let manager = coordinator.stream_manager().clone();
    assert!(poll_until(Duration::from_secs(3), || {
        manager.metrics().active_sessions == 0
    })
    .await);
    assert!(poll_until(Duration::from_secs(3), || conn.is_closed()).await);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_ping_pong_round_trip() {
    init_crypto_provider();
    let (directory_addr, _dir) = start_directory().await;
    let (coordinator, addr, _dp) =
        start_coordinator("c1", "us", directory_addr, StreamManagerConfig::default()).await;

    let identity = PeerIdentity::generate();
    let (_conn, mut stream) = open_stream(addr).await;
    stream
        .send_message(&auth_request(&identity, "p1", PeerRole::Client, "us"))
        .await
        .unwrap();
    let _: ControlMessage = stream.recv_message().await.unwrap().unwrap();

    let sent_at = chrono::Utc::now().timestamp_millis();
    stream
        .send_message(&ControlMessage::new(ControlPayload::PingRequest {
            timestamp_ms: sent_at,
            peer_id: "p1".to_string(),
        }))
        .await
        .unwrap();

    let reply: ControlMessage = stream.recv_message().await.unwrap().unwrap();
    match reply.payload {
        ControlPayload::PongResponse {
            original_timestamp_ms,
            peer_id,
            ..
        } => {
            assert_eq!(original_timestamp_ms, sent_at);
            assert_eq!(peer_id, "p1");
        }
        other => panic!("unexpected reply: {:?}", other),
    }

    assert_eq!(
        coordinator.stream_manager().heartbeat_age_seconds("p1"),
        Some(0)
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_info_request_answers_known_fields() {
    init_crypto_provider();
    let (directory_addr, _dir) = start_directory().await;
    let (_coordinator, addr, _dp) =
        start_coordinator("c-info", "eu", directory_addr, StreamManagerConfig::default()).await;

    let identity = PeerIdentity::generate();
    let (_conn, mut stream) = open_stream(addr).await;
    stream
        .send_message(&auth_request(&identity, "p1", PeerRole::Client, "eu"))
        .await
        .unwrap();
    let _: ControlMessage = stream.recv_message().await.unwrap().unwrap();

    stream
        .send_message(&ControlMessage::new(ControlPayload::InfoRequest {
            peer_id: "p1".to_string(),
            requested_fields: vec![
                "active_peers".to_string(),
                "region".to_string(),
                "coordinator_id".to_string(),
                "favorite_color".to_string(),
            ],
        }))
        .await
        .unwrap();

    let reply: ControlMessage = stream.recv_message().await.unwrap().unwrap();
    match reply.payload {
        ControlPayload::InfoResponse { info, .. } => {
            assert_eq!(info["active_peers"], "1");
            assert_eq!(info["region"], "eu");
            assert_eq!(info["coordinator_id"], "c-info");
            assert_eq!(info["favorite_color"], "unknown");
        }
        other => panic!("unexpected reply: {:?}", other),
    }
}
