//! Integration tests for the peer stream client
//!
//! A scripted coordinator on QUIC loopback lets these tests control
//! exactly which frames the peer sees: auth handling, command replay
//! idempotence, disconnect ordering, reconnection after server loss,
//! and the heartbeat miss budget.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::time::timeout;
use wgmesh_dataplane::MemoryDataPlane;
use wgmesh_identity::{verify_auth, PeerIdentity};
use wgmesh_keys::WgKeyPair;
use wgmesh_peer::{
    BackoffConfig, DisconnectHandler, ExitService, ExitServiceConfig, PeerClient,
    PeerClientConfig, SetupExitHandler,
};
use wgmesh_proto::messages::setup_exit;
use wgmesh_proto::{Command, CommandKind, ControlMessage, ControlPayload, PeerRole};
use wgmesh_transport::{ControlConnection, ControlStream, QuicConfig, QuicListener};

static CRYPTO_PROVIDER_INIT: OnceLock<()> = OnceLock::new();

fn init_crypto_provider() {
    CRYPTO_PROVIDER_INIT.get_or_init(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

fn listener() -> (QuicListener, SocketAddr) {
    let listener = QuicListener::new(
        "127.0.0.1:0".parse().unwrap(),
        Arc::new(QuicConfig::server_ephemeral().unwrap()),
    )
    .unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

fn peer_config(peer_id: &str, coordinator: SocketAddr) -> PeerClientConfig {
    let mut config = PeerClientConfig::new(
        peer_id,
        "us",
        coordinator,
        Arc::new(QuicConfig::client_insecure()),
    );
    config.backoff = BackoffConfig {
        initial: Duration::from_millis(100),
        max: Duration::from_secs(1),
    };
    config
}

/// Accept one peer connection and answer its auth request
async fn accept_session(
    listener: &QuicListener,
    session_id: &str,
) -> (ControlConnection, ControlStream, ControlPayload) {
    let (connection, _peer_addr) = listener.accept().await.unwrap();
    let mut stream = connection.accept_stream().await.unwrap();

    let auth: ControlMessage = stream.recv_message().await.unwrap().unwrap();
    stream
        .send_message(&ControlMessage::new(ControlPayload::AuthResponse {
            success: true,
            message: "authentication successful".to_string(),
            session_id: session_id.to_string(),
        }))
        .await
        .unwrap();

    (connection, stream, auth.payload)
}

/// Read frames until something other than a ping arrives, answering
/// pings so the peer's liveness tracking stays satisfied.
async fn recv_answering_pings(stream: &mut ControlStream) -> ControlPayload {
    loop {
        let message: ControlMessage = stream.recv_message().await.unwrap().unwrap();
        match message.payload {
            ControlPayload::PingRequest {
                timestamp_ms,
                peer_id,
            } => {
                stream
                    .send_message(&ControlMessage::new(ControlPayload::PongResponse {
                        timestamp_ms: chrono::Utc::now().timestamp_millis(),
                        original_timestamp_ms: timestamp_ms,
                        peer_id,
                    }))
                    .await
                    .unwrap();
            }
            other => return other,
        }
    }
}

fn setup_exit_command(command_id: u64, client_pubkey: &str) -> ControlMessage {
    let mut payload = HashMap::new();
    payload.insert(setup_exit::CLIENT_ID.to_string(), "remote-client".to_string());
    payload.insert(setup_exit::CLIENT_PUBKEY.to_string(), client_pubkey.to_string());
    payload.insert(setup_exit::SESSION_ID.to_string(), "alloc-42".to_string());
    payload.insert(setup_exit::ALLOWED_IPS.to_string(), "0.0.0.0/0".to_string());
    ControlMessage::new(ControlPayload::Command(Command::new(
        command_id,
        CommandKind::SetupExit,
        payload,
    )))
}

#[tokio::test(flavor = "multi_thread")]
async fn test_authenticates_with_signed_request() {
    init_crypto_provider();
    let (listener, addr) = listener();

    let identity = PeerIdentity::generate();
    let expected_key = identity.public_key_b64();
    let client = PeerClient::new(peer_config("p1", addr), identity).unwrap();
    client.start();

    let (_conn, _stream, auth) = timeout(Duration::from_secs(10), accept_session(&listener, "s-1"))
        .await
        .unwrap();

    match auth {
        ControlPayload::AuthRequest {
            peer_id,
            role,
            public_key_b64,
            region,
            signature_b64,
            nonce_b64,
        } => {
            assert_eq!(peer_id, "p1");
            assert_eq!(role, PeerRole::Client);
            assert_eq!(region, "us");
            assert_eq!(public_key_b64, expected_key);
            // The signature verifies against the announced key
            verify_auth(
                &public_key_b64,
                &peer_id,
                role,
                &region,
                &nonce_b64,
                &signature_b64,
            )
            .unwrap();
        }
        other => panic!("expected auth request, got {:?}", other),
    }

    assert!(client.wait_connected(Duration::from_secs(5)).await);
    assert_eq!(client.session_id().as_deref(), Some("s-1"));

    client.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_command_replay_is_idempotent() {
    init_crypto_provider();
    let (listener, addr) = listener();

    let dataplane = Arc::new(MemoryDataPlane::new());
    let service = ExitService::new(ExitServiceConfig::new("p1", 52000), dataplane.clone());
    service.start().await.unwrap();

    let client = PeerClient::new(peer_config("p1", addr), PeerIdentity::generate()).unwrap();
    client.register_command_handler(CommandKind::SetupExit, SetupExitHandler::new(service.clone()));
    client.start();

    let (_conn, mut stream, _auth) =
        timeout(Duration::from_secs(10), accept_session(&listener, "s-1"))
            .await
            .unwrap();

    let remote_key = WgKeyPair::generate().public.to_base64();

    // First delivery applies the effect
    stream
        .send_message(&setup_exit_command(7, &remote_key))
        .await
        .unwrap();
    let first = match recv_answering_pings(&mut stream).await {
        ControlPayload::CommandResponse(response) => response,
        other => panic!("expected command response, got {:?}", other),
    };
    assert!(first.success, "{}", first.message);
    assert_eq!(service.client_count().await, 1);
    let snapshot_after_first = dataplane.snapshot();

    // Replaying the identical command id yields the same observable
    // response and no duplicate side effects
    stream
        .send_message(&setup_exit_command(7, &remote_key))
        .await
        .unwrap();
    let second = match recv_answering_pings(&mut stream).await {
        ControlPayload::CommandResponse(response) => response,
        other => panic!("expected command response, got {:?}", other),
    };
    assert_eq!(second, first);
    assert_eq!(service.client_count().await, 1);
    assert_eq!(dataplane.snapshot(), snapshot_after_first);

    client.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_duplicate_client_rejected_with_fresh_command_id() {
    init_crypto_provider();
    let (listener, addr) = listener();

    let service = ExitService::new(
        ExitServiceConfig::new("p1", 52000),
        Arc::new(MemoryDataPlane::new()),
    );
    service.start().await.unwrap();

    let client = PeerClient::new(peer_config("p1", addr), PeerIdentity::generate()).unwrap();
    client.register_command_handler(CommandKind::SetupExit, SetupExitHandler::new(service.clone()));
    client.start();

    let (_conn, mut stream, _auth) =
        timeout(Duration::from_secs(10), accept_session(&listener, "s-1"))
            .await
            .unwrap();

    let remote_key = WgKeyPair::generate().public.to_base64();
    stream
        .send_message(&setup_exit_command(1, &remote_key))
        .await
        .unwrap();
    let first = match recv_answering_pings(&mut stream).await {
        ControlPayload::CommandResponse(response) => response,
        other => panic!("unexpected: {:?}", other),
    };
    assert!(first.success);

    // Same client id under a NEW command id is a genuine duplicate, not
    // a replay: the conflict surfaces as a failed response
    stream
        .send_message(&setup_exit_command(2, &remote_key))
        .await
        .unwrap();
    let second = match recv_answering_pings(&mut stream).await {
        ControlPayload::CommandResponse(response) => response,
        other => panic!("unexpected: {:?}", other),
    };
    assert!(!second.success);
    assert_eq!(service.client_count().await, 1);

    client.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_disconnect_replies_before_teardown() {
    init_crypto_provider();
    let (listener, addr) = listener();

    let service = ExitService::new(
        ExitServiceConfig::new("p1", 52000),
        Arc::new(MemoryDataPlane::new()),
    );
    service.start().await.unwrap();
    service
        .add_client(
            "remote-client",
            &WgKeyPair::generate().public.to_base64(),
            "alloc-9",
            vec!["0.0.0.0/0".to_string()],
        )
        .await
        .unwrap();

    let client = PeerClient::new(peer_config("p1", addr), PeerIdentity::generate()).unwrap();
    client.register_command_handler(
        CommandKind::Disconnect,
        DisconnectHandler::new(service.clone()),
    );
    client.start();

    let (_conn, mut stream, _auth) =
        timeout(Duration::from_secs(10), accept_session(&listener, "s-1"))
            .await
            .unwrap();

    let mut payload = HashMap::new();
    payload.insert(setup_exit::SESSION_ID.to_string(), "alloc-9".to_string());
    stream
        .send_message(&ControlMessage::new(ControlPayload::Command(Command::new(
            3,
            CommandKind::Disconnect,
            payload,
        ))))
        .await
        .unwrap();

    let response = match recv_answering_pings(&mut stream).await {
        ControlPayload::CommandResponse(response) => response,
        other => panic!("unexpected: {:?}", other),
    };
    assert!(response.success);

    // The response arrived while the binding still exists; teardown is
    // deferred behind it
    assert_eq!(service.client_count().await, 1);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        if service.client_count().await == 0 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "deferred teardown never ran"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    client.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_reconnects_after_coordinator_restart() {
    init_crypto_provider();
    let (first_listener, addr) = listener();

    let client = PeerClient::new(peer_config("p1", addr), PeerIdentity::generate()).unwrap();
    client.start();

    let (conn, _stream, _auth) =
        timeout(Duration::from_secs(10), accept_session(&first_listener, "s-1"))
            .await
            .unwrap();
    assert!(client.wait_connected(Duration::from_secs(5)).await);

    // Coordinator goes away
    conn.close(0, b"restarting");
    first_listener.close();
    drop(first_listener);

    let client_probe = client.clone();
    let disconnected = timeout(Duration::from_secs(5), async move {
        while client_probe.is_connected() {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await;
    assert!(disconnected.is_ok());

    // Coordinator comes back on the same address; the backoff loop
    // finds it and re-authenticates
    tokio::time::sleep(Duration::from_millis(100)).await;
    let second_listener = QuicListener::new(
        addr,
        Arc::new(QuicConfig::server_ephemeral().unwrap()),
    )
    .unwrap();

    let (_conn2, _stream2, auth) =
        timeout(Duration::from_secs(10), accept_session(&second_listener, "s-2"))
            .await
            .unwrap();
    assert!(matches!(auth, ControlPayload::AuthRequest { .. }));
    assert!(client.wait_connected(Duration::from_secs(5)).await);
    assert_eq!(client.session_id().as_deref(), Some("s-2"));

    client.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_heartbeat_miss_budget_forces_reconnect() {
    init_crypto_provider();
    let (listener, addr) = listener();

    let mut config = peer_config("p1", addr);
    config.heartbeat_interval = Duration::from_millis(100);
    config.heartbeat_miss_budget = Duration::from_millis(400);

    let client = PeerClient::new(config, PeerIdentity::generate()).unwrap();
    client.start();

    // First session: authenticated but pings are never answered
    let (_conn, _stream, _auth) =
        timeout(Duration::from_secs(10), accept_session(&listener, "s-1"))
            .await
            .unwrap();
    assert!(client.wait_connected(Duration::from_secs(5)).await);

    // The miss budget expires and the client dials again
    let (_conn2, _stream2, auth) =
        timeout(Duration::from_secs(10), accept_session(&listener, "s-2"))
            .await
            .unwrap();
    assert!(matches!(auth, ControlPayload::AuthRequest { .. }));

    client.stop().await;
}
