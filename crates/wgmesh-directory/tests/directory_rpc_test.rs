//! Integration tests for the directory RPC surface

use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::timeout;
use wgmesh_directory::{DirectoryClient, DirectoryConfig, DirectoryRegistry, DirectoryServer};
use wgmesh_transport::QuicConfig;

static CRYPTO_PROVIDER_INIT: OnceLock<()> = OnceLock::new();

fn init_crypto_provider() {
    CRYPTO_PROVIDER_INIT.get_or_init(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

async fn start_server(
    config: DirectoryConfig,
) -> (std::net::SocketAddr, watch::Sender<bool>, tokio::task::JoinHandle<()>) {
    let registry = DirectoryRegistry::new(config);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let server_config = Arc::new(QuicConfig::server_ephemeral().unwrap());
    let server = DirectoryServer::bind(
        "127.0.0.1:0".parse().unwrap(),
        server_config,
        registry,
        shutdown_rx,
    )
    .unwrap();
    let addr = server.local_addr().unwrap();

    let handle = tokio::spawn(async move {
        server.run().await;
    });

    (addr, shutdown_tx, handle)
}

fn client(addr: std::net::SocketAddr) -> DirectoryClient {
    DirectoryClient::new(addr, "localhost", Arc::new(QuicConfig::client_insecure())).unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_register_then_query_candidates() {
    init_crypto_provider();
    let (addr, shutdown, handle) = start_server(DirectoryConfig::default()).await;
    let client = client(addr);

    client
        .register_coordinator("c-us-1", "us", "10.0.0.1", 4600, 3, 100)
        .await
        .unwrap();
    client
        .register_coordinator("c-us-2", "us", "10.0.0.2", 4600, 1, 100)
        .await
        .unwrap();
    client
        .register_coordinator("c-eu-1", "eu", "10.0.1.1", 4600, 0, 100)
        .await
        .unwrap();

    let candidates = client.candidates("us", "c-in-1").await.unwrap();
    let ids: Vec<String> = candidates.into_iter().map(|c| c.coordinator_id).collect();
    assert_eq!(ids, vec!["c-us-2", "c-us-1"]);

    let empty = client.candidates("ap", "c-in-1").await.unwrap();
    assert!(empty.is_empty());

    let all = client.list_all().await.unwrap();
    assert_eq!(all.len(), 3);

    shutdown.send(true).unwrap();
    let _ = timeout(Duration::from_secs(5), handle).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_registration_rejects_empty_id() {
    init_crypto_provider();
    let (addr, shutdown, handle) = start_server(DirectoryConfig::default()).await;
    let client = client(addr);

    let result = client
        .register_coordinator("", "us", "10.0.0.1", 4600, 0, 100)
        .await;
    assert!(result.is_err());

    shutdown.send(true).unwrap();
    let _ = timeout(Duration::from_secs(5), handle).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stale_entries_age_out_of_candidates() {
    init_crypto_provider();
    let config = DirectoryConfig {
        ttl: Duration::from_millis(400),
        query_freshness: Duration::from_millis(150),
        sweep_interval: Duration::from_millis(100),
    };
    let (addr, shutdown, handle) = start_server(config).await;
    let client = client(addr);

    client
        .register_coordinator("c1", "us", "10.0.0.1", 4600, 0, 100)
        .await
        .unwrap();
    assert_eq!(client.candidates("us", "me").await.unwrap().len(), 1);

    // Stop heartbeating; freshness bound hides it first
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(client.candidates("us", "me").await.unwrap().is_empty());

    // Then the sweeper removes it entirely
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(client.list_all().await.unwrap().is_empty());

    shutdown.send(true).unwrap();
    let _ = timeout(Duration::from_secs(5), handle).await;
}
