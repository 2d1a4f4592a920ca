//! wgmesh operator binary
//!
//! Runs one of the three node types: the global directory, a regional
//! coordinator, or a peer. Service supervision, metrics surfaces, and
//! richer configuration live outside this thin entry point.

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use wgmesh_coordinator::{Coordinator, CoordinatorConfig, RelaySettings};
use wgmesh_dataplane::{DataPlane, LinuxDataPlane, MemoryDataPlane};
use wgmesh_directory::{DirectoryConfig, DirectoryRegistry, DirectoryServer};
use wgmesh_identity::PeerIdentity;
use wgmesh_peer::{
    ClientTunnel, CommandHandler, ExitService, ExitServiceConfig, PeerClient, PeerClientConfig,
    RoleController, RotatePeerHandler, SetupExitHandler,
};
use wgmesh_proto::messages::setup_exit;
use wgmesh_proto::{Command, CommandKind, CommandResponse, PeerRole};
use wgmesh_transport::QuicConfig;

/// wgmesh - decentralized VPN control plane
#[derive(Parser, Debug)]
#[command(name = "wgmesh")]
#[command(about = "Decentralized VPN control plane", version)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info", env = "WGMESH_LOG")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the global coordinator directory
    Directory {
        /// Bind address
        #[arg(long, default_value = "0.0.0.0:4500", env = "WGMESH_DIRECTORY_LISTEN")]
        listen: SocketAddr,

        /// TLS certificate (PEM); self-signed is generated when omitted
        #[arg(long, env = "WGMESH_TLS_CERT")]
        tls_cert: Option<String>,

        /// TLS private key (PEM)
        #[arg(long, env = "WGMESH_TLS_KEY")]
        tls_key: Option<String>,
    },

    /// Run a regional coordinator
    Coordinator {
        /// Coordinator identifier, unique across the mesh
        #[arg(long, env = "WGMESH_COORDINATOR_ID")]
        id: String,

        /// Region tag this coordinator serves
        #[arg(long, env = "WGMESH_REGION")]
        region: String,

        /// Bind address for peer streams and coordinator RPCs
        #[arg(long, default_value = "0.0.0.0:4600", env = "WGMESH_COORDINATOR_LISTEN")]
        listen: SocketAddr,

        /// Public host peers use to reach this coordinator's relay
        #[arg(long, default_value = "127.0.0.1", env = "WGMESH_PUBLIC_ADDRESS")]
        public_address: String,

        /// Directory server address
        #[arg(long, env = "WGMESH_DIRECTORY_ADDR")]
        directory: SocketAddr,

        /// Relay tunnel listen port
        #[arg(long, default_value = "51820")]
        relay_port: u16,

        /// Relay address pool
        #[arg(long, default_value = "10.8.0.0/24")]
        relay_cidr: String,

        /// Egress interface for relay NAT
        #[arg(long, default_value = "eth0")]
        egress_interface: String,

        /// Route every allocation through the relay
        #[arg(long)]
        force_relay: bool,

        /// Maximum sessions advertised to the directory
        #[arg(long, default_value = "1000")]
        capacity: u32,

        /// TLS certificate (PEM); self-signed is generated when omitted
        #[arg(long, env = "WGMESH_TLS_CERT")]
        tls_cert: Option<String>,

        /// TLS private key (PEM)
        #[arg(long, env = "WGMESH_TLS_KEY")]
        tls_key: Option<String>,

        /// Skip certificate verification on outbound dials
        /// (self-signed deployments)
        #[arg(long)]
        insecure: bool,

        /// Use the in-memory data plane (development on hosts without
        /// the wireguard tooling)
        #[arg(long)]
        mock_dataplane: bool,
    },

    /// Run a peer
    Peer {
        /// Peer identifier, unique on its coordinator
        #[arg(long, env = "WGMESH_PEER_ID")]
        id: String,

        /// Region tag
        #[arg(long, env = "WGMESH_REGION")]
        region: String,

        /// Coordinator address
        #[arg(long, env = "WGMESH_COORDINATOR_ADDR")]
        coordinator: SocketAddr,

        /// Initial role: client, exit, or hybrid
        #[arg(long, default_value = "client")]
        role: String,

        /// Ed25519 identity keyfile (generated when absent)
        #[arg(long, env = "WGMESH_KEY_FILE")]
        key_file: Option<PathBuf>,

        /// Exit tunnel listen port (exit and hybrid roles)
        #[arg(long, default_value = "51821")]
        exit_port: u16,

        /// Exit address pool
        #[arg(long, default_value = "10.9.0.0/24")]
        exit_cidr: String,

        /// Egress interface for exit NAT
        #[arg(long, default_value = "eth0")]
        egress_interface: String,

        /// Declare this exit as directly reachable
        #[arg(long)]
        advertise_direct: bool,

        /// Request egress in this region once connected
        #[arg(long)]
        exit_region: Option<String>,

        /// Skip certificate verification (self-signed deployments)
        #[arg(long)]
        insecure: bool,

        /// Use the in-memory data plane
        #[arg(long)]
        mock_dataplane: bool,
    },
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{level},quinn=warn,rustls=warn")));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn server_config(cert: Option<String>, key: Option<String>) -> Result<Arc<QuicConfig>> {
    match (cert, key) {
        (Some(cert), Some(key)) => Ok(Arc::new(QuicConfig::server_default(&cert, &key))),
        (None, None) => {
            warn!("No TLS certificate supplied, generating a self-signed one");
            Ok(Arc::new(
                QuicConfig::server_ephemeral()
                    .map_err(|e| anyhow::anyhow!("self-signed certificate: {}", e))?,
            ))
        }
        _ => anyhow::bail!("--tls-cert and --tls-key must be supplied together"),
    }
}

fn client_config(insecure: bool) -> Arc<QuicConfig> {
    if insecure {
        warn!("Certificate verification disabled on outbound connections");
        Arc::new(QuicConfig::client_insecure())
    } else {
        Arc::new(QuicConfig::client_default())
    }
}

fn build_dataplane(mock: bool) -> Arc<dyn DataPlane> {
    if mock {
        warn!("Using in-memory data plane, no kernel state will change");
        Arc::new(MemoryDataPlane::new())
    } else {
        Arc::new(LinuxDataPlane::new())
    }
}

/// DISCONNECT routing for a unified peer: the allocation id may belong
/// to the exit client table or to the client tunnel binding. The
/// response returns before any teardown runs.
struct DisconnectCommand {
    exit_service: Arc<ExitService>,
    client_tunnel: Arc<ClientTunnel>,
}

#[async_trait]
impl CommandHandler for DisconnectCommand {
    async fn handle(&self, command: &Command) -> CommandResponse {
        let session_id = command.field(setup_exit::SESSION_ID).map(|s| s.to_string());
        let exit_service = self.exit_service.clone();
        let client_tunnel = self.client_tunnel.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;

            match session_id {
                Some(session_id) => {
                    if exit_service.remove_by_session(&session_id).await.is_ok() {
                        return;
                    }
                    let matches = client_tunnel
                        .current_exit()
                        .await
                        .map(|active| active.allocation_id == session_id)
                        .unwrap_or(false);
                    if matches {
                        if let Err(e) = client_tunnel.disconnect().await {
                            warn!(error = %e, "Deferred disconnect failed");
                        }
                    }
                }
                None => {
                    if let Err(e) = client_tunnel.disconnect().await {
                        warn!(error = %e, "Deferred disconnect failed");
                    }
                }
            }
        });

        CommandResponse::ok(command.command_id, "disconnect scheduled")
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    rustls::crypto::ring::default_provider()
        .install_default()
        .ok();

    match cli.command {
        Commands::Directory {
            listen,
            tls_cert,
            tls_key,
        } => run_directory(listen, tls_cert, tls_key).await,
        Commands::Coordinator {
            id,
            region,
            listen,
            public_address,
            directory,
            relay_port,
            relay_cidr,
            egress_interface,
            force_relay,
            capacity,
            tls_cert,
            tls_key,
            insecure,
            mock_dataplane,
        } => {
            let server = server_config(tls_cert, tls_key)?;
            let client = client_config(insecure);

            let mut config = CoordinatorConfig::new(&id, &region, listen, directory, server, client);
            config.public_address = public_address;
            config.max_capacity = capacity;
            config.relay = RelaySettings {
                interface: None,
                listen_port: relay_port,
                pool_cidr: relay_cidr,
                egress_interface,
                force_relay,
            };

            run_coordinator(config, build_dataplane(mock_dataplane)).await
        }
        Commands::Peer {
            id,
            region,
            coordinator,
            role,
            key_file,
            exit_port,
            exit_cidr,
            egress_interface,
            advertise_direct,
            exit_region,
            insecure,
            mock_dataplane,
        } => {
            let role: PeerRole = role
                .parse()
                .map_err(|e| anyhow::anyhow!("invalid role: {}", e))?;
            run_peer(PeerArgs {
                id,
                region,
                coordinator,
                role,
                key_file,
                exit_port,
                exit_cidr,
                egress_interface,
                advertise_direct,
                exit_region,
                insecure,
                mock_dataplane,
            })
            .await
        }
    }
}

async fn run_directory(
    listen: SocketAddr,
    tls_cert: Option<String>,
    tls_key: Option<String>,
) -> Result<()> {
    let registry = DirectoryRegistry::new(DirectoryConfig::default());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let server = DirectoryServer::bind(
        listen,
        server_config(tls_cert, tls_key)?,
        registry,
        shutdown_rx,
    )
    .map_err(|e| anyhow::anyhow!("bind directory listener: {}", e))?;
    info!(
        addr = %server.local_addr().map_err(|e| anyhow::anyhow!("{}", e))?,
        "Directory listening"
    );

    let handle = tokio::spawn(async move { server.run().await });

    signal::ctrl_c().await.context("signal handler")?;
    info!("Shutting down directory");
    let _ = shutdown_tx.send(true);
    let _ = handle.await;
    Ok(())
}

async fn run_coordinator(config: CoordinatorConfig, dataplane: Arc<dyn DataPlane>) -> Result<()> {
    let coordinator = Coordinator::new(config, dataplane)
        .await
        .map_err(|e| anyhow::anyhow!("coordinator startup: {}", e))?;

    let runner = tokio::spawn(coordinator.clone().run());

    signal::ctrl_c().await.context("signal handler")?;
    info!("Shutting down coordinator");
    coordinator.stop();
    let _ = runner.await;
    Ok(())
}

struct PeerArgs {
    id: String,
    region: String,
    coordinator: SocketAddr,
    role: PeerRole,
    key_file: Option<PathBuf>,
    exit_port: u16,
    exit_cidr: String,
    egress_interface: String,
    advertise_direct: bool,
    exit_region: Option<String>,
    insecure: bool,
    mock_dataplane: bool,
}

async fn run_peer(args: PeerArgs) -> Result<()> {
    let key_file = args.key_file.unwrap_or_else(|| {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home)
            .join(".wgmesh")
            .join(format!("{}.key", args.id))
    });
    let identity = PeerIdentity::load_or_generate(&key_file)
        .map_err(|e| anyhow::anyhow!("identity: {}", e))?;

    let dataplane = build_dataplane(args.mock_dataplane);

    let mut client_config = PeerClientConfig::new(
        &args.id,
        &args.region,
        args.coordinator,
        client_config(args.insecure),
    );
    client_config.initial_role = args.role;

    let client = PeerClient::new(client_config, identity)
        .map_err(|e| anyhow::anyhow!("peer client: {}", e))?;

    let client_tunnel = ClientTunnel::new(&args.id, dataplane.clone());

    let mut exit_config = ExitServiceConfig::new(&args.id, args.exit_port);
    exit_config.pool_cidr = args.exit_cidr;
    exit_config.egress_interface = args.egress_interface;
    exit_config.advertise_direct = args.advertise_direct;
    let exit_service = ExitService::new(exit_config, dataplane);

    client.register_command_handler(
        CommandKind::SetupExit,
        SetupExitHandler::new(exit_service.clone()),
    );
    client.register_command_handler(
        CommandKind::RotatePeer,
        RotatePeerHandler::new(exit_service.clone()),
    );
    client.register_command_handler(
        CommandKind::Disconnect,
        Arc::new(DisconnectCommand {
            exit_service: exit_service.clone(),
            client_tunnel: client_tunnel.clone(),
        }),
    );

    let roles = RoleController::new(
        args.role,
        client.clone(),
        client_tunnel.clone(),
        exit_service,
    );
    roles
        .activate()
        .await
        .map_err(|e| anyhow::anyhow!("role activation: {}", e))?;

    client.start();

    if let Some(target_region) = args.exit_region {
        if !client.wait_connected(Duration::from_secs(30)).await {
            anyhow::bail!("timed out connecting to coordinator");
        }

        let grant = client
            .request_exit(&target_region, &client_tunnel.public_key())
            .await
            .map_err(|e| anyhow::anyhow!("exit request: {}", e))?;

        info!(
            exit_peer = %grant.exit_peer.peer_id,
            endpoint = %grant.exit_peer.endpoint,
            allocation_id = %grant.allocation_id,
            "Exit granted, bringing tunnel up"
        );

        client_tunnel
            .connect(&grant)
            .await
            .map_err(|e| anyhow::anyhow!("tunnel up: {}", e))?;
    }

    signal::ctrl_c().await.context("signal handler")?;
    info!("Shutting down peer");
    client.stop().await;
    roles.deactivate().await;
    Ok(())
}
