//! Protocol message types

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Role a peer declares when authenticating.
///
/// Role is data, not type: sessions carry it as a field and the
/// coordinator filters by it when selecting exit candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerRole {
    /// Consumes tunnels
    Client,
    /// Provides egress
    Exit,
    /// Both at once
    Hybrid,
}

impl PeerRole {
    /// Whether this role serves exit traffic
    pub fn provides_exit(&self) -> bool {
        matches!(self, PeerRole::Exit | PeerRole::Hybrid)
    }

    /// Whether this role consumes tunnels
    pub fn consumes_exit(&self) -> bool {
        matches!(self, PeerRole::Client | PeerRole::Hybrid)
    }
}

impl fmt::Display for PeerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerRole::Client => write!(f, "client"),
            PeerRole::Exit => write!(f, "exit"),
            PeerRole::Hybrid => write!(f, "hybrid"),
        }
    }
}

impl FromStr for PeerRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "client" => Ok(PeerRole::Client),
            "exit" => Ok(PeerRole::Exit),
            "hybrid" => Ok(PeerRole::Hybrid),
            _ => Err(format!("Unknown peer role: {}", s)),
        }
    }
}

/// Kind of a coordinator-issued command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandKind {
    SetupExit = 1,
    RotatePeer = 2,
    RelaySetup = 3,
    Disconnect = 4,
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandKind::SetupExit => write!(f, "SETUP_EXIT"),
            CommandKind::RotatePeer => write!(f, "ROTATE_PEER"),
            CommandKind::RelaySetup => write!(f, "RELAY_SETUP"),
            CommandKind::Disconnect => write!(f, "DISCONNECT"),
        }
    }
}

/// Well-known payload and result keys for SETUP_EXIT
pub mod setup_exit {
    pub const CLIENT_ID: &str = "client_id";
    pub const CLIENT_PUBKEY: &str = "client_pubkey";
    pub const SESSION_ID: &str = "session_id";
    pub const ALLOWED_IPS: &str = "allowed_ips";

    pub const RESULT_ALLOCATED_IP: &str = "allocated_ip";
    pub const RESULT_ENDPOINT: &str = "endpoint";
    pub const RESULT_PUBLIC_KEY: &str = "public_key";
}

/// A command pushed down a peer's control stream.
///
/// Command ids are coordinator-unique and monotonically increasing;
/// receivers treat them as idempotence keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub command_id: u64,
    pub kind: CommandKind,
    pub payload: HashMap<String, String>,
    /// Milliseconds since epoch at issue time
    pub issued_at_ms: i64,
}

impl Command {
    pub fn new(command_id: u64, kind: CommandKind, payload: HashMap<String, String>) -> Self {
        Self {
            command_id,
            kind,
            payload,
            issued_at_ms: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Fetch a required payload field
    pub fn field(&self, key: &str) -> Option<&str> {
        self.payload.get(key).map(|s| s.as_str()).filter(|s| !s.is_empty())
    }
}

/// Response to a [`Command`], echoing its id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResponse {
    pub command_id: u64,
    pub success: bool,
    pub message: String,
    pub result: HashMap<String, String>,
}

impl CommandResponse {
    pub fn ok(command_id: u64, message: impl Into<String>) -> Self {
        Self {
            command_id,
            success: true,
            message: message.into(),
            result: HashMap::new(),
        }
    }

    pub fn ok_with(
        command_id: u64,
        message: impl Into<String>,
        result: HashMap<String, String>,
    ) -> Self {
        Self {
            command_id,
            success: true,
            message: message.into(),
            result,
        }
    }

    pub fn failed(command_id: u64, message: impl Into<String>) -> Self {
        Self {
            command_id,
            success: false,
            message: message.into(),
            result: HashMap::new(),
        }
    }
}

/// Tunnel parameters for a selected exit peer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitPeerInfo {
    pub peer_id: String,
    /// WireGuard public key of the exit interface, base64
    pub public_key: String,
    /// `host:port` UDP endpoint the requester should dial
    pub endpoint: String,
    pub allowed_ips: Vec<String>,
    /// Whether the exit believes it is directly reachable
    pub supports_direct: bool,
}

/// Directory view of one coordinator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorInfo {
    pub coordinator_id: String,
    pub region: String,
    pub address: String,
    pub port: u16,
    pub current_load: u32,
    pub max_capacity: u32,
    /// Seconds since epoch of the last heartbeat, as stamped by the directory
    pub last_heartbeat: i64,
}

/// Envelope for every frame on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlMessage {
    pub message_id: String,
    /// Seconds since epoch at send time
    pub timestamp: i64,
    pub payload: ControlPayload,
}

impl ControlMessage {
    pub fn new(payload: ControlPayload) -> Self {
        Self {
            message_id: uuid::Uuid::new_v4().to_string(),
            timestamp: chrono::Utc::now().timestamp(),
            payload,
        }
    }
}

/// Every payload the control plane speaks.
///
/// The persistent peer stream uses the first block; the inter-coordinator
/// and directory RPCs are unary request/response pairs carried in the
/// same enum so one codec serves every listener.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ControlPayload {
    // Persistent control stream
    AuthRequest {
        peer_id: String,
        role: PeerRole,
        /// Ed25519 verification key, standard base64
        public_key_b64: String,
        region: String,
        /// Ed25519 signature over `peer_id||role||region||nonce_b64`
        signature_b64: String,
        nonce_b64: String,
    },
    AuthResponse {
        success: bool,
        message: String,
        session_id: String,
    },
    PingRequest {
        timestamp_ms: i64,
        peer_id: String,
    },
    PongResponse {
        timestamp_ms: i64,
        original_timestamp_ms: i64,
        peer_id: String,
    },
    Command(Command),
    CommandResponse(CommandResponse),
    InfoRequest {
        peer_id: String,
        requested_fields: Vec<String>,
    },
    InfoResponse {
        peer_id: String,
        info: HashMap<String, String>,
    },
    /// Client asks its coordinator for egress in a region
    ExitRequest {
        peer_id: String,
        target_region: String,
        /// WireGuard public key of the requester's client interface
        tunnel_public_key: String,
    },
    ExitResponse {
        success: bool,
        message: String,
        exit_peer: Option<ExitPeerInfo>,
        allocation_id: String,
        /// Address assigned to the requester inside the exit network
        allocated_ip: String,
    },

    // Inter-coordinator RPC (unary)
    AllocateExitPeerRequest {
        client_id: String,
        /// Requester's tunnel public key, forwarded into SETUP_EXIT
        client_pubkey: String,
        requesting_region: String,
        session_id_hint: Option<String>,
    },
    AllocateExitPeerResponse {
        success: bool,
        message: String,
        exit_peer: Option<ExitPeerInfo>,
        allocation_id: String,
        /// Address the exit assigned to the requester
        allocated_ip: String,
    },

    /// Undo a prior allocation on the exit coordinator (rollback path)
    ReleaseExitPeerRequest {
        allocation_id: String,
    },
    ReleaseExitPeerResponse {
        success: bool,
        message: String,
    },

    // Directory RPC (unary)
    RegisterCoordinatorRequest {
        coordinator_id: String,
        region: String,
        address: String,
        port: u16,
        current_load: u32,
        max_capacity: u32,
    },
    RegisterCoordinatorResponse {
        success: bool,
        message: String,
    },
    CandidatesRequest {
        target_region: String,
        requesting_coordinator_id: String,
    },
    CandidatesResponse {
        candidates: Vec<CoordinatorInfo>,
    },
    ListCoordinatorsRequest,
    ListCoordinatorsResponse {
        coordinators: Vec<CoordinatorInfo>,
    },
}
