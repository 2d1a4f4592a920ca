//! Data-plane adapter
//!
//! The control plane never touches the kernel directly: everything goes
//! through the narrow [`DataPlane`] trait. The production binding
//! ([`LinuxDataPlane`]) shells out to `ip`/`wg`/`sysctl`/`iptables`; the
//! test binding ([`MemoryDataPlane`]) keeps the same state in memory and
//! can snapshot it for rollback assertions.

mod linux;
mod memory;
mod pool;

pub use linux::LinuxDataPlane;
pub use memory::{InterfaceState, MemoryDataPlane, MemorySnapshot, PeerEntry};
pub use pool::IpPool;

use async_trait::async_trait;
use thiserror::Error;
use wgmesh_proto::ControlError;

/// Data-plane errors
#[derive(Debug, Error)]
pub enum DataPlaneError {
    /// The operation could not complete (missing privilege, missing tool,
    /// kernel refusal). Fatal at startup, session-fatal mid-flight.
    #[error("Unavailable: {0}")]
    Unavailable(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Exhausted: {0}")]
    Exhausted(String),

    #[error("Conflict: {0}")]
    Conflict(String),
}

impl From<DataPlaneError> for ControlError {
    fn from(err: DataPlaneError) -> Self {
        match err {
            DataPlaneError::Unavailable(m) => ControlError::Unavailable(m),
            DataPlaneError::NotFound(m) => ControlError::NotFound(m),
            DataPlaneError::InvalidArgument(m) => ControlError::InvalidArgument(m),
            DataPlaneError::Exhausted(m) => ControlError::Exhausted(m),
            DataPlaneError::Conflict(m) => ControlError::Conflict(m),
        }
    }
}

/// Narrow capability surface over the kernel tunnel machinery.
///
/// All operations are idempotent where documented so that rollback and
/// retry paths can call them blindly:
/// - `interface_create` of an existing interface succeeds silently
/// - `peer_add` with a known public key replaces allowed addresses and
///   endpoint
/// - `interface_delete` / `peer_remove` of an absent object return
///   [`DataPlaneError::NotFound`], which cleanup paths treat as done
#[async_trait]
pub trait DataPlane: Send + Sync {
    async fn interface_create(&self, name: &str) -> Result<(), DataPlaneError>;

    async fn interface_delete(&self, name: &str) -> Result<(), DataPlaneError>;

    /// Set the interface private key and, optionally, listen port and
    /// address. A malformed key is `InvalidArgument`.
    async fn interface_configure(
        &self,
        name: &str,
        private_key: &str,
        listen_port: Option<u16>,
        address_cidr: Option<&str>,
    ) -> Result<(), DataPlaneError>;

    async fn peer_add(
        &self,
        interface: &str,
        public_key: &str,
        allowed_addrs: &[String],
        endpoint: Option<&str>,
    ) -> Result<(), DataPlaneError>;

    async fn peer_remove(&self, interface: &str, public_key: &str) -> Result<(), DataPlaneError>;

    /// Enable host packet forwarding (no-op when already enabled)
    async fn forwarding_enable(&self) -> Result<(), DataPlaneError>;

    /// Masquerade traffic from `src_addr` out of `egress_interface`
    async fn nat_add(&self, src_addr: &str, egress_interface: &str) -> Result<(), DataPlaneError>;

    /// Exact inverse of [`DataPlane::nat_add`]
    async fn nat_remove(&self, src_addr: &str, egress_interface: &str)
        -> Result<(), DataPlaneError>;
}

/// Validate a base64 32-byte key as used by tunnel interfaces and peers
pub(crate) fn validate_wg_key(key: &str) -> Result<(), DataPlaneError> {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;

    match STANDARD.decode(key) {
        Ok(bytes) if bytes.len() == 32 => Ok(()),
        Ok(bytes) => Err(DataPlaneError::InvalidArgument(format!(
            "key must be 32 bytes, got {}",
            bytes.len()
        ))),
        Err(e) => Err(DataPlaneError::InvalidArgument(format!(
            "key is not valid base64: {}",
            e
        ))),
    }
}
