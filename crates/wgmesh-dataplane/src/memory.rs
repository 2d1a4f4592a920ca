//! In-memory data plane for tests

use crate::{validate_wg_key, DataPlane, DataPlaneError};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Mutex;
use tracing::debug;

/// One tunnel peer on a fake interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEntry {
    pub allowed_addrs: Vec<String>,
    pub endpoint: Option<String>,
}

/// One fake tunnel interface
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterfaceState {
    pub private_key: Option<String>,
    pub listen_port: Option<u16>,
    pub address: Option<String>,
    pub peers: BTreeMap<String, PeerEntry>,
}

/// Deterministic snapshot of the whole fake data plane.
///
/// Rollback tests compare two of these for equality; BTree containers
/// keep the ordering stable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemorySnapshot {
    pub interfaces: BTreeMap<String, InterfaceState>,
    pub forwarding_enabled: bool,
    pub nat_rules: BTreeSet<(String, String)>,
}

/// In-memory [`DataPlane`] implementation.
///
/// Supports one-shot failure injection by operation name so rollback
/// paths can be exercised deterministically.
#[derive(Default)]
pub struct MemoryDataPlane {
    state: Mutex<MemorySnapshot>,
    fail_ops: Mutex<HashSet<String>>,
}

impl MemoryDataPlane {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot the current state
    pub fn snapshot(&self) -> MemorySnapshot {
        self.state.lock().unwrap().clone()
    }

    /// Make the next call of `op` fail with `Unavailable`.
    /// Operation names match the trait method names.
    pub fn inject_failure(&self, op: &str) {
        self.fail_ops.lock().unwrap().insert(op.to_string());
    }

    /// Peers currently present on an interface (test hook)
    pub fn peers_on(&self, interface: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .interfaces
            .get(interface)
            .map(|iface| iface.peers.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn has_interface(&self, interface: &str) -> bool {
        self.state.lock().unwrap().interfaces.contains_key(interface)
    }

    fn check_injected(&self, op: &str) -> Result<(), DataPlaneError> {
        if self.fail_ops.lock().unwrap().remove(op) {
            return Err(DataPlaneError::Unavailable(format!(
                "injected failure in {}",
                op
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl DataPlane for MemoryDataPlane {
    async fn interface_create(&self, name: &str) -> Result<(), DataPlaneError> {
        self.check_injected("interface_create")?;
        let mut state = self.state.lock().unwrap();
        state.interfaces.entry(name.to_string()).or_default();
        debug!(interface = %name, "memory: interface created");
        Ok(())
    }

    async fn interface_delete(&self, name: &str) -> Result<(), DataPlaneError> {
        self.check_injected("interface_delete")?;
        let mut state = self.state.lock().unwrap();
        if state.interfaces.remove(name).is_none() {
            return Err(DataPlaneError::NotFound(format!("interface {}", name)));
        }
        debug!(interface = %name, "memory: interface deleted");
        Ok(())
    }

    async fn interface_configure(
        &self,
        name: &str,
        private_key: &str,
        listen_port: Option<u16>,
        address_cidr: Option<&str>,
    ) -> Result<(), DataPlaneError> {
        self.check_injected("interface_configure")?;
        validate_wg_key(private_key)?;

        let mut state = self.state.lock().unwrap();
        let iface = state
            .interfaces
            .get_mut(name)
            .ok_or_else(|| DataPlaneError::NotFound(format!("interface {}", name)))?;

        iface.private_key = Some(private_key.to_string());
        if listen_port.is_some() {
            iface.listen_port = listen_port;
        }
        if let Some(addr) = address_cidr {
            iface.address = Some(addr.to_string());
        }
        Ok(())
    }

    async fn peer_add(
        &self,
        interface: &str,
        public_key: &str,
        allowed_addrs: &[String],
        endpoint: Option<&str>,
    ) -> Result<(), DataPlaneError> {
        self.check_injected("peer_add")?;
        validate_wg_key(public_key)?;

        let mut state = self.state.lock().unwrap();
        let iface = state
            .interfaces
            .get_mut(interface)
            .ok_or_else(|| DataPlaneError::NotFound(format!("interface {}", interface)))?;

        // Keyed by public key: a second add replaces the entry
        iface.peers.insert(
            public_key.to_string(),
            PeerEntry {
                allowed_addrs: allowed_addrs.to_vec(),
                endpoint: endpoint.map(|e| e.to_string()),
            },
        );
        debug!(interface = %interface, public_key = %public_key, "memory: peer added");
        Ok(())
    }

    async fn peer_remove(&self, interface: &str, public_key: &str) -> Result<(), DataPlaneError> {
        self.check_injected("peer_remove")?;
        let mut state = self.state.lock().unwrap();
        let iface = state
            .interfaces
            .get_mut(interface)
            .ok_or_else(|| DataPlaneError::NotFound(format!("interface {}", interface)))?;

        if iface.peers.remove(public_key).is_none() {
            return Err(DataPlaneError::NotFound(format!(
                "peer {} on {}",
                public_key, interface
            )));
        }
        Ok(())
    }

    async fn forwarding_enable(&self) -> Result<(), DataPlaneError> {
        self.check_injected("forwarding_enable")?;
        self.state.lock().unwrap().forwarding_enabled = true;
        Ok(())
    }

    async fn nat_add(&self, src_addr: &str, egress_interface: &str) -> Result<(), DataPlaneError> {
        self.check_injected("nat_add")?;
        self.state
            .lock()
            .unwrap()
            .nat_rules
            .insert((src_addr.to_string(), egress_interface.to_string()));
        Ok(())
    }

    async fn nat_remove(
        &self,
        src_addr: &str,
        egress_interface: &str,
    ) -> Result<(), DataPlaneError> {
        self.check_injected("nat_remove")?;
        let removed = self
            .state
            .lock()
            .unwrap()
            .nat_rules
            .remove(&(src_addr.to_string(), egress_interface.to_string()));
        if !removed {
            return Err(DataPlaneError::NotFound(format!(
                "nat rule {} via {}",
                src_addr, egress_interface
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;

    fn key(byte: u8) -> String {
        STANDARD.encode([byte; 32])
    }

    #[tokio::test]
    async fn test_interface_create_is_idempotent() {
        let dp = MemoryDataPlane::new();
        dp.interface_create("wg0").await.unwrap();
        dp.interface_configure("wg0", &key(1), Some(51820), Some("10.9.0.1/24"))
            .await
            .unwrap();

        // Re-creating must not wipe configuration
        dp.interface_create("wg0").await.unwrap();
        let snap = dp.snapshot();
        assert_eq!(snap.interfaces["wg0"].listen_port, Some(51820));
    }

    #[tokio::test]
    async fn test_interface_delete_missing_is_not_found() {
        let dp = MemoryDataPlane::new();
        assert!(matches!(
            dp.interface_delete("wg9").await,
            Err(DataPlaneError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_peer_add_replaces_by_public_key() {
        let dp = MemoryDataPlane::new();
        dp.interface_create("wg0").await.unwrap();

        dp.peer_add("wg0", &key(2), &["10.9.0.2/32".to_string()], None)
            .await
            .unwrap();
        dp.peer_add(
            "wg0",
            &key(2),
            &["10.9.0.3/32".to_string()],
            Some("1.2.3.4:51820"),
        )
        .await
        .unwrap();

        let snap = dp.snapshot();
        let peer = &snap.interfaces["wg0"].peers[&key(2)];
        assert_eq!(peer.allowed_addrs, vec!["10.9.0.3/32".to_string()]);
        assert_eq!(peer.endpoint.as_deref(), Some("1.2.3.4:51820"));
        assert_eq!(snap.interfaces["wg0"].peers.len(), 1);
    }

    #[tokio::test]
    async fn test_peer_remove_missing_is_not_found() {
        let dp = MemoryDataPlane::new();
        dp.interface_create("wg0").await.unwrap();
        assert!(matches!(
            dp.peer_remove("wg0", &key(3)).await,
            Err(DataPlaneError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_configure_rejects_malformed_key() {
        let dp = MemoryDataPlane::new();
        dp.interface_create("wg0").await.unwrap();
        assert!(matches!(
            dp.interface_configure("wg0", "bogus", None, None).await,
            Err(DataPlaneError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_nat_rules_are_exactly_reversible() {
        let dp = MemoryDataPlane::new();
        let before = dp.snapshot();

        dp.nat_add("10.8.0.2", "eth0").await.unwrap();
        dp.nat_remove("10.8.0.2", "eth0").await.unwrap();

        assert_eq!(dp.snapshot(), before);
        assert!(matches!(
            dp.nat_remove("10.8.0.2", "eth0").await,
            Err(DataPlaneError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_injected_failure_fires_once() {
        let dp = MemoryDataPlane::new();
        dp.inject_failure("forwarding_enable");

        assert!(matches!(
            dp.forwarding_enable().await,
            Err(DataPlaneError::Unavailable(_))
        ));
        assert!(dp.forwarding_enable().await.is_ok());
    }
}
