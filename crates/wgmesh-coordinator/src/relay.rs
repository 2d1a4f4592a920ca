//! Coordinator-side relay provisioning
//!
//! When a requester cannot reach its exit directly, the coordinator
//! splices the path: the requester gets a peer slot on the coordinator's
//! relay interface, an address out of the relay pool, and a masquerade
//! rule out the egress interface. Every provisioning step has an exact
//! inverse and failures roll back in reverse order.

use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::{info, warn};
use wgmesh_dataplane::{DataPlane, DataPlaneError, IpPool};
use wgmesh_keys::WgKeyPair;
use wgmesh_proto::ControlError;

/// One provisioned relay path
#[derive(Debug, Clone)]
pub struct RelayLease {
    pub address: Ipv4Addr,
    pub client_public_key: String,
}

/// Owns the relay interface, its address pool, and the NAT rules
pub struct RelayProvisioner {
    dataplane: Arc<dyn DataPlane>,
    interface: String,
    listen_port: u16,
    egress_interface: String,
    pool: IpPool,
    keys: WgKeyPair,
}

impl RelayProvisioner {
    pub fn new(
        dataplane: Arc<dyn DataPlane>,
        interface: String,
        listen_port: u16,
        egress_interface: String,
        pool_cidr: &str,
    ) -> Result<Self, ControlError> {
        let pool = IpPool::new(pool_cidr)?;

        Ok(Self {
            dataplane,
            interface,
            listen_port,
            egress_interface,
            pool,
            keys: WgKeyPair::generate(),
        })
    }

    /// Relay interface public key, for requester-side peer configuration
    pub fn public_key(&self) -> String {
        self.keys.public.to_base64()
    }

    pub fn listen_port(&self) -> u16 {
        self.listen_port
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    /// Stand up the relay interface. `Unavailable` here is fatal to
    /// coordinator startup.
    pub async fn ensure(&self) -> Result<(), ControlError> {
        self.dataplane.interface_create(&self.interface).await?;

        let gateway = self
            .pool
            .cidr()
            .hosts()
            .next()
            .ok_or_else(|| ControlError::InvalidArgument("relay pool too small".to_string()))?;
        self.pool.reserve(gateway)?;

        let address = format!("{}/{}", gateway, self.pool.cidr().prefix_len());
        self.dataplane
            .interface_configure(
                &self.interface,
                &self.keys.private.to_base64(),
                Some(self.listen_port),
                Some(&address),
            )
            .await?;

        self.dataplane.forwarding_enable().await?;

        info!(
            interface = %self.interface,
            listen_port = self.listen_port,
            address = %address,
            "Relay interface ready"
        );
        Ok(())
    }

    /// Provision a relay path for one requester. On any failure the
    /// steps already taken are undone in reverse order.
    pub async fn provision(&self, client_public_key: &str) -> Result<RelayLease, ControlError> {
        let address = self
            .pool
            .allocate()
            .map_err(|e| ControlError::from(e).at_step("relay ip allocation"))?;

        let allowed = vec![format!("{}/32", address)];
        if let Err(e) = self
            .dataplane
            .peer_add(&self.interface, client_public_key, &allowed, None)
            .await
        {
            self.pool.release(address);
            return Err(ControlError::from(e).at_step("relay peer add"));
        }

        if let Err(e) = self
            .dataplane
            .nat_add(&address.to_string(), &self.egress_interface)
            .await
        {
            if let Err(undo) = self
                .dataplane
                .peer_remove(&self.interface, client_public_key)
                .await
            {
                warn!(error = %undo, "Rollback peer_remove failed");
            }
            self.pool.release(address);
            return Err(ControlError::from(e).at_step("relay nat add"));
        }

        info!(
            client_public_key = %client_public_key,
            relay_address = %address,
            "Provisioned relay path"
        );

        Ok(RelayLease {
            address,
            client_public_key: client_public_key.to_string(),
        })
    }

    /// Tear down a relay path: exact inverse of [`Self::provision`], in
    /// reverse order. Missing pieces are tolerated so revoke can run
    /// after partial failures.
    pub async fn revoke(&self, lease: &RelayLease) {
        if let Err(e) = self
            .dataplane
            .nat_remove(&lease.address.to_string(), &self.egress_interface)
            .await
        {
            if !matches!(e, DataPlaneError::NotFound(_)) {
                warn!(error = %e, "Relay nat_remove failed during revoke");
            }
        }

        if let Err(e) = self
            .dataplane
            .peer_remove(&self.interface, &lease.client_public_key)
            .await
        {
            if !matches!(e, DataPlaneError::NotFound(_)) {
                warn!(error = %e, "Relay peer_remove failed during revoke");
            }
        }

        self.pool.release(lease.address);

        info!(relay_address = %lease.address, "Revoked relay path");
    }
}
