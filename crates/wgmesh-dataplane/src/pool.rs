//! Tunnel address pool

use crate::DataPlaneError;
use ipnet::Ipv4Net;
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Mutex;

/// Allocates addresses out of one CIDR block.
///
/// Never yields the network or broadcast address, nor an address that is
/// currently held. Release is idempotent; a just-released address may be
/// handed out again immediately.
pub struct IpPool {
    cidr: Ipv4Net,
    used: Mutex<HashSet<Ipv4Addr>>,
}

impl IpPool {
    pub fn new(cidr: &str) -> Result<Self, DataPlaneError> {
        let cidr: Ipv4Net = cidr
            .parse()
            .map_err(|e| DataPlaneError::InvalidArgument(format!("invalid CIDR {}: {}", cidr, e)))?;

        Ok(Self {
            cidr,
            used: Mutex::new(HashSet::new()),
        })
    }

    /// Mark an address as taken without allocating it (interface/gateway
    /// addresses). Out-of-range addresses are rejected.
    pub fn reserve(&self, addr: Ipv4Addr) -> Result<(), DataPlaneError> {
        if !self.cidr.contains(&addr) {
            return Err(DataPlaneError::InvalidArgument(format!(
                "{} is outside {}",
                addr, self.cidr
            )));
        }
        self.used.lock().unwrap().insert(addr);
        Ok(())
    }

    /// Allocate the lowest free address in the block
    pub fn allocate(&self) -> Result<Ipv4Addr, DataPlaneError> {
        let mut used = self.used.lock().unwrap();

        // hosts() skips the network and broadcast addresses
        for candidate in self.cidr.hosts() {
            if !used.contains(&candidate) {
                used.insert(candidate);
                return Ok(candidate);
            }
        }

        Err(DataPlaneError::Exhausted(format!(
            "no free addresses in {}",
            self.cidr
        )))
    }

    /// Return an address to the pool. Unknown addresses are ignored.
    pub fn release(&self, addr: Ipv4Addr) {
        self.used.lock().unwrap().remove(&addr);
    }

    pub fn cidr(&self) -> Ipv4Net {
        self.cidr
    }

    /// Number of held addresses
    pub fn in_use(&self) -> usize {
        self.used.lock().unwrap().len()
    }
}
