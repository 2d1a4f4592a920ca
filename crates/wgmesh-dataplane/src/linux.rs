//! Linux data plane driving ip/wg/sysctl/iptables
//!
//! Requires CAP_NET_ADMIN and the wireguard kernel module. Command
//! failures surface as `Unavailable`; callers treat that as fatal at
//! startup and as session teardown mid-flight.

use crate::{validate_wg_key, DataPlane, DataPlaneError};
use async_trait::async_trait;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

/// Production [`DataPlane`] binding
#[derive(Debug, Default)]
pub struct LinuxDataPlane;

impl LinuxDataPlane {
    pub fn new() -> Self {
        Self
    }

    async fn run(program: &str, args: &[&str]) -> Result<String, DataPlaneError> {
        let output = Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|e| DataPlaneError::Unavailable(format!("{} not runnable: {}", program, e)))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(DataPlaneError::Unavailable(format!(
                "{} {} failed: {}",
                program,
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }

    /// `wg set` with the private key piped through stdin so it never
    /// appears in the process list.
    async fn wg_set_private_key(
        interface: &str,
        private_key: &str,
        listen_port: Option<u16>,
    ) -> Result<(), DataPlaneError> {
        let mut args = vec![
            "set".to_string(),
            interface.to_string(),
            "private-key".to_string(),
            "/dev/stdin".to_string(),
        ];
        if let Some(port) = listen_port {
            args.push("listen-port".to_string());
            args.push(port.to_string());
        }

        let mut child = Command::new("wg")
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| DataPlaneError::Unavailable(format!("wg not runnable: {}", e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(private_key.as_bytes())
                .await
                .map_err(|e| DataPlaneError::Unavailable(format!("wg stdin: {}", e)))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| DataPlaneError::Unavailable(format!("wg wait: {}", e)))?;

        if output.status.success() {
            Ok(())
        } else {
            Err(DataPlaneError::Unavailable(format!(
                "wg set {} failed: {}",
                interface,
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }

    async fn interface_exists(name: &str) -> bool {
        Command::new("ip")
            .args(["link", "show", name])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }
}

#[async_trait]
impl DataPlane for LinuxDataPlane {
    async fn interface_create(&self, name: &str) -> Result<(), DataPlaneError> {
        if Self::interface_exists(name).await {
            debug!(interface = %name, "interface already exists");
            return Ok(());
        }

        Self::run("ip", &["link", "add", name, "type", "wireguard"]).await?;
        Self::run("ip", &["link", "set", name, "up"]).await?;
        debug!(interface = %name, "created tunnel interface");
        Ok(())
    }

    async fn interface_delete(&self, name: &str) -> Result<(), DataPlaneError> {
        if !Self::interface_exists(name).await {
            return Err(DataPlaneError::NotFound(format!("interface {}", name)));
        }
        Self::run("ip", &["link", "del", name]).await?;
        debug!(interface = %name, "deleted tunnel interface");
        Ok(())
    }

    async fn interface_configure(
        &self,
        name: &str,
        private_key: &str,
        listen_port: Option<u16>,
        address_cidr: Option<&str>,
    ) -> Result<(), DataPlaneError> {
        validate_wg_key(private_key)?;

        Self::wg_set_private_key(name, private_key, listen_port).await?;

        if let Some(addr) = address_cidr {
            // replace is idempotent across reconfiguration
            Self::run("ip", &["addr", "replace", addr, "dev", name]).await?;
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
        validate_wg_key(public_key)?;

        let allowed = allowed_addrs.join(",");
        let mut args = vec![
            "set",
            interface,
            "peer",
            public_key,
            "allowed-ips",
            allowed.as_str(),
        ];
        if let Some(ep) = endpoint {
            args.push("endpoint");
            args.push(ep);
        }

        Self::run("wg", &args).await?;
        debug!(interface = %interface, public_key = %public_key, "added tunnel peer");
        Ok(())
    }

    async fn peer_remove(&self, interface: &str, public_key: &str) -> Result<(), DataPlaneError> {
        // `wg set ... remove` succeeds silently for unknown peers, so
        // check presence first to honor the NotFound contract.
        let peers = Self::run("wg", &["show", interface, "peers"]).await?;
        if !peers.lines().any(|line| line.trim() == public_key) {
            return Err(DataPlaneError::NotFound(format!(
                "peer {} on {}",
                public_key, interface
            )));
        }

        Self::run("wg", &["set", interface, "peer", public_key, "remove"]).await?;
        Ok(())
    }

    async fn forwarding_enable(&self) -> Result<(), DataPlaneError> {
        Self::run("sysctl", &["-w", "net.ipv4.ip_forward=1"]).await?;
        Ok(())
    }

    async fn nat_add(&self, src_addr: &str, egress_interface: &str) -> Result<(), DataPlaneError> {
        let src = format!("{}/32", src_addr);
        Self::run(
            "iptables",
            &[
                "-t",
                "nat",
                "-A",
                "POSTROUTING",
                "-s",
                &src,
                "-o",
                egress_interface,
                "-j",
                "MASQUERADE",
            ],
        )
        .await?;

        if let Err(e) = Self::run("iptables", &["-A", "FORWARD", "-s", &src, "-j", "ACCEPT"]).await
        {
            // Keep the pair atomic: undo the masquerade rule
            warn!(src = %src, error = %e, "FORWARD rule failed, rolling back masquerade");
            let _ = Self::run(
                "iptables",
                &[
                    "-t",
                    "nat",
                    "-D",
                    "POSTROUTING",
                    "-s",
                    &src,
                    "-o",
                    egress_interface,
                    "-j",
                    "MASQUERADE",
                ],
            )
            .await;
            return Err(e);
        }
        Ok(())
    }

    async fn nat_remove(
        &self,
        src_addr: &str,
        egress_interface: &str,
    ) -> Result<(), DataPlaneError> {
        let src = format!("{}/32", src_addr);
        Self::run(
            "iptables",
            &[
                "-t",
                "nat",
                "-D",
                "POSTROUTING",
                "-s",
                &src,
                "-o",
                egress_interface,
                "-j",
                "MASQUERADE",
            ],
        )
        .await?;
        Self::run("iptables", &["-D", "FORWARD", "-s", &src, "-j", "ACCEPT"]).await?;
        Ok(())
    }
}
