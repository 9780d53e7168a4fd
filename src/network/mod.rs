//! Per-container network isolation: port reservations and firewall rules

pub mod firewall;
pub mod netsh;

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{ContainmentError, Result};

pub use firewall::PowerShellFirewall;
pub use netsh::NetshUrlAcl;

/// Reserves HTTP URL namespaces for a principal
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UrlAclTool: Send + Sync {
    async fn add_rule(&self, port: u16, principal: &str) -> Result<()>;

    async fn delete_rule(&self, port: u16) -> Result<()>;
}

/// Host firewall rules scoped to a principal
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FirewallManager: Send + Sync {
    /// Allow inbound TCP on `port`
    async fn open_port(&self, port: u16, principal: &str) -> Result<()>;

    /// Remove the principal's inbound rules
    async fn close_port(&self, principal: &str) -> Result<()>;

    async fn create_outbound_rule(&self, principal: &str, spec: &FirewallRuleSpec) -> Result<()>;

    /// Remove every rule carrying the principal as its group
    async fn remove_all_rules(&self, principal: &str) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
    #[default]
    All,
}

/// Inclusive address range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpRange {
    pub start: IpAddr,
    pub end: IpAddr,
}

impl IpRange {
    pub fn new(start: IpAddr, end: IpAddr) -> Self {
        Self { start, end }
    }

    pub fn single(addr: IpAddr) -> Self {
        Self {
            start: addr,
            end: addr,
        }
    }
}

impl fmt::Display for IpRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

/// Inclusive port range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    pub fn single(port: u16) -> Self {
        Self {
            start: port,
            end: port,
        }
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

/// Outbound allow rule for a container
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FirewallRuleSpec {
    #[serde(default)]
    pub protocol: Protocol,

    /// Empty means any remote address
    #[serde(default)]
    pub networks: Vec<IpRange>,

    /// Empty means any remote port
    #[serde(default)]
    pub ports: Vec<PortRange>,

    #[serde(default)]
    pub log: bool,
}

/// A port reserved for a principal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortReservation {
    pub port: u16,
    pub principal: String,
}

/// Ask the OS for a currently free loopback port
pub fn free_port() -> Result<u16> {
    let listener = TcpListener::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0))?;
    Ok(listener.local_addr()?.port())
}

fn check_principal(principal: &str) -> Result<()> {
    if principal.trim().is_empty() {
        return Err(ContainmentError::InvalidArgument(
            "principal must not be blank".to_string(),
        ));
    }
    Ok(())
}

/// Reserves ports and provisions firewall rules for container principals
pub struct LocalTcpPortManager {
    url_acl: Arc<dyn UrlAclTool>,
    firewall: Arc<dyn FirewallManager>,
}

impl LocalTcpPortManager {
    pub fn new(url_acl: Arc<dyn UrlAclTool>, firewall: Arc<dyn FirewallManager>) -> Self {
        Self { url_acl, firewall }
    }

    /// Manager backed by `netsh` and the PowerShell firewall cmdlets
    pub fn system() -> Self {
        Self::new(Arc::new(NetshUrlAcl::new()), Arc::new(PowerShellFirewall::new()))
    }

    /// Reserve `port` (0 picks a free one) and open it in the firewall.
    /// Returns the reserved port.
    pub async fn reserve_local_port(&self, port: u16, principal: &str) -> Result<u16> {
        check_principal(principal)?;

        let port = if port == 0 { free_port()? } else { port };
        info!(port, principal = %principal, "Reserving port");

        self.url_acl
            .add_rule(port, principal)
            .await
            .map_err(|e| ContainmentError::PortReservationFailed {
                port,
                principal: principal.to_string(),
                source: Box::new(e),
            })?;

        self.firewall
            .open_port(port, principal)
            .await
            .map_err(|e| ContainmentError::FirewallRuleFailed {
                principal: principal.to_string(),
                source: Box::new(e),
            })?;

        Ok(port)
    }

    /// Delete the ACL for `port` if given and close the principal's
    /// inbound rules. Both steps run; the first failure is returned.
    pub async fn release_local_port(&self, port: Option<u16>, principal: &str) -> Result<()> {
        check_principal(principal)?;
        info!(?port, principal = %principal, "Releasing port");

        let acl = match port {
            Some(port) => self.url_acl.delete_rule(port).await,
            None => Ok(()),
        };
        if let Err(e) = &acl {
            warn!(?port, error = %e, "Failed to delete URL ACL");
        }

        let firewall = self.firewall.close_port(principal).await;
        if let Err(e) = &firewall {
            warn!(principal = %principal, error = %e, "Failed to close firewall port");
        }

        acl.and(firewall)
    }

    pub async fn create_outbound_firewall_rule(
        &self,
        principal: &str,
        spec: &FirewallRuleSpec,
    ) -> Result<()> {
        check_principal(principal)?;
        self.firewall
            .create_outbound_rule(principal, spec)
            .await
            .map_err(|e| ContainmentError::FirewallRuleFailed {
                principal: principal.to_string(),
                source: Box::new(e),
            })
    }

    pub async fn remove_firewall_rules(&self, principal: &str) -> Result<()> {
        check_principal(principal)?;
        self.firewall.remove_all_rules(principal).await
    }
}
