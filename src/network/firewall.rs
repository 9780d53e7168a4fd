//! Windows Firewall rules through the PowerShell NetSecurity cmdlets
//!
//! Every rule is created with the container principal as its rule group,
//! which is what lets one call remove all of a container's rules.

use std::path::PathBuf;

use async_trait::async_trait;
use tracing::info;

use crate::error::Result;
use crate::tool::{resolve_tool, run_tool};

use super::{FirewallManager, FirewallRuleSpec, Protocol};

pub struct PowerShellFirewall {
    powershell_path: PathBuf,
}

impl PowerShellFirewall {
    pub fn new() -> Self {
        Self {
            powershell_path: resolve_tool("powershell.exe"),
        }
    }

    async fn run_script(&self, script: String) -> Result<()> {
        let args = vec![
            "-NoProfile".to_string(),
            "-NonInteractive".to_string(),
            "-Command".to_string(),
            script,
        ];
        run_tool(&self.powershell_path, &args).await?;
        Ok(())
    }
}

impl Default for PowerShellFirewall {
    fn default() -> Self {
        Self::new()
    }
}

/// Single-quoted PowerShell literal
fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Statement binding `$sddl` to an SDDL string granting `principal`
fn sddl_for(principal: &str) -> String {
    format!(
        "$sid = (New-Object System.Security.Principal.NTAccount({})).Translate([System.Security.Principal.SecurityIdentifier]).Value; $sddl = \"D:(A;;CC;;;$sid)\"",
        quote(principal)
    )
}

pub fn open_port_script(port: u16, principal: &str) -> String {
    format!(
        "{}; New-NetFirewallRule -DisplayName {} -Group {} -Direction Inbound -Action Allow -Protocol TCP -LocalPort {} -LocalUser $sddl | Out-Null",
        sddl_for(principal),
        quote(&format!("{} inbound {}", principal, port)),
        quote(principal),
        port
    )
}

pub fn close_port_script(principal: &str) -> String {
    format!(
        "Get-NetFirewallRule -Group {} -ErrorAction SilentlyContinue | Where-Object {{ $_.Direction -eq 'Inbound' }} | Remove-NetFirewallRule",
        quote(principal)
    )
}

pub fn outbound_rule_script(principal: &str, spec: &FirewallRuleSpec) -> String {
    let mut rule = format!(
        "New-NetFirewallRule -DisplayName {} -Group {} -Direction Outbound -Action Allow -Protocol {} -LocalUser $sddl",
        quote(&format!("{} outbound", principal)),
        quote(principal),
        spec.protocol.as_cmdlet_value()
    );

    if !spec.networks.is_empty() {
        let ranges: Vec<String> = spec.networks.iter().map(|n| quote(&n.to_string())).collect();
        rule.push_str(&format!(" -RemoteAddress {}", ranges.join(",")));
    }
    if !spec.ports.is_empty() && spec.protocol.has_ports() {
        let ranges: Vec<String> = spec.ports.iter().map(|p| quote(&p.to_string())).collect();
        rule.push_str(&format!(" -RemotePort {}", ranges.join(",")));
    }
    rule.push_str(" | Out-Null");

    let mut script = format!("{}; {}", sddl_for(principal), rule);
    if spec.log {
        script.push_str("; Set-NetFirewallProfile -All -LogAllowed True");
    }
    script
}

pub fn remove_all_script(principal: &str) -> String {
    format!(
        "Remove-NetFirewallRule -Group {} -ErrorAction SilentlyContinue",
        quote(principal)
    )
}

impl Protocol {
    fn as_cmdlet_value(&self) -> &'static str {
        match self {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
            Protocol::Icmp => "ICMPv4",
            Protocol::All => "Any",
        }
    }

    fn has_ports(&self) -> bool {
        matches!(self, Protocol::Tcp | Protocol::Udp)
    }
}

#[async_trait]
impl FirewallManager for PowerShellFirewall {
    async fn open_port(&self, port: u16, principal: &str) -> Result<()> {
        self.run_script(open_port_script(port, principal)).await?;
        info!(port, principal = %principal, "Inbound firewall rule added");
        Ok(())
    }

    async fn close_port(&self, principal: &str) -> Result<()> {
        self.run_script(close_port_script(principal)).await?;
        info!(principal = %principal, "Inbound firewall rules removed");
        Ok(())
    }

    async fn create_outbound_rule(&self, principal: &str, spec: &FirewallRuleSpec) -> Result<()> {
        self.run_script(outbound_rule_script(principal, spec)).await?;
        info!(principal = %principal, protocol = ?spec.protocol, "Outbound firewall rule added");
        Ok(())
    }

    async fn remove_all_rules(&self, principal: &str) -> Result<()> {
        self.run_script(remove_all_script(principal)).await?;
        info!(principal = %principal, "Firewall rules removed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{IpRange, PortRange};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_open_port_rule_is_grouped_by_principal() {
        let script = open_port_script(8080, "c_user");
        assert!(script.starts_with(&sddl_for("c_user")));
        assert!(script.ends_with(
            "; New-NetFirewallRule -DisplayName 'c_user inbound 8080' -Group 'c_user' -Direction Inbound -Action Allow -Protocol TCP -LocalPort 8080 -LocalUser $sddl | Out-Null"
        ));
    }

    #[test]
    fn test_quotes_are_escaped() {
        assert_eq!(
            remove_all_script("o'brien"),
            "Remove-NetFirewallRule -Group 'o''brien' -ErrorAction SilentlyContinue"
        );
    }

    #[test]
    fn test_outbound_rule_lists_ranges() {
        let spec = FirewallRuleSpec {
            protocol: Protocol::Tcp,
            networks: vec![
                IpRange::single("10.0.0.1".parse().unwrap()),
                IpRange::new("192.168.1.1".parse().unwrap(), "192.168.1.20".parse().unwrap()),
            ],
            ports: vec![PortRange::single(443), PortRange::new(8000, 8100)],
            log: false,
        };

        let script = outbound_rule_script("c_user", &spec);

        assert!(script.starts_with("$sid = (New-Object System.Security.Principal.NTAccount('c_user'))"));
        assert!(script.contains("-Direction Outbound -Action Allow -Protocol TCP -LocalUser $sddl"));
        assert!(script.contains("-RemoteAddress '10.0.0.1','192.168.1.1-192.168.1.20'"));
        assert!(script.contains("-RemotePort '443','8000-8100'"));
        assert!(!script.contains("LogAllowed"));
    }

    #[test]
    fn test_icmp_rule_ignores_ports_and_enables_logging() {
        let spec = FirewallRuleSpec {
            protocol: Protocol::Icmp,
            networks: vec![],
            ports: vec![PortRange::single(80)],
            log: true,
        };

        let script = outbound_rule_script("c_user", &spec);

        assert!(script.contains("-Protocol ICMPv4"));
        assert!(!script.contains("-RemotePort"));
        assert!(!script.contains("-RemoteAddress"));
        assert!(script.ends_with("Set-NetFirewallProfile -All -LogAllowed True"));
    }
}
