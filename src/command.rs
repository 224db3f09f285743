//! Configuration changes as values
//!
//! Every operator request that changes the firewall is expressed as a
//! [`ConfigCommand`]. The session applies the command to a copy of the active
//! [`FirewallConfig`], compiles the result and stages it; the command's
//! [`description`](ConfigCommand::description) travels with the pending change
//! into logs and the audit trail.
//!
//! Commands don't validate: the compiler rejects any configuration that can't
//! be turned into a sound rule program, so there is exactly one place that
//! decides what is allowed.
//!
//! # Example
//!
//! ```
//! use routerfw::command::ConfigCommand;
//! use routerfw::core::firewall::FirewallConfig;
//!
//! let mut config = FirewallConfig::default();
//! ConfigCommand::SetEnabled(true).execute(&mut config);
//! assert!(config.policy.enabled);
//! ```

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::core::firewall::{BlockedIp, DmzConfig, FirewallConfig, ForwardKey, PortForward};

/// A single operator-requested configuration change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigCommand {
    /// Enable (input policy DROP) or disable (input policy ACCEPT) the firewall
    SetEnabled(bool),
    /// Add a forward, replacing any forward with the same protocol and external port
    AddPortForward(PortForward),
    /// Remove the forward with this protocol and external port
    RemovePortForward(ForwardKey),
    /// Drop all traffic from an address
    BlockIp(BlockedIp),
    UnblockIp(IpAddr),
    SetDmz(DmzConfig),
}

impl ConfigCommand {
    /// Applies the change to `config` in place.
    pub fn execute(&self, config: &mut FirewallConfig) {
        match self {
            ConfigCommand::SetEnabled(enabled) => config.policy.set_enabled(*enabled),
            ConfigCommand::AddPortForward(forward) => config.upsert_port_forward(forward.clone()),
            ConfigCommand::RemovePortForward(key) => {
                config.remove_port_forward(key);
            }
            ConfigCommand::BlockIp(blocked) => config.block_ip(blocked.clone()),
            ConfigCommand::UnblockIp(ip) => {
                config.unblock_ip(ip);
            }
            ConfigCommand::SetDmz(dmz) => config.dmz = dmz.clone(),
        }
    }

    /// Returns a human-readable description of this command
    pub fn description(&self) -> String {
        match self {
            ConfigCommand::SetEnabled(true) => "Enable firewall".to_string(),
            ConfigCommand::SetEnabled(false) => "Disable firewall".to_string(),
            ConfigCommand::AddPortForward(f) => format!(
                "Forward {} {} to {}:{}",
                f.protocol, f.external_port, f.internal_ip, f.internal_port
            ),
            ConfigCommand::RemovePortForward(key) => {
                format!("Remove forward {} {}", key.protocol, key.external_port)
            }
            ConfigCommand::BlockIp(blocked) => format!("Block {}", blocked.ip),
            ConfigCommand::UnblockIp(ip) => format!("Unblock {ip}"),
            ConfigCommand::SetDmz(DmzConfig {
                enabled: true,
                target_ip: Some(target),
            }) => format!("Set DMZ host {target}"),
            ConfigCommand::SetDmz(DmzConfig { enabled: true, .. }) => "Enable DMZ".to_string(),
            ConfigCommand::SetDmz(_) => "Disable DMZ".to_string(),
        }
    }
}
