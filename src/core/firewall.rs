//! Declarative router firewall configuration
//!
//! A [`FirewallConfig`] is what operators edit: the enable toggle and chain
//! policies, port forwards, the blocklist and the DMZ target. It never talks
//! to the kernel directly; [`compiler::compile`](crate::core::compiler::compile)
//! turns it into a [`RuleSet`].
//!
//! Port forwards and blocked addresses are kept in ordered maps so that two
//! configs with the same content always compile to the same rule program,
//! regardless of the order entries were added in.

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};

use chrono::{DateTime, Utc};
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::ruleset::RuleSet;

/// Seconds a staged change stays live before it is rolled back automatically.
pub const CONFIRM_TIMEOUT_SECS: u32 = 120;

/// Chain default verdict
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    strum::Display,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum Policy {
    #[default]
    #[strum(serialize = "ACCEPT")]
    Accept,
    #[strum(serialize = "DROP")]
    Drop,
}

impl Policy {
    /// Returns the nftables keyword for this verdict
    pub const fn as_nft(self) -> &'static str {
        match self {
            Policy::Accept => "accept",
            Policy::Drop => "drop",
        }
    }
}

/// Enable switch plus the per-chain default policies.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FirewallPolicy {
    pub enabled: bool,
    pub input_policy: Policy,
    pub forward_policy: Policy,
    pub output_policy: Policy,
}

impl Default for FirewallPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            input_policy: Policy::Accept,
            forward_policy: Policy::Accept,
            output_policy: Policy::Accept,
        }
    }
}

impl FirewallPolicy {
    /// Enabling the firewall closes the input chain; disabling opens it again.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        self.input_policy = if enabled { Policy::Drop } else { Policy::Accept };
    }
}

/// Transport protocol(s) covered by a port forward
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum ForwardProtocol {
    Tcp,
    Udp,
    Both,
}

impl ForwardProtocol {
    pub const fn as_str(self) -> &'static str {
        match self {
            ForwardProtocol::Tcp => "tcp",
            ForwardProtocol::Udp => "udp",
            ForwardProtocol::Both => "both",
        }
    }

    /// `meta l4proto` values this protocol expands to
    pub const fn l4protos(self) -> &'static [&'static str] {
        match self {
            ForwardProtocol::Tcp => &["tcp"],
            ForwardProtocol::Udp => &["udp"],
            ForwardProtocol::Both => &["tcp", "udp"],
        }
    }

    /// Whether two forwards on the same external port would claim the same packets.
    pub const fn overlaps(self, other: ForwardProtocol) -> bool {
        matches!(
            (self, other),
            (ForwardProtocol::Both, _)
                | (_, ForwardProtocol::Both)
                | (ForwardProtocol::Tcp, ForwardProtocol::Tcp)
                | (ForwardProtocol::Udp, ForwardProtocol::Udp)
        )
    }
}

/// Identity of a port forward: one external port per protocol.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ForwardKey {
    pub external_port: u16,
    pub protocol: ForwardProtocol,
}

/// WAN-side port translated to an internal host
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortForward {
    pub protocol: ForwardProtocol,
    pub external_port: u16,
    pub internal_ip: Ipv4Addr,
    pub internal_port: u16,
    #[serde(default)]
    pub description: String,
}

/// Address whose traffic is dropped on input and forward
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockedIp {
    pub ip: IpAddr,
    #[serde(default)]
    pub description: String,
}

/// Default destination for otherwise-unmatched inbound WAN traffic
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DmzConfig {
    pub enabled: bool,
    #[serde(default)]
    pub target_ip: Option<Ipv4Addr>,
}

/// Items stored in a [`FirewallConfig`] map, serialized as a plain list.
pub trait Keyed {
    type Key: Ord;
    fn key(&self) -> Self::Key;
}

impl Keyed for PortForward {
    type Key = ForwardKey;
    fn key(&self) -> ForwardKey {
        ForwardKey {
            external_port: self.external_port,
            protocol: self.protocol,
        }
    }
}

impl Keyed for BlockedIp {
    type Key = IpAddr;
    fn key(&self) -> IpAddr {
        self.ip
    }
}

mod keyed_list {
    use std::collections::BTreeMap;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use super::Keyed;

    pub fn serialize<V, S>(map: &BTreeMap<V::Key, V>, serializer: S) -> Result<S::Ok, S::Error>
    where
        V: Keyed + Serialize,
        S: Serializer,
    {
        serializer.collect_seq(map.values())
    }

    pub fn deserialize<'de, V, D>(deserializer: D) -> Result<BTreeMap<V::Key, V>, D::Error>
    where
        V: Keyed + Deserialize<'de>,
        D: Deserializer<'de>,
    {
        let items = Vec::<V>::deserialize(deserializer)?;
        Ok(items.into_iter().map(|item| (item.key(), item)).collect())
    }
}

/// Everything an operator can change about the router firewall.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FirewallConfig {
    #[serde(default)]
    pub policy: FirewallPolicy,
    #[serde(default, with = "keyed_list")]
    pub port_forwards: BTreeMap<ForwardKey, PortForward>,
    #[serde(default, with = "keyed_list")]
    pub blocked_ips: BTreeMap<IpAddr, BlockedIp>,
    #[serde(default)]
    pub dmz: DmzConfig,
}

impl FirewallConfig {
    /// Inserts or replaces the forward with the same protocol and external port.
    pub fn upsert_port_forward(&mut self, forward: PortForward) {
        self.port_forwards.insert(forward.key(), forward);
    }

    /// Removes a forward, returning it if it existed.
    pub fn remove_port_forward(&mut self, key: &ForwardKey) -> Option<PortForward> {
        self.port_forwards.remove(key)
    }

    pub fn block_ip(&mut self, blocked: BlockedIp) {
        self.blocked_ips.insert(blocked.ip, blocked);
    }

    pub fn unblock_ip(&mut self, ip: &IpAddr) -> Option<BlockedIp> {
        self.blocked_ips.remove(ip)
    }
}

/// Host network facts the compiler needs but operators don't edit through the API.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkLayout {
    /// nftables table owned by routerfw (family `inet`)
    pub table: String,
    /// Upstream interface; DNAT rules only match packets arriving here
    pub wan_interface: String,
    /// Trusted interfaces allowed to reach the router and the WAN
    pub lan_interfaces: Vec<String>,
    /// Trusted source networks allowed to reach the router
    pub lan_subnets: Vec<IpNetwork>,
}

impl Default for NetworkLayout {
    fn default() -> Self {
        Self {
            table: "routerfw".to_string(),
            wan_interface: "eth0".to_string(),
            lan_interfaces: vec!["br-lan".to_string()],
            lan_subnets: Vec::new(),
        }
    }
}

/// A configuration together with the rule program it compiled to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConfigSnapshot {
    pub config: FirewallConfig,
    pub rules: RuleSet,
}

/// Lifecycle of a [`PendingChange`]
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, strum::Display, strum::AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ChangeState {
    Staged,
    Confirmed,
    Reverted,
}

/// A change that is live in the kernel but not yet confirmed.
///
/// The record carries both sides of the change so that either outcome can be
/// completed from disk alone after a crash.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PendingChange {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub timeout_seconds: u32,
    pub description: String,
    pub before: ConfigSnapshot,
    pub after: ConfigSnapshot,
    pub state: ChangeState,
}

impl PendingChange {
    pub fn new(
        description: impl Into<String>,
        before: ConfigSnapshot,
        after: ConfigSnapshot,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            timeout_seconds: CONFIRM_TIMEOUT_SECS,
            description: description.into(),
            before,
            after,
            state: ChangeState::Staged,
        }
    }

    /// Wall-clock moment the change expires
    pub fn deadline(&self) -> DateTime<Utc> {
        self.created_at + chrono::Duration::seconds(i64::from(self.timeout_seconds))
    }

    /// Time left before expiry as seen from `now`, `None` once expired.
    pub fn remaining_at(&self, now: DateTime<Utc>) -> Option<std::time::Duration> {
        (self.deadline() - now).to_std().ok().filter(|d| !d.is_zero())
    }

    pub fn with_state(&self, state: ChangeState) -> Self {
        Self {
            state,
            ..self.clone()
        }
    }
}
