//! Compiled rule program and its nftables renderings
//!
//! A [`RuleSet`] is the complete content of the routerfw table: four base
//! chains with their policies and an ordered list of rules. It is rendered
//! two ways:
//!
//! - [`RuleSet::to_nftables_json`]: the batch fed to `nft --json -f -`
//! - [`RuleSet::to_nft_text`]: `nft list table`-style text for humans
//!
//! The JSON batch always starts with `add table` / `delete table` / `add table`
//! so that applying it replaces whatever the table held before in one kernel
//! transaction. Applying the same `RuleSet` twice therefore yields the same
//! kernel state, which is what makes rollback safe to retry.

use std::fmt::{self, Write};
use std::net::{IpAddr, Ipv4Addr};

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};

use crate::core::firewall::{ForwardProtocol, Policy};

/// Base chains of the routerfw table
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
    strum::Display,
    strum::EnumIter,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ChainKind {
    Prerouting,
    Input,
    Forward,
    Output,
}

impl ChainKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            ChainKind::Prerouting => "prerouting",
            ChainKind::Input => "input",
            ChainKind::Forward => "forward",
            ChainKind::Output => "output",
        }
    }

    /// nftables chain type (`nat` for DNAT, `filter` otherwise)
    pub const fn chain_type(self) -> &'static str {
        match self {
            ChainKind::Prerouting => "nat",
            _ => "filter",
        }
    }

    /// Hook priority, `dstnat` (-100) for prerouting and `filter` (0) for the rest
    pub const fn priority(self) -> i32 {
        match self {
            ChainKind::Prerouting => -100,
            _ => 0,
        }
    }

    const fn priority_name(self) -> &'static str {
        match self {
            ChainKind::Prerouting => "dstnat",
            _ => "filter",
        }
    }
}

/// A base chain and its default verdict
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChainSpec {
    pub kind: ChainKind,
    pub policy: Policy,
}

/// A single packet match
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "match", content = "value")]
pub enum Match {
    /// `ct state { established, related }`
    Established,
    /// `iifname "..."`
    InIface(String),
    /// `meta nfproto ipv4`
    Ipv4,
    /// `ip saddr` / `ip6 saddr`
    SourceNet(IpNetwork),
    /// `ip daddr` / `ip6 daddr`
    DestAddr(IpAddr),
    /// `meta l4proto tcp` / `meta l4proto { tcp, udp }`
    L4Proto(ForwardProtocol),
    /// `th dport N`
    DestPort(u16),
}

/// What happens to a matching packet
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Accept,
    Drop,
    /// Rewrite the destination to `addr[:port]`
    Dnat { addr: Ipv4Addr, port: Option<u16> },
    /// Count packets without deciding their fate
    Count,
}

/// One rule in one base chain
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CompiledRule {
    pub chain: ChainKind,
    pub matches: Vec<Match>,
    pub verdict: Verdict,
    pub comment: String,
}

impl CompiledRule {
    pub fn new(
        chain: ChainKind,
        matches: Vec<Match>,
        verdict: Verdict,
        comment: impl Into<String>,
    ) -> Self {
        Self {
            chain,
            matches,
            verdict,
            comment: comment.into(),
        }
    }
}

/// The full content of the routerfw table
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuleSet {
    pub table: String,
    pub chains: Vec<ChainSpec>,
    pub rules: Vec<CompiledRule>,
}

impl RuleSet {
    /// A table with all four base chains accepting and no rules.
    pub fn empty(table: impl Into<String>) -> Self {
        use strum::IntoEnumIterator;

        Self {
            table: table.into(),
            chains: ChainKind::iter()
                .map(|kind| ChainSpec {
                    kind,
                    policy: Policy::Accept,
                })
                .collect(),
            rules: Vec::new(),
        }
    }

    /// Rules belonging to `chain`, in program order
    pub fn rules_in(&self, chain: ChainKind) -> impl Iterator<Item = &CompiledRule> {
        self.rules.iter().filter(move |r| r.chain == chain)
    }

    pub fn policy_of(&self, chain: ChainKind) -> Option<Policy> {
        self.chains.iter().find(|c| c.kind == chain).map(|c| c.policy)
    }

    /// SHA-256 over the canonical serialization, used in logs and audit entries.
    pub fn fingerprint(&self) -> String {
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        format!("{:x}", hasher.finalize())
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // JSON Helper Functions
    // ═══════════════════════════════════════════════════════════════════════════

    /// Creates a match expression for nft meta keys (l4proto, iifname, nfproto)
    fn meta_match(key: &str, value: impl Serialize) -> Value {
        json!({
            "match": {
                "left": { "meta": { "key": key } },
                "op": "==",
                "right": value
            }
        })
    }

    fn payload_match(protocol: &str, field: &str, value: Value) -> Value {
        json!({
            "match": {
                "left": { "payload": { "protocol": protocol, "field": field } },
                "op": "==",
                "right": value
            }
        })
    }

    fn network_value(net: &IpNetwork) -> Value {
        if is_host(net) {
            json!(net.ip().to_string())
        } else {
            json!({ "prefix": { "addr": net.network().to_string(), "len": net.prefix() } })
        }
    }

    fn match_json(m: &Match) -> Value {
        match m {
            Match::Established => json!({
                "match": {
                    "left": { "ct": { "key": "state" } },
                    "op": "in",
                    "right": { "set": ["established", "related"] }
                }
            }),
            Match::InIface(name) => Self::meta_match("iifname", name),
            Match::Ipv4 => Self::meta_match("nfproto", "ipv4"),
            Match::SourceNet(net) => {
                Self::payload_match(ip_family(net.ip()), "saddr", Self::network_value(net))
            }
            Match::DestAddr(addr) => {
                Self::payload_match(ip_family(*addr), "daddr", json!(addr.to_string()))
            }
            Match::L4Proto(protocol) => match protocol.l4protos() {
                [single] => Self::meta_match("l4proto", single),
                several => Self::meta_match("l4proto", json!({ "set": several })),
            },
            Match::DestPort(port) => Self::payload_match("th", "dport", json!(port)),
        }
    }

    fn verdict_json(verdict: &Verdict) -> Vec<Value> {
        match verdict {
            Verdict::Accept => vec![json!({ "accept": null })],
            Verdict::Drop => vec![json!({ "counter": null }), json!({ "drop": null })],
            Verdict::Dnat { addr, port } => {
                let mut dnat = json!({ "family": "ip", "addr": addr.to_string() });
                if let Some(port) = port {
                    dnat["port"] = json!(port);
                }
                vec![json!({ "dnat": dnat })]
            }
            Verdict::Count => vec![json!({ "counter": null })],
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════

    /// Generates the nftables JSON batch that replaces the table in one transaction.
    pub fn to_nftables_json(&self) -> Value {
        let table = json!({ "family": "inet", "name": self.table });
        let mut batch = Vec::with_capacity(3 + self.chains.len() + self.rules.len());

        // add-then-delete makes the delete succeed even if the table is absent
        batch.push(json!({ "add": { "table": table.clone() } }));
        batch.push(json!({ "delete": { "table": table.clone() } }));
        batch.push(json!({ "add": { "table": table } }));

        for chain in &self.chains {
            batch.push(json!({
                "add": {
                    "chain": {
                        "family": "inet",
                        "table": self.table,
                        "name": chain.kind.as_str(),
                        "type": chain.kind.chain_type(),
                        "hook": chain.kind.as_str(),
                        "prio": chain.kind.priority(),
                        "policy": chain.policy.as_nft()
                    }
                }
            }));
        }

        for rule in &self.rules {
            let mut expr: Vec<Value> = rule.matches.iter().map(Self::match_json).collect();
            expr.extend(Self::verdict_json(&rule.verdict));
            batch.push(json!({
                "add": {
                    "rule": {
                        "family": "inet",
                        "table": self.table,
                        "chain": rule.chain.as_str(),
                        "expr": expr,
                        "comment": rule.comment
                    }
                }
            }));
        }

        json!({ "nftables": batch })
    }

    /// Generates human-readable .nft text
    pub fn to_nft_text(&self) -> String {
        let mut out = String::new();

        let _ = writeln!(out, "table inet {} {{", self.table);

        for (i, chain) in self.chains.iter().enumerate() {
            if i > 0 {
                let _ = writeln!(out);
            }
            let _ = writeln!(out, "    chain {} {{", chain.kind);
            let _ = writeln!(
                out,
                "        type {} hook {} priority {}; policy {};",
                chain.kind.chain_type(),
                chain.kind,
                chain.kind.priority_name(),
                chain.policy.as_nft()
            );
            for rule in self.rules_in(chain.kind) {
                let _ = writeln!(out, "        {rule}");
            }
            let _ = writeln!(out, "    }}");
        }

        let _ = writeln!(out, "}}");

        out
    }

    /// Line diff of the .nft text from `previous` to `self`, `None` when identical
    pub fn diff_from(&self, previous: &RuleSet) -> Option<String> {
        if self == previous {
            return None;
        }

        let old_text = previous.to_nft_text();
        let new_text = self.to_nft_text();
        let diff = similar::TextDiff::from_lines(&old_text, &new_text);
        let mut result = String::new();

        for change in diff.iter_all_changes() {
            let sign = match change.tag() {
                similar::ChangeTag::Delete => "- ",
                similar::ChangeTag::Insert => "+ ",
                similar::ChangeTag::Equal => "  ",
            };
            let _ = write!(result, "{sign}{change}");
        }

        Some(result)
    }
}

fn is_host(net: &IpNetwork) -> bool {
    match net {
        IpNetwork::V4(n) => n.prefix() == 32,
        IpNetwork::V6(n) => n.prefix() == 128,
    }
}

const fn ip_family(addr: IpAddr) -> &'static str {
    match addr {
        IpAddr::V4(_) => "ip",
        IpAddr::V6(_) => "ip6",
    }
}

impl fmt::Display for Match {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Match::Established => write!(f, "ct state {{ established, related }}"),
            Match::InIface(name) => write!(f, "iifname \"{name}\""),
            Match::Ipv4 => write!(f, "meta nfproto ipv4"),
            Match::SourceNet(net) if is_host(net) => {
                write!(f, "{} saddr {}", ip_family(net.ip()), net.ip())
            }
            Match::SourceNet(net) => write!(
                f,
                "{} saddr {}/{}",
                ip_family(net.ip()),
                net.network(),
                net.prefix()
            ),
            Match::DestAddr(addr) => write!(f, "{} daddr {addr}", ip_family(*addr)),
            Match::L4Proto(protocol) => match protocol.l4protos() {
                [single] => write!(f, "meta l4proto {single}"),
                several => write!(f, "meta l4proto {{ {} }}", several.join(", ")),
            },
            Match::DestPort(port) => write!(f, "th dport {port}"),
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Accept => write!(f, "accept"),
            Verdict::Drop => write!(f, "counter drop"),
            Verdict::Dnat {
                addr,
                port: Some(port),
            } => write!(f, "dnat ip to {addr}:{port}"),
            Verdict::Dnat { addr, port: None } => write!(f, "dnat ip to {addr}"),
            Verdict::Count => write!(f, "counter"),
        }
    }
}

impl fmt::Display for CompiledRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for m in &self.matches {
            write!(f, "{m} ")?;
        }
        write!(f, "{}", self.verdict)?;
        if !self.comment.is_empty() {
            write!(f, " comment \"{}\"", self.comment)?;
        }
        Ok(())
    }
}
