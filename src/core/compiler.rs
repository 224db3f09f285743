//! Configuration → rule program compilation
//!
//! [`compile`] is pure and deterministic: the same [`FirewallConfig`] and
//! [`NetworkLayout`] always produce the same [`RuleSet`], and nothing here
//! touches the kernel or the disk. The session relies on that to detect no-op
//! changes by comparing rule programs.
//!
//! # Rule order
//!
//! 1. Tracked (established/related) traffic is accepted on input and forward
//! 2. Loopback, LAN interfaces, LAN subnets and WAN DHCP replies are accepted on input
//! 3. Blocked sources are dropped on input and forward
//! 4. DMZ target is accepted on forward
//! 5. Each port forward gets a forward accept and a prerouting DNAT
//! 6. DMZ DNAT goes last in prerouting so explicit forwards win
//! 7. Chains that drop by default end with a counter
//!
//! DNAT keeps the original source address, so the blocklist drops in the
//! forward chain also stop blocked hosts from reaching forwarded services.

use std::net::IpAddr;

use ipnetwork::IpNetwork;

use crate::core::error::CompileError;
use crate::core::firewall::{
    FirewallConfig, ForwardProtocol, NetworkLayout, Policy, PortForward,
};
use crate::core::ruleset::{ChainKind, ChainSpec, CompiledRule, Match, RuleSet, Verdict};
use crate::validators;

/// DHCP client port; replies from the upstream DHCP server land here
const DHCP_CLIENT_PORT: u16 = 68;

/// Compiles `config` into the complete rule program for `layout.table`.
///
/// # Errors
///
/// Returns [`CompileError`] when the configuration contains an unusable
/// address or port, overlapping forwards, a DMZ without target, or when
/// forwards are configured without a WAN interface.
pub fn compile(config: &FirewallConfig, layout: &NetworkLayout) -> Result<RuleSet, CompileError> {
    validate(config, layout)?;

    let mut rules = Vec::with_capacity(
        8 + layout.lan_interfaces.len() * 2
            + layout.lan_subnets.len()
            + config.blocked_ips.len() * 2
            + config.port_forwards.len() * 2,
    );

    add_base_rules(&mut rules, layout);

    for blocked in config.blocked_ips.values() {
        let comment = described(&format!("block {}", blocked.ip), &blocked.description);
        for chain in [ChainKind::Input, ChainKind::Forward] {
            rules.push(CompiledRule::new(
                chain,
                vec![Match::SourceNet(IpNetwork::from(blocked.ip))],
                Verdict::Drop,
                comment.clone(),
            ));
        }
    }

    let dmz_target = config.dmz.target_ip.filter(|_| config.dmz.enabled);

    if let Some(target) = dmz_target {
        rules.push(CompiledRule::new(
            ChainKind::Forward,
            vec![Match::DestAddr(IpAddr::V4(target))],
            Verdict::Accept,
            format!("dmz {target}"),
        ));
    }

    for forward in config.port_forwards.values() {
        add_port_forward(&mut rules, forward, &layout.wan_interface);
    }

    if let Some(target) = dmz_target {
        rules.push(CompiledRule::new(
            ChainKind::Prerouting,
            vec![Match::InIface(layout.wan_interface.clone()), Match::Ipv4],
            Verdict::Dnat {
                addr: target,
                port: None,
            },
            format!("dmz {target}"),
        ));
    }

    let policy = &config.policy;
    let chains = vec![
        ChainSpec {
            kind: ChainKind::Prerouting,
            policy: Policy::Accept,
        },
        ChainSpec {
            kind: ChainKind::Input,
            policy: policy.input_policy,
        },
        ChainSpec {
            kind: ChainKind::Forward,
            policy: policy.forward_policy,
        },
        ChainSpec {
            kind: ChainKind::Output,
            policy: policy.output_policy,
        },
    ];

    for chain in &chains {
        if chain.policy == Policy::Drop {
            rules.push(CompiledRule::new(
                chain.kind,
                Vec::new(),
                Verdict::Count,
                format!("{} default drop", chain.kind),
            ));
        }
    }

    Ok(RuleSet {
        table: layout.table.clone(),
        chains,
        rules,
    })
}

fn add_base_rules(rules: &mut Vec<CompiledRule>, layout: &NetworkLayout) {
    for chain in [ChainKind::Input, ChainKind::Forward] {
        rules.push(CompiledRule::new(
            chain,
            vec![Match::Established],
            Verdict::Accept,
            "allow tracked connections",
        ));
    }

    rules.push(CompiledRule::new(
        ChainKind::Input,
        vec![Match::InIface("lo".to_string())],
        Verdict::Accept,
        "allow loopback",
    ));

    for iface in &layout.lan_interfaces {
        rules.push(CompiledRule::new(
            ChainKind::Input,
            vec![Match::InIface(iface.clone())],
            Verdict::Accept,
            format!("allow lan {iface}"),
        ));
        rules.push(CompiledRule::new(
            ChainKind::Forward,
            vec![Match::InIface(iface.clone())],
            Verdict::Accept,
            format!("allow lan {iface} outbound"),
        ));
    }

    for subnet in &layout.lan_subnets {
        rules.push(CompiledRule::new(
            ChainKind::Input,
            vec![Match::SourceNet(*subnet)],
            Verdict::Accept,
            format!("allow lan subnet {subnet}"),
        ));
    }

    if !layout.wan_interface.is_empty() {
        rules.push(CompiledRule::new(
            ChainKind::Input,
            vec![
                Match::InIface(layout.wan_interface.clone()),
                Match::L4Proto(ForwardProtocol::Udp),
                Match::DestPort(DHCP_CLIENT_PORT),
            ],
            Verdict::Accept,
            "allow dhcp replies on wan",
        ));
    }
}

fn add_port_forward(rules: &mut Vec<CompiledRule>, forward: &PortForward, wan: &str) {
    let comment = described(
        &format!("forward {} {}", forward.protocol, forward.external_port),
        &forward.description,
    );

    rules.push(CompiledRule::new(
        ChainKind::Forward,
        vec![
            Match::DestAddr(IpAddr::V4(forward.internal_ip)),
            Match::L4Proto(forward.protocol),
            Match::DestPort(forward.internal_port),
        ],
        Verdict::Accept,
        comment.clone(),
    ));

    rules.push(CompiledRule::new(
        ChainKind::Prerouting,
        vec![
            Match::InIface(wan.to_string()),
            Match::Ipv4,
            Match::L4Proto(forward.protocol),
            Match::DestPort(forward.external_port),
        ],
        Verdict::Dnat {
            addr: forward.internal_ip,
            port: Some(forward.internal_port),
        },
        comment,
    ));
}

/// Rule comment: a fixed prefix plus the sanitized operator description.
fn described(prefix: &str, description: &str) -> String {
    let description = validators::sanitize_label(description);
    if description.is_empty() {
        prefix.to_string()
    } else {
        format!("{prefix}: {description}")
    }
}

/// Checks everything [`compile`] needs to hold before emitting rules.
///
/// # Errors
///
/// Returns the first problem found, in a stable order.
pub fn validate(config: &FirewallConfig, layout: &NetworkLayout) -> Result<(), CompileError> {
    if layout.table.is_empty() {
        return Err(CompileError::Invalid {
            field: "table",
            message: "table name is empty".to_string(),
        });
    }

    for iface in &layout.lan_interfaces {
        validators::validate_interface(iface)?;
    }
    if !layout.wan_interface.is_empty() {
        validators::validate_interface(&layout.wan_interface)?;
    }

    let needs_wan = !config.port_forwards.is_empty() || config.dmz.enabled;
    if needs_wan && layout.wan_interface.is_empty() {
        return Err(CompileError::MissingWanInterface);
    }

    let mut previous: Option<&PortForward> = None;
    for forward in config.port_forwards.values() {
        validators::validate_port("external_port", forward.external_port)?;
        validators::validate_port("internal_port", forward.internal_port)?;
        validators::check_forward_target(forward.internal_ip).map_err(|reason| {
            CompileError::UnusableAddress {
                field: "internal_ip",
                addr: IpAddr::V4(forward.internal_ip),
                reason,
            }
        })?;

        // Map order groups forwards by external port, so overlaps are adjacent
        if let Some(prev) = previous
            && prev.external_port == forward.external_port
            && prev.protocol.overlaps(forward.protocol)
        {
            return Err(CompileError::OverlappingForward {
                port: forward.external_port,
                existing: prev.protocol.to_string(),
            });
        }
        previous = Some(forward);
    }

    for blocked in config.blocked_ips.values() {
        validators::check_blockable(blocked.ip).map_err(|reason| {
            CompileError::UnusableAddress {
                field: "ip",
                addr: blocked.ip,
                reason,
            }
        })?;
    }

    if config.dmz.enabled {
        let target = config.dmz.target_ip.ok_or(CompileError::DmzWithoutTarget)?;
        validators::check_forward_target(target).map_err(|reason| {
            CompileError::UnusableAddress {
                field: "target_ip",
                addr: IpAddr::V4(target),
                reason,
            }
        })?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;
    use crate::core::firewall::{BlockedIp, DmzConfig};
    use crate::core::test_helpers::{forward, test_layout};

    fn comments(rules: &RuleSet, chain: ChainKind) -> Vec<String> {
        rules.rules_in(chain).map(|r| r.comment.clone()).collect()
    }

    #[test]
    fn test_default_config_compiles_to_open_table() {
        let rules = compile(&FirewallConfig::default(), &test_layout()).unwrap();
        assert_eq!(rules.table, "routerfw");
        assert!(rules.chains.iter().all(|c| c.policy == Policy::Accept));
        assert_eq!(rules.rules_in(ChainKind::Prerouting).count(), 0);
        // no counters when nothing drops by default
        assert!(rules.rules.iter().all(|r| r.verdict != Verdict::Count));
    }

    #[test]
    fn test_enabled_firewall_drops_input_and_keeps_lan_open() {
        let mut config = FirewallConfig::default();
        config.policy.set_enabled(true);
        let rules = compile(&config, &test_layout()).unwrap();

        assert_eq!(rules.policy_of(ChainKind::Input), Some(Policy::Drop));
        let input = comments(&rules, ChainKind::Input);
        assert_eq!(
            input,
            vec![
                "allow tracked connections",
                "allow loopback",
                "allow lan br-lan",
                "allow lan subnet 192.168.1.0/24",
                "allow dhcp replies on wan",
                "input default drop",
            ]
        );
    }

    #[test]
    fn test_port_forward_emits_dnat_and_forward_accept() {
        let mut config = FirewallConfig::default();
        config.upsert_port_forward(forward(ForwardProtocol::Tcp, 8080, 80));
        let rules = compile(&config, &test_layout()).unwrap();

        let dnat: Vec<_> = rules.rules_in(ChainKind::Prerouting).collect();
        assert_eq!(dnat.len(), 1);
        assert_eq!(
            dnat[0].verdict,
            Verdict::Dnat {
                addr: Ipv4Addr::new(192, 168, 1, 10),
                port: Some(80)
            }
        );
        assert!(dnat[0].matches.contains(&Match::InIface("eth0".into())));
        assert!(dnat[0].matches.contains(&Match::DestPort(8080)));

        let accept = rules
            .rules_in(ChainKind::Forward)
            .find(|r| r.comment.starts_with("forward tcp 8080"))
            .unwrap();
        assert!(accept.matches.contains(&Match::DestPort(80)));
    }

    #[test]
    fn test_blocked_ip_precedes_forward_accepts() {
        let mut config = FirewallConfig::default();
        config.upsert_port_forward(forward(ForwardProtocol::Tcp, 443, 443));
        config.block_ip(BlockedIp {
            ip: "198.51.100.4".parse().unwrap(),
            description: "abuse".into(),
        });
        let rules = compile(&config, &test_layout()).unwrap();

        let forward_chain = comments(&rules, ChainKind::Forward);
        let block = forward_chain
            .iter()
            .position(|c| c == "block 198.51.100.4: abuse")
            .unwrap();
        let accept = forward_chain
            .iter()
            .position(|c| c.starts_with("forward tcp 443"))
            .unwrap();
        assert!(block < accept);
        assert!(comments(&rules, ChainKind::Input).contains(&"block 198.51.100.4: abuse".into()));
    }

    #[test]
    fn test_dmz_dnat_is_last_in_prerouting() {
        let mut config = FirewallConfig::default();
        config.upsert_port_forward(forward(ForwardProtocol::Udp, 51820, 51820));
        config.dmz = DmzConfig {
            enabled: true,
            target_ip: Some(Ipv4Addr::new(192, 168, 1, 50)),
        };
        let rules = compile(&config, &test_layout()).unwrap();

        let prerouting: Vec<_> = rules.rules_in(ChainKind::Prerouting).collect();
        assert_eq!(prerouting.len(), 2);
        assert_eq!(
            prerouting[1].verdict,
            Verdict::Dnat {
                addr: Ipv4Addr::new(192, 168, 1, 50),
                port: None
            }
        );
    }

    #[test]
    fn test_disabled_dmz_with_target_emits_nothing() {
        let mut config = FirewallConfig::default();
        config.dmz = DmzConfig {
            enabled: false,
            target_ip: Some(Ipv4Addr::new(192, 168, 1, 50)),
        };
        let rules = compile(&config, &test_layout()).unwrap();
        assert!(rules.rules.iter().all(|r| !r.comment.starts_with("dmz")));
    }

    #[test]
    fn test_rejects_dmz_without_target() {
        let mut config = FirewallConfig::default();
        config.dmz.enabled = true;
        assert_eq!(
            compile(&config, &test_layout()),
            Err(CompileError::DmzWithoutTarget)
        );
    }

    #[test]
    fn test_rejects_overlapping_forwards() {
        let mut config = FirewallConfig::default();
        config.upsert_port_forward(forward(ForwardProtocol::Tcp, 80, 80));
        config.upsert_port_forward(forward(ForwardProtocol::Both, 80, 8080));
        assert!(matches!(
            compile(&config, &test_layout()),
            Err(CompileError::OverlappingForward { port: 80, .. })
        ));

        // tcp and udp on the same port don't overlap
        let mut config = FirewallConfig::default();
        config.upsert_port_forward(forward(ForwardProtocol::Tcp, 80, 80));
        config.upsert_port_forward(forward(ForwardProtocol::Udp, 80, 80));
        assert!(compile(&config, &test_layout()).is_ok());
    }

    #[test]
    fn test_rejects_zero_ports_and_bad_targets() {
        let mut config = FirewallConfig::default();
        config.upsert_port_forward(forward(ForwardProtocol::Tcp, 80, 0));
        assert_eq!(
            compile(&config, &test_layout()),
            Err(CompileError::InvalidPort {
                field: "internal_port"
            })
        );

        let mut config = FirewallConfig::default();
        let mut bad = forward(ForwardProtocol::Tcp, 80, 80);
        bad.internal_ip = Ipv4Addr::BROADCAST;
        config.upsert_port_forward(bad);
        assert!(matches!(
            compile(&config, &test_layout()),
            Err(CompileError::UnusableAddress {
                field: "internal_ip",
                ..
            })
        ));
    }

    #[test]
    fn test_forwards_require_wan_interface() {
        let mut layout = test_layout();
        layout.wan_interface.clear();

        assert!(compile(&FirewallConfig::default(), &layout).is_ok());

        let mut config = FirewallConfig::default();
        config.upsert_port_forward(forward(ForwardProtocol::Tcp, 22, 22));
        assert_eq!(
            compile(&config, &layout),
            Err(CompileError::MissingWanInterface)
        );
    }

    #[test]
    fn test_descriptions_are_sanitized_in_comments() {
        let mut config = FirewallConfig::default();
        let mut fwd = forward(ForwardProtocol::Tcp, 25565, 25565);
        fwd.description = "Minecraft\"; flush ruleset".into();
        config.upsert_port_forward(fwd);
        let rules = compile(&config, &test_layout()).unwrap();
        assert!(
            rules
                .rules
                .iter()
                .any(|r| r.comment == "forward tcp 25565: Minecraft flush ruleset")
        );
    }
}
