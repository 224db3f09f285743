//! Input validation and sanitization functions for routerfw
//!
//! Every value that arrives over the management API passes through here before
//! it can reach a [`FirewallConfig`](crate::core::firewall::FirewallConfig).
//! The compiler re-checks addresses and ports, so these helpers are the single
//! place that decides what "usable" means.

use std::net::{IpAddr, Ipv4Addr};

use crate::core::error::CompileError;
use crate::core::firewall::ForwardProtocol;

/// Maximum length of descriptions carried into nftables comments
pub const MAX_DESCRIPTION_LEN: usize = 64;

/// Sanitizes a description for safe use in nftables comments.
///
/// Keeps ASCII letters, digits, space and `-_.:`, truncated to
/// [`MAX_DESCRIPTION_LEN`] characters. Anything that could end an nft
/// comment string or a shell word is dropped.
///
/// ```
/// use routerfw::validators::sanitize_label;
///
/// assert_eq!(sanitize_label("Minecraft \"java\"\n"), "Minecraft java");
/// ```
pub fn sanitize_label(input: &str) -> String {
    input
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, ' ' | '-' | '_' | '.' | ':'))
        .take(MAX_DESCRIPTION_LEN)
        .collect()
}

/// Validates and sanitizes an operator-supplied description.
///
/// # Errors
///
/// Returns `Err` if the description exceeds 64 characters or becomes empty
/// after sanitization.
pub fn validate_description(input: &str) -> Result<String, CompileError> {
    if input.len() > MAX_DESCRIPTION_LEN {
        return Err(CompileError::Invalid {
            field: "description",
            message: format!("too long (max {MAX_DESCRIPTION_LEN} characters)"),
        });
    }

    let sanitized = sanitize_label(input);

    if sanitized.is_empty() && !input.is_empty() {
        return Err(CompileError::Invalid {
            field: "description",
            message: "contains only invalid characters".to_string(),
        });
    }

    Ok(sanitized)
}

/// Rejects port 0; every other `u16` is a usable port.
///
/// # Errors
///
/// Returns [`CompileError::InvalidPort`] naming `field`.
pub fn validate_port(field: &'static str, port: u16) -> Result<u16, CompileError> {
    if port == 0 {
        Err(CompileError::InvalidPort { field })
    } else {
        Ok(port)
    }
}

/// Checks an interface name against what the kernel accepts: at most 15
/// characters (`IFNAMSIZ - 1`) of `[A-Za-z0-9._-]`, and not `.` or `..`.
///
/// # Errors
///
/// Returns `Err` describing the first rule the name breaks.
pub fn validate_interface(name: &str) -> Result<String, CompileError> {
    let invalid = |message: &str| CompileError::Invalid {
        field: "interface",
        message: format!("{name:?}: {message}"),
    };

    if name.is_empty() {
        return Err(invalid("name is empty"));
    }

    if name.len() > 15 {
        return Err(invalid("name too long (max 15 characters)"));
    }

    if name == "." || name == ".." {
        return Err(invalid("reserved name"));
    }

    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
    {
        return Err(invalid("name contains invalid characters"));
    }

    Ok(name.to_string())
}

/// Parses a forward protocol: `tcp`, `udp` or `both`, any case.
///
/// # Errors
///
/// Returns `Err` for any other protocol name.
pub fn parse_protocol(input: &str) -> Result<ForwardProtocol, CompileError> {
    input.trim().parse().map_err(|_| CompileError::Invalid {
        field: "protocol",
        message: format!("{input:?} is not one of tcp, udp, both"),
    })
}

/// Parses an IPv4 address (forward and DMZ targets are IPv4 only).
///
/// # Errors
///
/// Returns `Err` if the input isn't a dotted-quad IPv4 address.
pub fn parse_ipv4(field: &'static str, input: &str) -> Result<Ipv4Addr, CompileError> {
    input.trim().parse().map_err(|_| CompileError::Invalid {
        field,
        message: format!("{input:?} is not an IPv4 address"),
    })
}

/// Parses an IPv4 or IPv6 address.
///
/// # Errors
///
/// Returns `Err` if the input isn't an IP address.
pub fn parse_ip(field: &'static str, input: &str) -> Result<IpAddr, CompileError> {
    input.trim().parse().map_err(|_| CompileError::Invalid {
        field,
        message: format!("{input:?} is not an IP address"),
    })
}

/// Checks that an internal host can receive forwarded traffic.
///
/// # Errors
///
/// Returns the reason for unspecified, broadcast, multicast and loopback addresses.
pub fn check_forward_target(addr: Ipv4Addr) -> Result<Ipv4Addr, &'static str> {
    if addr.is_unspecified() {
        Err("unspecified address")
    } else if addr.is_broadcast() {
        Err("broadcast address")
    } else if addr.is_multicast() {
        Err("multicast address")
    } else if addr.is_loopback() {
        Err("loopback address")
    } else {
        Ok(addr)
    }
}

/// Checks that blocking `ip` is meaningful and won't cut the router off from itself.
///
/// # Errors
///
/// Returns the reason for unspecified and loopback addresses.
pub fn check_blockable(ip: IpAddr) -> Result<IpAddr, &'static str> {
    if ip.is_unspecified() {
        Err("unspecified address")
    } else if ip.is_loopback() {
        Err("loopback address")
    } else {
        Ok(ip)
    }
}
