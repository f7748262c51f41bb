//! Input validation for group and client requests.
//!
//! Everything a request carries ends up in a rendered configuration file, so
//! values are parsed into typed addresses where possible and free text is
//! kept to a single line.

use std::net::{IpAddr, Ipv6Addr};

use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use thiserror::Error;

/// Longest accepted group or client name.
pub const MAX_NAME_LEN: usize = 64;

/// Smallest IPv4 range: a /30 still leaves one client next to the server.
pub const MAX_IPV4_PREFIX: u8 = 30;
pub const MAX_IPV6_PREFIX: u8 = 127;

/// Validation errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{0} is required")]
    Required(&'static str),

    #[error("{0} must be at most {1} characters")]
    TooLong(&'static str, usize),

    #[error("{0} must not contain control characters")]
    ControlCharacters(&'static str),

    #[error("Invalid IPv4 range: {0}")]
    InvalidIpv4Range(String),

    #[error("Invalid IPv6 range: {0}")]
    InvalidIpv6Range(String),

    #[error("Range {0} is too small to hold a server and a client")]
    RangeTooSmall(String),

    #[error("Invalid DNS server address: {0}")]
    InvalidDnsServer(String),

    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Invalid allowed IPs entry: {0}")]
    InvalidAllowedIps(String),

    #[error("Invalid routed prefix: {0}")]
    InvalidRoutedPrefix(String),

    #[error("Listen port must not be 0")]
    InvalidListenPort,

    #[error("Listen port {0} is already used by group '{1}'")]
    ListenPortInUse(u16, String),

    #[error("Group name already exists: {0}")]
    GroupNameExists(String),

    #[error("Group '{0}' is inactive and cannot be started")]
    GroupInactive(String),
}

pub type Result<T> = std::result::Result<T, ValidationError>;

/// Trimmed, non-empty, single-line name.
pub fn name(field: &'static str, value: &str) -> Result<String> {
    let value = value.trim();
    if value.is_empty() {
        return Err(ValidationError::Required(field));
    }
    if value.chars().count() > MAX_NAME_LEN {
        return Err(ValidationError::TooLong(field, MAX_NAME_LEN));
    }
    single_line(field, value)?;
    Ok(value.to_string())
}

pub fn single_line(field: &'static str, value: &str) -> Result<()> {
    if value.chars().any(char::is_control) {
        return Err(ValidationError::ControlCharacters(field));
    }
    Ok(())
}

/// Parse an IPv4 range, normalized to its network address.
pub fn ipv4_range(value: &str) -> Result<Ipv4Net> {
    let value = value.trim();
    if value.is_empty() {
        return Err(ValidationError::Required("IPv4 range"));
    }
    let net: Ipv4Net = value
        .parse()
        .map_err(|_| ValidationError::InvalidIpv4Range(value.to_string()))?;
    if net.prefix_len() > MAX_IPV4_PREFIX {
        return Err(ValidationError::RangeTooSmall(value.to_string()));
    }
    Ok(net.trunc())
}

/// Parse an IPv6 range, normalized to its network address. An IPv4 range in
/// this position is rejected.
pub fn ipv6_range(value: &str) -> Result<Ipv6Net> {
    let value = value.trim();
    let net: Ipv6Net = match value.parse::<IpNet>() {
        Ok(IpNet::V6(net)) => net,
        Ok(IpNet::V4(_)) => {
            return Err(ValidationError::InvalidIpv6Range(format!(
                "{} is not an IPv6 range",
                value
            )));
        }
        Err(_) => return Err(ValidationError::InvalidIpv6Range(value.to_string())),
    };
    if net.prefix_len() > MAX_IPV6_PREFIX {
        return Err(ValidationError::RangeTooSmall(value.to_string()));
    }
    Ok(net.trunc())
}

/// DNS servers must be plain IP addresses.
pub fn dns_servers(servers: &[String]) -> Result<Vec<String>> {
    servers
        .iter()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<IpAddr>()
                .map(|ip| ip.to_string())
                .map_err(|_| ValidationError::InvalidDnsServer(s.to_string()))
        })
        .collect()
}

/// Host name, IPv4 or IPv6 address, optionally with `:port`. IPv6 with a
/// port needs brackets. Empty means "not configured".
pub fn endpoint(value: &str) -> Result<String> {
    let value = value.trim();
    if value.is_empty() {
        return Ok(String::new());
    }
    let allowed = |c: char| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | ':' | '[' | ']');
    if !value.chars().all(allowed) || split_endpoint(value).is_none() {
        return Err(ValidationError::InvalidEndpoint(value.to_string()));
    }
    Ok(value.to_string())
}

/// Split an endpoint into its host and explicit port, if any. Brackets
/// around an IPv6 host are stripped. `None` when the value is malformed.
pub fn split_endpoint(value: &str) -> Option<(&str, Option<u16>)> {
    if let Some(rest) = value.strip_prefix('[') {
        let (host, tail) = rest.split_once(']')?;
        host.parse::<Ipv6Addr>().ok()?;
        if tail.is_empty() {
            return Some((host, None));
        }
        return Some((host, Some(endpoint_port(tail.strip_prefix(':')?)?)));
    }
    if value.parse::<Ipv6Addr>().is_ok() {
        return Some((value, None));
    }

    let (host, port) = match value.split_once(':') {
        Some((host, port)) => (host, Some(endpoint_port(port)?)),
        None => (value, None),
    };
    if host.is_empty() || host.contains(['[', ']']) {
        return None;
    }
    Some((host, port))
}

fn endpoint_port(value: &str) -> Option<u16> {
    if !value.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    value.parse::<u16>().ok().filter(|port| *port != 0)
}

/// Comma separated CIDRs or addresses, re-joined in canonical form.
pub fn allowed_ips(value: &str) -> Result<String> {
    let entries = crate::model::split_list(value);
    if entries.is_empty() {
        return Err(ValidationError::Required("allowed IPs"));
    }
    let parsed = entries
        .iter()
        .map(|entry| {
            parse_net(entry).ok_or_else(|| ValidationError::InvalidAllowedIps(entry.clone()))
        })
        .collect::<Result<Vec<IpNet>>>()?;
    Ok(parsed
        .iter()
        .map(IpNet::to_string)
        .collect::<Vec<_>>()
        .join(", "))
}

pub fn routed_prefixes(prefixes: &[String]) -> Result<Vec<IpNet>> {
    prefixes
        .iter()
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .map(|p| {
            p.parse::<IpNet>()
                .map(|net| net.trunc())
                .map_err(|_| ValidationError::InvalidRoutedPrefix(p.to_string()))
        })
        .collect()
}

pub fn listen_port(port: u16) -> Result<u16> {
    if port == 0 {
        return Err(ValidationError::InvalidListenPort);
    }
    Ok(port)
}

/// A bare address counts as a host route.
fn parse_net(value: &str) -> Option<IpNet> {
    value
        .parse::<IpNet>()
        .ok()
        .or_else(|| value.parse::<IpAddr>().ok().map(IpNet::from))
}
