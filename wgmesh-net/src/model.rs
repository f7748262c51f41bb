//! Group, client and traffic sample records.

use std::net::{Ipv4Addr, Ipv6Addr};

use chrono::{DateTime, Utc};
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use serde::Serialize;

use crate::ifname;

/// A virtual network with its own address range and interface.
#[derive(Debug, Clone, Serialize)]
pub struct Group {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub ipv4_cidr: Ipv4Net,
    /// Server address, always the first usable host of `ipv4_cidr`.
    pub ipv4_address: Ipv4Addr,
    pub ipv6_cidr: Option<Ipv6Net>,
    pub ipv6_address: Option<Ipv6Addr>,
    #[serde(skip_serializing)]
    pub private_key: String,
    pub public_key: String,
    pub listen_port: u16,
    pub dns: Vec<String>,
    pub endpoint: String,
    /// Seconds; 0 disables keepalive.
    pub persistent_keepalive: u16,
    /// 0 leaves the MTU to the driver.
    pub mtu: u16,
    pub allow_client_to_client: bool,
    pub is_active: bool,
    pub is_running: bool,
    pub owner_id: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Group {
    /// Canonical native interface name for this group.
    pub fn interface_name(&self) -> String {
        ifname::derive(self.id, &self.name)
    }

    /// Download file name for the server configuration.
    pub fn config_filename(&self) -> String {
        format!("wg-{}.conf", slug(&self.name))
    }
}

/// A peer authorized to join a group.
#[derive(Debug, Clone, Serialize)]
pub struct Client {
    pub id: i64,
    pub group_id: i64,
    pub name: String,
    pub description: String,
    #[serde(skip_serializing)]
    pub private_key: String,
    pub public_key: String,
    #[serde(skip_serializing)]
    pub preshared_key: Option<String>,
    pub ipv4_address: Ipv4Addr,
    pub ipv6_address: Option<Ipv6Addr>,
    /// What the client routes through the tunnel (client-side AllowedIPs).
    pub allowed_ips: String,
    pub can_address_peers: bool,
    /// Extra prefixes the server routes to this client beyond its own address.
    pub routed_prefixes: Vec<IpNet>,
    pub dns_override: Option<Vec<String>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub last_handshake: Option<DateTime<Utc>>,
    /// Monotonic totals, advanced by reset-safe deltas.
    pub total_received: u64,
    pub total_sent: u64,
    /// Raw interface counters from the last sample.
    #[serde(skip_serializing)]
    pub last_rx: u64,
    #[serde(skip_serializing)]
    pub last_tx: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Client {
    /// Whether the client participates in rendered configuration at `now`.
    pub fn is_enabled_at(&self, now: DateTime<Utc>) -> bool {
        self.is_active && self.expires_at.is_none_or(|expiry| expiry > now)
    }

    pub fn config_filename(&self) -> String {
        format!("{}.conf", slug(&self.name))
    }
}

/// Owner of a traffic sample. A sample belongs to exactly one of the two.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "id", rename_all = "lowercase")]
pub enum SampleOwner {
    Group(i64),
    Client(i64),
}

/// One observation of cumulative byte counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrafficSample {
    pub id: i64,
    pub owner: SampleOwner,
    pub received_bytes: u64,
    pub sent_bytes: u64,
    pub recorded_at: DateTime<Utc>,
}

/// Request to create a group.
#[derive(Debug, Clone, Default)]
pub struct NewGroup {
    pub name: String,
    pub description: String,
    pub ipv4_cidr: String,
    pub ipv6_cidr: Option<String>,
    pub listen_port: Option<u16>,
    pub dns: Option<Vec<String>>,
    pub endpoint: Option<String>,
    pub persistent_keepalive: Option<u16>,
    pub mtu: Option<u16>,
    pub allow_client_to_client: bool,
    pub owner_id: i64,
}

/// Partial update of a group. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default)]
pub struct GroupUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub listen_port: Option<u16>,
    pub dns: Option<Vec<String>>,
    pub endpoint: Option<String>,
    pub persistent_keepalive: Option<u16>,
    pub mtu: Option<u16>,
    pub allow_client_to_client: Option<bool>,
    pub is_active: Option<bool>,
    /// `Some(None)` clears the IPv6 range.
    pub ipv6_cidr: Option<Option<String>>,
}

/// Request to create a client.
#[derive(Debug, Clone)]
pub struct NewClient {
    pub name: String,
    pub description: String,
    pub allowed_ips: Option<String>,
    pub can_address_peers: bool,
    pub routed_prefixes: Vec<String>,
    pub dns_override: Option<Vec<String>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub use_preshared_key: bool,
}

impl NewClient {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            allowed_ips: None,
            can_address_peers: true,
            routed_prefixes: Vec::new(),
            dns_override: None,
            expires_at: None,
            use_preshared_key: false,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn allowed_ips(mut self, allowed_ips: impl Into<String>) -> Self {
        self.allowed_ips = Some(allowed_ips.into());
        self
    }

    pub fn can_address_peers(mut self, allowed: bool) -> Self {
        self.can_address_peers = allowed;
        self
    }

    pub fn routed_prefixes(mut self, prefixes: Vec<String>) -> Self {
        self.routed_prefixes = prefixes;
        self
    }

    pub fn dns_override(mut self, dns: Option<Vec<String>>) -> Self {
        self.dns_override = dns;
        self
    }

    pub fn expires_at(mut self, expires_at: Option<DateTime<Utc>>) -> Self {
        self.expires_at = expires_at;
        self
    }

    pub fn preshared_key(mut self, enabled: bool) -> Self {
        self.use_preshared_key = enabled;
        self
    }
}

/// Partial update of a client.
#[derive(Debug, Clone, Default)]
pub struct ClientUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub allowed_ips: Option<String>,
    pub can_address_peers: Option<bool>,
    pub routed_prefixes: Option<Vec<String>>,
    pub dns_override: Option<Option<Vec<String>>>,
    pub expires_at: Option<Option<DateTime<Utc>>>,
    pub is_active: Option<bool>,
}

/// Split a comma separated list such as `"1.1.1.1, 8.8.8.8"`.
pub fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Lowercase, spaces to dashes. Used for download file names only.
pub fn slug(name: &str) -> String {
    let slug: String = name
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| if c.is_whitespace() { '-' } else { c })
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        .collect();
    if slug.is_empty() { "wg".to_string() } else { slug }
}
