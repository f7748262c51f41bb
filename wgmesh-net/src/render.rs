//! WireGuard configuration rendering.
//!
//! Pure functions: no disk, no network, no clock. Peer blocks are ordered by
//! client id so the same state always renders to the same bytes.

use std::net::Ipv6Addr;

use chrono::{DateTime, Utc};

use crate::config::FULL_TUNNEL;
use crate::model::{Client, Group};
use crate::validation;

/// Forwarding rules added when clients may talk to each other.
const POST_UP: &str = "iptables -A FORWARD -i %i -j ACCEPT; iptables -A FORWARD -o %i -j ACCEPT";
const POST_DOWN: &str = "iptables -D FORWARD -i %i -j ACCEPT; iptables -D FORWARD -o %i -j ACCEPT";

/// Server configuration plus one configuration per enabled client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedConfigs {
    pub server: String,
    /// `(client id, config text)`, ascending by id.
    pub clients: Vec<(i64, String)>,
}

/// Clients that participate in configuration at `now`, ordered by id.
pub fn enabled_clients(clients: &[Client], now: DateTime<Utc>) -> Vec<Client> {
    let mut enabled: Vec<Client> = clients
        .iter()
        .filter(|c| c.is_enabled_at(now))
        .cloned()
        .collect();
    enabled.sort_by_key(|c| c.id);
    enabled
}

/// Render the server file and every enabled client's file.
pub fn render_all(group: &Group, clients: &[Client], now: DateTime<Utc>) -> RenderedConfigs {
    let enabled = enabled_clients(clients, now);
    RenderedConfigs {
        server: render_server(group, &enabled),
        clients: enabled
            .iter()
            .map(|c| (c.id, render_client(group, c)))
            .collect(),
    }
}

/// Render the interface configuration. Inactive clients are skipped.
pub fn render_server(group: &Group, clients: &[Client]) -> String {
    let mut lines = vec![
        "[Interface]".to_string(),
        format!("PrivateKey = {}", group.private_key),
        format!("Address = {}", server_addresses(group)),
        format!("ListenPort = {}", group.listen_port),
    ];

    if group.allow_client_to_client {
        lines.push(format!("PostUp = {}", POST_UP));
        lines.push(format!("PostDown = {}", POST_DOWN));
    }

    let mut peers: Vec<&Client> = clients.iter().filter(|c| c.is_active).collect();
    peers.sort_by_key(|c| c.id);

    for client in peers {
        lines.push(String::new());
        lines.push("[Peer]".to_string());
        lines.push(format!("# {}", comment_safe(&client.name)));
        lines.push(format!("PublicKey = {}", client.public_key));
        if let Some(psk) = &client.preshared_key {
            lines.push(format!("PresharedKey = {}", psk));
        }
        lines.push(format!("AllowedIPs = {}", server_side_allowed_ips(client)));
    }

    finish(lines)
}

/// Render one client's configuration.
pub fn render_client(group: &Group, client: &Client) -> String {
    let prefix_v4 = group.ipv4_cidr.prefix_len();
    let mut addresses = vec![format!("{}/{}", client.ipv4_address, prefix_v4)];
    if let (Some(addr), Some(cidr)) = (client.ipv6_address, group.ipv6_cidr) {
        addresses.push(format!("{}/{}", addr, cidr.prefix_len()));
    }

    let mut lines = vec![
        "[Interface]".to_string(),
        format!("PrivateKey = {}", client.private_key),
        format!("Address = {}", addresses.join(", ")),
    ];

    let dns = client.dns_override.as_ref().unwrap_or(&group.dns);
    if !dns.is_empty() {
        lines.push(format!("DNS = {}", dns.join(", ")));
    }
    if group.mtu > 0 {
        lines.push(format!("MTU = {}", group.mtu));
    }

    lines.push(String::new());
    lines.push("[Peer]".to_string());
    lines.push(format!("PublicKey = {}", group.public_key));
    if let Some(psk) = &client.preshared_key {
        lines.push(format!("PresharedKey = {}", psk));
    }
    lines.push(format!("AllowedIPs = {}", client_side_allowed_ips(group, client)));
    if !group.endpoint.is_empty() {
        lines.push(format!(
            "Endpoint = {}",
            endpoint(&group.endpoint, group.listen_port)
        ));
    }
    if group.persistent_keepalive > 0 {
        lines.push(format!("PersistentKeepalive = {}", group.persistent_keepalive));
    }

    finish(lines)
}

fn server_addresses(group: &Group) -> String {
    let mut addresses = vec![format!(
        "{}/{}",
        group.ipv4_address,
        group.ipv4_cidr.prefix_len()
    )];
    if let (Some(addr), Some(cidr)) = (group.ipv6_address, group.ipv6_cidr) {
        addresses.push(format!("{}/{}", addr, cidr.prefix_len()));
    }
    addresses.join(", ")
}

/// The client's own host routes plus any explicitly granted prefixes.
fn server_side_allowed_ips(client: &Client) -> String {
    let mut allowed = vec![format!("{}/32", client.ipv4_address)];
    if let Some(v6) = client.ipv6_address {
        allowed.push(format!("{}/128", v6));
    }
    allowed.extend(client.routed_prefixes.iter().map(|p| p.to_string()));
    allowed.join(", ")
}

/// What the client routes into the tunnel.
fn client_side_allowed_ips(group: &Group, client: &Client) -> String {
    if client.can_address_peers && group.allow_client_to_client {
        return client.allowed_ips.clone();
    }

    if client.allowed_ips.contains("0.0.0.0/0") {
        return FULL_TUNNEL.to_string();
    }

    let mut allowed = vec![format!("{}/32", group.ipv4_address)];
    if let Some(v6) = group.ipv6_address {
        allowed.push(format!("{}/128", v6));
    }
    allowed.join(", ")
}

/// `host:port`, using the listen port unless the endpoint names its own.
fn endpoint(value: &str, listen_port: u16) -> String {
    let Some((host, port)) = validation::split_endpoint(value) else {
        return value.to_string();
    };
    let port = port.unwrap_or(listen_port);
    if host.parse::<Ipv6Addr>().is_ok() {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// Names land in a comment line; a newline would start a new directive.
fn comment_safe(name: &str) -> String {
    name.chars().filter(|c| !c.is_control()).collect()
}

fn finish(lines: Vec<String>) -> String {
    let mut text = lines.join("\n");
    text.push('\n');
    text
}
