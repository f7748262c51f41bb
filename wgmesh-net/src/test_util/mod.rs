//! Test utilities: an in-process WireGuard fake and record fixtures.
//!
//! Used by unit tests and by the integration tests under `tests/`.

pub mod fake_wg;

pub use fake_wg::{FakeWg, WgCall};

use std::net::Ipv4Addr;

use chrono::Utc;
use ipnet::Ipv4Net;

use crate::model::{Client, Group};

/// An active `10.0.0.0/24` group with server address `10.0.0.1`.
pub fn sample_group(name: &str) -> Group {
    let now = Utc::now();
    Group {
        id: 0,
        name: name.to_string(),
        description: String::new(),
        ipv4_cidr: Ipv4Net::new_assert(Ipv4Addr::new(10, 0, 0, 0), 24),
        ipv4_address: Ipv4Addr::new(10, 0, 0, 1),
        ipv6_cidr: None,
        ipv6_address: None,
        private_key: format!("{}-server-private", name),
        public_key: format!("{}-server-public", name),
        listen_port: 51820,
        dns: vec!["1.1.1.1".to_string(), "8.8.8.8".to_string()],
        endpoint: "vpn.example.com".to_string(),
        persistent_keepalive: 25,
        mtu: 1420,
        allow_client_to_client: false,
        is_active: true,
        is_running: false,
        owner_id: 1,
        created_at: now,
        updated_at: now,
    }
}

/// An active full-tunnel client. Its address is a placeholder until the
/// store allocates one.
pub fn sample_client(group_id: i64, name: &str) -> Client {
    let now = Utc::now();
    Client {
        id: 0,
        group_id,
        name: name.to_string(),
        description: String::new(),
        private_key: format!("{}-private", name),
        public_key: format!("{}-public", name),
        preshared_key: None,
        ipv4_address: Ipv4Addr::UNSPECIFIED,
        ipv6_address: None,
        allowed_ips: "0.0.0.0/0, ::/0".to_string(),
        can_address_peers: true,
        routed_prefixes: Vec::new(),
        dns_override: None,
        expires_at: None,
        is_active: true,
        last_handshake: None,
        total_received: 0,
        total_sent: 0,
        last_rx: 0,
        last_tx: 0,
        created_at: now,
        updated_at: now,
    }
}
