//! Address allocation inside a group's ranges.
//!
//! Allocation walks the host addresses of a range in ascending order and
//! returns the first one not in the reserved set. The reserved set is the
//! server address plus every client address of the group, active or not, so
//! a disabled peer never loses its address to a newcomer.

use std::collections::HashSet;
use std::net::{Ipv4Addr, Ipv6Addr};

use ipnet::{Ipv4Net, Ipv6Net};

use crate::error::{Error, Result};

/// First and last host address of an IPv4 range, as integers.
///
/// /31 and /32 have no network/broadcast addresses to skip.
fn ipv4_host_bounds(cidr: &Ipv4Net) -> (u32, u32) {
    let network = u32::from(cidr.network());
    let broadcast = u32::from(cidr.broadcast());
    if cidr.prefix_len() >= 31 {
        (network, broadcast)
    } else {
        (network + 1, broadcast - 1)
    }
}

/// First and last host address of an IPv6 range. Only the subnet-router
/// anycast (network) address is skipped; IPv6 has no broadcast.
fn ipv6_host_bounds(cidr: &Ipv6Net) -> (u128, u128) {
    let network = u128::from(cidr.network());
    let last = u128::from(cidr.broadcast());
    if cidr.prefix_len() == 128 {
        (network, last)
    } else {
        (network + 1, last)
    }
}

/// Server address for a range: its first usable host.
pub fn first_ipv4_host(cidr: &Ipv4Net) -> Ipv4Addr {
    Ipv4Addr::from(ipv4_host_bounds(&cidr.trunc()).0)
}

/// Server address for an IPv6 range.
pub fn first_ipv6_host(cidr: &Ipv6Net) -> Ipv6Addr {
    Ipv6Addr::from(ipv6_host_bounds(&cidr.trunc()).0)
}

/// Allocate the lowest free IPv4 host address of `cidr`.
pub fn allocate_ipv4(cidr: &Ipv4Net, reserved: &HashSet<Ipv4Addr>) -> Result<Ipv4Addr> {
    let (first, last) = ipv4_host_bounds(&cidr.trunc());
    (first..=last)
        .map(Ipv4Addr::from)
        .find(|addr| !reserved.contains(addr))
        .ok_or_else(|| Error::AllocationExhausted {
            cidr: cidr.trunc().to_string(),
        })
}

/// Allocate the lowest free IPv6 host address of `cidr`.
///
/// The walk visits at most `reserved.len() + 1` addresses before finding a
/// free one, so large prefixes cost nothing extra.
pub fn allocate_ipv6(cidr: &Ipv6Net, reserved: &HashSet<Ipv6Addr>) -> Result<Ipv6Addr> {
    let (first, last) = ipv6_host_bounds(&cidr.trunc());
    let mut candidate = first;
    loop {
        let addr = Ipv6Addr::from(candidate);
        if !reserved.contains(&addr) {
            return Ok(addr);
        }
        if candidate == last {
            return Err(Error::AllocationExhausted {
                cidr: cidr.trunc().to_string(),
            });
        }
        candidate += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v4_set(addrs: &[&str]) -> HashSet<Ipv4Addr> {
        addrs.iter().map(|a| a.parse().unwrap()).collect()
    }

    #[test]
    fn test_allocate_ipv4_skips_server_and_clients() {
        let cidr: Ipv4Net = "10.0.0.0/24".parse().unwrap();
        let reserved = v4_set(&["10.0.0.1", "10.0.0.2", "10.0.0.3"]);

        let addr = allocate_ipv4(&cidr, &reserved).unwrap();
        assert_eq!(addr, Ipv4Addr::new(10, 0, 0, 4));
    }

    #[test]
    fn test_allocate_ipv4_fills_gaps_first() {
        let cidr: Ipv4Net = "10.0.0.0/24".parse().unwrap();
        let reserved = v4_set(&["10.0.0.1", "10.0.0.3"]);

        assert_eq!(
            allocate_ipv4(&cidr, &reserved).unwrap(),
            Ipv4Addr::new(10, 0, 0, 2)
        );
    }

    #[test]
    fn test_allocate_ipv4_is_deterministic() {
        let cidr: Ipv4Net = "192.168.10.0/28".parse().unwrap();
        let reserved = v4_set(&["192.168.10.1", "192.168.10.5"]);

        let first = allocate_ipv4(&cidr, &reserved).unwrap();
        let second = allocate_ipv4(&cidr, &reserved).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_allocate_ipv4_exhausted() {
        // /30 has two hosts: .1 and .2
        let cidr: Ipv4Net = "10.9.0.0/30".parse().unwrap();
        let reserved = v4_set(&["10.9.0.1", "10.9.0.2"]);

        match allocate_ipv4(&cidr, &reserved) {
            Err(Error::AllocationExhausted { cidr }) => assert_eq!(cidr, "10.9.0.0/30"),
            other => panic!("expected exhaustion, got {:?}", other),
        }
    }

    #[test]
    fn test_allocate_ipv4_never_returns_broadcast() {
        let cidr: Ipv4Net = "10.0.0.0/29".parse().unwrap();
        let reserved: HashSet<Ipv4Addr> = (1..=5).map(|i| Ipv4Addr::new(10, 0, 0, i)).collect();

        assert_eq!(
            allocate_ipv4(&cidr, &reserved).unwrap(),
            Ipv4Addr::new(10, 0, 0, 6)
        );

        let mut full = reserved.clone();
        full.insert(Ipv4Addr::new(10, 0, 0, 6));
        assert!(allocate_ipv4(&cidr, &full).is_err());
    }

    #[test]
    fn test_allocate_ipv4_result_within_range_and_unreserved() {
        let cidr: Ipv4Net = "172.16.4.0/26".parse().unwrap();
        let mut reserved = HashSet::new();
        for _ in 0..62 {
            let addr = allocate_ipv4(&cidr, &reserved).unwrap();
            assert!(cidr.contains(&addr));
            assert_ne!(addr, cidr.network());
            assert_ne!(addr, cidr.broadcast());
            assert!(reserved.insert(addr));
        }
        assert!(allocate_ipv4(&cidr, &reserved).is_err());
    }

    #[test]
    fn test_allocate_ipv4_normalizes_host_bits() {
        let cidr: Ipv4Net = "10.0.0.77/24".parse().unwrap();
        let reserved = v4_set(&["10.0.0.1"]);
        assert_eq!(
            allocate_ipv4(&cidr, &reserved).unwrap(),
            Ipv4Addr::new(10, 0, 0, 2)
        );
    }

    #[test]
    fn test_first_host() {
        let v4: Ipv4Net = "10.0.0.0/24".parse().unwrap();
        assert_eq!(first_ipv4_host(&v4), Ipv4Addr::new(10, 0, 0, 1));

        let v6: Ipv6Net = "fd00:1::/64".parse().unwrap();
        assert_eq!(
            first_ipv6_host(&v6),
            "fd00:1::1".parse::<Ipv6Addr>().unwrap()
        );
    }

    #[test]
    fn test_allocate_ipv6() {
        let cidr: Ipv6Net = "fd00::/64".parse().unwrap();
        let reserved: HashSet<Ipv6Addr> = ["fd00::1", "fd00::2"]
            .iter()
            .map(|a| a.parse().unwrap())
            .collect();

        assert_eq!(
            allocate_ipv6(&cidr, &reserved).unwrap(),
            "fd00::3".parse::<Ipv6Addr>().unwrap()
        );
    }

    #[test]
    fn test_allocate_ipv6_exhausted() {
        let cidr: Ipv6Net = "fd00::/127".parse().unwrap();
        let reserved: HashSet<Ipv6Addr> = ["fd00::1"].iter().map(|a| a.parse().unwrap()).collect();

        assert!(matches!(
            allocate_ipv6(&cidr, &reserved),
            Err(Error::AllocationExhausted { .. })
        ));
    }
}
