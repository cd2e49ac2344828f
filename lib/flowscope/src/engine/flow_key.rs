// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! The canonical identity of a bidirectional flow.
//!
//! Both directions of a conversation must land on the same key. The
//! two endpoints are ordered by `(addr, port)` and the lower endpoint
//! is always stored as `a`. The direction a given packet travelled is
//! returned alongside the key so that per-direction counters can still
//! be kept.

use core::fmt;
use core::fmt::Display;
use core::hash::Hash;
use crc32fast::Hasher;
use serde::Serialize;
use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::net::Ipv6Addr;

pub const PROTO_ICMP: u8 = 0x1;
pub const PROTO_IGMP: u8 = 0x2;
pub const PROTO_TCP: u8 = 0x6;
pub const PROTO_UDP: u8 = 0x11;
pub const PROTO_ICMPV6: u8 = 0x3A;
pub const PROTO_VRRP: u8 = 0x70;

/// Which way a packet travelled relative to the canonical key.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize)]
pub enum FlowDirection {
    /// From endpoint `a` (the lower) to endpoint `b`.
    AtoB = 0,
    /// From endpoint `b` to endpoint `a`.
    BtoA = 1,
}

impl FlowDirection {
    pub fn index(self) -> usize {
        self as usize
    }
}

/// Tagged union of the two endpoint addresses, avoiding a mixed
/// v4/v6 pair by construction.
#[derive(
    Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
pub enum AddrPair {
    V4 { a: Ipv4Addr, b: Ipv4Addr },
    V6 { a: Ipv6Addr, b: Ipv6Addr },
}

impl AddrPair {
    pub fn mirror(self) -> Self {
        match self {
            Self::V4 { a, b } => Self::V4 { a: b, b: a },
            Self::V6 { a, b } => Self::V6 { a: b, b: a },
        }
    }
}

/// The flow identifier.
///
/// The field order is also the ordering used inside a flow table
/// partition.
#[derive(
    Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
pub struct FlowKey {
    pub proto: u8,
    pub addrs: AddrPair,
    pub port_a: u16,
    pub port_b: u16,
    pub vlan_id: u16,
}

/// The signature-free attributes of a flow, as handed to the guess
/// heuristic.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FiveTuple {
    pub proto: u8,
    pub addr_a: IpAddr,
    pub port_a: u16,
    pub addr_b: IpAddr,
    pub port_b: u16,
}

impl FlowKey {
    /// Derive the canonical key for an IPv4 packet travelling from
    /// `src:sport` to `dst:dport`.
    pub fn new_v4(
        proto: u8,
        src: Ipv4Addr,
        sport: u16,
        dst: Ipv4Addr,
        dport: u16,
        vlan_id: u16,
    ) -> (Self, FlowDirection) {
        if (src, sport) <= (dst, dport) {
            let addrs = AddrPair::V4 { a: src, b: dst };
            let key =
                Self { proto, addrs, port_a: sport, port_b: dport, vlan_id };
            (key, FlowDirection::AtoB)
        } else {
            let addrs = AddrPair::V4 { a: dst, b: src };
            let key =
                Self { proto, addrs, port_a: dport, port_b: sport, vlan_id };
            (key, FlowDirection::BtoA)
        }
    }

    /// Derive the canonical key for an IPv6 packet travelling from
    /// `src:sport` to `dst:dport`.
    pub fn new_v6(
        proto: u8,
        src: Ipv6Addr,
        sport: u16,
        dst: Ipv6Addr,
        dport: u16,
        vlan_id: u16,
    ) -> (Self, FlowDirection) {
        if (src, sport) <= (dst, dport) {
            let addrs = AddrPair::V6 { a: src, b: dst };
            let key =
                Self { proto, addrs, port_a: sport, port_b: dport, vlan_id };
            (key, FlowDirection::AtoB)
        } else {
            let addrs = AddrPair::V6 { a: dst, b: src };
            let key =
                Self { proto, addrs, port_a: dport, port_b: sport, vlan_id };
            (key, FlowDirection::BtoA)
        }
    }

    pub fn ip_version(&self) -> u8 {
        match self.addrs {
            AddrPair::V4 { .. } => 4,
            AddrPair::V6 { .. } => 6,
        }
    }

    pub fn addr_a(&self) -> IpAddr {
        match self.addrs {
            AddrPair::V4 { a, .. } => a.into(),
            AddrPair::V6 { a, .. } => a.into(),
        }
    }

    pub fn addr_b(&self) -> IpAddr {
        match self.addrs {
            AddrPair::V4 { b, .. } => b.into(),
            AddrPair::V6 { b, .. } => b.into(),
        }
    }

    /// Swap the endpoints. The result is no longer canonical; this
    /// exists to check canonicalization.
    pub fn mirror(self) -> Self {
        Self {
            proto: self.proto,
            addrs: self.addrs.mirror(),
            port_a: self.port_b,
            port_b: self.port_a,
            vlan_id: self.vlan_id,
        }
    }

    pub fn tuple(&self) -> FiveTuple {
        FiveTuple {
            proto: self.proto,
            addr_a: self.addr_a(),
            port_a: self.port_a,
            addr_b: self.addr_b(),
            port_b: self.port_b,
        }
    }

    pub fn crc32(&self) -> u32 {
        let mut hasher = Hasher::new();
        self.hash(&mut hasher);
        hasher.finalize()
    }

    /// The flow table partition this key belongs to.
    pub fn root_index(&self, num_roots: usize) -> usize {
        self.crc32() as usize % num_roots
    }
}

/// Human-readable IP protocol name, falling back to the number.
pub fn ip_proto_name(proto: u8) -> String {
    match proto {
        PROTO_TCP => "TCP".to_string(),
        PROTO_UDP => "UDP".to_string(),
        PROTO_ICMP => "ICMP".to_string(),
        PROTO_ICMPV6 => "ICMPV6".to_string(),
        PROTO_VRRP => "VRRP".to_string(),
        PROTO_IGMP => "IGMP".to_string(),
        other => other.to_string(),
    }
}

impl Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.addrs {
            AddrPair::V4 { a, b } => write!(
                f,
                "{} {}:{} <-> {}:{}",
                ip_proto_name(self.proto),
                a,
                self.port_a,
                b,
                self.port_b,
            ),
            AddrPair::V6 { a, b } => write!(
                f,
                "{} [{}]:{} <-> [{}]:{}",
                ip_proto_name(self.proto),
                a,
                self.port_a,
                b,
                self.port_b,
            ),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn v4(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    #[test]
    fn reverse_direction_same_key() {
        let (k1, d1) = FlowKey::new_v4(
            PROTO_TCP,
            v4("192.168.2.10"),
            54321,
            v4("76.76.21.21"),
            80,
            0,
        );
        let (k2, d2) = FlowKey::new_v4(
            PROTO_TCP,
            v4("76.76.21.21"),
            80,
            v4("192.168.2.10"),
            54321,
            0,
        );
        assert_eq!(k1, k2);
        assert_ne!(d1, d2);
        assert_eq!(k1.addr_a(), IpAddr::V4(v4("76.76.21.21")));
        assert_eq!(k1.port_a, 80);
        assert_eq!(d1, FlowDirection::BtoA);
    }

    #[test]
    fn same_addr_orders_by_port() {
        let ip = v4("10.0.0.1");
        let (k1, d1) = FlowKey::new_v4(PROTO_UDP, ip, 5000, ip, 53, 0);
        let (k2, d2) = FlowKey::new_v4(PROTO_UDP, ip, 53, ip, 5000, 0);
        assert_eq!(k1, k2);
        assert_eq!(k1.port_a, 53);
        assert_eq!(d1, FlowDirection::BtoA);
        assert_eq!(d2, FlowDirection::AtoB);
    }

    #[test]
    fn identical_endpoints_are_a_to_b() {
        let ip = v4("10.0.0.1");
        let (_, dir) = FlowKey::new_v4(PROTO_UDP, ip, 9, ip, 9, 0);
        assert_eq!(dir, FlowDirection::AtoB);
    }

    #[test]
    fn v6_canonical() {
        let lo: Ipv6Addr = "fd00::1".parse().unwrap();
        let hi: Ipv6Addr = "fd00::2".parse().unwrap();
        let (k1, _) = FlowKey::new_v6(PROTO_TCP, hi, 443, lo, 40000, 0);
        let (k2, _) = FlowKey::new_v6(PROTO_TCP, lo, 40000, hi, 443, 0);
        assert_eq!(k1, k2);
        assert_eq!(k1.ip_version(), 6);
        assert_eq!(k1.to_string(), "TCP [fd00::1]:40000 <-> [fd00::2]:443");
    }

    #[test]
    fn vlan_separates_flows() {
        let (k1, _) =
            FlowKey::new_v4(PROTO_UDP, v4("1.1.1.1"), 1, v4("2.2.2.2"), 2, 10);
        let (k2, _) =
            FlowKey::new_v4(PROTO_UDP, v4("1.1.1.1"), 1, v4("2.2.2.2"), 2, 20);
        assert_ne!(k1, k2);
    }

    #[test]
    fn mirror_then_canonicalize() {
        let (k, _) = FlowKey::new_v4(
            PROTO_TCP,
            v4("172.20.14.2"),
            1111,
            v4("172.20.14.1"),
            2222,
            0,
        );
        let m = k.mirror();
        let (again, _) = match m.addrs {
            AddrPair::V4 { a, b } => {
                FlowKey::new_v4(m.proto, a, m.port_a, b, m.port_b, m.vlan_id)
            }
            AddrPair::V6 { .. } => unreachable!(),
        };
        assert_eq!(k, again);
        assert_eq!(k.root_index(512), again.root_index(512));
    }
}
