// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Frame decoding.
//!
//! Turns a captured frame into the handful of facts the flow engine
//! needs: the canonical [`FlowKey`], the direction of travel, the IP
//! datagram length, where the transport payload sits in the frame, and
//! which encapsulations were walked to get there.

use super::flow_key::FlowDirection;
use super::flow_key::FlowKey;
use super::flow_key::PROTO_TCP;
use super::flow_key::PROTO_UDP;
use core::fmt;
use core::ops::Range;
use pcap_parser::Linktype;
use smoltcp::wire::EthernetFrame;
use smoltcp::wire::Ipv4Packet;
use smoltcp::wire::Ipv6Packet;
use smoltcp::wire::TcpPacket;
use smoltcp::wire::UdpPacket;
use std::net::Ipv4Addr;
use std::net::Ipv6Addr;

pub const ETHER_TYPE_IPV4: u16 = 0x0800;
pub const ETHER_TYPE_IPV6: u16 = 0x86DD;
pub const ETHER_TYPE_VLAN: u16 = 0x8100;
pub const ETHER_TYPE_QINQ: u16 = 0x88A8;
pub const ETHER_TYPE_QINQ_OLD: u16 = 0x9100;
pub const ETHER_TYPE_MPLS_UC: u16 = 0x8847;
pub const ETHER_TYPE_MPLS_MC: u16 = 0x8848;
pub const ETHER_TYPE_PPPOE_SESS: u16 = 0x8864;

const PPP_IPV4: u16 = 0x0021;
const PPP_IPV6: u16 = 0x0057;

const ETHER_HDR_LEN: usize = 14;
const VLAN_TAG_LEN: usize = 4;
const MPLS_LABEL_LEN: usize = 4;
const PPPOE_HDR_LEN: usize = 8;
const SLL_HDR_LEN: usize = 16;
const NULL_HDR_LEN: usize = 4;
const IPV4_HDR_LEN: usize = 20;
const IPV6_HDR_LEN: usize = 40;
const UDP_HDR_LEN: usize = 8;
const TCP_HDR_LEN: usize = 20;
const TCP_DATA_OFF: usize = 12;
const L4_PORTS_LEN: usize = 4;

const IPV6_HOP_BY_HOP: u8 = 0;
const IPV6_ROUTING: u8 = 43;
const IPV6_FRAGMENT: u8 = 44;
const IPV6_DEST_OPTS: u8 = 60;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DecodeError {
    /// The frame ended before the named header was complete.
    Truncated(&'static str),
    /// The frame carries something other than IPv4/IPv6.
    NotIp(u16),
    /// The capture's link type is not one we decode.
    UnsupportedLinktype(i32),
    Malformed(&'static str),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Truncated(hdr) => write!(f, "truncated {hdr} header"),
            Self::NotIp(et) => write!(f, "non-IP ethertype 0x{et:04x}"),
            Self::UnsupportedLinktype(lt) => {
                write!(f, "unsupported link type {lt}")
            }
            Self::Malformed(what) => write!(f, "malformed {what}"),
        }
    }
}

/// Everything learned about one frame.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PacketMeta {
    pub key: FlowKey,
    pub dir: FlowDirection,
    /// Length of the IP datagram according to its own header.
    pub ip_len: u32,
    /// Byte range of the transport payload within the frame.
    pub payload: Range<usize>,
    pub vlan: bool,
    pub mpls: bool,
    pub pppoe: bool,
    pub fragmented: bool,
}

impl PacketMeta {
    pub fn is_tcp(&self) -> bool {
        self.key.proto == PROTO_TCP
    }

    pub fn is_udp(&self) -> bool {
        self.key.proto == PROTO_UDP
    }
}

#[derive(Default)]
struct Shims {
    vlan_id: Option<u16>,
    mpls: bool,
    pppoe: bool,
}

fn offset_in(frame: &[u8], sub: &[u8]) -> usize {
    sub.as_ptr() as usize - frame.as_ptr() as usize
}

fn be16(buf: &[u8], at: usize, hdr: &'static str) -> Result<u16, DecodeError> {
    match buf.get(at..at + 2) {
        Some(b) => Ok(u16::from_be_bytes([b[0], b[1]])),
        None => Err(DecodeError::Truncated(hdr)),
    }
}

/// Decode a frame captured on a link of type `linktype`.
pub fn decode(
    linktype: Linktype,
    frame: &[u8],
) -> Result<PacketMeta, DecodeError> {
    let mut shims = Shims::default();

    let l3 = match linktype {
        Linktype::ETHERNET => {
            let eth = EthernetFrame::new_checked(frame)
                .map_err(|_| DecodeError::Truncated("ethernet"))?;
            let ethertype = u16::from(eth.ethertype());
            walk_ether(ethertype, eth.payload(), &mut shims)?
        }

        Linktype::LINUX_SLL => {
            let ethertype = be16(frame, 14, "linux cooked")?;
            let rest = frame
                .get(SLL_HDR_LEN..)
                .ok_or(DecodeError::Truncated("linux cooked"))?;
            walk_ether(ethertype, rest, &mut shims)?
        }

        Linktype::NULL | Linktype::LOOP => {
            let rest = frame
                .get(NULL_HDR_LEN..)
                .ok_or(DecodeError::Truncated("loopback"))?;
            by_version(rest)?
        }

        Linktype::RAW | Linktype::IPV4 | Linktype::IPV6 => by_version(frame)?,

        Linktype(other) => return Err(DecodeError::UnsupportedLinktype(other)),
    };

    decode_ip(frame, l3, shims)
}

enum L3<'a> {
    V4(&'a [u8]),
    V6(&'a [u8]),
}

fn by_version(buf: &[u8]) -> Result<L3<'_>, DecodeError> {
    match buf.first().map(|b| b >> 4) {
        Some(4) => Ok(L3::V4(buf)),
        Some(6) => Ok(L3::V6(buf)),
        Some(_) => Err(DecodeError::Malformed("IP version")),
        None => Err(DecodeError::Truncated("IP")),
    }
}

fn walk_ether<'a>(
    mut ethertype: u16,
    mut rest: &'a [u8],
    shims: &mut Shims,
) -> Result<L3<'a>, DecodeError> {
    loop {
        match ethertype {
            ETHER_TYPE_IPV4 => return Ok(L3::V4(rest)),
            ETHER_TYPE_IPV6 => return Ok(L3::V6(rest)),

            ETHER_TYPE_VLAN | ETHER_TYPE_QINQ | ETHER_TYPE_QINQ_OLD => {
                let tci = be16(rest, 0, "VLAN")?;
                ethertype = be16(rest, 2, "VLAN")?;
                // The outermost tag identifies the flow.
                shims.vlan_id.get_or_insert(tci & 0x0FFF);
                rest = &rest[VLAN_TAG_LEN..];
            }

            ETHER_TYPE_MPLS_UC | ETHER_TYPE_MPLS_MC => {
                shims.mpls = true;
                loop {
                    let label = rest
                        .get(..MPLS_LABEL_LEN)
                        .ok_or(DecodeError::Truncated("MPLS"))?;
                    let bottom = label[2] & 0x01 != 0;
                    rest = &rest[MPLS_LABEL_LEN..];
                    if bottom {
                        break;
                    }
                }
                return by_version(rest);
            }

            ETHER_TYPE_PPPOE_SESS => {
                shims.pppoe = true;
                let ppp_proto = be16(rest, 6, "PPPoE")?;
                rest = &rest[PPPOE_HDR_LEN..];
                return match ppp_proto {
                    PPP_IPV4 => Ok(L3::V4(rest)),
                    PPP_IPV6 => Ok(L3::V6(rest)),
                    _ => Err(DecodeError::NotIp(ethertype)),
                };
            }

            other => return Err(DecodeError::NotIp(other)),
        }
    }
}

fn decode_ip(
    frame: &[u8],
    l3: L3<'_>,
    shims: Shims,
) -> Result<PacketMeta, DecodeError> {
    let vlan_id = shims.vlan_id.unwrap_or(0);

    let (proto, ip_len, fragmented, l4, src, dst) = match l3 {
        L3::V4(buf) => {
            let hdr_len = v4_header_len(buf)?;
            let ip = Ipv4Packet::new_unchecked(buf);
            let fragmented = ip.more_frags() || ip.frag_offset() != 0;
            // Only the first fragment carries the transport header.
            let l4 = if ip.frag_offset() == 0 {
                // A zero or short total length (segmentation offload)
                // means the captured bytes are all there is.
                let total = usize::from(ip.total_len());
                let end = if total < hdr_len {
                    buf.len()
                } else {
                    total.min(buf.len())
                };
                Some(&buf[hdr_len..end])
            } else {
                None
            };
            let src = IpPair::V4(Ipv4Addr::from(ip.src_addr().0));
            let dst = IpPair::V4(Ipv4Addr::from(ip.dst_addr().0));
            (
                u8::from(ip.next_header()),
                u32::from(ip.total_len()),
                fragmented,
                l4,
                src,
                dst,
            )
        }

        L3::V6(buf) => {
            if buf.len() < IPV6_HDR_LEN {
                return Err(DecodeError::Truncated("IPv6"));
            }
            let ip = Ipv6Packet::new_unchecked(buf);
            let src = IpPair::V6(Ipv6Addr::from(ip.src_addr().0));
            let dst = IpPair::V6(Ipv6Addr::from(ip.dst_addr().0));
            let payload_len = usize::from(ip.payload_len());
            let end = (IPV6_HDR_LEN + payload_len).min(buf.len());
            let ip_len = (IPV6_HDR_LEN + payload_len) as u32;
            let next = u8::from(ip.next_header());
            let (proto, l4, fragmented) =
                skip_v6_ext(next, &buf[IPV6_HDR_LEN..end])?;
            (proto, ip_len, fragmented, l4, src, dst)
        }
    };

    // The capture may stop anywhere past the ports, so the payload is
    // whatever of it was captured.
    let (sport, dport, payload) = match (proto, l4) {
        (PROTO_TCP, Some(seg)) => {
            if seg.len() < L4_PORTS_LEN {
                return Err(DecodeError::Truncated("TCP"));
            }
            let tcp = TcpPacket::new_unchecked(seg);
            let data_off = seg.get(TCP_DATA_OFF).map_or(seg.len(), |b| {
                (usize::from(b >> 4) * 4).max(TCP_HDR_LEN)
            });
            (tcp.src_port(), tcp.dst_port(), tail(seg, data_off))
        }

        (PROTO_UDP, Some(seg)) => {
            if seg.len() < L4_PORTS_LEN {
                return Err(DecodeError::Truncated("UDP"));
            }
            let udp = UdpPacket::new_unchecked(seg);
            (udp.src_port(), udp.dst_port(), tail(seg, UDP_HDR_LEN))
        }

        (_, Some(seg)) => (0, 0, seg),
        (_, None) => (0, 0, &frame[frame.len()..]),
    };

    let start = offset_in(frame, payload);
    let (key, dir) = match (src, dst) {
        (IpPair::V4(s), IpPair::V4(d)) => {
            FlowKey::new_v4(proto, s, sport, d, dport, vlan_id)
        }
        (IpPair::V6(s), IpPair::V6(d)) => {
            FlowKey::new_v6(proto, s, sport, d, dport, vlan_id)
        }
        _ => return Err(DecodeError::Malformed("address family")),
    };

    Ok(PacketMeta {
        key,
        dir,
        ip_len,
        payload: start..start + payload.len(),
        vlan: shims.vlan_id.is_some(),
        mpls: shims.mpls,
        pppoe: shims.pppoe,
        fragmented,
    })
}

/// The bytes of `seg` past `at`, or an empty slice at its end when
/// fewer were captured.
fn tail(seg: &[u8], at: usize) -> &[u8] {
    &seg[at.min(seg.len())..]
}

/// The IPv4 header length, once the captured bytes are known to hold
/// the whole header including options.
fn v4_header_len(buf: &[u8]) -> Result<usize, DecodeError> {
    let first = buf.first().ok_or(DecodeError::Truncated("IPv4"))?;
    let hdr_len = usize::from(first & 0x0F) * 4;
    if hdr_len < IPV4_HDR_LEN {
        return Err(DecodeError::Malformed("IPv4 header length"));
    }
    if buf.len() < hdr_len {
        return Err(DecodeError::Truncated("IPv4"));
    }
    Ok(hdr_len)
}

enum IpPair {
    V4(Ipv4Addr),
    V6(Ipv6Addr),
}

/// Walk IPv6 extension headers to the upper-layer protocol.
fn skip_v6_ext(
    mut next: u8,
    mut rest: &[u8],
) -> Result<(u8, Option<&[u8]>, bool), DecodeError> {
    let mut fragmented = false;

    loop {
        match next {
            IPV6_HOP_BY_HOP | IPV6_ROUTING | IPV6_DEST_OPTS => {
                let hdr =
                    rest.get(..2).ok_or(DecodeError::Truncated("IPv6 ext"))?;
                let len = (usize::from(hdr[1]) + 1) * 8;
                if rest.len() < len {
                    return Err(DecodeError::Truncated("IPv6 ext"));
                }
                next = hdr[0];
                rest = &rest[len..];
            }

            IPV6_FRAGMENT => {
                let hdr =
                    rest.get(..8).ok_or(DecodeError::Truncated("IPv6 frag"))?;
                fragmented = true;
                let offset = u16::from_be_bytes([hdr[2], hdr[3]]) >> 3;
                next = hdr[0];
                rest = &rest[8..];
                if offset != 0 {
                    return Ok((next, None, fragmented));
                }
            }

            proto => return Ok((proto, Some(rest), fragmented)),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::engine::flow_key::AddrPair;
    use crate::engine::flow_key::PROTO_ICMP;

    // Ethernet + IPv4 + UDP 10.0.0.1:5353 -> 10.0.0.2:53, payload "abcd".
    fn udp_frame() -> Vec<u8> {
        let mut f = vec![];
        f.extend_from_slice(&[0xA8, 0x40, 0x25, 0, 0, 2]);
        f.extend_from_slice(&[0xA8, 0x40, 0x25, 0, 0, 1]);
        f.extend_from_slice(&ETHER_TYPE_IPV4.to_be_bytes());
        f.extend_from_slice(&ipv4_hdr(PROTO_UDP, 8 + 4, 0));
        f.extend_from_slice(&5353u16.to_be_bytes());
        f.extend_from_slice(&53u16.to_be_bytes());
        f.extend_from_slice(&12u16.to_be_bytes());
        f.extend_from_slice(&[0, 0]);
        f.extend_from_slice(b"abcd");
        f
    }

    fn ipv4_hdr(proto: u8, l4_len: u16, frag_word: u16) -> [u8; 20] {
        let total = 20 + l4_len;
        let mut h = [0u8; 20];
        h[0] = 0x45;
        h[2..4].copy_from_slice(&total.to_be_bytes());
        h[6..8].copy_from_slice(&frag_word.to_be_bytes());
        h[8] = 64;
        h[9] = proto;
        h[12..16].copy_from_slice(&[10, 0, 0, 1]);
        h[16..20].copy_from_slice(&[10, 0, 0, 2]);
        h
    }

    #[test]
    fn ethernet_ipv4_udp() {
        let frame = udp_frame();
        let meta = decode(Linktype::ETHERNET, &frame).unwrap();
        assert!(meta.is_udp());
        assert_eq!(meta.ip_len, 32);
        assert_eq!(&frame[meta.payload.clone()], b"abcd");
        assert_eq!(meta.key.port_a, 5353);
        assert_eq!(meta.key.port_b, 53);
        assert_eq!(meta.dir, FlowDirection::AtoB);
        assert!(!meta.vlan && !meta.mpls && !meta.pppoe && !meta.fragmented);
    }

    #[test]
    fn vlan_tag_sets_key() {
        let plain = udp_frame();
        let mut tagged = plain[..12].to_vec();
        tagged.extend_from_slice(&ETHER_TYPE_VLAN.to_be_bytes());
        tagged.extend_from_slice(&0x2064u16.to_be_bytes());
        tagged.extend_from_slice(&plain[12..]);

        let meta = decode(Linktype::ETHERNET, &tagged).unwrap();
        assert!(meta.vlan);
        assert_eq!(meta.key.vlan_id, 0x064);
        assert_eq!(&tagged[meta.payload.clone()], b"abcd");
    }

    #[test]
    fn mpls_stack() {
        let plain = udp_frame();
        let mut f = plain[..12].to_vec();
        f.extend_from_slice(&ETHER_TYPE_MPLS_UC.to_be_bytes());
        f.extend_from_slice(&[0x00, 0x01, 0x00, 0x40]);
        f.extend_from_slice(&[0x00, 0x02, 0x01, 0x40]);
        f.extend_from_slice(&plain[14..]);

        let meta = decode(Linktype::ETHERNET, &f).unwrap();
        assert!(meta.mpls);
        assert_eq!(meta.key.port_b, 53);
    }

    #[test]
    fn pppoe_session() {
        let plain = udp_frame();
        let mut f = plain[..12].to_vec();
        f.extend_from_slice(&ETHER_TYPE_PPPOE_SESS.to_be_bytes());
        f.extend_from_slice(&[0x11, 0x00, 0x00, 0x01, 0x00, 0x22]);
        f.extend_from_slice(&PPP_IPV4.to_be_bytes());
        f.extend_from_slice(&plain[14..]);

        let meta = decode(Linktype::ETHERNET, &f).unwrap();
        assert!(meta.pppoe);
        assert!(meta.is_udp());
    }

    #[test]
    fn arp_is_not_ip() {
        let mut f = udp_frame();
        f[12..14].copy_from_slice(&0x0806u16.to_be_bytes());
        assert_eq!(
            decode(Linktype::ETHERNET, &f),
            Err(DecodeError::NotIp(0x0806))
        );
    }

    #[test]
    fn non_first_fragment_has_no_ports() {
        let mut f = vec![];
        // 185 * 8 = 1480 bytes offset.
        f.extend_from_slice(&ipv4_hdr(PROTO_UDP, 8, 185));
        f.extend_from_slice(&[0u8; 8]);
        let meta = decode(Linktype::RAW, &f).unwrap();
        assert!(meta.fragmented);
        assert_eq!((meta.key.port_a, meta.key.port_b), (0, 0));
        assert!(meta.payload.is_empty());
    }

    #[test]
    fn icmp_over_raw_ip() {
        let mut f = vec![];
        f.extend_from_slice(&ipv4_hdr(PROTO_ICMP, 8, 0));
        f.extend_from_slice(&[8, 0, 0, 0, 0, 1, 0, 1]);
        let meta = decode(Linktype::RAW, &f).unwrap();
        assert_eq!(meta.key.proto, PROTO_ICMP);
        assert!(matches!(meta.key.addrs, AddrPair::V4 { .. }));
        assert_eq!(meta.payload.len(), 8);
    }

    #[test]
    fn ipv6_with_hop_by_hop() {
        let mut f = vec![0x60, 0, 0, 0];
        // Payload: 8 bytes hop-by-hop + 8 bytes UDP.
        f.extend_from_slice(&16u16.to_be_bytes());
        f.push(IPV6_HOP_BY_HOP);
        f.push(64);
        f.extend_from_slice(&"fd00::1".parse::<Ipv6Addr>().unwrap().octets());
        f.extend_from_slice(&"fd00::2".parse::<Ipv6Addr>().unwrap().octets());
        f.extend_from_slice(&[PROTO_UDP, 0, 0, 0, 0, 0, 0, 0]);
        f.extend_from_slice(&546u16.to_be_bytes());
        f.extend_from_slice(&547u16.to_be_bytes());
        f.extend_from_slice(&8u16.to_be_bytes());
        f.extend_from_slice(&[0, 0]);

        let meta = decode(Linktype::RAW, &f).unwrap();
        assert_eq!(meta.key.ip_version(), 6);
        assert_eq!(meta.key.proto, PROTO_UDP);
        assert_eq!((meta.key.port_a, meta.key.port_b), (546, 547));
        assert_eq!(meta.ip_len, 56);
    }

    #[test]
    fn truncated_tcp() {
        let mut f = vec![];
        f.extend_from_slice(&ipv4_hdr(PROTO_TCP, 2, 0));
        f.extend_from_slice(&[0, 80]);
        assert_eq!(
            decode(Linktype::RAW, &f),
            Err(DecodeError::Truncated("TCP"))
        );
    }

    #[test]
    fn ports_alone_are_enough() {
        let mut f = vec![];
        f.extend_from_slice(&ipv4_hdr(PROTO_TCP, 20, 0));
        f.extend_from_slice(&[0, 80, 0, 81]);
        let meta = decode(Linktype::RAW, &f).unwrap();
        assert_eq!((meta.key.port_a, meta.key.port_b), (80, 81));
        assert_eq!(meta.ip_len, 40);
        assert!(meta.payload.is_empty());
    }

    #[test]
    fn snapped_tcp_frame() {
        let mut f = vec![];
        f.extend_from_slice(&[0xA8, 0x40, 0x25, 0, 0, 2]);
        f.extend_from_slice(&[0xA8, 0x40, 0x25, 0, 0, 1]);
        f.extend_from_slice(&ETHER_TYPE_IPV4.to_be_bytes());
        f.extend_from_slice(&ipv4_hdr(PROTO_TCP, 1000, 0));
        let mut tcp = [0u8; 20];
        tcp[0..2].copy_from_slice(&443u16.to_be_bytes());
        tcp[2..4].copy_from_slice(&50000u16.to_be_bytes());
        tcp[12] = 0x50;
        f.extend_from_slice(&tcp);
        f.extend_from_slice(&[0x16; 980]);

        let meta = decode(Linktype::ETHERNET, &f[..96]).unwrap();
        assert!(meta.is_tcp());
        assert_eq!(meta.ip_len, 1020);
        assert_eq!((meta.key.port_a, meta.key.port_b), (443, 50000));
        assert_eq!(meta.payload, 54..96);
    }

    #[test]
    fn snapped_ipv4_options() {
        let mut h = ipv4_hdr(PROTO_UDP, 8, 0).to_vec();
        // Claim 24 bytes of header but capture only 22.
        h[0] = 0x46;
        h.extend_from_slice(&[0, 0]);
        assert_eq!(
            decode(Linktype::RAW, &h),
            Err(DecodeError::Truncated("IPv4"))
        );
    }

    #[test]
    fn unknown_linktype() {
        assert_eq!(
            decode(Linktype(147), &[0u8; 64]),
            Err(DecodeError::UnsupportedLinktype(147))
        );
    }
}
