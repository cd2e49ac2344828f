// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Ethernet frame builders.

use smoltcp::wire::EthernetAddress;
use smoltcp::wire::EthernetFrame;
use smoltcp::wire::EthernetProtocol;
use smoltcp::wire::IpProtocol;
use smoltcp::wire::Ipv4Address;
use smoltcp::wire::Ipv4Packet;
use smoltcp::wire::Ipv6Address;
use smoltcp::wire::Ipv6Packet;
use smoltcp::wire::TcpPacket;
use smoltcp::wire::TcpSeqNumber;
use smoltcp::wire::UdpPacket;
use std::net::IpAddr;

pub const ETHER_HDR_LEN: usize = 14;
pub const IPV4_HDR_LEN: usize = 20;
pub const IPV6_HDR_LEN: usize = 40;
pub const TCP_HDR_LEN: usize = 20;
pub const UDP_HDR_LEN: usize = 8;

pub const SRC_MAC: [u8; 6] = [0xA8, 0x40, 0x25, 0x00, 0x00, 0x01];
pub const DST_MAC: [u8; 6] = [0xA8, 0x40, 0x25, 0x00, 0x00, 0x02];

const ETHER_TYPE_VLAN: u16 = 0x8100;

/// One side of a conversation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Endpoint {
    pub ip: IpAddr,
    pub port: u16,
}

impl Endpoint {
    pub fn new<A: Into<IpAddr>>(ip: A, port: u16) -> Self {
        Self { ip: ip.into(), port }
    }
}

fn ethernet(ethertype: EthernetProtocol, l3_len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; ETHER_HDR_LEN + l3_len];
    let mut eth = EthernetFrame::new_unchecked(&mut buf[..]);
    eth.set_src_addr(EthernetAddress(SRC_MAC));
    eth.set_dst_addr(EthernetAddress(DST_MAC));
    eth.set_ethertype(ethertype);
    buf
}

/// Write an IP header for `l4_len` bytes of `proto` into a fresh
/// Ethernet frame, returning the frame and the transport offset.
fn ip_frame(
    src: IpAddr,
    dst: IpAddr,
    proto: IpProtocol,
    l4_len: usize,
) -> (Vec<u8>, usize) {
    match (src, dst) {
        (IpAddr::V4(s), IpAddr::V4(d)) => {
            let mut buf =
                ethernet(EthernetProtocol::Ipv4, IPV4_HDR_LEN + l4_len);
            let mut ip = Ipv4Packet::new_unchecked(&mut buf[ETHER_HDR_LEN..]);
            ip.set_version(4);
            ip.set_header_len(IPV4_HDR_LEN as u8);
            ip.set_total_len((IPV4_HDR_LEN + l4_len) as u16);
            ip.set_hop_limit(64);
            ip.set_next_header(proto);
            ip.set_src_addr(Ipv4Address::from_bytes(&s.octets()));
            ip.set_dst_addr(Ipv4Address::from_bytes(&d.octets()));
            ip.fill_checksum();
            (buf, ETHER_HDR_LEN + IPV4_HDR_LEN)
        }

        (IpAddr::V6(s), IpAddr::V6(d)) => {
            let mut buf =
                ethernet(EthernetProtocol::Ipv6, IPV6_HDR_LEN + l4_len);
            let mut ip = Ipv6Packet::new_unchecked(&mut buf[ETHER_HDR_LEN..]);
            ip.set_version(6);
            ip.set_payload_len(l4_len as u16);
            ip.set_hop_limit(64);
            ip.set_next_header(proto);
            ip.set_src_addr(Ipv6Address::from_bytes(&s.octets()));
            ip.set_dst_addr(Ipv6Address::from_bytes(&d.octets()));
            (buf, ETHER_HDR_LEN + IPV6_HDR_LEN)
        }

        _ => panic!("mixed address families: {src} -> {dst}"),
    }
}

/// An Ethernet/IP/TCP frame carrying `payload` with only ACK set.
pub fn tcp(src: Endpoint, dst: Endpoint, payload: &[u8]) -> Vec<u8> {
    let l4_len = TCP_HDR_LEN + payload.len();
    let (mut buf, off) = ip_frame(src.ip, dst.ip, IpProtocol::Tcp, l4_len);
    let mut tcp = TcpPacket::new_unchecked(&mut buf[off..]);
    tcp.set_src_port(src.port);
    tcp.set_dst_port(dst.port);
    tcp.set_seq_number(TcpSeqNumber(1));
    tcp.set_ack_number(TcpSeqNumber(1));
    tcp.set_header_len(TCP_HDR_LEN as u8);
    tcp.clear_flags();
    tcp.set_ack(true);
    tcp.set_window_len(64240);
    tcp.payload_mut().copy_from_slice(payload);
    buf
}

/// An Ethernet/IP/UDP frame carrying `payload`.
pub fn udp(src: Endpoint, dst: Endpoint, payload: &[u8]) -> Vec<u8> {
    let l4_len = UDP_HDR_LEN + payload.len();
    let (mut buf, off) = ip_frame(src.ip, dst.ip, IpProtocol::Udp, l4_len);
    let mut udp = UdpPacket::new_unchecked(&mut buf[off..]);
    udp.set_src_port(src.port);
    udp.set_dst_port(dst.port);
    udp.set_len(l4_len as u16);
    udp.payload_mut().copy_from_slice(payload);
    buf
}

/// Insert an 802.1Q tag carrying `vlan_id` into an Ethernet frame.
pub fn with_vlan(frame: &[u8], vlan_id: u16) -> Vec<u8> {
    let mut out = Vec::with_capacity(frame.len() + 4);
    out.extend_from_slice(&frame[..12]);
    out.extend_from_slice(&ETHER_TYPE_VLAN.to_be_bytes());
    out.extend_from_slice(&(vlan_id & 0x0FFF).to_be_bytes());
    out.extend_from_slice(&frame[12..]);
    out
}

/// A broadcast ARP request, which carries no IP at all.
pub fn arp() -> Vec<u8> {
    let mut buf = ethernet(EthernetProtocol::Arp, 28);
    buf[ETHER_HDR_LEN..ETHER_HDR_LEN + 8]
        .copy_from_slice(&[0x00, 0x01, 0x08, 0x00, 0x06, 0x04, 0x00, 0x01]);
    buf
}

#[cfg(test)]
mod test {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn tcp_frame_layout() {
        let a = Endpoint::new(Ipv4Addr::new(10, 0, 0, 1), 54321);
        let b = Endpoint::new(Ipv4Addr::new(10, 0, 0, 2), 80);
        let frame = tcp(a, b, b"GET /");
        assert_eq!(frame.len(), ETHER_HDR_LEN + IPV4_HDR_LEN + TCP_HDR_LEN + 5);

        let eth = EthernetFrame::new_checked(&frame[..]).unwrap();
        let ip = Ipv4Packet::new_checked(eth.payload()).unwrap();
        assert!(ip.verify_checksum());
        let seg = TcpPacket::new_checked(ip.payload()).unwrap();
        assert_eq!(seg.dst_port(), 80);
        assert_eq!(seg.payload(), b"GET /");
    }

    #[test]
    fn vlan_tag_inserted() {
        let a = Endpoint::new(Ipv4Addr::new(10, 0, 0, 1), 5000);
        let b = Endpoint::new(Ipv4Addr::new(10, 0, 0, 2), 53);
        let plain = udp(a, b, b"q");
        let tagged = with_vlan(&plain, 100);
        assert_eq!(tagged.len(), plain.len() + 4);
        assert_eq!(&tagged[12..16], &[0x81, 0x00, 0x00, 100]);
    }
}
