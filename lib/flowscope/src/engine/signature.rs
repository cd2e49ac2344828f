// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! A small payload-signature classification engine.
//!
//! [`SignatureEngine`] implements [`Classifier`] with a handful of
//! first-packet signatures, classification by IP protocol number for
//! protocols without ports, operator-supplied port rules, and a
//! port-based guess table for flows it never recognised.

use super::classify::Classifier;
use super::classify::Verdict;
use super::flow_key::FiveTuple;
use super::flow_key::FlowDirection;
use super::flow_key::FlowKey;
use super::flow_key::PROTO_ICMP;
use super::flow_key::PROTO_ICMPV6;
use super::flow_key::PROTO_IGMP;
use super::flow_key::PROTO_TCP;
use super::flow_key::PROTO_UDP;
use super::flow_key::PROTO_VRRP;
use super::protocol::Breed;
use super::protocol::ProtocolId;
use super::protocol::ProtocolRegistry;
use crate::Error;
use crate::Result;
use std::collections::BTreeMap;
use std::path::Path;

/// Packets with payload the engine looks at before it stops trying.
pub const DEF_MAX_PACKETS_PER_FLOW: u32 = 10;

const DHCP_MAGIC: [u8; 4] = [99, 130, 83, 99];
const BT_HANDSHAKE: &[u8] = b"\x13BitTorrent protocol";
const HTTP_METHODS: &[&[u8]] = &[
    b"GET ",
    b"POST ",
    b"HEAD ",
    b"PUT ",
    b"DELETE ",
    b"OPTIONS ",
    b"CONNECT ",
    b"PATCH ",
    b"HTTP/1.",
];

/// Per-flow engine state.
#[derive(Clone, Debug, Default)]
pub struct SignatureState {
    packets: u32,
    candidate: Option<ProtocolId>,
}

#[derive(Clone, Copy, Debug)]
struct Builtin {
    http: ProtocolId,
    tls: ProtocolId,
    ssh: ProtocolId,
    dns: ProtocolId,
    bittorrent: ProtocolId,
    dhcp: ProtocolId,
    ntp: ProtocolId,
    smtp: ProtocolId,
    ftp: ProtocolId,
    icmp: ProtocolId,
    icmpv6: ProtocolId,
    igmp: ProtocolId,
    vrrp: ProtocolId,
    quic: ProtocolId,
    telnet: ProtocolId,
}

impl Builtin {
    fn register(reg: &mut ProtocolRegistry) -> Self {
        Self {
            http: reg.register("HTTP", Breed::Acceptable),
            tls: reg.register("TLS", Breed::Safe),
            ssh: reg.register("SSH", Breed::Acceptable),
            dns: reg.register("DNS", Breed::Acceptable),
            bittorrent: reg.register("BitTorrent", Breed::Fun),
            dhcp: reg.register("DHCP", Breed::Acceptable),
            ntp: reg.register("NTP", Breed::Acceptable),
            smtp: reg.register("SMTP", Breed::Acceptable),
            ftp: reg.register("FTP_CONTROL", Breed::Unsafe),
            icmp: reg.register("ICMP", Breed::Acceptable),
            icmpv6: reg.register("ICMPV6", Breed::Acceptable),
            igmp: reg.register("IGMP", Breed::Acceptable),
            vrrp: reg.register("VRRP", Breed::Acceptable),
            quic: reg.register("QUIC", Breed::Acceptable),
            telnet: reg.register("Telnet", Breed::PotentiallyDangerous),
        }
    }

    fn by_ip_proto(&self, proto: u8) -> Option<ProtocolId> {
        match proto {
            PROTO_ICMP => Some(self.icmp),
            PROTO_ICMPV6 => Some(self.icmpv6),
            PROTO_IGMP => Some(self.igmp),
            PROTO_VRRP => Some(self.vrrp),
            _ => None,
        }
    }

    fn guess_table(&self) -> BTreeMap<(u8, u16), ProtocolId> {
        [
            ((PROTO_TCP, 21), self.ftp),
            ((PROTO_TCP, 22), self.ssh),
            ((PROTO_TCP, 23), self.telnet),
            ((PROTO_TCP, 25), self.smtp),
            ((PROTO_TCP, 53), self.dns),
            ((PROTO_TCP, 80), self.http),
            ((PROTO_TCP, 443), self.tls),
            ((PROTO_TCP, 587), self.smtp),
            ((PROTO_TCP, 6881), self.bittorrent),
            ((PROTO_TCP, 8080), self.http),
            ((PROTO_UDP, 53), self.dns),
            ((PROTO_UDP, 67), self.dhcp),
            ((PROTO_UDP, 68), self.dhcp),
            ((PROTO_UDP, 123), self.ntp),
            ((PROTO_UDP, 443), self.quic),
            ((PROTO_UDP, 6881), self.bittorrent),
        ]
        .into_iter()
        .collect()
    }
}

/// The built-in [`Classifier`].
#[derive(Clone, Debug)]
pub struct SignatureEngine {
    registry: ProtocolRegistry,
    builtin: Builtin,
    custom_ports: BTreeMap<(u8, u16), ProtocolId>,
    guess_ports: BTreeMap<(u8, u16), ProtocolId>,
    max_packets: u32,
}

impl Default for SignatureEngine {
    fn default() -> Self {
        Self::new(DEF_MAX_PACKETS_PER_FLOW)
    }
}

impl SignatureEngine {
    pub fn new(max_packets: u32) -> Self {
        let mut registry = ProtocolRegistry::new();
        let builtin = Builtin::register(&mut registry);
        let guess_ports = builtin.guess_table();

        Self {
            registry,
            builtin,
            custom_ports: BTreeMap::new(),
            guess_ports,
            max_packets: max_packets.max(1),
        }
    }

    /// Load protocol rules from `path`. See [`Self::load_protos`].
    pub fn load_protos_file(&mut self, path: &Path) -> Result<usize> {
        let text = std::fs::read_to_string(path).map_err(|err| Error::Io {
            path: path.display().to_string(),
            err,
        })?;
        self.load_protos(&text).map_err(|e| match e {
            Error::Config(msg) => {
                Error::Config(format!("{}: {msg}", path.display()))
            }
            e => e,
        })
    }

    /// Register custom protocols matched by port.
    ///
    /// Each non-blank line not starting with `#` has the form
    /// `tcp:8080,udp:9999-10001@Name`. Returns the number of rules
    /// loaded. Nothing is registered unless every line parses.
    pub fn load_protos(&mut self, text: &str) -> Result<usize> {
        let mut rules = vec![];

        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let rule = parse_proto_rule(line).map_err(|msg| {
                Error::Config(format!("line {}: {msg}: {line}", lineno + 1))
            })?;
            rules.push(rule);
        }

        let count = rules.len();
        for (name, ports) in rules {
            let id = self.registry.register(&name, Breed::Unrated);
            for (proto, lo, hi) in ports {
                for port in lo..=hi {
                    self.custom_ports.insert((proto, port), id);
                }
            }
        }

        Ok(count)
    }

    fn custom_match(
        &self,
        proto: u8,
        port_a: u16,
        port_b: u16,
    ) -> Option<ProtocolId> {
        if self.custom_ports.is_empty() {
            return None;
        }

        self.custom_ports
            .get(&(proto, port_a))
            .or_else(|| self.custom_ports.get(&(proto, port_b)))
            .copied()
    }

    fn match_payload(&self, key: &FlowKey, payload: &[u8]) -> Match {
        let b = &self.builtin;
        let on_port = |port: u16| key.port_a == port || key.port_b == port;

        if HTTP_METHODS.iter().any(|m| payload.starts_with(m)) {
            return Match::Definitive(b.http);
        }

        if payload.starts_with(b"SSH-") {
            return Match::Definitive(b.ssh);
        }

        if payload.starts_with(BT_HANDSHAKE) {
            return Match::Definitive(b.bittorrent);
        }

        if key.proto == PROTO_TCP {
            // TLS record: handshake, version 3.x, then a length.
            if payload.len() >= 5
                && payload[0] == 0x16
                && payload[1] == 0x03
                && payload[2] <= 0x04
            {
                return Match::Definitive(b.tls);
            }

            if payload.starts_with(b"EHLO ") || payload.starts_with(b"HELO ")
            {
                return Match::Definitive(b.smtp);
            }

            if payload.starts_with(b"220") {
                let banner =
                    String::from_utf8_lossy(payload).to_ascii_uppercase();
                if banner.contains("SMTP") {
                    return Match::Definitive(b.smtp);
                }
                if banner.contains("FTP") {
                    return Match::Definitive(b.ftp);
                }
                let id = if on_port(21) { b.ftp } else { b.smtp };
                return Match::Candidate(id);
            }

            if payload.starts_with(b"USER ") {
                return Match::Candidate(b.ftp);
            }
        }

        if key.proto == PROTO_UDP {
            if payload.len() >= 240 && payload[236..240] == DHCP_MAGIC {
                return Match::Definitive(b.dhcp);
            }

            if (on_port(53) || on_port(5353)) && is_dns(payload) {
                return Match::Definitive(b.dns);
            }

            if on_port(123) && payload.len() >= 48 {
                let version = (payload[0] >> 3) & 0x7;
                let mode = payload[0] & 0x7;
                if (1..=4).contains(&version) && (1..=5).contains(&mode) {
                    return Match::Definitive(b.ntp);
                }
            }
        }

        Match::None
    }
}

enum Match {
    Definitive(ProtocolId),
    /// Weak evidence, only reported if the engine is asked to give up.
    Candidate(ProtocolId),
    None,
}

fn is_dns(payload: &[u8]) -> bool {
    if payload.len() < 12 {
        return false;
    }

    let opcode = (payload[2] >> 3) & 0xF;
    let qdcount = u16::from_be_bytes([payload[4], payload[5]]);
    opcode <= 5 && (1..=16).contains(&qdcount)
}

type PortRule = (u8, u16, u16);

fn parse_proto_rule(
    line: &str,
) -> core::result::Result<(String, Vec<PortRule>), String> {
    let (ports, name) = line.split_once('@').ok_or("missing '@<name>'")?;
    let name = name.trim();
    if name.is_empty() {
        return Err("empty protocol name".to_string());
    }

    let mut rules = vec![];
    for entry in ports.split(',').map(str::trim) {
        let (proto, range) = entry
            .split_once(':')
            .ok_or_else(|| format!("bad port entry '{entry}'"))?;

        let proto = match proto.trim().to_ascii_lowercase().as_str() {
            "tcp" => PROTO_TCP,
            "udp" => PROTO_UDP,
            other => return Err(format!("unknown transport '{other}'")),
        };

        let parse = |s: &str| {
            s.trim().parse::<u16>().map_err(|_| format!("bad port '{s}'"))
        };
        let (lo, hi) = match range.split_once('-') {
            Some((lo, hi)) => (parse(lo)?, parse(hi)?),
            None => {
                let port = parse(range)?;
                (port, port)
            }
        };

        if lo > hi {
            return Err(format!("empty port range '{range}'"));
        }
        rules.push((proto, lo, hi));
    }

    Ok((name.to_string(), rules))
}

impl Classifier for SignatureEngine {
    type FlowState = SignatureState;

    fn create_flow_state(&mut self, _key: &FlowKey) -> SignatureState {
        SignatureState::default()
    }

    fn feed(
        &mut self,
        state: &mut SignatureState,
        key: &FlowKey,
        payload: &mut [u8],
        _dir: FlowDirection,
    ) -> Verdict {
        if let Some(id) = self.custom_match(key.proto, key.port_a, key.port_b) {
            return Verdict::Definitive(id);
        }

        if let Some(id) = self.builtin.by_ip_proto(key.proto) {
            return Verdict::Definitive(id);
        }

        if payload.is_empty() {
            return Verdict::Pending;
        }

        match self.match_payload(key, payload) {
            Match::Definitive(id) => return Verdict::Definitive(id),
            Match::Candidate(id) => state.candidate = Some(id),
            Match::None => {}
        }

        state.packets += 1;
        if state.packets >= self.max_packets {
            Verdict::Unknown
        } else {
            Verdict::Pending
        }
    }

    fn give_up(&mut self, state: &mut SignatureState) -> Verdict {
        state.candidate.map_or(Verdict::Unknown, Verdict::Definitive)
    }

    fn guess(&self, tuple: &FiveTuple) -> Option<ProtocolId> {
        if let Some(id) =
            self.custom_match(tuple.proto, tuple.port_a, tuple.port_b)
        {
            return Some(id);
        }

        if let Some(id) = self.builtin.by_ip_proto(tuple.proto) {
            return Some(id);
        }

        // Prefer the lower, more likely well-known, port.
        let (lo, hi) = if tuple.port_a <= tuple.port_b {
            (tuple.port_a, tuple.port_b)
        } else {
            (tuple.port_b, tuple.port_a)
        };

        self.guess_ports
            .get(&(tuple.proto, lo))
            .or_else(|| self.guess_ports.get(&(tuple.proto, hi)))
            .copied()
    }

    fn destroy(&mut self, _state: SignatureState) {}

    fn registry(&self) -> &ProtocolRegistry {
        &self.registry
    }
}
