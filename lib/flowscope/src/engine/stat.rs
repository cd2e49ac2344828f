// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Per-worker traffic counters.
//!
//! A [`ProtocolStats`] is zeroed when its worker starts, mutated only
//! by that worker, and summed into a cumulative value once every
//! worker has joined. Nothing here is atomic because nothing here is
//! ever shared.

use super::protocol::ProtocolId;
use crate::time::Moment;
use serde::Serialize;

/// Number of packet-length histogram buckets.
pub const PKT_LEN_BUCKETS: usize = 6;

/// Upper bounds (inclusive) of all but the last histogram bucket.
pub const PKT_LEN_BOUNDS: [u32; PKT_LEN_BUCKETS - 1] =
    [64, 128, 256, 1024, 1500];

/// Ethernet CRC, inter-frame gap and preamble, which a capture never
/// shows but the wire carries.
pub const WIRE_OVERHEAD: u64 = 24;

/// Packet/byte/flow totals for one protocol.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct ProtoCounter {
    pub packets: u64,
    pub bytes: u64,
    pub flows: u32,
}

impl ProtoCounter {
    fn merge(&mut self, other: &ProtoCounter) {
        self.packets += other.packets;
        self.bytes += other.bytes;
        self.flows += other.flows;
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct ProtocolStats {
    /// Indexed by [`ProtocolId`].
    pub protocols: Vec<ProtoCounter>,

    pub raw_packet_count: u64,
    pub ip_packet_count: u64,
    pub total_wire_bytes: u64,
    pub total_ip_bytes: u64,
    pub discarded_bytes: u64,

    /// Flows currently held in flow tables.
    pub flow_count: u64,
    /// Flows ever created.
    pub total_flows: u64,

    pub tcp_count: u64,
    pub udp_count: u64,
    pub vlan_count: u64,
    pub mpls_count: u64,
    pub pppoe_count: u64,
    pub fragmented_count: u64,

    pub guessed_flow_protocols: u32,
    pub packet_len: [u64; PKT_LEN_BUCKETS],
    pub max_packet_len: u32,

    /// Packets whose bytes were altered by the classification engine.
    pub engine_corruptions: u64,
    /// Set once an idle flow was reaped without a known protocol.
    pub unknown_flows_expired: bool,

    /// Timestamps of the first and last packet read from a stored
    /// capture.
    pub capture_start: Option<Moment>,
    pub capture_end: Option<Moment>,
}

impl ProtocolStats {
    /// The counters for `id`, zero if none were booked.
    pub fn protocol(&self, id: ProtocolId) -> ProtoCounter {
        self.protocols.get(id.index()).copied().unwrap_or_default()
    }

    /// Book a finalized flow's totals against `id`.
    pub fn book_flow(&mut self, id: ProtocolId, packets: u64, bytes: u64) {
        if self.protocols.len() <= id.index() {
            self.protocols.resize(id.index() + 1, ProtoCounter::default());
        }

        let counter = &mut self.protocols[id.index()];
        counter.packets += packets;
        counter.bytes += bytes;
        counter.flows += 1;
    }

    /// Record the length of a raw frame.
    pub fn record_packet_len(&mut self, len: u32) {
        let bucket = PKT_LEN_BOUNDS
            .iter()
            .position(|bound| len <= *bound)
            .unwrap_or(PKT_LEN_BUCKETS - 1);
        self.packet_len[bucket] += 1;
        self.max_packet_len = self.max_packet_len.max(len);
    }

    /// Record the timestamp of a packet read from a stored capture.
    pub fn record_capture_time(&mut self, ts: Moment) {
        self.capture_start.get_or_insert(ts);
        self.capture_end = Some(ts);
    }

    /// Fold `other` into `self`.
    pub fn merge(&mut self, other: &ProtocolStats) {
        if self.protocols.len() < other.protocols.len() {
            self.protocols
                .resize(other.protocols.len(), ProtoCounter::default());
        }

        for (mine, theirs) in self.protocols.iter_mut().zip(&other.protocols) {
            mine.merge(theirs);
        }

        self.raw_packet_count += other.raw_packet_count;
        self.ip_packet_count += other.ip_packet_count;
        self.total_wire_bytes += other.total_wire_bytes;
        self.total_ip_bytes += other.total_ip_bytes;
        self.discarded_bytes += other.discarded_bytes;
        self.flow_count += other.flow_count;
        self.total_flows += other.total_flows;
        self.tcp_count += other.tcp_count;
        self.udp_count += other.udp_count;
        self.vlan_count += other.vlan_count;
        self.mpls_count += other.mpls_count;
        self.pppoe_count += other.pppoe_count;
        self.fragmented_count += other.fragmented_count;
        self.guessed_flow_protocols += other.guessed_flow_protocols;

        for (mine, theirs) in self.packet_len.iter_mut().zip(other.packet_len) {
            *mine += theirs;
        }

        self.max_packet_len = self.max_packet_len.max(other.max_packet_len);
        self.engine_corruptions += other.engine_corruptions;
        self.unknown_flows_expired |= other.unknown_flows_expired;

        self.capture_start = match (self.capture_start, other.capture_start) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self.capture_end = match (self.capture_end, other.capture_end) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn histogram_buckets() {
        let mut stats = ProtocolStats::default();
        for len in [60, 64, 65, 128, 200, 1024, 1500, 1501, 9000] {
            stats.record_packet_len(len);
        }
        assert_eq!(stats.packet_len, [2, 2, 1, 1, 1, 2]);
        assert_eq!(stats.max_packet_len, 9000);
    }

    #[test]
    fn merge_sums_counters() {
        let mut a = ProtocolStats::default();
        a.raw_packet_count = 3;
        a.book_flow(ProtocolId(1), 2, 200);
        a.max_packet_len = 1500;
        a.record_capture_time(Moment::from_millis(50));

        let mut b = ProtocolStats::default();
        b.raw_packet_count = 4;
        b.book_flow(ProtocolId(1), 1, 100);
        b.book_flow(ProtocolId(5), 1, 40);
        b.max_packet_len = 60;
        b.unknown_flows_expired = true;
        b.record_capture_time(Moment::from_millis(10));
        b.record_capture_time(Moment::from_millis(20));

        let mut total = ProtocolStats::default();
        total.merge(&a);
        total.merge(&b);

        assert_eq!(total.raw_packet_count, 7);
        assert_eq!(
            total.protocol(ProtocolId(1)),
            ProtoCounter { packets: 3, bytes: 300, flows: 2 }
        );
        assert_eq!(total.protocol(ProtocolId(5)).flows, 1);
        assert_eq!(total.max_packet_len, 1500);
        assert!(total.unknown_flows_expired);
        assert_eq!(total.capture_start, Some(Moment::from_millis(10)));
        assert_eq!(total.capture_end, Some(Moment::from_millis(50)));
    }
}
