// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Cross-worker aggregation.
//!
//! [`aggregate`] is a pure function of the stopped workers' outcomes.
//! It sums their counters, groups protocol totals by breed, and derives
//! averages and throughput. Rendering lives in [`crate::print`].

use crate::engine::flow_key::FlowKey;
use crate::engine::flow_key::ip_proto_name;
use crate::engine::flow_table::FlowRecord;
use crate::engine::protocol::Breed;
use crate::engine::protocol::ProtocolId;
use crate::engine::protocol::ProtocolRegistry;
use crate::engine::stat::PKT_LEN_BUCKETS;
use crate::engine::stat::ProtocolStats;
use crate::time::MICROS;
use crate::time::Moment;
use crate::worker::WorkerOutcome;
use core::time::Duration;
use itertools::Itertools;
use serde::Serialize;
use std::net::IpAddr;

/// A finalized flow as seen when its worker stopped.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FlowSummary {
    pub key: FlowKey,
    pub protocol: ProtocolId,
    pub packets: u64,
    pub bytes: u64,
    pub first_seen: Moment,
    pub last_seen: Moment,
}

impl FlowSummary {
    pub fn new<S>(rec: &FlowRecord<S>) -> Self {
        Self {
            key: *rec.key(),
            protocol: rec.protocol(),
            packets: rec.packet_count(),
            bytes: rec.byte_count(),
            first_seen: rec.first_seen(),
            last_seen: rec.last_seen(),
        }
    }
}

/// Packets and bits per second over some span of time.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct Throughput {
    pub pps: f64,
    pub bps: f64,
}

impl Throughput {
    /// Rates for `packets` packets carrying `bytes` bytes over `usecs`
    /// microseconds. An empty span yields zero rates.
    pub fn over(packets: u64, bytes: u64, usecs: u64) -> Self {
        if usecs == 0 {
            return Self::default();
        }

        let secs = usecs as f64 / MICROS as f64;
        Self { pps: packets as f64 / secs, bps: (bytes as f64 * 8.0) / secs }
    }
}

/// The cumulative traffic counters, keyed as they appear in the JSON
/// report.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct TrafficStats {
    #[serde(rename = "ethernet.bytes")]
    pub wire_bytes: u64,
    #[serde(rename = "discarded.bytes")]
    pub discarded_bytes: u64,
    #[serde(rename = "ip.packets")]
    pub ip_packets: u64,
    #[serde(rename = "total.packets")]
    pub raw_packets: u64,
    #[serde(rename = "ip.bytes")]
    pub ip_bytes: u64,
    #[serde(rename = "avg.pkt.size")]
    pub avg_pkt_size: u64,
    #[serde(rename = "unique.flows")]
    pub unique_flows: u64,
    #[serde(rename = "live.flows")]
    pub live_flows: u64,
    #[serde(rename = "peak.flows")]
    pub peak_flows: u64,
    #[serde(rename = "tcp.pkts")]
    pub tcp_packets: u64,
    #[serde(rename = "udp.pkts")]
    pub udp_packets: u64,
    #[serde(rename = "vlan.pkts")]
    pub vlan_packets: u64,
    #[serde(rename = "mpls.pkts")]
    pub mpls_packets: u64,
    #[serde(rename = "pppoe.pkts")]
    pub pppoe_packets: u64,
    #[serde(rename = "fragmented.pkts")]
    pub fragmented_packets: u64,
    #[serde(rename = "max.pkt.size")]
    pub max_pkt_size: u32,
    #[serde(rename = "pkt.len_min64")]
    pub len_min64: u64,
    #[serde(rename = "pkt.len_64_128")]
    pub len_64_128: u64,
    #[serde(rename = "pkt.len_128_256")]
    pub len_128_256: u64,
    #[serde(rename = "pkt.len_256_1024")]
    pub len_256_1024: u64,
    #[serde(rename = "pkt.len_1024_1500")]
    pub len_1024_1500: u64,
    #[serde(rename = "pkt.len_grt1500")]
    pub len_grt1500: u64,
    #[serde(rename = "guessed.flow.protos")]
    pub guessed_flow_protos: u32,
    #[serde(rename = "engine.corruptions")]
    pub engine_corruptions: u64,
    /// Capture duration in microseconds; wall-clock for live sources.
    #[serde(rename = "traffic.duration.usec")]
    pub duration_usec: u64,
    #[serde(rename = "processing.usec")]
    pub processing_usec: u64,
    #[serde(rename = "processing.throughput")]
    pub processing: Throughput,
    #[serde(rename = "traffic.throughput")]
    pub traffic: Throughput,
}

impl TrafficStats {
    /// The histogram buckets in ascending order.
    pub fn packet_len(&self) -> [u64; PKT_LEN_BUCKETS] {
        [
            self.len_min64,
            self.len_64_128,
            self.len_128_256,
            self.len_256_1024,
            self.len_1024_1500,
            self.len_grt1500,
        ]
    }
}

/// One protocol seen in the traffic.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct ProtocolSummary {
    #[serde(skip)]
    pub id: ProtocolId,
    pub name: String,
    pub breed: Breed,
    pub packets: u64,
    pub bytes: u64,
    pub flows: u32,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub struct BreedSummary {
    pub breed: Breed,
    pub bytes: u64,
}

/// A flow as listed in verbose and JSON output.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct ListedFlow {
    #[serde(skip)]
    pub key: FlowKey,
    pub protocol: String,
    #[serde(rename = "host_a.name")]
    pub host_a: IpAddr,
    #[serde(rename = "host_a.port")]
    pub port_a: u16,
    #[serde(rename = "host_b.name")]
    pub host_b: IpAddr,
    #[serde(rename = "host_b.port")]
    pub port_b: u16,
    #[serde(rename = "vlan.id", skip_serializing_if = "is_zero")]
    pub vlan_id: u16,
    #[serde(rename = "detected.protocol")]
    pub detected: ProtocolId,
    #[serde(rename = "detected.protocol.name")]
    pub detected_name: String,
    pub packets: u64,
    pub bytes: u64,
}

fn is_zero(v: &u16) -> bool {
    *v == 0
}

impl ListedFlow {
    fn new(flow: &FlowSummary, registry: &ProtocolRegistry) -> Self {
        Self {
            key: flow.key,
            protocol: ip_proto_name(flow.key.proto),
            host_a: flow.key.addr_a(),
            port_a: flow.key.port_a,
            host_b: flow.key.addr_b(),
            port_b: flow.key.port_b,
            vlan_id: flow.key.vlan_id,
            detected: flow.protocol,
            detected_name: registry.name(flow.protocol).to_string(),
            packets: flow.packets,
            bytes: flow.bytes,
        }
    }
}

/// The consolidated result of one run.
#[derive(Clone, Debug, Serialize)]
pub struct Report {
    #[serde(rename = "traffic.statistics")]
    pub traffic: TrafficStats,
    #[serde(rename = "detected.protos")]
    pub protocols: Vec<ProtocolSummary>,
    #[serde(rename = "protocol.breeds")]
    pub breeds: Vec<BreedSummary>,
    #[serde(rename = "known.flows")]
    pub known_flows: Vec<ListedFlow>,
    #[serde(rename = "unknown.flows", skip_serializing_if = "Vec::is_empty")]
    pub unknown_flows: Vec<ListedFlow>,
    /// Some idle flows were reaped while still unclassified, so the
    /// unknown listing is incomplete.
    #[serde(rename = "unknown.flows.expired")]
    pub unknown_flows_expired: bool,
    /// Whether the heuristic guess pass was enabled.
    #[serde(skip)]
    pub guess_enabled: bool,
    /// Whether the sources were live captures.
    #[serde(skip)]
    pub live: bool,
    #[serde(skip)]
    pub totals: ProtocolStats,
}

/// How the aggregate should be computed.
#[derive(Clone, Copy, Debug, Default)]
pub struct AggregateOpts {
    /// Wall-clock time spent processing.
    pub elapsed: Duration,
    /// The sources were live interfaces.
    pub live: bool,
    /// Produce the known/unknown flow listings.
    pub list_flows: bool,
    pub guess_enabled: bool,
}

/// Merge the outcomes of every stopped worker into one report.
///
/// Nothing here touches a flow table; the outcomes already carry each
/// worker's finalized flows.
pub fn aggregate(
    outcomes: &[WorkerOutcome],
    registry: &ProtocolRegistry,
    opts: AggregateOpts,
) -> Report {
    let mut totals = ProtocolStats::default();
    let mut peak_flows = 0;
    for out in outcomes {
        totals.merge(&out.stats);
        peak_flows += out.peak_flows;
    }

    let processing_usec = opts.elapsed.as_micros() as u64;
    let capture = (totals.capture_start, totals.capture_end);
    let duration_usec = match (opts.live, capture) {
        (false, (Some(start), Some(end))) => end.delta_as_micros(start),
        _ => processing_usec,
    };

    let avg_pkt_size = if totals.raw_packet_count == 0 {
        0
    } else {
        totals.total_ip_bytes / totals.raw_packet_count
    };

    let [
        len_min64,
        len_64_128,
        len_128_256,
        len_256_1024,
        len_1024_1500,
        len_grt1500,
    ] = totals.packet_len;

    let traffic = TrafficStats {
        wire_bytes: totals.total_wire_bytes,
        discarded_bytes: totals.discarded_bytes,
        ip_packets: totals.ip_packet_count,
        raw_packets: totals.raw_packet_count,
        ip_bytes: totals.total_ip_bytes,
        avg_pkt_size,
        unique_flows: totals.total_flows,
        live_flows: totals.flow_count,
        peak_flows,
        tcp_packets: totals.tcp_count,
        udp_packets: totals.udp_count,
        vlan_packets: totals.vlan_count,
        mpls_packets: totals.mpls_count,
        pppoe_packets: totals.pppoe_count,
        fragmented_packets: totals.fragmented_count,
        max_pkt_size: totals.max_packet_len,
        len_min64,
        len_64_128,
        len_128_256,
        len_256_1024,
        len_1024_1500,
        len_grt1500,
        guessed_flow_protos: totals.guessed_flow_protocols,
        engine_corruptions: totals.engine_corruptions,
        duration_usec,
        processing_usec,
        processing: Throughput::over(
            totals.ip_packet_count,
            totals.total_wire_bytes,
            processing_usec,
        ),
        traffic: Throughput::over(
            totals.ip_packet_count,
            totals.total_wire_bytes,
            duration_usec,
        ),
    };

    let protocols: Vec<ProtocolSummary> = totals
        .protocols
        .iter()
        .enumerate()
        .filter(|(_, c)| c.packets > 0)
        .map(|(i, c)| {
            let id = ProtocolId(i as u16);
            ProtocolSummary {
                id,
                name: registry.name(id).to_string(),
                breed: registry.breed(id),
                packets: c.packets,
                bytes: c.bytes,
                flows: c.flows,
            }
        })
        .collect();

    let breeds = Breed::ALL
        .iter()
        .map(|breed| BreedSummary {
            breed: *breed,
            bytes: protocols
                .iter()
                .filter(|p| p.breed == *breed)
                .map(|p| p.bytes)
                .sum(),
        })
        .filter(|b| b.bytes > 0)
        .collect();

    let (known_flows, unknown_flows) = if opts.list_flows {
        let (unknown, known): (Vec<_>, Vec<_>) = outcomes
            .iter()
            .flat_map(|out| out.flows.iter())
            .sorted_by(|x, y| {
                x.protocol.cmp(&y.protocol).then_with(|| x.key.cmp(&y.key))
            })
            .map(|f| ListedFlow::new(f, registry))
            .partition(|f| f.detected.is_unknown());
        (known, unknown)
    } else {
        (vec![], vec![])
    };

    Report {
        traffic,
        protocols,
        breeds,
        known_flows,
        unknown_flows,
        unknown_flows_expired: totals.unknown_flows_expired,
        guess_enabled: opts.guess_enabled,
        live: opts.live,
        totals,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::engine::classify::test::tcp_key;

    fn outcome(
        id: usize,
        stats: ProtocolStats,
        flows: Vec<FlowSummary>,
    ) -> WorkerOutcome {
        WorkerOutcome {
            id,
            source: format!("src{id}"),
            stats,
            flows,
            peak_flows: 3,
        }
    }

    fn summary(n: u8, protocol: ProtocolId) -> FlowSummary {
        FlowSummary {
            key: tcp_key(n),
            protocol,
            packets: 2,
            bytes: 120,
            first_seen: Moment::from_millis(1),
            last_seen: Moment::from_millis(2),
        }
    }

    #[test]
    fn empty_report_is_all_zero() {
        let registry = ProtocolRegistry::new();
        let report = aggregate(&[], &registry, AggregateOpts::default());
        assert_eq!(report.traffic, TrafficStats::default());
        assert!(report.protocols.is_empty());
        assert!(report.breeds.is_empty());
        assert!(report.known_flows.is_empty());
        assert!(report.unknown_flows.is_empty());

        // Stats with no packets still must not divide by zero.
        let opts = AggregateOpts {
            elapsed: Duration::from_secs(2),
            list_flows: true,
            ..Default::default()
        };
        let out = outcome(0, ProtocolStats::default(), vec![]);
        let report = aggregate(&[out], &registry, opts);
        assert_eq!(report.traffic.avg_pkt_size, 0);
        assert_eq!(report.traffic.processing, Throughput::default());
        assert_eq!(report.traffic.peak_flows, 3);
    }

    #[test]
    fn throughput() {
        let t = Throughput::over(100, 1000, 2 * MICROS);
        assert_eq!(t.pps, 50.0);
        assert_eq!(t.bps, 4000.0);
        assert_eq!(Throughput::over(100, 1000, 0), Throughput::default());
    }

    #[test]
    fn merges_workers_and_groups_breeds() {
        let mut registry = ProtocolRegistry::new();
        let http = registry.register("HTTP", Breed::Acceptable);
        let tls = registry.register("TLS", Breed::Safe);
        let ssh = registry.register("SSH", Breed::Acceptable);

        let mut a = ProtocolStats::default();
        a.raw_packet_count = 4;
        a.ip_packet_count = 4;
        a.total_ip_bytes = 400;
        a.total_flows = 2;
        a.book_flow(http, 3, 300);
        a.book_flow(ProtocolId::UNKNOWN, 1, 100);
        a.record_capture_time(Moment::from_millis(1_000));
        a.record_capture_time(Moment::from_millis(2_000));

        let mut b = ProtocolStats::default();
        b.raw_packet_count = 6;
        b.ip_packet_count = 5;
        b.total_ip_bytes = 600;
        b.total_flows = 2;
        b.book_flow(tls, 2, 200);
        b.book_flow(ssh, 3, 400);
        b.record_capture_time(Moment::from_millis(500));
        b.record_capture_time(Moment::from_millis(1_500));

        let outs = [
            outcome(
                0,
                a,
                vec![summary(1, http), summary(2, ProtocolId::UNKNOWN)],
            ),
            outcome(1, b, vec![summary(4, ssh), summary(3, tls)]),
        ];
        let opts = AggregateOpts {
            elapsed: Duration::from_millis(100),
            list_flows: true,
            ..Default::default()
        };
        let report = aggregate(&outs, &registry, opts);

        assert_eq!(report.traffic.raw_packets, 10);
        assert_eq!(report.traffic.ip_packets, 9);
        assert_eq!(report.traffic.avg_pkt_size, 100);
        assert_eq!(report.traffic.unique_flows, 4);
        assert_eq!(report.traffic.peak_flows, 6);
        assert_eq!(report.traffic.duration_usec, 1_500_000);
        assert_eq!(report.traffic.processing_usec, 100_000);

        let names: Vec<_> =
            report.protocols.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, ["Unknown", "HTTP", "TLS", "SSH"]);

        assert_eq!(
            report.breeds,
            [
                BreedSummary { breed: Breed::Safe, bytes: 200 },
                BreedSummary { breed: Breed::Acceptable, bytes: 700 },
                BreedSummary { breed: Breed::Unrated, bytes: 100 },
            ]
        );

        let known: Vec<_> = report
            .known_flows
            .iter()
            .map(|f| f.detected_name.as_str())
            .collect();
        assert_eq!(known, ["HTTP", "TLS", "SSH"]);
        assert_eq!(report.unknown_flows.len(), 1);
    }

    #[test]
    fn live_duration_uses_elapsed_time() {
        let registry = ProtocolRegistry::new();
        let opts = AggregateOpts {
            elapsed: Duration::from_secs(3),
            live: true,
            ..Default::default()
        };
        let report = aggregate(&[], &registry, opts);
        assert_eq!(report.traffic.duration_usec, 3 * MICROS);
    }

    #[test]
    fn listings_only_on_request() {
        let registry = ProtocolRegistry::new();
        let flows = vec![summary(1, ProtocolId::UNKNOWN)];
        let out = outcome(0, ProtocolStats::default(), flows);
        let report = aggregate(&[out], &registry, AggregateOpts::default());
        assert!(report.unknown_flows.is_empty());

        let json = serde_json::to_value(&report).unwrap();
        assert!(json.get("unknown.flows").is_none());
        assert_eq!(json["traffic.statistics"]["avg.pkt.size"], 0);
    }
}
