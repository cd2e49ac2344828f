// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Print reports in a human-friendly manner.
//!
//! This is mostly just a place to hang printing routines so that they
//! can be used by both flowread and integration tests.

use crate::engine::flow_key::AddrPair;
use crate::report::ListedFlow;
use crate::report::Report;
use crate::report::Throughput;
use crate::time::MICROS;
use std::io::Write;
use tabwriter::TabWriter;

const KILO: f64 = 1024.0;

/// Format a bit (or byte) count with binary unit prefixes.
pub fn format_traffic(num: f64, bits: bool) -> String {
    let unit = if bits { 'b' } else { 'B' };

    if num < KILO {
        return format!("{} {unit}", num as u64);
    }

    if num < KILO * KILO {
        return format!("{:.2} K{unit}", num / KILO);
    }

    let mut scaled = num / (KILO * KILO);
    for prefix in ['M', 'G'] {
        if scaled < KILO {
            return format!("{scaled:.2} {prefix}{unit}");
        }
        scaled /= KILO;
    }

    format!("{scaled:.2} T{unit}")
}

/// Format a packet count (or rate) with decimal unit prefixes.
pub fn format_packets(num: f64) -> String {
    if num < 1_000.0 {
        format!("{num:.2}")
    } else if num < 1_000_000.0 {
        format!("{:.2} K", num / 1_000.0)
    } else {
        format!("{:.2} M", num / 1_000_000.0)
    }
}

fn format_throughput(t: &Throughput) -> String {
    format!(
        "{} pps / {}/sec",
        format_packets(t.pps),
        format_traffic(t.bps, true)
    )
}

/// Print a [`Report`].
pub fn print_report(report: &Report) -> std::io::Result<()> {
    print_report_into(&mut std::io::stdout(), report)
}

/// Print a [`Report`] into a given writer.
pub fn print_report_into(
    writer: &mut impl Write,
    report: &Report,
) -> std::io::Result<()> {
    let mut t = TabWriter::new(writer);
    let traffic = &report.traffic;

    writeln!(t, "Traffic statistics:")?;
    write_hr(&mut t)?;
    writeln!(
        t,
        "\tEthernet bytes:\t{}\t(includes ethernet CRC/IFC/trailer)",
        traffic.wire_bytes
    )?;
    writeln!(t, "\tDiscarded bytes:\t{}", traffic.discarded_bytes)?;
    writeln!(
        t,
        "\tIP packets:\t{}\tof {} packets total",
        traffic.ip_packets, traffic.raw_packets
    )?;
    writeln!(
        t,
        "\tIP bytes:\t{}\t(avg pkt size {} bytes)",
        traffic.ip_bytes, traffic.avg_pkt_size
    )?;
    writeln!(t, "\tUnique flows:\t{}", traffic.unique_flows)?;
    writeln!(t, "\tPeak live flows:\t{}", traffic.peak_flows)?;
    writeln!(t, "\tTCP Packets:\t{}", traffic.tcp_packets)?;
    writeln!(t, "\tUDP Packets:\t{}", traffic.udp_packets)?;
    writeln!(t, "\tVLAN Packets:\t{}", traffic.vlan_packets)?;
    writeln!(t, "\tMPLS Packets:\t{}", traffic.mpls_packets)?;
    writeln!(t, "\tPPPoE Packets:\t{}", traffic.pppoe_packets)?;
    writeln!(t, "\tFragmented Packets:\t{}", traffic.fragmented_packets)?;
    writeln!(t, "\tMax Packet size:\t{}", traffic.max_pkt_size)?;

    let labels = [
        "Packet Len < 64:",
        "Packet Len 64-128:",
        "Packet Len 128-256:",
        "Packet Len 256-1024:",
        "Packet Len 1024-1500:",
        "Packet Len > 1500:",
    ];
    for (label, count) in labels.iter().zip(traffic.packet_len()) {
        writeln!(t, "\t{label}\t{count}")?;
    }

    if traffic.processing_usec > 0 {
        writeln!(
            t,
            "\tProcessing throughput:\t{}",
            format_throughput(&traffic.processing)
        )?;
        writeln!(
            t,
            "\tTraffic throughput:\t{}",
            format_throughput(&traffic.traffic)
        )?;
        writeln!(
            t,
            "\tTraffic duration:\t{:.3} sec",
            traffic.duration_usec as f64 / MICROS as f64
        )?;
    }

    if report.guess_enabled {
        writeln!(t, "\tGuessed flow protos:\t{}", traffic.guessed_flow_protos)?;
    }

    if traffic.engine_corruptions > 0 {
        writeln!(t, "\tEngine corruptions:\t{}", traffic.engine_corruptions)?;
    }
    t.flush()?;

    writeln!(t, "\nDetected protocols:")?;
    write_hr(&mut t)?;
    for p in &report.protocols {
        writeln!(
            t,
            "\t{}\tpackets: {}\tbytes: {}\tflows: {}",
            p.name, p.packets, p.bytes, p.flows
        )?;
    }
    t.flush()?;

    writeln!(t, "\nProtocol statistics:")?;
    write_hr(&mut t)?;
    for b in &report.breeds {
        writeln!(t, "\t{}\t{} bytes", b.breed, b.bytes)?;
    }
    t.flush()
}

/// Print the known and unknown flow listings of a [`Report`].
pub fn print_flows(report: &Report) -> std::io::Result<()> {
    print_flows_into(&mut std::io::stdout(), report)
}

/// Print the known and unknown flow listings of a [`Report`] into a
/// given writer.
pub fn print_flows_into(
    writer: &mut impl Write,
    report: &Report,
) -> std::io::Result<()> {
    let mut n = 0;

    writeln!(writer)?;
    for flow in &report.known_flows {
        n += 1;
        print_flow(writer, n, flow)?;
    }

    if !report.unknown_flows.is_empty() {
        let note = if report.unknown_flows_expired {
            " (expired flows are not listed below)"
        } else {
            ""
        };
        writeln!(writer, "\n\nUndetected flows:{note}")?;

        n = 0;
        for flow in &report.unknown_flows {
            n += 1;
            print_flow(writer, n, flow)?;
        }
    }

    Ok(())
}

/// Print one listed flow.
pub fn print_flow(
    t: &mut impl Write,
    n: usize,
    flow: &ListedFlow,
) -> std::io::Result<()> {
    let (open, close) = match flow.key.addrs {
        AddrPair::V4 { .. } => ("", ""),
        AddrPair::V6 { .. } => ("[", "]"),
    };

    write!(
        t,
        "\t{n}\t{} {open}{}{close}:{} <-> {open}{}{close}:{} ",
        flow.protocol, flow.host_a, flow.port_a, flow.host_b, flow.port_b,
    )?;

    if flow.vlan_id > 0 {
        write!(t, "[VLAN: {}]", flow.vlan_id)?;
    }

    writeln!(
        t,
        "[proto: {}/{}][{} pkts/{} bytes]",
        flow.detected, flow.detected_name, flow.packets, flow.bytes
    )
}

/// Write the per-protocol results file: one `name\tpackets\tbytes\tflows`
/// line per protocol that carried traffic.
pub fn write_results(
    writer: &mut impl Write,
    report: &Report,
) -> std::io::Result<()> {
    for p in &report.protocols {
        writeln!(
            writer,
            "{}\t{}\t{}\t{}",
            p.name, p.packets, p.bytes, p.flows
        )?;
    }
    Ok(())
}

/// Output a horizontal rule to the given writer.
pub fn write_hr(t: &mut impl Write) -> std::io::Result<()> {
    writeln!(t, "{:-<70}", "-")
}
