// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! The capture worker.
//!
//! A [`Worker`] owns everything one capture thread touches: its packet
//! source, its flow table, its classification engine and its counters.
//! Nothing in here is shared with any other worker; the only outside
//! state a worker reads is the global [`Shutdown`] flag.

use crate::Result;
use crate::capture::Advance;
use crate::capture::CapturedPacket;
use crate::capture::Next;
use crate::capture::PacketSource;
use crate::capture::SourceKind;
use crate::capture::open_source;
use crate::config::ReaderConfig;
use crate::engine::classify::Classifier;
use crate::engine::classify::Verdict;
use crate::engine::classify::finalize;
use crate::engine::flow_table::FlowTable;
use crate::engine::packet::decode;
use crate::engine::reaper::IdleReaper;
use crate::engine::stat::ProtocolStats;
use crate::engine::stat::WIRE_OVERHEAD;
use crate::report::FlowSummary;
use crate::shutdown::Shutdown;
use crate::time::Moment;
use core::fmt;
use slog::Logger;
use slog::debug;
use slog::info;
use slog::o;
use slog::trace;
use slog::warn;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WorkerState {
    Init,
    OpeningSource,
    Running,
    PlaylistAdvance,
    Stopped,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::Init => "INIT",
            Self::OpeningSource => "OPENING_SOURCE",
            Self::Running => "RUNNING",
            Self::PlaylistAdvance => "PLAYLIST_ADVANCE",
            Self::Stopped => "STOPPED",
        };
        write!(f, "{s}")
    }
}

/// Everything a stopped worker hands back to the orchestrator.
#[derive(Debug)]
pub struct WorkerOutcome {
    pub id: usize,
    pub source: String,
    pub stats: ProtocolStats,
    /// Flows still live when the worker stopped, finalized.
    pub flows: Vec<FlowSummary>,
    pub peak_flows: u64,
}

pub struct Worker<C: Classifier> {
    id: usize,
    state: WorkerState,
    source: Box<dyn PacketSource>,
    source_name: String,
    table: FlowTable<C::FlowState>,
    engine: C,
    stats: ProtocolStats,
    reaper: IdleReaper,
    idle_scan_period_ms: u64,
    guess: bool,
    last_sweep: Moment,
    deadline: Option<Moment>,
    shutdown: Shutdown,
    scratch: Vec<u8>,
    warned_full: bool,
    log: Logger,
}

impl<C: Classifier> Worker<C> {
    /// Allocate a worker and open `source_id` for it.
    ///
    /// # Errors
    ///
    /// [`crate::Error::SourceUnavailable`] if the source cannot be opened as a
    /// live capture, a stored capture, or a play-list.
    pub fn open(
        id: usize,
        source_id: &str,
        filter: Option<&str>,
        cfg: &ReaderConfig,
        engine: C,
        shutdown: Shutdown,
        log: &Logger,
    ) -> Result<Self> {
        let log =
            log.new(o!("worker" => id, "source" => source_id.to_string()));
        debug!(log, "worker state"; "state" => %WorkerState::OpeningSource);
        let source = open_source(source_id, filter, cfg, &log)?;
        info!(log, "opened source"; "kind" => %source.kind());
        Ok(Self::build(id, source, cfg, engine, shutdown, log))
    }

    /// Allocate a worker around an already open source.
    pub fn with_source(
        id: usize,
        source: Box<dyn PacketSource>,
        cfg: &ReaderConfig,
        engine: C,
        shutdown: Shutdown,
        log: &Logger,
    ) -> Self {
        let source_id = source.describe().to_string();
        let log = log.new(o!("worker" => id, "source" => source_id));
        Self::build(id, source, cfg, engine, shutdown, log)
    }

    fn build(
        id: usize,
        source: Box<dyn PacketSource>,
        cfg: &ReaderConfig,
        engine: C,
        shutdown: Shutdown,
        log: Logger,
    ) -> Self {
        Self {
            id,
            state: WorkerState::Init,
            source_name: source.describe().to_string(),
            source,
            table: FlowTable::new(cfg.num_roots, cfg.max_flows),
            engine,
            stats: ProtocolStats::default(),
            reaper: IdleReaper::new(cfg.idle_scan_budget, cfg.max_idle_time_ms),
            idle_scan_period_ms: cfg.idle_scan_period_ms,
            guess: cfg.enable_guess,
            last_sweep: Moment::ZERO,
            deadline: None,
            shutdown,
            scratch: Vec::with_capacity(cfg.snaplen as usize),
            warned_full: false,
            log,
        }
    }

    /// Stop once a live packet is timestamped at or after `deadline`.
    pub fn set_deadline(&mut self, deadline: Option<Moment>) {
        self.deadline = deadline;
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn source_kind(&self) -> SourceKind {
        self.source.kind()
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn stats(&self) -> &ProtocolStats {
        &self.stats
    }

    pub fn table(&self) -> &FlowTable<C::FlowState> {
        &self.table
    }

    pub fn engine(&self) -> &C {
        &self.engine
    }

    fn set_state(&mut self, state: WorkerState) {
        debug!(self.log, "worker state"; "from" => %self.state, "to" => %state);
        self.state = state;
    }

    /// Pull packets until the source (and every remaining play-list
    /// entry) is exhausted or shutdown is requested.
    pub fn run(&mut self) {
        self.set_state(WorkerState::Running);

        loop {
            if self.shutdown.is_triggered() {
                debug!(self.log, "shutdown observed");
                break;
            }

            match self.source.next_packet() {
                Ok(Next::Packet(pkt)) => {
                    self.process(&pkt);
                    self.check_deadline(pkt.ts);
                }

                Ok(Next::Idle) => {}

                Ok(Next::End) => {
                    if !self.advance() {
                        break;
                    }
                }

                Err(e) => {
                    warn!(self.log, "capture error, abandoning source";
                        "err" => %e);
                    if !self.advance() {
                        break;
                    }
                }
            }
        }

        self.source.stop();
        self.set_state(WorkerState::Stopped);
        info!(self.log, "worker stopped";
            "packets" => self.stats.raw_packet_count,
            "live_flows" => self.table.len(),
            "total_flows" => self.stats.total_flows);
    }

    /// Move to the next play-list entry. Returns `false` once there is
    /// nothing left to read.
    fn advance(&mut self) -> bool {
        if self.source.kind() != SourceKind::Playlist {
            return false;
        }

        self.set_state(WorkerState::PlaylistAdvance);
        loop {
            match self.source.advance() {
                Advance::Opened(entry) => {
                    info!(self.log, "next play-list entry"; "entry" => entry);
                    self.set_state(WorkerState::Running);
                    return true;
                }

                Advance::Skipped { entry, cause } => {
                    warn!(self.log, "skipping unreadable play-list entry";
                        "entry" => entry, "err" => %cause);
                }

                Advance::Exhausted => return false,
            }
        }
    }

    fn check_deadline(&mut self, ts: Moment) {
        let Some(deadline) = self.deadline else {
            return;
        };

        if self.source.kind() == SourceKind::Live
            && ts >= deadline
            && self.shutdown.trigger()
        {
            info!(self.log, "capture duration reached");
        }
    }

    /// Account for one captured frame.
    pub fn process(&mut self, pkt: &CapturedPacket) {
        let wire_len = pkt.wire_len;
        let stats = &mut self.stats;

        stats.raw_packet_count += 1;
        stats.total_wire_bytes += u64::from(wire_len) + WIRE_OVERHEAD;
        stats.record_packet_len(wire_len);
        if self.source.kind() != SourceKind::Live {
            stats.record_capture_time(pkt.ts);
        }

        let meta = match decode(pkt.linktype, &pkt.data) {
            Ok(meta) => meta,
            Err(e) => {
                stats.discarded_bytes += u64::from(wire_len);
                trace!(self.log, "discarding frame"; "err" => %e);
                return;
            }
        };

        stats.ip_packet_count += 1;
        stats.total_ip_bytes += u64::from(meta.ip_len);
        stats.tcp_count += u64::from(meta.is_tcp());
        stats.udp_count += u64::from(meta.is_udp());
        stats.vlan_count += u64::from(meta.vlan);
        stats.mpls_count += u64::from(meta.mpls);
        stats.pppoe_count += u64::from(meta.pppoe);
        stats.fragmented_count += u64::from(meta.fragmented);

        self.table.advance_time(pkt.ts);

        let key = meta.key;
        let engine = &mut self.engine;
        let res = self
            .table
            .lookup_or_create(key, pkt.ts, || engine.create_flow_state(&key));

        let rec = match res {
            Ok((rec, created)) => {
                if created {
                    stats.flow_count += 1;
                    stats.total_flows += 1;
                }
                rec
            }

            Err(e) => {
                stats.discarded_bytes += u64::from(wire_len);
                if !self.warned_full {
                    self.warned_full = true;
                    warn!(self.log, "dropping packets of new flows";
                        "err" => %e);
                }
                return;
            }
        };

        rec.hit(pkt.ts, u64::from(meta.ip_len), meta.dir);

        if !rec.detection_completed() {
            let payload = &pkt.data[meta.payload.clone()];
            self.scratch.clear();
            self.scratch.extend_from_slice(payload);

            let scratch = &mut self.scratch;
            let verdict =
                self.engine.feed(rec.state_mut(), &key, scratch, meta.dir);

            if scratch[..] != *payload {
                stats.engine_corruptions += 1;
                warn!(self.log, "classification engine modified packet bytes";
                    "flow" => %key, "packet" => stats.raw_packet_count);
            }

            match verdict {
                Verdict::Definitive(id) => rec.set_detected(id),
                Verdict::Unknown => rec.set_detection_completed(),
                Verdict::Pending => {}
            }
        }

        self.maybe_sweep();
    }

    fn maybe_sweep(&mut self) {
        let now = self.table.current_time();
        if now.delta_as_millis(self.last_sweep) < self.idle_scan_period_ms {
            return;
        }

        self.last_sweep = now;
        let out = self.reaper.sweep(
            &mut self.table,
            &mut self.engine,
            &mut self.stats,
            self.guess,
        );

        if out.reaped > 0 {
            trace!(self.log, "idle sweep";
                "reaped" => out.reaped, "unknown" => out.unknown,
                "live_flows" => self.table.len());
        }
    }

    /// Finalize every flow still in the table and hand back this
    /// worker's results. The table keeps its flows until the worker is
    /// dropped.
    pub fn finish(&mut self) -> WorkerOutcome {
        let mut flows = Vec::with_capacity(self.table.len() as usize);

        for rec in self.table.iter_mut() {
            finalize(rec, &mut self.engine, &mut self.stats, self.guess);
            flows.push(FlowSummary::new(rec));
        }

        WorkerOutcome {
            id: self.id,
            source: self.source_name.clone(),
            stats: self.stats.clone(),
            flows,
            peak_flows: self.table.peak(),
        }
    }
}

impl<C: Classifier> Drop for Worker<C> {
    fn drop(&mut self) {
        let engine = &mut self.engine;
        self.table.destroy_all(|s| engine.destroy(s));
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::engine::classify::test::Scripted;
    use crate::engine::flow_key::FiveTuple;
    use crate::engine::flow_key::FlowDirection;
    use crate::engine::flow_key::FlowKey;
    use crate::engine::protocol::ProtocolId;
    use crate::engine::protocol::ProtocolRegistry;
    use crate::engine::signature::SignatureEngine;
    use crate::Error;
    use crate::engine::flow_key::PROTO_TCP;
    use crate::engine::flow_key::PROTO_UDP;
    use flowscope_test_utils::Endpoint;
    use flowscope_test_utils::frame;
    use pcap_parser::Linktype;
    use std::collections::VecDeque;
    use std::net::Ipv4Addr;

    struct VecSource {
        kind: SourceKind,
        pkts: VecDeque<CapturedPacket>,
    }

    impl VecSource {
        fn boxed(
            kind: SourceKind,
            frames: Vec<(u64, Vec<u8>)>,
        ) -> Box<dyn PacketSource> {
            let pkts = frames
                .into_iter()
                .map(|(ms, data)| CapturedPacket {
                    ts: Moment::from_millis(ms),
                    linktype: Linktype::ETHERNET,
                    wire_len: data.len() as u32,
                    data,
                })
                .collect();
            Box::new(Self { kind, pkts })
        }
    }

    impl PacketSource for VecSource {
        fn next_packet(
            &mut self,
        ) -> core::result::Result<Next, crate::capture::CaptureError> {
            Ok(self.pkts.pop_front().map_or(Next::End, Next::Packet))
        }

        fn stop(&mut self) {
            self.pkts.clear();
        }

        fn kind(&self) -> SourceKind {
            self.kind
        }

        fn describe(&self) -> &str {
            "vec"
        }
    }

    /// An engine that writes into the bytes it is handed.
    struct Scribbler(Scripted);

    impl Classifier for Scribbler {
        type FlowState = u32;

        fn create_flow_state(&mut self, key: &FlowKey) -> u32 {
            self.0.create_flow_state(key)
        }

        fn feed(
            &mut self,
            state: &mut u32,
            key: &FlowKey,
            payload: &mut [u8],
            dir: FlowDirection,
        ) -> Verdict {
            if let Some(b) = payload.first_mut() {
                *b ^= 0xFF;
            }
            self.0.feed(state, key, payload, dir)
        }

        fn give_up(&mut self, state: &mut u32) -> Verdict {
            self.0.give_up(state)
        }

        fn guess(&self, tuple: &FiveTuple) -> Option<ProtocolId> {
            self.0.guess(tuple)
        }

        fn destroy(&mut self, state: u32) {
            self.0.destroy(state)
        }

        fn registry(&self) -> &ProtocolRegistry {
            self.0.registry()
        }
    }

    fn ep(last: u8, port: u16) -> Endpoint {
        Endpoint::new(Ipv4Addr::new(10, 0, 0, last), port)
    }

    fn log() -> Logger {
        Logger::root(slog::Discard, o!())
    }

    fn worker<C: Classifier>(
        cfg: &ReaderConfig,
        engine: C,
        kind: SourceKind,
        frames: Vec<(u64, Vec<u8>)>,
    ) -> Worker<C> {
        let src = VecSource::boxed(kind, frames);
        Worker::with_source(0, src, cfg, engine, Shutdown::new(), &log())
    }

    fn three_packets() -> Vec<(u64, Vec<u8>)> {
        let client = ep(1, 54321);
        let server = ep(2, 80);
        vec![
            (1_000, frame::tcp(client, server, b"GET / HTTP/1.1\r\n\r\n")),
            (1_001, frame::tcp(server, client, b"HTTP/1.1 200 OK\r\n\r\n")),
            (1_002, frame::udp(ep(3, 40000), ep(4, 53), b"")),
        ]
    }

    #[test]
    fn three_packets_two_flows() {
        let cfg = ReaderConfig::default();
        let engine = SignatureEngine::default();
        let mut w = worker(&cfg, engine, SourceKind::File, three_packets());
        w.run();
        assert_eq!(w.state(), WorkerState::Stopped);

        let out = w.finish();
        assert_eq!(out.flows.len(), 2);
        assert_eq!(out.stats.ip_packet_count, 3);
        assert_eq!(out.stats.tcp_count, 2);
        assert_eq!(out.stats.udp_count, 1);
        assert_eq!(out.stats.total_flows, 2);
        assert_eq!(out.stats.capture_start, Some(Moment::from_millis(1_000)));
        assert_eq!(out.stats.capture_end, Some(Moment::from_millis(1_002)));

        let tcp = out.flows.iter().find(|f| f.key.proto == PROTO_TCP).unwrap();
        assert_eq!(tcp.packets, 2);
        let udp = out.flows.iter().find(|f| f.key.proto == PROTO_UDP).unwrap();
        assert_eq!(udp.packets, 1);

        let http = w.engine().registry().lookup("HTTP").unwrap();
        assert_eq!(tcp.protocol, http);
        assert_eq!(out.stats.protocol(http).flows, 1);
    }

    #[test]
    fn capacity_exhaustion_discards() {
        let cfg = ReaderConfig { max_flows: 1, ..Default::default() };
        let first = frame::tcp(ep(1, 1000), ep(2, 80), b"x");
        let second = frame::udp(ep(3, 2000), ep(4, 53), b"yy");
        let second_len = second.len() as u64;

        let mut w = worker(
            &cfg,
            Scripted::new(),
            SourceKind::File,
            vec![(1, first), (2, second)],
        );
        w.run();

        assert_eq!(w.stats().discarded_bytes, second_len);
        assert_eq!(w.table().len(), 1);
        assert_eq!(w.stats().raw_packet_count, 2);
    }

    #[test]
    fn non_ip_is_discarded() {
        let cfg = ReaderConfig::default();
        let arp = frame::arp();
        let len = arp.len() as u64;
        let pkts = vec![(1, arp)];
        let mut w = worker(&cfg, Scripted::new(), SourceKind::File, pkts);
        w.run();

        assert_eq!(w.stats().discarded_bytes, len);
        assert_eq!(w.stats().ip_packet_count, 0);
        assert!(w.table().is_empty());
    }

    #[test]
    fn snapped_frame_is_tracked() {
        let cfg = ReaderConfig::default();
        let full = frame::tcp(ep(1, 54321), ep(2, 80), &[b'A'; 1000]);
        let wire_len = full.len() as u32;
        let mut w = worker(&cfg, Scripted::new(), SourceKind::File, vec![]);

        w.process(&CapturedPacket {
            ts: Moment::from_millis(1),
            linktype: Linktype::ETHERNET,
            data: full[..96].to_vec(),
            wire_len,
        });

        assert_eq!(w.stats().discarded_bytes, 0);
        assert_eq!(w.stats().ip_packet_count, 1);
        assert_eq!(w.stats().total_ip_bytes, u64::from(wire_len) - 14);
        assert_eq!(w.table().len(), 1);
    }

    #[test]
    fn engine_corruption_counted() {
        let cfg = ReaderConfig::default();
        let pkts = vec![
            (1, frame::tcp(ep(1, 1000), ep(2, 80), b"abc")),
            (2, frame::tcp(ep(1, 1000), ep(2, 80), b"")),
        ];
        let engine = Scribbler(Scripted::new());
        let mut w = worker(&cfg, engine, SourceKind::File, pkts);
        w.run();

        assert_eq!(w.stats().engine_corruptions, 1);
        assert_eq!(w.stats().ip_packet_count, 2);
    }

    #[test]
    fn shutdown_stops_before_first_packet() {
        let cfg = ReaderConfig::default();
        let pkts = three_packets();
        let mut w = worker(&cfg, Scripted::new(), SourceKind::File, pkts);
        w.shutdown.trigger();
        w.run();

        assert_eq!(w.state(), WorkerState::Stopped);
        assert_eq!(w.stats().raw_packet_count, 0);
    }

    #[test]
    fn live_deadline_raises_shutdown() {
        let cfg = ReaderConfig::default();
        let pkts = three_packets();
        let mut w = worker(&cfg, Scripted::new(), SourceKind::Live, pkts);
        w.set_deadline(Some(Moment::from_millis(1_000)));
        w.run();

        assert!(w.shutdown.is_triggered());
        assert_eq!(w.stats().raw_packet_count, 1);
        assert_eq!(w.stats().capture_start, None);
    }

    #[test]
    fn idle_flows_reaped_while_running() {
        let cfg = ReaderConfig::default();
        let idle_gap = cfg.max_idle_time_ms + 1;
        let pkts = vec![
            (
                1_000,
                frame::tcp(ep(1, 1000), ep(2, 80), b"GET / HTTP/1.0\r\n\r\n"),
            ),
            (1_000 + idle_gap, frame::udp(ep(3, 2000), ep(4, 9999), b"?")),
        ];
        let engine = SignatureEngine::default();
        let mut w = worker(&cfg, engine, SourceKind::File, pkts);
        w.run();

        let http = w.engine().registry().lookup("HTTP").unwrap();
        assert_eq!(w.stats().protocol(http).flows, 1);
        assert_eq!(w.table().len(), 1);
        assert_eq!(w.stats().flow_count, 1);

        let out = w.finish();
        assert_eq!(out.flows.len(), 1);
        assert_eq!(out.stats.total_flows, 2);
        assert_eq!(out.peak_flows, 2);
    }

    #[test]
    fn finish_is_repeatable() {
        let cfg = ReaderConfig::default();
        let pkts = three_packets();
        let mut w = worker(&cfg, Scripted::new(), SourceKind::File, pkts);
        w.run();

        let first = w.finish();
        let second = w.finish();
        assert_eq!(first.stats, second.stats);
        assert_eq!(first.stats.protocol(ProtocolId::UNKNOWN).flows, 2);
    }

    #[test]
    fn unavailable_source() {
        let cfg = ReaderConfig::default();
        let res = Worker::open(
            3,
            "/nonexistent/flowscope/missing",
            None,
            &cfg,
            Scripted::new(),
            Shutdown::new(),
            &log(),
        );
        assert!(matches!(res, Err(Error::SourceUnavailable { .. })));
    }
}
