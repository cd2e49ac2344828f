// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Routines for building packet capture files.

use pcap_parser::Linktype;
use pcap_parser::ToVec;
use pcap_parser::pcap;
use pcap_parser::pcap::LegacyPcapBlock;
use pcap_parser::pcap::PcapHeader;
use std::fs::File;
use std::io::Write;
use std::path::Path;

/// Split a capture timestamp in microseconds into seconds and
/// microseconds.
fn timeval(ts_micros: u64) -> (u32, u32) {
    ((ts_micros / 1_000_000) as u32, (ts_micros % 1_000_000) as u32)
}

/// Read back every frame of a legacy pcap file written by
/// [`PcapBuilder`], as `(ts_micros, bytes)` pairs.
pub fn read_frames(path: &Path) -> Vec<(u64, Vec<u8>)> {
    let bytes = std::fs::read(path).unwrap();
    let (mut rest, _hdr) = match pcap::parse_pcap_header(&bytes) {
        Ok(v) => v,
        Err(e) => panic!("failed to get header: {e:?}"),
    };

    let mut frames = vec![];
    while !rest.is_empty() {
        match pcap::parse_pcap_frame(rest) {
            Ok((next, block)) => {
                let ts = u64::from(block.ts_sec) * 1_000_000
                    + u64::from(block.ts_usec);
                frames.push((ts, block.data.to_vec()));
                rest = next;
            }

            Err(e) => panic!("failed to get next block: {e:?}"),
        }
    }
    frames
}

/// Build a packet capture file from a series of frames.
pub struct PcapBuilder {
    file: File,
}

impl PcapBuilder {
    /// Create a new pcap builder for Ethernet frames, writing all
    /// captures to `path`.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self::with_linktype(path, Linktype::ETHERNET)
    }

    pub fn with_linktype<P: AsRef<Path>>(path: P, network: Linktype) -> Self {
        let mut file = File::create(path).unwrap();

        let mut hdr = PcapHeader {
            magic_number: 0xa1b2c3d4,
            version_major: 2,
            version_minor: 4,
            thiszone: 0,
            sigfigs: 0,
            snaplen: 65535,
            network,
        };

        file.write_all(&hdr.to_vec().unwrap()).unwrap();

        Self { file }
    }

    /// Add a frame captured at `ts_micros` to the capture.
    pub fn add_frame(&mut self, ts_micros: u64, frame: &[u8]) -> &mut Self {
        let (ts_sec, ts_usec) = timeval(ts_micros);
        let mut block = LegacyPcapBlock {
            ts_sec,
            ts_usec,
            caplen: frame.len() as u32,
            origlen: frame.len() as u32,
            data: frame,
        };

        self.file.write_all(&block.to_vec().unwrap()).unwrap();
        self
    }
}
