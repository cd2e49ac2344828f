// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Stored captures in pcap or pcapng format.

use super::CaptureError;
use super::CapturedPacket;
use super::Next;
use super::PacketSource;
use super::SourceKind;
use crate::time::MICROS;
use crate::time::Moment;
use pcap_parser::Block;
use pcap_parser::Linktype;
use pcap_parser::PcapBlockOwned;
use pcap_parser::PcapError;
use pcap_parser::traits::PcapReaderIterator;
use pcap_parser::create_reader;
use std::fs::File;

const READ_BUF_SIZE: usize = 65536;
/// Blocks larger than this are treated as corruption.
const MAX_READ_BUF_SIZE: usize = 16 * 1024 * 1024;

const PCAP_MAGIC_NANOS: u32 = 0xa1b2_3c4d;
const PCAP_MAGIC_NANOS_SWAPPED: u32 = 0x4d3c_b2a1;

/// Timestamp units of one pcapng interface.
#[derive(Clone, Copy, Debug)]
struct Iface {
    linktype: Linktype,
    units_per_sec: u64,
    offset_secs: i64,
}

impl Iface {
    fn new(linktype: Linktype, tsresol: u8, offset_secs: i64) -> Self {
        let units_per_sec = if tsresol & 0x80 != 0 {
            1u64 << u32::from(tsresol & 0x7F).min(63)
        } else {
            10u64.saturating_pow(u32::from(tsresol).min(19))
        };
        Self { linktype, units_per_sec: units_per_sec.max(1), offset_secs }
    }

    fn moment(&self, ts_high: u32, ts_low: u32) -> Moment {
        let raw = (u64::from(ts_high) << 32) | u64::from(ts_low);
        let micros = u128::from(raw) * u128::from(MICROS)
            / u128::from(self.units_per_sec);
        let offset = self.offset_secs.saturating_mul(MICROS as i64);
        let micros = (micros as i128 + i128::from(offset)).max(0);
        Moment::from_micros(micros as u64)
    }
}

#[derive(Clone, Copy, Debug)]
struct LegacyInfo {
    linktype: Linktype,
    nanos: bool,
}

/// The reader's view of the capture format, updated as header blocks
/// go by.
#[derive(Debug, Default)]
struct Format {
    legacy: Option<LegacyInfo>,
    ifaces: Vec<Iface>,
    last_ts: Moment,
}

impl Format {
    fn on_block(
        &mut self,
        block: PcapBlockOwned<'_>,
    ) -> Option<CapturedPacket> {
        match block {
            PcapBlockOwned::LegacyHeader(hdr) => {
                let nanos = hdr.magic_number == PCAP_MAGIC_NANOS
                    || hdr.magic_number == PCAP_MAGIC_NANOS_SWAPPED;
                self.legacy = Some(LegacyInfo { linktype: hdr.network, nanos });
                None
            }

            PcapBlockOwned::Legacy(b) => {
                let info = self.legacy?;
                let sub =
                    if info.nanos { b.ts_usec / 1_000 } else { b.ts_usec };
                let ts =
                    Moment::from_timeval(u64::from(b.ts_sec), u64::from(sub));
                Some(self.packet(
                    ts,
                    info.linktype,
                    b.data,
                    b.caplen,
                    b.origlen,
                ))
            }

            PcapBlockOwned::NG(Block::SectionHeader(_)) => {
                self.ifaces.clear();
                None
            }

            PcapBlockOwned::NG(Block::InterfaceDescription(idb)) => {
                self.ifaces.push(Iface::new(
                    idb.linktype,
                    idb.if_tsresol,
                    idb.if_tsoffset,
                ));
                None
            }

            PcapBlockOwned::NG(Block::EnhancedPacket(epb)) => {
                let iface = *self.ifaces.get(epb.if_id as usize)?;
                let ts = iface.moment(epb.ts_high, epb.ts_low);
                Some(self.packet(
                    ts,
                    iface.linktype,
                    epb.data,
                    epb.caplen,
                    epb.origlen,
                ))
            }

            PcapBlockOwned::NG(Block::SimplePacket(spb)) => {
                let iface = *self.ifaces.first()?;
                let ts = self.last_ts;
                Some(self.packet(
                    ts,
                    iface.linktype,
                    spb.data,
                    spb.origlen,
                    spb.origlen,
                ))
            }

            _ => None,
        }
    }

    fn packet(
        &mut self,
        ts: Moment,
        linktype: Linktype,
        data: &[u8],
        caplen: u32,
        origlen: u32,
    ) -> CapturedPacket {
        // pcapng pads packet data to 32 bits.
        let len = (caplen as usize).min(data.len());
        self.last_ts = ts;
        CapturedPacket {
            ts,
            linktype,
            data: data[..len].to_vec(),
            wire_len: origlen,
        }
    }
}

pub struct FileSource {
    path: String,
    reader: Box<dyn PcapReaderIterator + Send>,
    buf_size: usize,
    format: Format,
    done: bool,
}

impl FileSource {
    pub fn open(path: &str) -> Result<Self, CaptureError> {
        let file =
            File::open(path).map_err(|e| CaptureError::from_io(path, e))?;
        let reader = create_reader(READ_BUF_SIZE, file).map_err(|e| {
            let reason = format!("not a pcap/pcapng capture ({e:?})");
            CaptureError::malformed(path, reason)
        })?;

        Ok(Self {
            path: path.to_string(),
            reader,
            buf_size: READ_BUF_SIZE,
            format: Format::default(),
            done: false,
        })
    }
}

impl PacketSource for FileSource {
    fn next_packet(&mut self) -> Result<Next, CaptureError> {
        let mut stalled = false;

        while !self.done {
            match self.reader.next() {
                Ok((offset, block)) => {
                    let pkt = self.format.on_block(block);
                    self.reader.consume(offset);
                    stalled = false;
                    if let Some(pkt) = pkt {
                        return Ok(Next::Packet(pkt));
                    }
                }

                Err(PcapError::Eof) | Err(PcapError::UnexpectedEof) => {
                    self.done = true;
                }

                // A refill that makes no progress means the file ends
                // mid-block.
                Err(PcapError::Incomplete(_)) if stalled => self.done = true,

                Err(PcapError::Incomplete(_)) => {
                    stalled = true;
                    if let Err(e) = self.reader.refill() {
                        let reason = format!("read failed: {e:?}");
                        self.done = true;
                        return Err(CaptureError::malformed(&self.path, reason));
                    }
                }

                Err(PcapError::BufferTooSmall) => {
                    let new_size = (self.buf_size * 2).min(MAX_READ_BUF_SIZE);
                    if !self.reader.grow(new_size) {
                        let reason = format!(
                            "block larger than {MAX_READ_BUF_SIZE} bytes"
                        );
                        self.done = true;
                        return Err(CaptureError::malformed(&self.path, reason));
                    }
                    self.buf_size = new_size;
                    stalled = false;
                    if let Err(e) = self.reader.refill() {
                        let reason = format!("read failed: {e:?}");
                        self.done = true;
                        return Err(CaptureError::malformed(&self.path, reason));
                    }
                }

                Err(e) => {
                    let reason = format!("bad block: {e:?}");
                    self.done = true;
                    return Err(CaptureError::malformed(&self.path, reason));
                }
            }
        }

        Ok(Next::End)
    }

    fn stop(&mut self) {
        self.done = true;
    }

    fn kind(&self) -> SourceKind {
        SourceKind::File
    }

    fn describe(&self) -> &str {
        &self.path
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn pcapng_resolution() {
        let micros = Iface::new(Linktype::ETHERNET, 6, 0);
        assert_eq!(micros.moment(0, 1_500_000), Moment::from_micros(1_500_000));

        let nanos = Iface::new(Linktype::ETHERNET, 9, 0);
        assert_eq!(
            nanos.moment(0, 1_500_000_000),
            Moment::from_micros(1_500_000)
        );

        let binary = Iface::new(Linktype::ETHERNET, 0x80 | 10, 2);
        assert_eq!(binary.moment(0, 1024), Moment::from_micros(3_000_000));
    }

    #[test]
    fn garbage_is_malformed() {
        let path = std::env::temp_dir()
            .join(format!("flowscope-garbage-{}.pcap", std::process::id()));
        std::fs::write(&path, b"this is not a capture file at all").unwrap();
        let res = FileSource::open(path.to_str().unwrap());
        std::fs::remove_file(&path).unwrap();
        assert!(matches!(res, Err(CaptureError::Malformed { .. })));
    }

    #[test]
    fn missing_file_not_found() {
        let res = FileSource::open("/nonexistent/flowscope/nothing.pcap");
        assert!(matches!(res, Err(CaptureError::NotFound(_))));
    }
}
