// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Sources backed by libpcap: live interfaces, and stored captures
//! that need a BPF filter applied.
//!
//! Without the `live` feature no live interface can be opened and
//! filter expressions are rejected.

use super::CaptureError;
use super::PacketSource;
use crate::config::ReaderConfig;

cfg_if! {
    if #[cfg(feature = "live")] {
        use super::CapturedPacket;
        use super::Next;
        use super::SourceKind;
        use crate::time::Moment;
        use pcap::Activated;
        use pcap::Capture;
        use pcap_parser::Linktype;

        /// A libpcap capture handle.
        pub struct LibpcapSource {
            name: String,
            kind: SourceKind,
            cap: Option<Capture<dyn Activated>>,
            linktype: Linktype,
        }

        impl LibpcapSource {
            fn new(
                name: &str,
                kind: SourceKind,
                cap: Capture<dyn Activated>,
            ) -> Self {
                let linktype = Linktype(cap.get_datalink().0);
                Self { name: name.to_string(), kind, cap: Some(cap), linktype }
            }
        }

        fn pcap_err(id: &str, err: pcap::Error) -> CaptureError {
            match err {
                pcap::Error::PcapError(msg)
                    if msg.to_ascii_lowercase().contains("permission") =>
                {
                    CaptureError::PermissionDenied(id.to_string())
                }
                pcap::Error::PcapError(msg)
                    if msg.to_ascii_lowercase().contains("no such device") =>
                {
                    CaptureError::NotFound(id.to_string())
                }
                other => CaptureError::Live(format!("{id}: {other}")),
            }
        }

        fn bad_filter(expr: &str, err: pcap::Error) -> CaptureError {
            CaptureError::InvalidFilter {
                filter: expr.to_string(),
                reason: err.to_string(),
            }
        }

        impl PacketSource for LibpcapSource {
            fn next_packet(&mut self) -> Result<Next, CaptureError> {
                let Some(cap) = self.cap.as_mut() else {
                    return Ok(Next::End);
                };

                match cap.next_packet() {
                    Ok(p) => {
                        let ts = Moment::from_timeval(
                            p.header.ts.tv_sec as u64,
                            p.header.ts.tv_usec as u64,
                        );
                        Ok(Next::Packet(CapturedPacket {
                            ts,
                            linktype: self.linktype,
                            data: p.data.to_vec(),
                            wire_len: p.header.len,
                        }))
                    }
                    Err(pcap::Error::TimeoutExpired) => Ok(Next::Idle),
                    Err(pcap::Error::NoMorePackets) => Ok(Next::End),
                    Err(e) => Err(pcap_err(&self.name, e)),
                }
            }

            fn stop(&mut self) {
                self.cap = None;
            }

            fn kind(&self) -> SourceKind {
                self.kind
            }

            fn describe(&self) -> &str {
                &self.name
            }
        }

        pub fn open_device(
            id: &str,
            filter: Option<&str>,
            cfg: &ReaderConfig,
        ) -> Result<Box<dyn PacketSource>, CaptureError> {
            let mut cap = Capture::from_device(id)
                .map_err(|e| pcap_err(id, e))?
                .promisc(cfg.promisc)
                .snaplen(cfg.snaplen as i32)
                .timeout(cfg.live_timeout_ms as i32)
                .open()
                .map_err(|e| pcap_err(id, e))?;

            if let Some(expr) = filter {
                cap.filter(expr, true).map_err(|e| bad_filter(expr, e))?;
            }

            Ok(Box::new(LibpcapSource::new(id, SourceKind::Live, cap.into())))
        }

        pub fn open_filtered_file(
            path: &str,
            expr: &str,
        ) -> Result<Box<dyn PacketSource>, CaptureError> {
            std::fs::metadata(path)
                .map_err(|e| CaptureError::from_io(path, e))?;

            let mut cap = Capture::from_file(path)
                .map_err(|e| CaptureError::malformed(path, e))?;
            cap.filter(expr, true).map_err(|e| bad_filter(expr, e))?;

            Ok(Box::new(LibpcapSource::new(path, SourceKind::File, cap.into())))
        }
    } else {
        pub fn open_device(
            id: &str,
            _filter: Option<&str>,
            _cfg: &ReaderConfig,
        ) -> Result<Box<dyn PacketSource>, CaptureError> {
            Err(CaptureError::Live(format!(
                "{id}: not a file, and built without the `live` feature"
            )))
        }

        pub fn open_filtered_file(
            _path: &str,
            expr: &str,
        ) -> Result<Box<dyn PacketSource>, CaptureError> {
            Err(CaptureError::InvalidFilter {
                filter: expr.to_string(),
                reason: "filters need libpcap; rebuild with the `live` feature"
                    .to_string(),
            })
        }
    }
}
