// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Workload generators shared by the flow engine benchmarks.

use criterion::measurement::Measurement;
use criterion::measurement::WallTime;
use flowscope::engine::FlowKey;
use flowscope::engine::flow_key::PROTO_TCP;
use flowscope::engine::flow_key::PROTO_UDP;
use flowscope_test_utils::Endpoint;
use flowscope_test_utils::frame;
use rand::Rng;
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::net::Ipv4Addr;

// A bare DNS query header.
const DNS_HEADER: &[u8] = &[
    0x12, 0x34, 0x01, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];

/// Additional labelling information for [`Measurement`]s for
/// pretty-printing and grouping.
pub trait MeasurementInfo: Measurement {
    fn label() -> &'static str;
}

impl MeasurementInfo for WallTime {
    fn label() -> &'static str {
        "wallclock"
    }
}

/// A deterministic source of random conversations.
pub struct Workload {
    rng: StdRng,
}

impl Workload {
    pub fn new(seed: u64) -> Self {
        Self { rng: StdRng::seed_from_u64(seed) }
    }

    fn endpoint(&mut self) -> (Ipv4Addr, u16) {
        let ip = Ipv4Addr::from(self.rng.random::<u32>() | 0x0A00_0000);
        (ip, self.rng.random_range(1024..u16::MAX))
    }

    /// `n` flow keys, mostly distinct.
    pub fn keys(&mut self, n: usize) -> Vec<FlowKey> {
        (0..n)
            .map(|_| {
                let (a, pa) = self.endpoint();
                let (b, pb) = self.endpoint();
                let proto = if self.rng.random_bool(0.7) {
                    PROTO_TCP
                } else {
                    PROTO_UDP
                };
                FlowKey::new_v4(proto, a, pa, b, pb, 0).0
            })
            .collect()
    }

    /// `n` Ethernet frames spread over `conversations` conversations.
    pub fn frames(&mut self, n: usize, conversations: usize) -> Vec<Vec<u8>> {
        let ends: Vec<_> = (0..conversations.max(1))
            .map(|_| {
                let (a, pa) = self.endpoint();
                let (b, pb) = self.endpoint();
                (Endpoint::new(a, pa), Endpoint::new(b, pb))
            })
            .collect();

        (0..n)
            .map(|i| {
                let (a, b) = ends[i % ends.len()];
                let (src, dst) =
                    if self.rng.random_bool(0.5) { (a, b) } else { (b, a) };
                if i % 3 == 0 {
                    frame::udp(src, dst, DNS_HEADER)
                } else {
                    frame::tcp(src, dst, b"GET / HTTP/1.1\r\n\r\n")
                }
            })
            .collect()
    }
}
