// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

use criterion::BatchSize;
use criterion::Criterion;
use criterion::criterion_group;
use criterion::criterion_main;
use flowscope::engine::Classifier;
use flowscope::engine::FlowTable;
use flowscope::engine::ProtocolStats;
use flowscope::engine::SignatureEngine;
use flowscope::engine::packet::decode;
use flowscope::engine::reaper::IdleReaper;
use flowscope::time::Moment;
use flowscope_bench::MeasurementInfo;
use flowscope_bench::Workload;
use pcap_parser::Linktype;
use std::hint::black_box;

const NUM_ROOTS: usize = 512;
const FLOWS: usize = 10_000;

pub fn lookup<M: MeasurementInfo + 'static>(c: &mut Criterion<M>) {
    let keys = Workload::new(7).keys(FLOWS);
    let mut engine = SignatureEngine::default();
    let mut table = FlowTable::new(NUM_ROOTS, FLOWS as u64);
    let now = Moment::from_millis(1);

    for key in &keys {
        let _ = table
            .lookup_or_create(*key, now, || engine.create_flow_state(key));
    }

    let mut c = c.benchmark_group(M::label());

    c.bench_function("lookup hit", |b| {
        let mut i = 0;
        b.iter(|| {
            i = (i + 1) % keys.len();
            let key = keys[i];
            let res = table.lookup_or_create(key, now, Default::default);
            black_box(res.is_ok())
        })
    });

    c.bench_function("insert 10k", |b| {
        b.iter_batched(
            || FlowTable::new(NUM_ROOTS, FLOWS as u64),
            |mut t| {
                for key in &keys {
                    let _ = t.lookup_or_create(*key, now, || {
                        engine.create_flow_state(key)
                    });
                }
                t
            },
            BatchSize::LargeInput,
        )
    });
}

pub fn sweep<M: MeasurementInfo + 'static>(c: &mut Criterion<M>) {
    let keys = Workload::new(11).keys(FLOWS);
    let reaper = IdleReaper::new(1024, 30_000);

    let mut c = c.benchmark_group(M::label());

    c.bench_function("idle sweep 10k", |b| {
        b.iter_batched(
            || {
                let mut engine = SignatureEngine::default();
                let mut table = FlowTable::new(NUM_ROOTS, FLOWS as u64);
                for key in &keys {
                    let _ = table.lookup_or_create(*key, Moment::ZERO, || {
                        engine.create_flow_state(key)
                    });
                }
                table.advance_time(Moment::from_millis(60_000));
                (table, engine, ProtocolStats::default())
            },
            |(mut table, mut engine, mut stats)| {
                while !table.is_empty() {
                    reaper.sweep(&mut table, &mut engine, &mut stats, true);
                }
                (table, engine, stats)
            },
            BatchSize::LargeInput,
        )
    });
}

pub fn decode_frames<M: MeasurementInfo + 'static>(c: &mut Criterion<M>) {
    let frames = Workload::new(3).frames(1_000, 100);

    let mut c = c.benchmark_group(M::label());

    c.bench_function("decode 1k frames", |b| {
        b.iter(|| {
            for f in &frames {
                black_box(decode(Linktype::ETHERNET, f).is_ok());
            }
        })
    });
}

criterion_group!(flow_table, lookup, sweep, decode_frames);
criterion_main!(flow_table);
