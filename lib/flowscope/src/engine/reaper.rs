// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Bounded idle-flow eviction.

use super::classify::Classifier;
use super::classify::finalize;
use super::flow_table::FlowTable;
use super::flow_table::IdleQueue;
use super::flow_table::Visit;
use super::stat::ProtocolStats;

/// What a single sweep accomplished.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SweepOutcome {
    pub reaped: usize,
    /// Reaped flows whose protocol was still unknown after
    /// finalization.
    pub unknown: usize,
}

/// Evicts flows that have been quiet for longer than `max_idle_ms`,
/// at most `budget` of them per sweep.
#[derive(Clone, Copy, Debug)]
pub struct IdleReaper {
    budget: usize,
    max_idle_ms: u64,
}

impl IdleReaper {
    pub fn new(budget: usize, max_idle_ms: u64) -> Self {
        Self { budget: budget.max(1), max_idle_ms }
    }

    pub fn budget(&self) -> usize {
        self.budget
    }

    pub fn max_idle_ms(&self) -> u64 {
        self.max_idle_ms
    }

    /// Sweep `table` once, relative to the table's own clock.
    ///
    /// Every evicted flow is finalized before it leaves the table, and
    /// its engine state is handed back to `engine`. Idle flows beyond
    /// the budget stay put for the next sweep.
    pub fn sweep<C: Classifier>(
        &self,
        table: &mut FlowTable<C::FlowState>,
        engine: &mut C,
        stats: &mut ProtocolStats,
        guess: bool,
    ) -> SweepOutcome {
        let now = table.current_time();
        let max_idle_ms = self.max_idle_ms;
        let mut queue = IdleQueue::new(self.budget);
        let mut outcome = SweepOutcome::default();

        table.for_each(&mut queue, |rec| {
            if !rec.is_idle(now, max_idle_ms) {
                return Visit::Keep;
            }

            let id = finalize(rec, engine, stats, guess);
            stats.flow_count = stats.flow_count.saturating_sub(1);
            if id.is_unknown() {
                stats.unknown_flows_expired = true;
                outcome.unknown += 1;
            }
            Visit::Remove
        });

        outcome.reaped = table.remove_queued(&mut queue, |s| engine.destroy(s));
        outcome
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::engine::classify::Verdict;
    use crate::engine::classify::test::Scripted;
    use crate::engine::classify::test::tcp_key;
    use crate::engine::flow_key::FlowDirection;
    use crate::engine::protocol::ProtocolId;
    use crate::time::Moment;

    const MAX_IDLE: u64 = 30_000;

    fn populate(
        table: &mut FlowTable<u32>,
        engine: &mut Scripted,
        stats: &mut ProtocolStats,
        flows: u8,
        at: Moment,
    ) {
        for n in 0..flows {
            let key = tcp_key(n);
            let (rec, _) = table
                .lookup_or_create(key, at, || engine.create_flow_state(&key))
                .unwrap();
            rec.hit(at, 100, FlowDirection::AtoB);
            stats.flow_count += 1;
        }
        table.advance_time(at);
    }

    #[test]
    fn idle_flow_reaped_once() {
        let mut table = FlowTable::new(16, 100);
        let mut engine = Scripted::new();
        engine.on_give_up = Verdict::Definitive(ProtocolId(1));
        let mut stats = ProtocolStats::default();
        let reaper = IdleReaper::new(1024, MAX_IDLE);
        let t = Moment::from_millis(1_000);
        populate(&mut table, &mut engine, &mut stats, 1, t);

        // Exactly at the limit is not yet idle.
        table.advance_time(Moment::from_millis(1_000 + MAX_IDLE));
        let out = reaper.sweep(&mut table, &mut engine, &mut stats, true);
        assert_eq!(out.reaped, 0);
        assert_eq!(table.len(), 1);

        table.advance_time(Moment::from_millis(1_000 + MAX_IDLE + 1));
        let out = reaper.sweep(&mut table, &mut engine, &mut stats, true);
        assert_eq!(out, SweepOutcome { reaped: 1, unknown: 0 });
        assert_eq!(engine.give_ups, 1);
        assert_eq!(engine.destroyed, 1);
        assert_eq!(stats.flow_count, 0);
        assert!(!stats.unknown_flows_expired);

        let counter = stats.protocol(ProtocolId(1));
        assert_eq!(counter.flows, 1);
        assert_eq!(counter.packets, 1);
        assert_eq!(counter.bytes, 100);

        let out = reaper.sweep(&mut table, &mut engine, &mut stats, true);
        assert_eq!(out.reaped, 0);
        assert_eq!(engine.destroyed, 1);
        assert_eq!(stats.protocol(ProtocolId(1)).flows, 1);
    }

    #[test]
    fn budget_bounds_each_sweep() {
        let mut table = FlowTable::new(4, 100);
        let mut engine = Scripted::new();
        let mut stats = ProtocolStats::default();
        let reaper = IdleReaper::new(2, MAX_IDLE);
        let start = Moment::from_millis(1);
        populate(&mut table, &mut engine, &mut stats, 5, start);
        table.advance_time(Moment::from_millis(MAX_IDLE + 2));

        let first = reaper.sweep(&mut table, &mut engine, &mut stats, false);
        assert_eq!(first.reaped, 2);
        assert_eq!(table.len(), 3);

        let second = reaper.sweep(&mut table, &mut engine, &mut stats, false);
        let third = reaper.sweep(&mut table, &mut engine, &mut stats, false);
        assert_eq!(second.reaped, 2);
        assert_eq!(third.reaped, 1);
        assert!(table.is_empty());

        assert_eq!(engine.destroyed, 5);
        assert_eq!(stats.protocol(ProtocolId::UNKNOWN).flows, 5);
        assert_eq!(stats.flow_count, 0);
        assert!(stats.unknown_flows_expired);
    }

    #[test]
    fn active_flows_survive() {
        let mut table = FlowTable::new(4, 100);
        let mut engine = Scripted::new();
        let mut stats = ProtocolStats::default();
        let reaper = IdleReaper::new(8, MAX_IDLE);
        let start = Moment::from_millis(1);
        populate(&mut table, &mut engine, &mut stats, 3, start);

        let key = tcp_key(0);
        let late = Moment::from_millis(MAX_IDLE);
        let (rec, _) = table.lookup_or_create(key, late, || 0).unwrap();
        rec.hit(late, 10, FlowDirection::BtoA);
        table.advance_time(Moment::from_millis(MAX_IDLE + 2));

        let out = reaper.sweep(&mut table, &mut engine, &mut stats, false);
        assert_eq!(out.reaped, 2);
        assert!(table.get(&key).is_some());
    }
}
