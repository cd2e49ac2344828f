// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! The flow table forest.
//!
//! Each worker owns one [`FlowTable`]: a fixed number of independent
//! ordered roots, with a flow's root chosen by the CRC32 of its
//! [`FlowKey`]. A table never removes a record while it is being
//! walked. Visitors return a [`Visit`] decision, removals are parked
//! in an [`IdleQueue`], and [`FlowTable::remove_queued`] applies them
//! once the walk is done.
//!
//! The table is also the sole owner of each flow's engine state. The
//! only ways to get that state back out are [`FlowTable::remove_queued`]
//! and [`FlowTable::destroy_all`], both of which hand it to a release
//! callback exactly once.

use super::flow_key::FlowDirection;
use super::flow_key::FlowKey;
use super::protocol::ProtocolId;
use crate::Error;
use crate::Result;
use crate::time::Moment;
use core::fmt;
use std::collections::BTreeMap;
use std::collections::btree_map::Entry;

/// A visitor's decision about the record it was just shown.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Visit {
    Keep,
    /// Queue the record for removal.
    Remove,
    /// End the traversal.
    Stop,
}

/// Mutable state for one bidirectional flow.
pub struct FlowRecord<S> {
    key: FlowKey,
    first_seen: Moment,
    last_seen: Moment,
    packet_count: u64,
    byte_count: u64,
    dir_bytes: [u64; 2],
    engine_state: S,
    detected: Option<ProtocolId>,
    detection_completed: bool,
    finalized: Option<ProtocolId>,
}

impl<S> FlowRecord<S> {
    pub fn new(key: FlowKey, now: Moment, engine_state: S) -> Self {
        Self {
            key,
            first_seen: now,
            last_seen: now,
            packet_count: 0,
            byte_count: 0,
            dir_bytes: [0; 2],
            engine_state,
            detected: None,
            detection_completed: false,
            finalized: None,
        }
    }

    pub fn key(&self) -> &FlowKey {
        &self.key
    }

    pub fn first_seen(&self) -> Moment {
        self.first_seen
    }

    pub fn last_seen(&self) -> Moment {
        self.last_seen
    }

    pub fn packet_count(&self) -> u64 {
        self.packet_count
    }

    pub fn byte_count(&self) -> u64 {
        self.byte_count
    }

    pub fn dir_bytes(&self, dir: FlowDirection) -> u64 {
        self.dir_bytes[dir.index()]
    }

    /// Account for one packet of `bytes` IP bytes seen at `now`.
    ///
    /// A timestamp older than `last_seen` is counted but does not move
    /// `last_seen` backwards.
    pub fn hit(&mut self, now: Moment, bytes: u64, dir: FlowDirection) {
        self.last_seen = self.last_seen.max(now);
        self.packet_count += 1;
        self.byte_count += bytes;
        self.dir_bytes[dir.index()] += bytes;
    }

    /// Has this flow been quiet for longer than `max_idle_ms` as of
    /// `now`?
    pub fn is_idle(&self, now: Moment, max_idle_ms: u64) -> bool {
        self.last_seen.as_millis() + max_idle_ms < now.as_millis()
    }

    pub fn state_mut(&mut self) -> &mut S {
        &mut self.engine_state
    }

    /// Record a definitive verdict from the engine. No further packets
    /// of this flow are fed to the engine.
    pub fn set_detected(&mut self, id: ProtocolId) {
        self.detected = Some(id);
        self.detection_completed = true;
    }

    /// The engine declined to look at this flow any further.
    pub fn set_detection_completed(&mut self) {
        self.detection_completed = true;
    }

    pub fn detection_completed(&self) -> bool {
        self.detection_completed
    }

    pub fn detected_protocol(&self) -> Option<ProtocolId> {
        self.detected
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized.is_some()
    }

    /// Fix this flow's protocol. Only the first call has any effect.
    pub fn mark_finalized(&mut self, id: ProtocolId) {
        self.finalized.get_or_insert(id);
    }

    /// The finalized protocol, or the engine's verdict so far.
    pub fn protocol(&self) -> ProtocolId {
        self.finalized.or(self.detected).unwrap_or(ProtocolId::UNKNOWN)
    }

    fn into_state(self) -> S {
        self.engine_state
    }
}

impl<S> fmt::Debug for FlowRecord<S> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("FlowRecord")
            .field("key", &self.key)
            .field("first_seen", &self.first_seen)
            .field("last_seen", &self.last_seen)
            .field("packet_count", &self.packet_count)
            .field("byte_count", &self.byte_count)
            .field("detected", &self.detected)
            .field("finalized", &self.finalized)
            .finish_non_exhaustive()
    }
}

/// Keys marked for removal during a single traversal.
#[derive(Debug)]
pub struct IdleQueue {
    keys: Vec<FlowKey>,
    budget: usize,
}

impl IdleQueue {
    pub fn new(budget: usize) -> Self {
        Self { keys: Vec::with_capacity(budget), budget }
    }

    pub fn budget(&self) -> usize {
        self.budget
    }

    pub fn is_full(&self) -> bool {
        self.keys.len() >= self.budget
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    fn push(&mut self, key: FlowKey) {
        self.keys.push(key);
    }
}

pub struct FlowTable<S> {
    roots: Box<[BTreeMap<FlowKey, FlowRecord<S>>]>,
    limit: u64,
    len: u64,
    peak: u64,
    now: Moment,
}

impl<S> FlowTable<S> {
    /// Create a table with `num_roots` partitions holding at most
    /// `limit` records in total.
    pub fn new(num_roots: usize, limit: u64) -> Self {
        let roots = (0..num_roots.max(1)).map(|_| BTreeMap::new()).collect();
        Self { roots, limit, len: 0, peak: 0, now: Moment::ZERO }
    }

    /// Find the record for `key`, creating it if absent.
    ///
    /// The boolean is `true` when the record was created by this call.
    /// `mk_state` is only invoked on creation.
    ///
    /// # Errors
    ///
    /// If the key is new and the table already holds `limit` records,
    /// [`Error::ResourceExhausted`] is returned and the table is left
    /// untouched.
    pub fn lookup_or_create<F>(
        &mut self,
        key: FlowKey,
        now: Moment,
        mk_state: F,
    ) -> Result<(&mut FlowRecord<S>, bool)>
    where
        F: FnOnce() -> S,
    {
        let idx = key.root_index(self.roots.len());

        match self.roots[idx].entry(key) {
            Entry::Occupied(entry) => Ok((entry.into_mut(), false)),

            Entry::Vacant(entry) => {
                if self.len >= self.limit {
                    return Err(Error::ResourceExhausted(self.limit));
                }

                self.len += 1;
                self.peak = self.peak.max(self.len);
                let rec = FlowRecord::new(key, now, mk_state());
                Ok((entry.insert(rec), true))
            }
        }
    }

    pub fn get(&self, key: &FlowKey) -> Option<&FlowRecord<S>> {
        self.roots[key.root_index(self.roots.len())].get(key)
    }

    /// Walk every record, root by root and in key order within a root.
    ///
    /// Records for which `f` returns [`Visit::Remove`] are queued on
    /// `queue`. The walk ends early when `f` returns [`Visit::Stop`] or
    /// when `queue` is full, before the next record is shown to `f`.
    /// Returns the number of records visited.
    pub fn for_each<F>(&mut self, queue: &mut IdleQueue, mut f: F) -> usize
    where
        F: FnMut(&mut FlowRecord<S>) -> Visit,
    {
        let mut visited = 0;

        for root in self.roots.iter_mut() {
            for (key, rec) in root.iter_mut() {
                if queue.is_full() {
                    return visited;
                }

                visited += 1;
                match f(rec) {
                    Visit::Keep => {}
                    Visit::Remove => queue.push(*key),
                    Visit::Stop => return visited,
                }
            }
        }

        visited
    }

    pub fn iter(&self) -> impl Iterator<Item = &FlowRecord<S>> {
        self.roots.iter().flat_map(|root| root.values())
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut FlowRecord<S>> {
        self.roots.iter_mut().flat_map(|root| root.values_mut())
    }

    /// Remove every queued record, handing its engine state to
    /// `release`. Returns the number of records removed and leaves the
    /// queue empty.
    pub fn remove_queued<F>(
        &mut self,
        queue: &mut IdleQueue,
        mut release: F,
    ) -> usize
    where
        F: FnMut(S),
    {
        let mut removed = 0;

        for key in queue.keys.drain(..) {
            let idx = key.root_index(self.roots.len());
            if let Some(rec) = self.roots[idx].remove(&key) {
                release(rec.into_state());
                self.len -= 1;
                removed += 1;
            }
        }

        removed
    }

    /// Empty the table, handing every record's engine state to
    /// `release`. Returns the number of records destroyed.
    pub fn destroy_all<F>(&mut self, mut release: F) -> u64
    where
        F: FnMut(S),
    {
        let destroyed = self.len;

        for root in self.roots.iter_mut() {
            for (_, rec) in core::mem::take(root) {
                release(rec.into_state());
            }
        }

        self.len = 0;
        destroyed
    }

    /// Move the table's clock forward to `now`. The clock never runs
    /// backwards.
    pub fn advance_time(&mut self, now: Moment) {
        self.now = self.now.max(now);
    }

    pub fn current_time(&self) -> Moment {
        self.now
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// The largest number of records this table has held at once.
    pub fn peak(&self) -> u64 {
        self.peak
    }

    pub fn num_roots(&self) -> usize {
        self.roots.len()
    }
}

impl<S> fmt::Debug for FlowTable<S> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("FlowTable")
            .field("roots", &self.roots.len())
            .field("limit", &self.limit)
            .field("len", &self.len)
            .field("peak", &self.peak)
            .field("now", &self.now)
            .finish()
    }
}
