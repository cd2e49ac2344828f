// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! The classification engine contract and the classification pass.
//!
//! The engine itself is a collaborator: it owns an opaque per-flow
//! state, is fed packets incrementally, and may be asked to give up or
//! to guess from the five-tuple alone. The classification pass in this
//! module turns whatever the engine knows into one final protocol per
//! flow and books that flow's totals exactly once.

use super::flow_key::FiveTuple;
use super::flow_key::FlowDirection;
use super::flow_key::FlowKey;
use super::flow_table::FlowRecord;
use super::protocol::ProtocolId;
use super::protocol::ProtocolRegistry;
use super::stat::ProtocolStats;

/// An engine's answer for a flow.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Verdict {
    Definitive(ProtocolId),
    /// More packets are needed.
    Pending,
    /// The engine will not look at this flow any further.
    Unknown,
}

/// A protocol classification engine.
///
/// One engine instance belongs to one worker; it is never shared
/// between threads while packets are flowing.
pub trait Classifier {
    /// Opaque per-flow state owned by the flow table for the lifetime
    /// of the flow.
    type FlowState: Send;

    fn create_flow_state(&mut self, key: &FlowKey) -> Self::FlowState;

    /// Feed one packet's transport payload to the engine.
    ///
    /// The engine is handed a copy of the payload and must not modify
    /// it. The caller compares the copy with the captured frame after
    /// every call.
    fn feed(
        &mut self,
        state: &mut Self::FlowState,
        key: &FlowKey,
        payload: &mut [u8],
        dir: FlowDirection,
    ) -> Verdict;

    /// Produce a tentative verdict from the evidence gathered so far.
    /// Returns either `Definitive` or `Unknown`.
    fn give_up(&mut self, state: &mut Self::FlowState) -> Verdict;

    /// Best-effort classification from ports and addresses alone.
    fn guess(&self, tuple: &FiveTuple) -> Option<ProtocolId>;

    /// Release a flow's state. Called exactly once per flow.
    fn destroy(&mut self, state: Self::FlowState);

    fn registry(&self) -> &ProtocolRegistry;
}

/// Finalize a flow's protocol and account for it in `stats`.
///
/// Order of preference: the engine's definitive verdict, then the
/// engine's give-up verdict, then (if `guess` is set) the port and
/// address heuristic, and finally "unknown". Calling this again on a
/// finalized record returns the same protocol and books nothing.
pub fn finalize<C: Classifier>(
    record: &mut FlowRecord<C::FlowState>,
    engine: &mut C,
    stats: &mut ProtocolStats,
    guess: bool,
) -> ProtocolId {
    if record.is_finalized() {
        return record.protocol();
    }

    let mut detected = record.detected_protocol();

    if detected.is_none() {
        if let Verdict::Definitive(id) = engine.give_up(record.state_mut()) {
            detected = Some(id);
        }
    }

    if guess && detected.is_none_or(|id| id.is_unknown()) {
        if let Some(id) = engine.guess(&record.key().tuple()) {
            if !id.is_unknown() {
                stats.guessed_flow_protocols += 1;
                detected = Some(id);
            }
        }
    }

    let id = detected.unwrap_or(ProtocolId::UNKNOWN);
    record.mark_finalized(id);
    stats.book_flow(id, record.packet_count(), record.byte_count());
    id
}
