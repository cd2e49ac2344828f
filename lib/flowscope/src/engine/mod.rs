// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! The flow engine: flow identity, frame decoding, the flow table
//! forest, classification, and idle eviction.

pub mod classify;
pub mod flow_key;
pub mod flow_table;
pub mod packet;
pub mod protocol;
pub mod reaper;
pub mod signature;
pub mod stat;

pub use classify::Classifier;
pub use classify::Verdict;
pub use flow_key::FlowDirection;
pub use flow_key::FlowKey;
pub use flow_table::FlowRecord;
pub use flow_table::FlowTable;
pub use protocol::Breed;
pub use protocol::ProtocolId;
pub use protocol::ProtocolRegistry;
pub use signature::SignatureEngine;
pub use stat::ProtocolStats;
