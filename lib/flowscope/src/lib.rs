// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Multi-source flow tracking and protocol classification.
//!
//! Packets are pulled from live interfaces or stored captures, folded
//! into bidirectional flows held in per-worker flow tables, classified
//! by a [`engine::Classifier`], expired when idle, and summarized into
//! a [`report::Report`] once every worker has stopped.

#![allow(clippy::len_without_is_empty)]
#![deny(unreachable_patterns)]
#![deny(unused_must_use)]

#[macro_use]
extern crate cfg_if;

pub mod capture;
pub mod config;
pub mod engine;
pub mod error;
pub mod print;
pub mod reader;
pub mod report;
pub mod shutdown;
pub mod time;
pub mod worker;

pub use error::Error;
pub use error::Result;
