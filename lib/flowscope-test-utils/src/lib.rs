// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Common routines for building frames and capture files in tests and
//! benchmarks.

pub mod frame;
pub mod pcap;

pub use frame::Endpoint;
pub use pcap::PcapBuilder;

use std::path::PathBuf;

/// A fresh path under the system temp directory, unique to this
/// process and `name`.
pub fn temp_path(name: &str) -> PathBuf {
    std::env::temp_dir()
        .join(format!("flowscope-{}-{name}", std::process::id()))
}
