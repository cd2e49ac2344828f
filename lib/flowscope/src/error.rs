// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Errors surfaced by the reader.

use crate::capture::CaptureError;
use thiserror::Error;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The source could not be opened as a live capture, a stored
    /// capture, or a play-list.
    #[error("could not open {source_id} as a device, capture file or play-list: {cause}")]
    SourceUnavailable { source_id: String, cause: CaptureError },

    /// The flow table already holds its maximum number of flows.
    #[error("flow table at max capacity ({0} flows)")]
    ResourceExhausted(u64),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("I/O error on {path}: {err}")]
    Io { path: String, err: std::io::Error },
}
