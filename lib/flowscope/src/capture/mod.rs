// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Packet sources.
//!
//! A source identifier names a live interface, a stored capture file
//! (pcap or pcapng), or a play-list: a text file naming one stored
//! capture per line. [`open_source`] tries those three in that order.

use crate::Error;
use crate::config::ReaderConfig;
use crate::time::Moment;
use core::fmt;
use pcap_parser::Linktype;
use serde::Serialize;
use slog::Logger;
use std::io;
use std::path::Path;
use thiserror::Error;

pub mod file;
pub mod live;
pub mod playlist;

pub use file::FileSource;
pub use playlist::PlaylistSource;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("{0}: no such file or device")]
    NotFound(String),

    #[error("{0}: permission denied")]
    PermissionDenied(String),

    #[error("invalid filter '{filter}': {reason}")]
    InvalidFilter { filter: String, reason: String },

    #[error("{path}: {reason}")]
    Malformed { path: String, reason: String },

    #[error("{path}: {err}")]
    Io { path: String, err: io::Error },

    #[error("live capture: {0}")]
    Live(String),
}

impl CaptureError {
    pub fn from_io(path: &str, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => Self::NotFound(path.to_string()),
            io::ErrorKind::PermissionDenied => {
                Self::PermissionDenied(path.to_string())
            }
            _ => Self::Io { path: path.to_string(), err },
        }
    }

    pub fn malformed<R: fmt::Display>(path: &str, reason: R) -> Self {
        Self::Malformed { path: path.to_string(), reason: reason.to_string() }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub enum SourceKind {
    Live,
    File,
    Playlist,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::Live => "live",
            Self::File => "capture file",
            Self::Playlist => "play-list",
        };
        write!(f, "{s}")
    }
}

/// One frame as handed over by a source.
#[derive(Clone, Debug)]
pub struct CapturedPacket {
    pub ts: Moment,
    pub linktype: Linktype,
    /// The captured bytes, possibly truncated to the snap length.
    pub data: Vec<u8>,
    /// The length of the frame on the wire.
    pub wire_len: u32,
}

#[derive(Debug)]
pub enum Next {
    Packet(CapturedPacket),
    /// A live source had nothing to deliver within its read timeout.
    Idle,
    /// The source is exhausted.
    End,
}

/// What happened when a source was asked to move to its next entry.
#[derive(Debug)]
pub enum Advance {
    Opened(String),
    Skipped { entry: String, cause: CaptureError },
    Exhausted,
}

pub trait PacketSource: Send {
    /// Pull the next packet. Blocks for at most the source's read
    /// timeout.
    fn next_packet(&mut self) -> Result<Next, CaptureError>;

    /// Move on to the next entry once [`Next::End`] was returned. Only
    /// play-lists have more than one entry.
    fn advance(&mut self) -> Advance {
        Advance::Exhausted
    }

    /// Stop capturing. Every later call to `next_packet` returns
    /// [`Next::End`].
    fn stop(&mut self);

    fn kind(&self) -> SourceKind;

    fn describe(&self) -> &str;
}

/// Open a stored capture, applying `filter` if given.
pub fn open_stored(
    path: &str,
    filter: Option<&str>,
) -> Result<Box<dyn PacketSource>, CaptureError> {
    match filter {
        None => Ok(Box::new(FileSource::open(path)?)),
        Some(expr) => live::open_filtered_file(path, expr),
    }
}

/// Open `id` as a live interface, then as a stored capture, then as a
/// play-list.
pub fn open_source(
    id: &str,
    filter: Option<&str>,
    cfg: &ReaderConfig,
    log: &Logger,
) -> crate::Result<Box<dyn PacketSource>> {
    let live_err = match live::open_device(id, filter, cfg) {
        Ok(src) => return Ok(src),
        Err(e @ CaptureError::InvalidFilter { .. }) => {
            return Err(Error::SourceUnavailable {
                source_id: id.to_string(),
                cause: e,
            });
        }
        Err(e) => e,
    };

    if !Path::new(id).exists() {
        return Err(Error::SourceUnavailable {
            source_id: id.to_string(),
            cause: live_err,
        });
    }

    let file_err = match open_stored(id, filter) {
        Ok(src) => return Ok(src),
        Err(e @ CaptureError::InvalidFilter { .. }) => {
            return Err(Error::SourceUnavailable {
                source_id: id.to_string(),
                cause: e,
            });
        }
        Err(e) => e,
    };

    slog::debug!(log, "not a capture file, trying as play-list";
        "source" => id, "err" => %file_err);

    PlaylistSource::open(id, filter, log)
        .map(|src| Box::new(src) as Box<dyn PacketSource>)
        .map_err(|cause| Error::SourceUnavailable {
            source_id: id.to_string(),
            cause,
        })
}
