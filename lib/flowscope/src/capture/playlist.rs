// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Play-lists: several stored captures read back to back as one
//! source.

use super::Advance;
use super::CaptureError;
use super::Next;
use super::PacketSource;
use super::SourceKind;
use super::open_stored;
use slog::Logger;
use std::collections::VecDeque;

/// Parse a play-list, one capture path per line. Blank lines and lines
/// starting with `#` are ignored.
pub fn parse_entries(text: &str) -> VecDeque<String> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(str::to_string)
        .collect()
}

pub struct PlaylistSource {
    path: String,
    filter: Option<String>,
    pending: VecDeque<String>,
    current: Option<Box<dyn PacketSource>>,
    current_name: String,
}

impl PlaylistSource {
    /// Read the play-list at `path` and open its first readable entry.
    /// Unreadable entries are logged and skipped.
    pub fn open(
        path: &str,
        filter: Option<&str>,
        log: &Logger,
    ) -> Result<Self, CaptureError> {
        let text = std::fs::read_to_string(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::InvalidData => {
                CaptureError::malformed(path, "not a capture file or play-list")
            }
            _ => CaptureError::from_io(path, e),
        })?;

        let pending = parse_entries(&text);
        if pending.is_empty() {
            return Err(CaptureError::malformed(path, "empty play-list"));
        }

        let mut src = Self {
            path: path.to_string(),
            filter: filter.map(str::to_string),
            pending,
            current: None,
            current_name: String::new(),
        };

        loop {
            match src.advance() {
                Advance::Opened(_) => return Ok(src),
                Advance::Skipped { entry, cause } => {
                    if let CaptureError::InvalidFilter { .. } = cause {
                        return Err(cause);
                    }
                    slog::warn!(log, "skipping unreadable play-list entry";
                        "playlist" => path, "entry" => entry, "err" => %cause);
                }
                Advance::Exhausted => {
                    return Err(CaptureError::malformed(
                        path,
                        "no readable entries in play-list",
                    ));
                }
            }
        }
    }

    /// Entries not yet opened.
    pub fn remaining(&self) -> usize {
        self.pending.len()
    }
}

impl PacketSource for PlaylistSource {
    fn next_packet(&mut self) -> Result<Next, CaptureError> {
        match self.current.as_mut() {
            Some(src) => src.next_packet(),
            None => Ok(Next::End),
        }
    }

    fn advance(&mut self) -> Advance {
        if let Some(mut done) = self.current.take() {
            done.stop();
        }

        let Some(entry) = self.pending.pop_front() else {
            return Advance::Exhausted;
        };

        match open_stored(&entry, self.filter.as_deref()) {
            Ok(src) => {
                self.current = Some(src);
                self.current_name.clone_from(&entry);
                Advance::Opened(entry)
            }
            Err(cause) => Advance::Skipped { entry, cause },
        }
    }

    fn stop(&mut self) {
        if let Some(mut src) = self.current.take() {
            src.stop();
        }
        self.pending.clear();
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Playlist
    }

    fn describe(&self) -> &str {
        if self.current.is_some() { &self.current_name } else { &self.path }
    }
}
