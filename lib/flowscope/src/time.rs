// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Moments in capture time.
//!
//! Flow bookkeeping never consults the wall clock. Every notion of
//! "now" used by the flow table and the idle reaper is derived from
//! packet timestamps, so replaying the same capture always produces
//! the same expirations.

use core::fmt;
use core::ops::Add;
use core::time::Duration;
use serde::Serialize;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

/// The number of milliseconds in a second.
pub const MILLIS: u64 = 1_000;
/// The number of microseconds in a second.
pub const MICROS: u64 = 1_000_000;
/// The conversion from microseconds to milliseconds.
pub const MICROS_TO_MILLIS: u64 = MICROS / MILLIS;

/// A point in time, in microseconds since the Unix epoch.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
pub struct Moment(u64);

impl Moment {
    pub const ZERO: Moment = Moment(0);

    pub const fn from_micros(micros: u64) -> Self {
        Moment(micros)
    }

    pub const fn from_millis(millis: u64) -> Self {
        Moment(millis * MICROS_TO_MILLIS)
    }

    /// Build a moment from a capture header's seconds/sub-second pair.
    pub fn from_timeval(secs: u64, usecs: u64) -> Self {
        Moment(secs.saturating_mul(MICROS).saturating_add(usecs))
    }

    /// The wall clock, used only for capture deadlines and throughput.
    pub fn wall() -> Self {
        let since = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Moment(since.as_micros() as u64)
    }

    pub fn as_micros(&self) -> u64 {
        self.0
    }

    pub fn as_millis(&self) -> u64 {
        self.0 / MICROS_TO_MILLIS
    }

    pub fn as_secs(&self) -> u64 {
        self.0 / MICROS
    }

    /// Microseconds elapsed since `earlier`, zero if `earlier` is in
    /// the future.
    pub fn delta_as_micros(&self, earlier: Moment) -> u64 {
        self.0.saturating_sub(earlier.0)
    }

    pub fn delta_as_millis(&self, earlier: Moment) -> u64 {
        self.delta_as_micros(earlier) / MICROS_TO_MILLIS
    }
}

impl Add<Duration> for Moment {
    type Output = Moment;

    fn add(self, rhs: Duration) -> Self::Output {
        Moment(self.0.saturating_add(rhs.as_micros() as u64))
    }
}

impl fmt::Display for Moment {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{:06}", self.0 / MICROS, self.0 % MICROS)
    }
}
