// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Reader tunables.
//!
//! The defaults here are the ones the reader has always shipped with.
//! Any of them may be overridden from a TOML file, and the CLI
//! overrides the file.

use crate::error::Error;
use crate::error::Result;
use serde::Deserialize;
use std::path::Path;

pub const DEF_NUM_ROOTS: usize = 512;
pub const DEF_MAX_FLOWS: u64 = 200_000_000;
pub const DEF_IDLE_SCAN_PERIOD_MS: u64 = 10;
pub const DEF_MAX_IDLE_TIME_MS: u64 = 30_000;
pub const DEF_IDLE_SCAN_BUDGET: usize = 1024;
pub const DEF_MAX_WORKERS: usize = 16;
pub const DEF_SNAPLEN: u32 = 1536;
pub const DEF_LIVE_TIMEOUT_MS: u32 = 500;

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ReaderConfig {
    /// Number of independent partitions in each worker's flow table.
    pub num_roots: usize,
    /// Maximum number of live flows in one worker's flow table.
    pub max_flows: u64,
    /// How much capture time must pass between idle sweeps.
    pub idle_scan_period_ms: u64,
    /// A flow not seen for longer than this is idle.
    pub max_idle_time_ms: u64,
    /// Maximum number of flows reaped by a single sweep.
    pub idle_scan_budget: usize,
    /// Upper bound on the number of capture workers.
    pub max_workers: usize,
    pub snaplen: u32,
    pub promisc: bool,
    pub live_timeout_ms: u32,
    /// Fall back to the port/address guess for unclassified flows.
    pub enable_guess: bool,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            num_roots: DEF_NUM_ROOTS,
            max_flows: DEF_MAX_FLOWS,
            idle_scan_period_ms: DEF_IDLE_SCAN_PERIOD_MS,
            max_idle_time_ms: DEF_MAX_IDLE_TIME_MS,
            idle_scan_budget: DEF_IDLE_SCAN_BUDGET,
            max_workers: DEF_MAX_WORKERS,
            snaplen: DEF_SNAPLEN,
            promisc: true,
            live_timeout_ms: DEF_LIVE_TIMEOUT_MS,
            enable_guess: true,
        }
    }
}

impl ReaderConfig {
    /// Load a configuration from a TOML file. Missing fields take
    /// their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|err| Error::Io {
            path: path.display().to_string(),
            err,
        })?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let cfg: ReaderConfig =
            toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_roots == 0 {
            return Err(Error::Config("num_roots must be non-zero".into()));
        }

        if self.max_flows == 0 {
            return Err(Error::Config("max_flows must be non-zero".into()));
        }

        if self.idle_scan_budget == 0 {
            return Err(Error::Config(
                "idle_scan_budget must be non-zero".into(),
            ));
        }

        if self.max_workers == 0 {
            return Err(Error::Config("max_workers must be non-zero".into()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let cfg = ReaderConfig::from_toml(
            "max_idle_time_ms = 5000\nidle_scan_budget = 2\n",
        )
        .unwrap();
        assert_eq!(cfg.max_idle_time_ms, 5000);
        assert_eq!(cfg.idle_scan_budget, 2);
        assert_eq!(cfg.num_roots, DEF_NUM_ROOTS);
        assert!(cfg.enable_guess);
    }

    #[test]
    fn zero_roots_rejected() {
        let err = ReaderConfig::from_toml("num_roots = 0").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn unknown_field_rejected() {
        assert!(ReaderConfig::from_toml("bogus = 1").is_err());
    }
}
