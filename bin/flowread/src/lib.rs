// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Support routines for the `flowread` command.

use slog::Drain;
use slog::Logger;
use std::num::ParseIntError;
use std::str::FromStr;

/// Build the root logger: terminal output on stderr, filtered by
/// `RUST_LOG`, written from a background thread.
pub fn init_logger() -> Logger {
    let decorator = slog_term::TermDecorator::new().stderr().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_envlogger::new(drain);
    let drain = slog_async::Async::new(drain).build().fuse();
    Logger::root(drain, slog::o!("component" => "flowread"))
}

/// A colon-separated core list such as `0:2:4`.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CoreList(pub Vec<usize>);

impl FromStr for CoreList {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.split(':')
            .map(|c| c.trim().parse())
            .collect::<Result<_, _>>()
            .map(Self)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn core_list() {
        assert_eq!("0".parse::<CoreList>().unwrap().0, [0]);
        assert_eq!("0:2:4".parse::<CoreList>().unwrap().0, [0, 2, 4]);
        assert!("0::1".parse::<CoreList>().is_err());
        assert!("a".parse::<CoreList>().is_err());
    }
}
