// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! The orchestrator.
//!
//! A [`Reader`] assigns capture sources to workers, opens every source
//! up front, runs each worker on its own thread, waits for all of them
//! to stop and folds their outcomes into a [`Report`]. Workers share
//! nothing but the [`Shutdown`] flag.

use crate::Result;
use crate::capture::SourceKind;
use crate::config::ReaderConfig;
use crate::engine::classify::Classifier;
use crate::report::AggregateOpts;
use crate::report::Report;
use crate::report::aggregate;
use crate::shutdown::Shutdown;
use crate::time::Moment;
use crate::worker::Worker;
use crate::worker::WorkerOutcome;
use core::time::Duration;
use slog::Logger;
use slog::info;
use slog::warn;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Instant;

/// How often the capture-duration timer looks at the clock.
const TIMER_TICK: Duration = Duration::from_millis(100);

/// Per-run options that do not belong in [`ReaderConfig`].
#[derive(Clone, Debug, Default)]
pub struct RunOpts {
    /// A single source or a comma-separated list of sources.
    pub input: String,
    pub filter: Option<String>,
    /// Number of workers for a single live source.
    pub threads: usize,
    /// Stop live captures after this long.
    pub duration: Option<Duration>,
    /// Worker `i` is pinned to `cores[i]`.
    pub cores: Vec<usize>,
    /// Produce known/unknown flow listings in the report.
    pub list_flows: bool,
}

/// Split `input` into the sources that get their own worker. At most
/// `max_workers` entries survive.
pub fn split_sources(input: &str, max_workers: usize) -> Vec<String> {
    input
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .take(max_workers)
        .map(str::to_string)
        .collect()
}

pub struct Reader<C: Classifier> {
    cfg: ReaderConfig,
    engine: C,
    shutdown: Shutdown,
    log: Logger,
}

impl<C> Reader<C>
where
    C: Classifier + Clone + Send,
{
    /// Every worker gets its own clone of `engine`.
    pub fn new(
        cfg: ReaderConfig,
        engine: C,
        shutdown: Shutdown,
        log: &Logger,
    ) -> Result<Self> {
        cfg.validate()?;
        Ok(Self { cfg, engine, shutdown, log: log.clone() })
    }

    pub fn config(&self) -> &ReaderConfig {
        &self.cfg
    }

    pub fn shutdown(&self) -> &Shutdown {
        &self.shutdown
    }

    /// Open one worker per source.
    ///
    /// A single live source with `threads > 1` gets that many workers,
    /// each with its own capture handle on the device. Every source is
    /// opened before any worker starts; the first failure aborts the
    /// run.
    pub fn open_workers(&self, opts: &RunOpts) -> Result<Vec<Worker<C>>> {
        let sources = split_sources(&opts.input, self.cfg.max_workers);
        if sources.is_empty() {
            return Err(crate::Error::Config("no capture source given".into()));
        }

        let total =
            opts.input.split(',').filter(|s| !s.trim().is_empty()).count();
        if total > sources.len() {
            warn!(self.log, "too many sources, ignoring the rest";
                "max_workers" => self.cfg.max_workers, "given" => total);
        }

        let filter = opts.filter.as_deref();
        let mut workers = Vec::with_capacity(sources.len());

        for (id, source) in sources.iter().enumerate() {
            workers.push(Worker::open(
                id,
                source,
                filter,
                &self.cfg,
                self.engine.clone(),
                self.shutdown.clone(),
                &self.log,
            )?);
        }

        let live = workers
            .first()
            .is_some_and(|w| w.source_kind() == SourceKind::Live);
        let threads = opts.threads.min(self.cfg.max_workers);

        if sources.len() == 1 && live && threads > 1 {
            for id in 1..threads {
                workers.push(Worker::open(
                    id,
                    &sources[0],
                    filter,
                    &self.cfg,
                    self.engine.clone(),
                    self.shutdown.clone(),
                    &self.log,
                )?);
            }
        }

        Ok(workers)
    }

    /// Open, run and aggregate one complete pass over the sources.
    pub fn run(&self, opts: &RunOpts) -> Result<Report> {
        let workers = self.open_workers(opts)?;
        let live = workers.iter().any(|w| w.source_kind() == SourceKind::Live);
        let registry = self.engine.registry().clone();

        info!(self.log, "starting workers";
            "count" => workers.len(), "live" => live);
        let start = Instant::now();
        let outcomes = self.run_workers(workers, opts, live);
        let elapsed = start.elapsed();

        info!(self.log, "all workers stopped";
            "elapsed_ms" => elapsed.as_millis() as u64);

        let agg = AggregateOpts {
            elapsed,
            live,
            list_flows: opts.list_flows,
            guess_enabled: self.cfg.enable_guess,
        };
        Ok(aggregate(&outcomes, &registry, agg))
    }

    fn run_workers(
        &self,
        workers: Vec<Worker<C>>,
        opts: &RunOpts,
        live: bool,
    ) -> Vec<WorkerOutcome> {
        let deadline = opts
            .duration
            .filter(|_| live)
            .map(|d| Moment::wall() + d);
        let done = AtomicBool::new(false);
        let done = &done;

        std::thread::scope(|s| {
            if let Some(deadline) = deadline {
                let shutdown = self.shutdown.clone();
                let log = self.log.clone();
                s.spawn(move || capture_timer(deadline, done, &shutdown, &log));
            }

            let handles: Vec<_> = workers
                .into_iter()
                .map(|mut w| {
                    let core = opts.cores.get(w.id()).copied();
                    let log = self.log.clone();
                    w.set_deadline(deadline);
                    s.spawn(move || {
                        if let Some(core) = core {
                            pin_to_core(core, &log);
                        }
                        w.run();
                        w.finish()
                    })
                })
                .collect();

            let outcomes = handles
                .into_iter()
                .map(|h| match h.join() {
                    Ok(out) => out,
                    Err(panic) => std::panic::resume_unwind(panic),
                })
                .collect();

            done.store(true, Ordering::Relaxed);
            outcomes
        })
    }
}

/// Raise the shutdown flag once `deadline` passes, unless the workers
/// finish first.
fn capture_timer(
    deadline: Moment,
    done: &AtomicBool,
    shutdown: &Shutdown,
    log: &Logger,
) {
    loop {
        if done.load(Ordering::Relaxed) || shutdown.is_triggered() {
            return;
        }

        let now = Moment::wall();
        if now >= deadline {
            if shutdown.trigger() {
                info!(log, "capture duration elapsed");
            }
            return;
        }

        let left = Duration::from_micros(deadline.delta_as_micros(now));
        std::thread::sleep(left.min(TIMER_TICK));
    }
}

cfg_if! {
    if #[cfg(target_os = "linux")] {
        fn pin_to_core(core: usize, log: &Logger) {
            use nix::sched::CpuSet;
            use nix::sched::sched_setaffinity;
            use nix::unistd::Pid;

            let online = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1);
            let core = core % online;

            let mut set = CpuSet::new();
            let res = set
                .set(core)
                .and_then(|_| sched_setaffinity(Pid::from_raw(0), &set));

            match res {
                Ok(()) => info!(log, "pinned worker"; "core" => core),
                Err(e) => {
                    warn!(log, "could not pin worker";
                        "core" => core, "err" => %e)
                }
            }
        }
    } else {
        fn pin_to_core(core: usize, log: &Logger) {
            warn!(log, "core affinity is not supported on this platform";
                "core" => core);
        }
    }
}
