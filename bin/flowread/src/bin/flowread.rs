// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

use anyhow::Context;
use clap::Parser;
use flowread::init_logger;
use flowread::CoreList;
use flowscope::config::ReaderConfig;
use flowscope::engine::SignatureEngine;
use flowscope::print::print_flows_into;
use flowscope::print::print_report;
use flowscope::print::write_results;
use flowscope::reader::Reader;
use flowscope::reader::RunOpts;
use flowscope::report::Report;
use flowscope::shutdown::Shutdown;
use slog::Logger;
use slog::info;
use std::fs::File;
use std::io::BufWriter;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

/// Classify the traffic of live interfaces or stored captures by
/// protocol and report per-protocol and per-flow statistics.
#[derive(Debug, Parser)]
#[command(version)]
struct Args {
    /// Device, capture file, or play-list of capture files. Separate
    /// several sources with commas to give each its own worker.
    #[arg(short, long)]
    input: String,

    /// Capture filter expression.
    #[arg(short, long)]
    filter: Option<String>,

    /// Stop live capture after this many seconds.
    #[arg(short = 's', long = "duration")]
    duration: Option<u64>,

    /// Custom protocol rules, one `tcp:80,udp:53@Name` per line.
    #[arg(short, long)]
    protos: Option<PathBuf>,

    /// Pin worker N to the Nth core of this colon-separated list.
    #[arg(short = 'g', long = "cores")]
    cores: Option<CoreList>,

    /// Number of workers for a single live source.
    #[arg(short = 'n', long, default_value_t = 1)]
    threads: usize,

    /// Repeat the whole run this many times.
    #[arg(short, long, default_value_t = 1)]
    loops: u32,

    /// Disable guessing a protocol from ports and addresses.
    #[arg(short = 'd', long)]
    no_guess: bool,

    /// Do not print the traffic report.
    #[arg(short, long)]
    quiet: bool,

    /// List every flow after the report.
    #[arg(short, long)]
    verbose: bool,

    /// Write per-protocol results (and verbose flow listings) here.
    #[arg(short = 'w', long)]
    results: Option<PathBuf>,

    /// Write a JSON report here.
    #[arg(short, long)]
    json: Option<PathBuf>,

    /// Reader tunables in TOML.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Maximum number of live flows per worker.
    #[arg(long)]
    max_flows: Option<u64>,

    /// Idle time in milliseconds after which a flow is reaped.
    #[arg(long)]
    max_idle_ms: Option<u64>,
}

impl Args {
    fn reader_config(&self) -> anyhow::Result<ReaderConfig> {
        let mut cfg = match &self.config {
            Some(path) => ReaderConfig::from_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => ReaderConfig::default(),
        };

        if self.no_guess {
            cfg.enable_guess = false;
        }

        if let Some(max) = self.max_flows {
            cfg.max_flows = max;
        }

        if let Some(idle) = self.max_idle_ms {
            cfg.max_idle_time_ms = idle;
        }

        Ok(cfg)
    }

    fn run_opts(&self) -> RunOpts {
        RunOpts {
            input: self.input.clone(),
            filter: self.filter.clone(),
            threads: self.threads.max(1),
            duration: self.duration.map(Duration::from_secs),
            cores: self.cores.clone().unwrap_or_default().0,
            list_flows: self.verbose || self.json.is_some(),
        }
    }
}

fn emit(args: &Args, report: &Report) -> anyhow::Result<()> {
    if !args.quiet {
        print_report(report).context("printing report")?;
    }

    match &args.results {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("creating {}", path.display()))?;
            let mut out = BufWriter::new(file);
            write_results(&mut out, report)?;
            if args.verbose && args.json.is_none() {
                print_flows_into(&mut out, report)?;
            }
            out.flush()?;
        }

        None => {
            if args.verbose && args.json.is_none() {
                print_flows_into(&mut std::io::stdout(), report)?;
            }
        }
    }

    if let Some(path) = &args.json {
        let file = File::create(path)
            .with_context(|| format!("creating {}", path.display()))?;
        let mut out = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut out, report)?;
        writeln!(out)?;
        out.flush()?;
    }

    Ok(())
}

fn run(args: &Args, log: &Logger) -> anyhow::Result<()> {
    let cfg = args.reader_config()?;

    let mut engine = SignatureEngine::default();
    if let Some(path) = &args.protos {
        let n = engine.load_protos_file(path)?;
        info!(log, "loaded protocol rules";
            "path" => %path.display(), "count" => n);
    }

    let shutdown = Shutdown::new();
    let handler_sd = shutdown.clone();
    let handler_log = log.clone();
    ctrlc::set_handler(move || {
        if handler_sd.trigger() {
            info!(handler_log, "interrupted, stopping capture");
        }
    })
    .context("installing interrupt handler")?;

    let reader = Reader::new(cfg, engine, shutdown.clone(), log)?;
    let opts = args.run_opts();

    for pass in 0..args.loops {
        if pass > 0 && shutdown.is_triggered() {
            break;
        }

        info!(log, "starting run"; "pass" => pass + 1, "of" => args.loops);
        let report = reader
            .run(&opts)
            .with_context(|| format!("reading {}", args.input))?;
        emit(args, &report)?;
    }

    Ok(())
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let log = init_logger();
    run(&args, &log)
}
