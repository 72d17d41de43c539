//! Replays allocation traces against the half-fit allocator.
//!
//! ```text
//! half-fit-trace [--log-level <level>] [--check] [--dump] <trace_path...>
//! ```
//!
//! Each trace runs against a freshly formatted arena. See [`trace`] for the
//! file format.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

use std::{
    fs,
    path::{Path, PathBuf},
    process,
};

use argh::FromArgs;
use half_fit::ArenaStorage;
use log::{LevelFilter, info};
use snafu::ResultExt as _;

use self::{
    replay::{Options, Replayer},
    report::{GenericError, Report},
};

mod color;
mod logger;
mod replay;
mod report;
mod trace;

/// Replay half-fit allocation traces.
#[derive(Debug, FromArgs)]
struct Args {
    /// trace files to replay
    #[argh(positional)]
    trace_path: Vec<PathBuf>,
    /// maximum log level: off, error, warn, info, debug or trace
    #[argh(option, default = "LevelFilter::Info")]
    log_level: LevelFilter,
    /// verify allocator invariants after every step
    #[argh(switch)]
    check: bool,
    /// print the bucket table after every step
    #[argh(switch)]
    dump: bool,
}

fn main() {
    let args: Args = argh::from_env();
    color::init_from_env();

    if let Err(err) = run(&args) {
        let report = Report::new(err);
        eprintln!("{report}");
        process::exit(1);
    }
}

fn run(args: &Args) -> Result<(), GenericError> {
    logger::init(args.log_level).whatever_context("failed to install logger")?;

    let options = Options {
        check: args.check,
        dump: args.dump,
    };
    for trace_path in &args.trace_path {
        replay_file(options, trace_path).with_whatever_context(|_| {
            format!("failed to replay trace, path={}", trace_path.display())
        })?;
    }

    Ok(())
}

fn replay_file(options: Options, path: &Path) -> Result<(), GenericError> {
    let input = fs::read_to_string(path).whatever_context("failed to read trace")?;
    let steps = trace::parse(&input).whatever_context("failed to parse trace")?;

    info!("replaying {} ({} steps)", path.display(), steps.len());
    let mut storage = Box::new(ArenaStorage::new());
    let mut replayer = Replayer::new(&mut storage, options);
    let summary = replayer.run(&steps).whatever_context("replay aborted")?;

    let stats = replayer.stats();
    println!(
        "{}: {} allocations ({} refused), {} frees, {} of {} chunks free at exit",
        path.display(),
        summary.allocations,
        summary.failed_allocations,
        summary.frees,
        stats.free_chunks,
        half_fit::MAX_CHUNKS,
    );
    Ok(())
}
