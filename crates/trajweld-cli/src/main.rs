//! `trajweld` entry point.
//!
//! Wires the projects file, the consolidation pipeline, and the scheduler
//! together. Configuration problems abort with exit code 2 before any unit
//! is scheduled; scheduler-fatal failures (a worker panic re-raised after
//! the batch drained, or an expansion error mid-run) exit 1; everything
//! else, including runs ended by a signal or the time budget, exits 0 with
//! the outcomes in the log.

use std::num::NonZeroUsize;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::PathBuf;
use std::process::ExitCode;
use std::thread;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use trajweld_error::{Result, WeldError};
use trajweld_pipeline::{
    AuxFileHandling, MaterializeOptions, ProcessOptions, ProjectsFile, process_unit,
};
use trajweld_sched::{
    DriverConfig, ExecMode, PoolConfig, SignalWatcher, UnitRunner, UnitSource, run_driver,
};
use trajweld_types::{CancellationToken, ConsolidationUnit, UnitReport};

/// Consolidate simulation trajectory fragments into durable containers.
#[derive(Debug, Parser)]
#[command(name = "trajweld", version, about)]
struct Args {
    /// Projects file (TOML) describing the fragment trees to consolidate.
    #[arg(long, value_name = "FILE")]
    projects: PathBuf,

    /// Output directory for consolidated containers.
    #[arg(long, value_name = "DIR")]
    outpath: PathBuf,

    /// Worker threads; defaults to the number of CPUs.
    #[arg(long, value_name = "N")]
    workers: Option<usize>,

    /// Wall-clock budget per iteration, in seconds.
    #[arg(long, value_name = "SECS")]
    time_limit: Option<u64>,

    /// Iterations to run; 0 keeps iterating until a signal arrives.
    #[arg(long, value_name = "N", default_value_t = 1)]
    max_iterations: u64,

    /// Seconds to pause between iterations.
    #[arg(long, value_name = "SECS", default_value_t = 60)]
    sleep_time: u64,

    /// Supervisor poll interval in milliseconds.
    #[arg(long, value_name = "MS", default_value_t = 200)]
    poll_interval_ms: u64,

    /// Delete fragment archives once their contents are merged and verified.
    #[arg(long)]
    delete_archives: bool,

    /// Skip auxiliary archive members instead of unpacking them.
    #[arg(long)]
    discard_aux: bool,

    /// Run every unit inline on the main thread (debugging aid).
    #[arg(long)]
    serial: bool,

    /// Debug-level logging; the RUST_LOG environment variable overrides.
    #[arg(long, short = 'v')]
    verbose: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.verbose);

    match catch_unwind(AssertUnwindSafe(|| run(args))) {
        Ok(Ok(())) => ExitCode::SUCCESS,
        Ok(Err(err)) => {
            error!(error = %err, "trajweld failed");
            ExitCode::from(exit_code_for(&err))
        }
        Err(_) => {
            // A worker panic was drained by the pool and re-raised; the
            // panic hook has already printed the details.
            error!("scheduler-fatal failure, aborting");
            ExitCode::from(1)
        }
    }
}

fn run(args: Args) -> Result<()> {
    let projects = ProjectsFile::load(&args.projects)?;
    projects.validate()?;

    let config = driver_config(&args)?;
    let options = process_options(&args);
    info!(
        projects = projects.projects.len(),
        outpath = %args.outpath.display(),
        workers = config.pool.workers,
        serial = matches!(config.pool.mode, ExecMode::Serial),
        "starting trajweld"
    );

    let watcher = SignalWatcher::install()?;
    let token = CancellationToken::default();
    let runner = ConsolidationRunner { options };
    let source = ProjectsSource {
        projects,
        outpath: args.outpath,
    };

    let summary = run_driver(&source, &runner, &config, &token, move || {
        watcher.triggered()
    })?;

    if summary.interrupted {
        info!("run ended by signal; merged fragments are durable");
    }
    if summary.timed_out {
        info!("run ended by the time budget; merged fragments are durable");
    }
    Ok(())
}

/// Exit 2 for configuration problems, 1 for everything else fatal.
fn exit_code_for(err: &WeldError) -> u8 {
    match err {
        WeldError::Config { .. } => 2,
        _ => 1,
    }
}

fn init_tracing(verbose: bool) {
    let default_directive = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(filter)
        .init();
}

fn driver_config(args: &Args) -> Result<DriverConfig> {
    let workers = match args.workers {
        Some(0) => return Err(WeldError::config("--workers must be at least 1")),
        Some(count) => count,
        None => thread::available_parallelism().map_or(1, NonZeroUsize::get),
    };
    if args.poll_interval_ms == 0 {
        return Err(WeldError::config("--poll-interval-ms must be at least 1"));
    }
    let pool = PoolConfig {
        workers,
        time_budget: args.time_limit.map(Duration::from_secs),
        poll_interval: Duration::from_millis(args.poll_interval_ms),
        mode: if args.serial {
            ExecMode::Serial
        } else {
            ExecMode::Threaded
        },
    };
    Ok(DriverConfig {
        max_iterations: (args.max_iterations != 0).then_some(args.max_iterations),
        inter_pause: Duration::from_secs(args.sleep_time),
        pool,
    })
}

fn process_options(args: &Args) -> ProcessOptions {
    ProcessOptions {
        materialize: MaterializeOptions {
            delete_archive: args.delete_archives,
            aux_files: if args.discard_aux {
                AuxFileHandling::Discard
            } else {
                AuxFileHandling::Keep
            },
        },
        ..ProcessOptions::default()
    }
}

/// Production runner: one full consolidation pass per unit.
struct ConsolidationRunner {
    options: ProcessOptions,
}

impl UnitRunner for ConsolidationRunner {
    fn run(&self, unit: &ConsolidationUnit, token: &CancellationToken) -> UnitReport {
        process_unit(unit, &self.options, token)
    }
}

/// Re-expands the projects file against the live filesystem each iteration.
struct ProjectsSource {
    projects: ProjectsFile,
    outpath: PathBuf,
}

impl UnitSource for ProjectsSource {
    fn units(&self) -> Result<Vec<ConsolidationUnit>> {
        self.projects.expand_units(&self.outpath)
    }
}

// ---------------------------------------------------------------------------
