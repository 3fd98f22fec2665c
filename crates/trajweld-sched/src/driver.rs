//! Iteration driver: repeat consolidation batches until told to stop.
//!
//! Each iteration re-expands the projects into units, runs one batch, and
//! logs every unit outcome plus an iteration summary. Between iterations the
//! driver sleeps in poll-sized chunks so a signal ends the pause promptly.
//! The run stops when the token is raised (signal, budget, panic, or an
//! external caller) or the iteration cap is reached.

use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use trajweld_error::Result;
use trajweld_types::{CancellationToken, ConsolidationUnit, UnitOutcome};

use crate::pool::{BatchReport, PoolConfig, UnitRunner, run_batch};

/// Where each iteration's units come from. Expansion runs once per
/// iteration, so runs and clones that appear mid-flight are picked up.
pub trait UnitSource {
    fn units(&self) -> Result<Vec<ConsolidationUnit>>;
}

#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Iteration cap; `None` keeps iterating until a signal arrives.
    pub max_iterations: Option<u64>,
    /// Pause between iterations, skipped after the final one.
    pub inter_pause: Duration,
    pub pool: PoolConfig,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            max_iterations: Some(1),
            inter_pause: Duration::ZERO,
            pool: PoolConfig::default(),
        }
    }
}

/// Totals across every iteration of one driver run.
#[derive(Debug, Default)]
pub struct DriverSummary {
    pub iterations: u64,
    pub units_processed: usize,
    pub merged_fragments: usize,
    pub failed_units: usize,
    pub cancelled_units: usize,
    pub interrupted: bool,
    pub timed_out: bool,
    pub elapsed: Duration,
}

impl DriverSummary {
    fn absorb(&mut self, batch: &BatchReport) {
        self.units_processed += batch.reports.len();
        self.merged_fragments += batch.merged_fragments();
        self.failed_units += batch.failed_units();
        self.cancelled_units += batch.cancelled_units();
        self.interrupted |= batch.interrupted;
        self.timed_out |= batch.timed_out;
    }
}

/// Drive consolidation iterations until the token is raised or the
/// iteration cap is hit.
pub fn run_driver<F>(
    source: &dyn UnitSource,
    runner: &dyn UnitRunner,
    config: &DriverConfig,
    token: &CancellationToken,
    signal: F,
) -> Result<DriverSummary>
where
    F: Fn() -> bool,
{
    let started = Instant::now();
    let mut summary = DriverSummary::default();

    loop {
        if token.is_cancelled() {
            break;
        }
        if config
            .max_iterations
            .is_some_and(|max| summary.iterations >= max)
        {
            break;
        }
        let iteration = summary.iterations + 1;
        info!(iteration, "starting consolidation iteration");

        let units = source.units()?;
        let batch = run_batch(runner, units, &config.pool, token, &signal)?;
        for report in &batch.reports {
            match &report.outcome {
                UnitOutcome::Failed(err) => warn!(
                    unit = %report.unit.label(),
                    error = %err,
                    "unit failed this iteration"
                ),
                outcome => debug!(
                    unit = %report.unit.label(),
                    outcome = outcome.label(),
                    "unit outcome"
                ),
            }
        }
        summary.iterations = iteration;
        summary.absorb(&batch);
        info!(
            iteration,
            units = batch.reports.len(),
            merged = batch.merged_fragments(),
            failed = batch.failed_units(),
            cancelled = batch.cancelled_units(),
            elapsed = ?batch.elapsed,
            "iteration complete"
        );

        if token.is_cancelled() {
            break;
        }
        if config.max_iterations.is_some_and(|max| iteration >= max) {
            break;
        }
        match pause_between(config.inter_pause, config.pool.poll_interval, token, &signal) {
            PauseEnd::Elapsed => {}
            PauseEnd::Signalled => {
                summary.interrupted = true;
                break;
            }
            PauseEnd::TokenRaised => break,
        }
    }

    summary.elapsed = started.elapsed();
    info!(
        iterations = summary.iterations,
        merged = summary.merged_fragments,
        failed = summary.failed_units,
        cancelled = summary.cancelled_units,
        elapsed = ?summary.elapsed,
        "driver finished"
    );
    Ok(summary)
}

enum PauseEnd {
    Elapsed,
    Signalled,
    TokenRaised,
}

/// Sleep for `pause` in `chunk`-sized naps, ending early on a signal or a
/// raised token.
fn pause_between<F>(
    pause: Duration,
    chunk: Duration,
    token: &CancellationToken,
    signal: &F,
) -> PauseEnd
where
    F: Fn() -> bool,
{
    let deadline = Instant::now().checked_add(pause);
    loop {
        if token.is_cancelled() {
            return PauseEnd::TokenRaised;
        }
        if signal() {
            info!("interrupt received during inter-iteration pause");
            token.cancel();
            return PauseEnd::Signalled;
        }
        let now = Instant::now();
        match deadline {
            Some(deadline) if now >= deadline => return PauseEnd::Elapsed,
            Some(deadline) => thread::sleep(chunk.min(deadline - now)),
            // A pause too large to represent never elapses on its own.
            None => thread::sleep(chunk),
        }
    }
}

// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    use std::path::PathBuf;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use trajweld_error::WeldError;
    use trajweld_types::UnitReport;

    use crate::pool::ExecMode;

    fn make_units(count: usize) -> Vec<ConsolidationUnit> {
        (0..count)
            .map(|index| ConsolidationUnit {
                project: "stub".to_string(),
                unit_path: PathBuf::from(format!("/stub/run{index}/clone0")),
                container_path: PathBuf::from(format!("/stub/out/run{index}-clone0.twc")),
                topology_path: PathBuf::from("/stub/topology.json"),
                selection: "all".to_string(),
            })
            .collect()
    }

    fn never() -> bool {
        false
    }

    struct CountingSource {
        calls: AtomicUsize,
        units_per_iteration: usize,
    }

    impl CountingSource {
        fn new(units_per_iteration: usize) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                units_per_iteration,
            }
        }
    }

    impl UnitSource for CountingSource {
        fn units(&self) -> Result<Vec<ConsolidationUnit>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(make_units(self.units_per_iteration))
        }
    }

    struct DoneRunner {
        delay: Duration,
    }

    impl UnitRunner for DoneRunner {
        fn run(&self, unit: &ConsolidationUnit, token: &CancellationToken) -> UnitReport {
            if token.is_cancelled() {
                return UnitReport::skipped(unit.clone());
            }
            if !self.delay.is_zero() {
                thread::sleep(self.delay);
            }
            UnitReport {
                unit: unit.clone(),
                outcome: UnitOutcome::Done,
                fragments_listed: 1,
                fragments_merged: 1,
                fragments_skipped: 0,
                elapsed: Duration::ZERO,
            }
        }
    }

    fn quick_driver_config(max_iterations: Option<u64>) -> DriverConfig {
        DriverConfig {
            max_iterations,
            inter_pause: Duration::from_millis(1),
            pool: PoolConfig {
                workers: 2,
                time_budget: None,
                poll_interval: Duration::from_millis(5),
                mode: ExecMode::Threaded,
            },
        }
    }

    #[test]
    fn test_driver_runs_max_iterations_reexpanding_each_time() {
        let source = CountingSource::new(2);
        let runner = DoneRunner {
            delay: Duration::ZERO,
        };
        let token = CancellationToken::default();
        let summary = run_driver(
            &source,
            &runner,
            &quick_driver_config(Some(3)),
            &token,
            never,
        )
        .expect("run driver");

        assert_eq!(summary.iterations, 3);
        assert_eq!(source.calls.load(Ordering::SeqCst), 3, "one expansion per iteration");
        assert_eq!(summary.units_processed, 6);
        assert_eq!(summary.merged_fragments, 6);
        assert!(!summary.interrupted && !summary.timed_out);
    }

    #[test]
    fn test_driver_stops_after_signal() {
        struct FlagRunner {
            flag: Arc<AtomicBool>,
        }
        impl UnitRunner for FlagRunner {
            fn run(&self, unit: &ConsolidationUnit, token: &CancellationToken) -> UnitReport {
                if token.is_cancelled() {
                    return UnitReport::skipped(unit.clone());
                }
                self.flag.store(true, Ordering::SeqCst);
                UnitReport {
                    unit: unit.clone(),
                    outcome: UnitOutcome::Done,
                    fragments_listed: 1,
                    fragments_merged: 1,
                    fragments_skipped: 0,
                    elapsed: Duration::ZERO,
                }
            }
        }

        let flag = Arc::new(AtomicBool::new(false));
        let source = CountingSource::new(1);
        let runner = FlagRunner {
            flag: Arc::clone(&flag),
        };
        let token = CancellationToken::default();
        // Unbounded iterations with a long pause: only the simulated signal
        // raised by the first unit can end this run.
        let config = DriverConfig {
            inter_pause: Duration::from_secs(60),
            ..quick_driver_config(None)
        };
        let signal_flag = Arc::clone(&flag);
        let summary = run_driver(&source, &runner, &config, &token, move || {
            signal_flag.load(Ordering::SeqCst)
        })
        .expect("run driver");

        assert_eq!(summary.iterations, 1);
        assert!(summary.interrupted);
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_driver_pre_raised_token_runs_zero_iterations() {
        let source = CountingSource::new(4);
        let runner = DoneRunner {
            delay: Duration::ZERO,
        };
        let token = CancellationToken::default();
        token.cancel();
        let summary = run_driver(
            &source,
            &runner,
            &quick_driver_config(Some(5)),
            &token,
            never,
        )
        .expect("run driver");

        assert_eq!(summary.iterations, 0);
        assert_eq!(source.calls.load(Ordering::SeqCst), 0);
        assert_eq!(summary.units_processed, 0);
    }

    #[test]
    fn test_driver_iterates_over_empty_expansions() {
        let source = CountingSource::new(0);
        let runner = DoneRunner {
            delay: Duration::ZERO,
        };
        let token = CancellationToken::default();
        let summary = run_driver(
            &source,
            &runner,
            &quick_driver_config(Some(2)),
            &token,
            never,
        )
        .expect("run driver");

        assert_eq!(summary.iterations, 2);
        assert_eq!(summary.units_processed, 0);
    }

    #[test]
    fn test_driver_source_error_is_fatal() {
        struct BrokenSource;
        impl UnitSource for BrokenSource {
            fn units(&self) -> Result<Vec<ConsolidationUnit>> {
                Err(WeldError::internal("expansion exploded"))
            }
        }

        let runner = DoneRunner {
            delay: Duration::ZERO,
        };
        let token = CancellationToken::default();
        let err = run_driver(
            &BrokenSource,
            &runner,
            &quick_driver_config(Some(1)),
            &token,
            never,
        )
        .expect_err("source error must propagate");
        assert!(matches!(err, WeldError::Internal(_)), "{err}");
    }

    #[test]
    fn test_timed_out_iteration_ends_the_run() {
        let source = CountingSource::new(2);
        let runner = DoneRunner {
            delay: Duration::from_millis(150),
        };
        let token = CancellationToken::default();
        let config = DriverConfig {
            max_iterations: None,
            inter_pause: Duration::from_millis(1),
            pool: PoolConfig {
                workers: 1,
                time_budget: Some(Duration::from_millis(30)),
                poll_interval: Duration::from_millis(5),
                mode: ExecMode::Threaded,
            },
        };
        let summary =
            run_driver(&source, &runner, &config, &token, never).expect("run driver");

        assert_eq!(summary.iterations, 1, "raised token ends the run");
        assert!(summary.timed_out);
        assert_eq!(summary.merged_fragments, 1, "in-flight unit completed");
        assert_eq!(summary.cancelled_units, 1);
    }
}
