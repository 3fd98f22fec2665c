//! Bounded worker pool draining a shared unit queue.
//!
//! Units are coarse tasks that run for seconds, so a single shared
//! [`Injector`] with no per-worker queues is enough; each worker steals one
//! unit at a time and runs it to completion. The caller thread stays behind
//! as supervisor and promotes OS signals and the wall-clock budget onto the
//! shared cancellation token at poll resolution. Cancellation never
//! interrupts a unit mid-merge; queued units that never started are drained
//! into `Cancelled` reports so batch accounting stays complete.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind, resume_unwind};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_deque::{Injector, Steal};
use parking_lot::Mutex;
use tracing::{debug, warn};

use trajweld_error::{Result, WeldError};
use trajweld_types::{CancellationToken, ConsolidationUnit, UnitOutcome, UnitReport};

/// Poll cadence when the caller does not override it.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(200);

type PanicPayload = Box<dyn Any + Send + 'static>;

/// Seam between the pool and the consolidation pipeline, so the pool is
/// testable with stub runners.
pub trait UnitRunner: Send + Sync {
    /// Run one unit pass to completion, honoring `token` at fragment
    /// boundaries. Unit-scoped failures are folded into the report's
    /// outcome, never panicked.
    fn run(&self, unit: &ConsolidationUnit, token: &CancellationToken) -> UnitReport;
}

/// How a batch executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecMode {
    /// `workers` OS threads stealing from a shared queue.
    #[default]
    Threaded,
    /// Every unit inline on the caller thread, for debugging. Signal and
    /// budget promotion then happen between units only, never during one.
    Serial,
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub workers: usize,
    /// Wall-clock budget for the whole batch. Exhaustion cancels the units
    /// that have not started yet; it is an outcome, not an error.
    pub time_budget: Option<Duration>,
    /// How often the supervisor checks signals, the budget, and worker
    /// completion.
    pub poll_interval: Duration,
    pub mode: ExecMode,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            time_budget: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            mode: ExecMode::Threaded,
        }
    }
}

impl PoolConfig {
    fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(WeldError::config("worker count must be at least 1"));
        }
        if self.poll_interval.is_zero() {
            return Err(WeldError::config("poll interval must be non-zero"));
        }
        Ok(())
    }
}

/// Everything one batch produced.
#[derive(Debug)]
pub struct BatchReport {
    pub reports: Vec<UnitReport>,
    /// An OS signal was promoted onto the token during this batch.
    pub interrupted: bool,
    /// The time budget ran out during this batch.
    pub timed_out: bool,
    pub elapsed: Duration,
}

impl BatchReport {
    #[must_use]
    pub fn merged_fragments(&self) -> usize {
        self.reports
            .iter()
            .map(|report| report.fragments_merged)
            .sum()
    }

    #[must_use]
    pub fn done_units(&self) -> usize {
        self.count(|outcome| matches!(outcome, UnitOutcome::Done))
    }

    #[must_use]
    pub fn cancelled_units(&self) -> usize {
        self.count(|outcome| matches!(outcome, UnitOutcome::Cancelled))
    }

    #[must_use]
    pub fn failed_units(&self) -> usize {
        self.count(|outcome| matches!(outcome, UnitOutcome::Failed(_)))
    }

    fn count(&self, pred: impl Fn(&UnitOutcome) -> bool) -> usize {
        self.reports
            .iter()
            .filter(|report| pred(&report.outcome))
            .count()
    }
}

/// Run every unit through `runner`, then report.
///
/// A worker panic raises the token, lets the siblings drain the queue, and
/// is re-raised here after all workers have joined. That path is
/// scheduler-fatal and distinct from unit-scoped `Failed` outcomes, which
/// never stop the batch.
pub fn run_batch<F>(
    runner: &dyn UnitRunner,
    units: Vec<ConsolidationUnit>,
    config: &PoolConfig,
    token: &CancellationToken,
    signal: F,
) -> Result<BatchReport>
where
    F: Fn() -> bool,
{
    config.validate()?;
    let started = Instant::now();
    if units.is_empty() {
        debug!("batch has no units");
        return Ok(BatchReport {
            reports: Vec::new(),
            interrupted: false,
            timed_out: false,
            elapsed: started.elapsed(),
        });
    }
    // A budget too large to represent never expires.
    let deadline = config
        .time_budget
        .and_then(|budget| started.checked_add(budget));
    debug!(
        units = units.len(),
        workers = config.workers,
        mode = ?config.mode,
        "starting batch"
    );

    let (reports, promotions) = match config.mode {
        ExecMode::Serial => run_serial(runner, units, deadline, token, &signal),
        ExecMode::Threaded => run_threaded(runner, units, config, deadline, token, &signal)?,
    };

    Ok(BatchReport {
        reports,
        interrupted: promotions.interrupted,
        timed_out: promotions.timed_out,
        elapsed: started.elapsed(),
    })
}

#[derive(Debug, Default)]
struct Promotions {
    interrupted: bool,
    timed_out: bool,
}

fn run_threaded<F>(
    runner: &dyn UnitRunner,
    units: Vec<ConsolidationUnit>,
    config: &PoolConfig,
    deadline: Option<Instant>,
    token: &CancellationToken,
    signal: &F,
) -> Result<(Vec<UnitReport>, Promotions)>
where
    F: Fn() -> bool,
{
    let queued = units.len();
    let injector = Injector::new();
    for unit in units {
        injector.push(unit);
    }
    let panic_slot: Mutex<Option<PanicPayload>> = Mutex::new(None);

    let mut reports = Vec::with_capacity(queued);
    let mut promotions = Promotions::default();

    thread::scope(|scope| -> Result<()> {
        let workers = config.workers.min(queued);
        let mut handles = Vec::with_capacity(workers);
        for worker_id in 0..workers {
            let injector = &injector;
            let panic_slot = &panic_slot;
            let spawned = thread::Builder::new()
                .name(format!("weld-worker-{worker_id}"))
                .spawn_scoped(scope, move || {
                    worker_loop(runner, injector, token, panic_slot)
                });
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(err) => {
                    // Workers already running will drain; the batch fails.
                    token.cancel();
                    return Err(WeldError::Io(err));
                }
            }
        }

        while !handles.iter().all(|handle| handle.is_finished()) {
            thread::sleep(config.poll_interval);
            promote(deadline, token, signal, &mut promotions);
        }
        for handle in handles {
            match handle.join() {
                Ok(worker_reports) => reports.extend(worker_reports),
                Err(payload) => store_panic(&panic_slot, token, payload),
            }
        }
        Ok(())
    })?;

    if let Some(payload) = panic_slot.lock().take() {
        resume_unwind(payload);
    }
    Ok((reports, promotions))
}

fn run_serial<F>(
    runner: &dyn UnitRunner,
    units: Vec<ConsolidationUnit>,
    deadline: Option<Instant>,
    token: &CancellationToken,
    signal: &F,
) -> (Vec<UnitReport>, Promotions)
where
    F: Fn() -> bool,
{
    let mut reports = Vec::with_capacity(units.len());
    let mut promotions = Promotions::default();
    for unit in units {
        promote(deadline, token, signal, &mut promotions);
        if token.is_cancelled() {
            reports.push(UnitReport::skipped(unit));
            continue;
        }
        reports.push(runner.run(&unit, token));
    }
    (reports, promotions)
}

fn worker_loop(
    runner: &dyn UnitRunner,
    injector: &Injector<ConsolidationUnit>,
    token: &CancellationToken,
    panic_slot: &Mutex<Option<PanicPayload>>,
) -> Vec<UnitReport> {
    let mut reports = Vec::new();
    loop {
        let unit = match injector.steal() {
            Steal::Success(unit) => unit,
            Steal::Empty => break,
            Steal::Retry => continue,
        };
        if token.is_cancelled() {
            reports.push(UnitReport::skipped(unit));
            continue;
        }
        match catch_unwind(AssertUnwindSafe(|| runner.run(&unit, token))) {
            Ok(report) => reports.push(report),
            Err(payload) => {
                store_panic(panic_slot, token, payload);
                reports.push(UnitReport {
                    unit,
                    outcome: UnitOutcome::Failed(WeldError::internal(
                        "worker panicked during unit pass",
                    )),
                    fragments_listed: 0,
                    fragments_merged: 0,
                    fragments_skipped: 0,
                    elapsed: Duration::ZERO,
                });
            }
        }
    }
    reports
}

/// Raise the token for a pending signal or an exhausted budget. Each
/// promotion fires once per batch.
fn promote<F>(
    deadline: Option<Instant>,
    token: &CancellationToken,
    signal: &F,
    promotions: &mut Promotions,
) where
    F: Fn() -> bool,
{
    if !promotions.interrupted && signal() {
        promotions.interrupted = true;
        warn!("interrupt received, cancelling remaining units");
        token.cancel();
    }
    if !promotions.timed_out && deadline.is_some_and(|deadline| Instant::now() >= deadline) {
        promotions.timed_out = true;
        warn!("time budget exhausted, cancelling remaining units");
        token.cancel();
    }
}

fn store_panic(
    panic_slot: &Mutex<Option<PanicPayload>>,
    token: &CancellationToken,
    payload: PanicPayload,
) {
    warn!("worker panicked, cancelling the batch");
    token.cancel();
    let mut slot = panic_slot.lock();
    if slot.is_none() {
        *slot = Some(payload);
    }
}

// ---------------------------------------------------------------------------
