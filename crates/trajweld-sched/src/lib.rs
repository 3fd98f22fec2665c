//! Scheduling layer: bounded worker pool, iteration driver, and the POSIX
//! signal bridge.
//!
//! The pool owns all cross-thread coordination. Everything above it sees
//! only [`UnitRunner`] and [`UnitSource`] trait objects and the shared
//! cancellation token, so both layers are testable with stubs and the
//! pipeline crate stays free of threading concerns.

mod driver;
mod pool;
mod signal;

pub use driver::{DriverConfig, DriverSummary, UnitSource, run_driver};
pub use pool::{BatchReport, DEFAULT_POLL_INTERVAL, ExecMode, PoolConfig, UnitRunner, run_batch};
pub use signal::SignalWatcher;
