//! Periodic task loops and check rate limiting.
//!
//! - [`IntervalRunner`] drives a [`Task`] on a fixed interval, on demand when
//!   notified, and stops when shutdown is signaled.
//! - [`RateCalculator`] derives a [`Limiter`] from the configured cap or from
//!   the number of checkable entities, so a full round of checks spreads evenly
//!   across the checking interval.
//!
//! # Invariants
//!
//! - Task runs never overlap within one runner
//! - A failing run never stops the loop
//! - Limiter burst is 1

mod interval;
mod limiter;
mod rate;

pub use interval::{notifier, IntervalRunner, NotifySender, Task};
pub use limiter::{Limiter, LimiterError, Rate};
pub use rate::{CheckableCounter, InvalidMaxChecksPerSecond, MaxChecksPerSecond, RateCalculator, RateError};

/// Default interval for the scan loop.
pub const DEFAULT_SCANNER_INTERVAL: std::time::Duration = std::time::Duration::from_secs(10);

/// Default interval for the check loop.
pub const DEFAULT_CHECKER_INTERVAL: std::time::Duration = std::time::Duration::from_secs(10);

/// Default interval between checks of one checkable.
pub const DEFAULT_RESOURCE_CHECKING_INTERVAL: std::time::Duration =
    std::time::Duration::from_secs(60);
