//! Check rate calculation.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::limiter::{Limiter, Rate};

/// Source of the number of entities that are checked periodically.
#[async_trait]
pub trait CheckableCounter: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Count all checkable entities.
    async fn checkable_count(&self) -> Result<u64, Self::Error>;
}

#[async_trait]
impl<T: CheckableCounter + ?Sized> CheckableCounter for Arc<T> {
    type Error = T::Error;

    async fn checkable_count(&self) -> Result<u64, Self::Error> {
        (**self).checkable_count().await
    }
}

/// Configured cap on checks started per second.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaxChecksPerSecond {
    /// No cap (`-1`).
    Unlimited,

    /// Derived from the checkable count and checking interval (`0`).
    Auto,

    /// Fixed cap (`> 0`).
    Fixed(u32),
}

/// A configured cap outside `-1`, `0`, or a positive integer.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("max checks per second must be -1, 0, or a positive integer; got {0}")]
pub struct InvalidMaxChecksPerSecond(pub i64);

impl TryFrom<i64> for MaxChecksPerSecond {
    type Error = InvalidMaxChecksPerSecond;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            -1 => Ok(Self::Unlimited),
            0 => Ok(Self::Auto),
            n if n > 0 => u32::try_from(n)
                .map(Self::Fixed)
                .map_err(|_| InvalidMaxChecksPerSecond(value)),
            _ => Err(InvalidMaxChecksPerSecond(value)),
        }
    }
}

/// Rate calculation errors.
#[derive(Debug, Error)]
pub enum RateError<E>
where
    E: std::error::Error + 'static,
{
    /// Counting checkables failed.
    #[error("failed to count checkables: {0}")]
    Count(#[source] E),

    /// Auto rate needs a positive checking interval.
    #[error("resource checking interval must be greater than zero")]
    ZeroInterval,
}

/// Computes the limiter for check dispatch.
#[derive(Debug, Clone)]
pub struct RateCalculator<C> {
    pub max_checks_per_second: MaxChecksPerSecond,
    pub resource_checking_interval: Duration,
    pub counter: C,
}

impl<C: CheckableCounter> RateCalculator<C> {
    /// Create a new rate calculator.
    pub fn new(
        max_checks_per_second: MaxChecksPerSecond,
        resource_checking_interval: Duration,
        counter: C,
    ) -> Self {
        Self {
            max_checks_per_second,
            resource_checking_interval,
            counter,
        }
    }

    /// Build a limiter with burst 1 for the configured cap.
    ///
    /// In auto mode the rate is `count / interval_seconds`: exactly enough to
    /// check every checkable once per interval.
    pub async fn rate_limiter(&self) -> Result<Limiter, RateError<C::Error>> {
        let rate = match self.max_checks_per_second {
            MaxChecksPerSecond::Unlimited => Rate::Infinite,
            MaxChecksPerSecond::Fixed(n) => Rate::PerSecond(f64::from(n)),
            MaxChecksPerSecond::Auto => {
                let interval = self.resource_checking_interval.as_secs_f64();
                if interval <= 0.0 {
                    return Err(RateError::ZeroInterval);
                }

                let count = self
                    .counter
                    .checkable_count()
                    .await
                    .map_err(RateError::Count)?;

                Rate::PerSecond(count as f64 / interval)
            }
        };

        Ok(Limiter::new(rate, 1))
    }
}
