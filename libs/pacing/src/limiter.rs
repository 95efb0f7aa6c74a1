//! Token bucket limiter.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Limiter errors.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum LimiterError {
    /// The caller's context was cancelled while waiting.
    #[error("cancelled while waiting for a token")]
    Cancelled,

    /// The limiter has a zero rate and its burst is spent.
    #[error("rate is zero and the burst is exhausted")]
    ZeroRate,
}

/// Permitted throughput.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Rate {
    /// No limit.
    Infinite,

    /// Tokens added per second.
    PerSecond(f64),
}

impl Rate {
    /// Tokens per second, `f64::INFINITY` when unlimited.
    pub fn per_second(&self) -> f64 {
        match self {
            Self::Infinite => f64::INFINITY,
            Self::PerSecond(rate) => *rate,
        }
    }
}

/// Token bucket limiter.
///
/// The bucket starts full. Each [`Limiter::wait`] takes one token, reserving
/// it ahead of time when the bucket is empty, so concurrent waiters are
/// granted in arrival order at the configured rate.
#[derive(Debug)]
pub struct Limiter {
    rate: Rate,
    burst: u32,
    bucket: Mutex<Bucket>,
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last: Instant,
}

impl Limiter {
    /// Create a limiter. A burst of zero is raised to one.
    pub fn new(rate: Rate, burst: u32) -> Self {
        let burst = burst.max(1);
        Self {
            rate,
            burst,
            bucket: Mutex::new(Bucket {
                tokens: f64::from(burst),
                last: Instant::now(),
            }),
        }
    }

    /// Limiter that never waits.
    pub fn unlimited() -> Self {
        Self::new(Rate::Infinite, 1)
    }

    /// The configured rate.
    pub fn rate(&self) -> Rate {
        self.rate
    }

    /// The configured burst.
    pub fn burst(&self) -> u32 {
        self.burst
    }

    /// Wait until a token is available or `cancel` fires.
    pub async fn wait(&self, cancel: &CancellationToken) -> Result<(), LimiterError> {
        if cancel.is_cancelled() {
            return Err(LimiterError::Cancelled);
        }

        let delay = self.reserve()?;
        if delay.is_zero() {
            return Ok(());
        }

        tokio::select! {
            _ = tokio::time::sleep(delay) => Ok(()),
            _ = cancel.cancelled() => {
                self.release();
                Err(LimiterError::Cancelled)
            }
        }
    }

    /// Take a token, returning how long the caller must wait for it.
    fn reserve(&self) -> Result<Duration, LimiterError> {
        let Rate::PerSecond(rate) = self.rate else {
            return Ok(Duration::ZERO);
        };

        let mut bucket = self.bucket.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();

        if rate > 0.0 {
            let elapsed = now.saturating_duration_since(bucket.last).as_secs_f64();
            bucket.tokens = (bucket.tokens + elapsed * rate).min(f64::from(self.burst));
        } else if bucket.tokens < 1.0 {
            return Err(LimiterError::ZeroRate);
        }
        bucket.last = now;
        bucket.tokens -= 1.0;

        if bucket.tokens >= 0.0 {
            return Ok(Duration::ZERO);
        }

        Ok(Duration::try_from_secs_f64(-bucket.tokens / rate).unwrap_or(Duration::MAX))
    }

    /// Return a reserved token that will not be used.
    fn release(&self) {
        let mut bucket = self.bucket.lock().unwrap_or_else(PoisonError::into_inner);
        bucket.tokens = (bucket.tokens + 1.0).min(f64::from(self.burst));
    }
}
