//! Check loop: hands started checks to the execution engine at the permitted
//! rate.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use lookout_id::CheckId;
use lookout_model::DEFAULT_CHECK_TIMEOUT;
use lookout_pacing::{Limiter, RateCalculator, RateError, Task};
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::engine::ExecutionEngine;
use crate::store::{Check, CheckStore, StoreError};

/// Check loop errors.
#[derive(Debug, Error)]
pub enum CheckError {
    /// Claiming started checks failed.
    #[error("failed to claim started checks: {0}")]
    Store(#[from] StoreError),

    /// No limiter could be computed and none was cached.
    #[error("no rate limiter available: {0}")]
    Rate(#[from] RateError<StoreError>),
}

/// Checker configuration.
#[derive(Debug, Clone)]
pub struct CheckerConfig {
    /// How long a computed limiter is reused before it is recomputed.
    pub limiter_refresh_interval: Duration,

    /// How long a claimed check stays with this instance before another may
    /// claim it. Should exceed the check timeout.
    pub claim_lease: Duration,
}

impl Default for CheckerConfig {
    fn default() -> Self {
        Self {
            limiter_refresh_interval: Duration::from_secs(60),
            claim_lease: DEFAULT_CHECK_TIMEOUT + Duration::from_secs(60),
        }
    }
}

struct CachedLimiter {
    limiter: Arc<Limiter>,
    computed_at: Instant,
}

/// Periodic task that dispatches started checks.
///
/// Each pass claims the started checks no other instance holds, so a check is
/// dispatched by one instance only. Dispatch is launch-and-continue: each check
/// waits for the limiter and runs in its own task, and a check still running
/// is never dispatched again.
pub struct Checker {
    store: Arc<dyn CheckStore>,
    engine: Arc<dyn ExecutionEngine>,
    rate: RateCalculator<Arc<dyn CheckStore>>,
    config: CheckerConfig,
    limiter: Mutex<Option<CachedLimiter>>,
    in_flight: Arc<Mutex<HashSet<CheckId>>>,
}

impl Checker {
    /// Create a new checker.
    pub fn new(
        store: Arc<dyn CheckStore>,
        engine: Arc<dyn ExecutionEngine>,
        rate: RateCalculator<Arc<dyn CheckStore>>,
        config: CheckerConfig,
    ) -> Self {
        Self {
            store,
            engine,
            rate,
            config,
            limiter: Mutex::new(None),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Number of checks dispatched and not yet finished running.
    pub fn in_flight(&self) -> usize {
        lock(&self.in_flight).len()
    }

    /// The cached limiter, recomputed once it is older than the refresh
    /// interval. A failed recompute keeps the previous limiter.
    async fn current_limiter(&self) -> Result<Arc<Limiter>, CheckError> {
        let cached = {
            let guard = lock(&self.limiter);
            guard.as_ref().map(|c| (c.limiter.clone(), c.computed_at))
        };

        if let Some((limiter, computed_at)) = &cached {
            if computed_at.elapsed() < self.config.limiter_refresh_interval {
                return Ok(limiter.clone());
            }
        }

        match self.rate.rate_limiter().await {
            Ok(limiter) => {
                let limiter = Arc::new(limiter);
                debug!(rate = limiter.rate().per_second(), "Computed check rate");
                *lock(&self.limiter) = Some(CachedLimiter {
                    limiter: limiter.clone(),
                    computed_at: Instant::now(),
                });
                Ok(limiter)
            }
            Err(e) => match cached {
                Some((limiter, _)) => {
                    warn!(error = %e, "Failed to recompute check rate, keeping previous limiter");
                    Ok(limiter)
                }
                None => Err(e.into()),
            },
        }
    }

    /// Hand claimed checks back after a pass could not dispatch them.
    async fn release_claims(&self, checks: &[Check]) {
        for check in checks {
            if let Err(e) = self.store.release_claim(check.id).await {
                warn!(check = %check.id, error = %e, "Failed to release check claim");
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Removes a check from the in-flight set when dropped, even if running it
/// panicked.
struct InFlightGuard {
    in_flight: Arc<Mutex<HashSet<CheckId>>>,
    id: CheckId,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        lock(&self.in_flight).remove(&self.id);
    }
}

#[async_trait]
impl Task for Checker {
    type Error = CheckError;

    fn name(&self) -> &str {
        "checker"
    }

    #[instrument(skip_all)]
    async fn run(&self, ctx: &CancellationToken) -> Result<(), CheckError> {
        let checks = self.store.claim_started_checks(self.config.claim_lease).await?;
        if checks.is_empty() {
            return Ok(());
        }

        let limiter = match self.current_limiter().await {
            Ok(limiter) => limiter,
            Err(e) => {
                self.release_claims(&checks).await;
                return Err(e);
            }
        };
        let mut dispatched = 0usize;

        for check in checks {
            let id = check.id;
            if !lock(&self.in_flight).insert(id) {
                debug!(check = %id, "Check already in flight");
                continue;
            }
            let guard = InFlightGuard {
                in_flight: self.in_flight.clone(),
                id,
            };

            let runnable = self.engine.new_check(check);
            let limiter = limiter.clone();
            let store = self.store.clone();
            let ctx = ctx.clone();

            tokio::spawn(async move {
                let _guard = guard;
                match limiter.wait(&ctx).await {
                    Ok(()) => runnable.run().await,
                    Err(e) => {
                        warn!(check = %id, error = %e, "Check not dispatched");
                        if let Err(e) = store.release_claim(id).await {
                            warn!(check = %id, error = %e, "Failed to release check claim");
                        }
                    }
                }
            });
            dispatched += 1;
        }

        if dispatched > 0 {
            info!(dispatched, "Dispatched checks");
        }

        Ok(())
    }
}
