//! Scan loop: decides which checkables are due and creates their checks.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeDelta, Utc};
use futures_util::future::{BoxFuture, FutureExt};
use lookout_model::{CheckInterval, CheckableRef, ModelError, DEFAULT_CHECK_TIMEOUT};
use lookout_pacing::{Task, DEFAULT_RESOURCE_CHECKING_INTERVAL};
use thiserror::Error;
use tokio::sync::OnceCell;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::store::{CheckStore, Checkable, CycleError, ResourceType, ResourceTypeSet, StoreError};

/// Why a checkable could not be scheduled.
#[derive(Debug, Error)]
pub enum ScanError {
    /// A store operation failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The configured `check_every` cannot be interpreted.
    #[error(transparent)]
    InvalidCheckEvery(ModelError),

    /// Scheduling the parent resource type failed.
    #[error("parent type '{parent}' error: {message}")]
    ParentType { parent: String, message: String },

    /// The parent chain loops.
    #[error(transparent)]
    Cycle(#[from] CycleError),

    /// Scheduling panicked.
    #[error("panic in scanner: {0}")]
    Panicked(String),
}

/// Scanner configuration.
#[derive(Debug, Clone)]
pub struct ScannerConfig {
    /// Interval for checkables without `check_every`.
    pub default_check_interval: Duration,

    /// Interval for webhook-enabled checkables without `check_every`.
    pub default_webhook_check_interval: Duration,

    /// Time limit written into every check plan.
    pub check_timeout: Duration,

    /// Whether scheduled checks are stored durably.
    pub persist_checks: bool,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            default_check_interval: DEFAULT_RESOURCE_CHECKING_INTERVAL,
            default_webhook_check_interval: DEFAULT_RESOURCE_CHECKING_INTERVAL,
            check_timeout: DEFAULT_CHECK_TIMEOUT,
            persist_checks: true,
        }
    }
}

/// What happened to one checkable during a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scheduled {
    Created,
    AlreadyExists,
    NotDue,
    Never,
}

/// Periodic task that creates checks for due checkables.
///
/// Only one scanner in the cluster runs a pass at a time; the others see the
/// scanning lock held and skip.
pub struct Scanner {
    store: Arc<dyn CheckStore>,
    config: ScannerConfig,
}

impl Scanner {
    /// Create a new scanner.
    pub fn new(store: Arc<dyn CheckStore>, config: ScannerConfig) -> Self {
        Self { store, config }
    }

    /// Schedule every resource once. Store reads failing aborts the pass;
    /// per-resource failures are recorded on the resource and counted.
    ///
    /// Once `ctx` is cancelled no further resources are started; those already
    /// started run to completion.
    async fn scan(&self, ctx: &CancellationToken) -> Result<PassSummary, StoreError> {
        let resources = self.store.resources().await?;
        let types = self.store.resource_types().await?;

        let pass = Arc::new(ScanPass {
            store: self.store.clone(),
            config: self.config.clone(),
            types,
            parents: ParentMemo::default(),
        });

        let mut summary = PassSummary {
            resources: resources.len(),
            ..Default::default()
        };

        let mut tasks = JoinSet::new();
        for resource in resources {
            if ctx.is_cancelled() {
                summary.interrupted = true;
                break;
            }
            let pass = pass.clone();
            tasks.spawn(async move { pass.schedule_and_record(resource.as_ref()).await });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(Scheduled::Created)) => summary.created += 1,
                Ok(Ok(_)) => {}
                Ok(Err(_)) => summary.errors += 1,
                Err(e) => {
                    // Panics are caught inside the task; this is an abort or a
                    // panic while recording.
                    error!(error = %e, "Resource scan task failed");
                    summary.errors += 1;
                }
            }
        }

        Ok(summary)
    }
}

#[derive(Debug, Default)]
struct PassSummary {
    resources: usize,
    created: usize,
    errors: usize,
    interrupted: bool,
}

#[async_trait]
impl Task for Scanner {
    type Error = ScanError;

    fn name(&self) -> &str {
        "scanner"
    }

    #[instrument(skip_all)]
    async fn run(&self, ctx: &CancellationToken) -> Result<(), ScanError> {
        let Some(lock) = self.store.acquire_scanning_lock().await? else {
            debug!("Scan already in progress");
            return Ok(());
        };

        let result = self.scan(ctx).await;

        if let Err(e) = lock.release().await {
            warn!(error = %e, "Failed to release scanning lock");
        }

        let summary = result?;
        if summary.interrupted {
            info!(
                resources = summary.resources,
                checks_created = summary.created,
                "Scan interrupted by shutdown"
            );
        } else {
            info!(
                resources = summary.resources,
                checks_created = summary.created,
                errors = summary.errors,
                "Scan complete"
            );
        }

        if let Err(e) = self.store.notify_checker().await {
            warn!(error = %e, "Failed to notify checker");
        }

        Ok(())
    }
}

// =============================================================================
// Scan pass
// =============================================================================

/// Outcome of scheduling a parent type, shared by all of its children.
type ParentOutcome = Result<(), String>;

/// One [`OnceCell`] per parent type, so a type shared by many resources is
/// scheduled once per pass.
#[derive(Default)]
struct ParentMemo {
    cells: Mutex<HashMap<CheckableRef, Arc<OnceCell<ParentOutcome>>>>,
}

impl ParentMemo {
    fn cell(&self, parent: CheckableRef) -> Arc<OnceCell<ParentOutcome>> {
        self.cells
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(parent)
            .or_default()
            .clone()
    }
}

struct ScanPass {
    store: Arc<dyn CheckStore>,
    config: ScannerConfig,
    types: ResourceTypeSet,
    parents: ParentMemo,
}

impl ScanPass {
    /// Schedule `checkable` and record the outcome as its setup error.
    fn schedule_and_record<'a>(
        &'a self,
        checkable: &'a dyn Checkable,
    ) -> BoxFuture<'a, Result<Scheduled, ScanError>> {
        async move {
            let result = AssertUnwindSafe(self.schedule(checkable))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| Err(ScanError::Panicked(panic_message(&*panic))));

            if let Err(e) = &result {
                debug!(checkable = checkable.name(), error = %e, "Failed to schedule check");
            }

            let setup_error = result.as_ref().err().map(ToString::to_string);
            if let Err(e) = checkable.set_check_setup_error(setup_error).await {
                warn!(checkable = checkable.name(), error = %e, "Failed to record check setup error");
            }

            result
        }
        .boxed()
    }

    async fn schedule(&self, checkable: &dyn Checkable) -> Result<Scheduled, ScanError> {
        // Reject cycles before awaiting any parent, so no task waits on itself.
        self.types.ancestry(checkable)?;

        if let Some(parent) = self.types.parent(checkable) {
            self.schedule_parent(parent)
                .await
                .map_err(|message| ScanError::ParentType {
                    parent: parent.checkable.name().to_string(),
                    message,
                })?;
        }

        let interval = match checkable
            .check_every()
            .interval()
            .map_err(ScanError::InvalidCheckEvery)?
        {
            CheckInterval::Never => return Ok(Scheduled::Never),
            CheckInterval::Every(interval) => interval,
            CheckInterval::Default if checkable.has_webhook() => {
                self.config.default_webhook_check_interval
            }
            CheckInterval::Default => self.config.default_check_interval,
        };

        let due_at = TimeDelta::from_std(interval)
            .ok()
            .and_then(|interval| checkable.last_check_end_time().checked_add_signed(interval));
        match due_at {
            Some(due_at) if Utc::now() >= due_at => {}
            _ => return Ok(Scheduled::NotDue),
        }

        let (check, created) = self
            .store
            .try_create_check(
                checkable,
                self.types.filter(checkable)?,
                checkable.current_pinned_version(),
                self.config.check_timeout,
                false,
                self.config.persist_checks,
            )
            .await?;

        if !created {
            debug!(checkable = checkable.name(), check = %check.id, "Check already exists");
            return Ok(Scheduled::AlreadyExists);
        }

        debug!(
            checkable = checkable.name(),
            pipeline = checkable.pipeline_name(),
            check = %check.id,
            "Created check"
        );
        Ok(Scheduled::Created)
    }

    async fn schedule_parent(&self, parent: &ResourceType) -> ParentOutcome {
        let cell = self.parents.cell(parent.checkable.id());
        cell.get_or_init(|| async {
            self.schedule_and_record(parent.checkable.as_ref())
                .await
                .map(|_| ())
                .map_err(|e| e.to_string())
        })
        .await
        .clone()
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
