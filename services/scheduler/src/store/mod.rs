//! Check storage.
//!
//! The scanner and checker never talk to each other directly. The scanner
//! creates checks through a [`CheckStore`] and nudges the checker; the checker
//! claims started checks from the same store. A claim is held by one instance
//! until the check finishes, the claim is released, or its lease runs out.
//!
//! Two implementations:
//! - [`PgCheckStore`] backs multi-instance deployments with Postgres
//! - [`MemoryCheckStore`] keeps everything in process for single-node use and tests

mod checkable;
mod error;
mod memory;
mod postgres;

pub use checkable::{
    Checkable, CheckableRecord, CycleError, ResourceType, ResourceTypeSet, StoredCheckable,
};
pub use error::StoreError;
pub use memory::MemoryCheckStore;
pub use postgres::{PgCheckStore, CHECKER_CHANNEL};

pub(crate) use checkable::SetupErrorWriter;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use lookout_id::{CheckId, PipelineId};
use lookout_model::{CheckPlan, CheckState, CheckableRef, ResourceTypeConfig, Version};
use lookout_pacing::CheckableCounter;
use serde::{Deserialize, Serialize};

/// One scheduled probe of a checkable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Check {
    pub id: CheckId,
    pub checkable: CheckableRef,
    pub checkable_name: String,
    pub pipeline_id: PipelineId,
    pub plan: CheckPlan,
    pub manually_triggered: bool,
    /// False for checks kept only in the memory of the instance that created
    /// them.
    pub durable: bool,
    pub state: CheckState,
    pub create_time: DateTime<Utc>,
}

impl Check {
    /// A started check for `checkable`, created now.
    pub fn started(
        checkable: &dyn Checkable,
        resource_types: Vec<ResourceTypeConfig>,
        from_version: Option<Version>,
        timeout: Duration,
        manually_triggered: bool,
        durable: bool,
    ) -> Self {
        let plan = CheckPlan {
            checkable: checkable.id(),
            name: checkable.name().to_string(),
            type_name: checkable.type_name().to_string(),
            pipeline_id: checkable.pipeline_id(),
            source: checkable.source().clone(),
            from_version,
            resource_types,
            timeout,
        };

        Self {
            id: CheckId::new(),
            checkable: checkable.id(),
            checkable_name: checkable.name().to_string(),
            pipeline_id: checkable.pipeline_id(),
            plan,
            manually_triggered,
            durable,
            state: CheckState::Started,
            create_time: Utc::now(),
        }
    }
}

/// Whether a check claimed at `claimed_at` may be claimed at `now`.
pub(crate) fn claimable(claimed_at: Option<DateTime<Utc>>, now: DateTime<Utc>, lease: Duration) -> bool {
    let Some(at) = claimed_at else {
        return true;
    };
    TimeDelta::from_std(lease)
        .ok()
        .and_then(|lease| at.checked_add_signed(lease))
        .is_some_and(|expires| expires <= now)
}

/// How a check ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    Succeeded,
    Errored(String),
}

impl CheckOutcome {
    pub fn state(&self) -> CheckState {
        match self {
            Self::Succeeded => CheckState::Succeeded,
            Self::Errored(_) => CheckState::Errored,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            Self::Succeeded => None,
            Self::Errored(message) => Some(message),
        }
    }
}

/// A held cluster-wide lock.
#[async_trait]
pub trait Lock: Send {
    async fn release(self: Box<Self>) -> Result<(), StoreError>;
}

/// Persistence operations used by the scanner and checker.
#[async_trait]
pub trait CheckStore: Send + Sync {
    /// Try once to take the scanning lock. `None` when another scanner holds it.
    async fn acquire_scanning_lock(&self) -> Result<Option<Box<dyn Lock>>, StoreError>;

    /// All active resources of unpaused pipelines.
    async fn resources(&self) -> Result<Vec<Arc<dyn Checkable>>, StoreError>;

    /// All active resource types of unpaused pipelines.
    async fn resource_types(&self) -> Result<ResourceTypeSet, StoreError>;

    /// Create a started check for `checkable` unless one is already pending.
    ///
    /// Returns the pending check and whether it was created by this call.
    /// Checks with `persist = false` live only in this process.
    async fn try_create_check(
        &self,
        checkable: &dyn Checkable,
        resource_types: Vec<ResourceTypeConfig>,
        from_version: Option<Version>,
        timeout: Duration,
        manually_triggered: bool,
        persist: bool,
    ) -> Result<(Check, bool), StoreError>;

    /// Wake the check loop.
    async fn notify_checker(&self) -> Result<(), StoreError>;

    /// All started checks, claimed or not, oldest first.
    async fn started_checks(&self) -> Result<Vec<Check>, StoreError>;

    /// Claim the started checks nobody holds, oldest first.
    ///
    /// A check is claimable when it was never claimed or its claim is older
    /// than `lease`. Concurrent callers never receive the same check.
    async fn claim_started_checks(&self, lease: Duration) -> Result<Vec<Check>, StoreError>;

    /// Give up the claim on a check that will not be run, so it can be
    /// claimed again.
    async fn release_claim(&self, id: CheckId) -> Result<(), StoreError>;

    /// Finish a check and stamp its checkable's last check end time.
    async fn finish_check(&self, id: CheckId, outcome: CheckOutcome) -> Result<(), StoreError>;

    /// Number of active checkables, used to derive the check rate.
    async fn checkable_count(&self) -> Result<u64, StoreError>;
}

#[async_trait]
impl<'a> CheckableCounter for dyn CheckStore + 'a {
    type Error = StoreError;

    async fn checkable_count(&self) -> Result<u64, StoreError> {
        CheckStore::checkable_count(self).await
    }
}
